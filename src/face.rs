use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

use crate::controller::StepController;
use crate::error::SessionError;
use crate::types::QuizRequest;

pub fn router(controller: Arc<StepController>) -> Router {
    Router::new()
        .route("/api/quiz", post(quiz_handler))
        .with_state(controller)
}

async fn quiz_handler(State(controller): State<Arc<StepController>>, body: Bytes) -> Response {
    let request = match parse_request(&body) {
        Ok(r) => r,
        Err(rejection) => return rejection,
    };

    info!(email = %request.email, url = %request.url, "quiz session requested");

    match controller.run(&request).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => e.into_response(),
    }
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Bodies are parsed by hand so that malformed JSON and missing fields get
/// the service's own 400 bodies instead of axum's rejections.
fn parse_request(body: &[u8]) -> Result<QuizRequest, Response> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|_| error_body(StatusCode::BAD_REQUEST, "Invalid JSON"))?;

    let field = |name: &str| {
        value
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from)
    };

    match (field("email"), field("secret"), field("url")) {
        (Some(email), Some(secret), Some(url)) => Ok(QuizRequest { email, secret, url }),
        _ => Err(error_body(
            StatusCode::BAD_REQUEST,
            "Missing required fields: email, secret, url",
        )),
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            SessionError::Misconfigured(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": self.to_string() }),
            ),
            SessionError::InvalidSecret => {
                (StatusCode::FORBIDDEN, json!({ "error": "Invalid secret" }))
            }
            SessionError::AnswerService(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Answer service failed", "detail": e.to_string() }),
            ),
            SessionError::NoSubmitEndpoint { page_text } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Could not determine submit endpoint", "pageText": page_text }),
            ),
            SessionError::Submission { detail } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Submission failed", "detail": detail }),
            ),
            SessionError::Unexpected(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Unexpected error", "detail": format!("{e:#}") }),
            ),
        };
        (status, Json(body)).into_response()
    }
}
