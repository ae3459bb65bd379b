use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::types::AnswerReply;

const SYSTEM_PROMPT: &str =
    "You are a precise data analysis assistant. Respond with valid JSON ONLY (no commentary, no markdown).";

#[derive(Debug, Error)]
pub enum AnswerError {
    #[error("MODEL_API_TOKEN missing in environment")]
    MissingCredential,

    #[error("model request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("model request failed ({status}): {detail}")]
    Upstream { status: u16, detail: Value },
}

/// Computes an answer for a page. The controller only sees this trait.
#[async_trait]
pub trait AnswerService: Send + Sync {
    /// Fails if the service cannot be used at all, before anything is sent.
    fn ensure_ready(&self) -> Result<(), AnswerError> {
        Ok(())
    }

    async fn ask(&self, page_content: &str, instruction: &str) -> Result<AnswerReply, AnswerError>;
}

/// Chat-completion client for an OpenAI-compatible endpoint.
pub struct AnswerClient {
    client: Client,
    endpoint: String,
    model: String,
    max_tokens: u32,
    token: Option<String>,
    timeout: std::time::Duration,
}

impl AnswerClient {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            endpoint: config.model_endpoint.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            token: config.model_token.clone(),
            timeout: config.timeouts.model,
        }
    }

    fn request_body(&self, page_content: &str, instruction: &str) -> Value {
        let user = format!(
            "PAGE_TEXT:\n{page_content}\n\nINSTRUCTION:\n{instruction}\n\n\
             Return valid JSON only. Example:\n\
             {{\"answer\": 123, \"explanation\": \"one-line\", \"visualization_base64\": \"data:image/png;base64,...\"}}"
        );

        json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user},
            ],
            "max_tokens": self.max_tokens,
            "temperature": 0,
        })
    }
}

#[async_trait]
impl AnswerService for AnswerClient {
    fn ensure_ready(&self) -> Result<(), AnswerError> {
        match self.token {
            Some(_) => Ok(()),
            None => Err(AnswerError::MissingCredential),
        }
    }

    async fn ask(&self, page_content: &str, instruction: &str) -> Result<AnswerReply, AnswerError> {
        let token = self.token.as_deref().ok_or(AnswerError::MissingCredential)?;

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(token)
            .timeout(self.timeout)
            .json(&self.request_body(page_content, instruction))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let detail = serde_json::from_str(&body).unwrap_or(Value::String(body));
            return Err(AnswerError::Upstream {
                status: status.as_u16(),
                detail,
            });
        }

        let raw_text = match serde_json::from_str::<Value>(&body) {
            Ok(json_resp) => assistant_text(&json_resp),
            Err(_) => body,
        }
        .trim()
        .to_string();

        debug!(chars = raw_text.len(), "model replied");

        let parsed_json = extract_json(&raw_text);
        Ok(AnswerReply {
            raw_text,
            parsed_json,
        })
    }
}

/// Pull the assistant message out of a completion response, falling back to
/// `output` and finally to the whole body.
fn assistant_text(resp: &Value) -> String {
    let content = &resp["choices"][0]["message"]["content"];
    let chosen = if content.is_null() { &resp["output"] } else { content };
    match chosen {
        Value::String(text) => text.clone(),
        Value::Null => resp.to_string(),
        other => other.to_string(),
    }
}

/// Best-effort JSON recovery from free-form model text: the whole text, or
/// failing that the outermost `{...}` span.
pub fn extract_json(text: &str) -> Option<Value> {
    let text = text.trim();
    if let Ok(v) = serde_json::from_str(text) {
        return Some(v);
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

    #[test]
    fn extract_direct_json() {
        assert_eq!(extract_json(r#" {"answer": 5} "#), Some(json!({"answer": 5})));
        assert_eq!(extract_json("17"), Some(json!(17)));
    }

    #[test]
    fn extract_from_fenced_text() {
        let text = "```json\n{\"answer\": \"blue\", \"explanation\": \"x\"}\n```";
        assert_eq!(
            extract_json(text),
            Some(json!({"answer": "blue", "explanation": "x"}))
        );
    }

    #[test]
    fn extract_gives_up_on_garbage() {
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("} backwards {"), None);
        assert_eq!(extract_json("{not: valid}"), None);
    }

    #[test]
    fn assistant_text_fallbacks() {
        let chat = json!({"choices": [{"message": {"content": "hi"}}]});
        assert_eq!(assistant_text(&chat), "hi");

        let output = json!({"output": "out"});
        assert_eq!(assistant_text(&output), "out");

        let other = json!({"weird": 1});
        assert_eq!(assistant_text(&other), r#"{"weird":1}"#);
    }

    fn client_for(server: &MockServer, token: Option<&str>) -> AnswerClient {
        let config = Config {
            model_endpoint: format!("{}/v1/chat/completions", server.uri()),
            model_token: token.map(String::from),
            ..Config::default()
        };
        AnswerClient::new(&config)
    }

    #[tokio::test]
    async fn sends_deterministic_request_and_parses_reply() {
        let server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/v1/chat/completions"))
            .and(matchers::header("authorization", "Bearer tok"))
            .and(matchers::body_partial_json(json!({
                "model": "openai/gpt-4.1-nano",
                "temperature": 0,
                "max_tokens": 3000,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "  {\"answer\": 99}  "}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let reply = client_for(&server, Some("tok"))
            .ask("page", "do it")
            .await
            .unwrap();
        assert_eq!(reply.raw_text, r#"{"answer": 99}"#);
        assert_eq!(reply.parsed_json, Some(json!({"answer": 99})));
    }

    #[tokio::test]
    async fn keeps_raw_text_when_reply_is_prose() {
        let server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "The answer is twelve."}}]
            })))
            .mount(&server)
            .await;

        let reply = client_for(&server, Some("tok")).ask("p", "i").await.unwrap();
        assert_eq!(reply.raw_text, "The answer is twelve.");
        assert!(reply.parsed_json.is_none());
    }

    #[tokio::test]
    async fn upstream_error_carries_detail() {
        let server = MockServer::start().await;

        let limited = json!({"error": {"message": "slow down"}});
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(limited))
            .expect(1)
            .mount(&server)
            .await;

        let err = client_for(&server, Some("tok")).ask("p", "i").await.unwrap_err();
        match err {
            AnswerError::Upstream { status, detail } => {
                assert_eq!(status, 429);
                assert_eq!(detail["error"]["message"], "slow down");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_token_fails_before_sending() {
        let server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        assert!(matches!(client.ensure_ready(), Err(AnswerError::MissingCredential)));
        assert!(matches!(
            client.ask("p", "i").await,
            Err(AnswerError::MissingCredential)
        ));
    }
}
