use serde_json::Value;
use thiserror::Error;

/// Ways a session can end without producing results.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Server misconfigured: {0}")]
    Misconfigured(String),

    #[error("Invalid secret")]
    InvalidSecret,

    #[error("Answer service failed: {0}")]
    AnswerService(#[from] crate::brain::AnswerError),

    #[error("Could not determine submit endpoint")]
    NoSubmitEndpoint { page_text: String },

    #[error("Submission failed: {detail}")]
    Submission { detail: Value },

    #[error("Unexpected error: {0:#}")]
    Unexpected(#[from] anyhow::Error),
}
