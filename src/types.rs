use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hard cap on the number of steps a single session may run.
pub const MAX_STEPS: usize = 10;
/// Characters of serialized data summary forwarded to the model.
pub const DATA_SUMMARY_MAX_CHARS: usize = 2000;
/// Characters of page text echoed back when no submit endpoint resolves.
pub const PAGE_TEXT_EXCERPT_CHARS: usize = 1000;

/// Inbound request body for `POST /api/quiz`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizRequest {
    pub email: String,
    pub secret: String,
    pub url: String,
}

/// A hyperlink found on the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
    #[serde(default)]
    pub text: String,
}

/// What the controller reads off a page after navigating to it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub text: String,
    pub html: String,
    pub links: Vec<Link>,
    pub form_action: Option<String>,
}

/// Summary of the first data file linked from a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataSummary {
    Loaded {
        url: String,
        #[serde(rename = "type")]
        kind: String,
        size: usize,
        parsed: Option<ParsedPayload>,
    },
    Failed {
        error: String,
        detail: String,
    },
}

impl DataSummary {
    pub fn failed(detail: impl Into<String>) -> Self {
        DataSummary::Failed {
            error: "Failed to fetch/parse data link".to_string(),
            detail: detail.into(),
        }
    }
}

/// Structured content of a downloaded data file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParsedPayload {
    /// Row records from a CSV file or the first sheet of a workbook.
    Table {
        data: Vec<serde_json::Map<String, Value>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        truncated: Option<bool>,
        #[serde(rename = "totalRows", skip_serializing_if = "Option::is_none")]
        total_rows: Option<usize>,
    },
    Document {
        data: Value,
    },
    Text {
        text: String,
    },
}

/// Raw model output plus whatever JSON could be recovered from it.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerReply {
    pub raw_text: String,
    pub parsed_json: Option<Value>,
}

impl AnswerReply {
    /// The value to submit: `answer` if the model supplied one, else the whole
    /// parsed object, else the raw text wrapped as `{"raw": ...}`.
    pub fn answer_value(&self) -> Value {
        match &self.parsed_json {
            Some(parsed) if !parsed.is_null() => match parsed.get("answer") {
                Some(answer) if !answer.is_null() => answer.clone(),
                _ => parsed.clone(),
            },
            _ => serde_json::json!({ "raw": self.raw_text }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitPayload {
    pub email: String,
    pub secret: String,
    pub url: String,
    pub answer: Value,
}

/// One completed step, as reported back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub url: String,
    pub answer: Value,
    #[serde(rename = "submitResponse")]
    pub submit_response: Value,
}

/// Everything one step produced. Only `record` leaves the service.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub record: ResultRecord,
    pub data_summary: Option<DataSummary>,
    pub payload: SubmitPayload,
    pub submit_endpoint: String,
    pub next_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub correct: bool,
    pub results: Vec<ResultRecord>,
}
