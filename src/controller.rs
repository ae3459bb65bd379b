//! The step loop: read a page, ask for an answer, submit it, follow the reply.

use std::sync::{Arc, LazyLock};

use anyhow::{Context, anyhow};
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::brain::AnswerService;
use crate::config::Config;
use crate::data;
use crate::error::SessionError;
use crate::hands::{BrowserBackend, PageSession};
use crate::types::{
    DATA_SUMMARY_MAX_CHARS, DataSummary, MAX_STEPS, PAGE_TEXT_EXCERPT_CHARS, QuizRequest,
    ResultRecord, SessionOutcome, StepReport, SubmitPayload,
};

static SUBMIT_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)https?://[^\s'"]+/submit[^\s'"]*"#).expect("static regex"));

/// First absolute URL in `text` whose path contains `/submit`.
pub fn find_submit_url(text: &str) -> Option<String> {
    SUBMIT_URL.find(text).map(|m| m.as_str().to_string())
}

/// Where to POST the answer. The page's form action beats a URL mentioned in
/// the text, which beats `/submit` on the current origin.
pub fn resolve_submit_endpoint(
    current_url: &str,
    form_action: Option<&str>,
    text_match: Option<&str>,
) -> Option<String> {
    let base = Url::parse(current_url).ok();

    if let (Some(base), Some(action)) = (&base, form_action) {
        if let Ok(resolved) = base.join(action) {
            return Some(resolved.to_string());
        }
    }
    if let Some(found) = text_match {
        return Some(found.to_string());
    }
    base.and_then(|b| b.join("/submit").ok()).map(|u| u.to_string())
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

pub fn build_instruction(summary: Option<&DataSummary>) -> String {
    let mut parts = vec![
        "You are given the scraped page text and any attached data summary.".to_string(),
        "Task: Extract the data-related task from the page, perform required analysis/transformations, \
         and produce output JSON with field \"answer\"."
            .to_string(),
        "If a visualization is requested, return \"visualization_base64\" (data URI PNG)."
            .to_string(),
        "Return JSON only.".to_string(),
    ];

    if let Some(summary) = summary {
        let rendered = serde_json::to_string(summary).unwrap_or_default();
        parts.push(format!(
            "Data summary (truncated): {}",
            truncate_chars(&rendered, DATA_SUMMARY_MAX_CHARS)
        ));
    }

    parts.join("\n")
}

/// The next target named by a submission reply, if any.
fn next_url(response: &Value) -> Option<String> {
    response
        .get("url")
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())
        .map(String::from)
}

/// Owns the page for one session. If the session future is dropped before
/// `release` runs, the page is closed on a spawned task instead.
struct OpenPage {
    page: Option<Box<dyn PageSession>>,
}

impl OpenPage {
    fn new(page: Box<dyn PageSession>) -> Self {
        Self { page: Some(page) }
    }

    fn session(&mut self) -> Option<&mut (dyn PageSession + 'static)> {
        self.page.as_deref_mut()
    }

    async fn release(mut self) {
        if let Some(page) = self.page.take() {
            close_page(page).await;
        }
    }
}

impl Drop for OpenPage {
    fn drop(&mut self) {
        let Some(page) = self.page.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("session cancelled, closing browser in the background");
                runtime.spawn(close_page(page));
            }
            // A launched Chrome still dies with its `Browser`.
            Err(_) => warn!("no runtime left to close the browser page"),
        }
    }
}

async fn close_page(page: Box<dyn PageSession>) {
    if let Err(e) = page.close().await {
        warn!(error = %e, "closing browser failed");
    }
}

pub struct StepController {
    config: Arc<Config>,
    browser: Arc<dyn BrowserBackend>,
    answers: Arc<dyn AnswerService>,
    http: Client,
}

impl StepController {
    pub fn new(
        config: Arc<Config>,
        browser: Arc<dyn BrowserBackend>,
        answers: Arc<dyn AnswerService>,
    ) -> Self {
        Self {
            config,
            browser,
            answers,
            http: Client::new(),
        }
    }

    pub fn authenticate(&self, secret: &str) -> Result<(), SessionError> {
        let expected = self
            .config
            .secret
            .as_deref()
            .ok_or_else(|| SessionError::Misconfigured("QUIZ_SECRET not set".to_string()))?;

        if secret != expected {
            return Err(SessionError::InvalidSecret);
        }
        Ok(())
    }

    /// Run a whole session. The browser page is closed on every path that
    /// opened it.
    pub async fn run(&self, request: &QuizRequest) -> Result<SessionOutcome, SessionError> {
        self.authenticate(&request.secret)?;
        self.answers
            .ensure_ready()
            .map_err(|e| SessionError::Misconfigured(e.to_string()))?;

        let opened = self
            .browser
            .open()
            .await
            .with_context(|| format!("opening {} browser", self.browser.name()))?;
        let mut page = OpenPage::new(opened);

        let outcome = match page.session() {
            Some(session) => self.drive(session, request).await,
            None => Err(anyhow!("browser page released before the session ran").into()),
        };

        page.release().await;

        match &outcome {
            Ok(done) => {
                info!(email = %request.email, steps = done.results.len(), "session completed")
            }
            Err(e) => warn!(email = %request.email, error = %e, "session aborted"),
        }
        outcome
    }

    async fn drive(
        &self,
        page: &mut dyn PageSession,
        request: &QuizRequest,
    ) -> Result<SessionOutcome, SessionError> {
        let mut results = Vec::new();
        let mut current = Some(request.url.clone());
        let mut step = 0;

        while let Some(url) = current.take() {
            if step >= MAX_STEPS {
                info!(limit = MAX_STEPS, "step limit reached");
                break;
            }
            let report = self.run_step(page, request, &url, step).await?;
            current = report.next_url;
            results.push(report.record);
            step += 1;
        }

        Ok(SessionOutcome {
            correct: true,
            results,
        })
    }

    /// One navigate → extract → ask → submit iteration.
    pub async fn run_step(
        &self,
        page: &mut dyn PageSession,
        request: &QuizRequest,
        current_url: &str,
        step: usize,
    ) -> Result<StepReport, SessionError> {
        let timeouts = &self.config.timeouts;
        info!(step, url = current_url, "step started");

        if let Err(e) = page.goto(current_url, timeouts.navigation).await {
            warn!(error = %e, "navigation failed, waiting for the page to settle");
            if let Err(e) = page.wait_for_idle(timeouts.navigation_fallback).await {
                debug!(error = %e, "page never settled, reading it anyway");
            }
        }

        let snapshot = page.snapshot().await.context("reading page")?;
        let text_submit = find_submit_url(&snapshot.text);

        let data_summary = match data::first_data_link(&snapshot.links) {
            Some(link) => Some(self.summarise(&link.href).await),
            None => None,
        };

        let instruction = build_instruction(data_summary.as_ref());
        let page_content = format!("{}\n\n{}", snapshot.text, snapshot.html);
        let reply = self.answers.ask(&page_content, &instruction).await?;
        let answer = reply.answer_value();

        let endpoint = resolve_submit_endpoint(
            current_url,
            snapshot.form_action.as_deref(),
            text_submit.as_deref(),
        )
        .ok_or_else(|| SessionError::NoSubmitEndpoint {
            page_text: truncate_chars(&snapshot.text, PAGE_TEXT_EXCERPT_CHARS),
        })?;
        debug!(endpoint = %endpoint, "submit endpoint resolved");

        let payload = SubmitPayload {
            email: request.email.clone(),
            secret: request.secret.clone(),
            url: current_url.to_string(),
            answer: answer.clone(),
        };
        let submit_response = self.submit(&endpoint, &payload).await?;
        let next = next_url(&submit_response);

        Ok(StepReport {
            record: ResultRecord {
                url: current_url.to_string(),
                answer,
                submit_response,
            },
            data_summary,
            payload,
            submit_endpoint: endpoint,
            next_url: next,
        })
    }

    /// Fetch and parse a data link. Never fails the step.
    async fn summarise(&self, href: &str) -> DataSummary {
        let fetched = data::fetch_and_parse(
            &self.http,
            href,
            self.config.timeouts.data_fetch,
            self.config.csv_row_limit,
        )
        .await;

        match fetched {
            Ok(summary) => summary,
            Err(e) => {
                warn!(url = href, error = %e, "data link unusable");
                DataSummary::failed(format!("{e:#}"))
            }
        }
    }

    async fn submit(&self, endpoint: &str, payload: &SubmitPayload) -> Result<Value, SessionError> {
        let transport = |e: reqwest::Error| SessionError::Submission {
            detail: Value::String(e.to_string()),
        };

        let response = self
            .http
            .post(endpoint)
            .timeout(self.config.timeouts.submission)
            .json(payload)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        let body = response.text().await.map_err(transport)?;
        let parsed = serde_json::from_str(&body).unwrap_or(Value::String(body));

        info!(endpoint, status = status.as_u16(), "answer submitted");
        if !status.is_success() {
            return Err(SessionError::Submission { detail: parsed });
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParsedPayload;
    use serde_json::json;

    #[test]
    fn finds_submit_url_in_text() {
        assert_eq!(
            find_submit_url("submit to http://x/submit"),
            Some("http://x/submit".to_string())
        );
        assert_eq!(
            find_submit_url("POST your answer to 'https://quiz.example.com/api/SUBMIT?id=3' now"),
            Some("https://quiz.example.com/api/SUBMIT?id=3".to_string())
        );
        assert_eq!(find_submit_url("no endpoint here, see /submit"), None);
    }

    #[test]
    fn form_action_wins_over_text_match() {
        let endpoint = resolve_submit_endpoint(
            "https://quiz.example.com/q/1",
            Some("answer"),
            Some("https://other.example.com/submit"),
        );
        assert_eq!(endpoint.as_deref(), Some("https://quiz.example.com/q/answer"));
    }

    #[test]
    fn text_match_beats_convention() {
        let endpoint =
            resolve_submit_endpoint("https://quiz.example.com/q/1", None, Some("http://x/submit"));
        assert_eq!(endpoint.as_deref(), Some("http://x/submit"));
    }

    #[test]
    fn falls_back_to_origin_submit() {
        let endpoint = resolve_submit_endpoint("https://quiz.example.com/q/1?s=2", None, None);
        assert_eq!(endpoint.as_deref(), Some("https://quiz.example.com/submit"));
    }

    #[test]
    fn unresolvable_without_a_base() {
        assert_eq!(resolve_submit_endpoint("not a url", Some("/go"), None), None);
        assert_eq!(
            resolve_submit_endpoint("not a url", Some("/go"), Some("http://x/submit")).as_deref(),
            Some("http://x/submit")
        );
    }

    #[test]
    fn instruction_without_data() {
        let text = build_instruction(None);
        assert!(text.contains("\"answer\""));
        assert!(text.contains("visualization_base64"));
        assert!(!text.contains("Data summary"));
    }

    #[test]
    fn instruction_truncates_data_summary() {
        let summary = DataSummary::Loaded {
            url: "http://x/big.pdf".into(),
            kind: "pdf".into(),
            size: 10,
            parsed: Some(ParsedPayload::Text {
                text: "é".repeat(5000),
            }),
        };
        let text = build_instruction(Some(&summary));
        let line = text.lines().last().unwrap();
        let rendered = line.strip_prefix("Data summary (truncated): ").unwrap();
        assert_eq!(rendered.chars().count(), DATA_SUMMARY_MAX_CHARS);
    }

    #[test]
    fn next_url_requires_non_empty_string() {
        assert_eq!(next_url(&json!({"url": "http://x/2"})).as_deref(), Some("http://x/2"));
        assert_eq!(next_url(&json!({"url": ""})), None);
        assert_eq!(next_url(&json!({"url": null})), None);
        assert_eq!(next_url(&json!({"url": 5})), None);
        assert_eq!(next_url(&json!("ok")), None);
    }
}
