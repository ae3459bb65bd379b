use std::time::Duration;

pub const DEFAULT_MODEL_ENDPOINT: &str = "https://aipipe.org/openrouter/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "openai/gpt-4.1-nano";
pub const DEFAULT_MAX_TOKENS: u32 = 3000;
pub const DEFAULT_CSV_ROW_LIMIT: usize = 10_000;

/// Per-call timeouts. There are no retries, so these are the only bound on a
/// stuck collaborator.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub navigation: Duration,
    pub navigation_fallback: Duration,
    pub data_fetch: Duration,
    pub model: Duration,
    pub submission: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            navigation: Duration::from_secs(45),
            navigation_fallback: Duration::from_secs(60),
            data_fetch: Duration::from_secs(45),
            model: Duration::from_secs(60),
            submission: Duration::from_secs(30),
        }
    }
}

/// Everything the service reads from its environment, resolved once at
/// startup and handed to the controller.
#[derive(Debug, Clone)]
pub struct Config {
    /// Shared secret callers must present.
    pub secret: Option<String>,
    /// Bearer token for the chat-completion endpoint.
    pub model_token: Option<String>,
    pub model_endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    /// Selects the hardened browser launch used in deployed environments.
    pub production: bool,
    /// DevTools websocket of an already running Chrome to attach to.
    pub chrome_ws_url: Option<String>,
    pub csv_row_limit: usize,
    pub timeouts: Timeouts,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            secret: None,
            model_token: None,
            model_endpoint: DEFAULT_MODEL_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            production: false,
            chrome_ws_url: None,
            csv_row_limit: DEFAULT_CSV_ROW_LIMIT,
            timeouts: Timeouts::default(),
        }
    }
}

impl Config {
    /// Build from process environment. Call `dotenvy::dotenv()` first if a
    /// `.env` file should be honoured.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let production = non_empty("QUIZ_ENV")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        Self {
            secret: non_empty("QUIZ_SECRET"),
            model_token: non_empty("MODEL_API_TOKEN"),
            model_endpoint: non_empty("MODEL_ENDPOINT").unwrap_or(defaults.model_endpoint),
            model: non_empty("MODEL_NAME").unwrap_or(defaults.model),
            max_tokens: non_empty("MODEL_MAX_TOKENS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_tokens),
            production,
            chrome_ws_url: non_empty("CHROME_WS_URL"),
            csv_row_limit: non_empty("CSV_ROW_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.csv_row_limit),
            timeouts: defaults.timeouts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = Config::from_lookup(lookup(&[]));
        assert!(config.secret.is_none());
        assert!(config.model_token.is_none());
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.csv_row_limit, 10_000);
        assert!(!config.production);
        assert_eq!(config.timeouts.submission, Duration::from_secs(30));
    }

    #[test]
    fn reads_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("QUIZ_SECRET", "S"),
            ("MODEL_API_TOKEN", "tok"),
            ("QUIZ_ENV", "Production"),
            ("CSV_ROW_LIMIT", "50"),
            ("MODEL_MAX_TOKENS", "not-a-number"),
        ]));
        assert_eq!(config.secret.as_deref(), Some("S"));
        assert_eq!(config.model_token.as_deref(), Some("tok"));
        assert!(config.production);
        assert_eq!(config.csv_row_limit, 50);
        assert_eq!(config.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn blank_secret_counts_as_unset() {
        let config = Config::from_lookup(lookup(&[("QUIZ_SECRET", "  ")]));
        assert!(config.secret.is_none());
    }
}
