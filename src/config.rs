use crate::error::{Error, Result};
use std::time::Duration;

const DEFAULT_LLM_API_URL: &str = "http://localhost:11434/api/generate"; // Ollama
const DEFAULT_LLM_MODEL: &str = "llama2";
const DEFAULT_IMAGE_API_URL: &str = "http://localhost:8080/v1/images/generations";
const DEFAULT_GIST_API_URL: &str = "https://api.github.com";
const DEFAULT_LIBRARY_LABEL: &str = "shelfsync-library";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_SAVE_DEBOUNCE_MS: u64 = 2000;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    pub llm_api_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub image_api_url: String,
    pub image_api_key: Option<String>,
    pub github_token: String,
    pub gist_api_url: String,
    /// Gist description used to find the library bundle.
    pub library_label: String,
    pub bind_addr: String,
    pub save_debounce: Duration,
    pub http_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let github_token = get("GITHUB_TOKEN")
            .ok_or_else(|| Error::Config("GITHUB_TOKEN is required".to_string()))?;
        if !looks_like_github_token(&github_token) {
            return Err(Error::Config(
                "GITHUB_TOKEN does not look like a GitHub token".to_string(),
            ));
        }

        let integer = |key: &str, default: u64| -> Result<u64> {
            match get(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| Error::Config(format!("{key} must be an integer, got '{raw}'"))),
                None => Ok(default),
            }
        };

        Ok(Config {
            llm_api_url: get("LLM_API_URL").unwrap_or_else(|| DEFAULT_LLM_API_URL.to_string()),
            llm_api_key: get("LLM_API_KEY"),
            llm_model: get("LLM_MODEL").unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
            image_api_url: get("IMAGE_API_URL")
                .unwrap_or_else(|| DEFAULT_IMAGE_API_URL.to_string()),
            image_api_key: get("IMAGE_API_KEY"),
            github_token,
            gist_api_url: get("GIST_API_URL")
                .unwrap_or_else(|| DEFAULT_GIST_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            library_label: get("LIBRARY_LABEL")
                .unwrap_or_else(|| DEFAULT_LIBRARY_LABEL.to_string()),
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            save_debounce: Duration::from_millis(integer(
                "SAVE_DEBOUNCE_MS",
                DEFAULT_SAVE_DEBOUNCE_MS,
            )?),
            http_timeout: Duration::from_secs(integer(
                "HTTP_TIMEOUT_SECS",
                DEFAULT_HTTP_TIMEOUT_SECS,
            )?),
        })
    }
}

/// Format check only; whether the token is accepted is asked of the API.
pub fn looks_like_github_token(token: &str) -> bool {
    let token = token.trim();
    let prefixed = ["ghp_", "gho_", "ghu_", "ghs_", "github_pat_"]
        .iter()
        .any(|prefix| {
            token
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.len() >= 20 && rest.chars().all(is_token_char))
        });
    let classic = token.len() == 40 && token.chars().all(|c| c.is_ascii_hexdigit());
    prefixed || classic
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
