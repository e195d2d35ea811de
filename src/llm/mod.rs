pub mod chat;
pub mod stream;

use reqwest::header::{ HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE };
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Status {
        status: u16,
        body: String,
    },
    #[error("stream read error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("completion response contained no choices")]
    EmptyCompletion,
    #[error("stream session ended without an outcome")]
    SessionLost,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: Url,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

impl LlmConfig {
    pub fn new(base_url: &str) -> Result<Self, LlmError> {
        let base_url = Url::parse(base_url).map_err(|e|
            LlmError::InvalidConfig(format!("invalid base URL '{}': {}", base_url, e))
        )?;
        if base_url.cannot_be_a_base() {
            return Err(LlmError::InvalidConfig(format!("'{}' cannot be used as a base URL", base_url)));
        }
        Ok(Self {
            base_url,
            api_key: None,
            model: None,
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.trim().is_empty());
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model.filter(|m| !m.trim().is_empty());
        self
    }

    /// Joins `route` onto the base URL, keeping any path prefix the base has.
    pub fn endpoint(&self, route: &str) -> String {
        format!("{}{}", self.base_url.as_str().trim_end_matches('/'), route)
    }

    /// Default headers for every request; the bearer token is attached only
    /// when a key is configured.
    pub fn default_headers(&self) -> Result<HeaderMap, LlmError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key)).map_err(|e|
                LlmError::InvalidConfig(format!("Invalid API key format: {}", e))
            )?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    pub fn http_client(&self) -> Result<reqwest::Client, LlmError> {
        let client = reqwest::Client::builder().default_headers(self.default_headers()?).build()?;
        Ok(client)
    }
}

/// Turns a non-success response into [`LlmError::Status`], keeping the body
/// for the error message.
pub async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(LlmError::Status {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_keeps_base_path_prefix() {
        let config = LlmConfig::new("http://localhost:8080/proxy/").unwrap();
        assert_eq!(config.endpoint("/v1/chat/completions"), "http://localhost:8080/proxy/v1/chat/completions");
    }

    #[test]
    fn rejects_unparseable_base_url() {
        let err = LlmConfig::new("not a url").unwrap_err();
        assert!(matches!(err, LlmError::InvalidConfig(_)));
    }

    #[test]
    fn bearer_header_only_with_key() {
        let config = LlmConfig::new("http://localhost:8080").unwrap();
        assert!(config.default_headers().unwrap().get(AUTHORIZATION).is_none());

        let config = config.with_api_key(Some("sk-local".into()));
        let headers = config.default_headers().unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer sk-local");
    }

    #[test]
    fn blank_api_key_is_treated_as_missing() {
        let config = LlmConfig::new("http://localhost:8080").unwrap().with_api_key(Some("  ".into()));
        assert!(config.api_key.is_none());
    }
}
