//! HTTP client for a prediction-style rewrite endpoint.
//!
//! Request: `{"question": <text>, "streaming": false, "overrideConfig": {}}`.
//! Response: a JSON object whose `text` or `data` string carries the result.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{RewriteResult, Rewriter};

/// Upper bound on one rewrite round trip.
pub const DEFAULT_REWRITE_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictionRequest<'a> {
    question: &'a str,
    streaming: bool,
    override_config: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PredictionResponse {
    #[serde(default)]
    text: Option<serde_json::Value>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

impl PredictionResponse {
    fn into_text(self) -> Option<String> {
        [self.text, self.data]
            .into_iter()
            .flatten()
            .filter_map(|v| match v {
                serde_json::Value::String(s) => Some(s.trim().to_string()),
                _ => None,
            })
            .find(|s| !s.is_empty())
    }
}

/// Calls the rewrite endpoint with a bounded timeout.
pub struct RewriteClient {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl RewriteClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeout(url, DEFAULT_REWRITE_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn request(&self, text: &str) -> Result<Option<String>, reqwest::Error> {
        let body = PredictionRequest {
            question: text,
            streaming: false,
            override_config: serde_json::Map::new(),
        };

        let resp = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let parsed: PredictionResponse = resp.json().await?;
        Ok(parsed.into_text())
    }
}

#[async_trait]
impl Rewriter for RewriteClient {
    async fn rewrite(&self, text: &str) -> RewriteResult {
        if text.trim().is_empty() {
            return RewriteResult::Unavailable;
        }

        debug!(
            preview = %text.chars().take(50).collect::<String>(),
            "Rewriting text"
        );

        match self.request(text).await {
            Ok(Some(rewritten)) => RewriteResult::Rewritten(rewritten),
            Ok(None) => {
                warn!("Rewrite service returned an empty result; keeping original text");
                RewriteResult::Unavailable
            }
            Err(e) => {
                warn!(
                    error = %e,
                    timeout = e.is_timeout(),
                    status = ?e.status(),
                    "Rewrite failed; keeping original text"
                );
                RewriteResult::Unavailable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Option<String> {
        serde_json::from_str::<PredictionResponse>(raw)
            .unwrap()
            .into_text()
    }

    #[test]
    fn request_body_shape() {
        let body = PredictionRequest {
            question: "hello",
            streaming: false,
            override_config: serde_json::Map::new(),
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"question": "hello", "streaming": false, "overrideConfig": {}})
        );
    }

    #[test]
    fn text_field_wins() {
        assert_eq!(parse(r#"{"text": " new ", "data": "other"}"#), Some("new".into()));
    }

    #[test]
    fn data_field_used_when_text_empty() {
        assert_eq!(parse(r#"{"text": "  ", "data": "other"}"#), Some("other".into()));
        assert_eq!(parse(r#"{"data": "only data"}"#), Some("only data".into()));
    }

    #[test]
    fn non_string_fields_are_ignored() {
        assert_eq!(parse(r#"{"text": {"nested": true}}"#), None);
        assert_eq!(parse(r#"{"unrelated": "x"}"#), None);
    }

    #[tokio::test]
    async fn blank_input_skips_the_network() {
        // Port 9 (discard) would fail if a request were attempted; the result
        // must be Unavailable without waiting on it.
        let client = RewriteClient::with_timeout("http://127.0.0.1:9/", Duration::from_millis(10));
        assert_eq!(client.rewrite("   \n").await, RewriteResult::Unavailable);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_unavailable() {
        let client = RewriteClient::with_timeout("http://127.0.0.1:9/", Duration::from_millis(200));
        assert_eq!(client.rewrite("hello").await, RewriteResult::Unavailable);
    }
}
