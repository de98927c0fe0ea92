//! Attendance summaries from the Gemini `generateContent` API.

use async_trait::async_trait;
use reqwest::Client;
use rollcall_core::{build_summary_prompt, AttendanceSnapshot, ReportError, ReportRequester};
use serde_json::{json, Value};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct GeminiReporter {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl GeminiReporter {
    pub fn new(
        endpoint: String,
        model: String,
        api_key: Option<String>,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            endpoint,
            model,
            api_key,
        })
    }

    fn url(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.endpoint.trim_end_matches('/'),
            self.model
        )
    }
}

/// All text parts of the first candidate, concatenated.
fn response_text(json: &Value) -> Result<String, ReportError> {
    let text: String = json["candidates"][0]["content"]["parts"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|part| part["text"].as_str())
        .collect();
    let text = text.trim();
    if text.is_empty() {
        return Err(ReportError::Empty);
    }
    Ok(text.to_string())
}

#[async_trait]
impl ReportRequester for GeminiReporter {
    async fn summarize(&self, snapshot: &AttendanceSnapshot) -> Result<String, ReportError> {
        let Some(key) = self.api_key.as_deref() else {
            return Err(ReportError::NotConfigured(
                "set ROLLCALL_API_KEY (or API_KEY) to enable reports".into(),
            ));
        };

        let body = json!({
            "contents": [{ "parts": [{ "text": build_summary_prompt(snapshot) }] }],
        });

        tracing::info!(
            model = %self.model,
            present = snapshot.present_count(),
            total = snapshot.total(),
            "requesting attendance summary"
        );
        let res = self
            .client
            .post(self.url())
            .header("x-goog-api-key", key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ReportError::Transport(e.to_string()))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "report service rejected the request");
            return Err(ReportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let json: Value = res
            .json()
            .await
            .map_err(|e| ReportError::Transport(format!("invalid response body: {e}")))?;
        response_text(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{Identity, Roster, SharedLedger};

    #[test]
    fn test_response_text_joins_parts() {
        let json = json!({
            "candidates": [{
                "content": {
                    "parts": [{ "text": "Great turnout today! " }, { "text": "Let's get started." }]
                }
            }]
        });
        assert_eq!(response_text(&json).unwrap(), "Great turnout today! Let's get started.");
    }

    #[test]
    fn test_response_without_candidates_is_empty() {
        assert!(matches!(response_text(&json!({ "candidates": [] })), Err(ReportError::Empty)));
        assert!(matches!(response_text(&json!({})), Err(ReportError::Empty)));
    }

    #[test]
    fn test_url() {
        let reporter = GeminiReporter::new(
            "https://example.test/v1beta/".into(),
            "gemini-2.5-flash".into(),
            None,
        )
        .unwrap();
        assert_eq!(
            reporter.url(),
            "https://example.test/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }

    #[tokio::test]
    async fn test_missing_key_is_not_configured() {
        let reporter =
            GeminiReporter::new("https://example.test".into(), "m".into(), None).unwrap();
        let roster = Roster::new(vec![Identity::new(1, "Alice", "a.png")]).unwrap();
        let snapshot = SharedLedger::new(&roster).snapshot();
        let err = reporter.summarize(&snapshot).await.unwrap_err();
        assert!(matches!(err, ReportError::NotConfigured(_)));
    }
}
