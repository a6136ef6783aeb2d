use anyhow::{bail, Result};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Clone)]
pub struct GeminiConfig {
    pub api_base: String,      // e.g. "https://generativelanguage.googleapis.com/v1beta"
    pub api_key: String,       // env GEMINI_API_KEY
    pub model: String,         // e.g. "gemini-2.5-pro"
    pub temperature: f32,
    pub request_timeout: Duration,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("GEMINI_BASE_URL")
                .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".into()),
            api_key: env::var("GEMINI_API_KEY").unwrap_or_default(),
            model: env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.5-pro".into()),
            temperature: 0.2,
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_base", &self.api_base)
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum GeminiError {
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("Gemini error {status}: {message}")]
    Api { status: StatusCode, message: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to decode Gemini response: {0}")]
    Decode(String),
    #[error("prompt blocked: {0}")]
    Blocked(String),
    #[error("model returned no text (finish reason {0})")]
    Empty(String),
}

#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    cfg: GeminiConfig,
}

impl GeminiClient {
    pub fn new(cfg: GeminiConfig) -> Result<Self> {
        if cfg.api_key.trim().is_empty() {
            bail!("GEMINI_API_KEY missing");
        }
        let http = Client::builder().timeout(cfg.request_timeout).build()?;
        Ok(Self { http, cfg })
    }

    pub fn model(&self) -> &str {
        &self.cfg.model
    }

    /// Single-turn `generateContent` call returning the concatenated text parts.
    pub async fn generate(&self, prompt: &str) -> Result<String, GeminiError> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.cfg.api_base.trim_end_matches('/'),
            self.cfg.model
        );
        let req = json!({
          "contents": [
            { "role": "user", "parts": [ { "text": prompt } ] }
          ],
          "generationConfig": {
            "temperature": self.cfg.temperature,
            "candidateCount": 1
          }
        });

        let resp = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.cfg.api_key)
            .json(&req)
            .send()
            .await?;
        let status = resp.status();
        let header_hint = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = resp.text().await?;
        debug!(%status, bytes = text.len(), "gemini response");

        if status == StatusCode::TOO_MANY_REQUESTS
            || (!status.is_success() && text.contains("RESOURCE_EXHAUSTED"))
        {
            return Err(GeminiError::RateLimited {
                message: error_message(&text),
                retry_after: retry_delay_from_body(&text).or(header_hint),
            });
        }
        if !status.is_success() {
            return Err(GeminiError::Api { status, message: error_message(&text) });
        }
        let v: Value = serde_json::from_str(&text).map_err(|e| GeminiError::Decode(e.to_string()))?;
        response_to_text(&v)
    }
}

/// Joins every text part of every candidate; the first candidate with text wins.
pub fn response_to_text(v: &Value) -> Result<String, GeminiError> {
    if let Some(reason) = v.pointer("/promptFeedback/blockReason").and_then(|x| x.as_str()) {
        return Err(GeminiError::Blocked(reason.to_string()));
    }
    let candidates = v
        .get("candidates")
        .and_then(|x| x.as_array())
        .cloned()
        .unwrap_or_default();
    for cand in &candidates {
        let texts: Vec<&str> = cand
            .pointer("/content/parts")
            .and_then(|x| x.as_array())
            .map(|parts| parts.iter().filter_map(|p| p.get("text")?.as_str()).collect())
            .unwrap_or_default();
        if !texts.is_empty() {
            return Ok(texts.join("\n"));
        }
    }
    let finish = v
        .pointer("/candidates/0/finishReason")
        .and_then(|x| x.as_str())
        .unwrap_or("UNKNOWN");
    Err(GeminiError::Empty(finish.to_string()))
}

/// Reads `retryDelay` (e.g. `"23s"`) from a `google.rpc.RetryInfo` error detail.
fn retry_delay_from_body(body: &str) -> Option<Duration> {
    let v: Value = serde_json::from_str(body).ok()?;
    v.pointer("/error/details")?
        .as_array()?
        .iter()
        .filter(|d| {
            d.get("@type")
                .and_then(|t| t.as_str())
                .is_some_and(|t| t.ends_with("RetryInfo"))
        })
        .find_map(|d| d.get("retryDelay")?.as_str())
        .and_then(|s| s.trim().trim_end_matches('s').parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message")?.as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(300).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_text_parts() {
        let v = json!({
            "candidates": [{
                "content": { "parts": [ { "text": "{\"action\":\"click\",\"selector\":\"#a\"}" }, { "text": "{\"action\":\"press\",\"key\":\"Enter\"}" } ] },
                "finishReason": "STOP"
            }]
        });
        let text = response_to_text(&v).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn empty_and_blocked_responses_are_errors() {
        let empty = json!({ "candidates": [ { "content": { "parts": [] }, "finishReason": "MAX_TOKENS" } ] });
        assert!(matches!(response_to_text(&empty), Err(GeminiError::Empty(r)) if r == "MAX_TOKENS"));
        let blocked = json!({ "promptFeedback": { "blockReason": "SAFETY" } });
        assert!(matches!(response_to_text(&blocked), Err(GeminiError::Blocked(r)) if r == "SAFETY"));
    }

    #[test]
    fn parses_retry_info_delay() {
        let body = r#"{"error":{"code":429,"message":"Quota exceeded","status":"RESOURCE_EXHAUSTED",
            "details":[{"@type":"type.googleapis.com/google.rpc.QuotaFailure"},
                       {"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"23s"}]}}"#;
        assert_eq!(retry_delay_from_body(body), Some(Duration::from_secs(23)));
        assert_eq!(error_message(body), "Quota exceeded");
        assert_eq!(retry_delay_from_body("not json"), None);
        assert_eq!(error_message("plain failure"), "plain failure");
    }

    const QUOTA_BODY: &str = r#"{"error":{"code":429,"message":"Quota exceeded","status":"RESOURCE_EXHAUSTED",
        "details":[{"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"23s"}]}}"#;

    /// Local stand-in for `generateContent`; the model name picks the reply.
    async fn serve_stub() -> String {
        use axum::http::{HeaderMap, StatusCode as Code, Uri};
        use axum::response::{IntoResponse, Response};

        async fn reply(uri: Uri, headers: HeaderMap) -> Response {
            if headers.get("x-goog-api-key").and_then(|v| v.to_str().ok()) != Some("test-key") {
                return (Code::UNAUTHORIZED, "missing key").into_response();
            }
            let model = uri
                .path()
                .strip_prefix("/v1beta/models/")
                .and_then(|rest| rest.strip_suffix(":generateContent"))
                .unwrap_or_default();
            match model {
                "quota" => (Code::TOO_MANY_REQUESTS, [("retry-after", "5")], QUOTA_BODY).into_response(),
                "busy" => (Code::TOO_MANY_REQUESTS, [("retry-after", "7")], "slow down").into_response(),
                "exhausted" => (Code::SERVICE_UNAVAILABLE, QUOTA_BODY).into_response(),
                "bad" => (
                    Code::BAD_REQUEST,
                    r#"{"error":{"code":400,"message":"Invalid JSON payload","status":"INVALID_ARGUMENT"}}"#,
                )
                    .into_response(),
                "ok" => axum::Json(json!({
                    "candidates": [{
                        "content": { "parts": [ { "text": "DONE" }, { "text": "results are sorted" } ] },
                        "finishReason": "STOP"
                    }]
                }))
                .into_response(),
                _ => (Code::NOT_FOUND, "unknown model").into_response(),
            }
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, axum::Router::new().fallback(reply)).await.unwrap();
        });
        format!("http://{addr}/v1beta")
    }

    fn client(api_base: &str, model: &str) -> GeminiClient {
        GeminiClient::new(GeminiConfig {
            api_base: api_base.to_string(),
            api_key: "test-key".into(),
            model: model.into(),
            temperature: 0.2,
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn rate_limits_carry_the_server_retry_hint() {
        let base = serve_stub().await;
        match client(&base, "quota").generate("search RTX 4090").await {
            Err(GeminiError::RateLimited { message, retry_after }) => {
                assert_eq!(message, "Quota exceeded");
                assert_eq!(retry_after, Some(Duration::from_secs(23)));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
        match client(&base, "busy").generate("search RTX 4090").await {
            Err(GeminiError::RateLimited { retry_after, .. }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
        assert!(matches!(
            client(&base, "exhausted").generate("search RTX 4090").await,
            Err(GeminiError::RateLimited { retry_after: Some(d), .. }) if d == Duration::from_secs(23)
        ));
    }

    #[tokio::test]
    async fn other_failures_are_api_errors() {
        let base = serve_stub().await;
        match client(&base, "bad").generate("search RTX 4090").await {
            Err(GeminiError::Api { status, message }) => {
                assert_eq!(status.as_u16(), 400);
                assert_eq!(message, "Invalid JSON payload");
            }
            other => panic!("expected api error, got {other:?}"),
        }
        let wrong_key = GeminiClient::new(GeminiConfig {
            api_base: base.clone(),
            api_key: "other".into(),
            model: "ok".into(),
            temperature: 0.2,
            request_timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert!(matches!(
            wrong_key.generate("hi").await,
            Err(GeminiError::Api { status, .. }) if status.as_u16() == 401
        ));
    }

    #[tokio::test]
    async fn success_joins_candidate_text() {
        let base = serve_stub().await;
        let text = client(&base, "ok").generate("search RTX 4090").await.unwrap();
        assert_eq!(text, "DONE\nresults are sorted");
    }

    #[test]
    fn client_requires_api_key() {
        let cfg = GeminiConfig { api_key: String::new(), ..GeminiConfig::default() };
        assert!(GeminiClient::new(cfg).is_err());
    }

    #[test]
    fn debug_redacts_key() {
        let cfg = GeminiConfig { api_key: "secret-key".into(), ..GeminiConfig::default() };
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("secret-key"));
        assert!(rendered.contains("<redacted>"));
    }
}
