//! LLM collaborator access: the backend seam, the Ollama HTTP backend and a
//! scripted backend for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

/// LLM-related errors.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("API error: {0}")]
    Api(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("rate limited; retry in {0:?}")]
    RateLimited(Duration),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Result type for LLM operations.
pub type LlmResult<T> = Result<T, LlmError>;

/// Taxonomy code an [`LlmError`] maps to in narration and error envelopes.
impl LlmError {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "LLM_TIMEOUT",
            Self::RateLimited(_) => "RATE_LIMIT_EXCEEDED",
            Self::InvalidResponse(_) => "LLM_UNPARSEABLE",
            Self::Api(_) | Self::Connection(_) => "LLM_TIMEOUT",
        }
    }
}

/// Core seam for text-in / text-out collaborators.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Generate a completion for a system + user prompt pair.
    async fn complete(&self, system: &str, prompt: &str) -> LlmResult<String>;
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    response: String,
}

/// Ollama HTTP backend (`/api/generate`).
pub struct OllamaBackend {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaBackend {
    /// Build a backend with a per-request timeout baked into the client.
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> LlmResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| LlmError::Connection(err.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
        })
    }
}

#[async_trait]
impl LlmBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, system: &str, prompt: &str) -> LlmResult<String> {
        let endpoint = format!("{}/api/generate", self.base_url);
        let request = OllamaRequest {
            model: &self.model,
            prompt,
            system: (!system.is_empty()).then_some(system),
            stream: false,
        };
        info!(model = %self.model, prompt_len = prompt.len(), "llm request started");
        let response = self
            .client
            .post(&endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    LlmError::Timeout(Duration::ZERO)
                } else if err.is_connect() {
                    LlmError::Connection(err.to_string())
                } else {
                    LlmError::Api(err.to_string())
                }
            })?;
        if !response.status().is_success() {
            return Err(LlmError::Api(format!("status {}", response.status())));
        }
        let body: OllamaResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        info!(model = %self.model, response_len = body.response.len(), "llm request completed");
        Ok(body.response)
    }
}

/// Scripted backend replaying canned replies in order. Used by tests and the
/// offline demo mode.
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one reply.
    #[must_use]
    pub fn with_reply(self, reply: &str) -> Self {
        self.push_reply(reply);
        self
    }

    /// Queue a reply on an existing backend.
    pub fn push_reply(&self, reply: &str) {
        self.replies
            .lock()
            .expect("scripted backend lock poisoned")
            .push_back(reply.to_string());
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _system: &str, _prompt: &str) -> LlmResult<String> {
        self.replies
            .lock()
            .expect("scripted backend lock poisoned")
            .pop_front()
            .ok_or_else(|| LlmError::Api("no scripted reply queued".into()))
    }
}

/// Minimum-interval limiter protecting the collaborator from agent spam.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval, last: Mutex::new(None) }
    }

    /// Record a call attempt; errors with the remaining wait while inside
    /// the minimum interval.
    pub fn check(&self) -> LlmResult<()> {
        let mut last = self.last.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        if let Some(previous) = *last {
            let elapsed = now.duration_since(previous);
            if elapsed < self.min_interval {
                return Err(LlmError::RateLimited(self.min_interval - elapsed));
            }
        }
        *last = Some(now);
        Ok(())
    }
}

/// Shared client wrapping a backend with a wall-clock timeout and a
/// per-agent rate limit.
pub struct LlmClient {
    backend: Arc<dyn LlmBackend>,
    timeout: Duration,
    limiter: RateLimiter,
}

impl LlmClient {
    #[must_use]
    pub fn new(backend: Arc<dyn LlmBackend>, timeout: Duration, min_interval: Duration) -> Self {
        Self {
            backend,
            timeout,
            limiter: RateLimiter::new(min_interval),
        }
    }

    /// Generate a completion, bounded by the configured timeout.
    pub async fn generate(&self, system: &str, prompt: &str) -> LlmResult<String> {
        self.limiter.check()?;
        match tokio::time::timeout(self.timeout, self.backend.complete(system, prompt)).await {
            Ok(result) => result,
            Err(_) => {
                error!(backend = self.backend.name(), timeout = ?self.timeout, "llm timeout");
                Err(LlmError::Timeout(self.timeout))
            }
        }
    }
}

/// Extract a JSON object from free-form model output: fenced blocks first,
/// then the first balanced inline object, then the whole text.
#[must_use]
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    if let Some(block) = fenced_block(text, Some("json")) {
        if let Ok(value) = serde_json::from_str(block.trim()) {
            return Some(value);
        }
    }
    if let Some(block) = fenced_block(text, None) {
        if let Ok(value) = serde_json::from_str(block.trim()) {
            return Some(value);
        }
    }
    if let Some(candidate) = balanced_object(text) {
        if let Ok(value) = serde_json::from_str(candidate) {
            return Some(value);
        }
    }
    serde_json::from_str(text.trim()).ok()
}

/// Extract source code from model output: a language-tagged fence first,
/// then any fence, then the raw text.
#[must_use]
pub fn extract_code(text: &str, language: &str) -> Option<String> {
    if let Some(block) = fenced_block(text, Some(language)) {
        return Some(block.trim().to_string());
    }
    if let Some(block) = fenced_block(text, None) {
        return Some(block.trim().to_string());
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Find the body of the first ``` fence, optionally requiring a language tag.
fn fenced_block<'a>(text: &'a str, language: Option<&str>) -> Option<&'a str> {
    let mut rest = text;
    loop {
        let open = rest.find("```")?;
        let after = &rest[open + 3..];
        let line_end = after.find('\n')?;
        let tag = after[..line_end].trim();
        let body = &after[line_end + 1..];
        let close = body.find("```")?;
        let matches = match language {
            Some(lang) => tag.eq_ignore_ascii_case(lang),
            None => true,
        };
        if matches {
            return Some(&body[..close]);
        }
        rest = &body[close + 3..];
    }
}

/// First balanced `{...}` region, string-aware.
fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_backend_replays_in_order() {
        let backend = ScriptedBackend::new().with_reply("one").with_reply("two");
        assert_eq!(backend.complete("", "").await.expect("one"), "one");
        assert_eq!(backend.complete("", "").await.expect("two"), "two");
        assert!(backend.complete("", "").await.is_err());
    }

    #[tokio::test]
    async fn client_times_out_slow_backends() {
        struct Stalled;
        #[async_trait]
        impl LlmBackend for Stalled {
            fn name(&self) -> &str {
                "stalled"
            }
            async fn complete(&self, _: &str, _: &str) -> LlmResult<String> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(String::new())
            }
        }
        let client = LlmClient::new(
            Arc::new(Stalled),
            Duration::from_millis(20),
            Duration::ZERO,
        );
        let err = client.generate("", "").await.unwrap_err();
        assert!(matches!(err, LlmError::Timeout(_)));
        assert_eq!(err.code(), "LLM_TIMEOUT");
    }

    #[tokio::test]
    async fn rate_limiter_spaces_calls() {
        let client = LlmClient::new(
            Arc::new(ScriptedBackend::new().with_reply("a").with_reply("b")),
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
        client.generate("", "").await.expect("first call");
        let err = client.generate("", "").await.unwrap_err();
        assert!(matches!(err, LlmError::RateLimited(_)));
        assert_eq!(err.code(), "RATE_LIMIT_EXCEEDED");
    }

    #[test]
    fn extracts_json_from_fences_prose_and_raw() {
        let fenced = "Sure!\n```json\n{\"a\": 1}\n```\nthanks";
        assert_eq!(extract_json(fenced).expect("fenced")["a"], 1);

        let inline = "The plan is {\"a\": {\"b\": 2}} as discussed.";
        assert_eq!(extract_json(inline).expect("inline")["a"]["b"], 2);

        let raw = "  {\"ok\": true}  ";
        assert_eq!(extract_json(raw).expect("raw")["ok"], true);

        assert!(extract_json("no json here").is_none());
    }

    #[test]
    fn extracts_json_with_braces_inside_strings() {
        let tricky = "{\"text\": \"has a } brace\", \"n\": 3}";
        assert_eq!(extract_json(tricky).expect("tricky")["n"], 3);
    }

    #[test]
    fn extracts_code_with_fence_preference() {
        let tagged = "```genescript\ntrait A { }\n```";
        assert_eq!(extract_code(tagged, "genescript").expect("tagged"), "trait A { }");

        let generic = "```\ntrait B { }\n```";
        assert_eq!(extract_code(generic, "genescript").expect("generic"), "trait B { }");

        assert_eq!(
            extract_code("trait C { }", "genescript").expect("raw"),
            "trait C { }"
        );
        assert!(extract_code("   ", "genescript").is_none());
    }

    #[test]
    fn skips_wrong_language_fences() {
        let text = "```python\nprint('x')\n```\n```genescript\ntrait D { }\n```";
        assert_eq!(extract_code(text, "genescript").expect("code"), "trait D { }");
    }
}
