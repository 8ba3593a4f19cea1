use std::collections::VecDeque;
use std::io;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://api.mistral.ai/v1";
pub const DEFAULT_MODEL: &str = "mistral-medium-latest";
pub const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// One call to the text-generation capability.
///
/// `instructions` carry the role's standing brief, `prompt` the task for this call, and
/// `context` the structured state the task is conditioned on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationRequest {
    pub role: String,
    pub instructions: String,
    pub prompt: String,
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("generation call timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u128 },
    #[error("generation transport failure: {0}")]
    Transport(String),
    #[error("generation endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("generation response unusable: {0}")]
    Response(String),
}

/// Boundary to whatever produces free text for a role.
pub trait GenerationProvider: Send + Sync {
    fn provider_name(&self) -> &str;

    /// Run one completion and return the model text verbatim.
    ///
    /// # Errors
    /// Returns a [`ProviderError`] when the call fails, times out, or yields no text.
    fn complete(&self, request: &GenerationRequest) -> Result<String, ProviderError>;
}

#[derive(Clone)]
pub struct HttpProviderConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for HttpProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProviderConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// OpenAI-compatible chat-completions client (Mistral by default).
#[derive(Debug)]
pub struct HttpChatProvider {
    config: HttpProviderConfig,
    agent: ureq::Agent,
}

impl HttpChatProvider {
    #[must_use]
    pub fn new(config: HttpProviderConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Self { config, agent }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

impl GenerationProvider for HttpChatProvider {
    fn provider_name(&self) -> &str {
        "http-chat"
    }

    fn complete(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let body = chat_body(&self.config.model, request);
        let started = Instant::now();

        let response = self
            .agent
            .post(&self.endpoint())
            .set("Authorization", &format!("Bearer {}", self.config.api_key))
            .set("Accept", "application/json")
            .send_json(body)
            .map_err(|err| classify_call_error(err, started))?;

        let payload: serde_json::Value = response.into_json().map_err(|err| {
            if is_timeout_io(&err) {
                ProviderError::Timeout { elapsed_ms: started.elapsed().as_millis() }
            } else {
                ProviderError::Response(format!("response body is not JSON: {err}"))
            }
        })?;

        let text = completion_text(&payload)?;
        tracing::debug!(
            role = %request.role,
            model = %self.config.model,
            elapsed_ms = started.elapsed().as_millis(),
            output_len = text.len(),
            "generation call completed"
        );
        Ok(text)
    }
}

fn chat_body(model: &str, request: &GenerationRequest) -> serde_json::Value {
    let context = serde_json::to_string_pretty(&request.context)
        .unwrap_or_else(|_| request.context.to_string());
    serde_json::json!({
        "model": model,
        "messages": [
            {"role": "system", "content": request.instructions},
            {"role": "user", "content": format!("{}\n\nContext (JSON):\n{context}", request.prompt)},
        ],
        "response_format": {"type": "json_object"},
        "temperature": 0.7,
    })
}

fn completion_text(payload: &serde_json::Value) -> Result<String, ProviderError> {
    let text = payload
        .pointer("/choices/0/message/content")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ProviderError::Response("no choices[0].message.content".to_string()))?;
    if text.trim().is_empty() {
        return Err(ProviderError::Response("completion text is empty".to_string()));
    }
    Ok(text.to_string())
}

fn classify_call_error(err: ureq::Error, started: Instant) -> ProviderError {
    match err {
        ureq::Error::Status(status, response) => {
            let body = response.into_string().unwrap_or_default();
            ProviderError::Status { status, body }
        }
        ureq::Error::Transport(transport) => {
            if source_chain_timed_out(&transport) || transport.to_string().contains("timed out") {
                ProviderError::Timeout { elapsed_ms: started.elapsed().as_millis() }
            } else {
                ProviderError::Transport(transport.to_string())
            }
        }
    }
}

fn source_chain_timed_out(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(cause) = current {
        if cause.downcast_ref::<io::Error>().is_some_and(is_timeout_io) {
            return true;
        }
        current = cause.source();
    }
    false
}

fn is_timeout_io(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// Replays canned completions in order and records every request it receives.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<String, ProviderError>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedProvider {
    #[must_use]
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_results(responses.into_iter().map(|text| Ok(text.into())))
    }

    #[must_use]
    pub fn with_results<I>(results: I) -> Self
    where
        I: IntoIterator<Item = Result<String, ProviderError>>,
    {
        Self { responses: Mutex::new(results.into_iter().collect()), requests: Mutex::default() }
    }

    pub fn push(&self, result: Result<String, ProviderError>) {
        self.responses.lock().unwrap_or_else(PoisonError::into_inner).push_back(result);
    }

    #[must_use]
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.responses.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl GenerationProvider for ScriptedProvider {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn complete(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).push(request.clone());
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| {
                Err(ProviderError::Response("scripted provider has no responses left".to_string()))
            })
    }
}
