//! OpenAI-compatible HTTP client shared by the production reply generator and scorer.
//!
//! Env: `RING_LLM_API_URL` (default `https://api.openai.com/v1`), `RING_LLM_API_KEY`
//! (falls back to `OPENAI_API_KEY`), `RING_LLM_MODEL`, `RING_TTS_MODEL`, `RING_TTS_VOICE`.

use crate::error::{CallError, CallResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const DEFAULT_API_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TTS_MODEL: &str = "tts-1";
const DEFAULT_VOICE: &str = "nova";

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", content)
    }

    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

/// Chat completion + speech synthesis over one API base.
#[derive(Clone)]
pub struct ChatClient {
    base_url: String,
    api_key: String,
    model: String,
    tts_model: String,
    voice: String,
    client: reqwest::Client,
}

impl ChatClient {
    /// Build from environment. Fails when no API key is set.
    pub fn from_env() -> CallResult<Self> {
        let base_url =
            std::env::var("RING_LLM_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let api_key = std::env::var("RING_LLM_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| {
                CallError::Config("reply generation requires RING_LLM_API_KEY or OPENAI_API_KEY".to_string())
            })?;
        let mut client = Self::new(base_url, api_key)?;
        if let Ok(model) = std::env::var("RING_LLM_MODEL") {
            client.model = model;
        }
        if let Ok(tts_model) = std::env::var("RING_TTS_MODEL") {
            client.tts_model = tts_model;
        }
        if let Ok(voice) = std::env::var("RING_TTS_VOICE") {
            client.voice = voice;
        }
        Ok(client)
    }

    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> CallResult<Self> {
        let api_key = api_key.into().trim().to_string();
        if api_key.is_empty() {
            return Err(CallError::Config("empty API key".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: DEFAULT_MODEL.to_string(),
            tts_model: DEFAULT_TTS_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            client,
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }

    /// One chat completion. `json` asks the model for a JSON object.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        json: bool,
    ) -> CallResult<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature,
            response_format: json.then(|| serde_json::json!({ "type": "json_object" })),
        };
        debug!(model = %self.model, messages = messages.len(), "chat completion request");

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(CallError::Generation(format!("chat API error {}: {}", status, body)));
        }

        let parsed: ChatResponse = res.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CallError::Generation("chat API returned no choices".to_string()))
    }

    /// Text to speech (`/audio/speech`). Returns MP3 bytes; empty text yields no bytes.
    pub async fn synthesize(&self, text: &str) -> CallResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/audio/speech", self.base_url);
        let body = serde_json::json!({
            "model": self.tts_model,
            "input": text,
            "voice": self.voice,
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(CallError::Playback(format!("TTS API error {}: {}", status, body)));
        }
        Ok(res.bytes().await?.to_vec())
    }
}
