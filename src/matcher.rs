//! Generative text-completion service used to pair ICD and NAMASTE results.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

#[async_trait]
pub trait Matcher: Send + Sync {
    /// Returns the model's raw text completion for `prompt`.
    async fn complete(&self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    /// e.g. `https://generativelanguage.googleapis.com/v1beta`
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub timeout: Duration,
}

pub struct GeminiMatcher {
    client: Client,
    config: GeminiConfig,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

impl GeminiMatcher {
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BridgeError::transport("gemini client setup", e))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }
}

#[async_trait]
impl Matcher for GeminiMatcher {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let target = format!("gemini {}", self.config.model);
        let body = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![Part { text: prompt }],
            }],
        };

        let resp = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::transport(&target, e))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| BridgeError::transport(&target, e))?;
        if !status.is_success() {
            return Err(BridgeError::status(&target, status, &text));
        }

        let parsed: GenerateResponse =
            serde_json::from_str(&text).map_err(|source| BridgeError::Decode {
                target: target.clone(),
                source,
            })?;

        let candidate = parsed.candidates.into_iter().next().ok_or_else(|| {
            BridgeError::Decode {
                target: target.clone(),
                source: serde::de::Error::custom("response has no candidates"),
            }
        })?;
        if let Some(reason) = candidate.finish_reason.as_deref() {
            tracing::debug!("{} finished with {}", target, reason);
        }

        let reply: String = candidate
            .content
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();
        tracing::info!("{} replied with {} bytes", target, reply.len());
        Ok(reply)
    }
}
