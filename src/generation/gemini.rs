//! Gemini API backend
//!
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::config::AppConfig;
use crate::context::Role;
use crate::error::ApoError;
use crate::generation::{GenerateRequest, GenerateResponse, Generator, OutputFormat, Usage};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(300))
            .build()?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::new(&config.gemini_api_key, &config.gemini_base_url, &config.model)
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent?key={}", self.base_url, model, self.api_key)
    }
}

#[async_trait]
impl Generator for GeminiClient {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        if self.api_key.is_empty() {
            return Err(ApoError::ConfigError("GEMINI_API_KEY not configured".to_string()));
        }

        let model = request.model.as_deref().unwrap_or(&self.model);
        let body = build_request(&request);

        info!(model, structured = request.is_structured(), "Calling Gemini API");

        let response = self
            .client
            .post(self.endpoint(model))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                ApoError::GenerationError(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Gemini API error response: {}", error_text);
            return Err(ApoError::GenerationError(format!(
                "Gemini API error ({}): {}",
                status, error_text
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            ApoError::GenerationError(format!("Gemini parse error: {}", e))
        })?;

        let text = response_text(&gemini_response)?;
        request.stream_chunk(Role::Model, &text);

        Ok(GenerateResponse {
            text,
            usage: gemini_response.usage_metadata.map(|u| Usage {
                input_tokens: u.prompt_token_count,
                output_tokens: u.candidates_token_count,
            }),
        })
    }
}

fn build_request(request: &GenerateRequest) -> GeminiRequest {
    let mut system: Vec<Part> = Vec::new();
    let mut contents = Vec::with_capacity(request.messages.len());

    for message in &request.messages {
        match message.role {
            Role::System => system.push(Part {
                text: message.text.clone(),
            }),
            Role::User | Role::Model => contents.push(Content {
                role: Some(if message.role == Role::User { "user" } else { "model" }.to_string()),
                parts: vec![Part {
                    text: message.text.clone(),
                }],
            }),
        }
    }

    // Gemini enforces the schema natively
    let (response_mime_type, response_schema) = match &request.output {
        OutputFormat::Json { schema } => (Some("application/json".to_string()), Some(schema.clone())),
        OutputFormat::Text => (None, None),
    };

    GeminiRequest {
        contents,
        generation_config: GenerationConfig {
            temperature: 0.3,
            top_p: 0.9,
            top_k: 40,
            max_output_tokens: 8192,
            response_mime_type,
            response_schema,
        },
        system_instruction: if system.is_empty() {
            None
        } else {
            Some(SystemInstruction { parts: system })
        },
    }
}

fn response_text(response: &GeminiResponse) -> Result<String> {
    let candidate = response
        .candidates
        .first()
        .ok_or_else(|| ApoError::GenerationError("No response from Gemini API".to_string()))?;

    if candidate.content.parts.is_empty() {
        return Err(ApoError::GenerationError(format!(
            "Empty response from Gemini (finish reason: {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        )));
    }

    Ok(candidate
        .content
        .parts
        .iter()
        .map(|p| p.text.as_str())
        .collect())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Content,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}
