//! Generation service abstraction
//!
//! The optimizers only ever need one capability: turn a message history into
//! text, optionally constrained to a JSON shape. Everything model specific
//! lives behind the `Generator` trait.

use crate::context::{Role, RunContext, StreamChunk, StreamHandler};
use crate::error::ApoError;
use crate::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::debug;

pub mod gemini;

pub use gemini::GeminiClient;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, text: text.into() }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, text: text.into() }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self { role: Role::Model, text: text.into() }
    }
}

/// Requested shape of the response
#[derive(Debug, Clone, PartialEq)]
pub enum OutputFormat {
    Text,
    Json { schema: serde_json::Value },
}

#[derive(Clone)]
pub struct GenerateRequest {
    pub messages: Vec<Message>,
    pub model: Option<String>,
    pub output: OutputFormat,
    pub stream: Option<StreamHandler>,
}

impl GenerateRequest {
    pub fn new(ctx: &RunContext, messages: Vec<Message>) -> Self {
        Self {
            messages,
            model: ctx.model().map(str::to_string),
            output: OutputFormat::Text,
            stream: ctx.stream().cloned(),
        }
    }

    pub fn with_json_schema(mut self, schema: serde_json::Value) -> Self {
        self.output = OutputFormat::Json { schema };
        self
    }

    pub fn is_structured(&self) -> bool {
        matches!(self.output, OutputFormat::Json { .. })
    }

    /// Text of the last user message; the prompt a mock usually matches on.
    pub fn last_user_text(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text.as_str())
            .unwrap_or("")
    }

    /// Text of the first user message.
    pub fn first_user_text(&self) -> &str {
        self.messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.text.as_str())
            .unwrap_or("")
    }

    /// Forward a chunk to the stream handler carried by the request.
    pub fn stream_chunk(&self, role: Role, text: &str) {
        if let Some(handler) = &self.stream {
            handler(&StreamChunk {
                role,
                text: text.to_string(),
            });
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateResponse {
    pub text: String,
    pub usage: Option<Usage>,
}

/// Trait for text generation backends
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse>;
}

/// Structured value decoded from a response, with the raw text kept for
/// corrective follow-up messages.
#[derive(Debug, Clone)]
pub struct Decoded<T> {
    pub value: T,
    pub raw: String,
}

/// Free-text completion
pub async fn generate_text(
    generator: &dyn Generator,
    ctx: &RunContext,
    messages: Vec<Message>,
) -> Result<String> {
    let request = GenerateRequest::new(ctx, messages);
    let response = ctx.guard(generator.generate(request)).await?;

    if let Some(usage) = response.usage {
        debug!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Generation usage"
        );
    }

    Ok(response.text)
}

/// Schema-constrained completion decoded into `T`.
///
/// On a decode failure the error carries the raw text; callers that retry
/// use `generate_data_raw` to get it back alongside the error.
pub async fn generate_data<T: DeserializeOwned>(
    generator: &dyn Generator,
    ctx: &RunContext,
    messages: Vec<Message>,
    schema: serde_json::Value,
) -> Result<Decoded<T>> {
    let (raw, decoded) = generate_data_raw(generator, ctx, messages, schema).await?;
    decoded.map(|value| Decoded { value, raw })
}

/// Like `generate_data` but keeps the raw response text when decoding fails.
/// Transport errors and cancellation come back in the outer `Result`.
pub async fn generate_data_raw<T: DeserializeOwned>(
    generator: &dyn Generator,
    ctx: &RunContext,
    messages: Vec<Message>,
    schema: serde_json::Value,
) -> Result<(String, Result<T>)> {
    let request = GenerateRequest::new(ctx, messages).with_json_schema(schema);
    let response = ctx.guard(generator.generate(request)).await?;

    if let Some(usage) = response.usage {
        debug!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Generation usage"
        );
    }

    let decoded = parse_json_response(&response.text);
    Ok((response.text, decoded))
}

/// Parse a JSON response, tolerating markdown fences and leading chatter.
pub fn parse_json_response<T: DeserializeOwned>(response: &str) -> Result<T> {
    let cleaned = response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    match serde_json::from_str(cleaned) {
        Ok(value) => Ok(value),
        Err(first_err) => {
            // Fall back to the outermost JSON object or array in the text.
            let start = cleaned.find(|c: char| c == '{' || c == '[');
            let end = cleaned.rfind(|c: char| c == '}' || c == ']');
            if let (Some(start), Some(end)) = (start, end) {
                if start < end {
                    if let Ok(value) = serde_json::from_str(&cleaned[start..=end]) {
                        return Ok(value);
                    }
                }
            }
            Err(ApoError::StructuredDecodeError(format!(
                "{} | raw={}",
                first_err, response
            )))
        }
    }
}

//
// ================= Mock Generator =================
//

type Responder = dyn Fn(&GenerateRequest) -> Result<String> + Send + Sync;

/// Request as seen by the mock, kept for assertions
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<Message>,
    pub structured: bool,
}

/// Closure-backed generator for development & testing
pub struct MockGenerator {
    responder: Box<Responder>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockGenerator {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&GenerateRequest) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(RecordedRequest {
                messages: request.messages.clone(),
                structured: request.is_structured(),
            });
        }

        let text = (self.responder)(&request)?;
        request.stream_chunk(Role::Model, &text);

        Ok(GenerateResponse { text, usage: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Answer {
        value: u32,
    }

    #[test]
    fn test_parse_fenced_json() {
        let parsed: Answer = parse_json_response("```json\n{\"value\": 3}\n```").unwrap();
        assert_eq!(parsed, Answer { value: 3 });
    }

    #[test]
    fn test_parse_json_with_chatter() {
        let parsed: Vec<String> =
            parse_json_response("Sure, here you go: [\"4\", \"6\"] hope it helps").unwrap();
        assert_eq!(parsed, vec!["4", "6"]);
    }

    #[test]
    fn test_parse_invalid_json_is_decode_error() {
        let err = parse_json_response::<Answer>("no json here").unwrap_err();
        assert!(err.is_decode_error());
    }

    #[tokio::test]
    async fn test_mock_records_requests_and_streams() {
        let streamed = Arc::new(Mutex::new(String::new()));
        let sink = streamed.clone();
        let ctx = RunContext::new()
            .with_model("test-model")
            .with_stream(Arc::new(move |chunk: &StreamChunk| {
                if chunk.role == Role::Model {
                    sink.lock().unwrap().push_str(&chunk.text);
                }
            }));

        let generator = MockGenerator::new(|req| Ok(format!("echo: {}", req.last_user_text())));
        let text = generate_text(&generator, &ctx, vec![Message::user("hi")])
            .await
            .unwrap();

        assert_eq!(text, "echo: hi");
        assert_eq!(generator.call_count(), 1);
        assert!(!generator.requests()[0].structured);
        assert_eq!(streamed.lock().unwrap().as_str(), "echo: hi");
    }

    #[tokio::test]
    async fn test_generate_data_decodes() {
        let generator = MockGenerator::new(|_| Ok("{\"value\": 42}".to_string()));
        let decoded: Decoded<Answer> = generate_data(
            &generator,
            &RunContext::new(),
            vec![Message::user("answer")],
            serde_json::json!({"type": "object"}),
        )
        .await
        .unwrap();

        assert_eq!(decoded.value.value, 42);
        assert!(generator.requests()[0].structured);
    }
}
