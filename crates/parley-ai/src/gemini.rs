//! Gemini streaming adapter

use futures::StreamExt;
use parley_traits::{
    ComposedContext, GenerationAdapter, GenerationEvent, GenerationFailure, GenerationStream,
};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::{AiError, Result};
use crate::http_client::build_http_client;

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-exp";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

// Truncate error body to prevent leaking large or sensitive responses.
const MAX_ERROR_BODY: usize = 512;

/// Gemini client
pub struct GeminiAdapter {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiAdapter {
    /// Create a new Gemini adapter
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(AiError::MissingApiKey("gemini".to_string()));
        }
        Ok(Self {
            client: build_http_client()?,
            api_key,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Set the model to use
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set custom base URL
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn stream_url(&self) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        )
    }
}

fn build_request_body(context: &ComposedContext) -> Value {
    let mut generation_config = json!({
        "temperature": context.sampling.temperature,
        "topP": context.sampling.top_p,
        "maxOutputTokens": context.sampling.max_output_tokens,
        "responseMimeType": "application/json",
    });
    if let Some(schema) = &context.response_schema {
        generation_config["responseSchema"] = schema.clone();
    }

    json!({
        "systemInstruction": { "parts": [{ "text": context.system_instruction }] },
        "contents": [{ "role": "user", "parts": [{ "text": context.prompt }] }],
        "generationConfig": generation_config,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

/// What one SSE event contributed to the stream.
#[derive(Debug, Default, PartialEq)]
struct ChunkOutcome {
    tokens: Vec<String>,
    finish_reason: Option<String>,
}

fn parse_event(event: &str) -> Option<ChunkOutcome> {
    let mut outcome = ChunkOutcome::default();
    let mut seen = false;

    for line in event.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }

        let chunk: StreamChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, "Skipping unparsable Gemini SSE chunk");
                continue;
            }
        };
        seen = true;

        if let Some(reason) = chunk.prompt_feedback.and_then(|f| f.block_reason) {
            outcome.finish_reason = Some(format!("BLOCKED_{reason}"));
        }

        if let Some(candidate) = chunk.candidates.into_iter().next() {
            if let Some(content) = candidate.content {
                outcome.tokens.extend(
                    content
                        .parts
                        .into_iter()
                        .filter_map(|part| part.text)
                        .filter(|text| !text.is_empty()),
                );
            }
            if candidate.finish_reason.is_some() {
                outcome.finish_reason = candidate.finish_reason;
            }
        }
    }

    seen.then_some(outcome)
}

fn finish(reason: &str, accumulated: &str) -> std::result::Result<GenerationEvent, GenerationFailure> {
    match reason {
        "STOP" | "MAX_TOKENS" => serde_json::from_str::<Value>(accumulated.trim())
            .map(GenerationEvent::Terminal)
            .map_err(|e| {
                GenerationFailure::malformed_payload(format!(
                    "terminal payload is not valid JSON ({reason}): {e}"
                ))
            }),
        other => Err(GenerationFailure::upstream(format!(
            "generation stopped with finish reason {other}"
        ))),
    }
}

async fn response_to_failure(response: Response) -> GenerationFailure {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = if body.chars().count() > MAX_ERROR_BODY {
        let truncated: String = body.chars().take(MAX_ERROR_BODY).collect();
        format!("{truncated}... [truncated]")
    } else {
        body
    };
    GenerationFailure::upstream(format!("Gemini returned HTTP {status}: {message}"))
}

/// Drain complete `\n\n`-terminated events from the byte buffer.
fn take_event(buffer: &mut Vec<u8>) -> Option<String> {
    let pos = buffer.windows(2).position(|w| w == b"\n\n")?;
    let event: Vec<u8> = buffer.drain(..pos + 2).collect();
    Some(String::from_utf8_lossy(&event[..pos]).into_owned())
}

impl GenerationAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, context: ComposedContext) -> GenerationStream {
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let url = self.stream_url();
        let model = self.model.clone();

        Box::pin(async_stream::stream! {
            let body = build_request_body(&context);
            debug!(model = %model, subject = %context.subject, "Starting Gemini stream");

            let response = match client
                .post(&url)
                .header("x-goog-api-key", &api_key)
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    yield Err(GenerationFailure::from(AiError::Http(e)));
                    return;
                }
            };

            if !response.status().is_success() {
                yield Err(response_to_failure(response).await);
                return;
            }

            let mut byte_stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            let mut accumulated = String::new();
            let mut upstream_done = false;

            loop {
                let event = match take_event(&mut buffer) {
                    Some(event) => event,
                    None if upstream_done => {
                        if buffer.iter().all(u8::is_ascii_whitespace) {
                            break;
                        }
                        // Final event without a trailing blank line
                        let rest = std::mem::take(&mut buffer);
                        String::from_utf8_lossy(&rest).into_owned()
                    }
                    None => {
                        match byte_stream.next().await {
                            Some(Ok(bytes)) => {
                                buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Gemini stream interrupted");
                                yield Err(GenerationFailure::incomplete_stream());
                                return;
                            }
                            None => upstream_done = true,
                        }
                        continue;
                    }
                };

                let Some(outcome) = parse_event(&event) else {
                    continue;
                };
                for token in outcome.tokens {
                    accumulated.push_str(&token);
                    yield Ok(GenerationEvent::Token(token));
                }
                if let Some(reason) = outcome.finish_reason {
                    debug!(model = %model, finish_reason = %reason, "Gemini stream finished");
                    yield finish(&reason, &accumulated);
                    return;
                }
            }

            yield Err(GenerationFailure::incomplete_stream());
        })
    }
}
