use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_core::Stream;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;

use crate::{ContentBlock, LlmProvider, LlmRequest, LlmResponse, StreamChunk, TokenStream};

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn to_api_request(request: LlmRequest, stream: bool) -> ApiRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = request.system {
            messages.push(ApiMessage {
                role: "system".into(),
                content: Some(serde_json::Value::String(system)),
                tool_calls: None,
                tool_call_id: None,
            });
        }
        for msg in request.messages {
            messages.extend(to_api_messages(msg));
        }

        let tools: Vec<ApiTool> = request
            .tools
            .into_iter()
            .map(|t| ApiTool {
                r#type: "function".into(),
                function: ApiFunction {
                    name: t.name,
                    description: t.description,
                    parameters: t.input_schema,
                },
            })
            .collect();

        ApiRequest {
            model: request.model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            tools: if tools.is_empty() { None } else { Some(tools) },
            stream,
            stream_options: stream.then(|| StreamOptions {
                include_usage: true,
            }),
        }
    }
}

/// Chat messages carry tool use/result blocks in dedicated wire shapes:
/// assistant tool calls ride on `tool_calls`, results become `tool` role
/// messages keyed by `tool_call_id`.
fn to_api_messages(msg: crate::LlmMessage) -> Vec<ApiMessage> {
    let mut out = Vec::new();
    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in &msg.content {
        match block {
            ContentBlock::Text { text } => text_parts.push(text.clone()),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ApiToolCall {
                id: id.clone(),
                r#type: "function".into(),
                function: ApiToolCallFunction {
                    name: name.clone(),
                    arguments: input.to_string(),
                },
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => out.push(ApiMessage {
                role: "tool".into(),
                content: Some(serde_json::Value::String(content.clone())),
                tool_calls: None,
                tool_call_id: Some(tool_use_id.clone()),
            }),
        }
    }

    if !text_parts.is_empty() || !tool_calls.is_empty() {
        out.insert(
            0,
            ApiMessage {
                role: msg.role,
                content: if text_parts.is_empty() {
                    None
                } else {
                    Some(serde_json::Value::String(text_parts.join("\n")))
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
            },
        );
    }
    out
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", self.api_base);
        let payload = Self::to_api_request(request, false);

        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await.unwrap_or_default();
            return Err(format_api_error(status, &text));
        }

        let body: ApiResponse = resp.json().await?;
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("openai response had no choices"))?;

        let mut content = Vec::new();
        let text = choice.message.content.clone().unwrap_or_default();
        if !text.is_empty() {
            content.push(ContentBlock::Text { text: text.clone() });
        }
        for call in choice.message.tool_calls.unwrap_or_default() {
            let input = serde_json::from_str(&call.function.arguments)
                .unwrap_or(serde_json::Value::Null);
            content.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input,
            });
        }

        Ok(LlmResponse {
            text,
            content,
            input_tokens: body.usage.as_ref().map(|u| u.prompt_tokens),
            output_tokens: body.usage.as_ref().map(|u| u.completion_tokens),
            stop_reason: choice.finish_reason,
        })
    }

    async fn stream(&self, request: LlmRequest) -> Result<TokenStream> {
        let url = format!("{}/chat/completions", self.api_base);
        let payload = Self::to_api_request(request, true);

        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await.unwrap_or_default();
            return Err(format_api_error(status, &text));
        }

        Ok(Box::pin(parse_sse_stream(resp.bytes_stream())))
    }

    fn supports_transcription(&self) -> bool {
        true
    }

    async fn transcribe_audio(&self, audio: Vec<u8>, filename: &str) -> Result<String> {
        let url = format!("{}/audio/transcriptions", self.api_base);
        let part = reqwest::multipart::Part::bytes(audio).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .text("model", "whisper-1")
            .part("file", part);

        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await.unwrap_or_default();
            return Err(format_api_error(status, &text));
        }

        let body: TranscriptionResponse = resp.json().await?;
        Ok(body.text)
    }
}

fn parse_sse_stream(
    byte_stream: impl Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>>
        + Send
        + 'static,
) -> impl Stream<Item = Result<StreamChunk>> + Send {
    async_stream::stream! {
        tokio::pin!(byte_stream);
        let mut buffer = String::new();
        let mut prompt_tokens = None;
        let mut completion_tokens = None;
        let mut stop_reason = None;

        while let Some(chunk_result) = byte_stream.next().await {
            match chunk_result {
                Ok(bytes) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));

                    while let Some(pos) = buffer.find("\n\n") {
                        let event_text = buffer[..pos].to_string();
                        buffer = buffer[pos + 2..].to_string();

                        for line in event_text.lines() {
                            let Some(data) = line.strip_prefix("data: ") else {
                                continue;
                            };
                            if data == "[DONE]" {
                                yield Ok(StreamChunk {
                                    delta: String::new(),
                                    is_final: true,
                                    input_tokens: prompt_tokens,
                                    output_tokens: completion_tokens,
                                    stop_reason: stop_reason.take(),
                                });
                                return;
                            }

                            match serde_json::from_str::<serde_json::Value>(data) {
                                Ok(event) => {
                                    if let Some(usage) = event.get("usage") {
                                        prompt_tokens = usage
                                            .get("prompt_tokens")
                                            .and_then(|v| v.as_u64())
                                            .and_then(|v| u32::try_from(v).ok());
                                        completion_tokens = usage
                                            .get("completion_tokens")
                                            .and_then(|v| v.as_u64())
                                            .and_then(|v| u32::try_from(v).ok());
                                    }
                                    let choice = event
                                        .get("choices")
                                        .and_then(|c| c.get(0));
                                    if let Some(choice) = choice {
                                        if let Some(reason) = choice
                                            .get("finish_reason")
                                            .and_then(|v| v.as_str())
                                        {
                                            stop_reason = Some(reason.to_string());
                                        }
                                        let delta = choice
                                            .get("delta")
                                            .and_then(|d| d.get("content"))
                                            .and_then(|v| v.as_str());
                                        if let Some(delta) = delta {
                                            yield Ok(StreamChunk {
                                                delta: delta.to_string(),
                                                is_final: false,
                                                input_tokens: None,
                                                output_tokens: None,
                                                stop_reason: None,
                                            });
                                        }
                                    }
                                }
                                Err(e) => {
                                    yield Err(anyhow!("invalid sse event payload: {e}"));
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    yield Err(anyhow!("stream error: {e}"));
                    return;
                }
            }
        }
    }
}

fn format_api_error(status: StatusCode, body: &str) -> anyhow::Error {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string());
    anyhow!("openai api error ({status}): {message}")
}

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApiTool {
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize)]
struct ApiFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiToolCallFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCallFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}
