// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI Responses API driver (`POST /v1/responses`).
//!
//! The Responses API is OpenAI's newer, stateful-capable completion
//! endpoint. Unlike Chat Completions it has no single `id` per tool call:
//! every emitted item gets its own `item_id`, and the function call itself
//! carries a separate `call_id`. relay needs one stable string to round-trip
//! through [`crate::MessageContent::ToolCall`]/[`crate::MessageContent::ToolResult`],
//! so the two are joined with [`crate::idgrammar::join_responses_id`] into a
//! single composite id and split back apart with
//! [`crate::idgrammar::split_responses_id`] when building the next request.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    catalog::{static_catalog, ModelCatalogEntry},
    idgrammar::{join_responses_id, split_responses_id},
    provider::ResponseStream,
    CompletionRequest, MessageContent, ResponseEvent, Role, StopReason,
};

pub struct OpenAiResponsesProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAiResponsesProvider {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".into()),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for OpenAiResponsesProvider {
    fn name(&self) -> &str {
        "openai-responses"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelCatalogEntry>> {
        let mut entries: Vec<ModelCatalogEntry> = static_catalog()
            .into_iter()
            .filter(|e| e.provider == "openai")
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let key = self.api_key.as_deref().context("OPENAI_API_KEY not set")?;

        let input = build_responses_input(&req.messages);
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "input": input,
            "max_output_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream": req.stream,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(model = %self.model, "sending openai responses request");

        let resp = self
            .client
            .post(format!("{}/responses", self.base_url))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .context("OpenAI Responses request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("OpenAI Responses error {status}: {text}");
        }

        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let text = match chunk {
                    Ok(b) => String::from_utf8_lossy(&b).to_string(),
                    Err(e) => {
                        return futures::future::ready(Some(vec![Err(anyhow::anyhow!(e))]));
                    }
                };
                buf.push_str(&text);
                let mut events = Vec::new();
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data: ") {
                        let data = data.trim();
                        if data == "[DONE]" {
                            continue;
                        }
                        if let Ok(v) = serde_json::from_str::<Value>(data) {
                            if let Some(ev) = parse_responses_event(&v) {
                                events.push(ev);
                            }
                        }
                    }
                }
                futures::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Build the Responses API `input` array from canonical messages.
fn build_responses_input(messages: &[crate::Message]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len());
    for m in messages {
        match &m.content {
            MessageContent::Text(t) => {
                out.push(json!({ "role": role_str(&m.role), "content": t }));
            }
            MessageContent::ContentParts(parts) => {
                let content: Vec<Value> = parts
                    .iter()
                    .map(|p| match p {
                        crate::ContentPart::Text { text } => json!({ "type": "input_text", "text": text }),
                        crate::ContentPart::Image { image_url, .. } => {
                            json!({ "type": "input_image", "image_url": image_url })
                        }
                    })
                    .collect();
                out.push(json!({ "role": role_str(&m.role), "content": content }));
            }
            MessageContent::ToolCall { tool_call_id, function } => {
                let (item_id, call_id) = split_responses_id(tool_call_id).unwrap_or(("", tool_call_id.as_str()));
                out.push(json!({
                    "type": "function_call",
                    "id": item_id,
                    "call_id": call_id,
                    "name": function.name,
                    "arguments": function.arguments,
                }));
            }
            MessageContent::ToolResult { tool_call_id, content } => {
                let (_, call_id) = split_responses_id(tool_call_id).unwrap_or(("", tool_call_id.as_str()));
                out.push(json!({
                    "type": "function_call_output",
                    "call_id": call_id,
                    "output": content.to_string(),
                }));
            }
            MessageContent::Thinking { text, .. } => {
                out.push(json!({ "role": role_str(&m.role), "content": text }));
            }
            MessageContent::Collaborator { text, .. } => {
                out.push(json!({ "role": role_str(&m.role), "content": text }));
            }
        }
    }
    out
}

fn role_str(role: &Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "user",
    }
}

fn responses_stop_reason(status: &str) -> StopReason {
    match status {
        "completed" => StopReason::EndTurn,
        "incomplete" => StopReason::MaxTokens,
        _ => StopReason::Error,
    }
}

/// Parse a single Responses API SSE event into a canonical [`ResponseEvent`].
///
/// Returns `None` for event types relay does not surface (e.g. the
/// `response.created` bookkeeping event).
fn parse_responses_event(v: &Value) -> Option<anyhow::Result<ResponseEvent>> {
    let event_type = v["type"].as_str().unwrap_or("");
    match event_type {
        "response.output_text.delta" => {
            let text = v["delta"].as_str().unwrap_or("").to_string();
            Some(Ok(ResponseEvent::TextDelta(text)))
        }
        "response.reasoning_summary_text.delta" => {
            let text = v["delta"].as_str().unwrap_or("").to_string();
            Some(Ok(ResponseEvent::ThinkingDelta(text)))
        }
        "response.output_item.added" => {
            let item = &v["item"];
            if item["type"].as_str() == Some("function_call") {
                let index = v["output_index"].as_u64().unwrap_or(0) as u32;
                let item_id = item["id"].as_str().unwrap_or("");
                let call_id = item["call_id"].as_str().unwrap_or("");
                let composite = join_responses_id(item_id, call_id);
                let name = item["name"].as_str().unwrap_or("").to_string();
                Some(Ok(ResponseEvent::ToolCall { index, id: composite, name, arguments: String::new() }))
            } else {
                None
            }
        }
        "response.function_call_arguments.delta" => {
            let index = v["output_index"].as_u64().unwrap_or(0) as u32;
            let delta = v["delta"].as_str().unwrap_or("").to_string();
            Some(Ok(ResponseEvent::ToolCall { index, id: String::new(), name: String::new(), arguments: delta }))
        }
        "response.completed" => {
            let usage = &v["response"]["usage"];
            let status = v["response"]["status"].as_str().unwrap_or("completed");
            Some(Ok(ResponseEvent::Usage {
                input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
                cache_read_tokens: usage["input_tokens_details"]["cached_tokens"].as_u64().unwrap_or(0) as u32,
                cache_write_tokens: 0,
                stop_reason: Some(responses_stop_reason(status)),
            }))
        }
        "response.failed" | "response.incomplete" => {
            let msg = v["response"]["error"]["message"].as_str().unwrap_or("response failed").to_string();
            Some(Ok(ResponseEvent::Error(msg)))
        }
        _ => None,
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FunctionCall, Message};

    #[test]
    fn build_input_splits_composite_tool_call_id() {
        let composite = join_responses_id("item_1", "call_1");
        let messages = vec![Message {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id: composite,
                function: FunctionCall { name: "read_file".into(), arguments: "{}".into() },
            },
        }];
        let input = build_responses_input(&messages);
        assert_eq!(input[0]["type"], "function_call");
        assert_eq!(input[0]["id"], "item_1");
        assert_eq!(input[0]["call_id"], "call_1");
    }

    #[test]
    fn build_input_tool_result_uses_call_id_half() {
        let composite = join_responses_id("item_1", "call_1");
        let messages = vec![Message::tool_result(composite, "output")];
        let input = build_responses_input(&messages);
        assert_eq!(input[0]["type"], "function_call_output");
        assert_eq!(input[0]["call_id"], "call_1");
    }

    #[test]
    fn parses_text_delta() {
        let v = json!({ "type": "response.output_text.delta", "delta": "hello" });
        let ev = parse_responses_event(&v).unwrap().unwrap();
        assert!(matches!(ev, ResponseEvent::TextDelta(t) if t == "hello"));
    }

    #[test]
    fn parses_function_call_added_joins_composite_id() {
        let v = json!({
            "type": "response.output_item.added",
            "output_index": 0,
            "item": { "type": "function_call", "id": "item_9", "call_id": "call_9", "name": "grep" },
        });
        let ev = parse_responses_event(&v).unwrap().unwrap();
        match ev {
            ResponseEvent::ToolCall { id, name, .. } => {
                assert_eq!(id, "item_9|call_9");
                assert_eq!(name, "grep");
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn parses_completed_usage_with_stop_reason() {
        let v = json!({
            "type": "response.completed",
            "response": {
                "status": "completed",
                "usage": { "input_tokens": 10, "output_tokens": 5, "input_tokens_details": { "cached_tokens": 2 } },
            },
        });
        let ev = parse_responses_event(&v).unwrap().unwrap();
        match ev {
            ResponseEvent::Usage { input_tokens, output_tokens, cache_read_tokens, stop_reason, .. } => {
                assert_eq!(input_tokens, 10);
                assert_eq!(output_tokens, 5);
                assert_eq!(cache_read_tokens, 2);
                assert_eq!(stop_reason, Some(StopReason::EndTurn));
            }
            other => panic!("expected Usage, got {other:?}"),
        }
    }

    #[test]
    fn unrecognised_event_type_is_ignored() {
        let v = json!({ "type": "response.created" });
        assert!(parse_responses_event(&v).is_none());
    }
}
