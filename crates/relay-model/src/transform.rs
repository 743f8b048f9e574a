// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Cross-provider message transform.
//!
//! Conversation history accumulated against one provider is not directly
//! replayable against another: tool-call ids follow a different grammar,
//! thinking blocks carry a model-specific signature, and some dialects
//! require structural stubs the history doesn't already contain. [`apply`]
//! runs the full ordered pipeline; the individual steps are exposed so
//! callers can run a subset (e.g. the agent loop already knows which turns
//! aborted and passes that in rather than re-deriving it here).

use std::collections::{HashMap, HashSet};

use crate::idgrammar::{rewrite_id, IdGrammar};
use crate::types::{Message, MessageContent};

/// Knobs the caller resolves once per destination model before replaying
/// history against it.
#[derive(Debug, Clone, Default)]
pub struct TransformOptions {
    /// Id grammar the destination provider requires.
    pub dest_grammar: IdGrammar,
    /// True when the destination model is the same model that produced the
    /// history (so thinking signatures remain valid and are kept as-is).
    pub same_model: bool,
    /// When stripping a cross-model thinking block, keep the plain text
    /// (converted to a Text message) instead of dropping the block entirely.
    /// Anthropic and Gemini both accept a prior turn's reasoning as plain
    /// text; some providers reject thinking content from another model
    /// outright and should pass `false`.
    pub keep_thinking_text: bool,
    /// True when the destination dialect requires an assistant stub message
    /// immediately after a run of tool results (observed on some OpenAI-
    /// compatible gateways that reject `tool` → `user` without an
    /// intervening `assistant` turn).
    pub requires_assistant_stub_after_tool_result: bool,
    /// Indices into the *original* `messages` slice that must be dropped
    /// because that turn's `stopReason` was `error` or the turn was
    /// cancelled mid-stream. Populated by the agent loop, which tracks this
    /// per-turn outcome that `Message` itself does not carry.
    pub dropped_turn_indices: HashSet<usize>,
}

/// Run the full ordered transform pipeline against `messages`.
pub fn apply(messages: Vec<Message>, opts: &TransformOptions) -> Vec<Message> {
    let messages = drop_errored_turns(messages, &opts.dropped_turn_indices);
    let messages = strip_cross_model_signatures(messages, opts.same_model, opts.keep_thinking_text);
    let messages = rewrite_tool_call_ids(messages, opts.dest_grammar);
    let messages = repair_orphan_tool_calls(messages);
    apply_dialect_requirements(messages, opts.requires_assistant_stub_after_tool_result)
}

/// Step 1: drop assistant messages (and any content) at `dropped_indices`,
/// indexed against the original `messages` ordering.
pub fn drop_errored_turns(messages: Vec<Message>, dropped_indices: &HashSet<usize>) -> Vec<Message> {
    if dropped_indices.is_empty() {
        return messages;
    }
    messages
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !dropped_indices.contains(i))
        .map(|(_, m)| m)
        .collect()
}

/// Step 2: strip thinking-block signatures that only authenticate a block
/// back to the model that produced it, whenever the destination is a
/// different model.
pub fn strip_cross_model_signatures(
    messages: Vec<Message>,
    same_model: bool,
    keep_thinking_text: bool,
) -> Vec<Message> {
    if same_model {
        return messages;
    }
    messages
        .into_iter()
        .map(|mut m| {
            m.content = match m.content {
                MessageContent::Thinking { text, .. } => {
                    if keep_thinking_text {
                        MessageContent::Thinking { text, signature: None }
                    } else {
                        MessageContent::Text(text)
                    }
                }
                other => other,
            };
            m
        })
        .collect()
}

/// Step 3: rewrite every `ToolCall.tool_call_id` to `grammar`, propagating
/// the same rewrite to the matching `ToolResult`.
pub fn rewrite_tool_call_ids(messages: Vec<Message>, grammar: IdGrammar) -> Vec<Message> {
    let mut id_map: HashMap<String, String> = HashMap::new();
    let mut counter: u32 = 0;
    messages
        .into_iter()
        .map(|mut m| {
            m.content = match m.content {
                MessageContent::ToolCall { tool_call_id, function } => {
                    let new_id = rewrite_id(&tool_call_id, grammar, counter);
                    counter += 1;
                    id_map.insert(tool_call_id, new_id.clone());
                    MessageContent::ToolCall { tool_call_id: new_id, function }
                }
                MessageContent::ToolResult { tool_call_id, content } => {
                    let new_id = id_map.get(&tool_call_id).cloned().unwrap_or(tool_call_id);
                    MessageContent::ToolResult { tool_call_id: new_id, content }
                }
                other => other,
            };
            m
        })
        .collect()
}

/// Step 4: insert a synthetic `ToolResult` for any `ToolCall` that has no
/// matching result later in the history (the call was interrupted before
/// the tool ran, or the run crashed between dispatch and completion).
pub fn repair_orphan_tool_calls(messages: Vec<Message>) -> Vec<Message> {
    let answered: HashSet<&str> = messages
        .iter()
        .filter_map(|m| match &m.content {
            MessageContent::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        })
        .collect();

    let mut out = Vec::with_capacity(messages.len());
    for m in messages {
        let orphan_id = match &m.content {
            MessageContent::ToolCall { tool_call_id, .. } if !answered.contains(tool_call_id.as_str()) => {
                Some(tool_call_id.clone())
            }
            _ => None,
        };
        out.push(m);
        if let Some(id) = orphan_id {
            out.push(Message::tool_result(id, "<call aborted>"));
        }
    }
    out
}

/// Step 5: inject the assistant stub some dialects require immediately after
/// a run of tool results, before the next non-tool-result message (or the
/// end of history).
pub fn apply_dialect_requirements(messages: Vec<Message>, requires_assistant_stub: bool) -> Vec<Message> {
    if !requires_assistant_stub {
        return messages;
    }
    let mut out = Vec::with_capacity(messages.len());
    let mut iter = messages.into_iter().peekable();
    while let Some(m) = iter.next() {
        let is_tool_result = matches!(m.content, MessageContent::ToolResult { .. });
        out.push(m);
        if is_tool_result {
            let next_is_tool_result =
                matches!(iter.peek().map(|n| &n.content), Some(MessageContent::ToolResult { .. }));
            if !next_is_tool_result {
                out.push(Message::assistant(""));
            }
        }
    }
    out
}

// ─── Tests ────────────────────────────────────────────────────────────────────
