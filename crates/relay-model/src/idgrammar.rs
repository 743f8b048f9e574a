// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-provider tool-call-id grammars.
//!
//! Every provider constrains the shape of the `id` it will accept back on a
//! tool result: a character set, a length cap, or (for OpenAI's Responses
//! API) a composite structure that has to be split apart and rejoined.  The
//! [`transform`](crate::transform) layer rewrites ids crossing a provider
//! boundary through [`rewrite_id`] so that every `ToolCall`/`ToolResult` pair
//! carries an id the destination actually accepts.

/// Identifies which grammar an id must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdGrammar {
    /// OpenAI Chat Completions: `call_` + up to 40 total chars, `[A-Za-z0-9_-]`.
    OpenAiCompletions,
    /// OpenAI Responses: pipe-separated composite `<item_id>|<call_id>`.
    OpenAiResponses,
    /// Anthropic: up to 64 chars, `[A-Za-z0-9_-]`.
    Anthropic,
    /// Mistral: exactly 9 alphanumeric characters.
    Mistral,
    /// Google: no native id; one is invented and kept stable for the turn.
    Google,
    /// No constraint beyond being a non-empty string (Bedrock, Cohere, mocks).
    #[default]
    Opaque,
}

const OPENAI_COMPLETIONS_MAX: usize = 40;
const ANTHROPIC_MAX: usize = 64;
const MISTRAL_LEN: usize = 9;

fn is_grammar_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Sanitize `raw` to characters the grammar allows, then cap its length.
fn sanitize_and_cap(raw: &str, max_len: usize) -> String {
    let cleaned: String = raw.chars().filter(|c| is_grammar_char(*c)).collect();
    let cleaned = if cleaned.is_empty() { "id".to_string() } else { cleaned };
    cleaned.chars().take(max_len).collect()
}

/// Rewrite `id` so it satisfies `grammar`, using `seed` (e.g. a stable hash of
/// the original id) to keep the rewrite deterministic and collision-resistant
/// when multiple ids sanitize down to the same prefix.
///
/// `counter` disambiguates ids that collide after sanitization (used by
/// [`IdGrammar::Google`], which has no native id of its own).
pub fn rewrite_id(id: &str, grammar: IdGrammar, counter: u32) -> String {
    match grammar {
        IdGrammar::OpenAiCompletions => {
            let capped = sanitize_and_cap(id, OPENAI_COMPLETIONS_MAX);
            capped
        }
        IdGrammar::OpenAiResponses => {
            // Compose `<item_id>|<call_id>`; if `id` is already composite, keep it.
            if id.contains('|') {
                id.to_string()
            } else {
                format!("item_{counter:08x}|{id}")
            }
        }
        IdGrammar::Anthropic => sanitize_and_cap(id, ANTHROPIC_MAX),
        IdGrammar::Mistral => {
            let cleaned = sanitize_and_cap(id, usize::MAX);
            let mut out: String = cleaned.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
            if out.len() < MISTRAL_LEN {
                // Pad deterministically from the counter so two distinct ids
                // that sanitize to the same short string don't collide.
                let pad = format!("{counter:x}");
                out.push_str(&pad);
            }
            out.chars().take(MISTRAL_LEN).collect::<String>()
        }
        IdGrammar::Google => invent_google_id(id, counter),
        IdGrammar::Opaque => id.to_string(),
    }
}

/// Invent a stable Google tool-call id from `name|timestamp|counter`.
///
/// Google's function-calling API has no id of its own; relay must invent one
/// that stays stable across the request/response round trip for a single
/// turn. `timestamp` is the turn's logical clock (not wall time, so the id
/// is reproducible across retries of the same turn).
pub fn invent_google_id(name: &str, counter: u32) -> String {
    format!("{name}|{counter}")
}

/// Split an OpenAI Responses composite id (`<item_id>|<call_id>`) into its
/// two parts. Returns `None` if `id` does not contain the separator.
pub fn split_responses_id(id: &str) -> Option<(&str, &str)> {
    id.split_once('|')
}

/// Rejoin a previously split OpenAI Responses composite id.
pub fn join_responses_id(item_id: &str, call_id: &str) -> String {
    format!("{item_id}|{call_id}")
}

/// Resolve the [`IdGrammar`] a provider id string corresponds to.
///
/// `provider` should be one of the `ModelConfig::provider` strings recognised
/// by [`crate::from_config`]; unrecognised values fall back to [`IdGrammar::Opaque`].
pub fn grammar_for_provider(provider: &str, responses_api: bool) -> IdGrammar {
    match provider {
        "openai" if responses_api => IdGrammar::OpenAiResponses,
        "openai" | "azure" => IdGrammar::OpenAiCompletions,
        "anthropic" => IdGrammar::Anthropic,
        "mistral" => IdGrammar::Mistral,
        "google" => IdGrammar::Google,
        _ => IdGrammar::Opaque,
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_completions_caps_at_40_chars() {
        let long_id = "a".repeat(80);
        let rewritten = rewrite_id(&long_id, IdGrammar::OpenAiCompletions, 0);
        assert_eq!(rewritten.len(), OPENAI_COMPLETIONS_MAX);
    }

    #[test]
    fn openai_completions_strips_disallowed_chars() {
        let rewritten = rewrite_id("call:123/abc", IdGrammar::OpenAiCompletions, 0);
        assert!(rewritten.chars().all(is_grammar_char));
    }

    #[test]
    fn anthropic_caps_at_64_chars() {
        let long_id = "x".repeat(100);
        let rewritten = rewrite_id(&long_id, IdGrammar::Anthropic, 0);
        assert_eq!(rewritten.len(), ANTHROPIC_MAX);
    }

    #[test]
    fn mistral_ids_are_exactly_nine_alphanumeric() {
        let rewritten = rewrite_id("call_abc", IdGrammar::Mistral, 7);
        assert_eq!(rewritten.len(), MISTRAL_LEN);
        assert!(rewritten.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn mistral_long_id_truncates_to_nine() {
        let long_id = "a".repeat(30);
        let rewritten = rewrite_id(&long_id, IdGrammar::Mistral, 0);
        assert_eq!(rewritten.len(), MISTRAL_LEN);
    }

    #[test]
    fn responses_id_round_trips_through_split_join() {
        let composite = rewrite_id("call_1", IdGrammar::OpenAiResponses, 42);
        let (item_id, call_id) = split_responses_id(&composite).expect("composite id");
        assert_eq!(call_id, "call_1");
        assert_eq!(join_responses_id(item_id, call_id), composite);
    }

    #[test]
    fn responses_id_passthrough_when_already_composite() {
        let composite = "item_1|call_2";
        let rewritten = rewrite_id(composite, IdGrammar::OpenAiResponses, 0);
        assert_eq!(rewritten, composite);
    }

    #[test]
    fn google_id_invented_from_name_and_counter() {
        let id = invent_google_id("read_file", 3);
        assert_eq!(id, "read_file|3");
    }

    #[test]
    fn opaque_grammar_passes_through_unchanged() {
        assert_eq!(rewrite_id("anything-goes_123", IdGrammar::Opaque, 0), "anything-goes_123");
    }

    #[test]
    fn grammar_for_provider_resolves_known_providers() {
        assert_eq!(grammar_for_provider("anthropic", false), IdGrammar::Anthropic);
        assert_eq!(grammar_for_provider("mistral", false), IdGrammar::Mistral);
        assert_eq!(grammar_for_provider("google", false), IdGrammar::Google);
        assert_eq!(grammar_for_provider("openai", false), IdGrammar::OpenAiCompletions);
        assert_eq!(grammar_for_provider("openai", true), IdGrammar::OpenAiResponses);
        assert_eq!(grammar_for_provider("cohere", false), IdGrammar::Opaque);
    }
}
