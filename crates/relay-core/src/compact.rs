// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use relay_config::CompactionStrategy;
use relay_model::{Message, MessageContent, Role};
use relay_tools::OutputCategory;

use crate::session::{Session, SessionEntry, SessionEntryPayload};

// ─── Cut-point search ──────────────────────────────────────────────────────────

/// Names of the built-in tools that touch a file on disk, and the JSON
/// argument key holding the path. Kept as a small table rather than a match
/// on every call site so adding a new file-mutating tool is a one-line change.
const WRITE_TOOLS: &[&str] = &["write", "edit_file", "delete_file"];
const READ_TOOLS: &[&str] = &["read_file", "read_image"];

/// Rough token cost of a non-conversational entry (model/thinking-level
/// changes, labels, checkpoints). These carry little text, so a flat
/// estimate is adequate for budget accounting — unlike [`Message`] content,
/// which uses the calibrated `approx_tokens` heuristic.
const METADATA_ENTRY_TOKENS: usize = 8;

fn entry_tokens(entry: &SessionEntry) -> usize {
    match &entry.payload {
        SessionEntryPayload::SessionMessage { message } => message.approx_tokens(),
        SessionEntryPayload::BranchSummary { summary, .. } => (summary.len() / 4).max(1),
        SessionEntryPayload::CustomMessage { text, .. } => (text.len() / 4).max(1),
        SessionEntryPayload::Label { text } => (text.len() / 4).max(1),
        _ => METADATA_ENTRY_TOKENS,
    }
}

/// An assistant `SessionMessage` entry carrying a tool call must stay in the
/// same dispatch as the `ToolResult` entry that answers it — splitting them
/// across the cut point would send the provider an unanswered tool call.
fn is_tool_result(entry: &SessionEntry) -> bool {
    matches!(
        &entry.payload,
        SessionEntryPayload::SessionMessage { message }
            if matches!(message.content, MessageContent::ToolResult { .. })
    )
}

/// Token-budget variant of [`find_cut_point`] operating directly on a flat
/// message list (what the agent loop actually holds in memory) rather than
/// the session's persisted entry log. Same semantics: walk newest→oldest
/// accumulating `approx_tokens`, stop at the oldest message whose suffix
/// still fits `budget_tokens`, and never split a `ToolCall` from its
/// `ToolResult`.
pub fn find_cut_point_messages(messages: &[Message], budget_tokens: usize) -> usize {
    if messages.is_empty() {
        return 0;
    }
    let mut suffix_sum = 0usize;
    let mut cut = messages.len();
    for i in (0..messages.len()).rev() {
        let next_sum = suffix_sum + messages[i].approx_tokens();
        if next_sum > budget_tokens {
            break;
        }
        suffix_sum = next_sum;
        cut = i;
    }
    while cut > 0 && cut < messages.len() {
        match &messages[cut].content {
            MessageContent::ToolResult { .. } | MessageContent::ToolCall { .. } => cut -= 1,
            _ => break,
        }
    }
    cut
}

/// Find the index of the oldest entry that should be kept in the post-compaction
/// suffix: walk entries oldest→newest, accumulate token estimates, and return
/// the earliest index whose suffix (that entry through the end) still fits
/// within `context_window - reserve_tokens`. Never returns an index that would
/// split an assistant↔toolResult pair — if the computed cut lands on a
/// `ToolResult` entry, it is pulled back to include the preceding entry that
/// produced the matching tool call.
///
/// Returns `entries.len()` (an empty suffix) if even the single most recent
/// entry does not fit the budget, and `0` if the whole log fits.
pub fn find_cut_point(entries: &[SessionEntry], context_window: usize, reserve_tokens: usize) -> usize {
    let budget = context_window.saturating_sub(reserve_tokens);
    if entries.is_empty() {
        return 0;
    }
    let mut suffix_sum = 0usize;
    let mut cut = entries.len();
    for i in (0..entries.len()).rev() {
        let next_sum = suffix_sum + entry_tokens(&entries[i]);
        if next_sum > budget {
            break;
        }
        suffix_sum = next_sum;
        cut = i;
    }
    while cut > 0 && cut < entries.len() && is_tool_result(&entries[cut]) {
        cut -= 1;
    }
    cut
}

// ─── File-operation deduplication ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOpKind {
    /// The file was read but (in the window examined) never subsequently
    /// written; its content may still be relevant to the live context.
    ReadOnly,
    /// The file's last mutation in the window examined; earlier writes to
    /// the same path are dropped as superseded.
    LastWrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOpRecord {
    pub path: String,
    pub kind: FileOpKind,
}

fn tool_call_path(message: &Message, names: &[&str]) -> Option<String> {
    let MessageContent::ToolCall { function, .. } = &message.content else {
        return None;
    };
    if !names.contains(&function.name.as_str()) {
        return None;
    }
    let args: serde_json::Value = serde_json::from_str(&function.arguments).ok()?;
    args.get("path")?.as_str().map(|s| s.to_string())
}

/// Build the deduplicated file-operation ledger for the entries preceding a
/// compaction cut point (§4.7 step 2): keep only the last write/edit per
/// path, and any reads whose file was never subsequently written.
///
/// Entries are scanned oldest→newest so "last write" means last in
/// conversation order, matching what the model actually ended up with on
/// disk.
pub fn dedupe_file_operations(messages: &[Message]) -> Vec<FileOpRecord> {
    let mut last_write_index: HashMap<String, usize> = HashMap::new();
    let mut read_only: Vec<String> = Vec::new();

    for (i, m) in messages.iter().enumerate() {
        if let Some(path) = tool_call_path(m, WRITE_TOOLS) {
            last_write_index.insert(path, i);
        } else if let Some(path) = tool_call_path(m, READ_TOOLS) {
            if !last_write_index.contains_key(&path) {
                read_only.push(path);
            }
        }
    }

    // A read can precede the write that supersedes it (read-then-edit is the
    // common pattern) — drop any read whose path was written at all, not just
    // written before the read.
    read_only.retain(|p| !last_write_index.contains_key(p));
    read_only.dedup();

    let mut writes: Vec<(usize, String)> = last_write_index
        .into_iter()
        .map(|(path, idx)| (idx, path))
        .collect();
    writes.sort_by_key(|(idx, _)| *idx);

    writes
        .into_iter()
        .map(|(_, path)| FileOpRecord { path, kind: FileOpKind::LastWrite })
        .chain(read_only.into_iter().map(|path| FileOpRecord { path, kind: FileOpKind::ReadOnly }))
        .collect()
}

/// Render the file-operation ledger as plain text for inclusion in the
/// compaction-summary prompt.
pub fn render_file_op_ledger(ops: &[FileOpRecord]) -> String {
    if ops.is_empty() {
        return String::new();
    }
    let mut out = String::from("Files touched in the compacted history:\n");
    for op in ops {
        let marker = match op.kind {
            FileOpKind::LastWrite => "written",
            FileOpKind::ReadOnly => "read-only",
        };
        out.push_str(&format!("- {} ({marker})\n", op.path));
    }
    out
}

// ─── Branch-summary placement ──────────────────────────────────────────────────

/// Splice a compaction summary into the session's entry log immediately
/// before the preserved suffix (§4.7 steps 3-4): append a
/// [`SessionEntryPayload::BranchSummary`] entry, then rebuild the dispatch-
/// ready `messages` list as `[summary, ...suffix]`. The pre-cut entries
/// remain in the log untouched — compaction only changes what is
/// re-transmitted on the next dispatch, not what was recorded.
pub fn splice_branch_summary(
    session: &mut Session,
    cut_index: usize,
    summary: String,
) -> anyhow::Result<()> {
    let suffix_messages: Vec<Message> = session.entries[cut_index..]
        .iter()
        .filter_map(|e| match &e.payload {
            SessionEntryPayload::SessionMessage { message } => Some(message.clone()),
            _ => None,
        })
        .collect();

    let branch = session.current_branch.clone();
    session.append_entry(SessionEntryPayload::BranchSummary {
        branch,
        summary: summary.clone(),
    })?;

    let mut new_messages = Vec::with_capacity(suffix_messages.len() + 1);
    new_messages.push(Message::assistant(summary));
    new_messages.extend(suffix_messages);
    session.replace_messages(new_messages);
    Ok(())
}

// ─── Compaction prompts ───────────────────────────────────────────────────────

const SUMMARIZE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve all technical details, decisions, file \
     names, code snippets, and tool outputs that may be relevant to future work. \
     The summary will replace the original history to free up context space.";

const STRUCTURED_COMPACTION_PROMPT: &str = "\
You are a context compaction assistant for a software engineering agent. \
Produce a structured state checkpoint from the conversation history below. \
Use EXACTLY the following Markdown sections — do not add or remove sections. \
Be information-dense: preserve file paths, function names, error messages, \
code snippets, test names, and technical decisions verbatim where they matter.

## Active Task
Describe in 1-3 sentences what the agent is currently working on.

## Key Decisions & Rationale
List every significant technical decision made and why (bullet points). \
Include file or component names.

## Files & Artifacts
List every file that was read, modified, or created, with a brief note on what was done.

## Constraints & Requirements
List every requirement, constraint, or user preference that must be preserved.

## Pending Items
List every unfinished subtask or open question.

## Session Narrative
Write a dense technical summary (2-5 paragraphs) of what happened, \
capturing the essential flow of events, tool outputs, and reasoning. \
Focus on facts the agent will need to continue correctly.";

// ─── Public API ───────────────────────────────────────────────────────────────

/// Replace the conversation history with a single summarisation request using
/// the legacy narrative strategy.  Kept for backward compatibility and direct
/// use in tests; prefer [`compact_session_with_strategy`] for new callers.
pub fn compact_session(messages: &mut Vec<Message>, system_msg: Option<Message>) -> usize {
    compact_session_with_strategy(messages, system_msg, &CompactionStrategy::Narrative)
}

/// Strategy-aware compaction: restructures the message list so that the model
/// will produce a summary (or structured checkpoint) on the next turn.
///
/// The caller is responsible for actually invoking the model and rebuilding
/// the session from the resulting summary text.  This function only rewrites
/// the `messages` list to contain the compaction prompt.
pub fn compact_session_with_strategy(
    messages: &mut Vec<Message>,
    system_msg: Option<Message>,
    strategy: &CompactionStrategy,
) -> usize {
    let before = messages.len();
    let prompt = match strategy {
        CompactionStrategy::Structured => STRUCTURED_COMPACTION_PROMPT,
        CompactionStrategy::Narrative => SUMMARIZE_PROMPT,
    };
    let history_text = serialize_history(messages);
    let summary_request = Message::user(format!("{prompt}\n\n---\n\n{history_text}"));
    messages.clear();
    if let Some(sys) = system_msg {
        messages.push(sys);
    }
    messages.push(summary_request);
    before
}

/// Emergency fallback compaction used when the session is too large to fit even
/// a compaction prompt within the context window.
///
/// Drops all but the last `keep_n` non-system messages and prepends a canned
/// notice.  No model call is made — this is a purely deterministic operation
/// that always succeeds regardless of session size.
pub fn emergency_compact(
    messages: &mut Vec<Message>,
    system_msg: Option<Message>,
    keep_n: usize,
) -> usize {
    let before = messages.len();
    let non_system: Vec<Message> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();
    let keep = keep_n.min(non_system.len());
    let preserved: Vec<Message> = non_system[non_system.len() - keep..].to_vec();
    let notice = Message::assistant(
        "[Context emergency-compacted: earlier history was dropped to prevent a \
         context-window overflow. The agent may lack full context for earlier \
         decisions. Proceed carefully and ask the user to re-provide any missing \
         requirements if needed.]",
    );
    messages.clear();
    if let Some(sys) = system_msg {
        messages.push(sys);
    }
    messages.push(notice);
    messages.extend(preserved);
    before
}

/// Deterministic, content-aware tool-result truncation.
///
/// Returns `content` unchanged when it fits within `cap_tokens`.
/// Otherwise applies a category-specific extraction strategy that preserves
/// the most useful portion of the output.  Dispatching on [`OutputCategory`]
/// (not on tool names) keeps this function independent of the tools crate's
/// concrete tool list; each tool declares its own category.
///
/// - [`OutputCategory::HeadTail`]: keep the first 60 + last 40 lines so both
///   the command preamble and the final result are visible.
/// - [`OutputCategory::MatchList`]: keep leading matches (highest relevance
///   first); the tail is not preserved because later matches are less relevant.
/// - [`OutputCategory::FileContent`]: balanced head + tail with a separator,
///   preserving both the imports/declarations and the most recent changes.
/// - [`OutputCategory::Generic`]: hard-truncate at the nearest line boundary.
///
/// Every truncated result ends with an explicit notice so the model knows
/// that additional content exists and how to retrieve it.
pub fn smart_truncate(content: &str, category: OutputCategory, cap_tokens: usize) -> String {
    if cap_tokens == 0 {
        return content.to_string();
    }
    let cap_chars = cap_tokens * 4;
    if content.len() <= cap_chars {
        return content.to_string();
    }
    let omitted_bytes = content.len().saturating_sub(cap_chars);
    match category {
        OutputCategory::HeadTail => head_tail_lines(
            content,
            cap_chars,
            60,
            40,
            &format!("[... {{lines}} lines / {omitted_bytes} bytes omitted ...]"),
        ),
        OutputCategory::MatchList => head_lines(
            content,
            cap_chars,
            &format!(
                "[... {{lines}} more matches omitted ({omitted_bytes} bytes); \
                     use a more specific pattern to see them ...]"
            ),
        ),
        OutputCategory::FileContent => head_tail_lines(
            content,
            cap_chars,
            usize::MAX,
            usize::MAX,
            &format!(
                "[... {{lines}} lines omitted ({omitted_bytes} bytes); \
                     use read_file with offset/limit to see more ...]"
            ),
        ),
        OutputCategory::Generic => {
            let cut = content[..cap_chars]
                .rfind('\n')
                .map(|p| p + 1)
                .unwrap_or(cap_chars);
            format!(
                "{}\n[... {omitted_bytes} bytes omitted; \
                 content truncated to fit context budget ...]",
                &content[..cut]
            )
        }
    }
}

// ─── Private helpers ──────────────────────────────────────────────────────────

/// Serialise a message list into plain text for inclusion in a compaction prompt.
fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| !matches!(m.role, Role::System))
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
                Role::System => "System",
            };
            let text = match &m.content {
                relay_model::MessageContent::Text(t) => t.clone(),
                relay_model::MessageContent::ContentParts(parts) => parts
                    .iter()
                    .map(|p| match p {
                        relay_model::ContentPart::Text { text } => text.clone(),
                        relay_model::ContentPart::Image { .. } => "[image]".to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
                relay_model::MessageContent::ToolCall { function, .. } => {
                    format!("[tool_call: {}({})]", function.name, function.arguments)
                }
                relay_model::MessageContent::ToolResult { content, .. } => {
                    format!("[tool_result: {content}]")
                }
                relay_model::MessageContent::Thinking { text, .. } => {
                    format!("[thinking: {text}]")
                }
                relay_model::MessageContent::Collaborator { kind, text } => {
                    format!("[{kind:?}: {text}]")
                }
            };
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Keep only the leading lines that fit within `cap_chars`.
fn head_lines(content: &str, cap_chars: usize, notice_template: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let mut kept = String::with_capacity(cap_chars);
    let mut kept_count = 0usize;
    for line in &lines {
        let needed = if kept.is_empty() {
            line.len()
        } else {
            line.len() + 1
        };
        if kept.len() + needed > cap_chars {
            break;
        }
        if !kept.is_empty() {
            kept.push('\n');
        }
        kept.push_str(line);
        kept_count += 1;
    }
    let omitted = lines.len().saturating_sub(kept_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{kept}\n{notice}")
}

/// Keep `max_head` leading lines and `max_tail` trailing lines, inserting a
/// notice between them.  Pass `usize::MAX` to split evenly by character budget.
fn head_tail_lines(
    content: &str,
    cap_chars: usize,
    max_head: usize,
    max_tail: usize,
    notice_template: &str,
) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let half_cap = cap_chars / 2;

    // Head
    let mut head = String::with_capacity(half_cap);
    let mut head_count = 0usize;
    for line in lines.iter().take(max_head) {
        let needed = if head.is_empty() {
            line.len()
        } else {
            line.len() + 1
        };
        if head.len() + needed > half_cap {
            break;
        }
        if !head.is_empty() {
            head.push('\n');
        }
        head.push_str(line);
        head_count += 1;
    }

    // Tail (collect from the end)
    let mut tail_lines: Vec<&str> = Vec::new();
    let mut tail_chars = 0usize;
    for line in lines.iter().rev().take(max_tail) {
        let needed = if tail_lines.is_empty() {
            line.len()
        } else {
            line.len() + 1
        };
        if tail_chars + needed > half_cap {
            break;
        }
        tail_chars += needed;
        tail_lines.push(line);
    }
    tail_lines.reverse();
    let tail_count = tail_lines.len();
    let tail = tail_lines.join("\n");

    let omitted = lines.len().saturating_sub(head_count + tail_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{head}\n{notice}\n{tail}")
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
