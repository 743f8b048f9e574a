// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use relay_config::AgentMode;
use relay_tools::{events::TodoItem, ToolCall};

/// Events emitted by the agent during a single turn.
/// Consumers (CI runner, TUI) subscribe to these to drive their output.
///
/// Maps onto the `agent_start | turn_start | message_start | message_update |
/// message_end | tool_execution_start | tool_execution_update |
/// tool_execution_end | turn_end | agent_end` event taxonomy as follows:
/// [`AgentEvent::AgentStart`] → `agent_start`, [`AgentEvent::TurnStart`] →
/// `turn_start`, [`AgentEvent::TextDelta`]/[`AgentEvent::ThinkingDelta`] →
/// `message_update`, [`AgentEvent::TextComplete`]/[`AgentEvent::ThinkingComplete`]
/// → `message_end`, [`AgentEvent::ToolCallStarted`] → `tool_execution_start`,
/// [`AgentEvent::ToolCallProgress`] → `tool_execution_update`,
/// [`AgentEvent::ToolCallFinished`] → `tool_execution_end`,
/// [`AgentEvent::TurnComplete`] → `turn_end`, [`AgentEvent::AgentEnd`] →
/// `agent_end`. `message_start` has no dedicated variant: the first
/// `TextDelta`/`ThinkingDelta` of a turn doubles as it.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The agent loop has started processing the session (emitted once,
    /// before the first turn).
    AgentStart,
    /// A new turn has begun (one user message through to its final
    /// `stopReason`).
    TurnStart,
    /// A text chunk streamed from the model
    TextDelta(String),
    /// A complete text response from the model (after streaming finishes)
    TextComplete(String),
    /// A thinking/reasoning chunk from the model (extended thinking API).
    /// Consumers should accumulate deltas and finalise them into a Thinking
    /// segment when the model signals the end of the reasoning block.
    ThinkingDelta(String),
    /// A complete thinking/reasoning block (accumulated from ThinkingDelta events).
    ThinkingComplete(String),
    /// The model has requested a tool call
    ToolCallStarted(ToolCall),
    /// Incremental progress from a long-running tool (e.g. a streamed bash
    /// command's stdout) before it finishes.
    ToolCallProgress {
        call_id: String,
        tool_name: String,
        partial_output: String,
    },
    /// A tool call finished
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// Context was compacted; statistics for the UI
    ContextCompacted {
        tokens_before: usize,
        tokens_after: usize,
        strategy: CompactionStrategyUsed,
        turn: u32,
    },
    /// Current token usage update
    TokenUsage {
        input: u32,
        output: u32,
        /// Tokens served from the provider's prompt cache this turn.
        cache_read: u32,
        /// Tokens written into the provider's prompt cache this turn.
        cache_write: u32,
        /// Running total of cache-read tokens across the whole session.
        cache_read_total: u32,
        /// Running total of cache-write tokens across the whole session.
        cache_write_total: u32,
        /// The session's context window size, for UI fraction display.
        max_tokens: usize,
    },
    /// The agent has finished processing the current user turn
    TurnComplete,
    /// The current turn was cancelled before it finished. `partial_text` is
    /// whatever assistant text had already streamed in before cancellation;
    /// it has already been committed to the session as an assistant message.
    Aborted { partial_text: String },
    /// A recoverable error occurred
    Error(String),
    /// The todo list was updated
    TodoUpdate(Vec<TodoItem>),
    /// The agent mode was changed
    ModeChanged(AgentMode),
    /// The agent is asking the user a question (id links to QuestionAnswer)
    Question { id: String, questions: Vec<String> },
    /// Answer to a previous Question event
    QuestionAnswer { id: String, answer: String },
    /// The agent loop has finished processing the session (emitted once,
    /// after the last turn completes or the loop is cancelled).
    AgentEnd,
}

/// Which compaction path actually ran, reported on [`AgentEvent::ContextCompacted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategyUsed {
    /// Rolling narrative summary (see [`crate::compact::compact_session`]).
    Narrative,
    /// Structured state-checkpoint summary.
    Structured,
    /// Deterministic drop-oldest fallback; no model call was made.
    Emergency,
}
