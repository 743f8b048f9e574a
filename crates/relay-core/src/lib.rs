// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod compact;
mod events;
mod prompts;
mod runtime_context;
mod session;

pub use agent::Agent;
pub use compact::{
    compact_session, compact_session_with_strategy, dedupe_file_operations, emergency_compact,
    find_cut_point, find_cut_point_messages, render_file_op_ledger, smart_truncate,
    splice_branch_summary, FileOpKind, FileOpRecord,
};
pub use events::{AgentEvent, CompactionStrategyUsed};
pub use prompts::system_prompt;
pub use runtime_context::{AgentLoopHooks, AgentRuntimeContext};
pub use session::{Session, SessionEntry, SessionEntryPayload};
