// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Runtime context for an agent session.
//!
//! This is separate from [`relay_config::AgentConfig`], which holds only
//! config-file fields.  [`AgentRuntimeContext`] carries values detected or
//! specified at runtime (project root, git/CI context, prompt overrides,
//! discovered skills).

use std::path::PathBuf;
use std::sync::Arc;

use relay_model::Message;
use relay_runtime::{SharedAgents, SharedSkills};

/// Extension point consulted by the agent loop whenever a turn ends without
/// a tool call (`stopReason != toolUse`), letting a driving process keep a
/// session going without needing a human in the loop.
pub trait AgentLoopHooks: Send + Sync {
    /// Messages to splice into the next turn to redirect the model before it
    /// settles on a final answer. Returning an empty vec is a no-op.
    fn steering_messages(&self) -> Vec<Message> {
        Vec::new()
    }

    /// Messages appended after a turn completes with no tool call, so the
    /// loop continues instead of returning control to the caller (used by
    /// workflow/subagent drivers that queue the next instruction
    /// automatically). Returning an empty vec lets the turn end normally.
    fn follow_up_messages(&self) -> Vec<Message> {
        Vec::new()
    }
}

/// Environment-detected context injected into an agent at construction time.
#[derive(Default, Clone)]
pub struct AgentRuntimeContext {
    /// Absolute path to the project root (found via `.git` walk-up).
    pub project_root: Option<PathBuf>,
    /// Pre-formatted git context block (branch, commit, dirty status).
    pub git_context_note: Option<String>,
    /// Pre-formatted CI environment context block.
    pub ci_context_note: Option<String>,
    /// Contents of the project context file (`.relay/context.md`, `AGENTS.md`, …).
    pub project_context_file: Option<String>,
    /// Text appended to the default system prompt (from `--append-system-prompt`).
    pub append_system_prompt: Option<String>,
    /// Full system prompt override (from `--system-prompt-file`).
    /// When set, replaces `AgentConfig::system_prompt` entirely.
    pub system_prompt_override: Option<String>,
    /// Skills discovered from the standard search hierarchy.
    ///
    /// Held as [`SharedSkills`] so the TUI can trigger a live refresh (via
    /// `/refresh`) and the next agent turn automatically picks up new skills
    /// when rebuilding the system prompt.
    pub skills: SharedSkills,
    /// Subagents discovered from the standard search hierarchy.
    ///
    /// Held as [`SharedAgents`] so the TUI can trigger a live refresh and the
    /// next agent turn picks up new subagents when rebuilding the system prompt.
    pub agents: SharedAgents,
    /// Optional driver-supplied hooks consulted after each tool-call-free
    /// turn. `None` for interactive use (TUI, plain CLI), where the turn
    /// ending is the expected behaviour.
    pub hooks: Option<Arc<dyn AgentLoopHooks>>,
}

impl std::fmt::Debug for AgentRuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntimeContext")
            .field("project_root", &self.project_root)
            .field("git_context_note", &self.git_context_note)
            .field("ci_context_note", &self.ci_context_note)
            .field("project_context_file", &self.project_context_file)
            .field("append_system_prompt", &self.append_system_prompt)
            .field("system_prompt_override", &self.system_prompt_override)
            .field("hooks", &self.hooks.is_some())
            .finish_non_exhaustive()
    }
}
