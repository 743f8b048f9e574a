// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use relay_model::Message;

/// Current on-disk schema version. Bumped whenever [`SessionEntry`]'s shape
/// changes; [`migrate_value`] upgrades older records in place on load.
pub const SCHEMA_VERSION: u32 = 3;

/// One node in the session tree. Entries form a forest: every non-root entry
/// names its `parent_id`, and `Session::current_branch` tracks which leaf
/// chain is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub v: u32,
    pub id: String,
    #[serde(rename = "parentId")]
    pub parent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: SessionEntryPayload,
}

/// The tagged variants a session entry can carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SessionEntryPayload {
    SessionMessage { message: Message },
    ModelChange { provider: String, model: String },
    ThinkingLevelChange { level: String },
    Compaction { tokens_before: usize, tokens_after: usize },
    BranchSummary { branch: String, summary: String },
    CustomMessage { role: String, text: String },
    Custom { label: String, data: serde_json::Value },
    Label { text: String },
    SessionInfo { name: String },
}

/// Upgrade one decoded JSON line through the migration ladder, in place.
///
/// V1 → V2: attach `id`/`parentId`, chaining each record onto the previous
/// one read from the same file (a linear parent chain — V1 logs predate
/// branching). V2 → V3: rename the `hookMessage` kind to `custom`.
fn migrate_value(value: &mut serde_json::Value, prev_id: &Option<String>) {
    let v = value.get("v").and_then(|x| x.as_u64()).unwrap_or(1);
    if v < 2 {
        value["id"] = serde_json::Value::String(Uuid::new_v4().to_string());
        value["parentId"] = match prev_id {
            Some(p) => serde_json::Value::String(p.clone()),
            None => serde_json::Value::Null,
        };
        value["v"] = serde_json::Value::from(2u32);
    }
    let v = value.get("v").and_then(|x| x.as_u64()).unwrap_or(2);
    if v < 3 {
        if value.get("kind").and_then(|k| k.as_str()) == Some("hookMessage") {
            value["kind"] = serde_json::Value::String("custom".to_string());
        }
        value["v"] = serde_json::Value::from(3u32);
    }
}

fn parse_jsonl(content: &str) -> anyhow::Result<Vec<SessionEntry>> {
    let mut entries = Vec::new();
    let mut prev_id: Option<String> = None;
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut value: serde_json::Value = serde_json::from_str(line)
            .with_context(|| format!("parsing session log line {}", lineno + 1))?;
        migrate_value(&mut value, &prev_id);
        let entry: SessionEntry = serde_json::from_value(value)
            .with_context(|| format!("decoding migrated session log line {}", lineno + 1))?;
        prev_id = Some(entry.id.clone());
        entries.push(entry);
    }
    Ok(entries)
}

const MAIN_BRANCH: &str = "main";

/// An agent conversation session: an append-only log of [`SessionEntry`]
/// records (persisted as line-delimited JSON when a log path is set) plus the
/// flattened `Vec<Message>` view the agent loop actually dispatches.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    /// Approximate total token count for the current message list
    pub token_count: usize,
    /// Maximum context tokens (set from model config / provider limits)
    pub max_tokens: usize,
    /// Reserved output budget (from the model catalog's `maxTokens`),
    /// subtracted from `max_tokens` by [`Session::input_budget`].
    pub max_output_tokens: usize,
    /// Estimated token cost of the current tool schemas + dynamic context,
    /// recomputed by the agent loop whenever the active mode or skill set
    /// changes. Subtracted from `max_tokens` by [`Session::input_budget`].
    pub schema_overhead: usize,
    /// Correction factor applied to the chars/4 `approx_tokens` estimate,
    /// updated from the provider's actually-reported input token count via
    /// [`Session::update_calibration`] after each turn.
    pub calibration_factor: f32,
    /// Running total of prompt-cache-read tokens across the session.
    pub cache_read_total: u32,
    /// Running total of prompt-cache-write tokens across the session.
    pub cache_write_total: u32,

    /// Full entry log, in file order (not necessarily current-branch order).
    pub entries: Vec<SessionEntry>,
    /// Name of the active branch; new entries are appended as children of
    /// this branch's head.
    pub current_branch: String,
    /// Branch name → id of its most recent entry (`None` for an empty branch).
    branch_heads: HashMap<String, Option<String>>,
    log_path: Option<PathBuf>,
}

impl Session {
    pub fn new(max_tokens: usize) -> Self {
        let now = Utc::now();
        let mut branch_heads = HashMap::new();
        branch_heads.insert(MAIN_BRANCH.to_string(), None);
        Self {
            id: Uuid::new_v4().to_string(),
            name: None,
            created_at: now,
            modified_at: now,
            messages: Vec::new(),
            token_count: 0,
            max_tokens,
            max_output_tokens: 0,
            schema_overhead: 0,
            calibration_factor: 1.0,
            cache_read_total: 0,
            cache_write_total: 0,
            entries: Vec::new(),
            current_branch: MAIN_BRANCH.to_string(),
            branch_heads,
            log_path: None,
        }
    }

    /// Attach an append-only log file to this session. Every subsequent
    /// [`Session::push`]/[`Session::append_entry`] call is flushed to it as
    /// one JSON line. Does not read existing content — use [`Session::open`]
    /// to resume a previously logged session.
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Load a session from an existing line-delimited JSON log, replaying the
    /// migration ladder on each record and reconstructing the flattened
    /// message list for the active (`main`) branch chain.
    pub fn open(path: impl Into<PathBuf>, max_tokens: usize) -> anyhow::Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading session log {}", path.display()))?;
        let entries = parse_jsonl(&content)?;

        let mut branch_heads: HashMap<String, Option<String>> = HashMap::new();
        branch_heads.insert(MAIN_BRANCH.to_string(), None);
        let mut messages = Vec::new();
        let mut name = None;
        for entry in &entries {
            branch_heads.insert(MAIN_BRANCH.to_string(), Some(entry.id.clone()));
            match &entry.payload {
                SessionEntryPayload::SessionMessage { message } => {
                    messages.push(message.clone());
                }
                SessionEntryPayload::SessionInfo { name: n } => {
                    name = Some(n.clone());
                }
                _ => {}
            }
        }

        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();
        let token_count = messages.iter().map(|m| m.approx_tokens()).sum();

        Ok(Self {
            id,
            name,
            created_at: entries.first().map(|e| e.timestamp).unwrap_or(now),
            modified_at: entries.last().map(|e| e.timestamp).unwrap_or(now),
            messages,
            token_count,
            max_tokens,
            max_output_tokens: 0,
            schema_overhead: 0,
            calibration_factor: 1.0,
            cache_read_total: 0,
            cache_write_total: 0,
            entries,
            current_branch: MAIN_BRANCH.to_string(),
            branch_heads,
            log_path: Some(path),
        })
    }

    /// Effective input-token budget: the context window minus the reserved
    /// output budget and the current tool-schema/dynamic-context overhead.
    pub fn input_budget(&self) -> usize {
        self.max_tokens
            .saturating_sub(self.max_output_tokens)
            .saturating_sub(self.schema_overhead)
    }

    /// Record cache-read/cache-write tokens reported for the turn just
    /// completed, accumulating into the session-wide running totals.
    pub fn add_cache_usage(&mut self, cache_read: u32, cache_write: u32) {
        self.cache_read_total += cache_read;
        self.cache_write_total += cache_write;
    }

    /// Nudge `calibration_factor` towards the ratio of a provider's actual
    /// reported input-token count to this session's `chars/4` estimate for
    /// the same request, using an exponential moving average so that one
    /// unusual turn (a large image, an oddly token-dense string) does not
    /// swing the correction too far.
    pub fn update_calibration(&mut self, actual_input: u32, estimated: usize) {
        if estimated == 0 {
            return;
        }
        let ratio = actual_input as f32 / estimated as f32;
        self.calibration_factor = self.calibration_factor * 0.7 + ratio * 0.3;
    }

    fn head_of(&self, branch: &str) -> Option<String> {
        self.branch_heads.get(branch).cloned().flatten()
    }

    /// Append one entry as a child of the current branch's head, flush it to
    /// the log file if one is attached, and return the stored copy.
    pub fn append_entry(&mut self, payload: SessionEntryPayload) -> anyhow::Result<SessionEntry> {
        let entry = SessionEntry {
            v: SCHEMA_VERSION,
            id: Uuid::new_v4().to_string(),
            parent_id: self.head_of(&self.current_branch),
            timestamp: Utc::now(),
            payload,
        };
        self.branch_heads
            .insert(self.current_branch.clone(), Some(entry.id.clone()));
        if let Some(path) = &self.log_path {
            let line = serde_json::to_string(&entry)?;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening session log {}", path.display()))?;
            writeln!(file, "{line}")?;
        }
        self.modified_at = entry.timestamp;
        self.entries.push(entry.clone());
        Ok(entry)
    }

    /// Push a message onto both the dispatch-ready `messages` list and the
    /// append-only entry log.
    pub fn push(&mut self, msg: Message) {
        self.token_count += msg.approx_tokens();
        self.messages.push(msg.clone());
        // Logging failures are not fatal to the in-memory session — a full
        // disk or missing directory should not take the agent loop down.
        let _ = self.append_entry(SessionEntryPayload::SessionMessage { message: msg });
    }

    pub fn push_many(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for m in msgs { self.push(m); }
    }

    /// Fraction of context window consumed (0.0–1.0)
    pub fn context_fraction(&self) -> f32 {
        if self.max_tokens == 0 { return 0.0; }
        (self.token_count as f32) / (self.max_tokens as f32)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    /// Recalculate token count from scratch (call after compaction).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.messages.iter().map(|m| m.approx_tokens()).sum();
    }

    /// Replace the message list and recalculate token count (for resubmit /
    /// edit / compaction). Only the in-memory dispatch view is replaced — the
    /// entry log is append-only and keeps every prior record; callers that
    /// want the replacement reflected in the log should also record a
    /// [`SessionEntryPayload::Compaction`] entry via [`Session::append_entry`].
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
    }

    /// Create a new branch whose chain diverges at `from_entry_id`, and make
    /// it current. Subsequent `push`/`append_entry` calls become children of
    /// that entry rather than of the previous current branch's head.
    pub fn fork_branch(&mut self, from_entry_id: &str, new_branch: &str) -> anyhow::Result<()> {
        if !self.entries.iter().any(|e| e.id == from_entry_id) {
            bail!("fork_branch: unknown entry id {from_entry_id}");
        }
        self.branch_heads
            .insert(new_branch.to_string(), Some(from_entry_id.to_string()));
        self.current_branch = new_branch.to_string();
        Ok(())
    }

    /// Entry ids forming the ancestor chain of the current branch's head,
    /// oldest first. Used by compaction to find a cut point without
    /// splitting an assistant↔toolResult pair.
    pub fn current_chain(&self) -> Vec<&SessionEntry> {
        let by_id: HashMap<&str, &SessionEntry> =
            self.entries.iter().map(|e| (e.id.as_str(), e)).collect();
        let mut chain = Vec::new();
        let mut cursor = self.head_of(&self.current_branch);
        while let Some(id) = cursor {
            let Some(entry) = by_id.get(id.as_str()) else { break };
            chain.push(*entry);
            cursor = entry.parent_id.clone();
        }
        chain.reverse();
        chain
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
