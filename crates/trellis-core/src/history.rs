//! Append-only audit log.
//!
//! One JSON object per line in `.trellis/log/events.jsonl`. Every transition
//! attempt, deletion, hook bypass and recovery lands here with an operation id
//! so a multi-step operation can be traced end to end.

use crate::error::Result;
use crate::{io, paths};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    Noop,
    Failed,
    RolledBack,
    NeedsRecovery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub op_id: String,
    pub at: DateTime<Utc>,
    pub actor: String,
    /// "transition" | "create" | "edit" | "link" | "delete" | "archive" |
    /// "lint-fix" | "recover" | "hook-bypass"
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(kind: &str, actor: &str) -> Self {
        Self {
            op_id: new_op_id(),
            at: Utc::now(),
            actor: actor.to_string(),
            kind: kind.to_string(),
            issue: None,
            action: None,
            from: None,
            to: None,
            outcome: Outcome::Ok,
            detail: None,
        }
    }

    pub fn with_op_id(mut self, op_id: &str) -> Self {
        self.op_id = op_id.to_string();
        self
    }

    pub fn issue(mut self, id: &str) -> Self {
        self.issue = Some(id.to_string());
        self
    }

    pub fn action(mut self, action: &str) -> Self {
        self.action = Some(action.to_string());
        self
    }

    pub fn states(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self.to = Some(to.into());
        self
    }

    pub fn outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

pub fn new_op_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// I/O
// ---------------------------------------------------------------------------

pub fn append(root: &Path, event: &AuditEvent) -> Result<()> {
    let line = serde_json::to_string(event)?;
    io::append_text(&paths::events_log_path(root), &format!("{line}\n"))
}

/// Append, logging instead of failing. Used after the state change is
/// already durable, where an audit write error must not undo it.
pub fn record(root: &Path, event: &AuditEvent) {
    if let Err(e) = append(root, event) {
        tracing::warn!(kind = %event.kind, error = %e, "failed to append audit event");
    }
}

/// All events, oldest first. Lines that do not parse are skipped.
pub fn read_all(root: &Path) -> Result<Vec<AuditEvent>> {
    let path = paths::events_log_path(root);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = std::fs::read_to_string(&path)?;
    Ok(data
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| match serde_json::from_str(l) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed audit line");
                None
            }
        })
        .collect())
}

pub fn for_issue(root: &Path, id: &str) -> Result<Vec<AuditEvent>> {
    Ok(read_all(root)?
        .into_iter()
        .filter(|e| e.issue.as_deref() == Some(id))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let op = new_op_id();
        append(
            dir.path(),
            &AuditEvent::new("transition", "alice")
                .with_op_id(&op)
                .issue("FEAT-0001")
                .action("start")
                .states("open/draft", "open/doing"),
        )
        .unwrap();
        append(
            dir.path(),
            &AuditEvent::new("delete", "bob")
                .issue("FEAT-0002")
                .detail(serde_json::json!({"reason": "dup"})),
        )
        .unwrap();

        let all = read_all(dir.path()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].op_id, op);
        assert_eq!(all[0].to.as_deref(), Some("open/doing"));
        assert_eq!(for_issue(dir.path(), "FEAT-0002").unwrap().len(), 1);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        record(dir.path(), &AuditEvent::new("recover", "x").issue("FIX-0001"));
        io::append_text(&paths::events_log_path(dir.path()), "not json\n").unwrap();
        assert_eq!(read_all(dir.path()).unwrap().len(), 1);
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = TempDir::new().unwrap();
        assert!(read_all(dir.path()).unwrap().is_empty());
    }
}
