//! Hook interception: one canonical event and decision model shared by every
//! caller, script discovery and execution, and per-caller wire translation.

pub mod adapter;
mod builtin;
pub mod interceptor;
pub mod runner;
pub mod script;

pub use adapter::{normalize, render, Rendered};
pub use interceptor::HookInterceptor;
pub use runner::{Aggregate, ScriptResult};
pub use script::{HookHeader, HookScript};

use crate::error::TrellisError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Caller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Caller {
    Engine,
    Git,
    ClaudeCode,
    Gemini,
    Editor,
}

impl Caller {
    pub fn all() -> &'static [Caller] {
        &[
            Caller::Engine,
            Caller::Git,
            Caller::ClaudeCode,
            Caller::Gemini,
            Caller::Editor,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Caller::Engine => "engine",
            Caller::Git => "git",
            Caller::ClaudeCode => "claude-code",
            Caller::Gemini => "gemini",
            Caller::Editor => "editor",
        }
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Caller {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(Caller::ClaudeCode),
            _ => Caller::all()
                .iter()
                .copied()
                .find(|c| c.as_str() == s)
                .ok_or_else(|| TrellisError::Validation(format!("unknown hook caller: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// HookEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookEvent {
    PreTransition,
    PostTransition,
    PreCommit,
    PrePush,
    PreToolUse,
    PostToolUse,
    BeforeAgentTurn,
    SessionStart,
    BeforeSave,
}

impl HookEvent {
    pub fn all() -> &'static [HookEvent] {
        &[
            HookEvent::PreTransition,
            HookEvent::PostTransition,
            HookEvent::PreCommit,
            HookEvent::PrePush,
            HookEvent::PreToolUse,
            HookEvent::PostToolUse,
            HookEvent::BeforeAgentTurn,
            HookEvent::SessionStart,
            HookEvent::BeforeSave,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HookEvent::PreTransition => "pre-transition",
            HookEvent::PostTransition => "post-transition",
            HookEvent::PreCommit => "pre-commit",
            HookEvent::PrePush => "pre-push",
            HookEvent::PreToolUse => "pre-tool-use",
            HookEvent::PostToolUse => "post-tool-use",
            HookEvent::BeforeAgentTurn => "before-agent-turn",
            HookEvent::SessionStart => "session-start",
            HookEvent::BeforeSave => "before-save",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookEvent {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HookEvent::all()
            .iter()
            .copied()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| TrellisError::Validation(format!("unknown hook event: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookContext {
    pub caller: Option<Caller>,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub actor: String,
}

/// What every hook script receives on stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookInput {
    pub event: HookEvent,
    pub context: HookContext,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl HookInput {
    pub fn new(event: HookEvent, caller: Caller, actor: &str, cwd: &str) -> Self {
        Self {
            event,
            context: HookContext {
                caller: Some(caller),
                cwd: cwd.to_string(),
                session_id: None,
                actor: actor.to_string(),
            },
            payload: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn caller(&self) -> Caller {
        self.context.caller.unwrap_or(Caller::Engine)
    }

    /// Tool name for agent events, action name for engine events.
    pub fn subject(&self) -> Option<&str> {
        ["tool_name", "action", "toolName"]
            .iter()
            .find_map(|k| self.payload.get(*k).and_then(|v| v.as_str()))
    }

    /// File paths the event is about, as given by the caller.
    pub fn files(&self) -> Vec<String> {
        let mut out = Vec::new();
        let p = &self.payload;
        let mut push = |v: Option<&serde_json::Value>| {
            if let Some(s) = v.and_then(|v| v.as_str()) {
                out.push(s.to_string());
            }
        };
        if let Some(input) = p.get("tool_input") {
            push(input.get("file_path"));
            push(input.get("path"));
            push(input.get("notebook_path"));
        }
        push(p.get("file"));
        push(p.get("file_path"));
        if let Some(list) = p.get("files").and_then(|v| v.as_array()) {
            out.extend(list.iter().filter_map(|v| v.as_str()).map(str::to_string));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
    Ask,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
            Decision::Ask => "ask",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a hook script prints on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookDecision {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl HookDecision {
    pub fn allow() -> Self {
        Self {
            decision: Decision::Allow,
            reason: None,
            message: None,
            metadata: Default::default(),
        }
    }

    pub fn deny(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            decision: Decision::Deny,
            reason: Some(reason.into()),
            message: Some(message.into()),
            metadata: Default::default(),
        }
    }

    pub fn ask(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            decision: Decision::Ask,
            reason: Some(reason.into()),
            message: Some(message.into()),
            metadata: Default::default(),
        }
    }

    /// Context an agent caller should see alongside the decision.
    pub fn additional_context(&self) -> Option<&str> {
        self.metadata
            .get("additional_context")
            .and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_and_caller_names_roundtrip() {
        for e in HookEvent::all() {
            assert_eq!(HookEvent::from_str(e.as_str()).unwrap(), *e);
        }
        for c in Caller::all() {
            assert_eq!(Caller::from_str(c.as_str()).unwrap(), *c);
        }
        assert_eq!(Caller::from_str("claude").unwrap(), Caller::ClaudeCode);
        assert!(HookEvent::from_str("PreToolUse").is_err());
    }

    #[test]
    fn input_extracts_subject_and_files() {
        let input = HookInput::new(HookEvent::PreToolUse, Caller::ClaudeCode, "agent", "/p")
            .with_payload(json!({
                "tool_name": "Write",
                "tool_input": {"file_path": "src/lib.rs"},
                "files": ["a.rs"]
            }));
        assert_eq!(input.subject(), Some("Write"));
        assert_eq!(input.files(), vec!["src/lib.rs", "a.rs"]);
    }

    #[test]
    fn decision_wire_shape() {
        let d: HookDecision = serde_json::from_str(
            r#"{"decision":"allow","metadata":{"additional_context":"hi"}}"#,
        )
        .unwrap();
        assert_eq!(d.decision, Decision::Allow);
        assert_eq!(d.additional_context(), Some("hi"));
        let text = serde_json::to_string(&HookDecision::deny("r", "m")).unwrap();
        assert_eq!(text, r#"{"decision":"deny","reason":"r","message":"m"}"#);
    }
}
