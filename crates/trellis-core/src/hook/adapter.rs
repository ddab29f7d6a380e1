//! Caller wire formats.
//!
//! Each external tool names its events differently and expects its own
//! response shape. `normalize` maps a caller's native event into a
//! [`HookInput`]; `render` maps the aggregated decision back. Both are pure.

use super::{Caller, Decision, HookDecision, HookEvent, HookInput};
use crate::error::{Result, TrellisError};
use serde_json::{json, Value};

/// (caller, native event name, internal event)
const EVENT_TABLE: &[(Caller, &str, HookEvent)] = &[
    (Caller::ClaudeCode, "PreToolUse", HookEvent::PreToolUse),
    (Caller::ClaudeCode, "PostToolUse", HookEvent::PostToolUse),
    (Caller::ClaudeCode, "UserPromptSubmit", HookEvent::BeforeAgentTurn),
    (Caller::ClaudeCode, "SessionStart", HookEvent::SessionStart),
    (Caller::Gemini, "BeforeTool", HookEvent::PreToolUse),
    (Caller::Gemini, "AfterTool", HookEvent::PostToolUse),
    (Caller::Gemini, "BeforeAgent", HookEvent::BeforeAgentTurn),
    (Caller::Gemini, "SessionStart", HookEvent::SessionStart),
    (Caller::Git, "pre-commit", HookEvent::PreCommit),
    (Caller::Git, "pre-push", HookEvent::PrePush),
    (Caller::Editor, "willSave", HookEvent::BeforeSave),
    (Caller::Editor, "before-save", HookEvent::BeforeSave),
    (Caller::Engine, "pre-transition", HookEvent::PreTransition),
    (Caller::Engine, "post-transition", HookEvent::PostTransition),
];

pub fn internal_event(caller: Caller, native: &str) -> Option<HookEvent> {
    EVENT_TABLE
        .iter()
        .find(|(c, n, _)| *c == caller && *n == native)
        .map(|(_, _, e)| *e)
}

pub fn native_event(caller: Caller, event: HookEvent) -> Option<&'static str> {
    EVENT_TABLE
        .iter()
        .find(|(c, _, e)| *c == caller && *e == event)
        .map(|(_, n, _)| *n)
}

/// Native event names a caller understands, for `hook install` and help.
pub fn native_events(caller: Caller) -> Vec<&'static str> {
    EVENT_TABLE
        .iter()
        .filter(|(c, _, _)| *c == caller)
        .map(|(_, n, _)| *n)
        .collect()
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Build a [`HookInput`] from what a caller sent. The native event comes from
/// `event_arg` when given (git passes it on the command line), otherwise from
/// the payload's `hook_event_name`.
pub fn normalize(
    caller: Caller,
    event_arg: Option<&str>,
    raw: Value,
    default_cwd: &str,
    actor: &str,
) -> Result<HookInput> {
    let native = event_arg
        .map(str::to_string)
        .or_else(|| {
            raw.get("hook_event_name")
                .or_else(|| raw.get("event"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .ok_or_else(|| TrellisError::Validation(format!("{caller} hook input names no event")))?;
    let event = internal_event(caller, &native)
        .or_else(|| native.parse::<HookEvent>().ok())
        .ok_or_else(|| {
            TrellisError::Validation(format!("{caller} event '{native}' is not supported"))
        })?;

    let cwd = raw
        .get("cwd")
        .and_then(|v| v.as_str())
        .unwrap_or(default_cwd)
        .to_string();
    let session_id = raw
        .get("session_id")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let mut input = HookInput::new(event, caller, actor, &cwd);
    input.context.session_id = session_id;
    input.payload = if raw.is_object() { raw } else { json!({}) };
    Ok(input)
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// What to hand back to the caller process.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: i32,
}

impl Rendered {
    fn json(value: Value) -> Self {
        Self {
            stdout: Some(value.to_string()),
            stderr: None,
            exit_code: 0,
        }
    }
}

fn explanation(d: &HookDecision) -> String {
    match (&d.reason, &d.message) {
        (Some(r), Some(m)) => format!("{r}: {m}"),
        (Some(r), None) => r.clone(),
        (None, Some(m)) => m.clone(),
        (None, None) => String::new(),
    }
}

pub fn render(caller: Caller, event: HookEvent, d: &HookDecision) -> Rendered {
    match caller {
        Caller::ClaudeCode => render_claude(event, d),
        Caller::Gemini => render_gemini(event, d),
        Caller::Git => render_git(d),
        Caller::Editor => render_editor(d),
        Caller::Engine => Rendered::json(serde_json::to_value(d).unwrap_or_else(|_| json!({}))),
    }
}

fn render_claude(event: HookEvent, d: &HookDecision) -> Rendered {
    let name = native_event(Caller::ClaudeCode, event).unwrap_or("PreToolUse");
    let context = d.additional_context();
    match event {
        HookEvent::PreToolUse => {
            let mut specific = json!({
                "hookEventName": name,
                "permissionDecision": d.decision.as_str(),
            });
            let why = explanation(d);
            if !why.is_empty() {
                specific["permissionDecisionReason"] = json!(why);
            }
            if let Some(ctx) = context {
                specific["additionalContext"] = json!(ctx);
            }
            Rendered::json(json!({ "hookSpecificOutput": specific }))
        }
        _ => {
            let mut out = json!({});
            if d.decision != Decision::Allow {
                out["decision"] = json!("block");
                out["reason"] = json!(explanation(d));
            }
            if let Some(ctx) = context {
                out["hookSpecificOutput"] = json!({
                    "hookEventName": name,
                    "additionalContext": ctx,
                });
            }
            Rendered::json(out)
        }
    }
}

fn render_gemini(event: HookEvent, d: &HookDecision) -> Rendered {
    let name = native_event(Caller::Gemini, event).unwrap_or("BeforeTool");
    let mut out = json!({ "decision": d.decision.as_str() });
    if let Some(reason) = &d.reason {
        out["reason"] = json!(reason);
    }
    if let Some(message) = &d.message {
        out["systemMessage"] = json!(message);
    }
    if let Some(ctx) = d.additional_context() {
        out["hookSpecificOutput"] = json!({
            "hookEventName": name,
            "additionalContext": ctx,
        });
    }
    Rendered::json(out)
}

/// git has no way to ask, so `ask` stops the operation with an explanation.
fn render_git(d: &HookDecision) -> Rendered {
    match d.decision {
        Decision::Allow => Rendered {
            stdout: None,
            stderr: d.message.clone(),
            exit_code: 0,
        },
        Decision::Deny => Rendered {
            stdout: None,
            stderr: Some(format!("trellis: {}", explanation(d))),
            exit_code: 1,
        },
        Decision::Ask => Rendered {
            stdout: None,
            stderr: Some(format!(
                "trellis: confirmation required ({}); re-run with TRELLIS_BYPASS_HOOKS=1 to proceed",
                explanation(d)
            )),
            exit_code: 1,
        },
    }
}

fn render_editor(d: &HookDecision) -> Rendered {
    let mut out = json!({ "allow": d.decision == Decision::Allow });
    if d.decision == Decision::Ask {
        out["ask"] = json!(true);
    }
    let why = explanation(d);
    if !why.is_empty() {
        out["message"] = json!(why);
    }
    Rendered::json(out)
}
