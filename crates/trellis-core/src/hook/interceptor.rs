use super::builtin;
use super::runner::{self, Aggregate, ScriptResult};
use super::script::{self, HookScript};
use super::{Decision, HookDecision, HookInput};
use crate::config::Config;
use crate::error::{Result, TrellisError};
use crate::history::{self, AuditEvent};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const REASON_CONFIRMATION: &str = "confirmation-required";

/// Environment switch that skips every hook. Each use is audited.
pub const BYPASS_ENV: &str = "TRELLIS_BYPASS_HOOKS";

fn bypass_from_env() -> bool {
    std::env::var(BYPASS_ENV)
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Single entry point for every caller: engine transitions, git hooks, agent
/// tool hooks and editor saves all dispatch through here.
pub struct HookInterceptor {
    root: PathBuf,
    config: Config,
    scripts: Vec<HookScript>,
    bypass: bool,
}

impl HookInterceptor {
    pub fn load(root: &Path, config: &Config) -> Result<Self> {
        let scripts = script::discover(root, config)?;
        Ok(Self {
            root: root.to_path_buf(),
            config: config.clone(),
            scripts,
            bypass: bypass_from_env(),
        })
    }

    /// Override the environment switch.
    pub fn with_bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn bypassed(&self) -> bool {
        self.bypass
    }

    pub fn scripts(&self) -> &[HookScript] {
        &self.scripts
    }

    fn timeout(&self) -> Option<Duration> {
        match self.config.hooks.timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(u64::from(secs))),
        }
    }

    /// Built-in guards run first and a deny from them ends dispatch.
    fn run_builtins(&self, input: &HookInput) -> Option<ScriptResult> {
        if let Some(decision) = builtin::frozen_record_guard(input, &self.root, &self.config) {
            return Some(ScriptResult {
                script: format!("builtin:{}", builtin::FROZEN_RECORD),
                decision,
                duration_ms: 0,
            });
        }
        match builtin::isolation_guard(input, &self.root, &self.config) {
            Ok(Some(decision)) => Some(ScriptResult {
                script: format!("builtin:{}", builtin::ISOLATION_VIOLATION),
                decision,
                duration_ms: 0,
            }),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "isolation guard could not run");
                None
            }
        }
    }

    /// Run built-ins and matching scripts and fold their decisions.
    pub fn dispatch(&self, input: &HookInput) -> Aggregate {
        if self.bypass {
            tracing::warn!(event = %input.event, caller = %input.caller(), "hooks bypassed");
            history::record(
                &self.root,
                &AuditEvent::new("hook-bypass", &input.context.actor).detail(serde_json::json!({
                    "event": input.event.as_str(),
                    "caller": input.caller().as_str(),
                    "subject": input.subject(),
                })),
            );
            let mut agg = Aggregate::allow();
            agg.bypassed = true;
            return agg;
        }

        let mut agg = match self.run_builtins(input) {
            Some(result) => Aggregate {
                decision: result.decision.clone(),
                results: vec![result],
                bypassed: false,
            },
            None => {
                let matching: Vec<&HookScript> = self
                    .scripts
                    .iter()
                    .filter(|s| s.matches(input, &self.root))
                    .collect();
                if matching.is_empty() {
                    Aggregate::allow()
                } else {
                    runner::run_all(&matching, input, &self.root, self.timeout())
                }
            }
        };

        if agg.decision.decision != Decision::Allow && self.config.hooks.is_advisory(input.event) {
            tracing::warn!(
                event = %input.event,
                reason = agg.decision.reason.as_deref().unwrap_or(""),
                message = agg.decision.message.as_deref().unwrap_or(""),
                "advisory hook objected; continuing"
            );
            let metadata = std::mem::take(&mut agg.decision.metadata);
            agg.decision = HookDecision::allow();
            agg.decision.metadata = metadata;
        }
        agg
    }

    /// Dispatch and turn anything but allow into an error. An ask passes only
    /// when the caller has already confirmed.
    pub fn enforce(&self, input: &HookInput, auto_confirm: bool) -> Result<Aggregate> {
        let agg = self.dispatch(input);
        let d = &agg.decision;
        match d.decision {
            Decision::Allow => Ok(agg),
            Decision::Ask if auto_confirm => {
                tracing::info!(reason = d.reason.as_deref().unwrap_or(""), "hook ask auto-confirmed");
                Ok(agg)
            }
            Decision::Ask => Err(TrellisError::HookDenied {
                reason: REASON_CONFIRMATION.to_string(),
                message: d
                    .message
                    .clone()
                    .or_else(|| d.reason.clone())
                    .unwrap_or_else(|| "a hook asked for confirmation".to_string()),
            }),
            Decision::Deny => Err(TrellisError::HookDenied {
                reason: d.reason.clone().unwrap_or_else(|| "denied".to_string()),
                message: d.message.clone().unwrap_or_default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::{Caller, HookEvent};
    use serde_json::json;
    use tempfile::TempDir;

    fn project(hooks: &[(&str, &str)]) -> (TempDir, Config) {
        let dir = TempDir::new().unwrap();
        let hooks_dir = dir.path().join(".trellis/hooks");
        std::fs::create_dir_all(&hooks_dir).unwrap();
        for (name, body) in hooks {
            std::fs::write(hooks_dir.join(name), body).unwrap();
        }
        (dir, Config::default())
    }

    fn transition_input(root: &Path, event: HookEvent) -> HookInput {
        HookInput::new(event, Caller::Engine, "tester", &root.display().to_string())
            .with_payload(json!({"action": "start", "issue": "FEAT-0001"}))
    }

    const DENY: &str = "# ---\n# events: [pre-transition, post-transition]\n# ---\necho '{\"decision\":\"deny\",\"reason\":\"freeze\",\"message\":\"release freeze\"}'\n";
    const ASK: &str = "# ---\n# events: [pre-transition]\n# ---\necho '{\"decision\":\"ask\",\"reason\":\"confirm\",\"message\":\"sure?\"}'\n";

    #[test]
    fn no_scripts_allows() {
        let (dir, cfg) = project(&[]);
        let hooks = HookInterceptor::load(dir.path(), &cfg).unwrap().with_bypass(false);
        let agg = hooks.dispatch(&transition_input(dir.path(), HookEvent::PreTransition));
        assert!(agg.is_allowed());
        assert!(agg.results.is_empty());
    }

    #[test]
    fn deny_becomes_hook_denied() {
        let (dir, cfg) = project(&[("freeze.sh", DENY)]);
        let hooks = HookInterceptor::load(dir.path(), &cfg).unwrap().with_bypass(false);
        let err = hooks
            .enforce(&transition_input(dir.path(), HookEvent::PreTransition), false)
            .unwrap_err();
        match err {
            TrellisError::HookDenied { reason, message } => {
                assert_eq!(reason, "freeze");
                assert_eq!(message, "release freeze");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn advisory_event_deny_is_logged_not_enforced() {
        let (dir, cfg) = project(&[("freeze.sh", DENY)]);
        let hooks = HookInterceptor::load(dir.path(), &cfg).unwrap().with_bypass(false);
        let agg = hooks
            .enforce(&transition_input(dir.path(), HookEvent::PostTransition), false)
            .unwrap();
        assert!(agg.is_allowed());
        assert_eq!(agg.results.len(), 1);
    }

    #[test]
    fn ask_needs_confirmation() {
        let (dir, cfg) = project(&[("ask.sh", ASK)]);
        let hooks = HookInterceptor::load(dir.path(), &cfg).unwrap().with_bypass(false);
        let input = transition_input(dir.path(), HookEvent::PreTransition);
        match hooks.enforce(&input, false).unwrap_err() {
            TrellisError::HookDenied { reason, .. } => assert_eq!(reason, REASON_CONFIRMATION),
            other => panic!("unexpected error: {other}"),
        }
        assert!(hooks.enforce(&input, true).is_ok());
    }

    #[test]
    fn bypass_skips_scripts_and_audits() {
        let (dir, cfg) = project(&[("freeze.sh", DENY)]);
        let hooks = HookInterceptor::load(dir.path(), &cfg).unwrap().with_bypass(true);
        let agg = hooks
            .enforce(&transition_input(dir.path(), HookEvent::PreTransition), false)
            .unwrap();
        assert!(agg.bypassed);
        let events = history::read_all(dir.path()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "hook-bypass");
    }

    #[test]
    fn frozen_guard_runs_before_scripts() {
        let (dir, cfg) = project(&[]);
        let hooks = HookInterceptor::load(dir.path(), &cfg).unwrap().with_bypass(false);
        let input = HookInput::new(
            HookEvent::PreToolUse,
            Caller::ClaudeCode,
            "agent",
            &dir.path().display().to_string(),
        )
        .with_payload(json!({
            "tool_name": "Write",
            "tool_input": {"file_path": "Issues/Features/closed/FEAT-0001-x.md"}
        }));
        let agg = hooks.dispatch(&input);
        assert_eq!(agg.decision.decision, Decision::Deny);
        assert_eq!(agg.decision.reason.as_deref(), Some(builtin::FROZEN_RECORD));
    }
}
