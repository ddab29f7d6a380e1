use super::{Decision, HookDecision, HookInput, HookScript};
use crate::process::{self, ProcessOutcome};
use serde::Serialize;
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

pub const REASON_FAILED: &str = "hook-failed";
pub const REASON_TIMEOUT: &str = "hook-timeout";

#[derive(Debug, Clone, Serialize)]
pub struct ScriptResult {
    pub script: String,
    pub decision: HookDecision,
    pub duration_ms: u64,
}

/// The combined verdict of every hook that ran for one event.
#[derive(Debug, Clone, Serialize)]
pub struct Aggregate {
    pub decision: HookDecision,
    pub results: Vec<ScriptResult>,
    /// Set when hooks were skipped through the bypass switch.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub bypassed: bool,
}

impl Aggregate {
    pub fn allow() -> Self {
        Self {
            decision: HookDecision::allow(),
            results: Vec::new(),
            bypassed: false,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision.decision == Decision::Allow
    }
}

// ---------------------------------------------------------------------------
// Single script
// ---------------------------------------------------------------------------

/// Run one script with the input on stdin. Crashes, unparseable output and
/// timeouts all come back as a deny with a system reason.
pub fn run_script(script: &HookScript, input: &HookInput, root: &Path, timeout: Option<Duration>) -> ScriptResult {
    let start = Instant::now();
    let payload = match serde_json::to_vec(input) {
        Ok(p) => p,
        Err(e) => {
            return ScriptResult {
                script: script.name.clone(),
                decision: HookDecision::deny(REASON_FAILED, format!("cannot encode input: {e}")),
                duration_ms: 0,
            }
        }
    };

    let mut cmd = command_for(&script.path);
    cmd.current_dir(root)
        .env("TRELLIS_ROOT", root)
        .env("TRELLIS_HOOK_EVENT", input.event.as_str())
        .env("TRELLIS_HOOK_CALLER", input.caller().as_str());

    let decision = match process::run(cmd, Some(&payload), timeout) {
        ProcessOutcome::Exited {
            success: true,
            output,
            ..
        } => parse_output(&script.name, &output.stdout),
        ProcessOutcome::Exited { code, output, .. } => HookDecision::deny(
            REASON_FAILED,
            format!(
                "{} exited with {}: {}",
                script.name,
                code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()),
                output.transcript()
            ),
        ),
        ProcessOutcome::TimedOut { after } => HookDecision::deny(
            REASON_TIMEOUT,
            format!("{} did not answer within {}s", script.name, after.as_secs()),
        ),
        ProcessOutcome::SpawnFailed(e) => {
            HookDecision::deny(REASON_FAILED, format!("{} could not start: {e}", script.name))
        }
    };

    ScriptResult {
        script: script.name.clone(),
        decision,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

/// Executable scripts run directly (honouring their shebang); others go
/// through `sh`.
fn command_for(path: &Path) -> Command {
    if is_executable(path) {
        Command::new(path)
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg(path);
        cmd
    }
}

/// Empty stdout from a successful script counts as allow. Anything else must
/// be a decision object.
fn parse_output(name: &str, stdout: &str) -> HookDecision {
    let text = stdout.trim();
    if text.is_empty() {
        return HookDecision::allow();
    }
    // Tolerate log lines before the final JSON object.
    let json = text.lines().last().unwrap_or(text);
    let parsed = serde_json::from_str::<HookDecision>(json)
        .or_else(|_| serde_json::from_str::<HookDecision>(text));
    match parsed {
        Ok(mut d) => {
            if d.decision == Decision::Deny && d.reason.is_none() {
                d.reason = Some(format!("denied-by:{name}"));
            }
            d
        }
        Err(e) => HookDecision::deny(REASON_FAILED, format!("{name} printed invalid output: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Fold per-script decisions in priority order.
///
/// The first deny wins outright. An ask sticks but later scripts still run,
/// so a later deny overrides it. Allow metadata is merged: string values are
/// concatenated with newlines, anything else is last-writer-wins.
pub fn aggregate<I>(decisions: I) -> (HookDecision, usize)
where
    I: IntoIterator<Item = HookDecision>,
{
    let mut merged = HookDecision::allow();
    let mut ask: Option<HookDecision> = None;
    let mut seen = 0;
    for d in decisions {
        seen += 1;
        match d.decision {
            Decision::Deny => return (d, seen),
            Decision::Ask => {
                if ask.is_none() {
                    ask = Some(d);
                }
            }
            Decision::Allow => {
                for (k, v) in d.metadata {
                    match (merged.metadata.get_mut(&k), &v) {
                        (Some(serde_json::Value::String(existing)), serde_json::Value::String(add)) => {
                            existing.push('\n');
                            existing.push_str(add);
                        }
                        _ => {
                            merged.metadata.insert(k, v);
                        }
                    }
                }
                if let Some(m) = d.message {
                    merged.message = Some(match merged.message.take() {
                        Some(prev) => format!("{prev}\n{m}"),
                        None => m,
                    });
                }
            }
        }
    }
    match ask {
        Some(mut a) => {
            for (k, v) in merged.metadata {
                a.metadata.entry(k).or_insert(v);
            }
            (a, seen)
        }
        None => (merged, seen),
    }
}

/// Run matching scripts lazily so a deny stops the rest from starting.
pub fn run_all(scripts: &[&HookScript], input: &HookInput, root: &Path, timeout: Option<Duration>) -> Aggregate {
    let mut results = Vec::new();
    let decisions = scripts.iter().map(|script| {
        let result = run_script(script, input, root, timeout);
        tracing::debug!(
            script = %result.script,
            decision = %result.decision.decision,
            duration_ms = result.duration_ms,
            "hook finished"
        );
        results.push(result.clone());
        result.decision
    });
    let (decision, _) = aggregate(decisions);
    Aggregate {
        decision,
        results,
        bypassed: false,
    }
}
