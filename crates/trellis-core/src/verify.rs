use crate::process::{self, ProcessOutcome};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// VerifyCommand
// ---------------------------------------------------------------------------

/// An external verification command run before an action may advance
/// (e.g. the test suite before `submit`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifyCommand {
    pub name: String,
    pub command: String,
    /// Maximum number of retries after the first attempt.
    /// `0` means one attempt total, `2` means up to three attempts.
    #[serde(default)]
    pub max_retries: u32,
    /// `0` disables the timeout.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u32,
}

fn default_timeout() -> u32 {
    300
}

// ---------------------------------------------------------------------------
// VerifyResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyResult {
    pub name: String,
    pub passed: bool,
    pub output: String,
    /// 1-indexed attempt number.
    pub attempt: u32,
    pub duration_ms: u64,
}

/// Run commands in order, retrying each up to `max_retries` times.
/// Stops at the first command that exhausts its attempts.
pub fn run_all(cwd: &Path, commands: &[VerifyCommand]) -> Vec<VerifyResult> {
    let mut results = Vec::new();

    for cmd in commands {
        if cmd.command.trim().is_empty() {
            results.push(VerifyResult {
                name: cmd.name.clone(),
                passed: false,
                output: "verification command is empty".to_string(),
                attempt: 1,
                duration_ms: 0,
            });
            return results;
        }

        let timeout = if cmd.timeout_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(cmd.timeout_seconds as u64))
        };

        let mut last_passed = false;
        for attempt in 1..=cmd.max_retries + 1 {
            let start = Instant::now();
            let (passed, output) = execute(&cmd.command, cwd, timeout);
            last_passed = passed;
            tracing::debug!(name = %cmd.name, attempt, passed, "verification attempt");
            results.push(VerifyResult {
                name: cmd.name.clone(),
                passed,
                output,
                attempt,
                duration_ms: start.elapsed().as_millis() as u64,
            });
            if passed {
                break;
            }
        }

        if !last_passed {
            return results;
        }
    }

    results
}

/// True when every command's final attempt passed.
pub fn all_passed(results: &[VerifyResult]) -> bool {
    let mut last: std::collections::HashMap<&str, bool> = std::collections::HashMap::new();
    for r in results {
        last.insert(r.name.as_str(), r.passed);
    }
    last.values().all(|p| *p)
}

fn execute(command: &str, cwd: &Path, timeout: Option<Duration>) -> (bool, String) {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).current_dir(cwd);
    match process::run(cmd, None, timeout) {
        ProcessOutcome::Exited {
            success, output, ..
        } => (success, output.transcript()),
        ProcessOutcome::TimedOut { after } => {
            (false, format!("timed out after {}s", after.as_secs()))
        }
        ProcessOutcome::SpawnFailed(e) => (false, format!("failed to spawn: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
