use crate::governance::{Finding, Severity};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrellisError {
    #[error("issue not found: {0}")]
    IssueNotFound(String),

    #[error("issue already exists: {0}")]
    IssueExists(String),

    #[error("invalid issue id '{0}': expected PREFIX-NNNN")]
    InvalidId(String),

    #[error("unknown issue type: {0}")]
    UnknownType(String),

    #[error("invalid record {path}: {reason}")]
    InvalidRecord { path: String, reason: String },

    #[error("{0}")]
    Validation(String),

    #[error("{kind} cycle: {}", path.join(" -> "))]
    Cycle { kind: String, path: Vec<String> },

    #[error("{from} references missing {kind} {to}")]
    DanglingReference {
        from: String,
        kind: String,
        to: String,
    },

    #[error("invalid transition '{action}' for {id} in {from}: {reason}")]
    InvalidTransition {
        id: String,
        action: String,
        from: String,
        reason: String,
    },

    #[error("governance checks failed for {id}: {}", summarize(findings))]
    Governance { id: String, findings: Vec<Finding> },

    #[error("hook denied ({reason}): {message}")]
    HookDenied { reason: String, message: String },

    #[error("{op} failed: {detail}")]
    Transaction { op: String, detail: String },

    #[error("{0} needs manual recovery: run 'trellis recover {0}' after inspecting the repository")]
    RecoveryRequired(String),

    #[error("merge conflict while closing {id}: {}", paths.join(", "))]
    Conflict { id: String, paths: Vec<String> },

    #[error("busy: {0}")]
    Busy(String),

    #[error("operation cancelled before {0}")]
    Cancelled(String),

    #[error("git executable not found on PATH")]
    GitUnavailable,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrellisError>;

fn summarize(findings: &[Finding]) -> String {
    let errors: Vec<&str> = findings
        .iter()
        .filter(|f| f.severity == Severity::Error)
        .map(|f| f.message.as_str())
        .collect();
    if errors.is_empty() {
        "no error findings".to_string()
    } else {
        errors.join("; ")
    }
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Coarse error class shared by the CLI exit codes and JSON error payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Governance,
    HookDenied,
    Transaction,
    Conflict,
    Busy,
    Cancelled,
    Internal,
}

impl TrellisError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TrellisError::IssueNotFound(_)
            | TrellisError::IssueExists(_)
            | TrellisError::InvalidId(_)
            | TrellisError::UnknownType(_)
            | TrellisError::InvalidRecord { .. }
            | TrellisError::Validation(_)
            | TrellisError::Cycle { .. }
            | TrellisError::DanglingReference { .. }
            | TrellisError::InvalidTransition { .. }
            | TrellisError::Config(_) => ErrorClass::Validation,
            TrellisError::Governance { .. } => ErrorClass::Governance,
            TrellisError::HookDenied { .. } => ErrorClass::HookDenied,
            TrellisError::Transaction { .. }
            | TrellisError::RecoveryRequired(_)
            | TrellisError::GitUnavailable => ErrorClass::Transaction,
            TrellisError::Conflict { .. } => ErrorClass::Conflict,
            TrellisError::Busy(_) => ErrorClass::Busy,
            TrellisError::Cancelled(_) => ErrorClass::Cancelled,
            TrellisError::Io(_) | TrellisError::Yaml(_) | TrellisError::Json(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// Machine-readable code carried in JSON error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            TrellisError::IssueNotFound(_) => "issue-not-found",
            TrellisError::IssueExists(_) => "issue-exists",
            TrellisError::InvalidId(_) => "invalid-id",
            TrellisError::UnknownType(_) => "unknown-type",
            TrellisError::InvalidRecord { .. } => "invalid-record",
            TrellisError::Validation(_) => "validation",
            TrellisError::Cycle { .. } => "cycle",
            TrellisError::DanglingReference { .. } => "dangling-reference",
            TrellisError::InvalidTransition { .. } => "invalid-transition",
            TrellisError::Governance { .. } => "governance",
            TrellisError::HookDenied { .. } => "hook-denied",
            TrellisError::Transaction { .. } => "transaction",
            TrellisError::RecoveryRequired(_) => "needs-recovery",
            TrellisError::Conflict { .. } => "merge-conflict",
            TrellisError::Busy(_) => "busy",
            TrellisError::Cancelled(_) => "cancelled",
            TrellisError::GitUnavailable => "git-unavailable",
            TrellisError::Config(_) => "config",
            TrellisError::Io(_) => "io",
            TrellisError::Yaml(_) => "yaml",
            TrellisError::Json(_) => "json",
        }
    }

    /// Human-actionable next step. Every rejection carries one.
    pub fn suggestion(&self) -> String {
        match self {
            TrellisError::IssueNotFound(_) => "run 'trellis list' to see known issues".into(),
            TrellisError::IssueExists(_) => "pick a different id or title".into(),
            TrellisError::InvalidId(_) => "use the PREFIX-NNNN form, e.g. FEAT-0001".into(),
            TrellisError::UnknownType(_) => {
                "check the 'types' section of .trellis/config.yaml".into()
            }
            TrellisError::InvalidRecord { .. } => "run 'trellis lint --fix'".into(),
            TrellisError::Validation(_) => "fix the request and retry".into(),
            TrellisError::Cycle { .. } => "remove one of the edges on the cycle".into(),
            TrellisError::DanglingReference { .. } => {
                "create the referenced issue or drop the reference".into()
            }
            TrellisError::InvalidTransition { .. } => {
                "run 'trellis show <id>' to inspect the current stage".into()
            }
            TrellisError::Governance { findings, .. } => {
                if findings.iter().any(|f| f.rule == "tracked-files") {
                    "run 'trellis sync <id>' before submit".into()
                } else {
                    "address the findings, or run 'trellis lint --fix' for fixable ones".into()
                }
            }
            TrellisError::HookDenied { .. } => {
                "address the hook's message, or pass --bypass-hooks in an emergency".into()
            }
            TrellisError::Transaction { .. } => "inspect 'git status' and retry".into(),
            TrellisError::RecoveryRequired(id) => format!("run 'trellis recover {id}'"),
            TrellisError::Conflict { id, .. } => {
                format!("resolve the conflicts, 'git add' them, then re-run 'trellis close {id}'")
            }
            TrellisError::Busy(_) => "wait for the other operation to finish and retry".into(),
            TrellisError::Cancelled(_) => "re-run the command".into(),
            TrellisError::GitUnavailable => "install git and make sure it is on PATH".into(),
            TrellisError::Config(_) => "run 'trellis config validate'".into(),
            TrellisError::Io(_) | TrellisError::Yaml(_) | TrellisError::Json(_) => {
                "check file permissions and record syntax".into()
            }
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.class() {
            ErrorClass::Internal => 1,
            ErrorClass::Validation => 2,
            ErrorClass::Governance => 3,
            ErrorClass::HookDenied => 4,
            ErrorClass::Transaction => 5,
            ErrorClass::Conflict => 6,
            ErrorClass::Busy => 7,
            ErrorClass::Cancelled => 130,
        }
    }

    pub fn transaction(op: impl Into<String>, detail: impl Into<String>) -> Self {
        TrellisError::Transaction {
            op: op.into(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_class() {
        let validation = TrellisError::Validation("bad".into());
        let transaction = TrellisError::transaction("git merge", "boom");
        let busy = TrellisError::Busy("FEAT-0001".into());
        assert_eq!(validation.exit_code(), 2);
        assert_eq!(transaction.exit_code(), 5);
        assert_eq!(busy.exit_code(), 7);
    }

    #[test]
    fn governance_suggests_sync_for_tracked_files() {
        let err = TrellisError::Governance {
            id: "FEAT-0001".into(),
            findings: vec![Finding::error(
                "tracked-files",
                "FEAT-0001",
                "no tracked files declared",
            )],
        };
        assert!(err.suggestion().contains("sync"));
        assert!(err.to_string().contains("no tracked files declared"));
    }
}
