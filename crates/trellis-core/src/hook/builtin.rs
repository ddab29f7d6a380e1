//! Hooks that ship with the engine and run before any user script.

use super::{HookDecision, HookEvent, HookInput};
use crate::config::Config;
use crate::error::Result;
use crate::git::GitContext;
use crate::governance::{self, GovernanceEngine, RuleContext, Strictness};
use crate::graph::RelationGraph;
use crate::paths;
use crate::store::IssueStore;
use crate::types::Status;
use std::path::{Component, Path, PathBuf};

pub const FROZEN_RECORD: &str = "frozen-record";
pub const ISOLATION_VIOLATION: &str = "isolation-violation";

/// Tools that only read. Anything else touching a closed record is a write.
const READ_ONLY_TOOLS: &[&str] = &[
    "Read",
    "Glob",
    "Grep",
    "LS",
    "read_file",
    "read_many_files",
    "list_directory",
    "glob",
    "search_file_content",
];

fn absolute(input: &HookInput, file: &str) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        Path::new(&input.context.cwd).join(p)
    }
}

/// Deny agent or editor writes into `{issues_root}/{Folder}/closed|archived/`.
pub fn frozen_record_guard(input: &HookInput, root: &Path, config: &Config) -> Option<HookDecision> {
    if !matches!(input.event, HookEvent::PreToolUse | HookEvent::BeforeSave) {
        return None;
    }
    if let Some(tool) = input.subject() {
        if READ_ONLY_TOOLS.contains(&tool) {
            return None;
        }
    }
    let issues_dir = root.join(&config.issues_root);
    for file in input.files() {
        let abs = absolute(input, &file);
        let Ok(rel) = abs.strip_prefix(&issues_dir) else {
            continue;
        };
        let parts: Vec<String> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        if parts.len() >= 3
            && (parts[1] == Status::Closed.dir_name() || parts[1] == paths::ARCHIVED_DIR)
        {
            return Some(HookDecision::deny(
                FROZEN_RECORD,
                format!("{file} is a closed issue record and cannot be edited"),
            ));
        }
    }
    None
}

/// Deny commits on trunk that touch files claimed by an isolated active issue.
pub fn isolation_guard(input: &HookInput, root: &Path, config: &Config) -> Result<Option<HookDecision>> {
    if input.event != HookEvent::PreCommit {
        return Ok(None);
    }
    let git = GitContext::from_config(root, config);
    if !git.is_repo() {
        return Ok(None);
    }
    if git.current_branch(root)?.as_deref() != Some(config.git.trunk.as_str()) {
        return Ok(None);
    }
    let staged = git.staged_files(root)?;
    if staged.is_empty() {
        return Ok(None);
    }

    let store = IssueStore::new(root, config);
    let issues = store.list()?;
    let graph = RelationGraph::from_issues(&issues);
    let engine = GovernanceEngine::new(
        governance::default_rules()
            .into_iter()
            .filter(|r| r.id == "isolation")
            .collect(),
    );
    let mut messages = Vec::new();
    for issue in issues.iter().filter(|i| i.meta.status == Status::Open) {
        let Some(iso) = &issue.meta.isolation else {
            continue;
        };
        if !git.isolation_present(iso) {
            continue;
        }
        let ctx = RuleContext {
            issue,
            path: None,
            root,
            workdir: root,
            config,
            graph: &graph,
            strictness: Strictness::Standard,
            changed_files: None,
            trunk_changes: Some(staged.as_slice()),
        };
        let report = engine.check(&ctx);
        messages.extend(
            report
                .errors()
                .map(|f| format!("{} ({} is isolated on {})", f.message, f.issue, iso.branch)),
        );
    }
    if messages.is_empty() {
        return Ok(None);
    }
    Ok(Some(HookDecision::deny(ISOLATION_VIOLATION, messages.join("; "))))
}
