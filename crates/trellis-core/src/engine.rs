//! Orchestration.
//!
//! Every operation that changes an issue runs here, under that issue's lock.
//! Transitions follow one fixed order: recovery check, plan, pre-transition
//! hooks, governance gate, verification, git effect, store write, cleanup,
//! post-transition hooks, graph update, audit. The store is written only
//! after the git effect succeeds; if the write fails the git effect is undone,
//! and if undoing fails the issue is marked for manual recovery.

use crate::config::Config;
use crate::error::{Result, TrellisError};
use crate::git::{BeginOutcome, FinalizeOutcome, GitContext};
use crate::governance::{self, Finding, GovernanceEngine, Report, RuleContext, Severity, Strictness};
use crate::graph::RelationGraph;
use crate::history::{self, AuditEvent, Outcome};
use crate::hook::{Caller, HookEvent, HookInput, HookInterceptor};
use crate::issue::{self, ChecklistItem, CheckMark, Feedback, Isolation, Issue, IssueMeta, RecoveryMarker};
use crate::lock::FileLock;
use crate::query::Filter;
use crate::store::IssueStore;
use crate::types::{Action, Criticality, RelationKind, Status};
use crate::verify::{self, VerifyResult};
use crate::workflow::{Effect, Plan, PlanFacts, StateMachine, TransitionRequest};
use crate::{io, paths};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Shared flag checked between transition steps. Cancelling before the git
/// effect is free; after it, the effect is undone.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Requests / outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub issue_type: String,
    pub title: String,
    pub actor: String,
    pub parent: Option<String>,
    pub dependencies: Vec<String>,
    pub related: Vec<String>,
    pub domains: Vec<String>,
    pub tags: Vec<String>,
    pub files: Vec<String>,
    pub criticality: Option<Criticality>,
    pub auto_confirm: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    pub op_id: String,
    pub id: String,
    pub action: Action,
    pub from: String,
    pub to: String,
    pub noop: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isolation: Option<Isolation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub merged_files: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Finding>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub verification: Vec<VerifyResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub id: String,
    pub files: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FixRecord {
    pub id: String,
    pub changes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LintOutcome {
    pub checked: usize,
    pub findings: Vec<Finding>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fixed: Vec<FixRecord>,
    pub passed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ArchiveRequest {
    /// Explicit ids; when empty, every closed issue past the age cutoff.
    pub ids: Vec<String>,
    pub older_than_days: Option<u32>,
    pub dry_run: bool,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveEntry {
    pub id: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub id: String,
    pub path: String,
    pub referrers: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssueView {
    pub meta: IssueMeta,
    pub path: String,
    pub body: String,
    pub checklist: Vec<ChecklistItem>,
    pub children: Vec<String>,
    pub blockers: Vec<String>,
    pub dependents: Vec<String>,
    pub related: Vec<String>,
    pub isolation_present: bool,
}

/// A failed transition and how it should be recorded in the audit log.
struct Failure {
    error: TrellisError,
    outcome: Outcome,
}

impl From<TrellisError> for Failure {
    fn from(error: TrellisError) -> Self {
        Self {
            error,
            outcome: Outcome::Failed,
        }
    }
}

/// The git effect applied so far, kept so it can be undone.
enum Undo {
    Isolation(BeginOutcome),
    Merge(FinalizeOutcome),
}

fn owned(ids: Vec<&str>) -> Vec<String> {
    ids.into_iter().map(str::to_string).collect()
}

fn state_label(issue: &Issue) -> String {
    format!("{}/{}", issue.meta.status, issue.meta.stage)
}

fn target_label(effects: &[Effect]) -> Option<String> {
    effects.iter().find_map(|e| match e {
        Effect::SetState { status, stage } => Some(format!("{status}/{stage}")),
        _ => None,
    })
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

fn dedup(values: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for v in values {
        let v = v.trim();
        if !v.is_empty() {
            push_unique(&mut out, v);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    root: PathBuf,
    config: Config,
    store: IssueStore,
    git: GitContext,
    governance: GovernanceEngine,
    hooks: HookInterceptor,
    graph: RelationGraph,
    cancel: CancelToken,
    stale_after: Duration,
}

impl Engine {
    /// Load the project configuration under `root` and index its issues.
    pub fn open(root: &Path) -> Result<Self> {
        let config = Config::load(root)?;
        Self::with_config(root, config)
    }

    pub fn with_config(root: &Path, config: Config) -> Result<Self> {
        let store = IssueStore::new(root, &config);
        let git = GitContext::from_config(root, &config);
        let hooks = HookInterceptor::load(root, &config)?;
        let graph = RelationGraph::from_issues(&store.list()?);
        Ok(Self {
            root: root.to_path_buf(),
            stale_after: Duration::from_secs(config.locks.stale_after_secs),
            config,
            store,
            git,
            governance: GovernanceEngine::default(),
            hooks,
            graph,
            cancel: CancelToken::new(),
        })
    }

    /// Skip hook scripts for this engine. Every skipped dispatch is audited.
    pub fn with_bypass_hooks(mut self, bypass: bool) -> Self {
        if bypass {
            self.hooks = self.hooks.with_bypass(true);
        }
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &IssueStore {
        &self.store
    }

    pub fn git(&self) -> &GitContext {
        &self.git
    }

    pub fn hooks(&self) -> &HookInterceptor {
        &self.hooks
    }

    pub fn graph(&self) -> &RelationGraph {
        &self.graph
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    // -----------------------------------------------------------------------
    // Shared steps
    // -----------------------------------------------------------------------

    fn lock_issue(&self, id: &str, purpose: &str) -> Result<FileLock> {
        paths::validate_id(id)?;
        FileLock::try_acquire(&paths::lock_path(&self.root, id), purpose, self.stale_after)
    }

    fn reload_graph(&mut self) -> Result<()> {
        self.graph = RelationGraph::from_issues(&self.store.list()?);
        Ok(())
    }

    fn check_cancel(&self, before: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(TrellisError::Cancelled(before.to_string()));
        }
        Ok(())
    }

    fn workdir(&self, issue: &Issue) -> PathBuf {
        issue
            .meta
            .isolation
            .as_ref()
            .and_then(|iso| iso.worktree.as_ref())
            .map(|rel| self.root.join(rel))
            .filter(|dir| dir.is_dir())
            .unwrap_or_else(|| self.root.clone())
    }

    /// Branch and trunk diffs for an open issue whose isolation still exists.
    fn git_inputs(&self, issue: &Issue) -> (Option<Vec<String>>, Option<Vec<String>>) {
        let Some(iso) = issue.meta.isolation.as_ref() else {
            return (None, None);
        };
        if issue.meta.status != Status::Open || !self.git.is_repo() || !self.git.isolation_present(iso) {
            return (None, None);
        }
        let changed = self
            .git
            .changed_files(iso)
            .map_err(|e| tracing::warn!(id = %issue.meta.id, error = %e, "cannot diff isolation branch"))
            .ok();
        let trunk = self
            .git
            .trunk_changes(iso)
            .map_err(|e| tracing::warn!(id = %issue.meta.id, error = %e, "cannot diff trunk"))
            .ok();
        (changed, trunk)
    }

    fn with_rule_context<T>(
        &self,
        issue: &Issue,
        path: Option<&Path>,
        strictness: Strictness,
        f: impl FnOnce(&RuleContext) -> T,
    ) -> T {
        let (changed, trunk) = self.git_inputs(issue);
        let workdir = self.workdir(issue);
        let ctx = RuleContext {
            issue,
            path,
            root: &self.root,
            workdir: &workdir,
            config: &self.config,
            graph: &self.graph,
            strictness,
            changed_files: changed.as_deref(),
            trunk_changes: trunk.as_deref(),
        };
        f(&ctx)
    }

    /// Governance findings for one issue at the strictness of its stage.
    pub fn check(&self, id: &str) -> Result<Report> {
        let (issue, path) = self.store.load_with_path(id)?;
        let strictness = governance::strictness_of(&issue, &self.config);
        Ok(self.with_rule_context(&issue, Some(&path), strictness, |ctx| self.governance.check(ctx)))
    }

    fn verify(&self, issue: &Issue, action: Action) -> Result<Vec<VerifyResult>> {
        let commands = self.config.verification_for(action);
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let results = verify::run_all(&self.workdir(issue), commands);
        if verify::all_passed(&results) {
            return Ok(results);
        }
        let findings = results
            .last()
            .map(|r| {
                let output: String = r.output.chars().take(2000).collect();
                vec![Finding::error(
                    "verification",
                    &issue.meta.id,
                    format!("{} failed after {} attempt(s): {output}", r.name, r.attempt),
                )]
            })
            .unwrap_or_default();
        Err(TrellisError::Governance {
            id: issue.meta.id.clone(),
            findings,
        })
    }

    fn transition_input(&self, event: HookEvent, issue: &Issue, action: Action, actor: &str, to: &str) -> HookInput {
        HookInput::new(event, Caller::Engine, actor, &self.root.display().to_string()).with_payload(json!({
            "action": action.as_str(),
            "issue": issue.meta.id,
            "type": issue.meta.issue_type,
            "title": issue.meta.title,
            "from": state_label(issue),
            "to": to,
            "files": issue.meta.files,
        }))
    }

    fn post_hooks(&self, input: &HookInput) {
        let agg = self.hooks.dispatch(input);
        if !agg.is_allowed() {
            tracing::warn!(
                event = %input.event,
                reason = agg.decision.reason.as_deref().unwrap_or(""),
                "post-transition hook objected after the change was applied"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Create
    // -----------------------------------------------------------------------

    pub fn create(&mut self, req: &CreateRequest) -> Result<Issue> {
        let title = req.title.trim();
        if title.is_empty() {
            return Err(TrellisError::Validation("title must not be empty".into()));
        }
        let def = self.config.type_def(&req.issue_type)?.clone();
        let stage = self
            .config
            .workflow
            .initial_stage()
            .ok_or_else(|| TrellisError::Config("no stage with role 'pending'".into()))?;
        self.reload_graph()?;

        let pre = HookInput::new(
            HookEvent::PreTransition,
            Caller::Engine,
            &req.actor,
            &self.root.display().to_string(),
        )
        .with_payload(json!({
            "action": Action::Create.as_str(),
            "type": def.name,
            "title": title,
            "to": format!("{}/{stage}", Status::Open),
            "files": req.files,
        }));
        self.hooks.enforce(&pre, req.auto_confirm)?;

        let graph = &self.graph;
        let store = &self.store;
        let issue = store.with_next_id(&def.name, |id| {
            let mut issue = Issue::new(id, def.name.clone(), title, stage.clone());
            let m = &mut issue.meta;
            m.parent = req.parent.as_deref().map(str::trim).filter(|p| !p.is_empty()).map(str::to_string);
            m.dependencies = dedup(&req.dependencies);
            m.related = dedup(&req.related);
            m.domains = dedup(&req.domains);
            m.tags = dedup(&req.tags);
            m.files = dedup(&req.files);
            m.criticality = req.criticality.unwrap_or_default();
            for link in m.parent.iter().chain(&m.dependencies).chain(&m.related) {
                paths::validate_id(link)?;
            }
            graph.check_links(&issue)?;
            store.insert(&issue)?;
            Ok(issue)
        })?;

        let to = state_label(&issue);
        self.post_hooks(&self.transition_input(HookEvent::PostTransition, &issue, Action::Create, &req.actor, &to));
        self.graph.upsert(&issue);
        history::record(
            &self.root,
            &AuditEvent::new("create", &req.actor)
                .issue(&issue.meta.id)
                .action(Action::Create.as_str())
                .states("", to),
        );
        tracing::info!(id = %issue.meta.id, title = %issue.meta.title, "issue created");
        Ok(issue)
    }

    // -----------------------------------------------------------------------
    // Transition
    // -----------------------------------------------------------------------

    pub fn transition(&mut self, req: &TransitionRequest) -> Result<TransitionOutcome> {
        let op_id = history::new_op_id();
        let _lock = self.lock_issue(&req.id, req.action.as_str())?;
        self.reload_graph()?;
        let (issue, path) = self.store.load_with_path(&req.id)?;
        let from = state_label(&issue);
        let audit = AuditEvent::new("transition", &req.actor)
            .with_op_id(&op_id)
            .issue(&req.id)
            .action(req.action.as_str());

        match self.apply(req, issue, &path, &op_id) {
            Ok(outcome) => {
                let result = if outcome.noop { Outcome::Noop } else { Outcome::Ok };
                history::record(
                    &self.root,
                    &audit
                        .states(from, outcome.to.clone())
                        .outcome(result)
                        .detail(json!({ "commit": outcome.commit, "reason": outcome.reason })),
                );
                Ok(outcome)
            }
            Err(Failure { error, outcome }) => {
                tracing::warn!(id = %req.id, action = %req.action, error = %error, "transition failed");
                history::record(
                    &self.root,
                    &audit
                        .states(from.clone(), from)
                        .outcome(outcome)
                        .detail(json!({ "code": error.code(), "error": error.to_string() })),
                );
                Err(error)
            }
        }
    }

    fn apply(
        &mut self,
        req: &TransitionRequest,
        issue: Issue,
        path: &Path,
        op_id: &str,
    ) -> std::result::Result<TransitionOutcome, Failure> {
        if issue.meta.recovery.is_some() {
            return Err(TrellisError::RecoveryRequired(issue.meta.id.clone()).into());
        }
        let facts = PlanFacts {
            isolation_present: match &issue.meta.isolation {
                Some(iso) => self.git.isolation_present(iso),
                None => false,
            },
            open_blockers: owned(self.graph.blockers(&issue.meta.id)),
        };
        let plan = StateMachine::new(&self.config).plan(&issue, req, &facts)?;
        let from = state_label(&issue);
        let mut outcome = TransitionOutcome {
            op_id: op_id.to_string(),
            id: issue.meta.id.clone(),
            action: req.action,
            from: from.clone(),
            to: from.clone(),
            noop: false,
            reason: None,
            isolation: None,
            commit: None,
            merged_files: Vec::new(),
            warnings: Vec::new(),
            verification: Vec::new(),
        };
        let effects = match plan {
            Plan::Noop { reason } => {
                tracing::info!(id = %issue.meta.id, action = %req.action, %reason, "nothing to do");
                outcome.noop = true;
                outcome.reason = Some(reason);
                return Ok(outcome);
            }
            Plan::Apply { effects } => effects,
        };
        outcome.to = target_label(&effects).unwrap_or(from);

        self.check_cancel("pre-transition hooks")?;
        let pre = self.transition_input(HookEvent::PreTransition, &issue, req.action, &req.actor, &outcome.to);
        self.hooks.enforce(&pre, req.options.auto_confirm)?;

        let now = Utc::now();
        let mut updated = issue.clone();
        let mut undo: Option<Undo> = None;
        for effect in &effects {
            match effect {
                Effect::Gate { strictness } => {
                    let report = self.with_rule_context(&issue, Some(path), *strictness, |ctx| {
                        self.governance.gate(ctx)
                    })?;
                    outcome.warnings = report.warnings().cloned().collect();
                }
                Effect::Verify => {
                    outcome.verification = self.verify(&issue, req.action)?;
                }
                Effect::BeginIsolation { mode } => {
                    self.check_cancel("isolation")?;
                    let begun = self.git.begin_isolation(&issue, *mode)?;
                    updated.meta.isolation = Some(begun.isolation.clone());
                    outcome.isolation = Some(begun.isolation.clone());
                    undo = Some(Undo::Isolation(begun));
                }
                Effect::Finalize => {
                    self.check_cancel("merge")?;
                    let solution = req
                        .solution
                        .clone()
                        .unwrap_or_else(|| self.config.workflow.default_solution.clone());
                    let merged = self.git.finalize(&issue, &issue.meta.files, &solution)?;
                    outcome.commit = merged.commit.clone();
                    outcome.merged_files = merged.files.clone();
                    undo = Some(Undo::Merge(merged));
                }
                Effect::SetState { status, stage } => {
                    updated.meta.status = *status;
                    updated.meta.stage = stage.clone();
                    updated.meta.closed_at = (*status == Status::Closed).then_some(now);
                    if req.action == Action::Start && updated.meta.started_at.is_none() {
                        updated.meta.started_at = Some(now);
                    }
                }
                Effect::SetSolution { solution } => {
                    updated.meta.solution = Some(solution.clone());
                }
                Effect::RecordFeedback { message } => {
                    updated.meta.feedback.push(Feedback {
                        actor: req.actor.clone(),
                        message: message.clone(),
                        at: now,
                    });
                }
                Effect::Persist => {
                    if self.cancel.is_cancelled() {
                        return Err(self.undo(&issue, undo.take(), TrellisError::Cancelled("store write".into())));
                    }
                    updated.meta.updated_at = now;
                    if let Err(e) = self.store.save(&updated) {
                        return Err(self.undo(&issue, undo.take(), e));
                    }
                }
                Effect::Cleanup => {
                    if let Some(iso) = &issue.meta.isolation {
                        if let Err(e) = self.git.cleanup(iso) {
                            tracing::warn!(
                                id = %issue.meta.id,
                                branch = %iso.branch,
                                error = %e,
                                "isolation cleanup failed; remove the branch by hand"
                            );
                        }
                    }
                }
            }
        }

        let post = self.transition_input(HookEvent::PostTransition, &updated, req.action, &req.actor, &outcome.to);
        self.post_hooks(&post);
        self.graph.upsert(&updated);
        tracing::info!(id = %updated.meta.id, action = %req.action, to = %outcome.to, "transition applied");
        Ok(outcome)
    }

    /// Undo the git effect after a failed store write. A failed undo leaves a
    /// recovery marker on the original record.
    fn undo(&self, original: &Issue, undo: Option<Undo>, error: TrellisError) -> Failure {
        let rollback = match &undo {
            None => return error.into(),
            Some(Undo::Isolation(begun)) => self.git.rollback_isolation(begun),
            Some(Undo::Merge(merged)) => match merged.commit {
                Some(_) => self.git.rollback_finalize(&merged.pre_head),
                None => Ok(()),
            },
        };
        match rollback {
            Ok(()) => {
                tracing::warn!(id = %original.meta.id, error = %error, "git effect rolled back");
                Failure {
                    error,
                    outcome: Outcome::RolledBack,
                }
            }
            Err(rollback_err) => {
                let detail = format!("{error}; rollback failed: {rollback_err}");
                tracing::error!(id = %original.meta.id, %detail, "issue needs manual recovery");
                let mut marked = original.clone();
                marked.meta.recovery = Some(RecoveryMarker {
                    reason: detail.clone(),
                    at: Utc::now(),
                });
                if let Err(e) = self.store.save(&marked) {
                    tracing::error!(id = %original.meta.id, error = %e, "could not write recovery marker");
                }
                Failure {
                    error: TrellisError::transaction("rollback", detail),
                    outcome: Outcome::NeedsRecovery,
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Edits
    // -----------------------------------------------------------------------

    /// Load, change and save one open or shelved issue under its lock.
    fn edit(
        &mut self,
        id: &str,
        actor: &str,
        kind: &str,
        f: impl FnOnce(&Engine, &mut Issue) -> Result<serde_json::Value>,
    ) -> Result<Issue> {
        let _lock = self.lock_issue(id, kind)?;
        self.reload_graph()?;
        let mut issue = self.store.load(id)?;
        if issue.meta.status == Status::Closed {
            return Err(TrellisError::Validation(format!(
                "{id} is closed; closed records are frozen"
            )));
        }
        let detail = f(self, &mut issue)?;
        issue.touch();
        self.store.save(&issue)?;
        self.graph.upsert(&issue);
        history::record(
            &self.root,
            &AuditEvent::new(kind, actor).issue(id).detail(detail),
        );
        Ok(issue)
    }

    pub fn link(&mut self, id: &str, kind: RelationKind, target: &str, actor: &str) -> Result<Issue> {
        let target = target.trim().to_string();
        self.edit(id, actor, "link", |engine, issue| {
            paths::validate_id(&target)?;
            match kind {
                RelationKind::Parent => issue.meta.parent = Some(target.clone()),
                RelationKind::Dependency => push_unique(&mut issue.meta.dependencies, &target),
                RelationKind::Related => push_unique(&mut issue.meta.related, &target),
            }
            engine.graph.check_links(issue)?;
            Ok(json!({ "kind": kind.as_str(), "target": target }))
        })
    }

    pub fn unlink(&mut self, id: &str, kind: RelationKind, target: &str, actor: &str) -> Result<Issue> {
        let target = target.trim().to_string();
        self.edit(id, actor, "unlink", |_, issue| {
            let removed = match kind {
                RelationKind::Parent => {
                    let hit = issue.meta.parent.as_deref() == Some(target.as_str());
                    if hit {
                        issue.meta.parent = None;
                    }
                    hit
                }
                RelationKind::Dependency => {
                    let before = issue.meta.dependencies.len();
                    issue.meta.dependencies.retain(|d| d != &target);
                    before != issue.meta.dependencies.len()
                }
                RelationKind::Related => {
                    let before = issue.meta.related.len();
                    issue.meta.related.retain(|d| d != &target);
                    before != issue.meta.related.len()
                }
            };
            if !removed {
                return Err(TrellisError::Validation(format!(
                    "{} has no {kind} link to {target}",
                    issue.meta.id
                )));
            }
            Ok(json!({ "kind": kind.as_str(), "target": target, "removed": true }))
        })
    }

    /// Re-mark the `index`-th (1-based) checklist item.
    pub fn check_item(&mut self, id: &str, index: usize, mark: CheckMark, actor: &str) -> Result<Issue> {
        self.edit(id, actor, "edit", |_, issue| {
            issue.body = issue::set_check(&issue.body, index, mark)?;
            Ok(json!({ "checklist_item": index, "mark": mark }))
        })
    }

    /// Append a review note under the configured review heading.
    pub fn note(&mut self, id: &str, message: &str, actor: &str) -> Result<Issue> {
        let message = message.trim();
        if message.is_empty() {
            return Err(TrellisError::Validation("note must not be empty".into()));
        }
        let heading = self.config.governance.review_heading.clone();
        self.edit(id, actor, "edit", |_, issue| {
            issue.body = issue::append_to_section(&issue.body, &heading, &format!("- {actor}: {message}"));
            Ok(json!({ "note": message }))
        })
    }

    /// Replace the tracked-file list with what the isolation branch changed.
    pub fn sync(&mut self, id: &str, actor: &str) -> Result<SyncOutcome> {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let issue = self.edit(id, actor, "sync", |engine, issue| {
            let iso = issue
                .meta
                .isolation
                .clone()
                .filter(|iso| engine.git.isolation_present(iso))
                .ok_or_else(|| {
                    TrellisError::Validation(format!(
                        "{} has no isolation branch; run 'trellis start {}' first",
                        issue.meta.id, issue.meta.id
                    ))
                })?;
            let changed = engine.git.changed_files(&iso)?;
            added = changed
                .iter()
                .filter(|f| !issue.meta.files.contains(f))
                .cloned()
                .collect();
            removed = issue
                .meta
                .files
                .iter()
                .filter(|f| !changed.contains(f))
                .cloned()
                .collect();
            issue.meta.files = changed;
            Ok(json!({ "added": added, "removed": removed }))
        })?;
        Ok(SyncOutcome {
            id: issue.meta.id,
            files: issue.meta.files,
            added,
            removed,
        })
    }

    // -----------------------------------------------------------------------
    // Corpus operations
    // -----------------------------------------------------------------------

    /// Run every rule over every record at the strictness of its stage.
    pub fn lint(&mut self, fix: bool, actor: &str) -> Result<LintOutcome> {
        let fixed = if fix { self.apply_fixes(actor)? } else { Vec::new() };
        self.reload_graph()?;

        let records = self.store.scan()?;
        let mut findings = Vec::new();
        let mut seen: HashMap<String, String> = HashMap::new();
        let mut issues = Vec::new();
        for record in &records {
            let rel = paths::relative(&self.root, &record.path);
            match &record.issue {
                Err(reason) => findings.push(Finding::error(
                    "schema",
                    record.file_id().unwrap_or_else(|| rel.clone()),
                    reason.clone(),
                )),
                Ok(issue) => {
                    if let Some(previous) = seen.insert(issue.meta.id.clone(), rel.clone()) {
                        findings.push(Finding::error(
                            "schema",
                            &issue.meta.id,
                            format!("duplicate id in {previous} and {rel}"),
                        ));
                    }
                    let strictness = governance::strictness_of(issue, &self.config);
                    let report = self.with_rule_context(issue, Some(&record.path), strictness, |ctx| {
                        self.governance.check(ctx)
                    });
                    findings.extend(report.findings);
                    issues.push(issue.clone());
                }
            }
        }
        findings.extend(governance::check_coverage(&issues, &self.config));
        let passed = !findings.iter().any(|f| f.severity == Severity::Error);
        Ok(LintOutcome {
            checked: records.len(),
            findings,
            fixed,
            passed,
        })
    }

    fn apply_fixes(&mut self, actor: &str) -> Result<Vec<FixRecord>> {
        self.reload_graph()?;
        let mut out = Vec::new();
        for record in self.store.scan()? {
            let Ok(issue) = &record.issue else {
                continue;
            };
            let id = issue.meta.id.clone();
            let _lock = match self.lock_issue(&id, "lint --fix") {
                Ok(lock) => lock,
                Err(TrellisError::Busy(holder)) => {
                    tracing::warn!(%id, %holder, "issue is busy, not fixing");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let strictness = governance::strictness_of(issue, &self.config);
            let (fixed, mut changes) =
                self.with_rule_context(issue, Some(&record.path), strictness, governance::fix_record);

            let expected = self.store.expected_dir(&fixed)?;
            let archived = fixed.meta.status == Status::Closed && self.store.is_archived(&record.path);
            let misplaced = !archived && record.path.parent() != Some(expected.as_path());
            if !changes.is_empty() {
                self.store.save(&fixed)?;
            } else if misplaced {
                self.store.refile(&id)?;
            }
            if misplaced {
                changes.push(format!("re-filed into {}", paths::relative(&self.root, &expected)));
            }
            if changes.is_empty() {
                continue;
            }
            tracing::info!(%id, changes = changes.len(), "record fixed");
            history::record(
                &self.root,
                &AuditEvent::new("lint-fix", actor)
                    .issue(&id)
                    .detail(json!({ "changes": changes })),
            );
            out.push(FixRecord { id, changes });
        }
        Ok(out)
    }

    /// Move closed records into `archived/`. Files are renamed, never rewritten.
    pub fn archive(&mut self, req: &ArchiveRequest) -> Result<Vec<ArchiveEntry>> {
        let candidates: Vec<Issue> = if req.ids.is_empty() {
            let days = req.older_than_days.unwrap_or(self.config.archive.after_days);
            let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
            self.store
                .list()?
                .into_iter()
                .filter(|i| i.meta.status == Status::Closed)
                .filter(|i| i.meta.closed_at.map(|c| c <= cutoff).unwrap_or(false))
                .collect()
        } else {
            req.ids
                .iter()
                .map(|id| self.store.load(id))
                .collect::<Result<Vec<_>>>()?
        };

        let mut out = Vec::new();
        for issue in candidates {
            let id = issue.meta.id.clone();
            if issue.meta.status != Status::Closed {
                return Err(TrellisError::Validation(format!(
                    "{id} is {}; only closed issues can be archived",
                    issue.meta.status
                )));
            }
            let path = self.store.locate(&id)?;
            if self.store.is_archived(&path) {
                continue;
            }
            let from = paths::relative(&self.root, &path);
            let to = if req.dry_run {
                let folder = path.parent().and_then(Path::parent).unwrap_or(&self.root);
                let name = path.file_name().unwrap_or_default();
                paths::relative(&self.root, &folder.join(paths::ARCHIVED_DIR).join(name))
            } else {
                let _lock = self.lock_issue(&id, "archive")?;
                let target = self.store.archive(&id)?;
                let to = paths::relative(&self.root, &target);
                history::record(
                    &self.root,
                    &AuditEvent::new("archive", &req.actor)
                        .issue(&id)
                        .detail(json!({ "from": from, "to": to })),
                );
                to
            };
            out.push(ArchiveEntry { id, from, to });
        }
        Ok(out)
    }

    /// Remove a record for good. The full content goes into the audit log
    /// before the file is deleted.
    pub fn delete(&mut self, id: &str, reason: &str, force: bool, actor: &str) -> Result<DeleteOutcome> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(TrellisError::Validation("delete requires a reason".into()));
        }
        let _lock = self.lock_issue(id, "delete")?;
        self.reload_graph()?;
        let (issue, path) = self.store.load_with_path(id)?;
        let referrers: Vec<String> = self
            .graph
            .referrers(id)
            .into_iter()
            .map(|(from, kind)| format!("{from} ({kind})"))
            .collect();
        if !referrers.is_empty() && !force {
            return Err(TrellisError::Validation(format!(
                "{id} is referenced by {}; pass --force to delete anyway",
                referrers.join(", ")
            )));
        }

        let rel = paths::relative(&self.root, &path);
        let snapshot = std::fs::read_to_string(&path)?;
        history::append(
            &self.root,
            &AuditEvent::new("delete", actor).issue(id).detail(json!({
                "reason": reason,
                "path": rel,
                "referrers": referrers,
                "snapshot": snapshot,
            })),
        )?;

        if let Some(iso) = &issue.meta.isolation {
            if issue.meta.status != Status::Closed && self.git.is_repo() && self.git.isolation_present(iso) {
                if let Err(e) = self.git.cleanup(iso) {
                    tracing::warn!(%id, error = %e, "could not remove isolation of deleted issue");
                }
            }
        }
        self.store.remove(id)?;
        self.graph.remove(id);
        tracing::info!(%id, %reason, "issue deleted");
        Ok(DeleteOutcome {
            id: id.to_string(),
            path: rel,
            referrers,
        })
    }

    /// Clear a needs-manual-recovery marker once the repository has been
    /// put right by hand.
    pub fn recover(&mut self, id: &str, actor: &str) -> Result<Issue> {
        let _lock = self.lock_issue(id, "recover")?;
        let mut issue = self.store.load(id)?;
        let marker = issue.meta.recovery.take().ok_or_else(|| {
            TrellisError::Validation(format!("{id} is not marked for recovery"))
        })?;
        if self.git.is_repo() {
            if let Ok(dirty) = self.git.dirty_paths(&self.root) {
                if !dirty.is_empty() {
                    tracing::warn!(%id, paths = ?dirty, "working tree still has uncommitted changes");
                }
            }
        }
        issue.touch();
        self.store.save(&issue)?;
        history::record(
            &self.root,
            &AuditEvent::new("recover", actor)
                .issue(id)
                .outcome(Outcome::Ok)
                .detail(json!({ "reason": marker.reason, "marked_at": marker.at })),
        );
        Ok(issue)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn list(&self, filter: &Filter) -> Result<Vec<Issue>> {
        Ok(filter.apply(self.store.list()?))
    }

    pub fn show(&self, id: &str) -> Result<IssueView> {
        let (issue, path) = self.store.load_with_path(id)?;
        let isolation_present = match &issue.meta.isolation {
            Some(iso) => self.git.is_repo() && self.git.isolation_present(iso),
            None => false,
        };
        Ok(IssueView {
            path: paths::relative(&self.root, &path),
            checklist: issue.checklist(),
            children: owned(self.graph.children(id)),
            blockers: owned(self.graph.blockers(id)),
            dependents: owned(self.graph.dependents(id)),
            related: owned(self.graph.related(id)),
            isolation_present,
            meta: issue.meta,
            body: issue.body,
        })
    }

    // -----------------------------------------------------------------------
    // Setup
    // -----------------------------------------------------------------------

    /// Scaffold configuration, hook and issue directories. Existing files are
    /// left alone, so running it twice is harmless.
    pub fn init(root: &Path, project: &str) -> Result<Vec<String>> {
        let mut created = Vec::new();
        let config_path = paths::config_path(root);
        let config = if config_path.exists() {
            Config::load(root)?
        } else {
            let config = Config::new(project);
            config.save(root)?;
            created.push(paths::CONFIG_FILE.to_string());
            config
        };
        for dir in [
            paths::hooks_dir(root),
            paths::locks_dir(root),
            root.join(&config.issues_root),
        ] {
            if !dir.is_dir() {
                io::ensure_dir(&dir)?;
                created.push(paths::relative(root, &dir));
            }
        }
        for entry in [
            format!("{}/", paths::LOCKS_DIR),
            format!("{}/", paths::WORKTREES_DIR),
        ] {
            io::ensure_gitignore_entry(root, &entry)?;
        }
        tracing::info!(root = %root.display(), created = created.len(), "project initialised");
        Ok(created)
    }

    /// Write git hook shims that forward to `trellis hook run`. Hooks not
    /// written by trellis are left in place.
    pub fn install_git_hooks(&self) -> Result<Vec<String>> {
        GitContext::ensure_available()?;
        let dir = self.git.hooks_dir()?;
        io::ensure_dir(&dir)?;
        let mut installed = Vec::new();
        for event in crate::hook::adapter::native_events(Caller::Git) {
            let path = dir.join(event);
            if path.exists() {
                let existing = std::fs::read_to_string(&path)?;
                if !existing.contains(GIT_SHIM_MARKER) {
                    tracing::warn!(hook = %path.display(), "existing git hook left untouched");
                    continue;
                }
            }
            let shim = format!(
                "#!/bin/sh\n# {GIT_SHIM_MARKER}\nexec trellis hook run --caller git --event {event} \"$@\"\n"
            );
            io::atomic_write(&path, shim.as_bytes())?;
            make_executable(&path)?;
            installed.push(paths::relative(&self.root, &path));
        }
        Ok(installed)
    }
}

const GIT_SHIM_MARKER: &str = "installed by trellis";

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
