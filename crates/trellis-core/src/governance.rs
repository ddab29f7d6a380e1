use crate::config::Config;
use crate::error::{Result, TrellisError};
use crate::graph::RelationGraph;
use crate::issue::{self, Issue};
use crate::paths;
use crate::types::{RelationKind, StageRole, Status};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

// ---------------------------------------------------------------------------
// Strictness / Severity
// ---------------------------------------------------------------------------

/// How hard the rules bite. Derived from the stage role of the issue being
/// checked, or forced by a transition gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    Loose,
    Standard,
    Strict,
    /// Closed records: content rules are silent, edits are not.
    Frozen,
}

impl Strictness {
    pub fn for_role(role: StageRole) -> Self {
        match role {
            StageRole::Pending | StageRole::Parked => Strictness::Loose,
            StageRole::Active => Strictness::Standard,
            StageRole::Review => Strictness::Strict,
            StageRole::Terminal => Strictness::Frozen,
        }
    }

    fn rank(self) -> Option<u8> {
        match self {
            Strictness::Loose => Some(0),
            Strictness::Standard => Some(1),
            Strictness::Strict => Some(2),
            Strictness::Frozen => None,
        }
    }

    /// True when content rules that start biting at `level` apply.
    pub fn reaches(self, level: Strictness) -> bool {
        match (self.rank(), level.rank()) {
            (Some(a), Some(b)) => a >= b,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Strictness::Loose => "loose",
            Strictness::Standard => "standard",
            Strictness::Strict => "strict",
            Strictness::Frozen => "frozen",
        }
    }
}

impl fmt::Display for Strictness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// Finding / Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub rule: String,
    pub severity: Severity,
    pub issue: String,
    pub message: String,
    #[serde(default)]
    pub fixable: bool,
}

impl Finding {
    pub fn new(
        rule: impl Into<String>,
        severity: Severity,
        issue: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            rule: rule.into(),
            severity,
            issue: issue.into(),
            message: message.into(),
            fixable: false,
        }
    }

    pub fn error(rule: impl Into<String>, issue: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(rule, Severity::Error, issue, message)
    }

    pub fn warning(
        rule: impl Into<String>,
        issue: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(rule, Severity::Warning, issue, message)
    }

    pub fn fixable(mut self) -> Self {
        self.fixable = true;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Report {
    pub findings: Vec<Finding>,
    pub passed: bool,
}

impl Report {
    pub fn from_findings(findings: Vec<Finding>) -> Self {
        let passed = !findings.iter().any(|f| f.severity == Severity::Error);
        Self { findings, passed }
    }

    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Warning)
    }

    pub fn extend(&mut self, findings: impl IntoIterator<Item = Finding>) {
        self.findings.extend(findings);
        self.passed = !self.findings.iter().any(|f| f.severity == Severity::Error);
    }
}

// ---------------------------------------------------------------------------
// RuleContext
// ---------------------------------------------------------------------------

/// Everything a rule may look at. Git-derived inputs are optional: rules that
/// need them stay quiet when they are absent.
pub struct RuleContext<'a> {
    pub issue: &'a Issue,
    /// Where the record was found, when it came from disk.
    pub path: Option<&'a Path>,
    pub root: &'a Path,
    /// Directory holding the issue's working copy (worktree or root).
    pub workdir: &'a Path,
    pub config: &'a Config,
    pub graph: &'a RelationGraph,
    pub strictness: Strictness,
    /// Files changed on the isolation branch since its base.
    pub changed_files: Option<&'a [String]>,
    /// Files changed on trunk since the isolation branch was cut.
    pub trunk_changes: Option<&'a [String]>,
}

impl<'a> RuleContext<'a> {
    fn id(&self) -> &str {
        &self.issue.meta.id
    }

    fn is_open(&self) -> bool {
        self.issue.meta.status == Status::Open
    }
}

// ---------------------------------------------------------------------------
// Rule table
// ---------------------------------------------------------------------------

pub struct Rule {
    pub id: &'static str,
    pub description: &'static str,
    pub check: fn(&RuleContext) -> Vec<Finding>,
}

macro_rules! rule {
    ($id:expr, $desc:expr, $check:expr) => {
        Rule {
            id: $id,
            description: $desc,
            check: $check,
        }
    };
}

pub fn default_rules() -> Vec<Rule> {
    vec![
        rule!("schema", "metadata is complete and consistent", check_schema),
        rule!("links", "relations resolve and are acyclic", check_links),
        rule!("placeholders", "no placeholder markers in the record", check_placeholders),
        rule!("tracked-files", "tracked files are declared and match the diff", check_tracked_files),
        rule!("coverage", "children inherit their parent's domains", check_domain_inheritance),
        rule!("directory", "record lives in its status directory", check_directory),
        rule!("checklist", "every checklist item is resolved", check_checklist),
        rule!("review-notes", "review notes are recorded", check_review_notes),
        rule!("dependencies-closed", "all dependencies are closed", check_dependencies_closed),
        rule!("frozen", "closed records are not edited", check_frozen),
        rule!("isolation", "tracked files are not changed on trunk", check_isolation),
    ]
}

// ---------------------------------------------------------------------------
// GovernanceEngine
// ---------------------------------------------------------------------------

pub struct GovernanceEngine {
    rules: Vec<Rule>,
}

impl Default for GovernanceEngine {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl GovernanceEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn check(&self, ctx: &RuleContext) -> Report {
        let mut findings = Vec::new();
        for rule in &self.rules {
            findings.extend((rule.check)(ctx));
        }
        Report::from_findings(findings)
    }

    /// Run the rules and turn a failing report into a `Governance` error.
    pub fn gate(&self, ctx: &RuleContext) -> Result<Report> {
        let report = self.check(ctx);
        if report.passed {
            Ok(report)
        } else {
            Err(TrellisError::Governance {
                id: ctx.id().to_string(),
                findings: report.findings,
            })
        }
    }
}

/// Strictness implied by the stage an issue currently sits in.
pub fn strictness_of(issue: &Issue, config: &Config) -> Strictness {
    config
        .workflow
        .role_of(&issue.meta.stage)
        .map(Strictness::for_role)
        .unwrap_or(Strictness::Loose)
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

fn check_schema(ctx: &RuleContext) -> Vec<Finding> {
    let m = &ctx.issue.meta;
    let id = ctx.id();
    let wf = &ctx.config.workflow;
    let mut out = Vec::new();

    if m.title.trim().is_empty() {
        out.push(Finding::error("schema", id, "title is empty"));
    }
    match ctx.config.type_for_id(id) {
        Ok(def) if !def.name.eq_ignore_ascii_case(&m.issue_type) => out.push(Finding::error(
            "schema",
            id,
            format!("id prefix {} belongs to type '{}', not '{}'", def.prefix, def.name, m.issue_type),
        )),
        Ok(def) if !def.allows_stage(&m.stage) => out.push(Finding::error(
            "schema",
            id,
            format!("type '{}' does not allow stage '{}'", def.name, m.stage),
        )),
        Ok(_) => {}
        Err(e) => out.push(Finding::error("schema", id, e.to_string())),
    }

    match wf.role_of(&m.stage) {
        None => out.push(
            Finding::error("schema", id, format!("unknown stage '{}'", m.stage)).fixable(),
        ),
        Some(_) if !wf.is_valid_pair(m.status, &m.stage) => out.push(
            Finding::error(
                "schema",
                id,
                format!("stage '{}' is not valid for status '{}'", m.stage, m.status),
            )
            .fixable(),
        ),
        Some(_) => {}
    }

    if m.updated_at < m.created_at {
        out.push(Finding::error("schema", id, "updated_at precedes created_at").fixable());
    }
    match (m.status, m.closed_at) {
        (Status::Closed, None) => {
            out.push(Finding::error("schema", id, "closed issue has no closed_at").fixable())
        }
        (Status::Open | Status::Backlog, Some(_)) => out.push(
            Finding::error("schema", id, format!("{} issue carries closed_at", m.status))
                .fixable(),
        ),
        _ => {}
    }

    if let Some(path) = ctx.path {
        let file_id = path
            .file_name()
            .and_then(|n| paths::id_from_file_name(&n.to_string_lossy()));
        if file_id.as_deref() != Some(id) {
            out.push(Finding::error(
                "schema",
                id,
                format!(
                    "file name {} does not match id",
                    path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
                ),
            ));
        }
    }
    out
}

fn check_links(ctx: &RuleContext) -> Vec<Finding> {
    let id = ctx.id();
    let mut out = Vec::new();
    for kind in [
        RelationKind::Parent,
        RelationKind::Dependency,
        RelationKind::Related,
    ] {
        for to in ctx.issue.links(kind) {
            if to == id {
                out.push(Finding::error("links", id, format!("{kind} points at itself")));
            } else if !ctx.graph.contains(to) {
                out.push(Finding::error("links", id, format!("{kind} {to} does not exist")));
            }
        }
    }
    for kind in [RelationKind::Parent, RelationKind::Dependency] {
        if let Some(path) = ctx.graph.cycle_from(id, kind) {
            if path.iter().any(|p| p == id) {
                out.push(Finding::error(
                    "links",
                    id,
                    format!("{kind} cycle: {}", path.join(" -> ")),
                ));
            }
        }
    }
    for reference in &ctx.issue.meta.workspace_refs {
        if let Some(message) = check_workspace_ref(ctx, reference) {
            out.push(Finding::error("links", id, message));
        }
    }
    out
}

fn check_workspace_ref(ctx: &RuleContext, reference: &str) -> Option<String> {
    let Some((namespace, target)) = reference.split_once("::") else {
        return Some(format!("workspace reference '{reference}' is not namespace::ID"));
    };
    if namespace.is_empty() || paths::validate_id(target).is_err() {
        return Some(format!("workspace reference '{reference}' is not namespace::ID"));
    }
    let configured = ctx.config.workspace.get(namespace)?;
    let project = {
        let p = Path::new(configured);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            ctx.root.join(p)
        }
    };
    let resolved = crate::config::Config::load(&project)
        .map(|cfg| crate::store::IssueStore::new(&project, &cfg))
        .and_then(|store| store.exists(target));
    match resolved {
        Ok(true) => None,
        Ok(false) => Some(format!("workspace reference '{reference}' does not resolve")),
        Err(e) => Some(format!("workspace reference '{reference}': {e}")),
    }
}

fn check_placeholders(ctx: &RuleContext) -> Vec<Finding> {
    let severity = if ctx.strictness.reaches(Strictness::Standard) {
        Severity::Error
    } else if ctx.strictness.reaches(Strictness::Loose) {
        Severity::Warning
    } else {
        return Vec::new();
    };
    let markers = &ctx.config.governance.placeholder_markers;
    let text = format!("{}\n{}", ctx.issue.meta.title, issue::strip_comments(&ctx.issue.body));
    let mut in_fence = false;
    let mut hits = Vec::new();
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        for marker in markers {
            if line.contains(marker.as_str()) && !hits.contains(marker) {
                hits.push(marker.clone());
            }
        }
    }
    if hits.is_empty() {
        return Vec::new();
    }
    vec![Finding::new(
        "placeholders",
        severity,
        ctx.id(),
        format!("placeholder markers present: {}", hits.join(", ")),
    )]
}

fn check_tracked_files(ctx: &RuleContext) -> Vec<Finding> {
    if !ctx.is_open() || !ctx.strictness.reaches(Strictness::Standard) {
        return Vec::new();
    }
    let id = ctx.id();
    let files = &ctx.issue.meta.files;
    if files.is_empty() {
        return vec![Finding::error(
            "tracked-files",
            id,
            "no tracked files declared",
        )];
    }
    let mut out = Vec::new();
    match ctx.changed_files {
        Some(changed) => {
            let unchanged: Vec<&str> = files
                .iter()
                .filter(|f| !changed.contains(f))
                .map(|f| f.as_str())
                .collect();
            if !unchanged.is_empty() {
                out.push(
                    Finding::error(
                        "tracked-files",
                        id,
                        format!("tracked files not changed on the branch: {}", unchanged.join(", ")),
                    )
                    .fixable(),
                );
            }
            let unclaimed: Vec<&str> = changed
                .iter()
                .filter(|f| !files.contains(f))
                .map(|f| f.as_str())
                .collect();
            if !unclaimed.is_empty() {
                out.push(Finding::warning(
                    "tracked-files",
                    id,
                    format!("changed files not tracked: {}", unclaimed.join(", ")),
                ));
            }
        }
        None => {
            let missing: Vec<&str> = files
                .iter()
                .filter(|f| !ctx.workdir.join(f.as_str()).exists())
                .map(|f| f.as_str())
                .collect();
            if !missing.is_empty() {
                out.push(
                    Finding::warning(
                        "tracked-files",
                        id,
                        format!("tracked files do not exist: {}", missing.join(", ")),
                    )
                    .fixable(),
                );
            }
        }
    }
    out
}

fn check_domain_inheritance(ctx: &RuleContext) -> Vec<Finding> {
    if !ctx.issue.meta.domains.is_empty() {
        return Vec::new();
    }
    let Some(parent) = ctx.issue.meta.parent.as_deref() else {
        return Vec::new();
    };
    match ctx.graph.node(parent) {
        Some(node) if !node.domains.is_empty() => vec![Finding::warning(
            "coverage",
            ctx.id(),
            format!("no domains; parent {parent} has {}", node.domains.join(", ")),
        )
        .fixable()],
        _ => Vec::new(),
    }
}

fn check_directory(ctx: &RuleContext) -> Vec<Finding> {
    let Some(path) = ctx.path else {
        return Vec::new();
    };
    let status = ctx.issue.meta.status;
    let dir = path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let folder = path
        .parent()
        .and_then(|p| p.parent())
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let dir_ok = dir == status.dir_name() || (status == Status::Closed && dir == paths::ARCHIVED_DIR);
    let folder_ok = ctx
        .config
        .type_def(&ctx.issue.meta.issue_type)
        .map(|def| def.folder == folder)
        .unwrap_or(true);
    if dir_ok && folder_ok {
        return Vec::new();
    }
    vec![Finding::error(
        "directory",
        ctx.id(),
        format!("{status} record found in {folder}/{dir}"),
    )
    .fixable()]
}

fn check_checklist(ctx: &RuleContext) -> Vec<Finding> {
    if !ctx.strictness.reaches(Strictness::Strict) {
        return Vec::new();
    }
    let open: Vec<String> = ctx
        .issue
        .checklist()
        .into_iter()
        .filter(|item| !item.mark.is_resolved())
        .map(|item| item.text)
        .collect();
    if open.is_empty() {
        return Vec::new();
    }
    vec![Finding::error(
        "checklist",
        ctx.id(),
        format!("{} unresolved checklist item(s): {}", open.len(), open.join("; ")),
    )]
}

fn check_review_notes(ctx: &RuleContext) -> Vec<Finding> {
    if !ctx.strictness.reaches(Strictness::Strict) {
        return Vec::new();
    }
    let heading = &ctx.config.governance.review_heading;
    let has_notes = ctx
        .issue
        .section(heading)
        .map(|s| !issue::strip_comments(&s).trim().is_empty())
        .unwrap_or(false);
    if has_notes {
        return Vec::new();
    }
    vec![Finding::error(
        "review-notes",
        ctx.id(),
        format!("'## {heading}' section is missing or empty"),
    )]
}

fn check_dependencies_closed(ctx: &RuleContext) -> Vec<Finding> {
    if !ctx.strictness.reaches(Strictness::Strict) {
        return Vec::new();
    }
    let open: Vec<&str> = ctx
        .issue
        .meta
        .dependencies
        .iter()
        .filter(|d| {
            ctx.graph
                .node(d)
                .map(|n| n.status != Status::Closed)
                .unwrap_or(false)
        })
        .map(|d| d.as_str())
        .collect();
    if open.is_empty() {
        return Vec::new();
    }
    vec![Finding::error(
        "dependencies-closed",
        ctx.id(),
        format!("dependencies still open: {}", open.join(", ")),
    )]
}

fn check_frozen(ctx: &RuleContext) -> Vec<Finding> {
    if ctx.strictness != Strictness::Frozen {
        return Vec::new();
    }
    match ctx.issue.meta.closed_at {
        Some(closed) if ctx.issue.meta.updated_at > closed => vec![Finding::error(
            "frozen",
            ctx.id(),
            format!(
                "edited at {} after closing at {}",
                ctx.issue.meta.updated_at.format("%Y-%m-%d %H:%M:%S"),
                closed.format("%Y-%m-%d %H:%M:%S")
            ),
        )],
        _ => Vec::new(),
    }
}

fn check_isolation(ctx: &RuleContext) -> Vec<Finding> {
    if !ctx.is_open() || !ctx.strictness.reaches(Strictness::Standard) {
        return Vec::new();
    }
    let (Some(_), Some(trunk)) = (&ctx.issue.meta.isolation, ctx.trunk_changes) else {
        return Vec::new();
    };
    let touched: Vec<&str> = ctx
        .issue
        .meta
        .files
        .iter()
        .filter(|f| trunk.contains(f))
        .map(|f| f.as_str())
        .collect();
    if touched.is_empty() {
        return Vec::new();
    }
    vec![Finding::error(
        "isolation",
        ctx.id(),
        format!("tracked files modified on trunk: {}", touched.join(", ")),
    )]
}

// ---------------------------------------------------------------------------
// Corpus-level coverage
// ---------------------------------------------------------------------------

/// Once the number of open high-level issues passes the threshold, at least
/// `coverage_ratio` of them must carry a domain.
pub fn check_coverage(issues: &[Issue], config: &Config) -> Vec<Finding> {
    let high_level: Vec<&Issue> = issues
        .iter()
        .filter(|i| i.meta.status == Status::Open)
        .filter(|i| {
            config
                .type_def(&i.meta.issue_type)
                .map(|d| d.high_level)
                .unwrap_or(false)
        })
        .collect();
    let total = high_level.len();
    if total <= config.governance.coverage_threshold {
        return Vec::new();
    }
    let covered = high_level.iter().filter(|i| !i.meta.domains.is_empty()).count();
    let ratio = covered as f64 / total as f64;
    if ratio >= config.governance.coverage_ratio {
        return Vec::new();
    }
    vec![Finding::error(
        "coverage",
        "*",
        format!(
            "{covered} of {total} open high-level issues carry a domain ({:.0}% < {:.0}%)",
            ratio * 100.0,
            config.governance.coverage_ratio * 100.0
        ),
    )]
}

// ---------------------------------------------------------------------------
// Auto-fix
// ---------------------------------------------------------------------------

/// Apply every in-record fix the rules know about. Returns a description of
/// each change; an empty list means the record was left untouched.
/// Re-filing misplaced records is a store operation and happens separately.
pub fn fix_record(ctx: &RuleContext) -> (Issue, Vec<String>) {
    let mut issue = ctx.issue.clone();
    let mut fixes = Vec::new();
    let wf = &ctx.config.workflow;
    let m = &mut issue.meta;

    let wanted_role = match m.status {
        Status::Backlog => Some(StageRole::Parked),
        Status::Closed => Some(StageRole::Terminal),
        Status::Open => None,
    };
    let stage_ok = wf.is_valid_pair(m.status, &m.stage);
    if !stage_ok {
        let replacement = match wanted_role {
            Some(role) => wf.stage_for(role),
            None => wf.initial_stage(),
        };
        if let Some(stage) = replacement {
            fixes.push(format!("stage {} -> {stage}", m.stage));
            m.stage = stage;
        }
    }

    if m.updated_at < m.created_at {
        m.updated_at = m.created_at;
        fixes.push("updated_at reset to created_at".to_string());
    }
    match (m.status, m.closed_at) {
        (Status::Closed, None) => {
            m.closed_at = Some(m.updated_at);
            fixes.push("closed_at filled from updated_at".to_string());
        }
        (Status::Open | Status::Backlog, Some(_)) => {
            m.closed_at = None;
            fixes.push("stale closed_at removed".to_string());
        }
        _ => {}
    }

    if m.status == Status::Open && !m.files.is_empty() {
        let before = m.files.len();
        let changed = ctx.changed_files;
        m.files.retain(|f| match changed {
            Some(changed) => changed.contains(f),
            None => ctx.workdir.join(f.as_str()).exists(),
        });
        if m.files.len() != before {
            fixes.push(format!("dropped {} dangling tracked file(s)", before - m.files.len()));
        }
    }

    if m.domains.is_empty() {
        if let Some(parent) = m.parent.as_deref().and_then(|p| ctx.graph.node(p)) {
            if !parent.domains.is_empty() {
                m.domains = parent.domains.clone();
                fixes.push(format!("inherited domains from {}", parent.id));
            }
        }
    }

    if !fixes.is_empty() && m.status != Status::Closed {
        issue.touch();
    }
    (issue, fixes)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
