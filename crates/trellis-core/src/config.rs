use crate::error::{Result, TrellisError};
use crate::hook::HookEvent;
use crate::paths;
use crate::types::{Action, Stage, StageRole, Status};
use crate::verify::VerifyCommand;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Taxonomy
// ---------------------------------------------------------------------------

/// One entry of the issue type registry: name → id prefix and folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: String,
    pub prefix: String,
    /// Plural folder under the issues root, e.g. `Features`.
    pub folder: String,
    /// High-level items (epics) count toward the domain coverage threshold.
    #[serde(default)]
    pub high_level: bool,
    /// Restricts the stages this type may occupy. `None` allows every stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_stages: Option<Vec<String>>,
}

impl TypeDef {
    fn new(name: &str, prefix: &str, folder: &str, high_level: bool) -> Self {
        Self {
            name: name.to_string(),
            prefix: prefix.to_string(),
            folder: folder.to_string(),
            high_level,
            allowed_stages: None,
        }
    }

    pub fn allows_stage(&self, stage: &Stage) -> bool {
        match &self.allowed_stages {
            Some(list) => list.iter().any(|s| s.eq_ignore_ascii_case(stage.as_str())),
            None => true,
        }
    }
}

fn default_types() -> Vec<TypeDef> {
    vec![
        TypeDef::new("epic", "EPIC", "Epics", true),
        TypeDef::new("feature", "FEAT", "Features", false),
        TypeDef::new("chore", "CHORE", "Chores", false),
        TypeDef::new("fix", "FIX", "Fixes", false),
    ]
}

// ---------------------------------------------------------------------------
// WorkflowConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDef {
    pub name: String,
    pub role: StageRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Ordered stage set. Exactly one stage per role except `pending`.
    #[serde(default = "default_stages")]
    pub stages: Vec<StageDef>,
    #[serde(default = "default_solution")]
    pub default_solution: String,
    /// Solutions that may close an issue from any open stage without merging.
    #[serde(default = "default_abandon_solutions")]
    pub abandon_solutions: Vec<String>,
}

fn default_stages() -> Vec<StageDef> {
    [
        ("draft", StageRole::Pending),
        ("doing", StageRole::Active),
        ("review", StageRole::Review),
        ("done", StageRole::Terminal),
        ("freezed", StageRole::Parked),
    ]
    .into_iter()
    .map(|(name, role)| StageDef {
        name: name.to_string(),
        role,
    })
    .collect()
}

fn default_solution() -> String {
    "implemented".to_string()
}

fn default_abandon_solutions() -> Vec<String> {
    vec![
        "cancelled".to_string(),
        "wontfix".to_string(),
        "duplicate".to_string(),
    ]
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            stages: default_stages(),
            default_solution: default_solution(),
            abandon_solutions: default_abandon_solutions(),
        }
    }
}

impl WorkflowConfig {
    pub fn role_of(&self, stage: &Stage) -> Option<StageRole> {
        self.stages
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(stage.as_str()))
            .map(|s| s.role)
    }

    /// First stage carrying `role`. For `Pending` this is the initial stage.
    pub fn stage_for(&self, role: StageRole) -> Option<Stage> {
        self.stages
            .iter()
            .find(|s| s.role == role)
            .map(|s| Stage::new(&s.name))
    }

    pub fn initial_stage(&self) -> Option<Stage> {
        self.stage_for(StageRole::Pending)
    }

    pub fn is_valid_pair(&self, status: Status, stage: &Stage) -> bool {
        self.role_of(stage)
            .map(|role| status.allowed_roles().contains(&role))
            .unwrap_or(false)
    }

    pub fn is_abandon_solution(&self, solution: &str) -> bool {
        self.abandon_solutions
            .iter()
            .any(|s| s.eq_ignore_ascii_case(solution))
    }
}

// ---------------------------------------------------------------------------
// GovernanceConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Open high-level issue count above which domain coverage is enforced.
    #[serde(default = "default_coverage_threshold")]
    pub coverage_threshold: usize,
    /// Minimum fraction of open high-level issues that must carry a domain.
    #[serde(default = "default_coverage_ratio")]
    pub coverage_ratio: f64,
    #[serde(default = "default_placeholder_markers")]
    pub placeholder_markers: Vec<String>,
    #[serde(default = "default_review_heading")]
    pub review_heading: String,
}

fn default_coverage_threshold() -> usize {
    32
}

fn default_coverage_ratio() -> f64 {
    0.5
}

fn default_placeholder_markers() -> Vec<String> {
    ["TBD", "TODO:", "FIXME", "<placeholder>"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_review_heading() -> String {
    "Review Comments".to_string()
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            coverage_threshold: default_coverage_threshold(),
            coverage_ratio: default_coverage_ratio(),
            placeholder_markers: default_placeholder_markers(),
            review_heading: default_review_heading(),
        }
    }
}

// ---------------------------------------------------------------------------
// GitConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    Branch,
    Worktree,
    /// No isolation: `start` only moves the stage. Finalize has nothing to merge.
    None,
}

impl IsolationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            IsolationMode::Branch => "branch",
            IsolationMode::Worktree => "worktree",
            IsolationMode::None => "none",
        }
    }
}

impl FromStr for IsolationMode {
    type Err = TrellisError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "branch" => Ok(IsolationMode::Branch),
            "worktree" => Ok(IsolationMode::Worktree),
            "none" => Ok(IsolationMode::None),
            _ => Err(TrellisError::Validation(format!("unknown isolation mode: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_trunk")]
    pub trunk: String,
    #[serde(default = "default_isolation")]
    pub isolation: IsolationMode,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

fn default_trunk() -> String {
    "main".to_string()
}

fn default_isolation() -> IsolationMode {
    IsolationMode::Branch
}

fn default_branch_prefix() -> String {
    "trellis/".to_string()
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            trunk: default_trunk(),
            isolation: default_isolation(),
            branch_prefix: default_branch_prefix(),
        }
    }
}

// ---------------------------------------------------------------------------
// HooksConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksConfig {
    /// Directories scanned for hook scripts, relative to the project root.
    #[serde(default = "default_hook_dirs")]
    pub dirs: Vec<String>,
    /// Individually registered scripts, relative to the project root.
    #[serde(default)]
    pub scripts: Vec<String>,
    #[serde(default = "default_hook_timeout")]
    pub timeout_seconds: u32,
    /// Events whose hook failures are logged instead of denying.
    #[serde(default = "default_advisory_events")]
    pub advisory_events: Vec<String>,
}

fn default_hook_dirs() -> Vec<String> {
    vec![paths::HOOKS_DIR.to_string()]
}

fn default_hook_timeout() -> u32 {
    30
}

fn default_advisory_events() -> Vec<String> {
    vec!["post-transition".to_string(), "post-tool-use".to_string()]
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            dirs: default_hook_dirs(),
            scripts: Vec::new(),
            timeout_seconds: default_hook_timeout(),
            advisory_events: default_advisory_events(),
        }
    }
}

impl HooksConfig {
    pub fn is_advisory(&self, event: HookEvent) -> bool {
        self.advisory_events.iter().any(|e| e == event.as_str())
    }
}

// ---------------------------------------------------------------------------
// ArchiveConfig / LockConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_after_days")]
    pub after_days: u32,
}

fn default_archive_after_days() -> u32 {
    30
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            after_days: default_archive_after_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    #[serde(default = "default_trunk_wait")]
    pub trunk_wait_ms: u64,
}

fn default_stale_after() -> u64 {
    600
}

fn default_trunk_wait() -> u64 {
    30_000
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after(),
            trunk_wait_ms: default_trunk_wait(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProjectConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "project".to_string(),
            description: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default = "default_issues_root")]
    pub issues_root: String,
    #[serde(default = "default_types")]
    pub types: Vec<TypeDef>,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub governance: GovernanceConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub verification: HashMap<String, Vec<VerifyCommand>>,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub locks: LockConfig,
    /// Cross-project namespaces: name → project root (relative or absolute).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub workspace: HashMap<String, String>,
}

fn default_version() -> u32 {
    1
}

fn default_issues_root() -> String {
    "Issues".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self::new(ProjectConfig::default().name)
    }
}

impl Config {
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            version: 1,
            project: ProjectConfig {
                name: project_name.into(),
                description: None,
            },
            issues_root: default_issues_root(),
            types: default_types(),
            workflow: WorkflowConfig::default(),
            governance: GovernanceConfig::default(),
            git: GitConfig::default(),
            hooks: HooksConfig::default(),
            verification: HashMap::new(),
            archive: ArchiveConfig::default(),
            locks: LockConfig::default(),
            workspace: HashMap::new(),
        }
    }

    /// Load `.trellis/config.yaml`, falling back to defaults when absent.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        let errors: Vec<String> = cfg
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if !errors.is_empty() {
            return Err(TrellisError::Config(errors.join("; ")));
        }
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Taxonomy lookups
    // -----------------------------------------------------------------------

    pub fn type_def(&self, name: &str) -> Result<&TypeDef> {
        self.types
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| TrellisError::UnknownType(name.to_string()))
    }

    pub fn type_for_id(&self, id: &str) -> Result<&TypeDef> {
        let (prefix, _) = paths::parse_id(id)?;
        self.types
            .iter()
            .find(|t| t.prefix == prefix)
            .ok_or_else(|| TrellisError::UnknownType(prefix.to_string()))
    }

    pub fn verification_for(&self, action: Action) -> &[VerifyCommand] {
        self.verification
            .get(action.as_str())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        // 1. Taxonomy: unique names/prefixes/folders, well-formed prefixes
        let mut names = HashSet::new();
        let mut prefixes = HashSet::new();
        let mut folders = HashSet::new();
        if self.types.is_empty() {
            warnings.push(ConfigWarning::error("no issue types configured"));
        }
        for t in &self.types {
            if !names.insert(t.name.to_ascii_lowercase()) {
                warnings.push(ConfigWarning::error(format!("duplicate type '{}'", t.name)));
            }
            if !prefixes.insert(t.prefix.clone()) {
                warnings.push(ConfigWarning::error(format!(
                    "duplicate prefix '{}'",
                    t.prefix
                )));
            }
            if !folders.insert(t.folder.clone()) {
                warnings.push(ConfigWarning::error(format!(
                    "duplicate folder '{}'",
                    t.folder
                )));
            }
            if !paths::is_valid_prefix(&t.prefix) {
                warnings.push(ConfigWarning::error(format!(
                    "type '{}' has invalid prefix '{}' (uppercase letters and digits)",
                    t.name, t.prefix
                )));
            }
            if let Some(allowed) = &t.allowed_stages {
                for stage in allowed {
                    if self.workflow.role_of(&Stage::new(stage)).is_none() {
                        warnings.push(ConfigWarning::error(format!(
                            "type '{}' allows unknown stage '{stage}'",
                            t.name
                        )));
                    }
                }
            }
        }

        // 2. Stage set: at least one pending stage, exactly one of every other role
        let mut stage_names = HashSet::new();
        for s in &self.workflow.stages {
            if !stage_names.insert(s.name.to_ascii_lowercase()) {
                warnings.push(ConfigWarning::error(format!("duplicate stage '{}'", s.name)));
            }
        }
        for role in [
            StageRole::Pending,
            StageRole::Active,
            StageRole::Review,
            StageRole::Terminal,
            StageRole::Parked,
        ] {
            let count = self.workflow.stages.iter().filter(|s| s.role == role).count();
            if count == 0 {
                warnings.push(ConfigWarning::error(format!("no stage with role '{role}'")));
            } else if count > 1 && role != StageRole::Pending {
                warnings.push(ConfigWarning::error(format!(
                    "{count} stages with role '{role}' (expected exactly one)"
                )));
            }
        }

        // 3. Governance thresholds
        if !(0.0..=1.0).contains(&self.governance.coverage_ratio) {
            warnings.push(ConfigWarning::error(format!(
                "governance.coverage_ratio={} must be within 0..=1",
                self.governance.coverage_ratio
            )));
        }

        // 4. Verification commands
        for (action_key, commands) in &self.verification {
            if !Action::is_valid(action_key) {
                warnings.push(ConfigWarning::warning(format!(
                    "unknown action '{action_key}' in verification"
                )));
            }
            for cmd in commands {
                if cmd.command.trim().is_empty() {
                    warnings.push(ConfigWarning::warning(format!(
                        "verification '{}' on action '{action_key}' has an empty command",
                        cmd.name
                    )));
                }
                if cmd.max_retries > 10 {
                    warnings.push(ConfigWarning::warning(format!(
                        "verification '{}' on action '{action_key}' has max_retries={} (>10 is unusual)",
                        cmd.name, cmd.max_retries
                    )));
                }
            }
        }

        // 5. Hooks
        for event in &self.hooks.advisory_events {
            if HookEvent::from_str(event).is_err() {
                warnings.push(ConfigWarning::warning(format!(
                    "unknown event '{event}' in hooks.advisory_events"
                )));
            }
        }
        if self.hooks.timeout_seconds == 0 {
            warnings.push(ConfigWarning::warning(
                "hooks.timeout_seconds=0 lets a hung hook block forever",
            ));
        }

        if self.git.trunk.trim().is_empty() {
            warnings.push(ConfigWarning::error("git.trunk is empty"));
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_roundtrip() {
        let cfg = Config::new("test-project");
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.project.name, "test-project");
        assert_eq!(parsed.types.len(), 4);
        assert_eq!(parsed.workflow.stages.len(), 5);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.issues_root, "Issues");
        assert_eq!(cfg.git.trunk, "main");
        assert_eq!(cfg.type_def("feature").unwrap().prefix, "FEAT");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let yaml = "project:\n  name: demo\ngit:\n  isolation: worktree\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.git.isolation, IsolationMode::Worktree);
        assert_eq!(cfg.git.branch_prefix, "trellis/");
        assert_eq!(cfg.archive.after_days, 30);
        assert!(cfg.verification.is_empty());
    }

    #[test]
    fn stage_roles_and_pairs() {
        let wf = WorkflowConfig::default();
        assert_eq!(wf.initial_stage().unwrap().as_str(), "draft");
        assert_eq!(wf.role_of(&Stage::new("review")), Some(StageRole::Review));
        assert!(wf.is_valid_pair(Status::Closed, &Stage::new("done")));
        assert!(!wf.is_valid_pair(Status::Backlog, &Stage::new("doing")));
        assert!(!wf.is_valid_pair(Status::Open, &Stage::new("nope")));
        assert!(wf.is_abandon_solution("WontFix"));
    }

    #[test]
    fn type_lookup_by_id() {
        let cfg = Config::default();
        assert_eq!(cfg.type_for_id("EPIC-0003").unwrap().folder, "Epics");
        assert!(matches!(
            cfg.type_for_id("NOPE-0001"),
            Err(TrellisError::UnknownType(_))
        ));
    }

    #[test]
    fn validate_default_has_no_warnings() {
        assert!(Config::default().validate().is_empty());
    }

    #[test]
    fn validate_flags_duplicate_prefix_and_missing_role() {
        let mut cfg = Config::default();
        cfg.types.push(TypeDef::new("story", "FEAT", "Stories", false));
        cfg.workflow.stages.retain(|s| s.role != StageRole::Review);
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.message.contains("duplicate prefix 'FEAT'")));
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("role 'review'")));
    }

    #[test]
    fn load_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".trellis")).unwrap();
        std::fs::write(
            dir.path().join(".trellis/config.yaml"),
            "governance:\n  coverage_ratio: 1.5\n",
        )
        .unwrap();
        assert!(matches!(
            Config::load(dir.path()),
            Err(TrellisError::Config(_))
        ));
    }

    #[test]
    fn verification_commands_parse_with_defaults() {
        let yaml = r#"
verification:
  submit:
    - name: test
      command: "cargo test"
      max_retries: 1
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let cmds = cfg.verification_for(Action::Submit);
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].timeout_seconds, 300);
        assert!(cfg.verification_for(Action::Close).is_empty());
    }
}
