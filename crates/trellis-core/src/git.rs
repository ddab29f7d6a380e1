//! Git side of a transition: isolation branches and worktrees, the scoped
//! squash merge that closes an issue, cleanup, and the inverse operations
//! used when a later step fails.
//!
//! Every call takes its repository and trunk from an explicit [`GitContext`];
//! nothing here remembers which branch is checked out between calls.

use crate::config::{Config, IsolationMode};
use crate::error::{Result, TrellisError};
use crate::issue::{Isolation, Issue};
use crate::lock::FileLock;
use crate::paths;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GitContext {
    pub root: PathBuf,
    pub trunk: String,
    pub mode: IsolationMode,
    pub branch_prefix: String,
    /// Path prefixes owned by the engine (issue records, runtime state).
    /// They never make a tree dirty and never leave a merge scope.
    pub managed: Vec<String>,
    pub trunk_wait: Duration,
    pub stale_after: Duration,
}

/// Result of `begin_isolation`; `created` tells rollback whether there is
/// anything to undo.
#[derive(Debug, Clone)]
pub struct BeginOutcome {
    pub isolation: Isolation,
    pub created: bool,
    pub previous_branch: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    /// Trunk head before the merge; the rollback target.
    pub pre_head: String,
    /// The squash commit, or `None` when nothing in scope changed.
    pub commit: Option<String>,
    pub files: Vec<String>,
}

impl GitContext {
    pub fn from_config(root: &Path, config: &Config) -> Self {
        let issues_root = config.issues_root.trim_end_matches('/');
        Self {
            root: root.to_path_buf(),
            trunk: config.git.trunk.clone(),
            mode: config.git.isolation,
            branch_prefix: config.git.branch_prefix.clone(),
            managed: vec![format!("{issues_root}/"), format!("{}/", paths::TRELLIS_DIR)],
            trunk_wait: Duration::from_millis(config.locks.trunk_wait_ms),
            stale_after: Duration::from_secs(config.locks.stale_after_secs),
        }
    }

    pub fn ensure_available() -> Result<()> {
        which::which("git")
            .map(|_| ())
            .map_err(|_| TrellisError::GitUnavailable)
    }

    pub fn is_repo(&self) -> bool {
        self.probe(&self.root, &["rev-parse", "--git-dir"])
    }

    fn is_managed(&self, path: &str) -> bool {
        self.managed.iter().any(|m| path.starts_with(m.as_str()))
    }

    fn workdir(&self, iso: &Isolation) -> PathBuf {
        match &iso.worktree {
            Some(rel) => self.root.join(rel),
            None => self.root.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    fn git(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => TrellisError::GitUnavailable,
                _ => TrellisError::transaction(format!("git {}", args.join(" ")), e.to_string()),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let detail = if stderr.is_empty() { stdout } else { stderr };
            return Err(TrellisError::transaction(
                format!("git {}", args.join(" ")),
                detail,
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }

    fn probe(&self, dir: &Path, args: &[&str]) -> bool {
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn lines(output: &str) -> Vec<String> {
        output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn head(&self, dir: &Path) -> Result<String> {
        self.git(dir, &["rev-parse", "HEAD"])
    }

    /// Directory git runs hooks from, honouring `core.hooksPath`.
    pub fn hooks_dir(&self) -> Result<PathBuf> {
        let rel = self.git(&self.root, &["rev-parse", "--git-path", "hooks"])?;
        let path = Path::new(&rel);
        Ok(if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        })
    }

    /// Branch checked out in `dir`, `None` when HEAD is detached.
    pub fn current_branch(&self, dir: &Path) -> Result<Option<String>> {
        let output = Command::new("git")
            .args(["symbolic-ref", "--short", "-q", "HEAD"])
            .current_dir(dir)
            .output()
            .map_err(|_| TrellisError::GitUnavailable)?;
        let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((output.status.success() && !name.is_empty()).then_some(name))
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        self.probe(
            &self.root,
            &["rev-parse", "--verify", "-q", &format!("refs/heads/{branch}")],
        )
    }

    /// Tracked files with uncommitted changes, minus engine-managed paths.
    pub fn dirty_paths(&self, dir: &Path) -> Result<Vec<String>> {
        let out = self.git(dir, &["status", "--porcelain", "--untracked-files=no"])?;
        Ok(out
            .lines()
            .filter(|l| l.len() > 3)
            .map(|l| {
                let path = &l[3..];
                path.rsplit(" -> ").next().unwrap_or(path).trim_matches('"').to_string()
            })
            .filter(|p| !self.is_managed(p))
            .collect())
    }

    pub fn ensure_clean(&self, dir: &Path) -> Result<()> {
        let dirty = self.dirty_paths(dir)?;
        if dirty.is_empty() {
            return Ok(());
        }
        Err(TrellisError::transaction(
            "clean-tree check",
            format!("uncommitted changes in: {}", dirty.join(", ")),
        ))
    }

    pub fn staged_files(&self, dir: &Path) -> Result<Vec<String>> {
        Ok(Self::lines(&self.git(dir, &["diff", "--cached", "--name-only"])?))
    }

    fn unmerged_paths(&self) -> Result<Vec<String>> {
        Ok(Self::lines(&self.git(
            &self.root,
            &["diff", "--name-only", "--diff-filter=U"],
        )?))
    }

    fn squash_msg_path(&self) -> Result<PathBuf> {
        let rel = self.git(&self.root, &["rev-parse", "--git-path", "SQUASH_MSG"])?;
        let path = Path::new(&rel);
        Ok(if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        })
    }

    /// A squash merge is staged but not committed yet. A leftover SQUASH_MSG
    /// with an empty index does not count.
    fn squash_in_progress(&self) -> Result<bool> {
        if !self.squash_msg_path()?.exists() {
            return Ok(false);
        }
        Ok(!self.unmerged_paths()?.is_empty() || !self.staged_files(&self.root)?.is_empty())
    }

    // -----------------------------------------------------------------------
    // Isolation
    // -----------------------------------------------------------------------

    /// Whether the branch (and worktree, if any) recorded on an issue exists.
    pub fn isolation_present(&self, iso: &Isolation) -> bool {
        if !self.branch_exists(&iso.branch) {
            return false;
        }
        match &iso.worktree {
            Some(rel) => self.root.join(rel).is_dir(),
            None => true,
        }
    }

    /// Create (or re-enter) the issue's branch or worktree off trunk.
    pub fn begin_isolation(&self, issue: &Issue, mode: IsolationMode) -> Result<BeginOutcome> {
        let id = issue.id();
        let branch = format!("{}{}", self.branch_prefix, id.to_ascii_lowercase());
        let previous_branch = self.current_branch(&self.root)?;
        let exists = self.branch_exists(&branch);
        let base = match issue.meta.isolation.as_ref() {
            Some(iso) if exists && iso.branch == branch => iso.base.clone(),
            _ => self.git(&self.root, &["rev-parse", "--verify", &self.trunk])?,
        };

        match mode {
            IsolationMode::None => Err(TrellisError::Validation(
                "isolation mode 'none' has nothing to begin".into(),
            )),
            IsolationMode::Branch => {
                self.ensure_clean(&self.root)?;
                if previous_branch.as_deref() == Some(branch.as_str()) {
                    // already there
                } else if exists {
                    self.git(&self.root, &["checkout", "-q", &branch])?;
                } else {
                    self.git(&self.root, &["checkout", "-q", "-b", &branch, &self.trunk])?;
                }
                tracing::info!(%id, %branch, created = !exists, "isolation branch ready");
                Ok(BeginOutcome {
                    isolation: Isolation {
                        mode,
                        branch,
                        base,
                        worktree: None,
                    },
                    created: !exists,
                    previous_branch,
                })
            }
            IsolationMode::Worktree => {
                let rel = format!("{}/{id}", paths::WORKTREES_DIR);
                let dir = self.root.join(&rel);
                let mut created = false;
                if !dir.is_dir() {
                    if let Some(parent) = dir.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    if exists {
                        self.git(&self.root, &["worktree", "add", "-q", &rel, &branch])?;
                    } else {
                        self.git(
                            &self.root,
                            &["worktree", "add", "-q", "-b", &branch, &rel, &self.trunk],
                        )?;
                        created = true;
                    }
                }
                tracing::info!(%id, %branch, worktree = %rel, created, "isolation worktree ready");
                Ok(BeginOutcome {
                    isolation: Isolation {
                        mode,
                        branch,
                        base,
                        worktree: Some(rel),
                    },
                    created,
                    previous_branch,
                })
            }
        }
    }

    /// Undo a `begin_isolation` that created something.
    pub fn rollback_isolation(&self, outcome: &BeginOutcome) -> Result<()> {
        if !outcome.created {
            if let (IsolationMode::Branch, Some(prev)) =
                (outcome.isolation.mode, &outcome.previous_branch)
            {
                if prev != &outcome.isolation.branch {
                    self.git(&self.root, &["checkout", "-q", prev])?;
                }
            }
            return Ok(());
        }
        let back_to = outcome
            .previous_branch
            .clone()
            .unwrap_or_else(|| self.trunk.clone());
        if outcome.isolation.mode == IsolationMode::Branch {
            self.git(&self.root, &["checkout", "-q", &back_to])?;
        }
        self.cleanup(&outcome.isolation)
    }

    /// Files changed on the isolation branch since its base, committed or not.
    pub fn changed_files(&self, iso: &Isolation) -> Result<Vec<String>> {
        let dir = self.workdir(iso);
        let mut files = Vec::new();
        if self.branch_exists(&iso.branch) {
            files.extend(Self::lines(&self.git(
                &self.root,
                &["diff", "--name-only", &iso.base, &iso.branch],
            )?));
        }
        if self.current_branch(&dir)?.as_deref() == Some(iso.branch.as_str()) {
            files.extend(Self::lines(&self.git(&dir, &["diff", "--name-only", "HEAD"])?));
            files.extend(Self::lines(&self.git(
                &dir,
                &["ls-files", "--others", "--exclude-standard"],
            )?));
        }
        files.retain(|f| !self.is_managed(f));
        files.sort();
        files.dedup();
        Ok(files)
    }

    /// Files changed on trunk since the branch point, including uncommitted
    /// edits when trunk is checked out at the root.
    pub fn trunk_changes(&self, iso: &Isolation) -> Result<Vec<String>> {
        let mut files = Self::lines(&self.git(
            &self.root,
            &["diff", "--name-only", &iso.base, &self.trunk],
        )?);
        if self.current_branch(&self.root)?.as_deref() == Some(self.trunk.as_str()) {
            files.extend(Self::lines(&self.git(&self.root, &["diff", "--name-only", "HEAD"])?));
        }
        files.retain(|f| !self.is_managed(f));
        files.sort();
        files.dedup();
        Ok(files)
    }

    // -----------------------------------------------------------------------
    // Finalize
    // -----------------------------------------------------------------------

    /// Squash-merge the issue branch into trunk, keeping only `scope`.
    ///
    /// Runs under the trunk lock. When a squash is already staged with no
    /// unmerged paths (the user resolved a conflict), the merge step is
    /// skipped and only the scope restriction and commit run.
    pub fn finalize(&self, issue: &Issue, scope: &[String], solution: &str) -> Result<FinalizeOutcome> {
        let id = issue.id();
        let iso = issue.meta.isolation.as_ref().ok_or_else(|| {
            TrellisError::Validation(format!("{id} has no isolation branch to merge"))
        })?;
        let _trunk = FileLock::acquire(
            &paths::lock_path(&self.root, "trunk"),
            &format!("close {id}"),
            self.trunk_wait,
            self.stale_after,
        )?;

        let resuming = self.squash_in_progress()?;
        if resuming {
            let unmerged = self.unmerged_paths()?;
            if !unmerged.is_empty() {
                return Err(TrellisError::Conflict {
                    id: id.to_string(),
                    paths: unmerged,
                });
            }
            tracing::info!(%id, "resuming staged squash merge");
        } else {
            self.commit_pending(iso, scope, &format!("{id}: work in progress"))?;
            self.ensure_clean(&self.root)?;
            if self.current_branch(&self.root)?.as_deref() != Some(self.trunk.as_str()) {
                self.git(&self.root, &["checkout", "-q", &self.trunk])?;
            }
        }
        let pre_head = self.head(&self.root)?;

        if !resuming {
            if let Err(e) = self.git(&self.root, &["merge", "--squash", "--no-commit", &iso.branch]) {
                let unmerged = self.unmerged_paths().unwrap_or_default();
                if !unmerged.is_empty() {
                    tracing::warn!(%id, paths = ?unmerged, "squash merge stopped on conflicts");
                    return Err(TrellisError::Conflict {
                        id: id.to_string(),
                        paths: unmerged,
                    });
                }
                return Err(e);
            }
        }

        let result = self.restrict_and_commit(issue, scope, solution, &pre_head);
        if let Err(e) = &result {
            tracing::warn!(%id, error = %e, "finalize failed, restoring trunk");
            self.rollback_finalize(&pre_head)?;
        }
        result
    }

    fn restrict_and_commit(
        &self,
        issue: &Issue,
        scope: &[String],
        solution: &str,
        pre_head: &str,
    ) -> Result<FinalizeOutcome> {
        let staged = self.staged_files(&self.root)?;
        let mut kept = Vec::new();
        for path in staged {
            if scope.contains(&path) || self.is_managed(&path) {
                kept.push(path);
                continue;
            }
            tracing::debug!(%path, "dropping out-of-scope change from merge");
            self.git(&self.root, &["reset", "-q", "HEAD", "--", &path])?;
            if self.probe(&self.root, &["cat-file", "-e", &format!("HEAD:{path}")]) {
                self.git(&self.root, &["checkout", "-q", "HEAD", "--", &path])?;
            } else {
                let file = self.root.join(&path);
                if file.exists() {
                    std::fs::remove_file(&file)?;
                }
            }
        }

        if kept.is_empty() {
            // Nothing in scope: drop the squash state so the next merge starts clean.
            self.git(&self.root, &["reset", "-q", "--merge", pre_head])?;
            return Ok(FinalizeOutcome {
                pre_head: pre_head.to_string(),
                commit: None,
                files: kept,
            });
        }

        let message = format!(
            "{}: {}\n\nSolution: {solution}\n",
            issue.meta.id, issue.meta.title
        );
        self.git(&self.root, &["commit", "-q", "-m", &message])?;
        let squash_msg = self.squash_msg_path()?;
        if squash_msg.exists() {
            std::fs::remove_file(squash_msg)?;
        }
        let commit = self.head(&self.root)?;
        tracing::info!(id = %issue.meta.id, %commit, files = kept.len(), "squash merged into trunk");
        Ok(FinalizeOutcome {
            pre_head: pre_head.to_string(),
            commit: Some(commit),
            files: kept,
        })
    }

    /// Commit uncommitted in-scope work on the isolation branch so the merge
    /// sees it.
    fn commit_pending(&self, iso: &Isolation, scope: &[String], message: &str) -> Result<()> {
        let dir = self.workdir(iso);
        if self.current_branch(&dir)?.as_deref() != Some(iso.branch.as_str()) || scope.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "-A", "--"];
        args.extend(scope.iter().map(|s| s.as_str()));
        self.git(&dir, &args)?;
        if self.staged_files(&dir)?.is_empty() {
            return Ok(());
        }
        self.git(&dir, &["commit", "-q", "-m", message])?;
        Ok(())
    }

    /// Return trunk to `pre_head`, dropping a staged or committed squash.
    pub fn rollback_finalize(&self, pre_head: &str) -> Result<()> {
        self.git(&self.root, &["reset", "-q", "--merge", pre_head])?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cleanup
    // -----------------------------------------------------------------------

    /// Remove the worktree and delete the branch. Missing pieces are fine.
    pub fn cleanup(&self, iso: &Isolation) -> Result<()> {
        if let Some(rel) = &iso.worktree {
            if self.root.join(rel).exists() {
                self.git(&self.root, &["worktree", "remove", "--force", rel])?;
            }
            if let Err(e) = self.git(&self.root, &["worktree", "prune"]) {
                tracing::warn!(branch = %iso.branch, error = %e, "worktree prune failed");
            }
        }
        if self.current_branch(&self.root)?.as_deref() == Some(iso.branch.as_str()) {
            self.git(&self.root, &["checkout", "-q", &self.trunk])?;
        }
        if self.branch_exists(&iso.branch) {
            self.git(&self.root, &["branch", "-q", "-D", &iso.branch])?;
        }
        tracing::info!(branch = %iso.branch, "isolation cleaned up");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::Stage;
    use tempfile::TempDir;

    pub(crate) fn sh_git(dir: &Path, args: &[&str]) -> String {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "git {args:?}: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    /// A scratch repository on `main` with one commit.
    pub(crate) fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let p = dir.path();
        sh_git(p, &["init", "-q"]);
        sh_git(p, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        sh_git(p, &["config", "user.name", "Test"]);
        sh_git(p, &["config", "user.email", "test@example.com"]);
        sh_git(p, &["config", "commit.gpgsign", "false"]);
        std::fs::write(p.join("README.md"), "hello\n").unwrap();
        std::fs::write(p.join(".gitignore"), ".trellis/locks/\n.trellis/worktrees/\n").unwrap();
        sh_git(p, &["add", "."]);
        sh_git(p, &["commit", "-q", "-m", "init"]);
        dir
    }

    fn ctx(dir: &TempDir) -> GitContext {
        GitContext::from_config(dir.path(), &Config::default())
    }

    fn issue() -> Issue {
        Issue::new("FEAT-0001", "feature", "Login", Stage::new("draft"))
    }

    fn started(ctx: &GitContext, mode: IsolationMode) -> Issue {
        let mut i = issue();
        let outcome = ctx.begin_isolation(&i, mode).unwrap();
        i.meta.isolation = Some(outcome.isolation);
        i
    }

    #[test]
    fn branch_isolation_is_idempotent() {
        let dir = init_repo();
        let ctx = ctx(&dir);
        let first = ctx.begin_isolation(&issue(), IsolationMode::Branch).unwrap();
        assert!(first.created);
        assert_eq!(first.isolation.branch, "trellis/feat-0001");
        assert_eq!(
            ctx.current_branch(dir.path()).unwrap().as_deref(),
            Some("trellis/feat-0001")
        );
        let mut i = issue();
        i.meta.isolation = Some(first.isolation.clone());
        let again = ctx.begin_isolation(&i, IsolationMode::Branch).unwrap();
        assert!(!again.created);
        assert_eq!(again.isolation.base, first.isolation.base);
        assert!(ctx.isolation_present(&again.isolation));
    }

    #[test]
    fn dirty_tree_blocks_isolation_but_records_do_not() {
        let dir = init_repo();
        let ctx = ctx(&dir);
        std::fs::create_dir_all(dir.path().join("Issues/Features/open")).unwrap();
        std::fs::write(dir.path().join("Issues/Features/open/FEAT-0001-login.md"), "x").unwrap();
        sh_git(dir.path(), &["add", "Issues"]);
        sh_git(dir.path(), &["commit", "-q", "-m", "records"]);
        std::fs::write(dir.path().join("Issues/Features/open/FEAT-0001-login.md"), "y").unwrap();
        assert!(ctx.dirty_paths(dir.path()).unwrap().is_empty());

        std::fs::write(dir.path().join("README.md"), "changed\n").unwrap();
        let err = ctx
            .begin_isolation(&issue(), IsolationMode::Branch)
            .unwrap_err();
        assert!(matches!(err, TrellisError::Transaction { .. }));
        assert!(!ctx.branch_exists("trellis/feat-0001"));
    }

    #[test]
    fn changed_files_include_uncommitted_and_untracked() {
        let dir = init_repo();
        let ctx = ctx(&dir);
        let i = started(&ctx, IsolationMode::Branch);
        std::fs::write(dir.path().join("README.md"), "edited\n").unwrap();
        std::fs::write(dir.path().join("new.rs"), "fn main() {}\n").unwrap();
        let files = ctx.changed_files(i.meta.isolation.as_ref().unwrap()).unwrap();
        assert_eq!(files, vec!["README.md".to_string(), "new.rs".to_string()]);
    }

    #[test]
    fn finalize_merges_only_scope() {
        let dir = init_repo();
        let ctx = ctx(&dir);
        let i = started(&ctx, IsolationMode::Branch);
        std::fs::write(dir.path().join("in.rs"), "in\n").unwrap();
        std::fs::write(dir.path().join("out.rs"), "out\n").unwrap();
        sh_git(dir.path(), &["add", "."]);
        sh_git(dir.path(), &["commit", "-q", "-m", "work"]);

        let outcome = ctx.finalize(&i, &["in.rs".to_string()], "implemented").unwrap();
        assert!(outcome.commit.is_some());
        assert_eq!(outcome.files, vec!["in.rs".to_string()]);
        assert_eq!(ctx.current_branch(dir.path()).unwrap().as_deref(), Some("main"));
        assert!(dir.path().join("in.rs").exists());
        assert!(!dir.path().join("out.rs").exists());
        let subject = sh_git(dir.path(), &["log", "-1", "--format=%s"]);
        assert_eq!(subject, "FEAT-0001: Login");

        ctx.cleanup(i.meta.isolation.as_ref().unwrap()).unwrap();
        assert!(!ctx.branch_exists("trellis/feat-0001"));
    }

    #[test]
    fn finalize_commits_pending_work() {
        let dir = init_repo();
        let ctx = ctx(&dir);
        let i = started(&ctx, IsolationMode::Branch);
        std::fs::write(dir.path().join("README.md"), "from branch\n").unwrap();
        let outcome = ctx.finalize(&i, &["README.md".to_string()], "implemented").unwrap();
        assert!(outcome.commit.is_some());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("README.md")).unwrap(),
            "from branch\n"
        );
    }

    #[test]
    fn rollback_finalize_restores_trunk() {
        let dir = init_repo();
        let ctx = ctx(&dir);
        let i = started(&ctx, IsolationMode::Branch);
        std::fs::write(dir.path().join("in.rs"), "in\n").unwrap();
        let outcome = ctx.finalize(&i, &["in.rs".to_string()], "implemented").unwrap();
        ctx.rollback_finalize(&outcome.pre_head).unwrap();
        assert_eq!(ctx.head(dir.path()).unwrap(), outcome.pre_head);
        assert!(!dir.path().join("in.rs").exists());
    }

    #[test]
    fn conflicts_are_reported_with_paths() {
        let dir = init_repo();
        let ctx = ctx(&dir);
        let i = started(&ctx, IsolationMode::Branch);
        std::fs::write(dir.path().join("README.md"), "branch\n").unwrap();
        sh_git(dir.path(), &["commit", "-q", "-am", "branch edit"]);
        sh_git(dir.path(), &["checkout", "-q", "main"]);
        std::fs::write(dir.path().join("README.md"), "trunk\n").unwrap();
        sh_git(dir.path(), &["commit", "-q", "-am", "trunk edit"]);

        let err = ctx
            .finalize(&i, &["README.md".to_string()], "implemented")
            .unwrap_err();
        match err {
            TrellisError::Conflict { paths, .. } => assert_eq!(paths, vec!["README.md"]),
            other => panic!("expected conflict, got {other:?}"),
        }

        // Resolve by hand, then finalize resumes from the staged squash.
        std::fs::write(dir.path().join("README.md"), "resolved\n").unwrap();
        sh_git(dir.path(), &["add", "README.md"]);
        let outcome = ctx.finalize(&i, &["README.md".to_string()], "implemented").unwrap();
        assert!(outcome.commit.is_some());
    }

    #[test]
    fn worktree_isolation_and_cleanup() {
        let dir = init_repo();
        let ctx = ctx(&dir);
        let i = started(&ctx, IsolationMode::Worktree);
        let iso = i.meta.isolation.clone().unwrap();
        assert_eq!(iso.worktree.as_deref(), Some(".trellis/worktrees/FEAT-0001"));
        let wt = dir.path().join(".trellis/worktrees/FEAT-0001");
        assert!(wt.join("README.md").exists());
        std::fs::write(wt.join("feature.rs"), "x\n").unwrap();
        assert_eq!(ctx.changed_files(&iso).unwrap(), vec!["feature.rs".to_string()]);
        assert_eq!(ctx.current_branch(dir.path()).unwrap().as_deref(), Some("main"));

        let outcome = ctx.finalize(&i, &["feature.rs".to_string()], "implemented").unwrap();
        assert!(outcome.commit.is_some());
        assert!(dir.path().join("feature.rs").exists());
        ctx.cleanup(&iso).unwrap();
        assert!(!wt.exists());
        assert!(!ctx.isolation_present(&iso));
    }

    #[test]
    fn trunk_changes_since_base() {
        let dir = init_repo();
        let ctx = ctx(&dir);
        let i = started(&ctx, IsolationMode::Branch);
        sh_git(dir.path(), &["checkout", "-q", "main"]);
        std::fs::write(dir.path().join("README.md"), "trunk\n").unwrap();
        let changes = ctx.trunk_changes(i.meta.isolation.as_ref().unwrap()).unwrap();
        assert_eq!(changes, vec!["README.md".to_string()]);
    }
}
