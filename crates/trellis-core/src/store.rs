use crate::config::{Config, TypeDef};
use crate::error::{Result, TrellisError};
use crate::issue::Issue;
use crate::lock::FileLock;
use crate::paths;
use crate::types::Status;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// RawRecord
// ---------------------------------------------------------------------------

/// An issue file as found on disk, before (and regardless of) typed parsing.
/// Lint works from these so a malformed record is reported instead of
/// aborting the scan.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub path: PathBuf,
    /// Type folder the file was found in, e.g. `Features`.
    pub folder: String,
    /// Status directory the file was found in, e.g. `open` or `archived`.
    pub dir: String,
    pub content: String,
    pub issue: std::result::Result<Issue, String>,
}

impl RawRecord {
    /// The id implied by the file name, when it has one.
    pub fn file_id(&self) -> Option<String> {
        self.path
            .file_name()
            .and_then(|n| paths::id_from_file_name(&n.to_string_lossy()))
    }
}

// ---------------------------------------------------------------------------
// IssueStore
// ---------------------------------------------------------------------------

/// Reads and writes issue records under `{root}/{issues_root}/{Folder}/{status}/`.
#[derive(Debug, Clone)]
pub struct IssueStore {
    root: PathBuf,
    issues_root: String,
    types: Vec<TypeDef>,
    stale_after: Duration,
    lock_wait: Duration,
}

const SCAN_DIRS: [&str; 4] = ["open", "closed", "backlog", paths::ARCHIVED_DIR];

impl IssueStore {
    pub fn new(root: &Path, config: &Config) -> Self {
        Self {
            root: root.to_path_buf(),
            issues_root: config.issues_root.clone(),
            types: config.types.clone(),
            stale_after: Duration::from_secs(config.locks.stale_after_secs),
            lock_wait: Duration::from_millis(config.locks.trunk_wait_ms),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn issues_dir(&self) -> PathBuf {
        self.root.join(&self.issues_root)
    }

    fn type_for_id(&self, id: &str) -> Result<&TypeDef> {
        let (prefix, _) = paths::parse_id(id)?;
        self.types
            .iter()
            .find(|t| t.prefix == prefix)
            .ok_or_else(|| TrellisError::UnknownType(prefix.to_string()))
    }

    fn type_by_name(&self, name: &str) -> Result<&TypeDef> {
        self.types
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| TrellisError::UnknownType(name.to_string()))
    }

    pub fn status_dir(&self, folder: &str, status: Status) -> PathBuf {
        paths::status_dir(&self.root, &self.issues_root, folder, status.dir_name())
    }

    fn archived_dir(&self, folder: &str) -> PathBuf {
        paths::status_dir(&self.root, &self.issues_root, folder, paths::ARCHIVED_DIR)
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    pub fn try_locate(&self, id: &str) -> Result<Option<PathBuf>> {
        let def = self.type_for_id(id)?;
        for dir in SCAN_DIRS {
            let path = paths::status_dir(&self.root, &self.issues_root, &def.folder, dir);
            if let Some(found) = find_in_dir(&path, id)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    pub fn locate(&self, id: &str) -> Result<PathBuf> {
        self.try_locate(id)?
            .ok_or_else(|| TrellisError::IssueNotFound(id.to_string()))
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.try_locate(id)?.is_some())
    }

    pub fn load(&self, id: &str) -> Result<Issue> {
        self.load_with_path(id).map(|(issue, _)| issue)
    }

    pub fn load_with_path(&self, id: &str) -> Result<(Issue, PathBuf)> {
        paths::validate_id(id)?;
        let path = self.locate(id)?;
        let content = std::fs::read_to_string(&path)?;
        let issue = Issue::parse(&content, &paths::relative(&self.root, &path))?;
        if issue.meta.id != id {
            return Err(TrellisError::InvalidRecord {
                path: paths::relative(&self.root, &path),
                reason: format!("file declares id {} but is named for {id}", issue.meta.id),
            });
        }
        Ok((issue, path))
    }

    pub fn is_archived(&self, path: &Path) -> bool {
        path.parent()
            .and_then(|p| p.file_name())
            .map(|n| n == paths::ARCHIVED_DIR)
            .unwrap_or(false)
    }

    /// Directory an issue must live in for its current status.
    pub fn expected_dir(&self, issue: &Issue) -> Result<PathBuf> {
        let def = self.type_by_name(&issue.meta.issue_type)?;
        Ok(self.status_dir(&def.folder, issue.meta.status))
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Persist an issue, moving its file when the status directory changed.
    ///
    /// The new content is written in place first and the rename happens
    /// second, so an interruption leaves a misfiled record (fixable by lint)
    /// rather than a lost or duplicated one.
    pub fn save(&self, issue: &Issue) -> Result<PathBuf> {
        let content = issue.render()?;
        let current = self.try_locate(&issue.meta.id)?;
        let target_dir = match &current {
            Some(path) if issue.meta.status == Status::Closed && self.is_archived(path) => {
                path.parent().map(Path::to_path_buf).unwrap_or_default()
            }
            _ => self.expected_dir(issue)?,
        };
        let file_name = match &current {
            Some(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| paths::issue_file_name(&issue.meta.id, &issue.meta.title)),
            None => paths::issue_file_name(&issue.meta.id, &issue.meta.title),
        };
        let target = target_dir.join(file_name);

        match current {
            Some(path) if path != target => {
                crate::io::atomic_write(&path, content.as_bytes())?;
                crate::io::move_file(&path, &target)?;
                tracing::debug!(
                    id = %issue.meta.id,
                    from = %paths::relative(&self.root, &path),
                    to = %paths::relative(&self.root, &target),
                    "moved issue record"
                );
            }
            _ => crate::io::atomic_write(&target, content.as_bytes())?,
        }
        Ok(target)
    }

    /// Write a brand-new issue. Fails if the id is already on disk.
    pub fn insert(&self, issue: &Issue) -> Result<PathBuf> {
        if self.exists(&issue.meta.id)? {
            return Err(TrellisError::IssueExists(issue.meta.id.clone()));
        }
        self.save(issue)
    }

    /// Next free id for `type_name`. Holds the per-prefix allocation lock for
    /// the duration of `f`, so the id cannot be handed out twice.
    pub fn with_next_id<T>(&self, type_name: &str, f: impl FnOnce(String) -> Result<T>) -> Result<T> {
        let def = self.type_by_name(type_name)?;
        let lock_path = paths::lock_path(&self.root, &format!("ids-{}", def.prefix));
        let _lock = FileLock::acquire(&lock_path, "allocate id", self.lock_wait, self.stale_after)?;
        let next = self.max_sequence(&def.prefix)? + 1;
        f(paths::format_id(&def.prefix, next))
    }

    fn max_sequence(&self, prefix: &str) -> Result<u32> {
        let mut max = 0;
        for def in &self.types {
            for dir in SCAN_DIRS {
                let path = paths::status_dir(&self.root, &self.issues_root, &def.folder, dir);
                for file in md_files(&path)? {
                    let Some(id) = file
                        .file_name()
                        .and_then(|n| paths::id_from_file_name(&n.to_string_lossy()))
                    else {
                        continue;
                    };
                    if let Ok((p, seq)) = paths::parse_id(&id) {
                        if p == prefix {
                            max = max.max(seq);
                        }
                    }
                }
            }
        }
        Ok(max)
    }

    /// Move a closed record into `{Folder}/archived/` without rewriting it.
    pub fn archive(&self, id: &str) -> Result<PathBuf> {
        let (issue, path) = self.load_with_path(id)?;
        if issue.meta.status != Status::Closed {
            return Err(TrellisError::Validation(format!(
                "{id} is {}; only closed issues can be archived",
                issue.meta.status
            )));
        }
        if self.is_archived(&path) {
            return Ok(path);
        }
        let def = self.type_by_name(&issue.meta.issue_type)?;
        let target = self
            .archived_dir(&def.folder)
            .join(path.file_name().unwrap_or_default());
        crate::io::move_file(&path, &target)?;
        Ok(target)
    }

    /// Move a record to the directory its status requires, unchanged.
    pub fn refile(&self, id: &str) -> Result<Option<PathBuf>> {
        let (issue, path) = self.load_with_path(id)?;
        if issue.meta.status == Status::Closed && self.is_archived(&path) {
            return Ok(None);
        }
        let dir = self.expected_dir(&issue)?;
        if path.parent() == Some(dir.as_path()) {
            return Ok(None);
        }
        let target = dir.join(path.file_name().unwrap_or_default());
        crate::io::move_file(&path, &target)?;
        Ok(Some(target))
    }

    /// Remove a record, returning its last content for the audit log.
    pub fn remove(&self, id: &str) -> Result<String> {
        let path = self.locate(id)?;
        let content = std::fs::read_to_string(&path)?;
        std::fs::remove_file(&path)?;
        Ok(content)
    }

    // -----------------------------------------------------------------------
    // Listing
    // -----------------------------------------------------------------------

    /// Every issue file under every configured type folder, parsed or not.
    pub fn scan(&self) -> Result<Vec<RawRecord>> {
        let mut records = Vec::new();
        for def in &self.types {
            for dir in SCAN_DIRS {
                let path = paths::status_dir(&self.root, &self.issues_root, &def.folder, dir);
                for file in md_files(&path)? {
                    let content = std::fs::read_to_string(&file)?;
                    let issue = Issue::parse(&content, &paths::relative(&self.root, &file))
                        .map_err(|e| e.to_string());
                    records.push(RawRecord {
                        path: file,
                        folder: def.folder.clone(),
                        dir: dir.to_string(),
                        content,
                        issue,
                    });
                }
            }
        }
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(records)
    }

    /// All well-formed issues, sorted by id. Malformed files are skipped
    /// with a warning; `scan` reports them.
    pub fn list(&self) -> Result<Vec<Issue>> {
        let mut issues = Vec::new();
        for record in self.scan()? {
            match record.issue {
                Ok(issue) => issues.push(issue),
                Err(reason) => tracing::warn!(
                    path = %paths::relative(&self.root, &record.path),
                    %reason,
                    "skipping malformed issue record"
                ),
            }
        }
        issues.sort_by(|a, b| a.meta.id.cmp(&b.meta.id));
        Ok(issues)
    }
}

fn md_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && path.extension().map(|e| e == "md").unwrap_or(false) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn find_in_dir(dir: &Path, id: &str) -> Result<Option<PathBuf>> {
    for file in md_files(dir)? {
        let matches = file
            .file_name()
            .and_then(|n| paths::id_from_file_name(&n.to_string_lossy()))
            .map(|found| found == id)
            .unwrap_or(false);
        if matches {
            return Ok(Some(file));
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Stage;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> IssueStore {
        IssueStore::new(dir.path(), &Config::default())
    }

    fn new_issue(store: &IssueStore, title: &str) -> Issue {
        store
            .with_next_id("feature", |id| {
                let issue = Issue::new(id, "feature", title, Stage::new("draft"));
                store.insert(&issue)?;
                Ok(issue)
            })
            .unwrap()
    }

    #[test]
    fn create_allocates_sequential_ids() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let a = new_issue(&store, "Login");
        let b = new_issue(&store, "Logout");
        assert_eq!(a.meta.id, "FEAT-0001");
        assert_eq!(b.meta.id, "FEAT-0002");
        let path = store.locate("FEAT-0001").unwrap();
        assert!(path.ends_with("Issues/Features/open/FEAT-0001-login.md"));
    }

    #[test]
    fn save_moves_file_on_status_change() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut issue = new_issue(&store, "Login");
        issue.meta.status = Status::Backlog;
        issue.meta.stage = Stage::new("freezed");
        let path = store.save(&issue).unwrap();
        assert!(path.ends_with("Issues/Features/backlog/FEAT-0001-login.md"));
        assert!(!dir.path().join("Issues/Features/open/FEAT-0001-login.md").exists());
        assert_eq!(store.load("FEAT-0001").unwrap().meta.status, Status::Backlog);
    }

    #[test]
    fn title_change_keeps_file_name() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut issue = new_issue(&store, "Login");
        issue.meta.title = "Sign in".into();
        let path = store.save(&issue).unwrap();
        assert!(path.ends_with("FEAT-0001-login.md"));
    }

    #[test]
    fn ids_are_not_reused_after_archive_or_delete() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut issue = new_issue(&store, "Login");
        issue.meta.status = Status::Closed;
        issue.meta.stage = Stage::new("done");
        store.save(&issue).unwrap();
        store.archive("FEAT-0001").unwrap();
        assert_eq!(new_issue(&store, "Next").meta.id, "FEAT-0002");
        store.remove("FEAT-0002").unwrap();
        // The highest number on disk is still FEAT-0001 in archived.
        assert_eq!(new_issue(&store, "Again").meta.id, "FEAT-0002");
    }

    #[test]
    fn archive_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut issue = new_issue(&store, "Login");
        issue.meta.status = Status::Closed;
        issue.meta.stage = Stage::new("done");
        let before_path = store.save(&issue).unwrap();
        let before = std::fs::read_to_string(&before_path).unwrap();
        let after_path = store.archive("FEAT-0001").unwrap();
        assert!(after_path.ends_with("Issues/Features/archived/FEAT-0001-login.md"));
        assert_eq!(std::fs::read_to_string(&after_path).unwrap(), before);
        assert_eq!(store.load("FEAT-0001").unwrap(), issue);
    }

    #[test]
    fn archive_rejects_open_issue() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        new_issue(&store, "Login");
        assert!(matches!(
            store.archive("FEAT-0001"),
            Err(TrellisError::Validation(_))
        ));
    }

    #[test]
    fn insert_rejects_duplicate() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let issue = new_issue(&store, "Login");
        assert!(matches!(
            store.insert(&issue),
            Err(TrellisError::IssueExists(_))
        ));
    }

    #[test]
    fn scan_reports_malformed_files() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        new_issue(&store, "Login");
        let bad = dir.path().join("Issues/Features/open/FEAT-0009-bad.md");
        std::fs::write(&bad, "no header").unwrap();
        let records = store.scan().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().any(|r| r.issue.is_err()));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn refile_moves_misplaced_record() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let issue = new_issue(&store, "Login");
        let wrong = dir.path().join("Issues/Features/closed/FEAT-0001-login.md");
        crate::io::move_file(&store.locate(&issue.meta.id).unwrap(), &wrong).unwrap();
        let moved = store.refile("FEAT-0001").unwrap().unwrap();
        assert!(moved.ends_with("Issues/Features/open/FEAT-0001-login.md"));
        assert!(store.refile("FEAT-0001").unwrap().is_none());
    }

    #[test]
    fn unknown_prefix_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(matches!(
            store.load("NOPE-0001"),
            Err(TrellisError::UnknownType(_))
        ));
    }
}
