#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn trellis(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("trellis").unwrap();
    cmd.current_dir(dir.path())
        .env("TRELLIS_ROOT", dir.path())
        .env("TRELLIS_ACTOR", "tester")
        .env_remove("TRELLIS_BYPASS_HOOKS");
    cmd
}

fn git(dir: &Path, args: &[&str]) -> String {
    let out = std::process::Command::new("git")
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

fn init_project(dir: &TempDir) {
    trellis(dir).arg("init").assert().success();
}

/// A git repository on `main` with trellis initialised and its .gitignore
/// entries committed.
fn init_git_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    let p = dir.path();
    git(p, &["init", "-q"]);
    git(p, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(p, &["config", "user.name", "Test"]);
    git(p, &["config", "user.email", "test@example.com"]);
    git(p, &["config", "commit.gpgsign", "false"]);
    std::fs::write(p.join("README.md"), "hello\n").unwrap();
    git(p, &["add", "README.md"]);
    git(p, &["commit", "-q", "-m", "init"]);
    init_project(&dir);
    git(p, &["add", ".gitignore"]);
    git(p, &["commit", "-q", "-m", "ignore trellis runtime dirs"]);
    dir
}

fn record_in(dir: &TempDir, rel: &str, id: &str) -> Option<PathBuf> {
    std::fs::read_dir(dir.path().join(rel))
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().starts_with(id))
                .unwrap_or(false)
        })
}

fn create(dir: &TempDir, args: &[&str]) {
    let mut full = vec!["create"];
    full.extend_from_slice(args);
    trellis(dir).args(&full).assert().success();
}

const DENY_HOOK: &str = "\
# ---
# events: [pre-transition]
# description: release freeze
# ---
echo '{\"decision\":\"deny\",\"reason\":\"freeze\",\"message\":\"release freeze in effect\"}'
";

// ---------------------------------------------------------------------------
// trellis init
// ---------------------------------------------------------------------------

#[test]
fn init_scaffolds_project() {
    let dir = TempDir::new().unwrap();
    trellis(&dir).arg("init").assert().success();

    assert!(dir.path().join(".trellis/config.yaml").exists());
    assert!(dir.path().join(".trellis/hooks").is_dir());
    assert!(dir.path().join("Issues").is_dir());
    let ignore = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
    assert!(ignore.contains(".trellis/locks/"));
    assert!(ignore.contains(".trellis/worktrees/"));
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    trellis(&dir).arg("init").assert().success();
    trellis(&dir).arg("init").assert().success();

    let ignore = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
    assert_eq!(ignore.matches(".trellis/locks/").count(), 1);
}

// ---------------------------------------------------------------------------
// create / list / show
// ---------------------------------------------------------------------------

#[test]
fn create_list_and_show() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    trellis(&dir)
        .args(["create", "feature", "Login form", "--tag", "auth"])
        .assert()
        .success()
        .stdout(predicate::str::contains("FEAT-0001"));
    create(&dir, &["feature", "Dark mode", "--tag", "ui"]);

    assert!(record_in(&dir, "Issues/Features/open", "FEAT-0001").is_some());

    trellis(&dir)
        .args(["list", "--query", "+auth"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Login form"))
        .stdout(predicate::str::contains("Dark mode").not());

    trellis(&dir)
        .args(["show", "FEAT-0001"])
        .assert()
        .success()
        .stdout(predicate::str::contains("open/draft"));
}

#[test]
fn unknown_type_is_a_validation_error() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    trellis(&dir)
        .args(["create", "spaceship", "Warp drive"])
        .assert()
        .code(2);
}

#[test]
fn json_errors_carry_code_and_suggestion() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let output = trellis(&dir)
        .args(["show", "FEAT-0999", "--json"])
        .assert()
        .code(2)
        .get_output()
        .stdout
        .clone();
    let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(json["error"]["code"], "issue-not-found");
    assert!(json["error"]["suggestion"].is_string());
}

// ---------------------------------------------------------------------------
// Relations
// ---------------------------------------------------------------------------

#[test]
fn dependency_cycle_is_rejected() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create(&dir, &["feature", "Schema"]);
    create(&dir, &["feature", "Migrations", "--depends-on", "FEAT-0001"]);

    let before = std::fs::read_to_string(record_in(&dir, "Issues/Features/open", "FEAT-0001").unwrap()).unwrap();
    trellis(&dir)
        .args(["link", "FEAT-0001", "depends-on", "FEAT-0002"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("cycle"));
    let after = std::fs::read_to_string(record_in(&dir, "Issues/Features/open", "FEAT-0001").unwrap()).unwrap();
    assert_eq!(before, after);
}

#[test]
fn dangling_parent_is_rejected() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    trellis(&dir)
        .args(["create", "feature", "Orphan", "--parent", "EPIC-0042"])
        .assert()
        .code(2);
    assert!(record_in(&dir, "Issues/Features/open", "FEAT-0001").is_none());
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

#[test]
fn full_lifecycle_squash_merges_into_trunk() {
    let dir = init_git_project();
    let p = dir.path();
    create(&dir, &["feature", "Login"]);

    trellis(&dir)
        .args(["start", "FEAT-0001"])
        .assert()
        .success()
        .stdout(predicate::str::contains("trellis/feat-0001"));
    assert_eq!(git(p, &["rev-parse", "--abbrev-ref", "HEAD"]), "trellis/feat-0001");

    trellis(&dir)
        .args(["start", "FEAT-0001"])
        .assert()
        .success()
        .stdout(predicate::str::contains("nothing to do"));

    std::fs::create_dir_all(p.join("src")).unwrap();
    std::fs::write(p.join("src/login.rs"), "pub fn login() {}\n").unwrap();

    trellis(&dir)
        .args(["submit", "FEAT-0001"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("tracked-files"));

    trellis(&dir)
        .args(["sync", "FEAT-0001"])
        .assert()
        .success()
        .stdout(predicate::str::contains("src/login.rs"));
    trellis(&dir).args(["submit", "FEAT-0001"]).assert().success();

    trellis(&dir).args(["check", "FEAT-0001", "1"]).assert().success();
    trellis(&dir).args(["check", "FEAT-0001", "2"]).assert().success();
    trellis(&dir)
        .args(["note", "FEAT-0001", "reviewed, ship it"])
        .assert()
        .success();

    trellis(&dir)
        .args(["close", "FEAT-0001"])
        .assert()
        .success()
        .stdout(predicate::str::contains("closed/done"));

    let closed = record_in(&dir, "Issues/Features/closed", "FEAT-0001").unwrap();
    let content = std::fs::read_to_string(closed).unwrap();
    assert!(content.contains("status: closed"));
    assert!(content.contains("stage: done"));
    assert!(record_in(&dir, "Issues/Features/open", "FEAT-0001").is_none());

    assert_eq!(git(p, &["rev-parse", "--abbrev-ref", "HEAD"]), "main");
    let tree = git(p, &["ls-tree", "-r", "--name-only", "main"]);
    assert!(tree.contains("src/login.rs"));
    assert!(git(p, &["branch", "--list", "trellis/feat-0001"]).is_empty());
}

#[test]
fn shelve_moves_record_to_backlog() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create(&dir, &["feature", "Someday"]);

    trellis(&dir).args(["shelve", "FEAT-0001"]).assert().success();
    assert!(record_in(&dir, "Issues/Features/backlog", "FEAT-0001").is_some());
    assert!(record_in(&dir, "Issues/Features/open", "FEAT-0001").is_none());

    trellis(&dir).args(["pull", "FEAT-0001"]).assert().success();
    assert!(record_in(&dir, "Issues/Features/open", "FEAT-0001").is_some());
}

#[test]
fn close_from_draft_needs_abandon_solution() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create(&dir, &["feature", "Nope"]);

    trellis(&dir).args(["close", "FEAT-0001"]).assert().code(2);
    trellis(&dir)
        .args(["close", "FEAT-0001", "--solution", "wontfix"])
        .assert()
        .success();
    assert!(record_in(&dir, "Issues/Features/closed", "FEAT-0001").is_some());
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

#[test]
fn denying_hook_blocks_transition_and_leaves_record_unchanged() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create(&dir, &["feature", "Frozen"]);
    std::fs::write(dir.path().join(".trellis/hooks/freeze.sh"), DENY_HOOK).unwrap();

    let path = record_in(&dir, "Issues/Features/open", "FEAT-0001").unwrap();
    let before = std::fs::read_to_string(&path).unwrap();

    trellis(&dir)
        .args(["start", "FEAT-0001", "--isolation", "none"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("release freeze in effect"));

    assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
}

#[test]
fn bypass_flag_skips_hooks_and_is_audited() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create(&dir, &["feature", "Hotfix"]);
    std::fs::write(dir.path().join(".trellis/hooks/freeze.sh"), DENY_HOOK).unwrap();

    trellis(&dir)
        .args(["start", "FEAT-0001", "--isolation", "none", "--bypass-hooks"])
        .assert()
        .success();

    let log = std::fs::read_to_string(dir.path().join(".trellis/log/events.jsonl")).unwrap();
    assert!(log.contains("\"hook-bypass\""));
}

#[test]
fn hook_list_shows_scripts() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    std::fs::write(dir.path().join(".trellis/hooks/freeze.sh"), DENY_HOOK).unwrap();

    trellis(&dir)
        .args(["hook", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("freeze"))
        .stdout(predicate::str::contains("pre-transition"));
}

#[test]
fn editor_save_into_closed_record_is_refused() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let output = trellis(&dir)
        .args(["hook", "run", "--caller", "editor", "--event", "before-save"])
        .write_stdin(r#"{"file_path": "Issues/Features/closed/FEAT-0001-login.md"}"#)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(json["allow"], false);
}

// ---------------------------------------------------------------------------
// Corpus operations
// ---------------------------------------------------------------------------

#[test]
fn archive_keeps_record_byte_identical() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create(&dir, &["feature", "Old news"]);
    trellis(&dir)
        .args(["close", "FEAT-0001", "--solution", "cancelled"])
        .assert()
        .success();

    let closed = record_in(&dir, "Issues/Features/closed", "FEAT-0001").unwrap();
    let before = std::fs::read(&closed).unwrap();

    trellis(&dir)
        .args(["archive", "FEAT-0001", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("would archive"));
    assert!(closed.exists());

    trellis(&dir).args(["archive", "FEAT-0001"]).assert().success();
    let archived = record_in(&dir, "Issues/Features/archived", "FEAT-0001").unwrap();
    assert_eq!(std::fs::read(archived).unwrap(), before);
    assert!(!closed.exists());

    trellis(&dir)
        .args(["show", "FEAT-0001"])
        .assert()
        .success()
        .stdout(predicate::str::contains("closed/done"));
}

#[test]
fn delete_requires_reason_and_respects_references() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create(&dir, &["epic", "Auth"]);
    create(&dir, &["feature", "Login", "--parent", "EPIC-0001"]);

    trellis(&dir)
        .args(["delete", "EPIC-0001", "--reason", "duplicate"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("FEAT-0001"));
    trellis(&dir)
        .args(["delete", "EPIC-0001", "--reason", "duplicate", "--force"])
        .assert()
        .success();
    assert!(record_in(&dir, "Issues/Epics/open", "EPIC-0001").is_none());

    let log = std::fs::read_to_string(dir.path().join(".trellis/log/events.jsonl")).unwrap();
    assert!(log.contains("\"delete\""));
    assert!(log.contains("id: EPIC-0001"));
}

#[test]
fn lint_reports_and_fixes_misfiled_record() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create(&dir, &["feature", "Misfiled"]);

    let open = record_in(&dir, "Issues/Features/open", "FEAT-0001").unwrap();
    let backlog = dir.path().join("Issues/Features/backlog");
    std::fs::create_dir_all(&backlog).unwrap();
    std::fs::rename(&open, backlog.join(open.file_name().unwrap())).unwrap();

    trellis(&dir)
        .arg("lint")
        .assert()
        .code(3)
        .stdout(predicate::str::contains("directory"));
    trellis(&dir).args(["lint", "--fix"]).assert().success();
    assert!(record_in(&dir, "Issues/Features/open", "FEAT-0001").is_some());
}

#[test]
fn config_validate_accepts_defaults() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    trellis(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("valid"));
}
