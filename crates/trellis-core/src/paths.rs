use crate::error::{Result, TrellisError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const TRELLIS_DIR: &str = ".trellis";
pub const HOOKS_DIR: &str = ".trellis/hooks";
pub const LOCKS_DIR: &str = ".trellis/locks";
pub const LOG_DIR: &str = ".trellis/log";
pub const WORKTREES_DIR: &str = ".trellis/worktrees";

pub const CONFIG_FILE: &str = ".trellis/config.yaml";
pub const EVENTS_LOG: &str = ".trellis/log/events.jsonl";

pub const ARCHIVED_DIR: &str = "archived";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn hooks_dir(root: &Path) -> PathBuf {
    root.join(HOOKS_DIR)
}

pub fn locks_dir(root: &Path) -> PathBuf {
    root.join(LOCKS_DIR)
}

pub fn lock_path(root: &Path, name: &str) -> PathBuf {
    locks_dir(root).join(format!("{name}.lock"))
}

pub fn events_log_path(root: &Path) -> PathBuf {
    root.join(EVENTS_LOG)
}

/// `{root}/{issues_root}/{folder}/{status_dir}`
pub fn status_dir(root: &Path, issues_root: &str, folder: &str, status_dir: &str) -> PathBuf {
    root.join(issues_root).join(folder).join(status_dir)
}

/// Render `path` relative to `root` with forward slashes, for records and logs.
pub fn relative(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.to_string_lossy().replace('\\', "/")
}

// ---------------------------------------------------------------------------
// Identifier validation
// ---------------------------------------------------------------------------

static ID_RE: OnceLock<Regex> = OnceLock::new();
static PREFIX_RE: OnceLock<Regex> = OnceLock::new();

fn id_re() -> &'static Regex {
    ID_RE.get_or_init(|| Regex::new(r"^([A-Z][A-Z0-9]*)-(\d{4,})$").unwrap())
}

fn prefix_re() -> &'static Regex {
    PREFIX_RE.get_or_init(|| Regex::new(r"^[A-Z][A-Z0-9]{0,9}$").unwrap())
}

/// Split a validated id into (prefix, sequence number).
pub fn parse_id(id: &str) -> Result<(&str, u32)> {
    let caps = id_re()
        .captures(id)
        .ok_or_else(|| TrellisError::InvalidId(id.to_string()))?;
    let prefix = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    let seq = caps[2]
        .parse::<u32>()
        .map_err(|_| TrellisError::InvalidId(id.to_string()))?;
    Ok((prefix, seq))
}

pub fn validate_id(id: &str) -> Result<()> {
    parse_id(id).map(|_| ())
}

pub fn is_valid_prefix(prefix: &str) -> bool {
    prefix_re().is_match(prefix)
}

pub fn format_id(prefix: &str, seq: u32) -> String {
    format!("{prefix}-{seq:04}")
}

/// Lowercase, hyphen-joined file-name slug derived from a title.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    for word in title
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let word = word.to_ascii_lowercase();
        if !slug.is_empty() {
            if slug.len() + 1 + word.len() > 48 {
                break;
            }
            slug.push('-');
        }
        slug.push_str(&word);
    }
    slug.truncate(48);
    slug
}

/// `{ID}-{slug}.md`, or `{ID}.md` when the title has no usable characters.
pub fn issue_file_name(id: &str, title: &str) -> String {
    let slug = slugify(title);
    if slug.is_empty() {
        format!("{id}.md")
    } else {
        format!("{id}-{slug}.md")
    }
}

/// Recover the id from an issue file name (`FEAT-0001-login.md` → `FEAT-0001`).
pub fn id_from_file_name(name: &str) -> Option<String> {
    let stem = name.strip_suffix(".md")?;
    let mut parts = stem.splitn(3, '-');
    let prefix = parts.next()?;
    let seq = parts.next()?;
    let id = format!("{prefix}-{seq}");
    id_re().is_match(&id).then_some(id)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ids() {
        for id in ["FEAT-0001", "EPIC-0042", "FIX-12345", "X1-0007"] {
            validate_id(id).unwrap_or_else(|_| panic!("expected valid: {id}"));
        }
        assert_eq!(parse_id("FEAT-0042").unwrap(), ("FEAT", 42));
    }

    #[test]
    fn invalid_ids() {
        for id in ["", "feat-0001", "FEAT-01", "FEAT0001", "FEAT-00a1", "-0001"] {
            assert!(validate_id(id).is_err(), "expected invalid: {id}");
        }
    }

    #[test]
    fn slug_and_file_names() {
        assert_eq!(slugify("Add OAuth login (v2)!"), "add-oauth-login-v2");
        assert_eq!(issue_file_name("FEAT-0001", "Login"), "FEAT-0001-login.md");
        assert_eq!(issue_file_name("FEAT-0002", "???"), "FEAT-0002.md");
        assert_eq!(
            id_from_file_name("FEAT-0001-login-page.md").as_deref(),
            Some("FEAT-0001")
        );
        assert_eq!(id_from_file_name("FEAT-0002.md").as_deref(), Some("FEAT-0002"));
        assert_eq!(id_from_file_name("README.md"), None);
    }

    #[test]
    fn path_helpers() {
        let root = Path::new("/tmp/proj");
        assert_eq!(
            config_path(root),
            PathBuf::from("/tmp/proj/.trellis/config.yaml")
        );
        assert_eq!(
            status_dir(root, "Issues", "Features", "open"),
            PathBuf::from("/tmp/proj/Issues/Features/open")
        );
        assert_eq!(
            relative(root, Path::new("/tmp/proj/Issues/Features/open/FEAT-0001.md")),
            "Issues/Features/open/FEAT-0001.md"
        );
    }
}
