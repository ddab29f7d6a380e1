use super::{Caller, HookEvent, HookInput};
use crate::config::Config;
use crate::error::{Result, TrellisError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// The YAML block between two `# ---` lines at the top of a hook script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookHeader {
    #[serde(default = "default_caller")]
    pub caller: String,
    pub events: Vec<String>,
    /// Regex matched against the tool name or transition action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matcher: Option<String>,
    /// Glob matched against the event's file paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_caller() -> String {
    "any".to_string()
}

fn default_priority() -> i32 {
    100
}

/// Extract the header block, with the leading `# ` stripped from each line.
fn header_block(content: &str) -> Option<String> {
    let mut lines = content.lines();
    let mut started = false;
    let mut block = Vec::new();
    for line in lines.by_ref() {
        let trimmed = line.trim();
        if trimmed == "# ---" || trimmed == "#---" {
            if started {
                return Some(block.join("\n"));
            }
            started = true;
            continue;
        }
        if !started {
            // Shebang and blank lines may precede the header.
            if trimmed.is_empty() || trimmed.starts_with("#!") {
                continue;
            }
            if trimmed.starts_with('#') {
                continue;
            }
            return None;
        }
        let body = trimmed.strip_prefix('#')?;
        block.push(body.strip_prefix(' ').unwrap_or(body).to_string());
    }
    None
}

pub fn parse_header(content: &str) -> Option<std::result::Result<HookHeader, String>> {
    let block = header_block(content)?;
    Some(serde_yaml::from_str::<HookHeader>(&block).map_err(|e| e.to_string()))
}

// ---------------------------------------------------------------------------
// HookScript
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HookScript {
    pub path: PathBuf,
    pub name: String,
    pub header: HookHeader,
    caller: Option<Caller>,
    events: Vec<HookEvent>,
    matcher: Option<Regex>,
    files: Option<glob::Pattern>,
}

impl HookScript {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let content = std::fs::read_to_string(path)?;
        let origin = path.display().to_string();
        let header = match parse_header(&content) {
            None => return Ok(None),
            Some(Ok(h)) => h,
            Some(Err(reason)) => {
                return Err(TrellisError::InvalidRecord {
                    path: origin,
                    reason: format!("hook header: {reason}"),
                })
            }
        };
        Self::from_header(path, header).map(Some)
    }

    pub fn from_header(path: &Path, header: HookHeader) -> Result<Self> {
        let invalid = |reason: String| TrellisError::InvalidRecord {
            path: path.display().to_string(),
            reason,
        };
        let caller = match header.caller.as_str() {
            "any" | "*" => None,
            other => Some(Caller::from_str(other)?),
        };
        let events = header
            .events
            .iter()
            .map(|e| HookEvent::from_str(e))
            .collect::<Result<Vec<_>>>()?;
        if events.is_empty() {
            return Err(invalid("hook header lists no events".to_string()));
        }
        let matcher = header
            .matcher
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| invalid(format!("bad matcher: {e}")))?;
        let files = header
            .files
            .as_deref()
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| invalid(format!("bad files glob: {e}")))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            path: path.to_path_buf(),
            name,
            header,
            caller,
            events,
            matcher,
            files,
        })
    }

    pub fn priority(&self) -> i32 {
        self.header.priority
    }

    pub fn events(&self) -> &[HookEvent] {
        &self.events
    }

    /// Caller, event, matcher and file filters must all accept the input.
    pub fn matches(&self, input: &HookInput, root: &Path) -> bool {
        if let Some(caller) = self.caller {
            if caller != input.caller() {
                return false;
            }
        }
        if !self.events.contains(&input.event) {
            return false;
        }
        if let Some(re) = &self.matcher {
            match input.subject() {
                Some(subject) if re.is_match(subject) => {}
                _ => return false,
            }
        }
        if let Some(pattern) = &self.files {
            let files = input.files();
            let hit = files.iter().any(|f| {
                let p = Path::new(f);
                let rel = p.strip_prefix(root).unwrap_or(p);
                pattern.matches_path(rel)
            });
            if !hit {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Scripts from the configured hook directories plus individually registered
/// paths, sorted by priority then name. Files without a header are skipped;
/// files with a broken header are an error.
pub fn discover(root: &Path, config: &Config) -> Result<Vec<HookScript>> {
    let mut candidates = Vec::new();
    for dir in &config.hooks.dirs {
        let dir = root.join(dir);
        if !dir.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if !entry.file_type()?.is_file() || name.starts_with('.') || name.ends_with(".md") {
                continue;
            }
            candidates.push(path);
        }
    }
    for script in &config.hooks.scripts {
        candidates.push(root.join(script));
    }
    candidates.sort();
    candidates.dedup();

    let mut scripts = Vec::new();
    for path in candidates {
        match HookScript::load(&path)? {
            Some(script) => scripts.push(script),
            None => tracing::debug!(path = %path.display(), "no hook header, skipping"),
        }
    }
    scripts.sort_by(|a, b| {
        a.priority()
            .cmp(&b.priority())
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(scripts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const SCRIPT: &str = "#!/bin/sh\n# ---\n# caller: claude-code\n# events: [pre-tool-use]\n# matcher: \"^(Write|Edit)$\"\n# files: \"src/**/*.rs\"\n# priority: 10\n# description: guard sources\n# ---\necho '{\"decision\":\"allow\"}'\n";

    fn input(tool: &str, file: &str) -> HookInput {
        HookInput::new(HookEvent::PreToolUse, Caller::ClaudeCode, "agent", "/p").with_payload(
            json!({"tool_name": tool, "tool_input": {"file_path": file}}),
        )
    }

    #[test]
    fn parses_header_fields() {
        let header = parse_header(SCRIPT).unwrap().unwrap();
        assert_eq!(header.caller, "claude-code");
        assert_eq!(header.events, vec!["pre-tool-use"]);
        assert_eq!(header.priority, 10);
        assert_eq!(header.description.as_deref(), Some("guard sources"));
    }

    #[test]
    fn header_defaults() {
        let header = parse_header("# ---\n# events: [pre-commit]\n# ---\n")
            .unwrap()
            .unwrap();
        assert_eq!(header.caller, "any");
        assert_eq!(header.priority, 100);
    }

    #[test]
    fn no_header_means_not_a_hook() {
        assert!(parse_header("#!/bin/sh\necho hi\n").is_none());
    }

    #[test]
    fn matching_applies_every_filter() {
        let script = HookScript::from_header(
            Path::new("/p/.trellis/hooks/guard.sh"),
            parse_header(SCRIPT).unwrap().unwrap(),
        )
        .unwrap();
        let root = Path::new("/p");
        assert!(script.matches(&input("Write", "/p/src/core/lib.rs"), root));
        assert!(!script.matches(&input("Read", "/p/src/core/lib.rs"), root));
        assert!(!script.matches(&input("Write", "/p/docs/x.md"), root));
        let mut other = input("Write", "src/lib.rs");
        other.context.caller = Some(Caller::Gemini);
        assert!(!script.matches(&other, root));
    }

    #[test]
    fn discover_sorts_by_priority() {
        let dir = TempDir::new().unwrap();
        let hooks = dir.path().join(".trellis/hooks");
        std::fs::create_dir_all(&hooks).unwrap();
        std::fs::write(hooks.join("b.sh"), "# ---\n# events: [pre-transition]\n# ---\n").unwrap();
        std::fs::write(
            hooks.join("a.sh"),
            "# ---\n# events: [pre-transition]\n# priority: 200\n# ---\n",
        )
        .unwrap();
        std::fs::write(hooks.join("plain.sh"), "echo no header\n").unwrap();
        let scripts = discover(dir.path(), &Config::default()).unwrap();
        let names: Vec<&str> = scripts.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["b.sh", "a.sh"]);
    }

    #[test]
    fn unknown_event_is_rejected() {
        let header = parse_header("# ---\n# events: [on-merge]\n# ---\n")
            .unwrap()
            .unwrap();
        assert!(HookScript::from_header(Path::new("x"), header).is_err());
    }
}
