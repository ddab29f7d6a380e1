use crate::config::IsolationMode;
use crate::error::{Result, TrellisError};
use crate::types::{Criticality, RelationKind, Stage, Status};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Supporting metadata types
// ---------------------------------------------------------------------------

/// Where an issue's work happens while it is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Isolation {
    pub mode: IsolationMode,
    pub branch: String,
    /// Trunk commit the branch was created from.
    pub base: String,
    /// Worktree directory relative to the project root (worktree mode only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub actor: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Set when a failed transaction could not be rolled back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryMarker {
    pub reason: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// IssueMeta
// ---------------------------------------------------------------------------

/// The YAML front matter of an issue record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueMeta {
    pub id: String,
    #[serde(rename = "type")]
    pub issue_type: String,
    pub title: String,
    pub status: Status,
    pub stage: Stage,
    #[serde(default)]
    pub criticality: Criticality,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<String>,
    /// Cross-project references, `namespace::ID`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspace_refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
    /// Tracked files: what this issue claims to touch.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation: Option<Isolation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feedback: Vec<Feedback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryMarker>,
}

// ---------------------------------------------------------------------------
// Issue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Issue {
    pub meta: IssueMeta,
    pub body: String,
}

impl Issue {
    pub fn new(
        id: impl Into<String>,
        issue_type: impl Into<String>,
        title: impl Into<String>,
        stage: Stage,
    ) -> Self {
        let id = id.into();
        let title = title.into();
        let now = Utc::now();
        let body = default_body(&id, &title);
        Self {
            meta: IssueMeta {
                id,
                issue_type: issue_type.into(),
                title,
                status: Status::Open,
                stage,
                criticality: Criticality::default(),
                created_at: now,
                updated_at: now,
                started_at: None,
                closed_at: None,
                parent: None,
                dependencies: Vec::new(),
                related: Vec::new(),
                workspace_refs: Vec::new(),
                tags: Vec::new(),
                domains: Vec::new(),
                files: Vec::new(),
                solution: None,
                isolation: None,
                feedback: Vec::new(),
                recovery: None,
            },
            body,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn touch(&mut self) {
        self.meta.updated_at = Utc::now();
    }

    /// Targets of outgoing edges of `kind`.
    pub fn links(&self, kind: RelationKind) -> Vec<&str> {
        match kind {
            RelationKind::Parent => self.meta.parent.iter().map(|s| s.as_str()).collect(),
            RelationKind::Dependency => self.meta.dependencies.iter().map(|s| s.as_str()).collect(),
            RelationKind::Related => self.meta.related.iter().map(|s| s.as_str()).collect(),
        }
    }

    // -----------------------------------------------------------------------
    // Document format
    // -----------------------------------------------------------------------

    /// Parse a `---` fenced YAML header followed by a Markdown body.
    pub fn parse(content: &str, origin: &str) -> Result<Self> {
        let (front, body) = split_document(content).ok_or_else(|| TrellisError::InvalidRecord {
            path: origin.to_string(),
            reason: "missing '---' metadata header".to_string(),
        })?;
        let meta: IssueMeta =
            serde_yaml::from_str(front).map_err(|e| TrellisError::InvalidRecord {
                path: origin.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            meta,
            body: body.to_string(),
        })
    }

    pub fn render(&self) -> Result<String> {
        let yaml = serde_yaml::to_string(&self.meta)?;
        Ok(format!("---\n{yaml}---\n{}", self.body))
    }

    // -----------------------------------------------------------------------
    // Body helpers
    // -----------------------------------------------------------------------

    pub fn checklist(&self) -> Vec<ChecklistItem> {
        checklist(&self.body)
    }

    pub fn section(&self, heading: &str) -> Option<String> {
        section(&self.body, heading)
    }
}

fn default_body(id: &str, title: &str) -> String {
    format!(
        "\n## {id}: {title}\n\n\
         ## Objective\n\n{title}\n\n\
         ## Acceptance Criteria\n\n- [ ] {title} works as described\n\n\
         ## Technical Tasks\n\n- [ ] Implement {title}\n\n\
         ## Review Comments\n\n"
    )
}

/// Split a record into (front matter, body). The body is everything after the
/// closing `---` line, verbatim, so render/parse round-trips exactly.
pub fn split_document(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix("---")?;
    let rest = if let Some(r) = rest.strip_prefix('\n') {
        r
    } else if let Some(r) = rest.strip_prefix("\r\n") {
        r
    } else {
        return None;
    };
    if let Some(body) = rest.strip_prefix("---\n") {
        return Some(("", body));
    }
    let mut search = 0;
    while let Some(offset) = rest[search..].find("\n---") {
        let end = search + offset;
        let after = &rest[end + 4..];
        if after.is_empty() {
            return Some((&rest[..end + 1], ""));
        }
        if let Some(body) = after.strip_prefix('\n') {
            return Some((&rest[..end + 1], body));
        }
        if let Some(body) = after.strip_prefix("\r\n") {
            return Some((&rest[..end + 1], body));
        }
        search = end + 4;
    }
    None
}

// ---------------------------------------------------------------------------
// Checklist
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckMark {
    Open,
    Done,
    InProgress,
    Blocked,
}

impl CheckMark {
    fn from_char(c: char) -> Option<Self> {
        match c {
            ' ' => Some(CheckMark::Open),
            'x' | 'X' => Some(CheckMark::Done),
            '-' => Some(CheckMark::InProgress),
            '!' => Some(CheckMark::Blocked),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            CheckMark::Open => ' ',
            CheckMark::Done => 'x',
            CheckMark::InProgress => '-',
            CheckMark::Blocked => '!',
        }
    }

    pub fn is_resolved(self) -> bool {
        self == CheckMark::Done
    }
}

impl std::str::FromStr for CheckMark {
    type Err = TrellisError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "open" | "todo" | " " => Ok(CheckMark::Open),
            "done" | "x" | "X" => Ok(CheckMark::Done),
            "doing" | "in_progress" | "-" => Ok(CheckMark::InProgress),
            "blocked" | "!" => Ok(CheckMark::Blocked),
            _ => Err(TrellisError::Validation(format!("unknown checklist mark: {s}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    /// 0-based line index within the body.
    pub line: usize,
    pub mark: CheckMark,
    pub text: String,
}

static CHECK_RE: OnceLock<Regex> = OnceLock::new();

fn check_re() -> &'static Regex {
    CHECK_RE.get_or_init(|| Regex::new(r"^(\s*[-*]\s+\[)(.)(\]\s+)(.*)$").unwrap())
}

pub fn checklist(body: &str) -> Vec<ChecklistItem> {
    let mut in_fence = false;
    let mut items = Vec::new();
    for (line, text) in body.lines().enumerate() {
        if text.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(caps) = check_re().captures(text) {
            let Some(mark) = caps[2].chars().next().and_then(CheckMark::from_char) else {
                continue;
            };
            items.push(ChecklistItem {
                line,
                mark,
                text: caps[4].trim().to_string(),
            });
        }
    }
    items
}

/// Re-mark the `index`-th (1-based) checklist item.
pub fn set_check(body: &str, index: usize, mark: CheckMark) -> Result<String> {
    let items = checklist(body);
    let item = index
        .checked_sub(1)
        .and_then(|i| items.get(i))
        .ok_or_else(|| {
            TrellisError::Validation(format!(
                "checklist item {index} out of range (1..={})",
                items.len()
            ))
        })?;
    let mut out = String::with_capacity(body.len());
    for (line, text) in body.split_inclusive('\n').enumerate() {
        if line == item.line {
            let (content, newline) = match text.strip_suffix('\n') {
                Some(c) => (c, "\n"),
                None => (text, ""),
            };
            let replaced = check_re().replace(content, |caps: &regex::Captures| {
                format!("{}{}{}{}", &caps[1], mark.as_char(), &caps[3], &caps[4])
            });
            out.push_str(&replaced);
            out.push_str(newline);
        } else {
            out.push_str(text);
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Text under `## {heading}` up to the next level-1/2 heading, trimmed.
pub fn section(body: &str, heading: &str) -> Option<String> {
    let mut collecting = false;
    let mut out = Vec::new();
    for line in body.lines() {
        let trimmed = line.trim_start();
        if let Some(title) = trimmed.strip_prefix("## ") {
            if collecting {
                break;
            }
            collecting = title.trim().eq_ignore_ascii_case(heading);
            continue;
        }
        if collecting && trimmed.starts_with("# ") {
            break;
        }
        if collecting {
            out.push(line);
        }
    }
    collecting.then(|| out.join("\n").trim().to_string())
}

/// Append `line` to the end of the `## {heading}` section, creating the
/// section at the end of the body when it is missing.
pub fn append_to_section(body: &str, heading: &str, line: &str) -> String {
    let lines: Vec<&str> = body.lines().collect();
    let start = lines.iter().position(|l| {
        l.trim_start()
            .strip_prefix("## ")
            .map(|t| t.trim().eq_ignore_ascii_case(heading))
            .unwrap_or(false)
    });
    let Some(start) = start else {
        let mut out = body.trim_end().to_string();
        out.push_str(&format!("\n\n## {heading}\n\n{line}\n"));
        return out;
    };
    let end = lines[start + 1..]
        .iter()
        .position(|l| {
            let t = l.trim_start();
            t.starts_with("## ") || t.starts_with("# ")
        })
        .map(|i| start + 1 + i)
        .unwrap_or(lines.len());
    // Insert after the last non-blank line of the section.
    let mut insert_at = end;
    while insert_at > start + 1 && lines[insert_at - 1].trim().is_empty() {
        insert_at -= 1;
    }
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 3);
    out.extend(lines[..insert_at].iter().map(|l| l.to_string()));
    if insert_at == start + 1 {
        out.push(String::new());
    }
    out.push(line.to_string());
    if end < lines.len() {
        out.push(String::new());
    }
    out.extend(lines[end..].iter().map(|l| l.to_string()));
    let mut text = out.join("\n");
    text.push('\n');
    text
}

/// Strip `<!-- ... -->` comments; used to decide whether a section has content.
pub fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<!--") {
        out.push_str(&rest[..start]);
        match rest[start..].find("-->") {
            Some(end) => rest = &rest[start + end + 3..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Issue {
        let mut issue = Issue::new("FEAT-0001", "feature", "Login page", Stage::new("draft"));
        issue.meta.parent = Some("EPIC-0001".into());
        issue.meta.files = vec!["src/login.rs".into()];
        issue
    }

    #[test]
    fn render_parse_roundtrip() {
        let issue = sample();
        let text = issue.render().unwrap();
        assert!(text.starts_with("---\nid: FEAT-0001\n"));
        let parsed = Issue::parse(&text, "mem").unwrap();
        assert_eq!(parsed, issue);
    }

    #[test]
    fn hand_edited_stage_case_is_normalized() {
        let issue = sample();
        let text = issue.render().unwrap().replace("stage: draft", "stage: Draft");
        let parsed = Issue::parse(&text, "mem").unwrap();
        assert_eq!(parsed.meta.stage, Stage::new("draft"));
        assert_eq!(parsed, issue);
    }

    #[test]
    fn notes_append_inside_their_section() {
        let body = "## Review Comments\n\n## Later\ntext\n";
        let once = append_to_section(body, "Review Comments", "- alice: looks good");
        assert_eq!(
            section(&once, "Review Comments").as_deref(),
            Some("- alice: looks good")
        );
        assert_eq!(section(&once, "Later").as_deref(), Some("text"));
        let twice = append_to_section(&once, "review comments", "- bob: ship it");
        assert_eq!(
            section(&twice, "Review Comments").as_deref(),
            Some("- alice: looks good\n- bob: ship it")
        );
        let created = append_to_section("intro\n", "Review Comments", "- x");
        assert_eq!(section(&created, "Review Comments").as_deref(), Some("- x"));
    }

    #[test]
    fn parse_rejects_missing_header() {
        let err = Issue::parse("# just markdown\n", "x.md").unwrap_err();
        assert!(matches!(err, TrellisError::InvalidRecord { .. }));
    }

    #[test]
    fn split_document_handles_dashes_in_body() {
        let doc = "---\nid: A\n---\nbody\n---\nmore\n";
        let (front, body) = split_document(doc).unwrap();
        assert_eq!(front, "id: A\n");
        assert_eq!(body, "body\n---\nmore\n");
    }

    #[test]
    fn checklist_recognizes_all_marks() {
        let body = "- [ ] open\n- [x] done\n* [X] done too\n- [-] doing\n- [!] blocked\n- [?] nope\n```\n- [ ] fenced\n```\n";
        let items = checklist(body);
        let marks: Vec<CheckMark> = items.iter().map(|i| i.mark).collect();
        assert_eq!(
            marks,
            vec![
                CheckMark::Open,
                CheckMark::Done,
                CheckMark::Done,
                CheckMark::InProgress,
                CheckMark::Blocked
            ]
        );
        assert_eq!(items[3].text, "doing");
    }

    #[test]
    fn set_check_rewrites_one_line() {
        let body = "intro\n- [ ] first\n- [ ] second\n";
        let updated = set_check(body, 2, CheckMark::Done).unwrap();
        assert_eq!(updated, "intro\n- [ ] first\n- [x] second\n");
        assert!(set_check(body, 3, CheckMark::Done).is_err());
        assert!(set_check(body, 0, CheckMark::Done).is_err());
    }

    #[test]
    fn section_extraction() {
        let issue = sample();
        assert_eq!(issue.section("Review Comments").as_deref(), Some(""));
        assert_eq!(issue.section("Objective").as_deref(), Some("Login page"));
        assert!(issue.section("Missing").is_none());
    }

    #[test]
    fn strip_comments_removes_html_comments() {
        assert_eq!(strip_comments("a<!-- hidden -->b").trim(), "ab");
        assert_eq!(strip_comments("<!-- open").trim(), "");
    }
}
