use crate::error::TrellisError;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Physical state of an issue, mirrored by the directory holding its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Open,
    Closed,
    Backlog,
}

impl Status {
    pub fn all() -> &'static [Status] {
        &[Status::Open, Status::Closed, Status::Backlog]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Open => "open",
            Status::Closed => "closed",
            Status::Backlog => "backlog",
        }
    }

    /// Directory name under `{PluralType}/`.
    pub fn dir_name(self) -> &'static str {
        self.as_str()
    }

    /// Stage roles that may pair with this status.
    pub fn allowed_roles(self) -> &'static [StageRole] {
        match self {
            Status::Open => &[StageRole::Pending, StageRole::Active, StageRole::Review],
            Status::Closed => &[StageRole::Terminal],
            Status::Backlog => &[StageRole::Parked],
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Status::Open),
            "closed" => Ok(Status::Closed),
            "backlog" => Ok(Status::Backlog),
            _ => Err(TrellisError::Validation(format!("unknown status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Logical progress within a status. Names come from configuration; the
/// workflow only reasons about a stage through its [`StageRole`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Stage(String);

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Stage {
    fn from(s: &str) -> Self {
        Stage::new(s)
    }
}

impl From<String> for Stage {
    fn from(s: String) -> Self {
        Stage::new(s)
    }
}

impl From<Stage> for String {
    fn from(stage: Stage) -> Self {
        stage.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    /// Not yet started (draft, ready, ...). The first pending stage is initial.
    Pending,
    Active,
    Review,
    Terminal,
    Parked,
}

impl StageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            StageRole::Pending => "pending",
            StageRole::Active => "active",
            StageRole::Review => "review",
            StageRole::Terminal => "terminal",
            StageRole::Parked => "parked",
        }
    }
}

impl fmt::Display for StageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Start,
    Submit,
    Reject,
    Close,
    Shelve,
    Pull,
}

impl Action {
    pub fn all() -> &'static [Action] {
        &[
            Action::Create,
            Action::Start,
            Action::Submit,
            Action::Reject,
            Action::Close,
            Action::Shelve,
            Action::Pull,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Start => "start",
            Action::Submit => "submit",
            Action::Reject => "reject",
            Action::Close => "close",
            Action::Shelve => "shelve",
            Action::Pull => "pull",
        }
    }

    pub fn is_valid(s: &str) -> bool {
        Action::all().iter().any(|a| a.as_str() == s)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::all()
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| TrellisError::Validation(format!("unknown action: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Criticality
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Criticality {
    pub fn as_str(self) -> &'static str {
        match self {
            Criticality::Low => "low",
            Criticality::Medium => "medium",
            Criticality::High => "high",
            Criticality::Critical => "critical",
        }
    }
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Criticality {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Criticality::Low),
            "medium" => Ok(Criticality::Medium),
            "high" => Ok(Criticality::High),
            "critical" => Ok(Criticality::Critical),
            _ => Err(TrellisError::Validation(format!("unknown criticality: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Relation kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Parent,
    Dependency,
    Related,
}

impl RelationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RelationKind::Parent => "parent",
            RelationKind::Dependency => "dependency",
            RelationKind::Related => "related",
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
