//! In-memory index of issue relations.
//!
//! Built from the store on demand. Parent and dependency edges must stay
//! acyclic; every insertion goes through [`RelationGraph::check_links`], which
//! runs a colored DFS over the would-be graph before anything is written.

use crate::error::{Result, TrellisError};
use crate::issue::Issue;
use crate::types::{RelationKind, Stage, Status};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub id: String,
    pub issue_type: String,
    pub title: String,
    pub status: Status,
    pub stage: Stage,
    pub parent: Option<String>,
    pub dependencies: Vec<String>,
    pub related: Vec<String>,
    pub domains: Vec<String>,
}

impl Node {
    fn from_issue(issue: &Issue) -> Self {
        let m = &issue.meta;
        Self {
            id: m.id.clone(),
            issue_type: m.issue_type.clone(),
            title: m.title.clone(),
            status: m.status,
            stage: m.stage.clone(),
            parent: m.parent.clone(),
            dependencies: m.dependencies.clone(),
            related: m.related.clone(),
            domains: m.domains.clone(),
        }
    }

    fn edges(&self, kind: RelationKind) -> Vec<&str> {
        match kind {
            RelationKind::Parent => self.parent.iter().map(|s| s.as_str()).collect(),
            RelationKind::Dependency => self.dependencies.iter().map(|s| s.as_str()).collect(),
            RelationKind::Related => self.related.iter().map(|s| s.as_str()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    InProgress,
    Done,
}

#[derive(Debug, Clone, Default)]
pub struct RelationGraph {
    nodes: BTreeMap<String, Node>,
}

impl RelationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_issues<'a>(issues: impl IntoIterator<Item = &'a Issue>) -> Self {
        let mut graph = Self::new();
        for issue in issues {
            graph.upsert(issue);
        }
        graph
    }

    pub fn upsert(&mut self, issue: &Issue) {
        self.nodes
            .insert(issue.meta.id.clone(), Node::from_issue(issue));
    }

    pub fn remove(&mut self, id: &str) -> Option<Node> {
        self.nodes.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // -----------------------------------------------------------------------
    // Traversal
    // -----------------------------------------------------------------------

    pub fn children(&self, id: &str) -> Vec<&str> {
        self.nodes
            .values()
            .filter(|n| n.parent.as_deref() == Some(id))
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Dependencies of `id` that are not closed yet.
    pub fn blockers(&self, id: &str) -> Vec<&str> {
        let Some(node) = self.nodes.get(id) else {
            return Vec::new();
        };
        node.dependencies
            .iter()
            .filter(|d| {
                self.nodes
                    .get(d.as_str())
                    .map(|n| n.status != Status::Closed)
                    .unwrap_or(true)
            })
            .map(|d| d.as_str())
            .collect()
    }

    /// Issues that list `id` as a dependency.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.nodes
            .values()
            .filter(|n| n.dependencies.iter().any(|d| d == id))
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Related links are stored one-sided but read both ways.
    pub fn related(&self, id: &str) -> Vec<&str> {
        let mut out: BTreeSet<&str> = BTreeSet::new();
        if let Some(node) = self.nodes.get(id) {
            out.extend(node.related.iter().map(|s| s.as_str()));
        }
        for n in self.nodes.values() {
            if n.related.iter().any(|r| r == id) {
                out.insert(n.id.as_str());
            }
        }
        out.remove(id);
        out.into_iter().collect()
    }

    /// Every (referrer, kind) pointing at `id`.
    pub fn referrers(&self, id: &str) -> Vec<(String, RelationKind)> {
        let mut out = Vec::new();
        for n in self.nodes.values() {
            if n.id == id {
                continue;
            }
            for kind in [
                RelationKind::Parent,
                RelationKind::Dependency,
                RelationKind::Related,
            ] {
                if n.edges(kind).contains(&id) {
                    out.push((n.id.clone(), kind));
                }
            }
        }
        out
    }

    // -----------------------------------------------------------------------
    // Integrity
    // -----------------------------------------------------------------------

    /// Validate the outgoing links `issue` would have once written: targets
    /// exist, no self-reference, and no parent/dependency cycle through it.
    pub fn check_links(&self, issue: &Issue) -> Result<()> {
        let id = issue.meta.id.as_str();
        for kind in [
            RelationKind::Parent,
            RelationKind::Dependency,
            RelationKind::Related,
        ] {
            for to in issue.links(kind) {
                if to == id {
                    return Err(TrellisError::Validation(format!(
                        "{id} cannot be its own {kind}"
                    )));
                }
                if !self.nodes.contains_key(to) {
                    return Err(TrellisError::DanglingReference {
                        from: id.to_string(),
                        kind: kind.to_string(),
                        to: to.to_string(),
                    });
                }
            }
        }

        let mut proposed = self.clone();
        proposed.upsert(issue);
        for kind in [RelationKind::Parent, RelationKind::Dependency] {
            if let Some(path) = proposed.cycle_from(id, kind) {
                return Err(TrellisError::Cycle {
                    kind: kind.to_string(),
                    path,
                });
            }
        }
        Ok(())
    }

    /// A cycle of `kind` edges reachable from `start`, as a closed path
    /// (`[A, B, A]`).
    pub fn cycle_from(&self, start: &str, kind: RelationKind) -> Option<Vec<String>> {
        let mut colors = HashMap::new();
        let mut stack = Vec::new();
        self.dfs(start, kind, &mut colors, &mut stack)
    }

    fn dfs<'a>(
        &'a self,
        id: &'a str,
        kind: RelationKind,
        colors: &mut HashMap<&'a str, Color>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match colors.get(id) {
            Some(Color::Done) => return None,
            Some(Color::InProgress) => {
                let pos = stack.iter().position(|s| *s == id).unwrap_or(0);
                let mut path: Vec<String> = stack[pos..].iter().map(|s| s.to_string()).collect();
                path.push(id.to_string());
                return Some(path);
            }
            None => {}
        }
        colors.insert(id, Color::InProgress);
        stack.push(id);
        if let Some(node) = self.nodes.get(id) {
            for next in node.edges(kind) {
                if let Some(cycle) = self.dfs(next, kind, colors, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        colors.insert(id, Color::Done);
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(id: &str, parent: Option<&str>, deps: &[&str]) -> Issue {
        let mut i = Issue::new(id, "feature", id, Stage::new("draft"));
        i.meta.parent = parent.map(str::to_string);
        i.meta.dependencies = deps.iter().map(|s| s.to_string()).collect();
        i
    }

    fn graph(issues: &[Issue]) -> RelationGraph {
        RelationGraph::from_issues(issues)
    }

    #[test]
    fn dependency_cycle_is_rejected() {
        let g = graph(&[
            issue("FEAT-0001", None, &["FEAT-0002"]),
            issue("FEAT-0002", None, &[]),
        ]);
        let closing = issue("FEAT-0002", None, &["FEAT-0001"]);
        match g.check_links(&closing) {
            Err(TrellisError::Cycle { kind, path }) => {
                assert_eq!(kind, "dependency");
                assert_eq!(path.first(), path.last());
                assert!(path.contains(&"FEAT-0001".to_string()));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn parent_cycle_is_rejected() {
        let g = graph(&[
            issue("EPIC-0001", Some("EPIC-0002"), &[]),
            issue("EPIC-0002", None, &[]),
        ]);
        let err = g
            .check_links(&issue("EPIC-0002", Some("EPIC-0001"), &[]))
            .unwrap_err();
        assert!(matches!(err, TrellisError::Cycle { .. }));
    }

    #[test]
    fn dangling_and_self_links_are_rejected() {
        let g = graph(&[issue("FEAT-0001", None, &[])]);
        assert!(matches!(
            g.check_links(&issue("FEAT-0002", Some("EPIC-0009"), &[])),
            Err(TrellisError::DanglingReference { .. })
        ));
        assert!(matches!(
            g.check_links(&issue("FEAT-0001", None, &["FEAT-0001"])),
            Err(TrellisError::Validation(_))
        ));
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let g = graph(&[
            issue("FEAT-0001", None, &["FEAT-0002", "FEAT-0003"]),
            issue("FEAT-0002", None, &["FEAT-0004"]),
            issue("FEAT-0003", None, &["FEAT-0004"]),
            issue("FEAT-0004", None, &[]),
        ]);
        assert!(g.cycle_from("FEAT-0001", RelationKind::Dependency).is_none());
        g.check_links(&issue("FEAT-0001", None, &["FEAT-0002", "FEAT-0003"]))
            .unwrap();
    }

    #[test]
    fn existing_cycle_is_reported_as_closed_path() {
        let g = graph(&[
            issue("FEAT-0001", None, &["FEAT-0002"]),
            issue("FEAT-0002", None, &["FEAT-0001"]),
        ]);
        assert_eq!(
            g.cycle_from("FEAT-0001", RelationKind::Dependency),
            Some(vec!["FEAT-0001".to_string(), "FEAT-0002".into(), "FEAT-0001".into()])
        );
    }

    #[test]
    fn traversal_queries() {
        let mut done = issue("FEAT-0003", None, &[]);
        done.meta.status = Status::Closed;
        let mut a = issue("FEAT-0001", Some("EPIC-0001"), &["FEAT-0002", "FEAT-0003"]);
        a.meta.related = vec!["FEAT-0004".into()];
        let g = graph(&[
            issue("EPIC-0001", None, &[]),
            a,
            issue("FEAT-0002", Some("FEAT-0001"), &[]),
            done,
            issue("FEAT-0004", None, &[]),
        ]);
        assert_eq!(g.children("EPIC-0001"), vec!["FEAT-0001"]);
        assert_eq!(g.blockers("FEAT-0001"), vec!["FEAT-0002"]);
        assert_eq!(g.dependents("FEAT-0003"), vec!["FEAT-0001"]);
        assert_eq!(g.related("FEAT-0004"), vec!["FEAT-0001"]);
        assert_eq!(g.referrers("FEAT-0004").len(), 1);
    }
}
