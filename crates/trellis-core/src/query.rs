//! `list` filtering.
//!
//! A query is a whitespace-separated list of terms. `+term` must match,
//! `-term` must not, and a bare or `~term` is nice to have. Without any must
//! terms the nice terms act as an OR. Results are ranked by how many nice
//! terms they hit, ties broken by id.

use crate::issue::Issue;
use crate::types::{Stage, Status};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub must: Vec<String>,
    pub exclude: Vec<String>,
    pub nice: Vec<String>,
}

impl Query {
    pub fn parse(text: &str) -> Self {
        let mut q = Query::default();
        for raw in text.split_whitespace() {
            let (bucket, term) = match raw.chars().next() {
                Some('+') => (&mut q.must, &raw[1..]),
                Some('-') => (&mut q.exclude, &raw[1..]),
                Some('~') => (&mut q.nice, &raw[1..]),
                _ => (&mut q.nice, raw),
            };
            if !term.is_empty() {
                bucket.push(term.to_lowercase());
            }
        }
        q
    }

    pub fn is_empty(&self) -> bool {
        self.must.is_empty() && self.exclude.is_empty() && self.nice.is_empty()
    }

    /// Number of nice terms hit, or `None` when the issue is filtered out.
    pub fn score(&self, issue: &Issue) -> Option<usize> {
        let haystack = haystack(issue);
        if self.exclude.iter().any(|t| haystack.contains(t.as_str())) {
            return None;
        }
        if !self.must.iter().all(|t| haystack.contains(t.as_str())) {
            return None;
        }
        let hits = self
            .nice
            .iter()
            .filter(|t| haystack.contains(t.as_str()))
            .count();
        if self.must.is_empty() && !self.nice.is_empty() && hits == 0 {
            return None;
        }
        Some(hits)
    }
}

fn haystack(issue: &Issue) -> String {
    let m = &issue.meta;
    let mut text = String::with_capacity(issue.body.len() + 128);
    text.push_str(&m.id);
    text.push('\n');
    text.push_str(&m.title);
    for t in m.tags.iter().chain(m.domains.iter()) {
        text.push('\n');
        text.push_str(t);
    }
    text.push('\n');
    text.push_str(&issue.body);
    text.to_lowercase()
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub issue_type: Option<String>,
    pub status: Option<Status>,
    pub stage: Option<Stage>,
    pub query: Option<Query>,
}

impl Filter {
    fn admits(&self, issue: &Issue) -> bool {
        if let Some(t) = &self.issue_type {
            if !issue.meta.issue_type.eq_ignore_ascii_case(t) {
                return false;
            }
        }
        if let Some(s) = self.status {
            if issue.meta.status != s {
                return false;
            }
        }
        if let Some(stage) = &self.stage {
            if &issue.meta.stage != stage {
                return false;
            }
        }
        true
    }

    /// Apply to an id-sorted list. With a query, higher scores come first.
    pub fn apply(&self, issues: Vec<Issue>) -> Vec<Issue> {
        let mut scored: Vec<(usize, Issue)> = issues
            .into_iter()
            .filter(|i| self.admits(i))
            .filter_map(|i| match &self.query {
                Some(q) => q.score(&i).map(|s| (s, i)),
                None => Some((0, i)),
            })
            .collect();
        scored.sort_by(|(a, ia), (b, ib)| b.cmp(a).then_with(|| ia.meta.id.cmp(&ib.meta.id)));
        scored.into_iter().map(|(_, i)| i).collect()
    }
}
