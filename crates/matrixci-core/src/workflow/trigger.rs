//! Trigger rules: which events start a run.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Event types a workflow can react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Commits pushed to a branch.
    Push,
    /// Pull request; the branch is the target (base) branch.
    PullRequest,
    /// Manually requested run.
    WorkflowDispatch,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::PullRequest => "pull_request",
            EventKind::WorkflowDispatch => "workflow_dispatch",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "push" => Ok(EventKind::Push),
            "pull_request" | "pr" => Ok(EventKind::PullRequest),
            "workflow_dispatch" | "manual" => Ok(EventKind::WorkflowDispatch),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// An incoming event supplied by whoever triggers the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub branch: String,
}

impl Event {
    pub fn new(kind: EventKind, branch: impl Into<String>) -> Self {
        Self {
            kind,
            branch: branch.into(),
        }
    }

    pub fn push(branch: impl Into<String>) -> Self {
        Self::new(EventKind::Push, branch)
    }

    pub fn pull_request(branch: impl Into<String>) -> Self {
        Self::new(EventKind::PullRequest, branch)
    }
}

/// Branch scoping for one event type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchFilter {
    /// Glob patterns; `None` matches every branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branches: Option<Vec<String>>,

    /// Glob patterns that veto a match.
    #[serde(default, alias = "branches-ignore", skip_serializing_if = "Vec::is_empty")]
    pub branches_ignore: Vec<String>,
}

impl BranchFilter {
    pub fn matches(&self, branch: &str) -> bool {
        let hit = |patterns: &[String]| {
            patterns
                .iter()
                .any(|pattern| glob_match::glob_match(pattern, branch))
        };

        if hit(&self.branches_ignore) {
            return false;
        }
        match &self.branches {
            Some(patterns) => hit(patterns),
            None => true,
        }
    }
}

/// One rule: an event type scoped to branch patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRule {
    pub kind: EventKind,
    pub filter: BranchFilter,
}

/// The `on:` section as written in the workflow file.
///
/// Accepts `on: push`, `on: [push, pull_request]` and the map form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TriggerSpec {
    Single(EventKind),
    List(Vec<EventKind>),
    Map(IndexMap<EventKind, Option<BranchFilter>>),
}

/// All trigger rules of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerSet {
    rules: Vec<TriggerRule>,
}

impl TriggerSet {
    pub fn new(rules: Vec<TriggerRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[TriggerRule] {
        &self.rules
    }

    /// True when the event's type has a rule whose branch filter accepts it.
    pub fn matches(&self, event: &Event) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.kind == event.kind && rule.filter.matches(&event.branch))
    }
}

impl From<&TriggerSpec> for TriggerSet {
    fn from(spec: &TriggerSpec) -> Self {
        let unfiltered = |kind: &EventKind| TriggerRule {
            kind: *kind,
            filter: BranchFilter::default(),
        };
        let rules = match spec {
            TriggerSpec::Single(kind) => vec![unfiltered(kind)],
            TriggerSpec::List(kinds) => kinds.iter().map(unfiltered).collect(),
            TriggerSpec::Map(map) => map
                .iter()
                .map(|(kind, filter)| TriggerRule {
                    kind: *kind,
                    filter: filter.clone().unwrap_or_default(),
                })
                .collect(),
        };
        TriggerSet::new(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn main_only() -> TriggerSet {
        let filter = BranchFilter {
            branches: Some(vec!["main".to_string()]),
            branches_ignore: vec![],
        };
        TriggerSet::new(vec![
            TriggerRule {
                kind: EventKind::Push,
                filter: filter.clone(),
            },
            TriggerRule {
                kind: EventKind::PullRequest,
                filter,
            },
        ])
    }

    #[test]
    fn test_push_to_matching_branch() {
        assert!(main_only().matches(&Event::push("main")));
    }

    #[test]
    fn test_push_to_other_branch_does_not_match() {
        assert!(!main_only().matches(&Event::push("feature/x")));
    }

    #[test]
    fn test_pull_request_to_matching_branch() {
        assert!(main_only().matches(&Event::pull_request("main")));
    }

    #[test]
    fn test_event_type_without_rule() {
        let event = Event::new(EventKind::WorkflowDispatch, "main");
        assert!(!main_only().matches(&event));
    }

    #[test]
    fn test_glob_patterns_and_ignore() {
        let filter = BranchFilter {
            branches: Some(vec!["release/*".to_string()]),
            branches_ignore: vec!["release/*-rc".to_string()],
        };
        assert!(filter.matches("release/1.2"));
        assert!(!filter.matches("release/1.3-rc"));
        assert!(!filter.matches("main"));
    }

    #[test]
    fn test_no_branches_matches_everything() {
        let set = TriggerSet::from(&TriggerSpec::List(vec![EventKind::Push]));
        assert!(set.matches(&Event::push("anything")));
        assert!(!set.matches(&Event::pull_request("anything")));
    }

    #[test]
    fn test_event_kind_from_str() {
        assert_eq!("pull-request".parse::<EventKind>().unwrap(), EventKind::PullRequest);
        assert_eq!("push".parse::<EventKind>().unwrap(), EventKind::Push);
        assert!("tag".parse::<EventKind>().is_err());
    }
}
