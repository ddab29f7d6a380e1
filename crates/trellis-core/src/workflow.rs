//! The two-layer state machine: `Status` (where the file lives) × `Stage`
//! (how far the work has progressed).
//!
//! `plan` is pure: it looks at an issue and a request and answers with the
//! ordered effects the engine must apply, or `Noop` when the issue is already
//! where the action would take it.

use crate::config::{Config, IsolationMode};
use crate::error::{Result, TrellisError};
use crate::governance::Strictness;
use crate::issue::Issue;
use crate::types::{Action, Stage, StageRole, Status};
use serde::Serialize;

// ---------------------------------------------------------------------------
// TransitionRequest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TransitionOptions {
    /// Overrides `git.isolation` for `start`.
    pub isolation: Option<IsolationMode>,
    /// Treat `ask` hook decisions as allow.
    pub auto_confirm: bool,
}

#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub id: String,
    pub action: Action,
    pub actor: String,
    pub solution: Option<String>,
    pub message: Option<String>,
    pub options: TransitionOptions,
}

impl TransitionRequest {
    pub fn new(id: impl Into<String>, action: Action, actor: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action,
            actor: actor.into(),
            solution: None,
            message: None,
            options: TransitionOptions::default(),
        }
    }

    pub fn with_solution(mut self, solution: impl Into<String>) -> Self {
        self.solution = Some(solution.into());
        self
    }
}

/// What the planner needs to know beyond the record itself.
#[derive(Debug, Clone, Default)]
pub struct PlanFacts {
    /// The branch/worktree recorded on the issue still exists.
    pub isolation_present: bool,
    /// Dependencies that have not reached closed.
    pub open_blockers: Vec<String>,
}

// ---------------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Effect {
    /// Governance gate at the given strictness.
    Gate { strictness: Strictness },
    /// Configured verification commands for the action.
    Verify,
    /// Create the isolation branch or worktree.
    BeginIsolation { mode: IsolationMode },
    /// Scoped squash merge of the isolation branch into trunk.
    Finalize,
    SetState { status: Status, stage: Stage },
    SetSolution { solution: String },
    RecordFeedback { message: String },
    Persist,
    /// Remove the isolation branch/worktree after the record is written.
    Cleanup,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "plan", rename_all = "snake_case")]
pub enum Plan {
    Noop { reason: String },
    Apply { effects: Vec<Effect> },
}

impl Plan {
    fn noop(reason: impl Into<String>) -> Self {
        Plan::Noop {
            reason: reason.into(),
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Plan::Noop { .. })
    }

    pub fn effects(&self) -> &[Effect] {
        match self {
            Plan::Noop { .. } => &[],
            Plan::Apply { effects } => effects,
        }
    }
}

// ---------------------------------------------------------------------------
// StateMachine
// ---------------------------------------------------------------------------

pub struct StateMachine<'a> {
    config: &'a Config,
}

impl<'a> StateMachine<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    fn role(&self, issue: &Issue) -> Result<StageRole> {
        self.config
            .workflow
            .role_of(&issue.meta.stage)
            .ok_or_else(|| TrellisError::InvalidRecord {
                path: issue.meta.id.clone(),
                reason: format!("unknown stage '{}'", issue.meta.stage),
            })
    }

    fn stage(&self, role: StageRole) -> Result<Stage> {
        self.config
            .workflow
            .stage_for(role)
            .ok_or_else(|| TrellisError::Config(format!("no stage with role '{role}'")))
    }

    /// `start` looks at `facts.isolation_present` to repair a lost branch;
    /// `close` refuses while `facts.open_blockers` is non-empty.
    pub fn plan(&self, issue: &Issue, req: &TransitionRequest, facts: &PlanFacts) -> Result<Plan> {
        let status = issue.meta.status;
        let role = self.role(issue)?;
        let reject = |reason: &str| TrellisError::InvalidTransition {
            id: issue.meta.id.clone(),
            action: req.action.to_string(),
            from: format!("{status}/{}", issue.meta.stage),
            reason: reason.to_string(),
        };

        let plan = match req.action {
            Action::Create => return Err(reject("issue already exists")),

            Action::Start => match (status, role) {
                (Status::Open, StageRole::Pending) => {
                    let mut effects = Vec::new();
                    let mode = req.options.isolation.unwrap_or(self.config.git.isolation);
                    if mode != IsolationMode::None {
                        effects.push(Effect::BeginIsolation { mode });
                    }
                    effects.push(Effect::SetState {
                        status: Status::Open,
                        stage: self.stage(StageRole::Active)?,
                    });
                    effects.push(Effect::Persist);
                    Plan::Apply { effects }
                }
                (Status::Open, StageRole::Active) => match &issue.meta.isolation {
                    Some(iso) if !facts.isolation_present => Plan::Apply {
                        effects: vec![Effect::BeginIsolation { mode: iso.mode }, Effect::Persist],
                    },
                    _ => Plan::noop("already started"),
                },
                _ => return Err(reject("start requires a pending open issue")),
            },

            Action::Submit => match (status, role) {
                (Status::Open, StageRole::Active) => Plan::Apply {
                    effects: vec![
                        Effect::Gate {
                            strictness: Strictness::Standard,
                        },
                        Effect::Verify,
                        Effect::SetState {
                            status: Status::Open,
                            stage: self.stage(StageRole::Review)?,
                        },
                        Effect::Persist,
                    ],
                },
                (Status::Open, StageRole::Review) => Plan::noop("already in review"),
                _ => return Err(reject("submit requires an active issue")),
            },

            Action::Reject => match (status, role) {
                (Status::Open, StageRole::Review) => {
                    let message = req
                        .message
                        .as_deref()
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .ok_or_else(|| {
                            TrellisError::Validation("reject requires a feedback message".into())
                        })?;
                    Plan::Apply {
                        effects: vec![
                            Effect::RecordFeedback {
                                message: message.to_string(),
                            },
                            Effect::SetState {
                                status: Status::Open,
                                stage: self.stage(StageRole::Active)?,
                            },
                            Effect::Persist,
                        ],
                    }
                }
                (Status::Open, StageRole::Active) => Plan::noop("already active"),
                _ => return Err(reject("reject requires an issue in review")),
            },

            Action::Close => {
                let solution = req
                    .solution
                    .clone()
                    .unwrap_or_else(|| self.config.workflow.default_solution.clone());
                let abandon = self.config.workflow.is_abandon_solution(&solution);
                let terminal = Effect::SetState {
                    status: Status::Closed,
                    stage: self.stage(StageRole::Terminal)?,
                };
                match (status, role) {
                    (Status::Closed, _) => Plan::noop("already closed"),
                    (Status::Open, _) if !facts.open_blockers.is_empty() => {
                        return Err(reject(&format!(
                            "blocked by open dependencies: {}",
                            facts.open_blockers.join(", ")
                        )))
                    }
                    (Status::Open, _) if abandon => {
                        let mut effects = vec![terminal, Effect::SetSolution { solution }, Effect::Persist];
                        if issue.meta.isolation.is_some() {
                            effects.push(Effect::Cleanup);
                        }
                        Plan::Apply { effects }
                    }
                    (Status::Open, StageRole::Review) => {
                        let mut effects = vec![Effect::Gate {
                            strictness: Strictness::Strict,
                        }];
                        if issue.meta.isolation.is_some() {
                            effects.push(Effect::Finalize);
                        }
                        effects.extend([terminal, Effect::SetSolution { solution }, Effect::Persist]);
                        if issue.meta.isolation.is_some() {
                            effects.push(Effect::Cleanup);
                        }
                        Plan::Apply { effects }
                    }
                    _ => {
                        return Err(reject(
                            "close requires review, or an abandon solution such as 'cancelled'",
                        ))
                    }
                }
            }

            Action::Shelve => match status {
                Status::Open => Plan::Apply {
                    effects: vec![
                        Effect::SetState {
                            status: Status::Backlog,
                            stage: self.stage(StageRole::Parked)?,
                        },
                        Effect::Persist,
                    ],
                },
                Status::Backlog => Plan::noop("already shelved"),
                Status::Closed => return Err(reject("closed issues cannot be shelved")),
            },

            Action::Pull => match (status, role) {
                (Status::Backlog, _) => Plan::Apply {
                    effects: vec![
                        Effect::SetState {
                            status: Status::Open,
                            stage: self.stage(StageRole::Pending)?,
                        },
                        Effect::Persist,
                    ],
                },
                (Status::Open, StageRole::Pending) => Plan::noop("already open"),
                _ => return Err(reject("pull requires a backlog issue")),
            },
        };

        self.check_type_allows(issue, &plan, &reject)?;
        Ok(plan)
    }

    fn check_type_allows(
        &self,
        issue: &Issue,
        plan: &Plan,
        reject: &dyn Fn(&str) -> TrellisError,
    ) -> Result<()> {
        let def = self.config.type_def(&issue.meta.issue_type)?;
        for effect in plan.effects() {
            if let Effect::SetState { stage, .. } = effect {
                if !def.allows_stage(stage) {
                    return Err(reject(&format!(
                        "type '{}' does not allow stage '{stage}'",
                        def.name
                    )));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::Isolation;

    fn issue(status: Status, stage: &str) -> Issue {
        let mut i = Issue::new("FEAT-0001", "feature", "Login", Stage::new(stage));
        i.meta.status = status;
        i
    }

    fn req(action: Action) -> TransitionRequest {
        TransitionRequest::new("FEAT-0001", action, "tester")
    }

    fn none() -> PlanFacts {
        PlanFacts::default()
    }

    fn present() -> PlanFacts {
        PlanFacts {
            isolation_present: true,
            ..PlanFacts::default()
        }
    }

    fn isolated(mut i: Issue) -> Issue {
        i.meta.isolation = Some(Isolation {
            mode: IsolationMode::Branch,
            branch: "trellis/feat-0001".into(),
            base: "abc".into(),
            worktree: None,
        });
        i
    }

    #[test]
    fn start_begins_isolation_then_persists() {
        let cfg = Config::default();
        let plan = StateMachine::new(&cfg)
            .plan(&issue(Status::Open, "draft"), &req(Action::Start), &none())
            .unwrap();
        assert_eq!(
            plan.effects(),
            &[
                Effect::BeginIsolation {
                    mode: IsolationMode::Branch
                },
                Effect::SetState {
                    status: Status::Open,
                    stage: Stage::new("doing")
                },
                Effect::Persist,
            ]
        );
    }

    #[test]
    fn start_is_idempotent_and_repairs_missing_isolation() {
        let cfg = Config::default();
        let sm = StateMachine::new(&cfg);
        let active = isolated(issue(Status::Open, "doing"));
        assert!(sm.plan(&active, &req(Action::Start), &present()).unwrap().is_noop());
        let repair = sm.plan(&active, &req(Action::Start), &none()).unwrap();
        assert_eq!(
            repair.effects(),
            &[
                Effect::BeginIsolation {
                    mode: IsolationMode::Branch
                },
                Effect::Persist
            ]
        );
        let plain = issue(Status::Open, "doing");
        assert!(sm.plan(&plain, &req(Action::Start), &none()).unwrap().is_noop());
    }

    #[test]
    fn isolation_none_skips_git() {
        let mut cfg = Config::default();
        cfg.git.isolation = IsolationMode::None;
        let plan = StateMachine::new(&cfg)
            .plan(&issue(Status::Open, "draft"), &req(Action::Start), &none())
            .unwrap();
        assert!(!plan
            .effects()
            .iter()
            .any(|e| matches!(e, Effect::BeginIsolation { .. })));
    }

    #[test]
    fn submit_gates_at_standard() {
        let cfg = Config::default();
        let plan = StateMachine::new(&cfg)
            .plan(&issue(Status::Open, "doing"), &req(Action::Submit), &none())
            .unwrap();
        assert_eq!(
            plan.effects()[0],
            Effect::Gate {
                strictness: Strictness::Standard
            }
        );
    }

    #[test]
    fn close_merges_only_from_review() {
        let cfg = Config::default();
        let sm = StateMachine::new(&cfg);
        let plan = sm
            .plan(&isolated(issue(Status::Open, "review")), &req(Action::Close), &none())
            .unwrap();
        let effects = plan.effects();
        assert_eq!(
            effects[0],
            Effect::Gate {
                strictness: Strictness::Strict
            }
        );
        assert_eq!(effects[1], Effect::Finalize);
        assert_eq!(effects.last(), Some(&Effect::Cleanup));
        assert!(effects.contains(&Effect::SetSolution {
            solution: "implemented".into()
        }));

        let err = sm
            .plan(&issue(Status::Open, "doing"), &req(Action::Close), &none())
            .unwrap_err();
        assert!(matches!(err, TrellisError::InvalidTransition { .. }));
    }

    #[test]
    fn abandon_close_skips_gate_and_merge() {
        let cfg = Config::default();
        let plan = StateMachine::new(&cfg)
            .plan(
                &isolated(issue(Status::Open, "doing")),
                &req(Action::Close).with_solution("wontfix"),
                &none(),
            )
            .unwrap();
        let effects = plan.effects();
        assert!(!effects.iter().any(|e| matches!(e, Effect::Gate { .. } | Effect::Finalize)));
        assert_eq!(effects.last(), Some(&Effect::Cleanup));
    }

    #[test]
    fn close_waits_for_dependencies_whatever_the_solution() {
        let cfg = Config::default();
        let sm = StateMachine::new(&cfg);
        let blocked = PlanFacts {
            open_blockers: vec!["FEAT-0002".into()],
            ..PlanFacts::default()
        };
        for close in [req(Action::Close).with_solution("wontfix"), req(Action::Close)] {
            let err = sm
                .plan(&issue(Status::Open, "review"), &close, &blocked)
                .unwrap_err();
            assert!(err.to_string().contains("FEAT-0002"), "{err}");
        }
        let mut closed = issue(Status::Closed, "done");
        closed.meta.solution = Some("implemented".into());
        assert!(sm.plan(&closed, &req(Action::Close), &blocked).unwrap().is_noop());
    }

    #[test]
    fn reject_needs_message() {
        let cfg = Config::default();
        let sm = StateMachine::new(&cfg);
        let review = issue(Status::Open, "review");
        assert!(matches!(
            sm.plan(&review, &req(Action::Reject), &none()),
            Err(TrellisError::Validation(_))
        ));
        let mut reject = req(Action::Reject);
        reject.message = Some("needs tests".into());
        let plan = sm.plan(&review, &reject, &none()).unwrap();
        assert!(matches!(plan.effects()[0], Effect::RecordFeedback { .. }));
    }

    #[test]
    fn shelve_and_pull_round_trip() {
        let cfg = Config::default();
        let sm = StateMachine::new(&cfg);
        let shelve = sm
            .plan(&issue(Status::Open, "doing"), &req(Action::Shelve), &none())
            .unwrap();
        assert_eq!(
            shelve.effects()[0],
            Effect::SetState {
                status: Status::Backlog,
                stage: Stage::new("freezed")
            }
        );
        let pull = sm
            .plan(&issue(Status::Backlog, "freezed"), &req(Action::Pull), &none())
            .unwrap();
        assert_eq!(
            pull.effects()[0],
            Effect::SetState {
                status: Status::Open,
                stage: Stage::new("draft")
            }
        );
        assert!(sm
            .plan(&issue(Status::Backlog, "freezed"), &req(Action::Shelve), &none())
            .unwrap()
            .is_noop());
    }

    #[test]
    fn closed_issue_only_accepts_repeat_close() {
        let cfg = Config::default();
        let sm = StateMachine::new(&cfg);
        let closed = issue(Status::Closed, "done");
        assert!(sm.plan(&closed, &req(Action::Close), &none()).unwrap().is_noop());
        for action in [Action::Start, Action::Submit, Action::Shelve, Action::Pull] {
            assert!(sm.plan(&closed, &req(action), &none()).is_err());
        }
    }

    #[test]
    fn type_stage_restriction_blocks_transition() {
        let mut cfg = Config::default();
        cfg.types[1].allowed_stages = Some(vec!["draft".into(), "doing".into(), "done".into()]);
        let err = StateMachine::new(&cfg)
            .plan(&issue(Status::Open, "doing"), &req(Action::Submit), &none())
            .unwrap_err();
        assert!(err.to_string().contains("does not allow stage 'review'"));
    }
}
