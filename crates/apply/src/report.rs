//! Per-resource outcomes of an apply or delete pass.

use std::collections::BTreeMap;

use ephem_core::{ErrorCause, LifecycleError, ResourceKind, ResourceRef, ServiceState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Applied,
    Failed(String),
    /// Not attempted; names the lower-rank resources that failed.
    Skipped { blocked_by: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOutcome {
    pub resource: ResourceRef,
    pub service: Option<String>,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Readiness {
    Ready,
    NotReady { attempts: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// In apply order.
    pub outcomes: Vec<ResourceOutcome>,
    /// Readiness of every Deployment that applied.
    pub readiness: BTreeMap<ResourceRef, Readiness>,
}

impl ApplyReport {
    pub fn outcome(&self, r: &ResourceRef) -> Option<&Outcome> {
        self.outcomes.iter().find(|o| &o.resource == r).map(|o| &o.outcome)
    }

    pub fn is_applied(&self, r: &ResourceRef) -> bool {
        matches!(self.outcome(r), Some(Outcome::Applied))
    }

    pub fn namespace_failed(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.resource.kind == ResourceKind::Namespace && !matches!(o.outcome, Outcome::Applied))
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| matches!(o.outcome, Outcome::Failed(_))).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.outcomes.iter().filter(|o| matches!(o.outcome, Outcome::Skipped { .. })).count()
    }

    /// Apply failures, skips and readiness timeouts, in apply order.
    pub fn errors(&self) -> Vec<LifecycleError> {
        let mut out: Vec<LifecycleError> = self
            .outcomes
            .iter()
            .filter_map(|o| {
                let cause = match &o.outcome {
                    Outcome::Applied => return None,
                    Outcome::Failed(msg) => ErrorCause::Apply(msg.clone()),
                    Outcome::Skipped { blocked_by } => ErrorCause::Skipped { blocked_by: blocked_by.clone() },
                };
                Some(LifecycleError::resource(o.resource.clone(), cause))
            })
            .collect();
        out.extend(self.readiness.iter().filter_map(|(r, state)| match state {
            Readiness::Ready => None,
            Readiness::NotReady { attempts } => {
                Some(LifecycleError::resource(r.clone(), ErrorCause::ReadinessTimeout { attempts: *attempts }))
            }
        }));
        out
    }

    /// Rollup for one declared service: failed beats skipped beats not-ready.
    pub fn service_state(&self, service: &str) -> ServiceState {
        let mine: Vec<&ResourceOutcome> =
            self.outcomes.iter().filter(|o| o.service.as_deref() == Some(service)).collect();
        if mine.iter().any(|o| matches!(o.outcome, Outcome::Failed(_))) {
            return ServiceState::Failed;
        }
        if mine.is_empty() || mine.iter().any(|o| matches!(o.outcome, Outcome::Skipped { .. })) {
            return ServiceState::Skipped;
        }
        let not_ready = mine
            .iter()
            .filter(|o| o.resource.kind == ResourceKind::Deployment)
            .any(|o| !matches!(self.readiness.get(&o.resource), Some(Readiness::Ready)));
        if not_ready {
            ServiceState::NotReady
        } else {
            ServiceState::Ready
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteOutcome {
    /// Deletion accepted and the namespace is gone.
    Deleted,
    /// There was nothing to delete.
    AlreadyAbsent,
    Failed(String),
    TimedOut { waited_secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteReport {
    pub namespace: String,
    pub outcome: DeleteOutcome,
}

impl DeleteReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, DeleteOutcome::Deleted | DeleteOutcome::AlreadyAbsent)
    }

    pub fn error(&self) -> Option<LifecycleError> {
        let cause = match &self.outcome {
            DeleteOutcome::Deleted | DeleteOutcome::AlreadyAbsent => return None,
            DeleteOutcome::Failed(msg) => ErrorCause::Delete(msg.clone()),
            DeleteOutcome::TimedOut { waited_secs } => ErrorCause::DeleteTimeout { waited_secs: *waited_secs },
        };
        Some(LifecycleError::resource(ResourceRef::new(ResourceKind::Namespace, None, &self.namespace), cause))
    }
}
