//! ephem lifecycle: create and delete one PR's preview environment.
//!
//! `create`: Validating -> Rendering -> Applying -> terminal status.
//! `delete`: Deleting -> terminal status.
//! Validation and render failures end the operation before any cluster call.
//! Every finished operation is handed to the notification sink; the sink can
//! never change the status.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ephem_apply::{ApplyReport, Applier};
use ephem_core::{
    EnvironmentId, EnvironmentManifest, ErrorCause, LifecycleError, LifecycleResult, LifecycleStatus,
    Operation, ResourceKind, ResourceRef,
};
use ephem_notify::NotificationSink;
use ephem_render::{external_url, Renderer};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const DEFAULT_INGRESS_HOST: &str = "localhost";
const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Validating,
    Rendering,
    Applying,
    Deleting,
    Done(LifecycleStatus),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Validating => f.write_str("validating"),
            Phase::Rendering => f.write_str("rendering"),
            Phase::Applying => f.write_str("applying"),
            Phase::Deleting => f.write_str("deleting"),
            Phase::Done(s) => write!(f, "done ({})", s),
        }
    }
}

fn enter(phase: Phase) {
    debug!(phase = %phase, "phase");
}

/// Short id tying together every log line of one invocation.
fn operation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect()
}

pub struct Orchestrator {
    applier: Applier,
    renderer: Renderer,
    sink: Arc<dyn NotificationSink>,
    ingress_host: String,
    notify_timeout: Duration,
}

impl Orchestrator {
    pub fn new(applier: Applier, renderer: Renderer, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            applier,
            renderer,
            sink,
            ingress_host: DEFAULT_INGRESS_HOST.to_string(),
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
        }
    }

    pub fn with_ingress_host(mut self, host: impl Into<String>) -> Self {
        self.ingress_host = host.into();
        self
    }

    pub fn with_notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    pub async fn create(&self, pr: u64, manifest: &EnvironmentManifest) -> LifecycleResult {
        let span = info_span!("create", pr, op = %operation_id());
        async move {
            let result = self.run_create(pr, manifest).await;
            self.finish(pr, result).await
        }
        .instrument(span)
        .await
    }

    pub async fn delete(&self, pr: u64) -> LifecycleResult {
        let span = info_span!("delete", pr, op = %operation_id());
        async move {
            let result = self.run_delete(pr).await;
            self.finish(pr, result).await
        }
        .instrument(span)
        .await
    }

    async fn run_create(&self, pr: u64, manifest: &EnvironmentManifest) -> LifecycleResult {
        enter(Phase::Validating);
        let env = match EnvironmentId::from_pr(pr) {
            Ok(env) => env,
            Err(e) => return invalid(Operation::Create, pr, None, e.to_string()),
        };
        if let Err(e) = manifest.check() {
            return invalid(Operation::Create, pr, Some(env), e.to_string());
        }

        enter(Phase::Rendering);
        let resources = match self.renderer.render(manifest, &env) {
            Ok(r) => r,
            Err(e) => {
                error!(env = %env, error = %e, "render failed");
                return LifecycleResult::failed(
                    Operation::Create,
                    pr,
                    Some(env),
                    vec![LifecycleError::manifest(ErrorCause::Render(e.to_string()))],
                );
            }
        };
        info!(env = %env, services = manifest.services().len(), resources = resources.len(), "rendered");

        enter(Phase::Applying);
        let report = self.applier.apply(&resources).await;
        self.summarize(pr, env, manifest, &report)
    }

    fn summarize(
        &self,
        pr: u64,
        env: EnvironmentId,
        manifest: &EnvironmentManifest,
        report: &ApplyReport,
    ) -> LifecycleResult {
        let mut result = LifecycleResult::new(Operation::Create, pr, Some(env.clone()));
        for svc in manifest.services() {
            result.services.insert(svc.name.clone(), report.service_state(&svc.name));
        }
        for svc in manifest.ingress_services() {
            let ingress = ResourceRef::new(ResourceKind::Ingress, Some(env.as_str()), svc.name.as_str());
            if !report.is_applied(&ingress) {
                continue;
            }
            if let Some(url) = external_url(&self.ingress_host, &env, svc) {
                result.urls.insert(svc.name.clone(), url);
            }
        }
        // Partial means at least one service is live; readiness timeouts on
        // applied Deployments stay partial.
        let any_deployed = manifest.services().iter().any(|svc| {
            report.is_applied(&ResourceRef::new(ResourceKind::Deployment, Some(env.as_str()), svc.name.as_str()))
        });
        result.errors = report.errors();
        result.status = if result.errors.is_empty() {
            LifecycleStatus::Succeeded
        } else if report.namespace_failed() || !any_deployed {
            LifecycleStatus::Failed
        } else {
            LifecycleStatus::PartiallyFailed
        };
        result
    }

    async fn run_delete(&self, pr: u64) -> LifecycleResult {
        enter(Phase::Validating);
        let env = match EnvironmentId::from_pr(pr) {
            Ok(env) => env,
            Err(e) => return invalid(Operation::Delete, pr, None, e.to_string()),
        };

        enter(Phase::Deleting);
        let report = self.applier.delete_namespace(&env).await;
        let mut result = LifecycleResult::new(Operation::Delete, pr, Some(env));
        if let Some(e) = report.error() {
            result.errors.push(e);
            result.status = LifecycleStatus::Failed;
        }
        result
    }

    async fn finish(&self, pr: u64, result: LifecycleResult) -> LifecycleResult {
        enter(Phase::Done(result.status));
        if result.is_success() {
            info!(status = %result.status, urls = result.urls.len(), "{} finished", result.operation);
        } else {
            for e in &result.errors {
                warn!(error = %e, "problem");
            }
            warn!(status = %result.status, errors = result.errors.len(), "{} finished", result.operation);
        }

        let sink = self.sink.name();
        if tokio::time::timeout(self.notify_timeout, self.sink.notify(pr, &result)).await.is_err() {
            warn!(sink, timeout_ms = self.notify_timeout.as_millis() as u64, "notification timed out");
        } else {
            debug!(sink, "notified");
        }
        result
    }
}

fn invalid(op: Operation, pr: u64, env: Option<EnvironmentId>, message: String) -> LifecycleResult {
    error!(error = %message, "validation failed");
    LifecycleResult::failed(op, pr, env, vec![LifecycleError::manifest(ErrorCause::Validation(message))])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_ids_are_short_and_distinct() {
        let a = operation_id();
        let b = operation_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn phase_display() {
        assert_eq!(Phase::Applying.to_string(), "applying");
        assert_eq!(Phase::Done(LifecycleStatus::PartiallyFailed).to_string(), "done (partially failed)");
    }
}
