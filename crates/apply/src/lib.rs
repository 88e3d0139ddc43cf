//! ephem apply: drive rendered resources into the cluster in rank order,
//! wait for Deployments to become ready, and tear environments down.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ephem_core::{EnvironmentId, RenderedResource, ResourceKind, ResourceRef};
use ephem_kubehub::{Cluster, ClusterError, DeleteStatus};
use futures::future::join_all;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

mod report;

pub use report::{ApplyReport, DeleteOutcome, DeleteReport, Outcome, Readiness, ResourceOutcome};

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<u64>().ok())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplierConfig {
    /// Deadline for every single cluster call.
    pub call_timeout: Duration,
    pub ready_attempts: u32,
    pub ready_backoff: Duration,
    pub delete_timeout: Duration,
    pub delete_poll: Duration,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            ready_attempts: 30,
            ready_backoff: Duration::from_secs(2),
            delete_timeout: Duration::from_secs(120),
            delete_poll: Duration::from_secs(2),
        }
    }
}

impl ApplierConfig {
    /// Defaults, overridden by `EPHEM_*` environment variables when set and parseable.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            call_timeout: env_u64("EPHEM_CALL_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.call_timeout),
            ready_attempts: env_u64("EPHEM_READY_ATTEMPTS")
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(d.ready_attempts),
            ready_backoff: env_u64("EPHEM_READY_BACKOFF_MS").map(Duration::from_millis).unwrap_or(d.ready_backoff),
            delete_timeout: env_u64("EPHEM_DELETE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.delete_timeout),
            delete_poll: env_u64("EPHEM_DELETE_POLL_MS").map(Duration::from_millis).unwrap_or(d.delete_poll),
        }
    }
}

pub struct Applier {
    cluster: Arc<dyn Cluster>,
    cfg: ApplierConfig,
}

impl Applier {
    pub fn new(cluster: Arc<dyn Cluster>, cfg: ApplierConfig) -> Self {
        Self { cluster, cfg }
    }

    pub fn config(&self) -> &ApplierConfig {
        &self.cfg
    }

    async fn call<T>(&self, fut: impl Future<Output = Result<T, ClusterError>>) -> Result<T, ClusterError> {
        match tokio::time::timeout(self.cfg.call_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(ClusterError::Timeout(self.cfg.call_timeout)),
        }
    }

    /// Apply `resources` rank by rank. Resources within a rank go out
    /// concurrently; once a rank has a failure, every higher rank is skipped.
    /// Applied resources are never rolled back.
    pub async fn apply(&self, resources: &[RenderedResource]) -> ApplyReport {
        let t0 = Instant::now();
        let mut ranks: BTreeMap<u8, Vec<&RenderedResource>> = BTreeMap::new();
        for r in resources {
            ranks.entry(r.rank()).or_default().push(r);
        }

        let mut report = ApplyReport::default();
        let mut failed: Vec<String> = Vec::new();
        for (rank, group) in ranks {
            if !failed.is_empty() {
                for r in group {
                    debug!(resource = %r.reference(), "skipped");
                    counter!("ephem_apply_skipped", 1u64);
                    report.outcomes.push(ResourceOutcome {
                        resource: r.reference(),
                        service: r.service.clone(),
                        outcome: Outcome::Skipped { blocked_by: failed.clone() },
                    });
                }
                continue;
            }
            debug!(rank, count = group.len(), "applying rank");
            let results = join_all(group.iter().map(|r| self.upsert_one(r))).await;
            for (r, res) in group.into_iter().zip(results) {
                let outcome = match res {
                    Ok(()) => Outcome::Applied,
                    Err(e) => {
                        failed.push(r.reference().to_string());
                        Outcome::Failed(e.to_string())
                    }
                };
                report.outcomes.push(ResourceOutcome { resource: r.reference(), service: r.service.clone(), outcome });
            }
        }

        let deployments: Vec<ResourceRef> = report
            .outcomes
            .iter()
            .filter(|o| o.resource.kind == ResourceKind::Deployment && o.outcome == Outcome::Applied)
            .map(|o| o.resource.clone())
            .collect();
        let checks = join_all(deployments.iter().map(|d| self.wait_ready(d))).await;
        report.readiness = deployments.into_iter().zip(checks).collect();

        histogram!("ephem_apply_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            resources = report.outcomes.len(),
            failed = report.failed_count(),
            skipped = report.skipped_count(),
            took_ms = t0.elapsed().as_millis() as u64,
            "apply finished"
        );
        report
    }

    async fn upsert_one(&self, r: &RenderedResource) -> Result<(), ClusterError> {
        let t0 = Instant::now();
        let res = self.call(self.cluster.upsert(r)).await;
        histogram!("ephem_upsert_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(()) => {
                counter!("ephem_apply_ok", 1u64);
                info!(resource = %r.reference(), "applied");
            }
            Err(e) => {
                counter!("ephem_apply_err", 1u64);
                warn!(resource = %r.reference(), error = %e, "apply failed");
            }
        }
        res
    }

    /// Poll until the Deployment reports a ready replica or attempts run out.
    /// Poll errors count as not ready.
    async fn wait_ready(&self, deployment: &ResourceRef) -> Readiness {
        let ns = deployment.namespace.as_deref().unwrap_or_default();
        let attempts = self.cfg.ready_attempts.max(1);
        for attempt in 1..=attempts {
            match self.call(self.cluster.ready_replicas(ns, &deployment.name)).await {
                Ok(n) if n >= 1 => {
                    counter!("ephem_ready_ok", 1u64);
                    info!(deployment = %deployment, attempt, "ready");
                    return Readiness::Ready;
                }
                Ok(_) => debug!(deployment = %deployment, attempt, "not ready yet"),
                Err(e) => warn!(deployment = %deployment, attempt, error = %e, "readiness check failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.cfg.ready_backoff).await;
            }
        }
        counter!("ephem_ready_timeout", 1u64);
        warn!(deployment = %deployment, attempts, "never became ready");
        Readiness::NotReady { attempts }
    }

    /// Delete the environment's namespace and wait until it is gone.
    pub async fn delete_namespace(&self, env: &EnvironmentId) -> DeleteReport {
        let ns = env.as_str();
        let outcome = match self.call(self.cluster.delete_namespace(ns)).await {
            Ok(DeleteStatus::NotFound) => {
                info!(namespace = ns, "namespace already absent");
                DeleteOutcome::AlreadyAbsent
            }
            Ok(DeleteStatus::Accepted) => self.await_absent(ns).await,
            Err(e) => {
                warn!(namespace = ns, error = %e, "namespace delete failed");
                DeleteOutcome::Failed(e.to_string())
            }
        };
        match &outcome {
            DeleteOutcome::Deleted | DeleteOutcome::AlreadyAbsent => {
                counter!("ephem_delete_ok", 1u64);
            }
            _ => {
                counter!("ephem_delete_err", 1u64);
            }
        }
        DeleteReport { namespace: ns.to_string(), outcome }
    }

    async fn await_absent(&self, ns: &str) -> DeleteOutcome {
        let started = Instant::now();
        let deadline = started + self.cfg.delete_timeout;
        loop {
            match self.call(self.cluster.namespace_exists(ns)).await {
                Ok(false) => {
                    info!(namespace = ns, took_ms = started.elapsed().as_millis() as u64, "namespace deleted");
                    return DeleteOutcome::Deleted;
                }
                Ok(true) => debug!(namespace = ns, "namespace still terminating"),
                Err(e) => warn!(namespace = ns, error = %e, "namespace check failed"),
            }
            if Instant::now() >= deadline {
                let waited_secs = started.elapsed().as_secs();
                warn!(namespace = ns, waited_secs, "namespace still present; stuck finalizers?");
                return DeleteOutcome::TimedOut { waited_secs };
            }
            tokio::time::sleep(self.cfg.delete_poll).await;
        }
    }
}
