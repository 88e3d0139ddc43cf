//! In-process [`Cluster`] used by tests across the workspace.
//!
//! Behaves like a minimal API server: namespaced objects need their namespace
//! to exist, upserts replace by key, and deleting a namespace removes
//! everything inside it. Failures are injected per kind + name.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use ephem_core::{RenderedResource, ResourceKind, ResourceRef};
use serde_json::Value as Json;

use crate::{delete_status, Cluster, ClusterError, DeleteStatus};

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceRef, Json>,
    failing: BTreeSet<(ResourceKind, String)>,
    /// Deployment name -> readiness polls left before it reports ready.
    /// `u32::MAX` never becomes ready.
    ready_after: HashMap<String, u32>,
    stuck_namespaces: BTreeSet<String>,
    /// Namespace -> existence checks left before a terminating namespace is gone.
    terminating: HashMap<String, u32>,
    latency: Option<Duration>,
    calls: usize,
    upserts: usize,
}

#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Every upsert of `kind`/`name` (in any namespace) fails with a 500.
    pub fn fail_upsert(&self, kind: ResourceKind, name: &str) {
        self.lock().failing.insert((kind, name.to_string()));
    }

    pub fn never_ready(&self, deployment: &str) {
        self.lock().ready_after.insert(deployment.to_string(), u32::MAX);
    }

    /// Report zero ready replicas for the first `polls` readiness checks.
    pub fn ready_after(&self, deployment: &str, polls: u32) {
        self.lock().ready_after.insert(deployment.to_string(), polls);
    }

    /// Deletion of this namespace is accepted but the namespace never goes away.
    pub fn stick_namespace(&self, name: &str) {
        self.lock().stuck_namespaces.insert(name.to_string());
    }

    /// Delay applied before every call.
    /// Put an existing namespace into Terminating, as if an earlier delete
    /// was accepted. Its children go at once; the namespace itself disappears
    /// after `polls` existence checks. Further deletes answer 409.
    pub fn begin_termination(&self, name: &str, polls: u32) {
        let mut st = self.lock();
        st.objects.retain(|r, _| r.namespace.as_deref() != Some(name));
        st.terminating.insert(name.to_string(), polls);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    /// Seed an object directly, bypassing upsert bookkeeping.
    pub fn insert(&self, resource: &RenderedResource) {
        self.lock().objects.insert(resource.reference(), resource.document.clone());
    }

    pub fn get(&self, r: &ResourceRef) -> Option<Json> {
        self.lock().objects.get(r).cloned()
    }

    pub fn contains(&self, r: &ResourceRef) -> bool {
        self.lock().objects.contains_key(r)
    }

    pub fn snapshot(&self) -> BTreeMap<ResourceRef, Json> {
        self.lock().objects.clone()
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Total number of cluster calls of any kind.
    pub fn calls(&self) -> usize {
        self.lock().calls
    }

    pub fn upserts(&self) -> usize {
        self.lock().upserts
    }

    async fn enter(&self) {
        let latency = {
            let mut st = self.lock();
            st.calls += 1;
            st.latency
        };
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
    }
}

fn namespace_ref(name: &str) -> ResourceRef {
    ResourceRef::new(ResourceKind::Namespace, None, name)
}

#[async_trait]
impl Cluster for MemoryCluster {
    async fn upsert(&self, resource: &RenderedResource) -> Result<(), ClusterError> {
        self.enter().await;
        let mut st = self.lock();
        st.upserts += 1;
        if st.failing.contains(&(resource.kind, resource.name.clone())) {
            return Err(ClusterError::Api {
                code: 500,
                reason: "InternalError".into(),
                message: format!("injected failure for {}", resource.reference()),
            });
        }
        if let Some(ns) = resource.namespace.as_deref().filter(|_| resource.kind.namespaced()) {
            if !st.objects.contains_key(&namespace_ref(ns)) {
                return Err(ClusterError::not_found(format!("namespaces \"{}\" not found", ns)));
            }
        }
        st.objects.insert(resource.reference(), resource.document.clone());
        Ok(())
    }

    async fn ready_replicas(&self, namespace: &str, deployment: &str) -> Result<i32, ClusterError> {
        self.enter().await;
        let mut st = self.lock();
        let key = ResourceRef::new(ResourceKind::Deployment, Some(namespace), deployment);
        if !st.objects.contains_key(&key) {
            return Ok(0);
        }
        match st.ready_after.get_mut(deployment) {
            Some(left) if *left == u32::MAX => Ok(0),
            Some(left) if *left > 0 => {
                *left -= 1;
                Ok(0)
            }
            _ => Ok(1),
        }
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, ClusterError> {
        self.enter().await;
        let mut st = self.lock();
        if let Some(left) = st.terminating.get_mut(name) {
            if *left == 0 {
                st.terminating.remove(name);
                st.objects.remove(&namespace_ref(name));
            } else {
                *left -= 1;
            }
        }
        Ok(st.objects.contains_key(&namespace_ref(name)))
    }

    async fn delete_namespace(&self, name: &str) -> Result<DeleteStatus, ClusterError> {
        self.enter().await;
        let mut st = self.lock();
        if !st.objects.contains_key(&namespace_ref(name)) {
            return delete_status(Err(ClusterError::not_found(format!("namespaces \"{}\" not found", name))));
        }
        if st.terminating.contains_key(name) {
            return delete_status(Err(ClusterError::Api {
                code: 409,
                reason: "Conflict".into(),
                message: format!("namespace {} is terminating", name),
            }));
        }
        st.objects.retain(|r, _| r.namespace.as_deref() != Some(name));
        if !st.stuck_namespaces.contains(name) {
            st.objects.remove(&namespace_ref(name));
        }
        Ok(DeleteStatus::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn res(kind: ResourceKind, ns: Option<&str>, name: &str) -> RenderedResource {
        RenderedResource {
            kind,
            name: name.into(),
            namespace: ns.map(str::to_string),
            document: json!({"kind": kind.as_str(), "metadata": {"name": name}}),
            service: None,
        }
    }

    #[tokio::test]
    async fn namespaced_objects_need_their_namespace() {
        let c = MemoryCluster::new();
        let err = c.upsert(&res(ResourceKind::Deployment, Some("pr-1"), "web")).await.unwrap_err();
        assert!(err.is_not_found());

        c.upsert(&res(ResourceKind::Namespace, None, "pr-1")).await.unwrap();
        c.upsert(&res(ResourceKind::Deployment, Some("pr-1"), "web")).await.unwrap();
        c.upsert(&res(ResourceKind::Deployment, Some("pr-1"), "web")).await.unwrap();
        assert_eq!(c.object_count(), 2);
        assert_eq!(c.upserts(), 4);
    }

    #[tokio::test]
    async fn namespace_delete_cascades_and_reports_not_found_afterwards() {
        let c = MemoryCluster::new();
        c.upsert(&res(ResourceKind::Namespace, None, "pr-2")).await.unwrap();
        c.upsert(&res(ResourceKind::Service, Some("pr-2"), "api")).await.unwrap();
        c.upsert(&res(ResourceKind::Namespace, None, "pr-3")).await.unwrap();

        assert_eq!(c.delete_namespace("pr-2").await.unwrap(), DeleteStatus::Accepted);
        assert!(!c.namespace_exists("pr-2").await.unwrap());
        assert!(c.namespace_exists("pr-3").await.unwrap());
        assert_eq!(c.object_count(), 1);
        assert_eq!(c.delete_namespace("pr-2").await.unwrap(), DeleteStatus::NotFound);
    }

    #[tokio::test]
    async fn stuck_namespace_survives_delete() {
        let c = MemoryCluster::new();
        c.upsert(&res(ResourceKind::Namespace, None, "pr-4")).await.unwrap();
        c.stick_namespace("pr-4");
        assert_eq!(c.delete_namespace("pr-4").await.unwrap(), DeleteStatus::Accepted);
        assert!(c.namespace_exists("pr-4").await.unwrap());
    }

    #[tokio::test]
    async fn terminating_namespace_accepts_repeat_deletes() {
        let c = MemoryCluster::new();
        c.upsert(&res(ResourceKind::Namespace, None, "pr-8")).await.unwrap();
        c.upsert(&res(ResourceKind::Service, Some("pr-8"), "api")).await.unwrap();
        c.begin_termination("pr-8", 1);

        assert_eq!(c.object_count(), 1);
        assert_eq!(c.delete_namespace("pr-8").await.unwrap(), DeleteStatus::Accepted);
        assert!(c.namespace_exists("pr-8").await.unwrap());
        assert!(!c.namespace_exists("pr-8").await.unwrap());
        assert_eq!(c.delete_namespace("pr-8").await.unwrap(), DeleteStatus::NotFound);
    }

    #[tokio::test]
    async fn readiness_injection() {
        let c = MemoryCluster::new();
        c.upsert(&res(ResourceKind::Namespace, None, "pr-5")).await.unwrap();
        c.upsert(&res(ResourceKind::Deployment, Some("pr-5"), "slow")).await.unwrap();
        c.upsert(&res(ResourceKind::Deployment, Some("pr-5"), "dead")).await.unwrap();
        c.ready_after("slow", 2);
        c.never_ready("dead");

        assert_eq!(c.ready_replicas("pr-5", "slow").await.unwrap(), 0);
        assert_eq!(c.ready_replicas("pr-5", "slow").await.unwrap(), 0);
        assert_eq!(c.ready_replicas("pr-5", "slow").await.unwrap(), 1);
        assert_eq!(c.ready_replicas("pr-5", "dead").await.unwrap(), 0);
        assert_eq!(c.ready_replicas("pr-5", "missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn injected_upsert_failure() {
        let c = MemoryCluster::new();
        c.upsert(&res(ResourceKind::Namespace, None, "pr-6")).await.unwrap();
        c.fail_upsert(ResourceKind::Service, "api");
        let err = c.upsert(&res(ResourceKind::Service, Some("pr-6"), "api")).await.unwrap_err();
        assert!(matches!(err, ClusterError::Api { code: 500, .. }));
        assert!(!c.contains(&ResourceRef::new(ResourceKind::Service, Some("pr-6"), "api")));
    }
}
