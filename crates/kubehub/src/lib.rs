//! ephem kubehub: the cluster boundary.
//!
//! [`Cluster`] is the narrow capability the applier needs (upsert, readiness,
//! namespace existence/deletion). [`KubeCluster`] implements it with kube-rs
//! server-side apply; [`MemoryCluster`] is an in-process stand-in for tests.

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ephem_core::{RenderedResource, ResourceKind};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client, Config,
};
use tracing::{debug, info};

pub mod memory;

pub use memory::MemoryCluster;

/// Field manager recorded on every server-side apply.
pub const FIELD_MANAGER: &str = "ephem";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    #[error("api error {code} ({reason}): {message}")]
    Api { code: u16, reason: String, message: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("client: {0}")]
    Client(String),
}

impl ClusterError {
    pub fn not_found(message: impl Into<String>) -> Self {
        ClusterError::Api { code: 404, reason: "NotFound".into(), message: message.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::Api { code: 404, .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Api { code: 409, .. })
    }
}

impl From<kube::Error> for ClusterError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) => ClusterError::Api { code: ae.code, reason: ae.reason, message: ae.message },
            other => ClusterError::Client(other.to_string()),
        }
    }
}

/// Result of asking the cluster to delete a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStatus {
    /// Deletion accepted; children are collected asynchronously.
    Accepted,
    /// Nothing to delete.
    NotFound,
}

/// Classify the API server's answer to a namespace DELETE. A namespace that
/// is already terminating answers 409; its removal is under way, same as a
/// fresh accept.
pub fn delete_status(res: Result<(), ClusterError>) -> Result<DeleteStatus, ClusterError> {
    match res {
        Ok(()) => Ok(DeleteStatus::Accepted),
        Err(e) if e.is_not_found() => Ok(DeleteStatus::NotFound),
        Err(e) if e.is_conflict() => {
            debug!(error = %e, "namespace already terminating");
            Ok(DeleteStatus::Accepted)
        }
        Err(e) => Err(e),
    }
}

/// Cluster operations the applier depends on.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Create-or-update keyed by kind + namespace + name.
    async fn upsert(&self, resource: &RenderedResource) -> Result<(), ClusterError>;

    /// Ready replicas reported by a Deployment's status (0 if absent).
    async fn ready_replicas(&self, namespace: &str, deployment: &str) -> Result<i32, ClusterError>;

    async fn namespace_exists(&self, name: &str) -> Result<bool, ClusterError>;

    async fn delete_namespace(&self, name: &str) -> Result<DeleteStatus, ClusterError>;
}

/// Build a kube client from the ambient kubeconfig / in-cluster config, with
/// transport-level timeouts applied to every request.
pub async fn get_kube_client(request_timeout: Duration) -> Result<Client> {
    let mut config = Config::infer().await.context("inferring kube config")?;
    config.connect_timeout = Some(request_timeout);
    config.read_timeout = Some(request_timeout);
    config.write_timeout = Some(request_timeout);
    info!(cluster = %config.cluster_url, "kube client configured");
    Client::try_from(config).context("building kube client")
}

pub fn api_resource(kind: ResourceKind) -> ApiResource {
    let gvk = GroupVersionKind::gvk(kind.group(), kind.version(), kind.as_str());
    ApiResource::from_gvk_with_plural(&gvk, kind.plural())
}

/// kube-rs backed [`Cluster`].
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn connect(request_timeout: Duration) -> Result<Self> {
        Ok(Self::new(get_kube_client(request_timeout).await?))
    }

    fn dynamic_api(&self, kind: ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(kind);
        match namespace {
            Some(ns) if kind.namespaced() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn upsert(&self, resource: &RenderedResource) -> Result<(), ClusterError> {
        let api = self.dynamic_api(resource.kind, resource.namespace.as_deref());
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        let obj = api.patch(&resource.name, &pp, &Patch::Apply(&resource.document)).await?;
        debug!(
            resource = %resource.reference(),
            rv = ?obj.metadata.resource_version,
            "server-side apply ok"
        );
        Ok(())
    }

    async fn ready_replicas(&self, namespace: &str, deployment: &str) -> Result<i32, ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let ready = api
            .get_opt(deployment)
            .await?
            .and_then(|d| d.status)
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        Ok(ready)
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn delete_namespace(&self, name: &str) -> Result<DeleteStatus, ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        delete_status(api.delete(name, &DeleteParams::default()).await.map(|_| ()).map_err(ClusterError::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_resources_use_static_plurals() {
        let ar = api_resource(ResourceKind::Ingress);
        assert_eq!(ar.group, "networking.k8s.io");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.api_version, "networking.k8s.io/v1");
        assert_eq!(ar.plural, "ingresses");

        let core = api_resource(ResourceKind::Namespace);
        assert_eq!(core.group, "");
        assert_eq!(core.api_version, "v1");

        let mw = api_resource(ResourceKind::Middleware);
        assert_eq!(mw.api_version, "traefik.io/v1alpha1");
        assert_eq!(mw.plural, "middlewares");
    }

    #[test]
    fn not_found_classification() {
        assert!(ClusterError::not_found("x").is_not_found());
        assert!(!ClusterError::Timeout(Duration::from_secs(1)).is_not_found());
        let conflict = ClusterError::Api { code: 409, reason: "Conflict".into(), message: "x".into() };
        assert!(!conflict.is_not_found());
        assert!(conflict.is_conflict());
    }

    #[test]
    fn terminating_namespace_delete_counts_as_accepted() {
        let conflict = ClusterError::Api {
            code: 409,
            reason: "Conflict".into(),
            message: "The system is ensuring all content is removed from this namespace".into(),
        };
        assert_eq!(delete_status(Err(conflict)), Ok(DeleteStatus::Accepted));
        assert_eq!(delete_status(Err(ClusterError::not_found("pr-1"))), Ok(DeleteStatus::NotFound));
        assert_eq!(delete_status(Ok(())), Ok(DeleteStatus::Accepted));
        let forbidden = ClusterError::Api { code: 403, reason: "Forbidden".into(), message: "no".into() };
        assert_eq!(delete_status(Err(forbidden.clone())), Err(forbidden));
    }
}
