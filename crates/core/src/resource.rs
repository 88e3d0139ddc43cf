//! Rendered cluster resources and the fixed apply order between kinds.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Resource kinds an environment is made of, in apply order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Namespace,
    Middleware,
    Deployment,
    Service,
    Ingress,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Namespace,
        ResourceKind::Middleware,
        ResourceKind::Deployment,
        ResourceKind::Service,
        ResourceKind::Ingress,
    ];

    /// Dependency rank: a resource is applied only after every resource of a
    /// lower rank has been applied.
    pub fn rank(self) -> u8 {
        match self {
            ResourceKind::Namespace => 0,
            ResourceKind::Middleware => 1,
            ResourceKind::Deployment => 2,
            ResourceKind::Service => 3,
            ResourceKind::Ingress => 4,
        }
    }

    pub fn group(self) -> &'static str {
        match self {
            ResourceKind::Namespace | ResourceKind::Service => "",
            ResourceKind::Deployment => "apps",
            ResourceKind::Ingress => "networking.k8s.io",
            ResourceKind::Middleware => "traefik.io",
        }
    }

    pub fn version(self) -> &'static str {
        match self {
            ResourceKind::Middleware => "v1alpha1",
            _ => "v1",
        }
    }

    pub fn api_version(self) -> String {
        match self.group() {
            "" => self.version().to_string(),
            g => format!("{}/{}", g, self.version()),
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            ResourceKind::Namespace => "namespaces",
            ResourceKind::Middleware => "middlewares",
            ResourceKind::Deployment => "deployments",
            ResourceKind::Service => "services",
            ResourceKind::Ingress => "ingresses",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Namespace => "Namespace",
            ResourceKind::Middleware => "Middleware",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::Service => "Service",
            ResourceKind::Ingress => "Ingress",
        }
    }

    pub fn namespaced(self) -> bool {
        !matches!(self, ResourceKind::Namespace)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of a resource: kind + namespace + name. This is also the upsert key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    /// `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { kind, namespace: namespace.map(str::to_string), name: name.into() }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// One fully rendered document ready for server-side apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedResource {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: Option<String>,
    pub document: Json,
    /// Name of the declared service this resource belongs to (`None` for the Namespace).
    pub service: Option<String>,
}

impl RenderedResource {
    pub fn rank(&self) -> u8 {
        self.kind.rank()
    }

    pub fn reference(&self) -> ResourceRef {
        ResourceRef { kind: self.kind, namespace: self.namespace.clone(), name: self.name.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_follow_dependency_order() {
        let ranks: Vec<u8> = ResourceKind::ALL.iter().map(|k| k.rank()).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3, 4]);
        let mut sorted = ResourceKind::ALL.to_vec();
        sorted.reverse();
        sorted.sort();
        assert_eq!(sorted, ResourceKind::ALL.to_vec());
    }

    #[test]
    fn api_versions_cover_core_and_grouped_kinds() {
        assert_eq!(ResourceKind::Namespace.api_version(), "v1");
        assert_eq!(ResourceKind::Deployment.api_version(), "apps/v1");
        assert_eq!(ResourceKind::Ingress.api_version(), "networking.k8s.io/v1");
        assert_eq!(ResourceKind::Middleware.api_version(), "traefik.io/v1alpha1");
        assert!(!ResourceKind::Namespace.namespaced());
        assert!(ResourceKind::Service.namespaced());
    }

    #[test]
    fn resource_ref_display() {
        assert_eq!(ResourceRef::new(ResourceKind::Namespace, None, "pr-1").to_string(), "Namespace/pr-1");
        assert_eq!(
            ResourceRef::new(ResourceKind::Deployment, Some("pr-1"), "web").to_string(),
            "Deployment/pr-1/web"
        );
    }
}
