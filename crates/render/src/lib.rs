//! ephem render: turn a manifest and an environment id into the ordered set of
//! cluster documents for that environment.
//!
//! Rendering is pure: no cluster access, no clock, no randomness. Identical
//! input yields byte-identical documents, which is what lets a repeated
//! `create` converge through server-side apply instead of drifting.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use ephem_core::{
    EnvironmentId, EnvironmentManifest, RenderedResource, ResourceKind, ServiceSpec, MAX_K8S_NAME_LENGTH,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Namespace, PodSpec, PodTemplateSpec, Service, ServicePort,
    ServiceSpec as ServiceBody,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule, IngressServiceBackend,
    IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::Serialize;
use serde_json::Value as Json;
use tracing::debug;

mod templates;

pub use templates::TemplateSet;

pub const MANAGED_BY: &str = "ephem";
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_ENVIRONMENT: &str = "ephem.dev/environment";
/// Selector label tying a Deployment's pods to its Service: `<envId>-<service>`.
pub const LABEL_INSTANCE: &str = "ephem.dev/instance";
pub const MIDDLEWARES_ANNOTATION: &str = "traefik.ingress.kubernetes.io/router.middlewares";
pub const MIDDLEWARE_SUFFIX: &str = "-strip";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("naming collision: {kind} '{name}' is derived from both service '{first}' and service '{second}'")]
    Collision { kind: ResourceKind, name: String, first: String, second: String },
    #[error("ingress path conflict: services '{first}' and '{second}' both route '{path}'")]
    PathConflict { path: String, first: String, second: String },
    #[error("derived {what} '{value}' exceeds {max} characters")]
    NameTooLong { what: &'static str, value: String, max: usize },
    #[error("template for {kind}: {message}")]
    Template { kind: ResourceKind, message: String },
    #[error("serializing {kind} '{name}': {message}")]
    Serialize { kind: ResourceKind, name: String, message: String },
}

/// Per-service values exposed to builders and templates.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceContext<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub port: u16,
    pub env: &'a BTreeMap<String, String>,
    pub selector: BTreeMap<String, String>,
    /// Full routed path, e.g. `/pr-42/api` (ingress-enabled services only).
    pub ingress_path: Option<String>,
    pub middleware: Option<String>,
    /// Middleware reference in the form the ingress controller expects.
    pub middleware_ref: Option<String>,
}

/// Everything a single document is rendered from.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateContext<'a> {
    pub namespace: &'a str,
    /// `/pr-<n>`: the prefix stripped before requests reach a backend.
    pub path_prefix: String,
    /// Name of the resource being rendered.
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub service: Option<ServiceContext<'a>>,
}

struct Planned<'a> {
    kind: ResourceKind,
    name: String,
    ctx: TemplateContext<'a>,
}

/// Renders environments, optionally overriding built-in documents with a
/// Handlebars template set.
#[derive(Debug, Default)]
pub struct Renderer {
    templates: Option<TemplateSet>,
}

impl Renderer {
    pub fn builtin() -> Self {
        Self { templates: None }
    }

    pub fn with_templates(templates: TemplateSet) -> Self {
        Self { templates: Some(templates) }
    }

    /// Load `<kind>.yaml.hbs` templates from `dir`; kinds without a file keep
    /// the built-in document.
    pub fn from_dir(dir: &Path) -> Result<Self, RenderError> {
        Ok(Self::with_templates(TemplateSet::load(dir)?))
    }

    pub fn render(
        &self,
        manifest: &EnvironmentManifest,
        env: &EnvironmentId,
    ) -> Result<Vec<RenderedResource>, RenderError> {
        let plan = plan(manifest, env)?;
        let mut out = Vec::with_capacity(plan.len());
        for p in plan {
            let document = match self.templates.as_ref().and_then(|t| t.render(p.kind, &p.ctx)) {
                Some(doc) => doc?,
                None => builtin_document(p.kind, &p.ctx)?,
            };
            out.push(RenderedResource {
                kind: p.kind,
                name: p.name,
                namespace: p.kind.namespaced().then(|| env.as_str().to_string()),
                document,
                service: p.ctx.service.as_ref().map(|s| s.name.to_string()),
            });
        }
        // Stable: manifest order is kept within a rank.
        out.sort_by_key(|r| r.rank());
        debug!(env = %env, resources = out.len(), "rendered environment");
        Ok(out)
    }
}

/// Render with the built-in documents only.
pub fn render(manifest: &EnvironmentManifest, env: &EnvironmentId) -> Result<Vec<RenderedResource>, RenderError> {
    Renderer::builtin().render(manifest, env)
}

/// External URL of an enabled-ingress service: `http://<host>/<envId><path>`.
pub fn external_url(host: &str, env: &EnvironmentId, svc: &ServiceSpec) -> Option<String> {
    svc.effective_path().map(|p| format!("http://{}{}{}", host, env.path_prefix(), p))
}

fn base_labels(env: &EnvironmentId) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
    labels.insert(LABEL_ENVIRONMENT.to_string(), env.as_str().to_string());
    labels
}

fn check_len(what: &'static str, value: &str) -> Result<(), RenderError> {
    if value.len() > MAX_K8S_NAME_LENGTH {
        return Err(RenderError::NameTooLong { what, value: value.to_string(), max: MAX_K8S_NAME_LENGTH });
    }
    Ok(())
}

fn plan<'a>(manifest: &'a EnvironmentManifest, env: &'a EnvironmentId) -> Result<Vec<Planned<'a>>, RenderError> {
    let ns = env.as_str();
    let prefix = env.path_prefix();
    let mut plan = vec![Planned {
        kind: ResourceKind::Namespace,
        name: ns.to_string(),
        ctx: TemplateContext {
            namespace: ns,
            path_prefix: prefix.clone(),
            name: ns.to_string(),
            labels: base_labels(env),
            service: None,
        },
    }];

    for svc in manifest.services() {
        let instance = format!("{}-{}", ns, svc.name);
        check_len("instance label", &instance)?;
        let mut selector = BTreeMap::new();
        selector.insert(LABEL_INSTANCE.to_string(), instance);
        let mut labels = base_labels(env);
        labels.insert(LABEL_NAME.to_string(), svc.name.clone());
        labels.extend(selector.clone());

        let ingress_path = svc.effective_path().map(|p| format!("{}{}", prefix, p));
        let middleware = ingress_path.as_ref().map(|_| format!("{}{}", svc.name, MIDDLEWARE_SUFFIX));
        let middleware_ref = middleware.as_ref().map(|m| format!("{}-{}@kubernetescrd", ns, m));
        let sctx = ServiceContext {
            name: &svc.name,
            image: &svc.image,
            port: svc.port,
            env: &svc.env,
            selector,
            ingress_path,
            middleware: middleware.clone(),
            middleware_ref,
        };

        let mut kinds = Vec::with_capacity(4);
        if let Some(mw) = &middleware {
            kinds.push((ResourceKind::Middleware, mw.clone()));
        }
        kinds.push((ResourceKind::Deployment, svc.name.clone()));
        kinds.push((ResourceKind::Service, svc.name.clone()));
        if middleware.is_some() {
            kinds.push((ResourceKind::Ingress, svc.name.clone()));
        }
        for (kind, name) in kinds {
            check_len("resource name", &name)?;
            plan.push(Planned {
                kind,
                ctx: TemplateContext {
                    namespace: ns,
                    path_prefix: prefix.clone(),
                    name: name.clone(),
                    labels: labels.clone(),
                    service: Some(sctx.clone()),
                },
                name,
            });
        }
    }

    let mut owners: HashMap<(ResourceKind, &str), &str> = HashMap::new();
    for p in &plan {
        let owner = p.ctx.service.as_ref().map(|s| s.name).unwrap_or(ns);
        if let Some(first) = owners.insert((p.kind, p.name.as_str()), owner) {
            return Err(RenderError::Collision {
                kind: p.kind,
                name: p.name.clone(),
                first: first.to_string(),
                second: owner.to_string(),
            });
        }
    }

    let mut routes: HashMap<&str, &str> = HashMap::new();
    for svc in plan.iter().filter(|p| p.kind == ResourceKind::Ingress).filter_map(|p| p.ctx.service.as_ref()) {
        let Some(path) = svc.ingress_path.as_deref() else { continue };
        if let Some(first) = routes.insert(path, svc.name) {
            return Err(RenderError::PathConflict {
                path: path.to_string(),
                first: first.to_string(),
                second: svc.name.to_string(),
            });
        }
    }
    Ok(plan)
}

fn meta(ctx: &TemplateContext<'_>, namespaced: bool) -> ObjectMeta {
    ObjectMeta {
        name: Some(ctx.name.clone()),
        namespace: namespaced.then(|| ctx.namespace.to_string()),
        labels: Some(ctx.labels.clone()),
        ..Default::default()
    }
}

fn to_json<T: Serialize>(kind: ResourceKind, name: &str, v: &T) -> Result<Json, RenderError> {
    serde_json::to_value(v).map_err(|e| RenderError::Serialize { kind, name: name.to_string(), message: e.to_string() })
}

fn missing_service(kind: ResourceKind) -> RenderError {
    RenderError::Template { kind, message: "no service context for a per-service resource".into() }
}

pub(crate) fn builtin_document(kind: ResourceKind, ctx: &TemplateContext<'_>) -> Result<Json, RenderError> {
    let service = || ctx.service.as_ref().ok_or_else(|| missing_service(kind));
    match kind {
        ResourceKind::Namespace => {
            let ns = Namespace { metadata: meta(ctx, false), ..Default::default() };
            to_json(kind, &ctx.name, &ns)
        }
        ResourceKind::Middleware => {
            let mut doc = serde_json::json!({
                "apiVersion": kind.api_version(),
                "kind": kind.as_str(),
                "metadata": { "name": ctx.name, "namespace": ctx.namespace },
                "spec": { "stripPrefix": { "prefixes": [ctx.path_prefix] } }
            });
            doc["metadata"]["labels"] = to_json(kind, &ctx.name, &ctx.labels)?;
            Ok(doc)
        }
        ResourceKind::Deployment => {
            let svc = service()?;
            let env: Vec<EnvVar> = svc
                .env
                .iter()
                .map(|(k, v)| EnvVar { name: k.clone(), value: Some(v.clone()), ..Default::default() })
                .collect();
            let container = Container {
                name: svc.name.to_string(),
                image: Some(svc.image.to_string()),
                ports: Some(vec![ContainerPort { container_port: i32::from(svc.port), ..Default::default() }]),
                env: (!env.is_empty()).then_some(env),
                ..Default::default()
            };
            let d = Deployment {
                metadata: meta(ctx, true),
                spec: Some(DeploymentSpec {
                    replicas: Some(1),
                    selector: LabelSelector { match_labels: Some(svc.selector.clone()), ..Default::default() },
                    template: PodTemplateSpec {
                        metadata: Some(ObjectMeta { labels: Some(ctx.labels.clone()), ..Default::default() }),
                        spec: Some(PodSpec { containers: vec![container], ..Default::default() }),
                    },
                    ..Default::default()
                }),
                ..Default::default()
            };
            to_json(kind, &ctx.name, &d)
        }
        ResourceKind::Service => {
            let svc = service()?;
            let s = Service {
                metadata: meta(ctx, true),
                spec: Some(ServiceBody {
                    type_: Some("ClusterIP".into()),
                    selector: Some(svc.selector.clone()),
                    ports: Some(vec![ServicePort {
                        name: Some("http".into()),
                        port: i32::from(svc.port),
                        target_port: Some(IntOrString::Int(i32::from(svc.port))),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            };
            to_json(kind, &ctx.name, &s)
        }
        ResourceKind::Ingress => {
            let svc = service()?;
            let path = svc.ingress_path.clone().ok_or_else(|| missing_service(kind))?;
            let mut m = meta(ctx, true);
            if let Some(r) = &svc.middleware_ref {
                let mut ann = BTreeMap::new();
                ann.insert(MIDDLEWARES_ANNOTATION.to_string(), r.clone());
                m.annotations = Some(ann);
            }
            let i = Ingress {
                metadata: m,
                spec: Some(IngressSpec {
                    rules: Some(vec![IngressRule {
                        host: None,
                        http: Some(HTTPIngressRuleValue {
                            paths: vec![HTTPIngressPath {
                                path: Some(path),
                                path_type: "Prefix".into(),
                                backend: IngressBackend {
                                    service: Some(IngressServiceBackend {
                                        name: svc.name.to_string(),
                                        port: Some(ServiceBackendPort {
                                            number: Some(i32::from(svc.port)),
                                            ..Default::default()
                                        }),
                                    }),
                                    ..Default::default()
                                },
                            }],
                        }),
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            };
            to_json(kind, &ctx.name, &i)
        }
    }
}
