//! Manifest model: the validated, immutable service list an environment is
//! built from.
//!
//! Raw configuration arrives as untyped YAML. [`validate`] checks it in one
//! pass and reports every violation it finds, so a caller sees all the fixes
//! needed at once instead of one per run.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as Yaml;

use crate::MAX_K8S_NAME_LENGTH;

pub const DEFAULT_INGRESS_PATH: &str = "/";
pub const MAX_IMAGE_LENGTH: usize = 255;

static DNS_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex is valid"));

/// True when `s` is a lowercase RFC 1123 label of at most 63 characters.
pub fn is_dns_label(s: &str) -> bool {
    !s.is_empty() && s.len() <= MAX_K8S_NAME_LENGTH && DNS_LABEL.is_match(s)
}

fn default_path() -> String {
    DEFAULT_INGRESS_PATH.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_path")]
    pub path: String,
}

impl Default for IngressSpec {
    fn default() -> Self {
        Self { enabled: false, path: default_path() }
    }
}

/// One declared service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressSpec>,
    /// Sorted so rendered documents are byte-stable.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>, port: u16) -> Self {
        Self { name: name.into(), image: image.into(), port, ingress: None, env: BTreeMap::new() }
    }

    pub fn with_ingress(mut self, path: impl Into<String>) -> Self {
        self.ingress = Some(IngressSpec { enabled: true, path: path.into() });
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn ingress_enabled(&self) -> bool {
        self.ingress.as_ref().map(|i| i.enabled).unwrap_or(false)
    }

    /// Service-relative path routed by the ingress, if ingress is enabled.
    pub fn effective_path(&self) -> Option<&str> {
        match &self.ingress {
            Some(i) if i.enabled => Some(i.path.as_str()),
            _ => None,
        }
    }

    /// In-cluster URL other services in the same namespace use.
    pub fn internal_url(&self) -> String {
        format!("http://{}:{}", self.name, self.port)
    }

    /// `kubectl port-forward` line for reaching the service from a workstation.
    pub fn port_forward_hint(&self, namespace: &str, local_offset: u16) -> String {
        let local = self.port.checked_add(local_offset).unwrap_or(self.port);
        format!("kubectl port-forward -n {} svc/{} {}:{}", namespace, self.name, local, self.port)
    }
}

/// A single problem found while validating, addressed by a dotted path
/// such as `services[1].port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

impl Violation {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self { path: path.into(), message: message.into() }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("invalid manifest ({} problem(s)): {}", .violations.len(), join(.violations))]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

fn join(v: &[Violation]) -> String {
    v.iter().map(|x| x.to_string()).collect::<Vec<_>>().join("; ")
}

impl ValidationError {
    pub fn single(path: &str, message: &str) -> Self {
        Self { violations: vec![Violation::new(path, message)] }
    }
}

/// Ordered service list with unique names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentManifest {
    services: Vec<ServiceSpec>,
}

impl EnvironmentManifest {
    /// Wrap services without checking them. Call [`EnvironmentManifest::check`]
    /// (or build through [`validate`]) before handing the manifest to a cluster.
    pub fn new(services: Vec<ServiceSpec>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &[ServiceSpec] {
        &self.services
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn ingress_services(&self) -> impl Iterator<Item = &ServiceSpec> {
        self.services.iter().filter(|s| s.ingress_enabled())
    }

    /// Run the per-service rules over an already typed manifest. Name
    /// collisions are left to the renderer, which sees every derived name.
    pub fn check(&self) -> Result<(), ValidationError> {
        let mut out = Vec::new();
        if self.services.is_empty() {
            out.push(Violation::new("services", "services list is empty"));
        }
        check_services(self.services.iter().enumerate(), &mut out);
        if out.is_empty() { Ok(()) } else { Err(ValidationError { violations: out }) }
    }
}

fn check_services<'a>(items: impl Iterator<Item = (usize, &'a ServiceSpec)>, out: &mut Vec<Violation>) {
    for (idx, svc) in items {
        check_fields(idx, Some(svc.name.as_str()), Some(svc.image.as_str()), Some(svc.port), svc.ingress.as_ref(), &svc.env, out);
    }
}

/// Semantic rules for one service. Fields that failed to parse are `None`
/// and skipped; their shape problem is already recorded.
fn check_fields(
    idx: usize,
    name: Option<&str>,
    image: Option<&str>,
    port: Option<u16>,
    ingress: Option<&IngressSpec>,
    env: &BTreeMap<String, String>,
    out: &mut Vec<Violation>,
) {
    let at = |field: &str| format!("services[{}].{}", idx, field);

    if let Some(name) = name {
        if name.is_empty() {
            out.push(Violation::new(at("name"), "name cannot be empty"));
        } else if name.len() > MAX_K8S_NAME_LENGTH {
            out.push(Violation::new(
                at("name"),
                format!("name too long (max {} chars, got {})", MAX_K8S_NAME_LENGTH, name.len()),
            ));
        } else if !is_dns_label(name) {
            out.push(Violation::new(
                at("name"),
                format!(
                    "invalid name '{}': lowercase letters, digits and hyphens only, starting and ending alphanumeric",
                    name
                ),
            ));
        }
    }

    if let Some(msg) = image.and_then(image_problem) {
        out.push(Violation::new(at("image"), msg));
    }

    if port == Some(0) {
        out.push(Violation::new(at("port"), "port must be between 1 and 65535, got 0"));
    }

    if let Some(ing) = ingress {
        if ing.enabled && !ing.path.starts_with('/') {
            out.push(Violation::new(
                at("ingress.path"),
                format!("ingress path must start with '/', got '{}'", ing.path),
            ));
        }
    }

    for key in env.keys() {
        if key.is_empty() || key.contains('=') {
            out.push(Violation::new(at("env"), format!("invalid environment variable name '{}'", key)));
        }
    }
}

fn check_duplicates<'a>(names: impl Iterator<Item = (usize, &'a str)>, out: &mut Vec<Violation>) {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for (idx, name) in names.filter(|(_, n)| !n.is_empty()) {
        if let Some(first) = seen.insert(name, idx) {
            out.push(Violation::new(
                format!("services[{}].name", idx),
                format!("duplicate service name '{}' (first declared at services[{}])", name, first),
            ));
        }
    }
}

fn image_problem(image: &str) -> Option<String> {
    if image.is_empty() {
        return Some("image cannot be empty".into());
    }
    if image.chars().any(char::is_whitespace) {
        return Some(format!("image '{}' must not contain whitespace", image));
    }
    if image.len() > MAX_IMAGE_LENGTH {
        return Some(format!("image reference too long (max {} chars, got {})", MAX_IMAGE_LENGTH, image.len()));
    }
    if image.contains('@') {
        return None;
    }
    // A registry port (`host:5000/app`) lives before the last '/', so only
    // the final path segment can carry the tag.
    let last = image.rsplit('/').next().unwrap_or(image);
    match last.split_once(':') {
        Some((repo, tag)) if !repo.is_empty() && !tag.is_empty() => None,
        _ => Some(format!("image '{}' must include a tag (e.g. 'nginx:1.27') or digest", image)),
    }
}

/// Validate raw YAML configuration into an [`EnvironmentManifest`].
pub fn validate(raw: &Yaml) -> Result<EnvironmentManifest, ValidationError> {
    let root = match raw.as_mapping() {
        Some(m) => m,
        None if raw.is_null() => return Err(ValidationError::single("$", "manifest is empty")),
        None => return Err(ValidationError::single("$", "manifest must be a mapping with a 'services' list")),
    };
    let items = match root.get("services") {
        None => return Err(ValidationError::single("services", "missing required field 'services'")),
        Some(Yaml::Sequence(seq)) => seq,
        Some(_) => return Err(ValidationError::single("services", "'services' must be a list")),
    };
    if items.is_empty() {
        return Err(ValidationError::single("services", "services list is empty"));
    }

    let mut out = Vec::new();
    let mut parsed = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        if let Some(p) = parse_service(idx, item, &mut out) {
            check_fields(idx, p.name.as_deref(), p.image.as_deref(), p.port, p.ingress.as_ref(), &p.env, &mut out);
            parsed.push((idx, p));
        }
    }
    check_duplicates(parsed.iter().filter_map(|(i, p)| p.name.as_deref().map(|n| (*i, n))), &mut out);

    if out.is_empty() {
        Ok(EnvironmentManifest { services: parsed.into_iter().filter_map(|(_, p)| p.into_spec()).collect() })
    } else {
        Err(ValidationError { violations: out })
    }
}

/// One raw service entry with whatever fields parsed.
struct ParsedService {
    name: Option<String>,
    image: Option<String>,
    port: Option<u16>,
    ingress: Option<IngressSpec>,
    env: BTreeMap<String, String>,
    /// No shape problem was found in this entry.
    clean: bool,
}

impl ParsedService {
    fn into_spec(self) -> Option<ServiceSpec> {
        if !self.clean {
            return None;
        }
        Some(ServiceSpec { name: self.name?, image: self.image?, port: self.port?, ingress: self.ingress, env: self.env })
    }
}

/// Shape/type checks for one raw service entry. Semantic rules run on the
/// fields that parsed, so each problem is reported exactly once.
fn parse_service(idx: usize, raw: &Yaml, out: &mut Vec<Violation>) -> Option<ParsedService> {
    let at = |field: &str| format!("services[{}].{}", idx, field);
    let Some(map) = raw.as_mapping() else {
        out.push(Violation::new(format!("services[{}]", idx), "service must be a mapping"));
        return None;
    };
    let before = out.len();

    let name = match map.get("name") {
        Some(Yaml::String(s)) => Some(s.clone()),
        Some(_) => { out.push(Violation::new(at("name"), "name must be a string")); None }
        None => { out.push(Violation::new(at("name"), "missing required field 'name'")); None }
    };
    let image = match map.get("image") {
        Some(Yaml::String(s)) => Some(s.clone()),
        Some(_) => { out.push(Violation::new(at("image"), "image must be a string")); None }
        None => { out.push(Violation::new(at("image"), "missing required field 'image'")); None }
    };
    let port = match map.get("port") {
        Some(Yaml::Number(n)) => match n.as_i64() {
            Some(p) if (1..=65535).contains(&p) => Some(p as u16),
            _ => { out.push(Violation::new(at("port"), format!("port must be between 1 and 65535, got {}", n))); None }
        },
        Some(_) => { out.push(Violation::new(at("port"), "port must be an integer")); None }
        None => { out.push(Violation::new(at("port"), "missing required field 'port'")); None }
    };

    let ingress = match map.get("ingress") {
        None | Some(Yaml::Null) => None,
        Some(Yaml::Mapping(m)) => {
            let enabled = match m.get("enabled") {
                None | Some(Yaml::Null) => false,
                Some(Yaml::Bool(b)) => *b,
                Some(_) => { out.push(Violation::new(at("ingress.enabled"), "ingress.enabled must be a boolean")); false }
            };
            let path = match m.get("path") {
                None | Some(Yaml::Null) => default_path(),
                Some(Yaml::String(s)) => s.clone(),
                Some(_) => { out.push(Violation::new(at("ingress.path"), "ingress.path must be a string")); default_path() }
            };
            Some(IngressSpec { enabled, path })
        }
        Some(_) => { out.push(Violation::new(at("ingress"), "ingress must be a mapping")); None }
    };

    let mut env = BTreeMap::new();
    match map.get("env") {
        None | Some(Yaml::Null) => {}
        Some(Yaml::Mapping(m)) => {
            for (k, v) in m {
                let Some(key) = k.as_str() else {
                    out.push(Violation::new(at("env"), "environment variable names must be strings"));
                    continue;
                };
                match v {
                    Yaml::String(s) => { env.insert(key.to_string(), s.clone()); }
                    Yaml::Mapping(_) | Yaml::Sequence(_) => out.push(Violation::new(
                        format!("{}.{}", at("env"), key),
                        "value must be a string, not a nested structure",
                    )),
                    _ => out.push(Violation::new(
                        format!("{}.{}", at("env"), key),
                        "value must be a string (quote numbers and booleans)",
                    )),
                }
            }
        }
        Some(_) => out.push(Violation::new(at("env"), "env must be a mapping of string to string")),
    }

    Some(ParsedService { name, image, port, ingress, env, clean: out.len() == before })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Yaml {
        serde_yaml::from_str(s).expect("test yaml parses")
    }

    #[test]
    fn validates_minimal_manifest_with_defaults() {
        let m = validate(&yaml(
            "services:\n  - name: web\n    image: x:1\n    port: 80\n    ingress:\n      enabled: true\n",
        ))
        .expect("valid");
        let web = &m.services()[0];
        assert_eq!(web.name, "web");
        assert_eq!(web.port, 80);
        assert_eq!(web.effective_path(), Some("/"));
        assert!(web.env.is_empty());
    }

    #[test]
    fn reports_every_violation_in_one_pass() {
        let raw = yaml(
            r#"
services:
  - name: Web_1
    image: nginx
    port: 70000
  - name: api
    image: api:1
    port: 8080
    ingress: { enabled: true, path: "api" }
    env:
      NESTED: { a: 1 }
      COUNT: 3
  - name: api
    image: api:2
    port: 8081
"#,
        );
        let err = validate(&raw).unwrap_err();
        let paths: Vec<_> = err.violations.iter().map(|v| v.path.as_str()).collect();
        assert!(paths.contains(&"services[0].port"), "{:?}", paths);
        assert!(paths.contains(&"services[1].env.NESTED"), "{:?}", paths);
        assert!(paths.contains(&"services[1].env.COUNT"), "{:?}", paths);
        // shape errors do not hide the other rules for the same entry
        assert!(paths.contains(&"services[0].name"), "{:?}", paths);
        assert!(paths.contains(&"services[0].image"), "{:?}", paths);
        assert!(paths.contains(&"services[2].name"), "{:?}", paths);
        assert!(err.to_string().contains("problem(s)"));
    }

    #[test]
    fn bad_port_still_reports_name_and_image() {
        let err = validate(&yaml("services:\n  - name: Bad_Name\n    image: nginx\n    port: 70000\n")).unwrap_err();
        let paths: Vec<_> = err.violations.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(paths, vec!["services[0].port", "services[0].name", "services[0].image"]);
    }

    #[test]
    fn duplicates_are_found_across_malformed_entries() {
        let err = validate(&yaml(
            "services:\n  - name: web\n    image: x:1\n  - name: web\n    image: x:2\n    port: 81\n",
        ))
        .unwrap_err();
        let paths: Vec<_> = err.violations.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(paths, vec!["services[0].port", "services[1].name"]);
        assert!(err.violations[1].message.contains("first declared at services[0]"));
    }

    #[test]
    fn semantic_rules_collect_names_images_and_paths() {
        let raw = yaml(
            r#"
services:
  - name: Web_1
    image: nginx
    port: 80
  - name: api
    image: api:1
    port: 8080
    ingress: { enabled: true, path: "api" }
  - name: api
    image: "registry.local:5000/api"
    port: 8081
"#,
        );
        let err = validate(&raw).unwrap_err();
        let paths: Vec<_> = err.violations.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "services[0].name",
                "services[0].image",
                "services[1].ingress.path",
                "services[2].image",
                "services[2].name",
            ]
        );
        assert!(err.violations[4].message.contains("duplicate"));
    }

    #[test]
    fn rejects_non_manifest_shapes() {
        assert!(validate(&Yaml::Null).unwrap_err().to_string().contains("empty"));
        assert!(validate(&yaml("- a\n- b\n")).is_err());
        assert!(validate(&yaml("other: 1\n")).unwrap_err().to_string().contains("'services'"));
        assert!(validate(&yaml("services: []\n")).unwrap_err().to_string().contains("empty"));
        assert!(validate(&yaml("services: web\n")).unwrap_err().to_string().contains("list"));
    }

    #[test]
    fn disabled_ingress_path_is_not_checked() {
        let m = validate(&yaml(
            "services:\n  - name: worker\n    image: w:1\n    port: 9000\n    ingress: { enabled: false, path: nope }\n",
        ))
        .expect("valid");
        assert!(!m.services()[0].ingress_enabled());
        assert_eq!(m.ingress_services().count(), 0);
    }

    #[test]
    fn image_rules_accept_tags_and_digests() {
        assert!(image_problem("nginx:latest").is_none());
        assert!(image_problem("gcr.io/project/app:v1.2").is_none());
        assert!(image_problem("registry.local:5000/team/app:1").is_none());
        assert!(image_problem("app@sha256:abcdef").is_none());
        assert!(image_problem("nginx").is_some());
        assert!(image_problem("registry.local:5000/team/app").is_some());
        assert!(image_problem("app: 1").is_some());
        assert!(image_problem("").is_some());
    }

    #[test]
    fn typed_check_leaves_name_collisions_to_the_renderer() {
        let m = EnvironmentManifest::new(vec![
            ServiceSpec::new("web", "x:1", 80),
            ServiceSpec::new("web", "x:2", 0),
        ]);
        let err = m.check().unwrap_err();
        assert_eq!(err.violations.len(), 1);
        assert_eq!(err.violations[0].path, "services[1].port");

        let dup = EnvironmentManifest::new(vec![ServiceSpec::new("web", "x:1", 80), ServiceSpec::new("web", "x:2", 81)]);
        assert!(dup.check().is_ok());
        assert!(EnvironmentManifest::new(vec![]).check().is_err());
    }

    #[test]
    fn helpers_render_urls_and_hints() {
        let svc = ServiceSpec::new("api", "api:1", 8080).with_ingress("/api").with_env("MODE", "dev");
        assert_eq!(svc.internal_url(), "http://api:8080");
        assert_eq!(svc.effective_path(), Some("/api"));
        assert_eq!(svc.port_forward_hint("pr-7", 8000), "kubectl port-forward -n pr-7 svc/api 16080:8080");
        assert_eq!(svc.env.get("MODE").map(String::as_str), Some("dev"));
    }
}
