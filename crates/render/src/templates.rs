//! Optional Handlebars overrides for built-in documents.
//!
//! A template directory may hold any of `namespace.yaml.hbs`,
//! `middleware.yaml.hbs`, `deployment.yaml.hbs`, `service.yaml.hbs` and
//! `ingress.yaml.hbs`. Templates render YAML; the result must declare the
//! expected `kind`, and its name/namespace are forced to the derived values so
//! apply order and idempotency do not depend on template content.

use std::collections::BTreeSet;
use std::path::Path;

use ephem_core::ResourceKind;
use handlebars::Handlebars;
use serde_json::{Map, Value as Json};
use tracing::{debug, info};

use crate::{RenderError, TemplateContext};

pub const TEMPLATE_SUFFIX: &str = ".yaml.hbs";

#[derive(Debug)]
pub struct TemplateSet {
    hbs: Handlebars<'static>,
    present: BTreeSet<ResourceKind>,
}

fn template_name(kind: ResourceKind) -> String {
    kind.as_str().to_ascii_lowercase()
}

impl TemplateSet {
    pub fn load(dir: &Path) -> Result<Self, RenderError> {
        let mut hbs = Handlebars::new();
        hbs.set_strict_mode(true);
        // Output is YAML, not HTML.
        hbs.register_escape_fn(handlebars::no_escape);

        let mut present = BTreeSet::new();
        for kind in ResourceKind::ALL {
            let path = dir.join(format!("{}{}", template_name(kind), TEMPLATE_SUFFIX));
            if !path.is_file() {
                continue;
            }
            let source = std::fs::read_to_string(&path).map_err(|e| RenderError::Template {
                kind,
                message: format!("reading {}: {}", path.display(), e),
            })?;
            hbs.register_template_string(&template_name(kind), source)
                .map_err(|e| RenderError::Template { kind, message: e.to_string() })?;
            debug!(kind = %kind, path = %path.display(), "template registered");
            present.insert(kind);
        }
        if present.is_empty() {
            return Err(RenderError::Template {
                kind: ResourceKind::Namespace,
                message: format!("no *{} templates found in {}", TEMPLATE_SUFFIX, dir.display()),
            });
        }
        info!(dir = %dir.display(), templates = present.len(), "loaded template overrides");
        Ok(Self { hbs, present })
    }

    pub fn covers(&self, kind: ResourceKind) -> bool {
        self.present.contains(&kind)
    }

    /// `None` when no template overrides `kind`.
    pub fn render(&self, kind: ResourceKind, ctx: &TemplateContext<'_>) -> Option<Result<Json, RenderError>> {
        if !self.covers(kind) {
            return None;
        }
        Some(self.render_doc(kind, ctx))
    }

    fn render_doc(&self, kind: ResourceKind, ctx: &TemplateContext<'_>) -> Result<Json, RenderError> {
        let err = |message: String| RenderError::Template { kind, message };
        let text = self.hbs.render(&template_name(kind), ctx).map_err(|e| err(e.to_string()))?;
        let mut doc: Json = serde_yaml::from_str(&text).map_err(|e| err(format!("rendered YAML is invalid: {}", e)))?;
        let declared = doc.get("kind").and_then(|k| k.as_str()).unwrap_or_default();
        if declared != kind.as_str() {
            return Err(err(format!("rendered kind '{}' does not match {}", declared, kind)));
        }
        let namespace = kind.namespaced().then_some(ctx.namespace);
        force_metadata(&mut doc, &ctx.name, namespace).map_err(err)?;
        Ok(doc)
    }
}

fn force_metadata(doc: &mut Json, name: &str, ns: Option<&str>) -> Result<(), String> {
    let obj = doc.as_object_mut().ok_or_else(|| "rendered document is not a mapping".to_string())?;
    let meta = obj.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
    let meta = meta.as_object_mut().ok_or_else(|| "metadata is not a mapping".to_string())?;
    meta.insert("name".into(), Json::String(name.to_string()));
    match ns {
        Some(ns) => { meta.insert("namespace".into(), Json::String(ns.to_string())); }
        None => { meta.remove("namespace"); }
    }
    Ok(())
}
