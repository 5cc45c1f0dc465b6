//! Workflow template store.
//!
//! A workflow named `flux-krea` lives in `{workflows_dir}/flux-krea.json`
//! (the node graph). Its binding manifest is the first of
//! `flux-krea.yaml`, `flux-krea.yml` or `flux-krea.manifest.json` found
//! next to it.
//!
//! Loading validates the manifest against the template, so a store that
//! exists is always usable for requests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::CoreError;
use crate::manifest::BindingManifest;
use crate::workflow::WorkflowTemplate;

/// Manifest file suffixes tried in order, with whether they hold YAML.
const MANIFEST_SUFFIXES: &[(&str, bool)] = &[
    ("yaml", true),
    ("yml", true),
    ("manifest.json", false),
];

/// An immutable, validated workflow: template plus bindings.
///
/// Cheap to clone; the template and manifest are shared.
#[derive(Debug, Clone)]
pub struct WorkflowStore {
    name: String,
    template: Arc<WorkflowTemplate>,
    manifest: Arc<BindingManifest>,
}

impl WorkflowStore {
    /// Load and validate the workflow `name` from `workflows_dir`.
    pub fn load(workflows_dir: &Path, name: &str) -> Result<Self, CoreError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(CoreError::MalformedWorkflow(format!(
                "invalid workflow name '{name}'"
            )));
        }

        let template_path = workflows_dir.join(format!("{name}.json"));
        let template = WorkflowTemplate::from_json_str(&read(&template_path)?)?;

        let (manifest_path, is_yaml) = find_manifest(workflows_dir, name)?;
        let text = read(&manifest_path)?;
        let manifest = if is_yaml {
            BindingManifest::from_yaml_str(&text)?
        } else {
            BindingManifest::from_json_str(&text)?
        };

        let store = Self::from_parts(name, template, manifest)?;
        tracing::info!(
            workflow = %name,
            nodes = store.template.len(),
            template = %template_path.display(),
            manifest = %manifest_path.display(),
            "Workflow loaded",
        );
        Ok(store)
    }

    /// Build a store from already-parsed parts, validating the bindings.
    pub fn from_parts(
        name: impl Into<String>,
        template: WorkflowTemplate,
        manifest: BindingManifest,
    ) -> Result<Self, CoreError> {
        manifest.validate_against(&template)?;
        Ok(Self {
            name: name.into(),
            template: Arc::new(template),
            manifest: Arc::new(manifest),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> &WorkflowTemplate {
        &self.template
    }

    pub fn manifest(&self) -> &BindingManifest {
        &self.manifest
    }
}

fn read(path: &Path) -> Result<String, CoreError> {
    std::fs::read_to_string(path).map_err(|source| CoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn find_manifest(dir: &Path, name: &str) -> Result<(PathBuf, bool), CoreError> {
    for &(suffix, is_yaml) in MANIFEST_SUFFIXES {
        let path = dir.join(format!("{name}.{suffix}"));
        if path.is_file() {
            return Ok((path, is_yaml));
        }
    }
    Err(CoreError::Io {
        path: dir.join(format!("{name}.yaml")),
        source: std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no binding manifest (.yaml, .yml or .manifest.json) found",
        ),
    })
}
