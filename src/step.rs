use crate::errors::RunnerError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Parsed `wercker-step.yml`. The `properties` map is the contract between
/// step author and user manifest: each property has a default and an
/// optional `required`/`type` annotation.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct StepDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub properties: HashMap<String, PropertySchema>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct PropertySchema {
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, rename = "type")]
    pub type_: Option<String>,
}

/// Loads `wercker-step.yml` from a fetched step directory, if present.
/// Absence is not an error: a step package without a manifest simply has no
/// declared properties (§8: "A step with no wercker-step.yml emits none of
/// the per-property env vars").
pub fn load_step_definition(step_dir: &Path) -> Result<Option<StepDefinition>, RunnerError> {
    let yml_path = step_dir.join("wercker-step.yml");
    if !yml_path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(&yml_path).map_err(|e| RunnerError::Workspace {
        path: yml_path.display().to_string(),
        source: e,
    })?;
    let def: StepDefinition = serde_yaml::from_slice(&bytes)
        .map_err(|e| RunnerError::Manifest(format!("invalid wercker-step.yml: {}", e)))?;
    Ok(Some(def))
}

/// Resolves a registered step identifier to a local directory containing
/// its fetched payload. This is the pluggable collaborator described by
/// spec §1 as out of scope; the default implementation reproduces the
/// original prototype's stub (`./steps/<id>`) so the runner works against a
/// local step cache without a real registry client.
pub trait StepResolver {
    fn resolve(&self, step_id: &str) -> Result<PathBuf, RunnerError>;
}

pub struct LocalStepResolver {
    pub root: PathBuf,
}

impl LocalStepResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalStepResolver { root: root.into() }
    }
}

impl Default for LocalStepResolver {
    fn default() -> Self {
        LocalStepResolver::new("./steps")
    }
}

impl StepResolver for LocalStepResolver {
    fn resolve(&self, step_id: &str) -> Result<PathBuf, RunnerError> {
        let path = self.root.join(step_id);
        if !path.is_dir() {
            return Err(RunnerError::StepResolve(
                step_id.to_string(),
                format!("no such step directory: {}", path.display()),
            ));
        }
        Ok(path)
    }
}

/// Resolves a `owner/project` checkout to a local directory. Out of scope
/// per spec §1 ("the VCS checkout, treated as a pluggable function"); the
/// default implementation mirrors the original prototype's
/// `./projects/<owner>/<project>` stub.
pub trait ProjectCheckout {
    fn checkout(&self, project: &str) -> Result<PathBuf, RunnerError>;
}

pub struct LocalProjectCheckout {
    pub root: PathBuf,
}

impl LocalProjectCheckout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalProjectCheckout { root: root.into() }
    }
}

impl Default for LocalProjectCheckout {
    fn default() -> Self {
        LocalProjectCheckout::new("./projects")
    }
}

impl ProjectCheckout for LocalProjectCheckout {
    fn checkout(&self, project: &str) -> Result<PathBuf, RunnerError> {
        let (owner, name) = project.split_once('/').ok_or_else(|| {
            RunnerError::Usage(format!("project must be 'owner/name', got '{}'", project))
        })?;
        let path = self.root.join(owner).join(name);
        if !path.is_dir() {
            return Err(RunnerError::Workspace {
                path: path.display().to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "project checkout not found",
                ),
            });
        }
        Ok(path)
    }
}
