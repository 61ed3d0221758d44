use crate::errors::RunnerError;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;

/// Top-level parsed pipeline manifest.
///
/// Mirrors the original `WerckerConfig`: a handful of known fields plus
/// forward-compatible carry-through of anything the parser doesn't
/// recognize.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub bx: Bx,
    pub services: Vec<Service>,
    pub build: Pipeline,
    pub deploy: Pipeline,
    pub global_options: GlobalOptions,
    /// Top-level keys this parser doesn't model, retained for round-tripping.
    pub extra: Mapping,
}

/// Named `Bx` rather than `Box` to avoid colliding with `std::boxed::Box`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bx {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalOptions {
    pub source_dir: String,
    pub no_response_timeout_minutes: u64,
    pub command_timeout_minutes: u64,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        GlobalOptions {
            source_dir: String::new(),
            no_response_timeout_minutes: 5,
            command_timeout_minutes: 10,
        }
    }
}

/// An ordered sequence of steps, always headed by the synthetic
/// `wercker-init` step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pipeline {
    pub steps: Vec<StepRef>,
}

impl Pipeline {
    fn from_step_list(entries: Vec<(String, Mapping)>) -> Self {
        let mut steps = Vec::with_capacity(entries.len() + 1);
        steps.push(StepRef::new("wercker-init", Mapping::new()));
        for (id, content) in entries {
            steps.push(StepRef::new(&id, content));
        }
        Pipeline { steps }
    }
}

/// One entry in a pipeline: either a reference to a registered step package
/// or inline shell code.
#[derive(Debug, Clone, PartialEq)]
pub enum StepRef {
    Registered {
        owner: String,
        name: String,
        properties: HashMap<String, String>,
        /// Stable for the run; `owner_name` with slashes collapsed.
        instance_id: String,
    },
    Script {
        code: String,
        /// Stable for the run; a freshly generated token.
        instance_id: String,
    },
}

impl StepRef {
    fn new(step_id: &str, content: Mapping) -> Self {
        if step_id == "script" {
            let code = content
                .iter()
                .find(|(k, _)| k.as_str() == Some("code"))
                .and_then(|(_, v)| v.as_str())
                .unwrap_or("")
                .to_string();
            StepRef::Script {
                code,
                instance_id: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
            }
        } else {
            let (owner, name) = split_owner_name(step_id);
            let instance_id = normalize_step_id(&format!("{}_{}", owner, name));
            let properties = content
                .into_iter()
                .filter_map(|(k, v)| {
                    let k = k.as_str()?.to_string();
                    let v = value_to_string(&v);
                    Some((k, v))
                })
                .collect();
            StepRef::Registered {
                owner,
                name,
                properties,
                instance_id,
            }
        }
    }

    pub fn instance_id(&self) -> &str {
        match self {
            StepRef::Registered { instance_id, .. } => instance_id,
            StepRef::Script { instance_id, .. } => instance_id,
        }
    }

    /// The `owner/name` form used to resolve a step package; `None` for
    /// script steps.
    pub fn step_id(&self) -> Option<String> {
        match self {
            StepRef::Registered { owner, name, .. } => Some(format!("{}/{}", owner, name)),
            StepRef::Script { .. } => None,
        }
    }
}

fn split_owner_name(step_id: &str) -> (String, String) {
    match step_id.split_once('/') {
        Some((owner, name)) => (owner.to_string(), name.to_string()),
        None => ("wercker".to_string(), step_id.to_string()),
    }
}

fn normalize_step_id(s: &str) -> String {
    s.replace('/', "_")
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_yaml::to_string(other).unwrap_or_default().trim().to_string(),
    }
}

/// Raw shape used only for `serde_yaml` deserialization; converted into the
/// richer [`Manifest`] by [`parse_manifest`].
#[derive(Debug, Deserialize, Serialize, Default)]
struct RawManifest {
    #[serde(default)]
    #[serde(rename = "box")]
    bx: Option<Value>,
    #[serde(default)]
    services: Vec<Value>,
    #[serde(default)]
    #[serde(rename = "source-dir")]
    source_dir: Option<String>,
    #[serde(default)]
    #[serde(rename = "no-response-timeout")]
    no_response_timeout: Option<u64>,
    #[serde(default)]
    #[serde(rename = "command-timeout")]
    command_timeout: Option<u64>,
    #[serde(default)]
    build: Option<RawPipeline>,
    #[serde(default)]
    deploy: Option<RawPipeline>,
    #[serde(flatten)]
    extra: Mapping,
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct RawPipeline {
    #[serde(default)]
    steps: Vec<Value>,
}

/// `ParseManifest(bytes) -> Manifest | ParseError` per the manifest model
/// contract. Structural validation only: no property-schema checks here.
pub fn parse_manifest(bytes: &[u8]) -> Result<Manifest, RunnerError> {
    let raw: RawManifest = serde_yaml::from_slice(bytes)
        .map_err(|e| RunnerError::Manifest(format!("failed to parse manifest YAML: {}", e)))?;

    let bx_name = match raw.bx {
        Some(Value::String(s)) if !s.is_empty() => s,
        Some(other) => {
            return Err(RunnerError::Manifest(format!(
                "'box' must be a non-empty string, got {:?}",
                other
            )))
        }
        None => {
            return Err(RunnerError::Manifest(
                "manifest is missing required 'box' field".to_string(),
            ))
        }
    };

    let services = raw
        .services
        .into_iter()
        .map(|v| match v {
            Value::String(name) => Ok(Service { name }),
            other => Err(RunnerError::Manifest(format!(
                "service entry must be a string, got {:?}",
                other
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let build = pipeline_from_raw(raw.build.unwrap_or_default())?;
    let deploy = pipeline_from_raw(raw.deploy.unwrap_or_default())?;

    Ok(Manifest {
        bx: Bx { name: bx_name },
        services,
        build,
        deploy,
        global_options: GlobalOptions {
            source_dir: raw.source_dir.unwrap_or_default(),
            no_response_timeout_minutes: raw.no_response_timeout.unwrap_or(5),
            command_timeout_minutes: raw.command_timeout.unwrap_or(10),
        },
        extra: raw.extra,
    })
}

fn pipeline_from_raw(raw: RawPipeline) -> Result<Pipeline, RunnerError> {
    let mut entries = Vec::with_capacity(raw.steps.len());
    for step in raw.steps {
        entries.push(canonicalize_step(step)?);
    }
    Ok(Pipeline::from_step_list(entries))
}

/// Canonicalizes a single `steps:` entry to `(step_id, step_content)` per
/// §4.1: a bare string becomes `(s, {})`; a single-key mapping becomes
/// `(k, v)`.
fn canonicalize_step(step: Value) -> Result<(String, Mapping), RunnerError> {
    match step {
        Value::String(s) => Ok((s, Mapping::new())),
        Value::Mapping(m) => {
            if m.len() != 1 {
                return Err(RunnerError::Manifest(format!(
                    "step entry must have exactly one key, got {} keys",
                    m.len()
                )));
            }
            let (k, v) = m.into_iter().next().unwrap();
            let key = k
                .as_str()
                .ok_or_else(|| RunnerError::Manifest("step key must be a string".to_string()))?
                .to_string();
            let content = match v {
                Value::Mapping(inner) => inner,
                Value::Null => Mapping::new(),
                other => {
                    return Err(RunnerError::Manifest(format!(
                        "step content must be a mapping, got {:?}",
                        other
                    )))
                }
            };
            Ok((key, content))
        }
        other => Err(RunnerError::Manifest(format!(
            "step entry must be a string or a single-key mapping, got {:?}",
            other
        ))),
    }
}
