use crate::manifest::{GlobalOptions, StepRef};
use crate::step::StepDefinition;
use std::collections::HashMap;

/// Mirror variables forwarded verbatim into every step's environment when
/// set in the ambient process environment (§4.3 item 2).
const MIRROR_VARS: &[&str] = &[
    "WERCKER_GIT_DOMAIN",
    "WERCKER_GIT_OWNER",
    "WERCKER_GIT_REPOSITORY",
    "WERCKER_GIT_BRANCH",
    "WERCKER_GIT_COMMIT",
    "WERCKER_STARTED_BY",
    "WERCKER_MAIN_PIPELINE_STARTED",
    "WERCKER_APPLICATION_URL",
    "WERCKER_APPLICATION_ID",
    "WERCKER_APPLICATION_NAME",
    "WERCKER_APPLICATION_OWNER_NAME",
];

/// An immutable snapshot of the ambient process environment, taken once at
/// driver construction (Design Note: "Global state" — nothing reads
/// `std::env::var` ad hoc after this point).
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub fn capture() -> Self {
        EnvSnapshot {
            vars: std::env::vars().collect(),
        }
    }

    #[cfg(test)]
    pub fn from_map(vars: HashMap<String, String>) -> Self {
        EnvSnapshot { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

/// Builds the environment-variable set exported inside the container before
/// a step's script is sourced. Order matches §4.3: passthru, mirrors,
/// pipeline-wide, per-step identity, then per-property exports; later
/// entries override earlier ones with the same key.
pub fn build_step_env(
    snapshot: &EnvSnapshot,
    global: &GlobalOptions,
    step: &StepRef,
    step_definition: Option<&StepDefinition>,
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = Vec::new();
    let mut push = |k: String, v: String| {
        if let Some(existing) = env.iter_mut().find(|(ek, _)| *ek == k) {
            existing.1 = v;
        } else {
            env.push((k, v));
        }
    };

    // 1. PASSTHRU_* with the prefix stripped.
    for (k, v) in snapshot.vars.iter() {
        if let Some(stripped) = k.strip_prefix("PASSTHRU_") {
            push(stripped.to_string(), v.clone());
        }
    }

    // 2. Mirror variables, forwarded verbatim if set.
    for mirror in MIRROR_VARS {
        if let Some(v) = snapshot.get(mirror) {
            push((*mirror).to_string(), v.to_string());
        }
    }

    // 3. Pipeline-wide.
    push("WERCKER".to_string(), "true".to_string());
    push("BUILD".to_string(), "true".to_string());
    push("CI".to_string(), "true".to_string());
    push("WERCKER_ROOT".to_string(), "/pipeline/source".to_string());
    push(
        "WERCKER_SOURCE_DIR".to_string(),
        format!("/pipeline/source/{}", global.source_dir),
    );
    push("WERCKER_CACHE_DIR".to_string(), "/cache".to_string());
    push(
        "WERCKER_OUTPUT_DIR".to_string(),
        "/pipeline/output".to_string(),
    );
    push("WERCKER_PIPELINE_DIR".to_string(), "/pipeline".to_string());
    push(
        "WERCKER_REPORT_DIR".to_string(),
        "/pipeline/report".to_string(),
    );

    // 4. Per-step identity.
    let instance_id = step.instance_id();
    let (owner, name) = match step {
        crate::manifest::StepRef::Registered { owner, name, .. } => {
            (owner.clone(), name.clone())
        }
        crate::manifest::StepRef::Script { .. } => ("wercker".to_string(), "script".to_string()),
    };
    push(
        "WERCKER_STEP_ROOT".to_string(),
        format!("/tmp/{}", instance_id),
    );
    push("WERCKER_STEP_ID".to_string(), instance_id.to_string());
    push("WERCKER_STEP_OWNER".to_string(), owner);
    push("WERCKER_STEP_NAME".to_string(), name.clone());
    let report_root = format!("/pipeline/report/{}", instance_id);
    push(
        "WERCKER_REPORT_MESSAGE_FILE".to_string(),
        format!("{}/message.txt", report_root),
    );
    push(
        "WERCKER_REPORT_ARTIFACTS_DIR".to_string(),
        format!("{}/artifacts", report_root),
    );

    // 5. Per-property exports, user value overriding schema default.
    if let Some(def) = step_definition {
        let user_values = match step {
            crate::manifest::StepRef::Registered { properties, .. } => Some(properties),
            crate::manifest::StepRef::Script { .. } => None,
        };
        for (prop_name, schema) in &def.properties {
            let value = user_values
                .and_then(|props| props.get(prop_name))
                .cloned()
                .unwrap_or_else(|| schema.default.clone());
            let key = format!(
                "WERCKER_{}_{}",
                env_key_segment(&name),
                env_key_segment(prop_name)
            );
            push(key, value);
        }

        // A property present in the user manifest but absent from the
        // schema is still exported with the user value (§8 boundary
        // behavior: schema gates defaults only, not presence).
        if let Some(user_values) = user_values {
            for (prop_name, value) in user_values {
                if !def.properties.contains_key(prop_name) {
                    let key = format!(
                        "WERCKER_{}_{}",
                        env_key_segment(&name),
                        env_key_segment(prop_name)
                    );
                    push(key, value.clone());
                }
            }
        }
    }
    // A step with no wercker-step.yml emits none of the per-property env
    // vars, regardless of what the manifest supplies for it.

    env
}

fn env_key_segment(s: &str) -> String {
    s.replace('-', "_").to_uppercase()
}
