use crate::errors::RunnerError;
use crate::logging;
use crate::manifest::{Manifest, StepRef};
use crate::step::{load_step_definition, StepDefinition, StepResolver};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// On-host directory tree for one build: `builds/<build-id>/source` plus one
/// directory per step instance id. Nothing else writes into this tree once
/// [`materialize`] returns (§3 Ownership).
pub struct Workspace {
    pub root: PathBuf,
    pub build_id: String,
    /// Step definitions discovered while materializing, keyed by instance id.
    pub step_definitions: HashMap<String, StepDefinition>,
}

impl Workspace {
    /// Every top-level entry under `root`: `source` plus one per step
    /// instance id, per the invariant in §3. Used by the driver to compute
    /// bind mounts without re-deriving step ids from the manifest.
    pub fn top_level_entries(&self) -> Result<Vec<String>, RunnerError> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.root).map_err(|e| RunnerError::Workspace {
            path: self.root.display().to_string(),
            source: e,
        })? {
            let entry = entry.map_err(|e| RunnerError::Workspace {
                path: self.root.display().to_string(),
                source: e,
            })?;
            entries.push(entry.file_name().to_string_lossy().to_string());
        }
        entries.sort();
        Ok(entries)
    }
}

/// Allocates `builds/<build-id>/`, copies the checkout into `source/`, and
/// materializes each build-pipeline step's payload into its instance
/// directory, in pipeline order. Mutates each [`StepRef`] in place to attach
/// the step definition it resolved (for registered steps).
///
/// `build_id` is normally freshly generated; the CLI may override it via
/// `WERCKER_BUILD_ID` per §6.
pub fn materialize(
    manifest: &mut Manifest,
    checkout_dir: &Path,
    step_resolver: &dyn StepResolver,
    builds_root: &Path,
    build_id: String,
) -> Result<Workspace, RunnerError> {
    let root = builds_root.join(&build_id);
    std::fs::create_dir_all(&root).map_err(|e| RunnerError::Workspace {
        path: root.display().to_string(),
        source: e,
    })?;
    logging::info(&format!("materializing workspace at {}", root.display()));

    let source_dir = root.join("source");
    copy_dir_recursive(checkout_dir, &source_dir)?;

    let mut step_definitions = HashMap::new();
    for step in manifest.build.steps.iter_mut() {
        materialize_step(step, &root, step_resolver, &mut step_definitions)?;
    }

    Ok(Workspace {
        root,
        build_id,
        step_definitions,
    })
}

fn materialize_step(
    step: &StepRef,
    workspace_root: &Path,
    step_resolver: &dyn StepResolver,
    step_definitions: &mut HashMap<String, StepDefinition>,
) -> Result<(), RunnerError> {
    let instance_dir = workspace_root.join(step.instance_id());

    match step {
        StepRef::Script { code, instance_id } => {
            std::fs::create_dir_all(&instance_dir).map_err(|e| RunnerError::Workspace {
                path: instance_dir.display().to_string(),
                source: e,
            })?;
            let normalized = normalize_script(code);
            let run_path = instance_dir.join("run.sh");
            std::fs::write(&run_path, normalized).map_err(|e| RunnerError::Workspace {
                path: run_path.display().to_string(),
                source: e,
            })?;
            logging::info(&format!("wrote script step {}", instance_id));
        }
        StepRef::Registered {
            instance_id, name, ..
        } => {
            let step_id = step.step_id().unwrap();
            let source_dir = step_resolver.resolve(&step_id)?;
            if let Some(def) = load_step_definition(&source_dir)? {
                step_definitions.insert(instance_id.clone(), def);
            }
            copy_dir_recursive(&source_dir, &instance_dir)?;
            logging::info(&format!("materialized step {} ({})", name, instance_id));
        }
    }
    Ok(())
}

/// Splits on `\n`, inserts `#!/bin/bash -xe` as line 0 iff the first line
/// does not start with `#!`, rejoins. Idempotent: re-normalizing an already
/// normalized script is a no-op.
pub fn normalize_script(code: &str) -> String {
    let mut lines: Vec<&str> = code.split('\n').collect();
    if lines.first().map(|l| l.starts_with("#!")) != Some(true) {
        lines.insert(0, "#!/bin/bash -xe");
    }
    lines.join("\n")
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), RunnerError> {
    std::fs::create_dir_all(dst).map_err(|e| RunnerError::Workspace {
        path: dst.display().to_string(),
        source: e,
    })?;
    for entry in std::fs::read_dir(src).map_err(|e| RunnerError::Workspace {
        path: src.display().to_string(),
        source: e,
    })? {
        let entry = entry.map_err(|e| RunnerError::Workspace {
            path: src.display().to_string(),
            source: e,
        })?;
        let file_type = entry.file_type().map_err(|e| RunnerError::Workspace {
            path: entry.path().display().to_string(),
            source: e,
        })?;
        let dest_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &dest_path)?;
        } else {
            std::fs::copy(entry.path(), &dest_path).map_err(|e| RunnerError::Workspace {
                path: entry.path().display().to_string(),
                source: e,
            })?;
        }
    }
    Ok(())
}
