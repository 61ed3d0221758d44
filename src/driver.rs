use crate::container::{create_and_start_container, ensure_image, ContainerEngine, DockerEngine};
use crate::environment::{build_step_env, EnvSnapshot};
use crate::errors::RunnerError;
use crate::logging;
use crate::manifest::{Manifest, StepRef};
use crate::session::{self, AttachReader, AttachWriter, CheckedResult, ExitOutcome, Session};
use crate::step::{ProjectCheckout, StepResolver};
use crate::workspace::{materialize, Workspace};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub instance_id: String,
    pub exit_code: i32,
    pub captured: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub status: BuildStatus,
    pub per_step: Vec<StepOutcome>,
    pub failing_step: Option<(String, i32)>,
}

/// Sequences C2-C5 for one build: materialize, copy into container, execute
/// each step, surface the result (§4.6).
pub async fn run_build(
    mut manifest: Manifest,
    checkout: &dyn ProjectCheckout,
    project: &str,
    step_resolver: &dyn StepResolver,
    builds_root: &Path,
    build_id: String,
) -> Result<BuildResult, RunnerError> {
    let checkout_dir = checkout.checkout(project)?;
    let workspace = materialize(
        &mut manifest,
        &checkout_dir,
        step_resolver,
        builds_root,
        build_id,
    )?;

    let engine = DockerEngine::connect()?;
    let image = ensure_image(&manifest.bx, &engine).await?;

    let entries = workspace.top_level_entries()?;
    let mounts: Vec<(String, std::path::PathBuf)> = entries
        .iter()
        .map(|e| (e.clone(), workspace.root.join(e)))
        .collect();
    let container_id = create_and_start_container(&image, &mounts, &engine).await?;

    let attach_result = session::attach(engine.docker(), &container_id).await;
    let result = match attach_result {
        Ok((reader, writer)) => {
            drive_session(&manifest, &workspace, reader, writer).await
        }
        Err(e) => Err(e),
    };

    engine.stop_container(&container_id).await?;
    result
}

async fn drive_session(
    manifest: &Manifest,
    workspace: &Workspace,
    reader: impl AttachReader + 'static,
    writer: impl AttachWriter + 'static,
) -> Result<BuildResult, RunnerError> {
    let no_response_timeout =
        Duration::from_secs(manifest.global_options.no_response_timeout_minutes * 60);
    let command_timeout =
        Duration::from_secs(manifest.global_options.command_timeout_minutes * 60);
    let mut session = Session::attach_with(reader, writer, no_response_timeout, command_timeout);

    let preamble = vec![
        "export TERM=xterm-256color".to_string(),
        "cp -r /mnt/source /tmp/source".to_string(),
    ];
    session.send(&preamble).await?;

    // Copy each step's payload into a writable location before any step runs.
    for step in &manifest.build.steps {
        let instance_id = step.instance_id();
        let copy = vec![format!(
            "cp -r /mnt/{} /tmp/{}",
            instance_id, instance_id
        )];
        let result = session.send_checked(&copy).await?;
        match result.exit {
            ExitOutcome::Code(0) => {}
            ExitOutcome::Code(code) => {
                session.close();
                return Ok(BuildResult {
                    status: BuildStatus::Failed,
                    per_step: vec![],
                    failing_step: Some((instance_id.to_string(), code)),
                });
            }
            ExitOutcome::Cancelled => {
                session.close();
                return Err(RunnerError::Session(
                    "session cancelled while staging step payloads".to_string(),
                ));
            }
        }
    }

    let snapshot = EnvSnapshot::capture();
    let mut per_step = Vec::new();

    for step in &manifest.build.steps {
        let instance_id = step.instance_id().to_string();
        let def = workspace.step_definitions.get(&instance_id);
        let env = build_step_env(&snapshot, &manifest.global_options, step, def);

        let commands = step_command_group(&instance_id, &env, workspace, step);
        logging::info(&format!("executing step {}", instance_id));
        let CheckedResult { exit, captured } = session.send_checked(&commands).await?;

        match exit {
            ExitOutcome::Code(0) => {
                per_step.push(StepOutcome {
                    instance_id,
                    exit_code: 0,
                    captured,
                });
            }
            ExitOutcome::Code(code) => {
                per_step.push(StepOutcome {
                    instance_id: instance_id.clone(),
                    exit_code: code,
                    captured,
                });
                session.close();
                return Ok(BuildResult {
                    status: BuildStatus::Failed,
                    per_step,
                    failing_step: Some((instance_id, code)),
                });
            }
            ExitOutcome::Cancelled => {
                session.close();
                return Err(RunnerError::Session(format!(
                    "session cancelled while running step {}",
                    instance_id
                )));
            }
        }
    }

    session.close();
    logging::success("build completed successfully");
    Ok(BuildResult {
        status: BuildStatus::Success,
        per_step,
        failing_step: None,
    })
}

fn step_command_group(
    instance_id: &str,
    env: &[(String, String)],
    workspace: &Workspace,
    step: &StepRef,
) -> Vec<String> {
    let _ = step;
    let mut commands = Vec::new();
    commands.push(format!("export WERCKER_STEP_ROOT=/tmp/{}", instance_id));
    for (k, v) in env {
        commands.push(format!("export {}=\"{}\"", k, shell_escape(v)));
    }
    commands.push("cd /tmp/source".to_string());

    let instance_dir = workspace.root.join(instance_id);
    if instance_dir.join("init.sh").exists() {
        commands.push(format!("source /tmp/{}/init.sh", instance_id));
    }
    if instance_dir.join("run.sh").exists() {
        commands.push(format!("chmod +x /tmp/{}/run.sh", instance_id));
        commands.push(format!("source /tmp/{}/run.sh", instance_id));
    }
    commands
}

fn shell_escape(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"")
}
