use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use wercker_runner::driver::{run_build, BuildStatus};
use wercker_runner::errors::RunnerError;
use wercker_runner::logging;
use wercker_runner::manifest::parse_manifest;
use wercker_runner::step::{LocalProjectCheckout, LocalStepResolver, ProjectCheckout};

#[derive(Debug, Parser)]
#[command(name = "wercker-runner", about = "Container-based CI pipeline runner", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Run with verbose diagnostic logging.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build a project checked out locally under ./projects/<owner>/<name>.
    Build {
        /// Project identifier, `owner/name`.
        project: String,

        /// Path to the pipeline manifest. Defaults to
        /// `./projects/<owner>/<name>/wercker.yml`.
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { project, manifest } => {
            match run(&project, manifest, cli.verbose).await {
                Ok(BuildStatus::Success) => {
                    println!("BUILD SUCCESSFUL");
                    ExitCode::from(0)
                }
                Ok(BuildStatus::Failed) => {
                    println!("BUILD FAILED");
                    ExitCode::from(1)
                }
                Err(e) => {
                    logging::error(&format!("{}", e));
                    ExitCode::from(e.exit_code() as u8)
                }
            }
        }
    }
}

async fn run(
    project: &str,
    manifest_path: Option<PathBuf>,
    verbose: bool,
) -> Result<BuildStatus, RunnerError> {
    if verbose {
        logging::debug(&format!("starting build for {}", project));
    }

    let checkout = LocalProjectCheckout::default();
    let checkout_dir = checkout.checkout(project)?;

    let manifest_path =
        manifest_path.unwrap_or_else(|| checkout_dir.join("wercker.yml"));
    let bytes = std::fs::read(&manifest_path).map_err(|e| RunnerError::Workspace {
        path: manifest_path.display().to_string(),
        source: e,
    })?;
    let manifest = parse_manifest(&bytes)?;

    let build_id = std::env::var("WERCKER_BUILD_ID")
        .unwrap_or_else(|_| uuid::Uuid::new_v4().simple().to_string());

    let step_resolver = LocalStepResolver::default();
    let builds_root = PathBuf::from("./builds");

    let result = run_build(
        manifest,
        &checkout,
        project,
        &step_resolver,
        &builds_root,
        build_id,
    )
    .await?;

    for step in &result.per_step {
        println!("{} : {}", step.instance_id, step.exit_code);
    }

    match &result.failing_step {
        Some((id, code)) => {
            println!("BUILD FAILED at step {} (exit {})", id, code);
        }
        None => {}
    }

    Ok(result.status)
}
