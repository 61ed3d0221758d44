use thiserror::Error;

/// Unified error taxonomy for the pipeline engine. Every variant maps to one
/// of the CLI exit codes documented in the manifest/CLI contract.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("workspace error at {path}: {source}")]
    Workspace {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to resolve step '{0}': {1}")]
    StepResolve(String, String),

    #[error("image error: {0}")]
    Image(String),

    #[error("container error: {0}")]
    Container(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("protocol error: sentinel line '{0}' had no parseable exit code")]
    Protocol(String),

    #[error("timeout waiting for step '{0}' to complete")]
    Timeout(String),

    #[error("step '{step_id}' failed with exit code {code}")]
    StepFailed { step_id: String, code: i32 },

    #[error("usage error: {0}")]
    Usage(String),
}

impl RunnerError {
    /// Exit code contract from the CLI surface: 0 success, the rest below.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunnerError::StepFailed { .. } => 1,
            RunnerError::Workspace { .. } | RunnerError::StepResolve(..) => 2,
            RunnerError::Image(_) => 3,
            RunnerError::Container(_) | RunnerError::Session(_) | RunnerError::Protocol(_) => 4,
            RunnerError::Timeout(_) => 4,
            RunnerError::Manifest(_) => 2,
            RunnerError::Usage(_) => 5,
        }
    }
}
