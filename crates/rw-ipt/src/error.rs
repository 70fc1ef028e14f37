use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure of an external packet-filter command. A timeout counts as a
/// failure like any other.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open {path:?} as stdin: {source}")]
    Stdin {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure of an atomic bulk load.
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("failed to stage restore payload at {path:?}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Exec(#[from] ExecError),
}
