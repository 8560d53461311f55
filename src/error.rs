use thiserror::Error;

/// SMO-specific error types for better error handling
#[derive(Error, Debug)]
pub enum SmoError {
    #[error("Graph with name {name} not found")]
    GraphNotFound { name: String },

    #[error("Graph with name {name} already exists")]
    GraphAlreadyExists { name: String },

    #[error("Graph with name {name} is already running")]
    AlreadyRunning { name: String },

    #[error("Graph with name {name} is already stopped")]
    AlreadyStopped { name: String },

    #[error("Solver error: {0}")]
    Solver(#[from] SolverError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Subprocess error: {0}")]
    Subprocess(#[from] SubprocessError),

    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Generic error: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum SolverError {
    #[error("No feasible solution for {model}")]
    Infeasible { model: String },

    #[error("Solver backend failure: {message}")]
    Backend { message: String },
}

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Deployment not reachable: {name}: {reason}")]
    Unavailable { name: String, reason: String },

    #[error("Scaling deployment {name} failed: {reason}")]
    ScaleFailed { name: String, reason: String },

    #[error("Invalid CPU quantity {value:?} on deployment {name}")]
    InvalidCpuQuantity { name: String, value: String },

    #[error("Kubeconfig error: {reason}")]
    Kubeconfig { reason: String },
}

#[derive(Error, Debug)]
pub enum SubprocessError {
    #[error("`{command}` exited with {status}: {output}")]
    CommandFailed {
        command: String,
        status: String,
        output: String,
    },

    #[error("Failed to spawn `{command}`: {reason}")]
    SpawnFailed { command: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("Descriptor missing from request")]
    Missing,

    #[error("Invalid descriptor: {reason}")]
    InvalidFormat { reason: String },

    #[error("No descriptor YAML found in artifact {artifact_ref}")]
    NotFoundInArtifact { artifact_ref: String },
}

/// Convenience type alias for SMO results
pub type Result<T, E = SmoError> = std::result::Result<T, E>;
