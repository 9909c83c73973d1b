use thiserror::Error;

pub type Result<T> = std::result::Result<T, HarvestError>;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("failed to copy scanner to '{host}': {detail}")]
    AgentDeploy { host: String, detail: String },

    #[error("failed to launch scanner on '{host}': {detail}")]
    AgentLaunch { host: String, detail: String },

    #[error("scan did not finish on '{host}' within {seconds}s")]
    ScanTimeout { host: String, seconds: u64 },

    #[error("failed to fetch manifest from '{host}': {detail}")]
    ManifestFetch { host: String, detail: String },

    #[error("bulk transfer from '{host}' failed: {detail}")]
    Transfer { host: String, detail: String },

    #[error("blob not found in store: {0}")]
    BlobNotFound(String),

    #[error("invalid content hash '{input}': {reason}")]
    InvalidHash { input: String, reason: String },

    #[error("store is locked by another process ({holder})")]
    Locked { holder: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarvestError {
    /// True for failures that exclude a single host from the current pass
    /// without affecting the rest of the run.
    pub fn is_host_local(&self) -> bool {
        matches!(
            self,
            HarvestError::AgentDeploy { .. }
                | HarvestError::AgentLaunch { .. }
                | HarvestError::ScanTimeout { .. }
                | HarvestError::ManifestFetch { .. }
                | HarvestError::Transfer { .. }
        )
    }
}
