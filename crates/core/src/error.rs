use thiserror::Error;

/// Error taxonomy shared by every keel crate.
///
/// Variants whose display is the bare message (`Mutation`, `Permission`, `Validation`)
/// are recorded verbatim into per-resource sync results.
#[derive(Debug, Error)]
pub enum Error {
    #[error("discovery: {0}")]
    Discovery(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Permission(String),
    #[error("{0}")]
    Mutation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("health assessment: {0}")]
    HealthAssessment(String),
    #[error("{0}")]
    Termination(String),
    #[error("invalid manifest: {0}")]
    Manifest(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(format!("{e:#}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Manifest(e.to_string())
    }
}
