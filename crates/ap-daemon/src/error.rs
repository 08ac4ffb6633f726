use ap_core::config::ConfigError;
use ap_core::types::{ErrorKind, PipelineStatus, StateError};
use ap_integrations::gateway::GatewayError;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("gateway: {0}")]
    Gateway(#[from] GatewayError),
    #[error("state: {0}")]
    State(#[from] StateError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("issue #{0} is not tracked")]
    UnknownIssue(u64),
    #[error("no agents configured for {0}")]
    MissingMapping(String),
    #[error("issue #{issue} is in {actual}, not {expected}")]
    StatusMismatch {
        issue: u64,
        expected: PipelineStatus,
        actual: PipelineStatus,
    },
}

impl OrchestratorError {
    /// Fatal errors halt automatic assignment until an operator steps in.
    pub fn is_fatal(&self) -> bool {
        match self {
            OrchestratorError::Gateway(e) => e.is_fatal(),
            OrchestratorError::Config(_) | OrchestratorError::MissingMapping(_) => true,
            OrchestratorError::State(_)
            | OrchestratorError::UnknownIssue(_)
            | OrchestratorError::StatusMismatch { .. } => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_fatal() {
            ErrorKind::Fatal
        } else {
            ErrorKind::Transient
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_gateway() {
        let permission = OrchestratorError::from(GatewayError::Permission("nope".into()));
        let transient = OrchestratorError::from(GatewayError::Transient("502".into()));
        assert_eq!(permission.kind(), ErrorKind::Fatal);
        assert_eq!(transient.kind(), ErrorKind::Transient);
        assert!(OrchestratorError::MissingMapping("Ready".into()).is_fatal());
        assert!(!OrchestratorError::UnknownIssue(3).is_fatal());
    }
}
