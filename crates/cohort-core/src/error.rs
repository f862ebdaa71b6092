use cohort_kernel::KernelError;

pub type Result<T> = std::result::Result<T, CoordinationError>;

#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    /// A status change rejected by the transition table or owner rule.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("persistence failure: {0}")]
    Persistence(#[source] KernelError),
    #[error("rollout {rollout_id} health check timed out in wave {wave}")]
    RolloutHealthTimeout { rollout_id: String, wave: String },
    #[error("membership discovery failed: {0}")]
    DiscoveryFailure(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<KernelError> for CoordinationError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::InvalidTransition { .. } | KernelError::InvalidOwner { .. } => {
                CoordinationError::InvalidTransition(err.to_string())
            }
            other => CoordinationError::Persistence(other),
        }
    }
}

impl CoordinationError {
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, CoordinationError::InvalidTransition(_))
    }
}
