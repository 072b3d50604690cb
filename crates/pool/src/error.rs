use transport::TransportError;

/// Failure to bring up or keep an isolate. `Clone` so every request waiting
/// on one spawn receives the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("no free port between {start} and {end}")]
    PortExhausted { start: u16, end: u16 },
    #[error("failed to spawn isolate for {pattern}: {message}")]
    Spawn { pattern: String, message: String },
    #[error("isolate for {pattern} could not bind port {port}: {message}")]
    Bind {
        pattern: String,
        port: u16,
        message: String,
    },
    #[error("isolate for {pattern} exited before becoming ready")]
    Exited { pattern: String },
    #[error("timed out waiting for isolate at {0}")]
    HealthTimeout(String),
    #[error(transparent)]
    Transport(TransportError),
    #[error("spawn for {0} was abandoned")]
    Abandoned(String),
    #[error("isolate manager is shut down")]
    ShutDown,
}

impl PoolError {
    /// Failures that a fresh port may fix.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Bind { .. } | PoolError::Exited { .. })
    }
}

impl From<TransportError> for PoolError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotReady(address) => PoolError::HealthTimeout(address),
            other => PoolError::Transport(other),
        }
    }
}
