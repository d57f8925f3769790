use shared::rpc::ResultOutcome;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid task id: {0}")]
    InvalidTaskId(String),
    #[error("firecracker exited before the api socket appeared: {0}")]
    Boot(String),
    #[error("api configuration rejected: {0}")]
    Config(String),
    #[error("timed out connecting to the guest agent")]
    Connection,
    #[error("{0}")]
    Protocol(#[from] shared::protocol::ProtocolError),
    #[error("invalid json from guest: {0}")]
    Json(String),
    #[error("backtest exceeded the wall timeout")]
    Timeout,
}

impl OrchestratorError {
    pub fn into_outcome(self) -> ResultOutcome {
        match self {
            OrchestratorError::InvalidTaskId(m) => ResultOutcome::boot_error(m),
            OrchestratorError::Boot(m) => ResultOutcome::boot_error(m),
            OrchestratorError::Config(m) => ResultOutcome::config_error(m),
            OrchestratorError::Connection => {
                ResultOutcome::connection_error("Timed out connecting to Agent.")
            }
            OrchestratorError::Protocol(e) => ResultOutcome::protocol_error(e.to_string()),
            OrchestratorError::Json(m) => ResultOutcome::json_error(m),
            OrchestratorError::Timeout => ResultOutcome::timeout(),
        }
    }

    /// Whether a `ConfigError` came from the vsock PUT specifically (as
    /// opposed to machine-config/boot-source/drives), which is the only
    /// case the boot sequence should retry with a freshly derived CID.
    pub fn looks_like_vsock_rejection(&self) -> bool {
        matches!(self, OrchestratorError::Config(m) if m.to_lowercase().contains("vsock"))
    }
}
