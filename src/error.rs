use thiserror::Error;

use crate::connection::ConnectionStatus;

#[derive(Debug, Error)]
pub enum VpnError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("disconnect failed: {0}")]
    Disconnection(String),

    #[error("insufficient privileges: {0}")]
    Permission(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("credential storage: {0}")]
    CredentialStorage(#[from] crate::credentials::CredentialError),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("{protocol} is not supported on {platform}")]
    UnsupportedPlatform { protocol: String, platform: String },

    #[error("operation not allowed while {0}")]
    InvalidState(ConnectionStatus),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VpnError {
    pub fn is_auth(&self) -> bool {
        matches!(self, VpnError::Authentication(_))
    }
}

pub type Result<T, E = VpnError> = std::result::Result<T, E>;
