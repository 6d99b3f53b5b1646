use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether a repeated attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Timeout(_) | BridgeError::Io(_) | BridgeError::OperationFailed(_) => true,
            BridgeError::Status(status) => *status == 429 || *status >= 500,
            BridgeError::NotAvailable(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
