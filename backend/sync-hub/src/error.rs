use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("delivery request failed: {0}")]
    Delivery(#[from] reqwest::Error),

    #[error("delivery rejected with status {0}")]
    DeliveryStatus(u16),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection to {0} is closed")]
    ConnectionClosed(SocketAddr),

    #[error("registration with {0} was not acknowledged")]
    RegistrationUnacknowledged(SocketAddr),
}

impl AppError {
    pub fn bind(addr: impl Into<String>, source: std::io::Error) -> Self {
        AppError::Bind {
            addr: addr.into(),
            source,
        }
    }
}
