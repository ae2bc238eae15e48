use thiserror::Error;

/// Top-level error type for lanwatch domain values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LanwatchError {
    #[error("Invalid IP address: {0:?}")]
    InvalidIp(String),

    #[error("Invalid MAC address: {0:?}")]
    InvalidMac(String),
}

pub type Result<T> = std::result::Result<T, LanwatchError>;
