//! Error types for the lanwatch-discover crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoverError {
    #[error("No IPv4 network interface found")]
    NoIpv4Interface,

    #[error("{what} is not supported on this platform")]
    Unsupported { what: String },

    #[error("Failed to parse neighbor table: {0}")]
    CacheParse(String),

    #[error("Failed to encode {protocol} query: {reason}")]
    Encode {
        protocol: &'static str,
        reason: String,
    },

    #[error("Malformed {protocol} packet: {reason}")]
    Decode {
        protocol: &'static str,
        reason: String,
    },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid value: {0}")]
    Core(#[from] lanwatch_core::LanwatchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DiscoverError>;
