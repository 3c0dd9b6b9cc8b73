//! Error types for Tandem Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Remote description rejected: {0}")]
    Apply(String),

    #[error("Cannot add remote candidate: {0}")]
    Candidate(String),

    #[error("Cannot produce local description: {0}")]
    Description(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Negotiation failed after {attempts} consecutive resets")]
    ResetLimitExceeded { attempts: u32 },

    #[error("Transfer stalled on channel '{label}' after {received} bytes")]
    TransferStalled { label: String, received: u64 },

    #[error("Transfer overflow: received {received} bytes, expected {expected}")]
    TransferOverflow { received: u64, expected: u64 },

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
