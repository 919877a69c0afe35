// src/core/errors.rs

//! Defines the primary error type for the entire controller.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the controller.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum HelmsmanError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Agent failed with rc {rc}: {output}")]
    AgentFailure { rc: i32, output: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Bad configuration: {0}")]
    BadConfig(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Unknown fencing device '{0}'")]
    UnknownDevice(String),

    #[error("No fencing device is capable of fencing '{0}'")]
    NoneAvailable(String),

    #[error("Insufficient privileges")]
    InsufficientPriv,

    #[error("Subsystem unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown resource '{0}'")]
    UnknownResource(String),

    #[error("Command not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Operation already in progress: {0}")]
    InProgress(String),

    #[error("Stale transition key (graph {0})")]
    StaleTransition(u64),

    #[error("Internal Controller Error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for HelmsmanError {
    fn clone(&self) -> Self {
        match self {
            HelmsmanError::Io(e) => HelmsmanError::Io(Arc::clone(e)),
            HelmsmanError::Protocol(s) => HelmsmanError::Protocol(s.clone()),
            HelmsmanError::Timeout(ms) => HelmsmanError::Timeout(*ms),
            HelmsmanError::NotConnected(s) => HelmsmanError::NotConnected(s.clone()),
            HelmsmanError::AgentFailure { rc, output } => HelmsmanError::AgentFailure {
                rc: *rc,
                output: output.clone(),
            },
            HelmsmanError::Cancelled => HelmsmanError::Cancelled,
            HelmsmanError::BadConfig(s) => HelmsmanError::BadConfig(s.clone()),
            HelmsmanError::PeerUnreachable(s) => HelmsmanError::PeerUnreachable(s.clone()),
            HelmsmanError::UnknownDevice(s) => HelmsmanError::UnknownDevice(s.clone()),
            HelmsmanError::NoneAvailable(s) => HelmsmanError::NoneAvailable(s.clone()),
            HelmsmanError::InsufficientPriv => HelmsmanError::InsufficientPriv,
            HelmsmanError::Unavailable(s) => HelmsmanError::Unavailable(s.clone()),
            HelmsmanError::UnknownResource(s) => HelmsmanError::UnknownResource(s.clone()),
            HelmsmanError::InvalidState(s) => HelmsmanError::InvalidState(s.clone()),
            HelmsmanError::InvalidRequest(s) => HelmsmanError::InvalidRequest(s.clone()),
            HelmsmanError::InProgress(s) => HelmsmanError::InProgress(s.clone()),
            HelmsmanError::StaleTransition(id) => HelmsmanError::StaleTransition(*id),
            HelmsmanError::Internal(s) => HelmsmanError::Internal(s.clone()),
        }
    }
}

impl PartialEq for HelmsmanError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HelmsmanError::Io(e1), HelmsmanError::Io(e2)) => e1.to_string() == e2.to_string(),
            (HelmsmanError::Protocol(s1), HelmsmanError::Protocol(s2)) => s1 == s2,
            (HelmsmanError::Timeout(a), HelmsmanError::Timeout(b)) => a == b,
            (HelmsmanError::NotConnected(s1), HelmsmanError::NotConnected(s2)) => s1 == s2,
            (
                HelmsmanError::AgentFailure { rc: r1, output: o1 },
                HelmsmanError::AgentFailure { rc: r2, output: o2 },
            ) => r1 == r2 && o1 == o2,
            (HelmsmanError::BadConfig(s1), HelmsmanError::BadConfig(s2)) => s1 == s2,
            (HelmsmanError::PeerUnreachable(s1), HelmsmanError::PeerUnreachable(s2)) => s1 == s2,
            (HelmsmanError::UnknownDevice(s1), HelmsmanError::UnknownDevice(s2)) => s1 == s2,
            (HelmsmanError::NoneAvailable(s1), HelmsmanError::NoneAvailable(s2)) => s1 == s2,
            (HelmsmanError::Unavailable(s1), HelmsmanError::Unavailable(s2)) => s1 == s2,
            (HelmsmanError::UnknownResource(s1), HelmsmanError::UnknownResource(s2)) => s1 == s2,
            (HelmsmanError::InvalidState(s1), HelmsmanError::InvalidState(s2)) => s1 == s2,
            (HelmsmanError::InvalidRequest(s1), HelmsmanError::InvalidRequest(s2)) => s1 == s2,
            (HelmsmanError::InProgress(s1), HelmsmanError::InProgress(s2)) => s1 == s2,
            (HelmsmanError::StaleTransition(a), HelmsmanError::StaleTransition(b)) => a == b,
            (HelmsmanError::Internal(s1), HelmsmanError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for HelmsmanError {
    fn from(e: std::io::Error) -> Self {
        HelmsmanError::Io(Arc::new(e))
    }
}

impl From<uuid::Error> for HelmsmanError {
    fn from(e: uuid::Error) -> Self {
        HelmsmanError::Protocol(format!("Malformed UUID: {e}"))
    }
}

impl From<std::str::Utf8Error> for HelmsmanError {
    fn from(e: std::str::Utf8Error) -> Self {
        HelmsmanError::Protocol(format!("Invalid UTF-8 payload: {e}"))
    }
}

impl From<std::string::FromUtf8Error> for HelmsmanError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        HelmsmanError::Protocol(format!("Invalid UTF-8 payload: {e}"))
    }
}

impl From<std::num::ParseIntError> for HelmsmanError {
    fn from(e: std::num::ParseIntError) -> Self {
        HelmsmanError::Protocol(format!("Expected an integer field: {e}"))
    }
}

impl From<serde_json::Error> for HelmsmanError {
    fn from(e: serde_json::Error) -> Self {
        HelmsmanError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<bincode::error::EncodeError> for HelmsmanError {
    fn from(e: bincode::error::EncodeError) -> Self {
        HelmsmanError::Protocol(format!("Frame encode error: {e}"))
    }
}

impl From<bincode::error::DecodeError> for HelmsmanError {
    fn from(e: bincode::error::DecodeError) -> Self {
        HelmsmanError::Protocol(format!("Frame decode error: {e}"))
    }
}
