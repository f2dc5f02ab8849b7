//! Error types for the replication and command core.
//!
//! Command failures carry one of the stable numeric codes that clients key
//! on (`Response.errorCode`). The codes never change meaning across
//! releases; new failure modes get new codes.

use std::time::Duration;
use thiserror::Error;

/// Stable error codes surfaced in command responses.
///
/// `IdempotentReplay` is informational: the response status stays `OK`, the
/// code merely tells the caller it received a cached reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum ErrorCode {
    InvalidRequest,
    Timeout,
    NotFound,
    PayloadTooLarge,
    RangeOverflow,
    InvalidType,
    IdempotentReplay,
    InternalError,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::InvalidRequest => 100,
            ErrorCode::Timeout => 101,
            ErrorCode::NotFound => 102,
            ErrorCode::PayloadTooLarge => 103,
            ErrorCode::RangeOverflow => 104,
            ErrorCode::InvalidType => 105,
            ErrorCode::IdempotentReplay => 110,
            ErrorCode::InternalError => 199,
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        code.as_u16()
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(raw: u16) -> Result<Self, String> {
        match raw {
            100 => Ok(ErrorCode::InvalidRequest),
            101 => Ok(ErrorCode::Timeout),
            102 => Ok(ErrorCode::NotFound),
            103 => Ok(ErrorCode::PayloadTooLarge),
            104 => Ok(ErrorCode::RangeOverflow),
            105 => Ok(ErrorCode::InvalidType),
            110 => Ok(ErrorCode::IdempotentReplay),
            199 => Ok(ErrorCode::InternalError),
            other => Err(format!("unknown error code: {}", other)),
        }
    }
}

/// Failures raised while processing a client command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Malformed command, missing field, or bad UTF-8.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No response received within the request window.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// GET on a missing or tombstoned key.
    #[error("key not found")]
    NotFound,

    /// Key, value, or total payload exceeds a configured limit.
    #[error("payload too large: {actual} bytes (limit {limit})")]
    PayloadTooLarge { actual: usize, limit: usize },

    /// Numeric operation exceeds the signed 64-bit range.
    #[error("numeric overflow")]
    RangeOverflow,

    /// Existing value is not a valid integer for INCR/DECR.
    #[error("value is not a valid integer")]
    InvalidType,

    /// Storage or transport failure surfaced to the caller.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CommandError {
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        CommandError::InvalidRequest(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        CommandError::Internal(msg.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            CommandError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            CommandError::Timeout(_) => ErrorCode::Timeout,
            CommandError::NotFound => ErrorCode::NotFound,
            CommandError::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            CommandError::RangeOverflow => ErrorCode::RangeOverflow,
            CommandError::InvalidType => ErrorCode::InvalidType,
            CommandError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

/// Failures raised by the event codec.
///
/// Oversize payloads are rejected at encode time so they can never reach the
/// outbox; malformed inbound bytes are rejected at decode time without
/// disturbing the rest of the inbound stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload too large: {actual} bytes (limit {limit})")]
    PayloadTooLarge { actual: usize, limit: usize },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Failures raised by the pub/sub transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport offline")]
    Offline,

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
}
