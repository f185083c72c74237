/// Unified error handling for ruta
///
/// This module provides the error taxonomy shared by the pool, the monitors,
/// the topology and the operation executor, together with the rules that
/// classify a server reply into one of those errors.
use std::fmt;
use std::io;
use std::sync::Arc;

use aho_corasick::{AhoCorasick, MatchKind};
use bson::{Bson, Document};
use lazy_static::lazy_static;
use thiserror::Error;

pub use crate::config::ConfigError;
use crate::core::ServerAddress;
use crate::topology::TopologyDescription;

/// Main error type for ruta operations
#[derive(Debug, Clone, Error)]
pub enum RutaError {
    /// Transport failure on a connection
    #[error("Network error: {0}")]
    Network(Arc<io::Error>),

    /// The node is no longer (or not yet) a writable primary
    #[error("Not writable primary: {message}")]
    NotWritablePrimary { code: Option<i32>, message: String },

    /// The node is recovering or shutting down
    #[error("Node is recovering: {message}")]
    NodeIsRecovering { code: Option<i32>, message: String },

    /// No eligible node was found before the selection deadline
    #[error("Server selection timed out: {message}")]
    ServerSelectionTimeout {
        message: String,
        topology: Arc<TopologyDescription>,
    },

    /// The checkout wait queue timed out
    #[error("Connection pool for {address} exhausted after waiting {waited_ms}ms")]
    PoolExhausted { address: ServerAddress, waited_ms: u64 },

    /// The pool was closed while the caller waited or tried to check out
    #[error("Connection pool for {address} is closed")]
    PoolClosed { address: ServerAddress },

    /// Malformed or unexpected reply
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Any other server-reported command failure
    #[error("Command failed ({code_name} {code}): {message}")]
    Command {
        code: i32,
        code_name: String,
        message: String,
    },

    /// Caller supplied an invalid argument
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A node speaks a wire version outside the supported range
    #[error("Incompatible server: {message}")]
    Incompatible { message: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The client has been shut down
    #[error("Client has been shut down")]
    Shutdown,

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type alias for ruta operations
pub type RutaResult<T> = Result<T, RutaError>;

impl From<io::Error> for RutaError {
    fn from(error: io::Error) -> Self {
        RutaError::Network(Arc::new(error))
    }
}

impl From<bson::de::Error> for RutaError {
    fn from(error: bson::de::Error) -> Self {
        RutaError::Protocol(format!("invalid BSON: {}", error))
    }
}

impl From<bson::ser::Error> for RutaError {
    fn from(error: bson::ser::Error) -> Self {
        RutaError::Protocol(format!("cannot encode BSON: {}", error))
    }
}

/// Codes a node returns when it is not a writable primary
const NOT_WRITABLE_PRIMARY_CODES: &[i32] = &[10107, 13435, 10058];

/// Codes a node returns while recovering or shutting down
const RECOVERING_CODES: &[i32] = &[11600, 11602, 91, 189, 13436];

/// Codes a node returns while shutting down; these also clear the pool
const SHUTDOWN_CODES: &[i32] = &[11600, 91];

const RETRYABLE_READ_CODES: &[i32] = &[
    11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001,
];

const RETRYABLE_WRITE_CODES: &[i32] = &[
    11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 262,
];

/// Legacy error messages matched when a reply carries no code
const STATE_CHANGE_PATTERNS: &[&str] = &[
    "not master or secondary",
    "node is recovering",
    "not master",
];

lazy_static! {
    static ref STATE_CHANGE_FINDER: AhoCorasick = AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .match_kind(MatchKind::LeftmostLongest)
        .build(STATE_CHANGE_PATTERNS)
        .expect("Failed to create state change pattern finder");
}

/// Convenience methods for creating specific error types
impl RutaError {
    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        RutaError::Protocol(message.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        RutaError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        RutaError::Internal {
            message: message.into(),
        }
    }

    /// Create a network error from an error kind and message
    pub fn network<S: Into<String>>(kind: io::ErrorKind, message: S) -> Self {
        RutaError::Network(Arc::new(io::Error::new(kind, message.into())))
    }

    /// Classify a command reply. Returns `None` when the reply reports success.
    pub fn from_reply(reply: &Document) -> Option<Self> {
        if reply_ok(reply) {
            return None;
        }

        let code = reply.get("code").and_then(bson_as_i32);
        let message = reply.get_str("errmsg").unwrap_or("unknown error").to_string();
        let code_name = reply.get_str("codeName").unwrap_or("").to_string();

        if let Some(code) = code {
            if NOT_WRITABLE_PRIMARY_CODES.contains(&code) {
                return Some(RutaError::NotWritablePrimary {
                    code: Some(code),
                    message,
                });
            }
            if RECOVERING_CODES.contains(&code) {
                return Some(RutaError::NodeIsRecovering {
                    code: Some(code),
                    message,
                });
            }
            return Some(RutaError::Command {
                code,
                code_name,
                message,
            });
        }

        match STATE_CHANGE_FINDER.find(message.as_str()) {
            Some(mat) if mat.pattern().as_usize() == 2 => Some(RutaError::NotWritablePrimary {
                code: None,
                message,
            }),
            Some(_) => Some(RutaError::NodeIsRecovering {
                code: None,
                message,
            }),
            None => Some(RutaError::Command {
                code: 0,
                code_name,
                message,
            }),
        }
    }

    /// Server error code, if the error came from a reply
    pub fn code(&self) -> Option<i32> {
        match self {
            RutaError::NotWritablePrimary { code, .. } => *code,
            RutaError::NodeIsRecovering { code, .. } => *code,
            RutaError::Command { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, RutaError::Network(_))
    }

    /// Role mismatch at the node: not writable primary or recovering
    pub fn is_state_change(&self) -> bool {
        matches!(
            self,
            RutaError::NotWritablePrimary { .. } | RutaError::NodeIsRecovering { .. }
        )
    }

    /// State change errors caused by the node shutting down
    pub fn is_shutting_down(&self) -> bool {
        self.is_state_change() && self.code().is_some_and(|c| SHUTDOWN_CODES.contains(&c))
    }

    /// Whether the error should force the affected node back to Unknown
    pub fn invalidates_node(&self) -> bool {
        self.is_network() || self.is_state_change()
    }

    /// Whether a read may be retried once against a freshly selected node
    pub fn is_retryable_read(&self) -> bool {
        match self {
            RutaError::Network(_) => true,
            RutaError::NotWritablePrimary { .. } | RutaError::NodeIsRecovering { .. } => true,
            RutaError::Command { code, .. } => RETRYABLE_READ_CODES.contains(code),
            _ => false,
        }
    }

    /// Whether a write tagged retryable may be retried once
    pub fn is_retryable_write(&self) -> bool {
        match self {
            RutaError::Network(_) => true,
            RutaError::NotWritablePrimary { .. } | RutaError::NodeIsRecovering { .. } => true,
            RutaError::Command { code, .. } => RETRYABLE_WRITE_CODES.contains(code),
            _ => false,
        }
    }

    /// Check if this error is recoverable (can retry)
    pub fn is_retryable(&self) -> bool {
        self.is_retryable_read()
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RutaError::Config(_) => ErrorSeverity::Critical,
            RutaError::Internal { .. } => ErrorSeverity::Critical,
            RutaError::Incompatible { .. } => ErrorSeverity::Critical,
            RutaError::Network(_) => ErrorSeverity::Warning,
            RutaError::NotWritablePrimary { .. } => ErrorSeverity::Warning,
            RutaError::NodeIsRecovering { .. } => ErrorSeverity::Warning,
            RutaError::PoolExhausted { .. } => ErrorSeverity::Warning,
            RutaError::Shutdown => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Whether a reply document reports `ok: 1`
pub(crate) fn reply_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(Bson::Double(v)) => *v == 1.0,
        Some(Bson::Int32(v)) => *v == 1,
        Some(Bson::Int64(v)) => *v == 1,
        Some(Bson::Boolean(v)) => *v,
        _ => false,
    }
}

pub(crate) fn bson_as_i32(value: &Bson) -> Option<i32> {
    match value {
        Bson::Int32(v) => Some(*v),
        Bson::Int64(v) => i32::try_from(*v).ok(),
        Bson::Double(v) if v.fract() == 0.0 => Some(*v as i32),
        _ => None,
    }
}

pub(crate) fn bson_as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) if v.fract() == 0.0 => Some(*v as i64),
        _ => None,
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}
