//! Error types for Filegate
//!
//! One error enum covers both halves of the protocol. The variants follow
//! the failure classes a caller has to tell apart: local validation,
//! transport, authentication, authorization, remote application errors and
//! protocol integrity.

use crate::protocol::RemoteErrorKind;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Filegate operations
#[derive(Error, Debug)]
pub enum FilegateError {
    /// I/O error during local file operations
    #[error("I/O error at '{path}': {source}")]
    Io {
        /// File or directory involved, empty when unknown
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Local file or directory not found
    #[error("Path not found: {0}")]
    NotFound(PathBuf),

    /// A required argument was missing or malformed; never sent over the wire
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The server URL could not be parsed
    #[error("Invalid URL '{url}': {message}")]
    InvalidUrl {
        /// URL as given
        url: String,
        /// Why it was rejected
        message: String,
    },

    /// Host unreachable, TLS failure, broken connection
    #[error("Connection error to '{url}': {message}")]
    ConnectionError {
        /// Server URL
        url: String,
        /// Transport error text
        message: String,
    },

    /// The server answered with something other than 200
    #[error("HTTP status {status} from '{url}'")]
    HttpStatus {
        /// Server URL
        url: String,
        /// Status code received
        status: u16,
    },

    /// Login refused
    #[error("Authentication failed for '{user}': {message}")]
    AuthenticationError {
        /// Username presented
        user: String,
        /// Reason
        message: String,
    },

    /// Token rejected, or the session was logged off
    #[error("Session closed: login again to continue")]
    SessionClosed,

    /// The server demands a secure transport and the URL is not https
    #[error("Insecure transport refused for '{0}': the server requires https")]
    InsecureTransport(String),

    /// A remote call was refused by the server's call policy
    #[error("Not authorized to call '{method}'")]
    NotAuthorized {
        /// Method name
        method: String,
    },

    /// Error raised by server-side code, reconstructed from the error record
    #[error("Remote {kind} error: {message}")]
    Remote {
        /// Failure class reported by the server
        kind: RemoteErrorKind,
        /// Server message
        message: String,
        /// Server-side error chain, when the server exposes it
        remote_trace: Option<String>,
    },

    /// Security violation detected locally or reported by the server
    #[error("Security error: {0}")]
    SecurityError(String),

    /// Configuration error (including mismatched encryption passwords)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Parameter encryption or decryption failed
    #[error("Encryption error: {0}")]
    CryptoError(String),

    /// Unexpected response shape; always a framework bug
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Operation cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        /// What was being done
        context: String,
        /// Wrapped error
        #[source]
        source: Box<FilegateError>,
    },
}

impl FilegateError {
    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a connection error
    pub fn connection(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionError {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create an authentication error
    pub fn auth(user: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AuthenticationError {
            user: user.into(),
            message: message.into(),
        }
    }

    /// Create a local validation error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create a protocol integrity error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolError(message.into())
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Strip any `WithContext` layers
    pub fn root(&self) -> &FilegateError {
        match self {
            Self::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this is a connectivity/availability failure
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self.root(),
            Self::ConnectionError { .. } | Self::HttpStatus { .. }
        )
    }

    /// Check if an interrupted chunked transfer may pick up where it stopped
    ///
    /// Authentication and authorization failures are terminal.
    pub fn is_resumable(&self) -> bool {
        self.is_transport_error() || matches!(self.root(), Self::Cancelled)
    }

    /// Check if this error comes from the authentication layer
    pub fn is_authentication_error(&self) -> bool {
        matches!(
            self.root(),
            Self::AuthenticationError { .. } | Self::SessionClosed | Self::InsecureTransport(_)
        )
    }

    /// Get the path associated with this error, if any
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Io { path, .. } | Self::NotFound(path) => Some(path),
            Self::WithContext { source, .. } => source.path(),
            _ => None,
        }
    }
}

/// Result type alias for Filegate operations
pub type Result<T> = std::result::Result<T, FilegateError>;

impl From<std::io::Error> for FilegateError {
    fn from(err: std::io::Error) -> Self {
        FilegateError::Io {
            path: PathBuf::new(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for FilegateError {
    fn from(err: serde_json::Error) -> Self {
        FilegateError::ProtocolError(err.to_string())
    }
}

/// Extension trait for adding path context to std::io::Result
pub trait IoResultExt<T> {
    /// Add path context to an I/O error
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| FilegateError::io(path, e))
    }
}
