//! Error types and transport-error classification.
//!
//! The driver's error taxonomy has churned across releases, so every place
//! that needs to make a control-flow decision on a driver error goes through
//! [`categorize`] and the predicates built on it. No other module inspects
//! `mongodb::error::ErrorKind` directly.

use thiserror::Error;

/// Result type alias for lifecycle operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types surfaced by connection bootstrap and the collection cache
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or contradictory configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Server version outside the supported range
    #[error("Unsupported server version at {url}: found {actual}, required {required}")]
    Version {
        url: String,
        actual: String,
        required: String,
    },

    /// Connection, authentication, or administrative failure wrapping the
    /// underlying driver error. The URL is always credential-stripped.
    #[error("{context} ({url}): {source}")]
    Operation {
        context: String,
        url: String,
        #[source]
        source: mongodb::error::Error,
    },

    /// Authentication was rejected while interactive admin setup is
    /// permitted; the bootstrap layer decides whether to prompt and retry.
    #[error("Authentication rejected at {url}; admin setup required")]
    AdminSetupRequired { url: String },

    /// Invalid argument to a utility function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    pub(crate) fn operation(
        context: impl Into<String>,
        url: impl Into<String>,
        source: mongodb::error::Error,
    ) -> Self {
        Error::Operation {
            context: context.into(),
            url: url.into(),
            source,
        }
    }
}

/// Semantic categories for driver errors.
///
/// Produced at the transport-adapter boundary so the rest of the crate never
/// pattern-matches on loosely shaped driver internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Namespace or resource already exists (absorbed during setup)
    AlreadyExists,
    /// Unique-index violation, on initial insert or on update
    DuplicateKey,
    /// The server refused an operation for lack of privileges
    Unauthorized,
    /// Credential handshake failed
    AuthenticationFailed,
    /// Network, selection, or pool level failure
    Transport,
    /// Anything else
    Other,
}

/// Duplicate key on initial insert
const CODE_DUPLICATE_KEY: i32 = 11000;
/// Duplicate key raised while applying an update
const CODE_DUPLICATE_KEY_ON_UPDATE: i32 = 11001;
/// Operation requires privileges the connection does not hold
const CODE_UNAUTHORIZED: i32 = 13;
/// Credential handshake rejected by the server
const CODE_AUTHENTICATION_FAILED: i32 = 18;
/// Namespace already exists
const CODE_NAMESPACE_EXISTS: i32 = 48;

const ALREADY_EXISTS_MARKER: &str = "already exists";

/// Classify a driver error into a semantic category.
pub fn categorize(err: &mongodb::error::Error) -> ErrorCategory {
    use mongodb::error::{ErrorKind, WriteFailure};

    match err.kind.as_ref() {
        ErrorKind::Command(command) => categorize_command(command.code, &command.message),
        ErrorKind::Write(WriteFailure::WriteError(write)) => {
            categorize_command(write.code, &write.message)
        }
        ErrorKind::Authentication { .. } => ErrorCategory::AuthenticationFailed,
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::DnsResolve { .. } => ErrorCategory::Transport,
        _ => ErrorCategory::Other,
    }
}

/// Category for a server-reported error code plus message.
///
/// Split out from [`categorize`] so the code table stays testable without
/// constructing driver error values.
pub(crate) fn categorize_command(code: i32, message: &str) -> ErrorCategory {
    match code {
        CODE_DUPLICATE_KEY | CODE_DUPLICATE_KEY_ON_UPDATE => ErrorCategory::DuplicateKey,
        CODE_UNAUTHORIZED => ErrorCategory::Unauthorized,
        CODE_AUTHENTICATION_FAILED => ErrorCategory::AuthenticationFailed,
        CODE_NAMESPACE_EXISTS => ErrorCategory::AlreadyExists,
        _ if message.contains(ALREADY_EXISTS_MARKER) => ErrorCategory::AlreadyExists,
        _ => ErrorCategory::Other,
    }
}

/// True when the error reports that the target resource already exists.
pub fn is_already_exists(err: &mongodb::error::Error) -> bool {
    categorize(err) == ErrorCategory::AlreadyExists
}

/// True for unique-index violations, whether raised on the initial insert
/// or when an update collides with an existing key.
pub fn is_duplicate_error(err: &mongodb::error::Error) -> bool {
    categorize(err) == ErrorCategory::DuplicateKey
}

/// True when the server rejected the supplied credentials.
pub fn is_authentication_error(err: &mongodb::error::Error) -> bool {
    categorize(err) == ErrorCategory::AuthenticationFailed
}

/// True when the error originated in the database transport rather than in
/// local argument handling or serialization.
pub fn is_database_error(err: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;

    matches!(
        err.kind.as_ref(),
        ErrorKind::Command(_)
            | ErrorKind::Write(_)
            | ErrorKind::Authentication { .. }
            | ErrorKind::Io(_)
            | ErrorKind::ServerSelection { .. }
            | ErrorKind::ConnectionPoolCleared { .. }
    )
}
