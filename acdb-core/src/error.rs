//! # Error Handling
//!
//! Error taxonomy for calibration database operations.
//!
//! ## Categories
//!
//! 1. **Lookup misses** (`NotExist`): normal control flow between layers,
//!    e.g. "try the heap, then the file". Never logged as an error below the
//!    top-most caller.
//! 2. **Contract violations** (`BadParam`): never retried.
//! 3. **Size protocol** (`NeedMore`): the caller's buffer is too small; the
//!    error carries the required size for the second call.
//! 4. **Resource failures** (`OutOfMemory`, `ResourceExhausted`): surfaced
//!    immediately, nothing partially committed.
//! 5. **Corruption** (`Corrupt`): a database invariant does not hold.
//!    Propagated, never silently recovered.

use thiserror::Error;

/// Result type alias for calibration database operations
pub type Result<T> = std::result::Result<T, Error>;

/// Primary error type
#[derive(Error, Debug)]
pub enum Error {
    // Lookup
    #[error("Not found: {what}")]
    NotExist { what: String },

    #[error("Invalid parameter: {message}")]
    BadParam { message: String },

    #[error("Buffer too small: {required} bytes required, {provided} provided")]
    NeedMore { required: usize, provided: usize },

    // Resources
    #[error("Allocation failed: {context}")]
    OutOfMemory { context: String },

    #[error("Resource exhausted: {resource}")]
    ResourceExhausted { resource: String },

    // Data integrity
    #[error("Database corruption detected: {details}")]
    Corrupt { details: String },

    // System
    #[error("IO error: {message}")]
    Io { message: String, source: std::io::Error },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl Error {
    pub fn not_exist(what: impl Into<String>) -> Self {
        Error::NotExist { what: what.into() }
    }

    pub fn bad_param(message: impl Into<String>) -> Self {
        Error::BadParam { message: message.into() }
    }

    pub fn corrupt(details: impl Into<String>) -> Self {
        Error::Corrupt { details: details.into() }
    }

    /// True for lookup misses
    pub fn is_not_exist(&self) -> bool {
        matches!(self, Error::NotExist { .. })
    }

    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::NotExist { .. } => true,
            Error::NeedMore { .. } => true,
            Error::ResourceExhausted { .. } => true,
            Error::BadParam { .. } => false,
            Error::Corrupt { .. } => false,
            Error::Io { .. } => false,
            _ => true,
        }
    }

    /// Get error code for monitoring
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::NotExist { .. } => "NOT_EXIST",
            Error::BadParam { .. } => "BADPARAM",
            Error::NeedMore { .. } => "NEED_MORE",
            Error::OutOfMemory { .. } => "ENOMEMORY",
            Error::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            Error::Corrupt { .. } => "EFAILED",
            Error::Io { .. } => "IO_ERROR",
            Error::Serialization { .. } => "SERIALIZATION_ERROR",
            Error::Configuration { .. } => "CONFIG_ERROR",
        }
    }
}

// Conversion from std::io::Error
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(err: std::collections::TryReserveError) -> Self {
        Error::OutOfMemory {
            context: err.to_string(),
        }
    }
}

/// Extension trait turning lookup misses into `None`
///
/// Used where a miss selects a fallback path rather than ending the call.
pub trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for Result<T> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(Error::NotExist { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Extension trait for adding context to results
pub trait ResultExt<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| match e {
            // Misses and size answers keep their kind so callers can branch on them
            Error::NotExist { what } => Error::NotExist {
                what: format!("{}: {}", f(), what),
            },
            Error::NeedMore { .. } => e,
            Error::Corrupt { details } => Error::Corrupt {
                details: format!("{}: {}", f(), details),
            },
            other => other,
        })
    }
}
