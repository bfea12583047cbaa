//! Error types for PyFlow stages

use thiserror::Error;

/// Result type alias for PyFlow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by a stage to the host pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Stage construction failed (runtime, setup script, callable lookup,
    /// checkpoint verification)
    #[error("Setup error: {0}")]
    Setup(String),

    /// A value could not be carried across the host/embedded boundary
    #[error("Data conversion error: {0}")]
    Conversion(#[from] ConversionError),

    /// Raised by the embedded callable itself and not suppressed
    #[error("Python error in {location}: {kind}: {message}")]
    Application {
        /// Call site that was executing
        location: String,
        /// Qualified name of the embedded exception type
        kind: String,
        /// `str()` of the exception value
        message: String,
    },

    /// Checkpoint or reset failed
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Execution context misuse (no stage active, unknown port, ...)
    #[error("Context error: {0}")]
    Context(String),

    /// The stage was shut down
    #[error("Stage '{0}' is shut down")]
    StageClosed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Recovery class of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Terminates the stage
    Fatal,
    /// Marshaling failed; the host decides whether to drop the record
    DataConversion,
    /// The callable raised
    Application,
    /// Checkpoint/reset failure, always terminal
    Checkpoint,
    /// Host-side plumbing (I/O, config, context)
    Host,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Setup(_) | Error::StageClosed(_) => ErrorCategory::Fatal,
            Error::Conversion(_) => ErrorCategory::DataConversion,
            Error::Application { .. } => ErrorCategory::Application,
            Error::Checkpoint(_) => ErrorCategory::Checkpoint,
            Error::ConfigError(_)
            | Error::Context(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Other(_) => ErrorCategory::Host,
        }
    }

    /// Setup and checkpoint failures leave the stage unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Fatal | ErrorCategory::Checkpoint
        )
    }

    pub fn is_conversion(&self) -> bool {
        matches!(self, Error::Conversion(_))
    }

    pub fn is_application(&self) -> bool {
        matches!(self, Error::Application { .. })
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::ConfigError(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Checkpoint(format!("checkpoint record encoding: {}", err))
    }
}

/// Failure to produce a value on one side of the boundary from the other
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("value {value} out of range for {target}")]
    OutOfRange { target: String, value: String },

    #[error("invalid text encoding: {0}")]
    InvalidEncoding(String),

    #[error("invalid decimal: {0}")]
    InvalidDecimal(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("unhashable element in {0}")]
    Unhashable(String),

    #[error("missing value for non-optional {0}")]
    MissingValue(String),

    /// The embedded runtime raised while converting
    #[error("{0}")]
    Embedded(String),

    #[error("embedded runtime is not started")]
    RuntimeUnavailable,
}

impl ConversionError {
    pub fn mismatch(expected: impl ToString, found: impl ToString) -> Self {
        ConversionError::TypeMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    pub fn out_of_range(target: impl ToString, value: impl ToString) -> Self {
        ConversionError::OutOfRange {
            target: target.to_string(),
            value: value.to_string(),
        }
    }
}
