//! PyFlow core: the host side of embedded Python stages
//!
//! This crate has no dependency on the embedded runtime. It defines:
//! - [`value`]: the typed record model ([`TypedValue`], [`ValueType`])
//! - [`error`]: the error taxonomy shared by all stages
//! - [`checkpoint`]: the byte-oriented checkpoint storage boundary
//! - [`context`]: execution facts and services exposed to user code
//! - [`metrics`]: named custom metrics
//! - [`config`]: TOML configuration
//! - [`stage`]: stage kinds and the async executor trait

#![warn(clippy::all)]

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod stage;
pub mod value;

pub use error::{ConversionError, Error, ErrorCategory, Result};
pub use stage::{StageExecutor, StageInfo, StageKind};
pub use value::{TypedValue, ValueType};

/// Version of the PyFlow core
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
