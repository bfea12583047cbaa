//! PyFlow Python: embedded CPython stages
//!
//! Runs user-supplied Python callables as pipeline stages inside the host
//! process:
//! - [`lock`]: scoped access to the interpreter lock
//! - [`runtime`]: starting and preparing the process-wide interpreter
//! - [`marshal`]: converting typed values to and from embedded objects
//! - [`exception`]: capturing embedded exceptions and the `__exit__` hook
//! - [`invoke`]: calling a callable per stage kind
//! - [`checkpoint`]: serializing callables for checkpoint and reset
//! - [`context`]: the `pyflow_ec` module seen by embedded code
//! - [`stage`]: [`PythonStage`], which ties these together
//! - [`node`]: an async [`pyflow_core::StageExecutor`] over a stage

#![warn(clippy::all)]

pub mod callable;
pub mod checkpoint;
pub mod context;
pub mod exception;
pub mod invoke;
pub mod lock;
pub mod marshal;
pub mod node;
pub mod runtime;
pub mod stage;

pub use checkpoint::CheckpointState;
pub use invoke::SourcePoll;
pub use lock::with_lock;
pub use node::PythonStageNode;
pub use runtime::ensure_started;
pub use stage::{PythonStage, StageBuilder};
