//! Serializing stage callables for checkpoint and restore
//!
//! Each stage owns a [`Checkpointer`] with three states:
//!
//! - `Unchecked`: checkpointing is off, or the callable is stateless.
//!   Checkpoint and reset do nothing.
//! - `Verified`: the callable serialized at setup; those bytes are kept as the
//!   initial snapshot.
//! - `Disabled`: serialization failed at setup and `__exit__` suppressed the
//!   error; the stage runs without checkpoint support.
//!
//! A serialization failure at setup that is not suppressed aborts stage
//! construction. Failures while checkpointing or restoring are always
//! [`Error::Checkpoint`].

use std::fmt;

use pyo3::exceptions::PyTypeError;
use pyo3::prelude::*;
use pyo3::types::PyBytes;

use pyflow_core::metrics::CustomMetric;
use pyflow_core::{Error, Result};

use crate::callable::StageCallable;
use crate::exception::{offer_to_suppression_hook, ExceptionInfo};
use crate::runtime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    Unchecked,
    Verified,
    Disabled,
}

impl fmt::Display for CheckpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CheckpointState::Unchecked => "unchecked",
            CheckpointState::Verified => "verified",
            CheckpointState::Disabled => "disabled",
        })
    }
}

/// A module exposing `dumps(obj) -> bytes` and `loads(bytes) -> obj`
#[derive(Debug)]
pub struct Serializer {
    module: Py<PyAny>,
    name: String,
}

impl Serializer {
    /// Import `preferred`, falling back to `pickle` when it is not installed
    pub fn load(py: Python<'_>, preferred: &str) -> Result<Self> {
        let module = runtime::helpers()?
            .serializer
            .call1(py, (preferred,))
            .map_err(|e| ExceptionInfo::from_err(py, e, "serializer").into_setup_error(py, "serializer"))?;
        let name: String = module
            .getattr(py, "__name__")
            .and_then(|n| n.extract(py))
            .unwrap_or_else(|_| preferred.to_string());
        if name != preferred {
            tracing::info!(preferred, using = %name, "Serializer module not available, falling back");
        }
        Ok(Serializer { module, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bind<'py>(&self, py: Python<'py>) -> &Bound<'py, PyAny> {
        self.module.bind(py)
    }

    pub fn dumps(&self, py: Python<'_>, object: &Bound<'_, PyAny>) -> std::result::Result<Vec<u8>, ExceptionInfo> {
        let dumped = self
            .bind(py)
            .call_method1("dumps", (object,))
            .map_err(|e| ExceptionInfo::from_err(py, e, "dumps"))?;
        match dumped.downcast::<PyBytes>() {
            Ok(bytes) => Ok(bytes.as_bytes().to_vec()),
            Err(_) => Err(ExceptionInfo::from_err(
                py,
                PyTypeError::new_err(format!("{}.dumps did not return bytes", self.name)),
                "dumps",
            )),
        }
    }

    pub fn loads<'py>(&self, py: Python<'py>, data: &[u8]) -> std::result::Result<Bound<'py, PyAny>, ExceptionInfo> {
        self.bind(py)
            .call_method1("loads", (PyBytes::new(py, data),))
            .map_err(|e| ExceptionInfo::from_err(py, e, "loads"))
    }
}

/// Checkpoint state of one stage
#[derive(Debug)]
pub struct Checkpointer {
    state: CheckpointState,
    enabled: bool,
    initial: Option<Vec<u8>>,
    serializer: Serializer,
}

impl Checkpointer {
    pub fn new(serializer: Serializer, enabled: bool) -> Self {
        Checkpointer {
            state: CheckpointState::Unchecked,
            enabled,
            initial: None,
            serializer,
        }
    }

    pub fn state(&self) -> CheckpointState {
        self.state
    }

    pub fn serializer(&self) -> &Serializer {
        &self.serializer
    }

    /// Bytes of the callable as it was after setup
    pub fn initial(&self) -> Option<&[u8]> {
        self.initial.as_deref()
    }

    /// Check at setup that the callable can be serialized.
    ///
    /// When verification fails unsuppressed the callable is exited before the
    /// setup error is returned.
    pub fn verify(
        &mut self,
        py: Python<'_>,
        callable: &mut StageCallable,
        suppressed: &CustomMetric,
        stage: &str,
    ) -> Result<()> {
        if !self.enabled || !callable.capabilities().stateful {
            tracing::debug!(stage, enabled = self.enabled, "Checkpointing not applicable");
            return Ok(());
        }

        let failure = match self.serializer.dumps(py, callable.target(py)) {
            Ok(bytes) => {
                tracing::debug!(stage, bytes = bytes.len(), serializer = %self.serializer.name, "Checkpoint verified");
                self.initial = Some(bytes);
                self.state = CheckpointState::Verified;
                return Ok(());
            }
            Err(info) => info,
        };

        let outcome = offer_to_suppression_hook(py, callable, &failure, suppressed);
        match outcome {
            Ok(true) => {
                tracing::warn!(
                    stage,
                    kind = failure.kind(),
                    message = failure.message(),
                    "Callable cannot be serialized; checkpointing disabled"
                );
                self.state = CheckpointState::Disabled;
                Ok(())
            }
            Ok(false) => {
                let err = failure.into_setup_error(py, &format!("stage '{}' checkpoint verification", stage));
                release_after_failure(py, callable, stage);
                Err(err)
            }
            Err(err) => {
                release_after_failure(py, callable, stage);
                Err(err)
            }
        }
    }

    /// Serialize the current callable; `None` unless verified
    pub fn snapshot(&self, py: Python<'_>, callable: &StageCallable) -> Result<Option<Vec<u8>>> {
        if self.state != CheckpointState::Verified {
            return Ok(None);
        }
        self.serializer
            .dumps(py, callable.target(py))
            .map(Some)
            .map_err(|info| info.into_checkpoint_error(py, "checkpoint"))
    }

    /// Rebuild a callable from checkpoint bytes
    pub fn restore<'py>(&self, py: Python<'py>, data: &[u8]) -> Result<Bound<'py, PyAny>> {
        self.serializer
            .loads(py, data)
            .map_err(|info| info.into_checkpoint_error(py, "restore"))
    }
}

fn release_after_failure(py: Python<'_>, callable: &mut StageCallable, stage: &str) {
    if let Err(err) = callable.exit(py) {
        let info = ExceptionInfo::from_err(py, err, stage);
        info.report(py);
    }
}

/// Any failure during checkpoint or reset, as a checkpoint error
pub(crate) fn checkpoint_failure(err: Error) -> Error {
    match err {
        Error::Checkpoint(_) => err,
        other => Error::Checkpoint(other.to_string()),
    }
}
