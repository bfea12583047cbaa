//! Embedded exceptions and their host-side counterparts
//!
//! A failing call leaves its exception in the interpreter's error slot. pyo3
//! turns that slot into a `PyErr` right after each foreign call; this module
//! captures it as an [`ExceptionInfo`], offers it to the callable's
//! `__exit__` hook, and otherwise converts it into a host [`Error`] after the
//! interpreter has printed its traceback.
//!
//! The interpreter buffers `sys.stdout`/`sys.stderr` when they are not a
//! terminal, so every conversion flushes both streams before the host error
//! is returned.

use pyo3::exceptions::PySystemExit;
use pyo3::prelude::*;
use pyo3::types::PyTraceback;

use pyflow_core::metrics::CustomMetric;
use pyflow_core::{Error, Result};

use crate::callable::StageCallable;

/// Used when the exception value cannot be turned into text
pub const UNKNOWN_ERROR: &str = "Unknown Python error";

/// An exception captured from the interpreter together with where it happened
#[derive(Debug)]
pub struct ExceptionInfo {
    location: String,
    kind: String,
    message: String,
    err: PyErr,
}

impl ExceptionInfo {
    /// Take the pending exception, if any, clearing the error slot
    pub fn capture(py: Python<'_>, location: &str) -> Option<Self> {
        PyErr::take(py).map(|err| Self::from_err(py, err, location))
    }

    pub fn from_err(py: Python<'_>, err: PyErr, location: &str) -> Self {
        let kind = err
            .get_type(py)
            .qualname()
            .map(|name| name.to_string())
            .unwrap_or_else(|_| "Exception".to_string());
        let message = err
            .value(py)
            .str()
            .map(|text| text.to_string_lossy().into_owned())
            .unwrap_or_else(|_| UNKNOWN_ERROR.to_string());
        ExceptionInfo {
            location: location.to_string(),
            kind,
            message,
            err,
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Qualified name of the exception type
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_instance_of<T: pyo3::PyTypeInfo>(&self, py: Python<'_>) -> bool {
        self.err.is_instance_of::<T>(py)
    }

    /// Formatted traceback, when the exception carries one
    pub fn traceback(&self, py: Python<'_>) -> Option<String> {
        self.err.traceback(py).and_then(|tb| tb.format().ok())
    }

    /// `(type, value, traceback)` as passed to `__exit__`
    pub fn exit_args<'py>(&self, py: Python<'py>) -> (Bound<'py, PyAny>, Bound<'py, PyAny>, Bound<'py, PyAny>) {
        let tb = self
            .err
            .traceback(py)
            .map(Bound::<PyTraceback>::into_any)
            .unwrap_or_else(|| py.None().into_bound(py));
        (
            self.err.get_type(py).into_any(),
            self.err.value(py).clone().into_any(),
            tb,
        )
    }

    /// Let the interpreter print the traceback, then flush its output streams
    pub fn report(&self, py: Python<'_>) {
        tracing::error!(
            location = %self.location,
            kind = %self.kind,
            message = %self.message,
            "Python exception"
        );
        if self.err.is_instance_of::<PySystemExit>(py) {
            // printing a SystemExit terminates the process
            if let Some(tb) = self.traceback(py) {
                tracing::error!(location = %self.location, "{}", tb);
            }
        } else {
            self.err.print(py);
        }
        flush_diagnostics(py);
    }

    /// Host error for an exception raised by the callable
    pub fn into_host_error(self, py: Python<'_>) -> Error {
        self.report(py);
        Error::Application {
            location: self.location,
            kind: self.kind,
            message: self.message,
        }
    }

    /// Host error for a failure while constructing a stage
    pub fn into_setup_error(self, py: Python<'_>, what: &str) -> Error {
        self.report(py);
        Error::Setup(format!("{}: {}: {}", what, self.kind, self.message))
    }

    /// Host error for a failure while checkpointing or resetting
    pub fn into_checkpoint_error(self, py: Python<'_>, what: &str) -> Error {
        self.report(py);
        Error::Checkpoint(format!("{}: {}: {}", what, self.kind, self.message))
    }

    pub fn into_err(self) -> PyErr {
        self.err
    }
}

/// Flush `sys.stdout` and `sys.stderr`; failures are logged and ignored
pub fn flush_diagnostics(py: Python<'_>) {
    let sys = match py.import("sys") {
        Ok(sys) => sys,
        Err(err) => {
            tracing::debug!(error = %err, "sys unavailable for flush");
            return;
        }
    };
    for name in ["stdout", "stderr"] {
        match sys.getattr(name) {
            Ok(stream) if !stream.is_none() => {
                if let Err(err) = stream.call_method0("flush") {
                    tracing::debug!(stream = name, error = %err, "flush failed");
                }
            }
            _ => {}
        }
    }
}

/// Offer a captured exception to the callable's `__exit__` hook.
///
/// Returns `Ok(true)` when the hook returned a truthy value; the suppression
/// is counted in `suppressed`. Returns `Ok(false)` when there is no hook or it
/// declined. An exception raised by the hook itself replaces the original
/// and is returned as an application error.
pub fn offer_to_suppression_hook(
    py: Python<'_>,
    callable: &StageCallable,
    info: &ExceptionInfo,
    suppressed: &CustomMetric,
) -> Result<bool> {
    if !callable.capabilities().exit {
        return Ok(false);
    }
    match callable.exit_with(py, info) {
        Ok(true) => {
            let total = suppressed.increment(1)?;
            tracing::debug!(
                location = %info.location,
                kind = %info.kind,
                suppressed = total,
                "Exception suppressed by __exit__"
            );
            Ok(true)
        }
        Ok(false) => Ok(false),
        Err(hook_err) => {
            let hook_info = ExceptionInfo::from_err(py, hook_err, "__exit__");
            Err(hook_info.into_host_error(py))
        }
    }
}
