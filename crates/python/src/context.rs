//! The `pyflow_ec` module: host execution context for embedded code
//!
//! The module is built natively and registered in `sys.modules` when the
//! runtime starts. Its functions read the context of the stage currently
//! invoking embedded code on this thread; the stage installs that context
//! with [`enter`] for the duration of each call. Called anywhere else they
//! raise `RuntimeError`.
//!
//! ```python
//! import pyflow_ec
//!
//! def count(x):
//!     pyflow_ec.metric_inc("seen")
//!     if pyflow_ec.is_enabled("debug"):
//!         pyflow_ec.log("debug", "got %r" % (x,))
//!     return x
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

use pyo3::exceptions::{PyRuntimeError, PyTypeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyInt, PyModule, PyString};

use pyflow_core::context::{ExecutionContext, Marker};
use pyflow_core::logging::{emit_app_record, AppChannel, Severity};
use pyflow_core::metrics::MetricKind;
use pyflow_core::Error;

use crate::marshal::from_embedded;

pub const MODULE_NAME: &str = "pyflow_ec";

thread_local! {
    static CURRENT: RefCell<Option<Arc<dyn ExecutionContext>>> = const { RefCell::new(None) };
}

/// Restores the previously active context when dropped
#[must_use]
pub struct ContextGuard {
    previous: Option<Arc<dyn ExecutionContext>>,
}

/// Make `context` the active context of this thread
pub fn enter(context: Arc<dyn ExecutionContext>) -> ContextGuard {
    let previous = CURRENT.with(|current| current.borrow_mut().replace(context));
    ContextGuard { previous }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

fn current() -> PyResult<Arc<dyn ExecutionContext>> {
    CURRENT
        .with(|current| current.borrow().clone())
        .ok_or_else(|| PyRuntimeError::new_err("pyflow_ec is only available while a stage is running"))
}

fn host_err(err: Error) -> PyErr {
    match err {
        Error::Context(msg) | Error::ConfigError(msg) => PyValueError::new_err(msg),
        Error::Conversion(conv) => PyValueError::new_err(conv.to_string()),
        other => PyRuntimeError::new_err(other.to_string()),
    }
}

fn parse_level(level: &Bound<'_, PyAny>) -> PyResult<Severity> {
    if level.is_instance_of::<PyInt>() {
        return Ok(Severity::from_python_level(level.extract()?));
    }
    if let Ok(name) = level.downcast::<PyString>() {
        return name.to_str()?.parse().map_err(host_err);
    }
    Err(PyTypeError::new_err("level must be an int or a level name"))
}

fn parse_aspects(aspects: Option<&Bound<'_, PyAny>>) -> PyResult<String> {
    let Some(aspects) = aspects else {
        return Ok(String::new());
    };
    if aspects.is_none() {
        return Ok(String::new());
    }
    if let Ok(text) = aspects.downcast::<PyString>() {
        return Ok(text.to_str()?.to_owned());
    }
    let parts: Vec<String> = aspects.extract()?;
    Ok(parts.join(","))
}

#[pyfunction]
fn job_id() -> PyResult<u64> {
    Ok(current()?.job_id())
}

#[pyfunction]
fn pe_id() -> PyResult<u64> {
    Ok(current()?.pe_id())
}

#[pyfunction]
fn job_name() -> PyResult<String> {
    Ok(current()?.job_name().to_string())
}

#[pyfunction]
fn stage_name() -> PyResult<String> {
    Ok(current()?.stage_name().to_string())
}

#[pyfunction]
fn channel() -> PyResult<i32> {
    Ok(current()?.channel())
}

#[pyfunction]
fn local_channel() -> PyResult<i32> {
    Ok(current()?.local_channel())
}

#[pyfunction]
fn max_channels() -> PyResult<i32> {
    Ok(current()?.max_channels())
}

#[pyfunction]
fn local_max_channels() -> PyResult<i32> {
    Ok(current()?.local_max_channels())
}

/// Create a metric; creating an existing one of the same kind is a no-op
#[pyfunction]
#[pyo3(signature = (name, description = "", kind = "counter", initial = 0))]
fn create_custom_metric(name: &str, description: &str, kind: &str, initial: i64) -> PyResult<()> {
    let kind: MetricKind = kind.parse().map_err(host_err)?;
    current()?
        .metrics()
        .create(name, description, kind, initial)
        .map(|_| ())
        .map_err(host_err)
}

#[pyfunction]
fn metric_value(name: &str) -> PyResult<i64> {
    current()?
        .metrics()
        .lookup(name)
        .map(|metric| metric.value())
        .map_err(host_err)
}

/// Add `delta`; returns the new value
#[pyfunction]
#[pyo3(signature = (name, delta = 1))]
fn metric_inc(name: &str, delta: i64) -> PyResult<i64> {
    current()?
        .metrics()
        .lookup(name)
        .and_then(|metric| metric.increment(delta))
        .map_err(host_err)
}

#[pyfunction]
fn metric_set(name: &str, value: i64) -> PyResult<()> {
    current()?
        .metrics()
        .lookup(name)
        .and_then(|metric| metric.set(value))
        .map_err(host_err)
}

/// Named key/value configuration as a dict, or `None`
#[pyfunction]
fn app_config(name: &str) -> PyResult<Option<BTreeMap<String, String>>> {
    Ok(current()?.app_config(name))
}

#[pyfunction]
fn is_enabled(level: &Bound<'_, PyAny>) -> PyResult<bool> {
    let severity = parse_level(level)?;
    Ok(severity.passes(current()?.log_threshold()))
}

fn emit(channel: AppChannel, level: &Bound<'_, PyAny>, message: &str, aspects: Option<&Bound<'_, PyAny>>) -> PyResult<()> {
    let context = current()?;
    let severity = parse_level(level)?;
    if severity.passes(context.log_threshold()) {
        let aspects = parse_aspects(aspects)?;
        emit_app_record(channel, severity, context.stage_name(), &aspects, message);
    }
    Ok(())
}

#[pyfunction]
#[pyo3(signature = (level, message, aspects = None))]
fn log(level: &Bound<'_, PyAny>, message: &str, aspects: Option<&Bound<'_, PyAny>>) -> PyResult<()> {
    emit(AppChannel::Log, level, message, aspects)
}

#[pyfunction]
#[pyo3(signature = (level, message, aspects = None))]
fn trace(level: &Bound<'_, PyAny>, message: &str, aspects: Option<&Bound<'_, PyAny>>) -> PyResult<()> {
    emit(AppChannel::Trace, level, message, aspects)
}

/// Submit `value` to output `port`, converted to the port's type
#[pyfunction]
fn submit(port: usize, value: &Bound<'_, PyAny>) -> PyResult<()> {
    let context = current()?;
    let ty = context
        .output_type(port)
        .ok_or_else(|| PyValueError::new_err(format!("no output port {}", port)))?;
    let value = from_embedded(value, &ty).map_err(|e| PyValueError::new_err(e.to_string()))?;
    context.submit(port, value).map_err(host_err)
}

#[pyfunction]
#[pyo3(signature = (port, kind = "window"))]
fn submit_marker(port: usize, kind: &str) -> PyResult<()> {
    let marker = match kind {
        "window" => Marker::Window,
        "final" => Marker::Final,
        other => return Err(PyValueError::new_err(format!("unknown marker '{}'", other))),
    };
    current()?.submit_marker(port, marker).map_err(host_err)
}

/// Build `pyflow_ec` and register it in `sys.modules`
pub(crate) fn install(py: Python<'_>) -> PyResult<()> {
    let module = PyModule::new(py, MODULE_NAME)?;
    module.add("__doc__", "Execution context of the running PyFlow stage")?;
    module.add_function(wrap_pyfunction!(job_id, &module)?)?;
    module.add_function(wrap_pyfunction!(pe_id, &module)?)?;
    module.add_function(wrap_pyfunction!(job_name, &module)?)?;
    module.add_function(wrap_pyfunction!(stage_name, &module)?)?;
    module.add_function(wrap_pyfunction!(channel, &module)?)?;
    module.add_function(wrap_pyfunction!(local_channel, &module)?)?;
    module.add_function(wrap_pyfunction!(max_channels, &module)?)?;
    module.add_function(wrap_pyfunction!(local_max_channels, &module)?)?;
    module.add_function(wrap_pyfunction!(create_custom_metric, &module)?)?;
    module.add_function(wrap_pyfunction!(metric_value, &module)?)?;
    module.add_function(wrap_pyfunction!(metric_inc, &module)?)?;
    module.add_function(wrap_pyfunction!(metric_set, &module)?)?;
    module.add_function(wrap_pyfunction!(app_config, &module)?)?;
    module.add_function(wrap_pyfunction!(is_enabled, &module)?)?;
    module.add_function(wrap_pyfunction!(log, &module)?)?;
    module.add_function(wrap_pyfunction!(trace, &module)?)?;
    module.add_function(wrap_pyfunction!(submit, &module)?)?;
    module.add_function(wrap_pyfunction!(submit_marker, &module)?)?;

    py.import("sys")?.getattr("modules")?.set_item(MODULE_NAME, &module)?;
    tracing::debug!(module = MODULE_NAME, "Installed context module");
    Ok(())
}
