//! Process-wide embedded interpreter
//!
//! The interpreter is started at most once per process and never torn down.
//! [`ensure_started`] is idempotent; the first call initializes CPython (which
//! releases the interpreter lock straight away, so host threads are not held
//! up), installs the `pyflow_ec` context module and loads the helper module
//! the marshaling layer relies on.

use std::collections::HashSet;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use parking_lot::Mutex;
use pyo3::ffi::c_str;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList, PyModule};

use pyflow_core::config::RuntimeConfig;
use pyflow_core::{ConversionError, Error, Result};

use crate::exception::{flush_diagnostics, ExceptionInfo};
use crate::lock::with_lock;

/// Oldest interpreter the helper module supports
const MIN_PYTHON: (u8, u8) = (3, 10);

static RUNTIME: OnceLock<EmbeddedRuntime> = OnceLock::new();
static START: Mutex<()> = parking_lot::const_mutex(());

/// Embedded-side functions resolved once at start
pub(crate) struct Helpers {
    pub decimal: Py<PyAny>,
    pub decimal_text: Py<PyAny>,
    pub timestamp_new: Py<PyAny>,
    pub timestamp_parts: Py<PyAny>,
    pub styled_callable: Py<PyAny>,
    pub iterable_source: Py<PyAny>,
    pub serializer: Py<PyAny>,
    pub is_stateful: Py<PyAny>,
    pub add_toolkit_paths: Py<PyAny>,
}

impl Helpers {
    fn load(module: &Bound<'_, PyModule>) -> PyResult<Self> {
        let get = |name: &str| module.getattr(name).map(Bound::unbind);
        Ok(Helpers {
            decimal: get("Decimal")?,
            decimal_text: get("decimal_text")?,
            timestamp_new: get("timestamp_new")?,
            timestamp_parts: get("timestamp_parts")?,
            styled_callable: get("StyledCallable")?,
            iterable_source: get("IterableSource")?,
            serializer: get("serializer")?,
            is_stateful: get("is_stateful")?,
            add_toolkit_paths: get("add_toolkit_paths")?,
        })
    }
}

/// Handle to the started interpreter
pub struct EmbeddedRuntime {
    version: String,
    helpers: Helpers,
    setup_scripts: Mutex<HashSet<PathBuf>>,
}

impl std::fmt::Debug for EmbeddedRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedRuntime")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Start the interpreter if this process has not done so yet
pub fn ensure_started() -> Result<&'static EmbeddedRuntime> {
    if let Some(runtime) = RUNTIME.get() {
        return Ok(runtime);
    }
    let _start = START.lock();
    if let Some(runtime) = RUNTIME.get() {
        return Ok(runtime);
    }
    let runtime = EmbeddedRuntime::start()?;
    Ok(RUNTIME.get_or_init(|| runtime))
}

/// The started runtime, if any
pub fn get() -> Option<&'static EmbeddedRuntime> {
    RUNTIME.get()
}

pub(crate) fn helpers() -> std::result::Result<&'static Helpers, ConversionError> {
    RUNTIME
        .get()
        .map(|runtime| &runtime.helpers)
        .ok_or(ConversionError::RuntimeUnavailable)
}

impl EmbeddedRuntime {
    fn start() -> Result<Self> {
        // SAFETY: only reads the initialization flag
        let preinitialized = unsafe { pyo3::ffi::Py_IsInitialized() } != 0;

        let (version, helpers) = with_lock(|py| -> Result<(String, Helpers)> {
            let info = py.version_info();
            if (info.major, info.minor) < MIN_PYTHON {
                return Err(Error::Setup(format!(
                    "Python {}.{} found, {}.{} or newer required",
                    info.major, info.minor, MIN_PYTHON.0, MIN_PYTHON.1
                )));
            }

            crate::context::install(py)
                .map_err(|e| ExceptionInfo::from_err(py, e, "pyflow_ec").into_setup_error(py, "context module"))?;

            let helpers = PyModule::from_code(
                py,
                c_str!(include_str!("../python/_pyflow_runtime.py")),
                c_str!("_pyflow_runtime.py"),
                c_str!("_pyflow_runtime"),
            )
            .and_then(|m| Helpers::load(&m))
            .map_err(|e| {
                ExceptionInfo::from_err(py, e, "_pyflow_runtime").into_setup_error(py, "helper module")
            })?;

            Ok((py.version().to_string(), helpers))
        })?;

        tracing::info!(
            python = %version.lines().next().unwrap_or_default(),
            preinitialized,
            "Embedded Python runtime started"
        );

        Ok(EmbeddedRuntime {
            version,
            helpers,
            setup_scripts: Mutex::new(HashSet::new()),
        })
    }

    /// `sys.version` of the embedded interpreter
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Apply the runtime section of a stage configuration
    pub fn configure(&self, config: &RuntimeConfig) -> Result<()> {
        if let Some(dir) = &config.toolkit_dir {
            self.add_toolkit_paths(dir)?;
        }
        if !config.python_path.is_empty() {
            self.extend_sys_path(&config.python_path)?;
        }
        if let Some(script) = &config.setup_script {
            self.run_setup_script(script)?;
        }
        Ok(())
    }

    /// Execute a bootstrap script once per process.
    ///
    /// Running the same path again is a no-op. A missing or failing script is
    /// a setup error; the interpreter's traceback is printed and flushed first.
    pub fn run_setup_script(&self, path: &Path) -> Result<()> {
        let mut done = self.setup_scripts.lock();
        if done.contains(path) {
            tracing::debug!(script = %path.display(), "Setup script already executed");
            return Ok(());
        }

        let source = std::fs::read_to_string(path).map_err(|e| {
            Error::Setup(format!("setup script {}: {}", path.display(), e))
        })?;
        let code = CString::new(source).map_err(|_| {
            Error::Setup(format!("setup script {} contains a NUL byte", path.display()))
        })?;

        with_lock(|py| -> Result<()> {
            let globals = PyDict::new(py);
            let set = |key: &str, value: &str| {
                globals
                    .set_item(key, value)
                    .map_err(|e| ExceptionInfo::from_err(py, e, "setup").into_setup_error(py, "setup globals"))
            };
            set("__name__", "__pyflow_setup__")?;
            set("__file__", &path.to_string_lossy())?;

            let outcome = py.run(&code, Some(&globals), None);
            flush_diagnostics(py);
            outcome.map_err(|e| {
                let what = format!("setup script {}", path.display());
                ExceptionInfo::from_err(py, e, "setup").into_setup_error(py, &what)
            })
        })?;

        tracing::info!(script = %path.display(), "Setup script executed");
        done.insert(path.to_path_buf());
        Ok(())
    }

    /// Put a toolkit's `opt/python/{modules,packages}` at the front of `sys.path`
    pub fn add_toolkit_paths(&self, toolkit_dir: &Path) -> Result<Vec<PathBuf>> {
        with_lock(|py| {
            let added = self
                .helpers
                .add_toolkit_paths
                .call1(py, (toolkit_dir.to_string_lossy(),))
                .and_then(|list| list.extract::<Vec<String>>(py))
                .map_err(|e| {
                    ExceptionInfo::from_err(py, e, "toolkit").into_setup_error(py, "toolkit paths")
                })?;
            for path in &added {
                tracing::debug!(path = %path, "Added toolkit path");
            }
            Ok(added.into_iter().map(PathBuf::from).collect())
        })
    }

    /// Append entries to `sys.path`, skipping ones already present
    pub fn extend_sys_path(&self, paths: &[PathBuf]) -> Result<()> {
        with_lock(|py| {
            let extend = || -> PyResult<()> {
                let sys_path = py.import("sys")?.getattr("path")?;
                let sys_path = sys_path.downcast::<PyList>()?;
                for path in paths {
                    let entry = path.to_string_lossy();
                    if !sys_path.contains(entry.as_ref())? {
                        sys_path.append(entry.as_ref())?;
                    }
                }
                Ok(())
            };
            extend().map_err(|e| ExceptionInfo::from_err(py, e, "sys.path").into_setup_error(py, "python_path"))
        })
    }

    /// Look up `module.name` and check that it can be called
    pub fn resolve<'py>(&self, py: Python<'py>, module: &str, name: &str) -> Result<Bound<'py, PyAny>> {
        let what = format!("{}.{}", module, name);
        let object = py
            .import(module)
            .and_then(|m| m.getattr(name))
            .map_err(|e| ExceptionInfo::from_err(py, e, &what).into_setup_error(py, &what))?;
        if !object.is_callable() {
            return Err(Error::Setup(format!(
                "{} is a {}, not a callable",
                what,
                object.get_type().name().map(|n| n.to_string()).unwrap_or_default()
            )));
        }
        Ok(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_is_idempotent() {
        let first = ensure_started().unwrap() as *const EmbeddedRuntime;
        let second = ensure_started().unwrap() as *const EmbeddedRuntime;
        assert_eq!(first, second);
        assert!(get().is_some());
        assert!(helpers().is_ok());
    }

    #[test]
    fn test_resolve_rejects_non_callables() {
        let runtime = ensure_started().unwrap();
        with_lock(|py| {
            assert!(runtime.resolve(py, "math", "sqrt").is_ok());
            let err = runtime.resolve(py, "math", "pi").unwrap_err();
            assert!(matches!(err, Error::Setup(_)));
            let err = runtime.resolve(py, "math", "no_such_function").unwrap_err();
            assert!(err.is_fatal());
            let err = runtime.resolve(py, "pyflow_no_such_module", "f").unwrap_err();
            assert!(err.to_string().contains("ModuleNotFoundError"));
        });
    }
}
