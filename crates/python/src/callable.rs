//! The embedded object holding a stage's user logic
//!
//! Optional protocols (`__enter__`, `__exit__`, `_pyflow_on_punct`) are probed
//! once when a callable is adopted and cached in [`Capabilities`]. A callable
//! wrapped for wire styles or as a source keeps the user's object in
//! `_pyflow_user`; hooks are looked up on that object.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use pyo3::prelude::*;
use pyo3::types::PyBytes;

use pyflow_core::config::{StageConfig, WireStyle};
use pyflow_core::{Error, Result, StageKind};

use crate::exception::ExceptionInfo;
use crate::runtime;

/// Attribute holding the user object inside a wrapper
pub const USER_ATTR: &str = "_pyflow_user";
/// Method called when a window marker arrives
pub const PUNCT_HOOK: &str = "_pyflow_on_punct";

/// Optional protocols the user object implements
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub enter: bool,
    pub exit: bool,
    pub on_punct: bool,
    /// Carries state worth checkpointing
    pub stateful: bool,
}

/// A stage callable and its probed capabilities
#[derive(Debug)]
pub struct StageCallable {
    target: Py<PyAny>,
    hooks: Py<PyAny>,
    caps: Capabilities,
    entered: bool,
    exited: bool,
}

impl StageCallable {
    /// Take ownership of `target`, probing its protocols.
    ///
    /// `stateful` overrides the default guess, which treats instances as
    /// stateful and plain functions and classes as stateless.
    pub fn adopt(target: Bound<'_, PyAny>, stateful: Option<bool>) -> Result<Self> {
        let py = target.py();
        if !target.is_callable() {
            return Err(Error::Setup(format!(
                "stage object of type {} is not callable",
                crate::marshal::type_name(&target)
            )));
        }

        let hooks = match target.getattr(USER_ATTR) {
            Ok(user) => user,
            Err(_) => target.clone(),
        };
        let probe = |name: &str| hooks.hasattr(name).unwrap_or(false);

        let stateful = match stateful {
            Some(flag) => flag,
            None => runtime::helpers()?
                .is_stateful
                .call1(py, (&hooks,))
                .and_then(|flag| flag.is_truthy(py))
                .map_err(|e| ExceptionInfo::from_err(py, e, "is_stateful").into_setup_error(py, "stateful probe"))?,
        };

        let caps = Capabilities {
            enter: probe("__enter__"),
            exit: probe("__exit__"),
            on_punct: probe(PUNCT_HOOK),
            stateful,
        };
        tracing::debug!(?caps, "Adopted stage callable");

        Ok(StageCallable {
            target: target.unbind(),
            hooks: hooks.unbind(),
            caps,
            entered: false,
            exited: false,
        })
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// The object that is invoked
    pub fn target<'py>(&self, py: Python<'py>) -> &Bound<'py, PyAny> {
        self.target.bind(py)
    }

    /// The user object, where hooks live
    pub fn hooks<'py>(&self, py: Python<'py>) -> &Bound<'py, PyAny> {
        self.hooks.bind(py)
    }

    /// Call `__enter__` once, if declared
    pub fn enter(&mut self, py: Python<'_>) -> PyResult<()> {
        if self.caps.enter && !self.entered {
            self.hooks.call_method0(py, "__enter__")?;
        }
        self.entered = true;
        Ok(())
    }

    /// Call `__exit__(None, None, None)` once, if declared
    pub fn exit(&mut self, py: Python<'_>) -> PyResult<()> {
        if self.exited {
            return Ok(());
        }
        self.exited = true;
        if self.caps.exit {
            let none = py.None();
            self.hooks
                .call_method1(py, "__exit__", (none.clone_ref(py), none.clone_ref(py), none))?;
        }
        Ok(())
    }

    /// Offer an exception to `__exit__`; `Ok(true)` when it is suppressed
    pub fn exit_with(&self, py: Python<'_>, info: &ExceptionInfo) -> PyResult<bool> {
        if !self.caps.exit {
            return Ok(false);
        }
        let (kind, value, traceback) = info.exit_args(py);
        self.hooks
            .bind(py)
            .call_method1("__exit__", (kind, value, traceback))?
            .is_truthy()
    }

    /// Run the window-marker hook, if declared
    pub fn on_punct<'py>(&self, py: Python<'py>) -> PyResult<Option<Bound<'py, PyAny>>> {
        if !self.caps.on_punct {
            return Ok(None);
        }
        self.hooks.bind(py).call_method0(PUNCT_HOOK).map(Some)
    }
}

/// Wrap a user object according to the stage kind and wire styles
pub fn build_target<'py>(
    user: Bound<'py, PyAny>,
    config: &StageConfig,
    serializer: &str,
) -> Result<Bound<'py, PyAny>> {
    let py = user.py();
    let helpers = runtime::helpers()?;
    let wrapped = if config.kind == StageKind::Source {
        helpers
            .iterable_source
            .call1(py, (&user, config.output_style.as_str(), serializer))
    } else if config.input_style != WireStyle::Object || config.output_style != WireStyle::Object {
        helpers.styled_callable.call1(
            py,
            (
                &user,
                config.input_style.as_str(),
                config.output_style.as_str(),
                serializer,
                config.kind == StageKind::FlatMap,
            ),
        )
    } else {
        return Ok(user);
    };
    wrapped
        .map(|w| w.into_bound(py))
        .map_err(|e| ExceptionInfo::from_err(py, e, &config.name).into_setup_error(py, "callable wrapper"))
}

/// Deserialize a base64-encoded callable with the serializer module
pub fn load_pickled<'py>(py: Python<'py>, encoded: &str, serializer: &Bound<'py, PyAny>) -> Result<Bound<'py, PyAny>> {
    let raw = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::Setup(format!("pickled callable is not valid base64: {}", e)))?;
    serializer
        .call_method1("loads", (PyBytes::new(py, &raw),))
        .map_err(|e| ExceptionInfo::from_err(py, e, "loads").into_setup_error(py, "pickled callable"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::with_lock;
    use crate::runtime::ensure_started;
    use pyo3::ffi::c_str;

    const HOOKS: &std::ffi::CStr = c_str!(
        r#"
class Counter:
    def __init__(self):
        self.entered = 0
        self.exited = 0
    def __call__(self, x):
        return x
    def __enter__(self):
        self.entered += 1
    def __exit__(self, *args):
        self.exited += 1
        return False

def plain(x):
    return x
"#
    );

    #[test]
    fn test_probe_and_lifecycle_hooks_run_once() {
        ensure_started().unwrap();
        with_lock(|py| {
            let module = PyModule::from_code(py, HOOKS, c_str!("hooks.py"), c_str!("pyflow_test_hooks")).unwrap();
            let counter = module.getattr("Counter").unwrap().call0().unwrap();
            let mut callable = StageCallable::adopt(counter.clone(), None).unwrap();
            let caps = callable.capabilities();
            assert!(caps.enter && caps.exit && caps.stateful);
            assert!(!caps.on_punct);

            callable.enter(py).unwrap();
            callable.enter(py).unwrap();
            callable.exit(py).unwrap();
            callable.exit(py).unwrap();
            assert_eq!(counter.getattr("entered").unwrap().extract::<i32>().unwrap(), 1);
            assert_eq!(counter.getattr("exited").unwrap().extract::<i32>().unwrap(), 1);

            let plain = StageCallable::adopt(module.getattr("plain").unwrap(), None).unwrap();
            assert_eq!(plain.capabilities(), Capabilities::default());
        });
    }

    #[test]
    fn test_non_callable_is_setup_error() {
        ensure_started().unwrap();
        with_lock(|py| {
            let number = 5i32.into_pyobject(py).unwrap().into_any();
            assert!(matches!(StageCallable::adopt(number, None), Err(Error::Setup(_))));
        });
    }

    #[test]
    fn test_styled_wrapper_exposes_user_hooks() {
        ensure_started().unwrap();
        with_lock(|py| {
            let module = PyModule::from_code(py, HOOKS, c_str!("hooks.py"), c_str!("pyflow_test_hooks_styled")).unwrap();
            let counter = module.getattr("Counter").unwrap().call0().unwrap();
            let mut config = StageConfig::new("json", StageKind::Transform)
                .with_output_type(pyflow_core::ValueType::String);
            config.input_style = WireStyle::Json;
            config.output_style = WireStyle::Json;
            let target = build_target(counter.clone(), &config, "pickle").unwrap();
            assert_ne!(target.as_ptr(), counter.as_ptr());

            let callable = StageCallable::adopt(target, None).unwrap();
            assert_eq!(callable.hooks(py).as_ptr(), counter.as_ptr());
            assert!(callable.capabilities().exit);
            let out: String = callable
                .target(py)
                .call1(("[1, 2]",))
                .unwrap()
                .extract()
                .unwrap();
            assert_eq!(out, "[1, 2]");
        });
    }
}
