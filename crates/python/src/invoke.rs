//! Calling a stage callable and reading its result per call kind
//!
//! [`invoke`] is the single primitive: it moves the marshaled argument into a
//! one-element argument tuple, calls, and turns the interpreter's error slot
//! into an explicit [`CallResult`]. [`CallSite`] builds the call kinds on top
//! of it and routes failures through the suppression hook.
//!
//! | Kind      | Result read as                                   |
//! |-----------|--------------------------------------------------|
//! | sink      | discarded                                        |
//! | filter    | truthiness                                       |
//! | transform | `None` drops the record, else the output type    |
//! | hash      | an integer                                       |
//! | map       | as transform, blobs optionally shared            |
//! | flat_map  | an iterable of output values, `None`s skipped    |
//! | source    | one `(more, value)` pair per poll                |

use pyo3::prelude::*;
use pyo3::types::{PyBool, PyBytes, PyInt, PyTuple};

use pyflow_core::metrics::CustomMetric;
use pyflow_core::{ConversionError, Result, TypedValue, ValueType};

use crate::callable::StageCallable;
use crate::exception::{offer_to_suppression_hook, ExceptionInfo};
use crate::marshal::{from_embedded, shared_blob, to_embedded, type_name, CallScope};

/// Outcome of one foreign call
#[derive(Debug)]
pub enum CallResult<'py> {
    Produced(Bound<'py, PyAny>),
    /// The callable returned `None`
    NoValue,
    Failed(ExceptionInfo),
}

/// Call `callable(argument)`; the argument is consumed by the call
pub fn invoke<'py>(callable: &Bound<'py, PyAny>, argument: Bound<'py, PyAny>, location: &str) -> CallResult<'py> {
    let py = callable.py();
    let args = match PyTuple::new(py, [argument]) {
        Ok(args) => args,
        Err(err) => return CallResult::Failed(ExceptionInfo::from_err(py, err, location)),
    };
    settle_call(py, callable.call1(args), location)
}

/// Call `callable()`
pub fn invoke_no_args<'py>(callable: &Bound<'py, PyAny>, location: &str) -> CallResult<'py> {
    settle_call(callable.py(), callable.call0(), location)
}

fn settle_call<'py>(py: Python<'py>, outcome: PyResult<Bound<'py, PyAny>>, location: &str) -> CallResult<'py> {
    match outcome {
        Ok(result) if result.is_none() => CallResult::NoValue,
        Ok(result) => CallResult::Produced(result),
        Err(err) => CallResult::Failed(ExceptionInfo::from_err(py, err, location)),
    }
}

/// A [`CallResult`] after the suppression hook had its say
#[derive(Debug)]
pub enum Settled<'py> {
    Value(Bound<'py, PyAny>),
    Nothing,
    /// The callable failed and `__exit__` swallowed the exception
    Suppressed,
}

/// What a source poll produced
#[derive(Debug, Clone, PartialEq)]
pub enum SourcePoll {
    Value(TypedValue),
    /// The callable raised and the exception was suppressed; poll again
    Suppressed,
    Exhausted,
}

/// Everything needed to run one call kind against a stage callable
pub struct CallSite<'a, 'py> {
    pub scope: &'a CallScope<'py>,
    pub callable: &'a StageCallable,
    pub suppressed: &'a CustomMetric,
    pub location: &'a str,
}

impl<'a, 'py> CallSite<'a, 'py> {
    fn py(&self) -> Python<'py> {
        self.scope.py()
    }

    /// Resolve a failure: suppressed, or an application error
    pub fn settle(&self, result: CallResult<'py>) -> Result<Settled<'py>> {
        match result {
            CallResult::Produced(value) => Ok(Settled::Value(value)),
            CallResult::NoValue => Ok(Settled::Nothing),
            CallResult::Failed(info) => {
                if offer_to_suppression_hook(self.py(), self.callable, &info, self.suppressed)? {
                    Ok(Settled::Suppressed)
                } else {
                    Err(info.into_host_error(self.py()))
                }
            }
        }
    }

    fn fail(&self, err: PyErr) -> Result<Settled<'py>> {
        self.settle(CallResult::Failed(ExceptionInfo::from_err(self.py(), err, self.location)))
    }

    fn call(&self, value: &TypedValue) -> Result<Settled<'py>> {
        let argument = to_embedded(self.scope, value)?;
        let target = self.callable.target(self.py());
        self.settle(invoke(target, argument, self.location))
    }

    pub fn sink(&self, value: &TypedValue) -> Result<()> {
        self.call(value).map(|_| ())
    }

    pub fn filter(&self, value: &TypedValue) -> Result<bool> {
        match self.call(value)? {
            Settled::Value(result) => match result.is_truthy() {
                Ok(keep) => Ok(keep),
                Err(err) => self.fail(err).map(|_| false),
            },
            Settled::Nothing | Settled::Suppressed => Ok(false),
        }
    }

    /// `None` when the record is dropped
    pub fn transform(&self, value: &TypedValue, output: &ValueType) -> Result<Option<TypedValue>> {
        match self.call(value)? {
            Settled::Value(result) => Ok(Some(from_embedded(&result, output)?)),
            Settled::Nothing | Settled::Suppressed => Ok(None),
        }
    }

    pub fn map(&self, value: &TypedValue, output: &ValueType) -> Result<Option<TypedValue>> {
        self.transform(value, output)
    }

    /// Transform that passes embedded objects through unchanged
    pub fn transform_object(&self, argument: Bound<'py, PyAny>) -> Result<Option<Bound<'py, PyAny>>> {
        let target = self.callable.target(self.py());
        match self.settle(invoke(target, argument, self.location))? {
            Settled::Value(result) => Ok(Some(result)),
            Settled::Nothing | Settled::Suppressed => Ok(None),
        }
    }

    /// Map to a blob for `occurrences` consumers.
    ///
    /// When the callable returns `bytes`, each returned blob holds its own
    /// reference to that object instead of a copy.
    pub fn map_shared(&self, value: &TypedValue, occurrences: usize) -> Result<Option<Vec<TypedValue>>> {
        let result = match self.call(value)? {
            Settled::Value(result) => result,
            Settled::Nothing | Settled::Suppressed => return Ok(None),
        };
        if let Ok(bytes) = result.downcast::<PyBytes>() {
            return Ok(Some(
                (0..occurrences).map(|_| TypedValue::Blob(shared_blob(bytes))).collect(),
            ));
        }
        let copied = from_embedded(&result, &ValueType::Blob)?;
        Ok(Some(vec![copied; occurrences]))
    }

    /// `Ok(None)` when the failure was suppressed
    pub fn hash(&self, value: &TypedValue) -> Result<Option<i64>> {
        match self.call(value)? {
            Settled::Value(result) => {
                if !result.is_instance_of::<PyInt>() || result.is_instance_of::<PyBool>() {
                    return Err(ConversionError::mismatch("int", type_name(&result)).into());
                }
                let hash = result.extract::<i64>().map_err(|_| {
                    ConversionError::out_of_range(
                        ValueType::Int64,
                        result.str().map(|s| s.to_string()).unwrap_or_default(),
                    )
                })?;
                Ok(Some(hash))
            }
            Settled::Nothing => Err(ConversionError::MissingValue("hash".to_string()).into()),
            Settled::Suppressed => Ok(None),
        }
    }

    /// Values of the iterable the callable returned.
    ///
    /// If iterating raises and `__exit__` suppresses it, the values produced
    /// before the failure are kept.
    pub fn flat_map(&self, value: &TypedValue, element: &ValueType) -> Result<Vec<TypedValue>> {
        let result = match self.call(value)? {
            Settled::Value(result) => result,
            Settled::Nothing | Settled::Suppressed => return Ok(Vec::new()),
        };
        let iter = result
            .try_iter()
            .map_err(|_| ConversionError::mismatch("iterable", type_name(&result)))?;

        let mut values = Vec::new();
        for item in iter {
            match item {
                Ok(item) if item.is_none() => {}
                Ok(item) => values.push(from_embedded(&item, element)?),
                Err(err) => {
                    self.fail(err)?;
                    break;
                }
            }
        }
        Ok(values)
    }

    /// Pull one value from a source callable
    pub fn poll_source(&self, element: &ValueType) -> Result<SourcePoll> {
        let target = self.callable.target(self.py());
        let result = match self.settle(invoke_no_args(target, self.location))? {
            Settled::Value(result) => result,
            Settled::Nothing => return Ok(SourcePoll::Exhausted),
            Settled::Suppressed => return Ok(SourcePoll::Suppressed),
        };
        let (more, value): (bool, Bound<'py, PyAny>) = result
            .extract()
            .map_err(|_| ConversionError::mismatch("(bool, object)", type_name(&result)))?;
        if !more {
            return Ok(SourcePoll::Exhausted);
        }
        Ok(SourcePoll::Value(from_embedded(&value, element)?))
    }

    /// Forward a window marker to the callable's hook, if it has one
    pub fn punctuation(&self) -> Result<()> {
        match self.callable.on_punct(self.py()) {
            Ok(_) => Ok(()),
            Err(err) => self.fail(err).map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::with_lock;
    use crate::runtime::ensure_started;
    use pyflow_core::metrics::{MetricKind, MetricRegistry};
    use pyo3::ffi::c_str;

    #[test]
    fn test_invoke_distinguishes_outcomes() {
        ensure_started().unwrap();
        with_lock(|py| {
            let module = PyModule::from_code(
                py,
                c_str!("def f(x):\n    return None if x == 0 else 10 // x\n"),
                c_str!("f.py"),
                c_str!("pyflow_test_invoke"),
            )
            .unwrap();
            let f = module.getattr("f").unwrap();
            let arg = |v: i64| v.into_pyobject(py).unwrap().into_any();

            match invoke(&f, arg(5), "f") {
                CallResult::Produced(v) => assert_eq!(v.extract::<i64>().unwrap(), 2),
                other => panic!("unexpected {:?}", other),
            }
            assert!(matches!(invoke(&f, arg(0), "f"), CallResult::NoValue));
            let text = pyo3::types::PyString::new(py, "x").into_any();
            match invoke(&f, text, "f") {
                CallResult::Failed(info) => assert_eq!(info.kind(), "TypeError"),
                other => panic!("unexpected {:?}", other),
            }
            assert!(PyErr::take(py).is_none());
        });
    }

    #[test]
    fn test_hash_rejects_non_integers() {
        ensure_started().unwrap();
        let metrics = MetricRegistry::new();
        let suppressed = metrics.create("s", "", MetricKind::Counter, 0).unwrap();
        with_lock(|py| {
            let module = PyModule::from_code(
                py,
                c_str!("def h(x):\n    return 1 / x\n"),
                c_str!("h.py"),
                c_str!("pyflow_test_hash"),
            )
            .unwrap();
            let callable = StageCallable::adopt(module.getattr("h").unwrap(), None).unwrap();
            let scope = CallScope::new(py, false);
            let site = CallSite {
                scope: &scope,
                callable: &callable,
                suppressed: &suppressed,
                location: "h",
            };
            let err = site.hash(&TypedValue::Int32(2)).unwrap_err();
            assert!(err.is_conversion(), "got {:?}", err);

            let err = site.hash(&TypedValue::Int32(0)).unwrap_err();
            match err {
                pyflow_core::Error::Application { kind, .. } => assert_eq!(kind, "ZeroDivisionError"),
                other => panic!("expected application error, got {:?}", other),
            }
        });
    }
}
