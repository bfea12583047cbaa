//! Conversion between host [`TypedValue`]s and embedded objects
//!
//! Both directions require a `Python<'py>` token, which only exists inside
//! [`crate::lock::with_lock`]. [`to_embedded`] always produces a new object;
//! [`from_embedded`] borrows the object and checks it against a declared
//! [`ValueType`]. Nothing is truncated silently: a value that does not fit
//! the declared type is a [`ConversionError`].
//!
//! | Host type            | Embedded object                               |
//! |----------------------|-----------------------------------------------|
//! | boolean              | `bool`                                        |
//! | intN / uintN         | `int`                                         |
//! | float32 / float64    | `float`                                       |
//! | decimalN             | `decimal.Decimal`                             |
//! | complexN             | `complex`                                     |
//! | rstring              | `str`                                         |
//! | blob                 | `bytes`, or a read-only `memoryview`          |
//! | timestamp            | `_pyflow_runtime.Timestamp`                   |
//! | list / set / map     | `list` / `set` / `dict`                       |
//! | optional             | `None` or the inner conversion                |
//!
//! Set elements and map keys are converted to hashable objects: lists become
//! tuples and sets become frozensets.

mod buffer;
mod decimal;

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use pyo3::exceptions::{PyOverflowError, PyTypeError, PyUnicodeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{
    PyBool, PyByteArray, PyBytes, PyComplex, PyDict, PyFloat, PyFrozenSet, PyInt, PyList, PyMemoryView,
    PySet, PyString, PyTuple,
};
use pyo3::IntoPyObjectExt;

use pyflow_core::value::{Complex32, Complex64, Timestamp};
use pyflow_core::{ConversionError, TypedValue, ValueType};

pub use buffer::{shared_blob, view_stats, ScopedBufferView, ViewStats};

use crate::runtime;

/// Per-call marshaling state
///
/// Owns the blob views created while marshaling the arguments of one
/// invocation. Views are released by [`CallScope::release_views`] or, at the
/// latest, when the scope is dropped, which happens before the lock is given
/// up.
pub struct CallScope<'py> {
    py: Python<'py>,
    zero_copy: bool,
    views: RefCell<Vec<ScopedBufferView>>,
}

impl<'py> CallScope<'py> {
    /// `zero_copy` makes blobs cross as views instead of copies
    pub fn new(py: Python<'py>, zero_copy: bool) -> Self {
        CallScope {
            py,
            zero_copy,
            views: RefCell::new(Vec::new()),
        }
    }

    pub fn py(&self) -> Python<'py> {
        self.py
    }

    pub fn zero_copy(&self) -> bool {
        self.zero_copy
    }

    pub(crate) fn register_view(&self, view: ScopedBufferView) {
        self.views.borrow_mut().push(view);
    }

    /// Release every view created in this scope; returns how many there were
    pub fn release_views(&self) -> usize {
        let views: Vec<_> = self.views.borrow_mut().drain(..).collect();
        let count = views.len();
        for view in views {
            view.release(self.py);
        }
        count
    }
}

impl Drop for CallScope<'_> {
    fn drop(&mut self) {
        self.release_views();
    }
}

pub(crate) fn type_name(obj: &Bound<'_, PyAny>) -> String {
    obj.get_type()
        .name()
        .map(|n| n.to_string())
        .unwrap_or_else(|_| "object".to_string())
}

/// Map an interpreter error raised while converting `obj` to `expected`
fn embedded_error(obj: &Bound<'_, PyAny>, expected: &ValueType, err: PyErr) -> ConversionError {
    let py = obj.py();
    if err.is_instance_of::<PyOverflowError>(py) {
        let shown = obj.str().map(|s| s.to_string()).unwrap_or_else(|_| type_name(obj));
        ConversionError::out_of_range(expected, shown)
    } else if err.is_instance_of::<PyUnicodeError>(py) {
        ConversionError::InvalidEncoding(err.value(py).to_string())
    } else if err.is_instance_of::<PyTypeError>(py) {
        ConversionError::mismatch(expected, type_name(obj))
    } else {
        ConversionError::Embedded(format!("{}: {}", expected, err.value(py)))
    }
}

fn creation_error(py: Python<'_>, value: &TypedValue, err: PyErr) -> ConversionError {
    ConversionError::Embedded(format!("{} to Python: {}", value.type_name(), err.value(py)))
}

/// Convert a host value into a new embedded object
pub fn to_embedded<'py>(scope: &CallScope<'py>, value: &TypedValue) -> Result<Bound<'py, PyAny>, ConversionError> {
    let py = scope.py();
    let fail = |err: PyErr| creation_error(py, value, err);
    match value {
        TypedValue::Boolean(v) => v.into_bound_py_any(py).map_err(fail),
        TypedValue::Int8(v) => v.into_bound_py_any(py).map_err(fail),
        TypedValue::Int16(v) => v.into_bound_py_any(py).map_err(fail),
        TypedValue::Int32(v) => v.into_bound_py_any(py).map_err(fail),
        TypedValue::Int64(v) => v.into_bound_py_any(py).map_err(fail),
        TypedValue::UInt8(v) => v.into_bound_py_any(py).map_err(fail),
        TypedValue::UInt16(v) => v.into_bound_py_any(py).map_err(fail),
        TypedValue::UInt32(v) => v.into_bound_py_any(py).map_err(fail),
        TypedValue::UInt64(v) => v.into_bound_py_any(py).map_err(fail),
        TypedValue::Float32(v) => (*v as f64).into_bound_py_any(py).map_err(fail),
        TypedValue::Float64(v) => v.into_bound_py_any(py).map_err(fail),
        TypedValue::Decimal(d) => decimal::to_embedded(py, d),
        TypedValue::Complex32(c) => Ok(PyComplex::from_doubles(py, c.re as f64, c.im as f64).into_any()),
        TypedValue::Complex64(c) => Ok(PyComplex::from_doubles(py, c.re, c.im).into_any()),
        TypedValue::String(s) => Ok(PyString::new(py, s).into_any()),
        TypedValue::Blob(data) => {
            if scope.zero_copy() {
                ScopedBufferView::create(scope, data).map_err(fail)
            } else {
                Ok(PyBytes::new(py, data).into_any())
            }
        }
        TypedValue::Timestamp(ts) => {
            let helpers = runtime::helpers()?;
            helpers
                .timestamp_new
                .call1(py, (ts.seconds(), ts.nanoseconds(), ts.machine_id()))
                .map(|t| t.into_bound(py))
                .map_err(fail)
        }
        TypedValue::List(items) => {
            let elements = items
                .iter()
                .map(|item| to_embedded(scope, item))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(PyList::new(py, elements).map_err(fail)?.into_any())
        }
        TypedValue::Set(items) => {
            let elements = items
                .iter()
                .map(|item| to_hashable(scope, item))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(PySet::new(py, &elements).map_err(fail)?.into_any())
        }
        TypedValue::Map(entries) => {
            let dict = PyDict::new(py);
            for (key, item) in entries {
                let key = to_hashable(scope, key)?;
                let item = to_embedded(scope, item)?;
                dict.set_item(key, item).map_err(fail)?;
            }
            Ok(dict.into_any())
        }
        TypedValue::Optional(None) => Ok(py.None().into_bound(py)),
        TypedValue::Optional(Some(inner)) => to_embedded(scope, inner),
    }
}

/// Like [`to_embedded`], producing an object usable as a set element or dict key
fn to_hashable<'py>(scope: &CallScope<'py>, value: &TypedValue) -> Result<Bound<'py, PyAny>, ConversionError> {
    let py = scope.py();
    let fail = |err: PyErr| creation_error(py, value, err);
    match value {
        TypedValue::List(items) => {
            let elements = items
                .iter()
                .map(|item| to_hashable(scope, item))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(PyTuple::new(py, elements).map_err(fail)?.into_any())
        }
        TypedValue::Set(items) => {
            let elements = items
                .iter()
                .map(|item| to_hashable(scope, item))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(PyFrozenSet::new(py, &elements).map_err(fail)?.into_any())
        }
        TypedValue::Map(_) => Err(ConversionError::Unhashable(value.type_name().to_string())),
        // views are unhashable while writable buffers may back them
        TypedValue::Blob(data) => Ok(PyBytes::new(py, data).into_any()),
        TypedValue::Optional(Some(inner)) => to_hashable(scope, inner),
        other => to_embedded(scope, other),
    }
}

/// Convert an embedded object into a host value of type `ty`
pub fn from_embedded(obj: &Bound<'_, PyAny>, ty: &ValueType) -> Result<TypedValue, ConversionError> {
    if obj.is_none() {
        return match ty {
            ValueType::Optional(_) => Ok(TypedValue::none()),
            _ => Err(ConversionError::MissingValue(ty.to_string())),
        };
    }

    match ty {
        ValueType::Boolean => match obj.downcast::<PyBool>() {
            Ok(b) => Ok(TypedValue::Boolean(b.is_true())),
            Err(_) => Err(ConversionError::mismatch(ty, type_name(obj))),
        },

        ValueType::Int8 => narrow(obj, ty, extract_integer(obj, ty)?, TypedValue::Int8),
        ValueType::Int16 => narrow(obj, ty, extract_integer(obj, ty)?, TypedValue::Int16),
        ValueType::Int32 => narrow(obj, ty, extract_integer(obj, ty)?, TypedValue::Int32),
        ValueType::Int64 => narrow(obj, ty, extract_integer(obj, ty)?, TypedValue::Int64),
        ValueType::UInt8 => narrow(obj, ty, extract_integer(obj, ty)?, TypedValue::UInt8),
        ValueType::UInt16 => narrow(obj, ty, extract_integer(obj, ty)?, TypedValue::UInt16),
        ValueType::UInt32 => narrow(obj, ty, extract_integer(obj, ty)?, TypedValue::UInt32),
        ValueType::UInt64 => narrow(obj, ty, extract_integer(obj, ty)?, TypedValue::UInt64),

        ValueType::Float32 => narrow_float(ty, extract_float(obj, ty)?).map(TypedValue::Float32),
        ValueType::Float64 => extract_float(obj, ty).map(TypedValue::Float64),

        ValueType::Decimal(width) => decimal::from_embedded(obj, *width),

        ValueType::Complex32 => {
            let (re, im) = extract_complex(obj, ty)?;
            let narrowed = (narrow_float(ty, re), narrow_float(ty, im));
            match narrowed {
                (Ok(re), Ok(im)) => Ok(TypedValue::Complex32(Complex32::new(re, im))),
                _ => Err(ConversionError::out_of_range(ty, format!("({}{:+}j)", re, im))),
            }
        }
        ValueType::Complex64 => {
            let (re, im) = extract_complex(obj, ty)?;
            Ok(TypedValue::Complex64(Complex64::new(re, im)))
        }

        ValueType::String => extract_string(obj, ty).map(TypedValue::String),

        ValueType::Blob => extract_blob(obj, ty).map(TypedValue::Blob),

        ValueType::Timestamp => extract_timestamp(obj, ty).map(TypedValue::Timestamp),

        ValueType::List(element) => iterate(obj, ty)?
            .map(|item| from_embedded(&item, element))
            .collect::<Result<Vec<_>, _>>()
            .map(TypedValue::List),

        ValueType::Set(element) => iterate(obj, ty)?
            .map(|item| from_embedded(&item, element))
            .collect::<Result<BTreeSet<_>, _>>()
            .map(TypedValue::Set),

        ValueType::Map(key_ty, value_ty) => {
            let mut map = BTreeMap::new();
            for (key, value) in map_items(obj, ty)? {
                map.insert(from_embedded(&key, key_ty)?, from_embedded(&value, value_ty)?);
            }
            Ok(TypedValue::Map(map))
        }

        ValueType::Optional(inner) => from_embedded(obj, inner).map(TypedValue::some),
    }
}

fn extract_integer(obj: &Bound<'_, PyAny>, ty: &ValueType) -> Result<i128, ConversionError> {
    // bool is an int subclass and is accepted as 0/1
    if !obj.is_instance_of::<PyInt>() {
        return Err(ConversionError::mismatch(ty, type_name(obj)));
    }
    match obj.extract::<i64>() {
        Ok(v) => Ok(v as i128),
        Err(err) if err.is_instance_of::<PyOverflowError>(obj.py()) => obj
            .extract::<u64>()
            .map(|v| v as i128)
            .map_err(|e| embedded_error(obj, ty, e)),
        Err(err) => Err(embedded_error(obj, ty, err)),
    }
}

fn narrow<T: TryFrom<i128>>(
    obj: &Bound<'_, PyAny>,
    ty: &ValueType,
    value: i128,
    wrap: fn(T) -> TypedValue,
) -> Result<TypedValue, ConversionError> {
    T::try_from(value)
        .map(wrap)
        .map_err(|_| ConversionError::out_of_range(ty, obj.str().map(|s| s.to_string()).unwrap_or_default()))
}

fn extract_float(obj: &Bound<'_, PyAny>, ty: &ValueType) -> Result<f64, ConversionError> {
    if obj.is_instance_of::<PyFloat>() || obj.is_instance_of::<PyInt>() {
        obj.extract::<f64>().map_err(|e| embedded_error(obj, ty, e))
    } else {
        Err(ConversionError::mismatch(ty, type_name(obj)))
    }
}

/// Finite values beyond `f32::MAX` are out of range; infinities and NaN pass
fn narrow_float(ty: &ValueType, v: f64) -> Result<f32, ConversionError> {
    if v.is_finite() && v.abs() > f32::MAX as f64 {
        return Err(ConversionError::out_of_range(ty, v));
    }
    Ok(v as f32)
}

fn extract_complex(obj: &Bound<'_, PyAny>, ty: &ValueType) -> Result<(f64, f64), ConversionError> {
    if let Ok(c) = obj.downcast::<PyComplex>() {
        return Ok((c.real(), c.imag()));
    }
    extract_float(obj, ty).map(|re| (re, 0.0))
}

/// `str` must be valid UTF-8 (no lone surrogates), `bytes` are decoded
/// strictly, any other object is converted with `str()`
fn extract_string(obj: &Bound<'_, PyAny>, ty: &ValueType) -> Result<String, ConversionError> {
    if let Ok(s) = obj.downcast::<PyString>() {
        return s
            .to_str()
            .map(str::to_owned)
            .map_err(|e| embedded_error(obj, ty, e));
    }
    if let Ok(b) = obj.downcast::<PyBytes>() {
        return std::str::from_utf8(b.as_bytes())
            .map(str::to_owned)
            .map_err(|e| ConversionError::InvalidEncoding(e.to_string()));
    }
    let text = obj.str().map_err(|e| embedded_error(obj, ty, e))?;
    text.to_str()
        .map(str::to_owned)
        .map_err(|e| embedded_error(obj, ty, e))
}

fn extract_blob(obj: &Bound<'_, PyAny>, ty: &ValueType) -> Result<Bytes, ConversionError> {
    if let Ok(b) = obj.downcast::<PyBytes>() {
        return Ok(Bytes::copy_from_slice(b.as_bytes()));
    }
    if let Ok(b) = obj.downcast::<PyByteArray>() {
        return Ok(Bytes::from(b.to_vec()));
    }
    if obj.is_instance_of::<PyMemoryView>() {
        let copied = obj
            .call_method0("tobytes")
            .map_err(|e| embedded_error(obj, ty, e))?;
        let copied = copied
            .downcast::<PyBytes>()
            .map_err(|_| ConversionError::mismatch(ty, type_name(&copied)))?;
        return Ok(Bytes::copy_from_slice(copied.as_bytes()));
    }
    Err(ConversionError::mismatch(ty, type_name(obj)))
}

fn extract_timestamp(obj: &Bound<'_, PyAny>, ty: &ValueType) -> Result<Timestamp, ConversionError> {
    let py = obj.py();
    let helpers = runtime::helpers()?;
    let parts = helpers.timestamp_parts.call1(py, (obj,)).map_err(|e| {
        if e.is_instance_of::<PyValueError>(py) {
            ConversionError::InvalidTimestamp(e.value(py).to_string())
        } else {
            embedded_error(obj, ty, e)
        }
    })?;
    let (seconds, nanoseconds, machine_id): (i64, i64, i64) =
        parts.extract(py).map_err(|e| embedded_error(obj, ty, e))?;
    Timestamp::from_parts(seconds, nanoseconds, machine_id)
}

/// Elements of a list or set source; text, bytes and mappings are refused
fn iterate<'py>(
    obj: &Bound<'py, PyAny>,
    ty: &ValueType,
) -> Result<impl Iterator<Item = Bound<'py, PyAny>>, ConversionError> {
    if obj.is_instance_of::<PyString>() || obj.is_instance_of::<PyBytes>() || obj.is_instance_of::<PyDict>() {
        return Err(ConversionError::mismatch(ty, type_name(obj)));
    }
    let items = obj
        .try_iter()
        .map_err(|e| embedded_error(obj, ty, e))?
        .collect::<PyResult<Vec<_>>>()
        .map_err(|e| embedded_error(obj, ty, e))?;
    Ok(items.into_iter())
}

/// Key/value pairs of a dict, or of any object with an `items()` method
fn map_items<'py>(
    obj: &Bound<'py, PyAny>,
    ty: &ValueType,
) -> Result<Vec<(Bound<'py, PyAny>, Bound<'py, PyAny>)>, ConversionError> {
    if let Ok(dict) = obj.downcast::<PyDict>() {
        return Ok(dict.iter().collect());
    }
    if !obj.hasattr("items").unwrap_or(false) {
        return Err(ConversionError::mismatch(ty, type_name(obj)));
    }
    let items = obj.call_method0("items").map_err(|e| embedded_error(obj, ty, e))?;
    let mut pairs = Vec::new();
    for pair in items.try_iter().map_err(|e| embedded_error(obj, ty, e))? {
        let pair = pair.map_err(|e| embedded_error(obj, ty, e))?;
        let pair = pair
            .extract::<(Bound<'py, PyAny>, Bound<'py, PyAny>)>()
            .map_err(|e| embedded_error(obj, ty, e))?;
        pairs.push(pair);
    }
    Ok(pairs)
}
