//! Decimals cross the boundary as scientific-notation text
//!
//! Binary floats never appear on the way: host decimals become
//! `decimal.Decimal` through their string form, and embedded numbers are
//! formatted by the interpreter at the precision of the target width before
//! the host parses them. Integral values skip the text round trip.

use pyo3::exceptions::{PyArithmeticError, PyTypeError};
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyInt, PyString};

use pyflow_core::value::{Decimal, DecimalWidth};
use pyflow_core::{ConversionError, TypedValue};

use super::type_name;
use crate::runtime;

pub(crate) fn to_embedded<'py>(py: Python<'py>, value: &Decimal) -> Result<Bound<'py, PyAny>, ConversionError> {
    let helpers = runtime::helpers()?;
    let created = match value.to_integral() {
        Some(integral) => helpers.decimal.call1(py, (integral,)),
        None => helpers.decimal.call1(py, (value.to_string(),)),
    };
    created
        .map(|d| d.into_bound(py))
        .map_err(|e| ConversionError::Embedded(format!("decimal {}: {}", value, e.value(py))))
}

pub(crate) fn from_embedded(obj: &Bound<'_, PyAny>, width: DecimalWidth) -> Result<TypedValue, ConversionError> {
    let py = obj.py();
    if obj.is_instance_of::<PyBool>() || obj.is_instance_of::<PyString>() {
        return Err(ConversionError::mismatch(width, type_name(obj)));
    }

    // int fast path, as long as no rounding is needed
    if obj.is_instance_of::<PyInt>() {
        if let Ok(integral) = obj.extract::<i64>() {
            if let Ok(decimal) = Decimal::from_i64(width, integral) {
                return Ok(TypedValue::Decimal(decimal));
            }
        }
    }

    let helpers = runtime::helpers()?;
    let text: String = helpers
        .decimal_text
        .call1(py, (obj, width.precision()))
        .and_then(|t| t.extract(py))
        .map_err(|e| {
            if e.is_instance_of::<PyTypeError>(py) {
                ConversionError::mismatch(width, type_name(obj))
            } else if e.is_instance_of::<PyArithmeticError>(py) {
                ConversionError::InvalidDecimal(e.value(py).to_string())
            } else {
                ConversionError::Embedded(e.value(py).to_string())
            }
        })?;
    Decimal::parse(width, &text).map(TypedValue::Decimal)
}
