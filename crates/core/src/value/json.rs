//! JSON mapping of typed values, driven by a declared [`ValueType`]
//!
//! - blob → base64 string
//! - decimal → string in scientific notation
//! - timestamp → `{"seconds", "nanoseconds", "machine_id"}`
//! - complex → `[re, im]`
//! - map → object when keys are strings, otherwise `[[k, v], ...]`
//! - optional → `null` or the inner value

use std::collections::{BTreeMap, BTreeSet};

use base64::Engine;
use serde_json::{Map, Number, Value};

use super::{Complex32, Complex64, Decimal, Timestamp, TypedValue, ValueType};
use crate::error::ConversionError;

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn float_json(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

impl TypedValue {
    pub fn to_json(&self) -> Value {
        match self {
            TypedValue::Boolean(b) => Value::Bool(*b),
            TypedValue::Int8(v) => Value::from(*v),
            TypedValue::Int16(v) => Value::from(*v),
            TypedValue::Int32(v) => Value::from(*v),
            TypedValue::Int64(v) => Value::from(*v),
            TypedValue::UInt8(v) => Value::from(*v),
            TypedValue::UInt16(v) => Value::from(*v),
            TypedValue::UInt32(v) => Value::from(*v),
            TypedValue::UInt64(v) => Value::from(*v),
            TypedValue::Float32(v) => float_json(*v as f64),
            TypedValue::Float64(v) => float_json(*v),
            TypedValue::Decimal(d) => Value::String(d.to_string()),
            TypedValue::Complex32(c) => Value::Array(vec![float_json(c.re as f64), float_json(c.im as f64)]),
            TypedValue::Complex64(c) => Value::Array(vec![float_json(c.re), float_json(c.im)]),
            TypedValue::String(s) => Value::String(s.clone()),
            TypedValue::Blob(b) => Value::String(base64::engine::general_purpose::STANDARD.encode(b)),
            TypedValue::Timestamp(ts) => serde_json::json!({
                "seconds": ts.seconds(),
                "nanoseconds": ts.nanoseconds(),
                "machine_id": ts.machine_id(),
            }),
            TypedValue::List(items) => Value::Array(items.iter().map(TypedValue::to_json).collect()),
            TypedValue::Set(items) => Value::Array(items.iter().map(TypedValue::to_json).collect()),
            TypedValue::Map(entries) => {
                if entries.keys().all(|k| matches!(k, TypedValue::String(_))) {
                    let mut object = Map::new();
                    for (k, v) in entries {
                        if let TypedValue::String(key) = k {
                            object.insert(key.clone(), v.to_json());
                        }
                    }
                    Value::Object(object)
                } else {
                    Value::Array(
                        entries
                            .iter()
                            .map(|(k, v)| Value::Array(vec![k.to_json(), v.to_json()]))
                            .collect(),
                    )
                }
            }
            TypedValue::Optional(None) => Value::Null,
            TypedValue::Optional(Some(inner)) => inner.to_json(),
        }
    }

    pub fn from_json(value: &Value, ty: &ValueType) -> Result<TypedValue, ConversionError> {
        let mismatch = || ConversionError::mismatch(ty, json_kind(value));

        macro_rules! integer {
            ($variant:ident, $int:ty) => {{
                let wide = value
                    .as_i64()
                    .map(i128::from)
                    .or_else(|| value.as_u64().map(i128::from))
                    .ok_or_else(mismatch)?;
                <$int>::try_from(wide)
                    .map(TypedValue::$variant)
                    .map_err(|_| ConversionError::out_of_range(ty, wide))
            }};
        }

        match ty {
            ValueType::Boolean => value.as_bool().map(TypedValue::Boolean).ok_or_else(mismatch),
            ValueType::Int8 => integer!(Int8, i8),
            ValueType::Int16 => integer!(Int16, i16),
            ValueType::Int32 => integer!(Int32, i32),
            ValueType::Int64 => integer!(Int64, i64),
            ValueType::UInt8 => integer!(UInt8, u8),
            ValueType::UInt16 => integer!(UInt16, u16),
            ValueType::UInt32 => integer!(UInt32, u32),
            ValueType::UInt64 => integer!(UInt64, u64),
            ValueType::Float32 => value
                .as_f64()
                .map(|f| TypedValue::Float32(f as f32))
                .ok_or_else(mismatch),
            ValueType::Float64 => value.as_f64().map(TypedValue::Float64).ok_or_else(mismatch),
            ValueType::Decimal(width) => match value {
                Value::String(s) => Decimal::parse(*width, s).map(TypedValue::Decimal),
                Value::Number(n) => Decimal::parse(*width, &n.to_string()).map(TypedValue::Decimal),
                _ => Err(mismatch()),
            },
            ValueType::Complex32 | ValueType::Complex64 => {
                let parts = value.as_array().filter(|a| a.len() == 2).ok_or_else(mismatch)?;
                let re = parts[0].as_f64().ok_or_else(mismatch)?;
                let im = parts[1].as_f64().ok_or_else(mismatch)?;
                Ok(match ty {
                    ValueType::Complex32 => TypedValue::Complex32(Complex32::new(re as f32, im as f32)),
                    _ => TypedValue::Complex64(Complex64::new(re, im)),
                })
            }
            ValueType::String => value
                .as_str()
                .map(|s| TypedValue::String(s.to_string()))
                .ok_or_else(mismatch),
            ValueType::Blob => {
                let text = value.as_str().ok_or_else(mismatch)?;
                base64::engine::general_purpose::STANDARD
                    .decode(text)
                    .map(TypedValue::blob)
                    .map_err(|e| ConversionError::InvalidEncoding(format!("base64 blob: {}", e)))
            }
            ValueType::Timestamp => {
                let object = value.as_object().ok_or_else(mismatch)?;
                let field = |name: &str| object.get(name).and_then(Value::as_i64).unwrap_or(0);
                Timestamp::from_parts(field("seconds"), field("nanoseconds"), field("machine_id"))
                    .map(TypedValue::Timestamp)
            }
            ValueType::List(element) => {
                let items = value.as_array().ok_or_else(mismatch)?;
                items
                    .iter()
                    .map(|item| TypedValue::from_json(item, element))
                    .collect::<Result<Vec<_>, _>>()
                    .map(TypedValue::List)
            }
            ValueType::Set(element) => {
                let items = value.as_array().ok_or_else(mismatch)?;
                items
                    .iter()
                    .map(|item| TypedValue::from_json(item, element))
                    .collect::<Result<BTreeSet<_>, _>>()
                    .map(TypedValue::Set)
            }
            ValueType::Map(key_ty, value_ty) => {
                let mut entries = BTreeMap::new();
                match value {
                    Value::Object(object) => {
                        for (k, v) in object {
                            let key = match key_ty.as_ref() {
                                ValueType::String => TypedValue::String(k.clone()),
                                other => {
                                    let parsed: Value = serde_json::from_str(k)
                                        .unwrap_or_else(|_| Value::String(k.clone()));
                                    TypedValue::from_json(&parsed, other)?
                                }
                            };
                            entries.insert(key, TypedValue::from_json(v, value_ty)?);
                        }
                    }
                    Value::Array(pairs) => {
                        for pair in pairs {
                            let kv = pair.as_array().filter(|p| p.len() == 2).ok_or_else(mismatch)?;
                            entries.insert(
                                TypedValue::from_json(&kv[0], key_ty)?,
                                TypedValue::from_json(&kv[1], value_ty)?,
                            );
                        }
                    }
                    _ => return Err(mismatch()),
                }
                Ok(TypedValue::Map(entries))
            }
            ValueType::Optional(inner) => match value {
                Value::Null => Ok(TypedValue::none()),
                other => TypedValue::from_json(other, inner).map(TypedValue::some),
            },
        }
    }
}
