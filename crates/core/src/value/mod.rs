//! Host-side typed values
//!
//! [`TypedValue`] is the closed set of record values a stage exchanges with
//! embedded code. Every variant has a total order so that sets and map keys
//! live in `BTreeSet`/`BTreeMap`; floating-point variants use the IEEE total
//! order, which makes equality bit-exact.

mod decimal;
pub mod json;
mod scalar;
mod types;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

pub use decimal::{Decimal, DecimalWidth};
pub use scalar::{Complex32, Complex64, Timestamp};
pub use types::ValueType;

#[derive(Debug, Clone)]
pub enum TypedValue {
    Boolean(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Decimal(Decimal),
    Complex32(Complex32),
    Complex64(Complex64),
    String(String),
    Blob(Bytes),
    Timestamp(Timestamp),
    List(Vec<TypedValue>),
    Set(BTreeSet<TypedValue>),
    Map(BTreeMap<TypedValue, TypedValue>),
    Optional(Option<Box<TypedValue>>),
}

impl TypedValue {
    pub fn none() -> Self {
        TypedValue::Optional(None)
    }

    pub fn some(value: TypedValue) -> Self {
        TypedValue::Optional(Some(Box::new(value)))
    }

    pub fn blob(data: impl Into<Bytes>) -> Self {
        TypedValue::Blob(data.into())
    }

    /// Short type name for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            TypedValue::Boolean(_) => "boolean",
            TypedValue::Int8(_) => "int8",
            TypedValue::Int16(_) => "int16",
            TypedValue::Int32(_) => "int32",
            TypedValue::Int64(_) => "int64",
            TypedValue::UInt8(_) => "uint8",
            TypedValue::UInt16(_) => "uint16",
            TypedValue::UInt32(_) => "uint32",
            TypedValue::UInt64(_) => "uint64",
            TypedValue::Float32(_) => "float32",
            TypedValue::Float64(_) => "float64",
            TypedValue::Decimal(d) => d.width().type_name(),
            TypedValue::Complex32(_) => "complex32",
            TypedValue::Complex64(_) => "complex64",
            TypedValue::String(_) => "rstring",
            TypedValue::Blob(_) => "blob",
            TypedValue::Timestamp(_) => "timestamp",
            TypedValue::List(_) => "list",
            TypedValue::Set(_) => "set",
            TypedValue::Map(_) => "map",
            TypedValue::Optional(_) => "optional",
        }
    }

    /// Whether this value can be carried by a slot declared as `ty`
    pub fn conforms_to(&self, ty: &ValueType) -> bool {
        match (self, ty) {
            (TypedValue::Boolean(_), ValueType::Boolean)
            | (TypedValue::Int8(_), ValueType::Int8)
            | (TypedValue::Int16(_), ValueType::Int16)
            | (TypedValue::Int32(_), ValueType::Int32)
            | (TypedValue::Int64(_), ValueType::Int64)
            | (TypedValue::UInt8(_), ValueType::UInt8)
            | (TypedValue::UInt16(_), ValueType::UInt16)
            | (TypedValue::UInt32(_), ValueType::UInt32)
            | (TypedValue::UInt64(_), ValueType::UInt64)
            | (TypedValue::Float32(_), ValueType::Float32)
            | (TypedValue::Float64(_), ValueType::Float64)
            | (TypedValue::Complex32(_), ValueType::Complex32)
            | (TypedValue::Complex64(_), ValueType::Complex64)
            | (TypedValue::String(_), ValueType::String)
            | (TypedValue::Blob(_), ValueType::Blob)
            | (TypedValue::Timestamp(_), ValueType::Timestamp) => true,
            (TypedValue::Decimal(d), ValueType::Decimal(w)) => d.width() == *w,
            (TypedValue::List(items), ValueType::List(e)) => items.iter().all(|v| v.conforms_to(e)),
            (TypedValue::Set(items), ValueType::Set(e)) => items.iter().all(|v| v.conforms_to(e)),
            (TypedValue::Map(entries), ValueType::Map(k, v)) => entries
                .iter()
                .all(|(key, value)| key.conforms_to(k) && value.conforms_to(v)),
            (TypedValue::Optional(None), ValueType::Optional(_)) => true,
            (TypedValue::Optional(Some(inner)), ValueType::Optional(e)) => inner.conforms_to(e),
            _ => false,
        }
    }

    /// Integer variants widened to `i128`
    pub fn as_integer(&self) -> Option<i128> {
        Some(match *self {
            TypedValue::Int8(v) => v as i128,
            TypedValue::Int16(v) => v as i128,
            TypedValue::Int32(v) => v as i128,
            TypedValue::Int64(v) => v as i128,
            TypedValue::UInt8(v) => v as i128,
            TypedValue::UInt16(v) => v as i128,
            TypedValue::UInt32(v) => v as i128,
            TypedValue::UInt64(v) => v as i128,
            _ => return None,
        })
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TypedValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TypedValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            TypedValue::Blob(b) => Some(b),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            TypedValue::Boolean(_) => 0,
            TypedValue::Int8(_) => 1,
            TypedValue::Int16(_) => 2,
            TypedValue::Int32(_) => 3,
            TypedValue::Int64(_) => 4,
            TypedValue::UInt8(_) => 5,
            TypedValue::UInt16(_) => 6,
            TypedValue::UInt32(_) => 7,
            TypedValue::UInt64(_) => 8,
            TypedValue::Float32(_) => 9,
            TypedValue::Float64(_) => 10,
            TypedValue::Decimal(_) => 11,
            TypedValue::Complex32(_) => 12,
            TypedValue::Complex64(_) => 13,
            TypedValue::String(_) => 14,
            TypedValue::Blob(_) => 15,
            TypedValue::Timestamp(_) => 16,
            TypedValue::List(_) => 17,
            TypedValue::Set(_) => 18,
            TypedValue::Map(_) => 19,
            TypedValue::Optional(_) => 20,
        }
    }
}

impl Ord for TypedValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use TypedValue::*;
        match (self, other) {
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Int8(a), Int8(b)) => a.cmp(b),
            (Int16(a), Int16(b)) => a.cmp(b),
            (Int32(a), Int32(b)) => a.cmp(b),
            (Int64(a), Int64(b)) => a.cmp(b),
            (UInt8(a), UInt8(b)) => a.cmp(b),
            (UInt16(a), UInt16(b)) => a.cmp(b),
            (UInt32(a), UInt32(b)) => a.cmp(b),
            (UInt64(a), UInt64(b)) => a.cmp(b),
            (Float32(a), Float32(b)) => a.total_cmp(b),
            (Float64(a), Float64(b)) => a.total_cmp(b),
            (Decimal(a), Decimal(b)) => a.cmp(b),
            (Complex32(a), Complex32(b)) => a.cmp(b),
            (Complex64(a), Complex64(b)) => a.cmp(b),
            (String(a), String(b)) => a.cmp(b),
            (Blob(a), Blob(b)) => a.cmp(b),
            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            (List(a), List(b)) => a.cmp(b),
            (Set(a), Set(b)) => a.cmp(b),
            (Map(a), Map(b)) => a.cmp(b),
            (Optional(a), Optional(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for TypedValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TypedValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TypedValue {}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for TypedValue {
                fn from(v: $ty) -> Self {
                    TypedValue::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    bool => Boolean,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
    Decimal => Decimal,
    Complex32 => Complex32,
    Complex64 => Complex64,
    String => String,
    Bytes => Blob,
    Timestamp => Timestamp,
    Vec<TypedValue> => List,
    BTreeSet<TypedValue> => Set,
    BTreeMap<TypedValue, TypedValue> => Map,
}

impl From<&str> for TypedValue {
    fn from(v: &str) -> Self {
        TypedValue::String(v.to_string())
    }
}
