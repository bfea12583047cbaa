//! Declared value types and their textual form (`list<int32>`, `map<rstring,float64>`)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::decimal::DecimalWidth;
use crate::error::Error;

/// The declared type of a host value, mirroring [`super::TypedValue`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ValueType {
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Decimal(DecimalWidth),
    Complex32,
    Complex64,
    String,
    Blob,
    Timestamp,
    List(Box<ValueType>),
    Set(Box<ValueType>),
    Map(Box<ValueType>, Box<ValueType>),
    Optional(Box<ValueType>),
}

impl ValueType {
    pub fn list(element: ValueType) -> Self {
        ValueType::List(Box::new(element))
    }

    pub fn set(element: ValueType) -> Self {
        ValueType::Set(Box::new(element))
    }

    pub fn map(key: ValueType, value: ValueType) -> Self {
        ValueType::Map(Box::new(key), Box::new(value))
    }

    pub fn optional(inner: ValueType) -> Self {
        ValueType::Optional(Box::new(inner))
    }

    pub fn is_integral(&self) -> bool {
        matches!(
            self,
            ValueType::Int8
                | ValueType::Int16
                | ValueType::Int32
                | ValueType::Int64
                | ValueType::UInt8
                | ValueType::UInt16
                | ValueType::UInt32
                | ValueType::UInt64
        )
    }

    pub fn is_optional(&self) -> bool {
        matches!(self, ValueType::Optional(_))
    }

    fn primitive(name: &str) -> Option<ValueType> {
        Some(match name {
            "boolean" | "bool" => ValueType::Boolean,
            "int8" => ValueType::Int8,
            "int16" => ValueType::Int16,
            "int32" => ValueType::Int32,
            "int64" => ValueType::Int64,
            "uint8" => ValueType::UInt8,
            "uint16" => ValueType::UInt16,
            "uint32" => ValueType::UInt32,
            "uint64" => ValueType::UInt64,
            "float32" => ValueType::Float32,
            "float64" => ValueType::Float64,
            "decimal32" => ValueType::Decimal(DecimalWidth::Decimal32),
            "decimal64" => ValueType::Decimal(DecimalWidth::Decimal64),
            "decimal128" => ValueType::Decimal(DecimalWidth::Decimal128),
            "complex32" => ValueType::Complex32,
            "complex64" => ValueType::Complex64,
            "rstring" | "ustring" | "string" => ValueType::String,
            "blob" => ValueType::Blob,
            "timestamp" => ValueType::Timestamp,
            _ => return None,
        })
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Boolean => f.write_str("boolean"),
            ValueType::Int8 => f.write_str("int8"),
            ValueType::Int16 => f.write_str("int16"),
            ValueType::Int32 => f.write_str("int32"),
            ValueType::Int64 => f.write_str("int64"),
            ValueType::UInt8 => f.write_str("uint8"),
            ValueType::UInt16 => f.write_str("uint16"),
            ValueType::UInt32 => f.write_str("uint32"),
            ValueType::UInt64 => f.write_str("uint64"),
            ValueType::Float32 => f.write_str("float32"),
            ValueType::Float64 => f.write_str("float64"),
            ValueType::Decimal(width) => f.write_str(width.type_name()),
            ValueType::Complex32 => f.write_str("complex32"),
            ValueType::Complex64 => f.write_str("complex64"),
            ValueType::String => f.write_str("rstring"),
            ValueType::Blob => f.write_str("blob"),
            ValueType::Timestamp => f.write_str("timestamp"),
            ValueType::List(e) => write!(f, "list<{}>", e),
            ValueType::Set(e) => write!(f, "set<{}>", e),
            ValueType::Map(k, v) => write!(f, "map<{},{}>", k, v),
            ValueType::Optional(e) => write!(f, "optional<{}>", e),
        }
    }
}

struct TypeParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> TypeParser<'a> {
    fn error(&self, what: &str) -> Error {
        Error::ConfigError(format!(
            "invalid type '{}' at offset {}: {}",
            self.input, self.pos, what
        ))
    }

    fn skip_ws(&mut self) {
        let rest = &self.input[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn expect(&mut self, c: char) -> Result<(), Error> {
        self.skip_ws();
        if self.input[self.pos..].starts_with(c) {
            self.pos += c.len_utf8();
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", c)))
        }
    }

    fn ident(&mut self) -> &'a str {
        self.skip_ws();
        let rest = &self.input[self.pos..];
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    fn parse(&mut self) -> Result<ValueType, Error> {
        let name = self.ident();
        match name {
            "list" | "set" | "optional" => {
                self.expect('<')?;
                let inner = self.parse()?;
                self.expect('>')?;
                Ok(match name {
                    "list" => ValueType::list(inner),
                    "set" => ValueType::set(inner),
                    _ => ValueType::optional(inner),
                })
            }
            "map" => {
                self.expect('<')?;
                let key = self.parse()?;
                self.expect(',')?;
                let value = self.parse()?;
                self.expect('>')?;
                Ok(ValueType::map(key, value))
            }
            "" => Err(self.error("expected a type name")),
            other => ValueType::primitive(other)
                .ok_or_else(|| self.error(&format!("unknown type '{}'", other))),
        }
    }
}

impl FromStr for ValueType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = TypeParser { input: s, pos: 0 };
        let ty = parser.parse()?;
        parser.skip_ws();
        if parser.pos != s.len() {
            return Err(parser.error("trailing characters"));
        }
        Ok(ty)
    }
}

impl TryFrom<String> for ValueType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ValueType> for String {
    fn from(value: ValueType) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested() {
        let ty: ValueType = "map< rstring , list<optional<decimal64>> >".parse().unwrap();
        assert_eq!(
            ty,
            ValueType::map(
                ValueType::String,
                ValueType::list(ValueType::optional(ValueType::Decimal(DecimalWidth::Decimal64)))
            )
        );
        assert_eq!(ty.to_string(), "map<rstring,list<optional<decimal64>>>");
    }

    #[test]
    fn test_parse_errors() {
        for text in ["", "int", "list<int32", "map<int32>", "set<blob>>", "list<>"] {
            assert!(text.parse::<ValueType>().is_err(), "{} should fail", text);
        }
    }

    #[test]
    fn test_serde_as_string() {
        #[derive(Deserialize)]
        struct Port {
            ty: ValueType,
        }
        let port: Port = toml::from_str("ty = \"set<uint16>\"").unwrap();
        assert_eq!(port.ty, ValueType::set(ValueType::UInt16));
    }
}
