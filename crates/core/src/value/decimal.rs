//! Fixed-width decimal values
//!
//! A [`Decimal`] is `coefficient * 10^exponent`, kept normalized (no trailing
//! zeros in the coefficient) so that numerically equal values of the same
//! width compare equal. Widths follow IEEE 754 decimal32/64/128.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConversionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecimalWidth {
    Decimal32,
    Decimal64,
    Decimal128,
}

impl DecimalWidth {
    /// Significant digits
    pub const fn precision(self) -> u32 {
        match self {
            DecimalWidth::Decimal32 => 7,
            DecimalWidth::Decimal64 => 16,
            DecimalWidth::Decimal128 => 34,
        }
    }

    /// Largest adjusted exponent (exponent of the leading digit)
    pub const fn emax(self) -> i32 {
        match self {
            DecimalWidth::Decimal32 => 96,
            DecimalWidth::Decimal64 => 384,
            DecimalWidth::Decimal128 => 6144,
        }
    }

    /// Smallest normal adjusted exponent
    pub const fn emin(self) -> i32 {
        1 - self.emax()
    }

    /// Smallest exponent of the least significant digit (subnormal floor)
    pub const fn etiny(self) -> i32 {
        self.emin() - (self.precision() as i32 - 1)
    }

    pub const fn type_name(self) -> &'static str {
        match self {
            DecimalWidth::Decimal32 => "decimal32",
            DecimalWidth::Decimal64 => "decimal64",
            DecimalWidth::Decimal128 => "decimal128",
        }
    }
}

impl fmt::Display for DecimalWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// A decimal floating-point value of a fixed width
#[derive(Debug, Clone, Copy, Hash)]
pub struct Decimal {
    width: DecimalWidth,
    coefficient: i128,
    exponent: i32,
}

fn digit_count(mut n: u128) -> u32 {
    if n == 0 {
        return 1;
    }
    let mut count = 0;
    while n > 0 {
        n /= 10;
        count += 1;
    }
    count
}

impl Decimal {
    /// Build and normalize; rejects values that need rounding or overflow the width
    pub fn new(width: DecimalWidth, coefficient: i128, exponent: i32) -> Result<Self, ConversionError> {
        let (mut coefficient, mut exponent) = (coefficient, exponent);
        if coefficient == 0 {
            exponent = 0;
        }
        while coefficient != 0 && coefficient % 10 == 0 {
            coefficient /= 10;
            exponent = exponent.checked_add(1).ok_or_else(|| {
                ConversionError::out_of_range(width, format!("{}E{}", coefficient, exponent))
            })?;
        }

        let digits = digit_count(coefficient.unsigned_abs());
        if digits > width.precision() {
            return Err(ConversionError::InvalidDecimal(format!(
                "{} significant digits exceed {} precision of {}",
                digits,
                width.precision(),
                width
            )));
        }

        let adjusted = i64::from(exponent) + i64::from(digits) - 1;
        if coefficient != 0 && (adjusted > i64::from(width.emax()) || exponent < width.etiny()) {
            return Err(ConversionError::out_of_range(width, format!("{}E{}", coefficient, exponent)));
        }
        Ok(Decimal {
            width,
            coefficient,
            exponent,
        })
    }

    pub fn zero(width: DecimalWidth) -> Self {
        Decimal {
            width,
            coefficient: 0,
            exponent: 0,
        }
    }

    pub fn from_i64(width: DecimalWidth, value: i64) -> Result<Self, ConversionError> {
        Self::new(width, value as i128, 0)
    }

    /// Parse plain or scientific notation (`-12.50`, `1.25E+3`)
    pub fn parse(width: DecimalWidth, text: &str) -> Result<Self, ConversionError> {
        let invalid = || ConversionError::InvalidDecimal(text.to_string());
        let trimmed = text.trim();
        let (negative, rest) = match trimmed.as_bytes().first() {
            Some(b'-') => (true, &trimmed[1..]),
            Some(b'+') => (false, &trimmed[1..]),
            _ => (false, trimmed),
        };

        let (mantissa, exp_part) = match rest.find(['e', 'E']) {
            Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
            None => (rest, None),
        };
        let exponent: i64 = match exp_part {
            Some(e) => e.parse::<i64>().map_err(|_| invalid())?,
            None => 0,
        };

        let (int_part, frac_part) = match mantissa.split_once('.') {
            Some((i, f)) => (i, f),
            None => (mantissa, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let mut digits: String = int_part.chars().chain(frac_part.chars()).collect();
        let significant = digits.trim_start_matches('0').len();
        digits.drain(..digits.len() - significant);
        if digits.is_empty() {
            return Ok(Self::zero(width));
        }
        let trailing = digits.len() - digits.trim_end_matches('0').len();
        digits.truncate(digits.len() - trailing);
        let exponent = i64::try_from(trailing)
            .ok()
            .zip(i64::try_from(frac_part.len()).ok())
            .and_then(|(trailing, frac)| exponent.checked_sub(frac)?.checked_add(trailing))
            .ok_or_else(|| ConversionError::out_of_range(width, text))?;
        if digits.len() as u32 > width.precision() {
            return Err(ConversionError::InvalidDecimal(format!(
                "{} has more than {} significant digits",
                text,
                width.precision()
            )));
        }

        let magnitude: i128 = digits.parse().map_err(|_| invalid())?;
        let exponent = i32::try_from(exponent)
            .map_err(|_| ConversionError::out_of_range(width, text))?;
        Self::new(width, if negative { -magnitude } else { magnitude }, exponent)
    }

    pub fn width(&self) -> DecimalWidth {
        self.width
    }

    pub fn coefficient(&self) -> i128 {
        self.coefficient
    }

    pub fn exponent(&self) -> i32 {
        self.exponent
    }

    pub fn is_zero(&self) -> bool {
        self.coefficient == 0
    }

    /// Exponent of the most significant digit
    pub fn adjusted_exponent(&self) -> i32 {
        self.exponent + digit_count(self.coefficient.unsigned_abs()) as i32 - 1
    }

    /// Exact integer value when the decimal has no fractional part and fits
    pub fn to_integral(&self) -> Option<i128> {
        if self.exponent < 0 {
            return None;
        }
        let scale = 10i128.checked_pow(self.exponent as u32)?;
        self.coefficient.checked_mul(scale)
    }

    /// Rewiden to another width, failing when precision or range is exceeded
    pub fn with_width(&self, width: DecimalWidth) -> Result<Self, ConversionError> {
        Self::new(width, self.coefficient, self.exponent)
    }

    fn magnitude_cmp(&self, other: &Self) -> Ordering {
        match self.adjusted_exponent().cmp(&other.adjusted_exponent()) {
            Ordering::Equal => {
                let a = self.coefficient.unsigned_abs().to_string();
                let b = other.coefficient.unsigned_abs().to_string();
                let len = a.len().max(b.len());
                format!("{:0<len$}", a, len = len).cmp(&format!("{:0<len$}", b, len = len))
            }
            unequal => unequal,
        }
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_value = match self.coefficient.signum().cmp(&other.coefficient.signum()) {
            Ordering::Equal if self.coefficient == 0 => Ordering::Equal,
            Ordering::Equal if self.coefficient > 0 => self.magnitude_cmp(other),
            Ordering::Equal => other.magnitude_cmp(self),
            unequal => unequal,
        };
        by_value.then(self.width.cmp(&other.width))
    }
}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Decimal {}

/// Normalized scientific notation: `-1.25E+3`, `0E+0`
impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.coefficient.unsigned_abs().to_string();
        if self.coefficient < 0 {
            f.write_str("-")?;
        }
        let (lead, tail) = digits.split_at(1);
        f.write_str(lead)?;
        if !tail.is_empty() {
            write!(f, ".{}", tail)?;
        }
        let adjusted = self.adjusted_exponent();
        write!(f, "E{}{}", if adjusted < 0 { '-' } else { '+' }, adjusted.abs())
    }
}

impl FromStr for Decimal {
    type Err = ConversionError;

    /// Parses as decimal128; use [`Decimal::parse`] for other widths
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::parse(DecimalWidth::Decimal128, s)
    }
}
