//! Complex numbers and timestamps

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConversionError;

macro_rules! complex_type {
    ($name:ident, $float:ty) => {
        /// Complex number ordered by the IEEE total order of (re, im)
        #[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
        pub struct $name {
            pub re: $float,
            pub im: $float,
        }

        impl $name {
            pub const fn new(re: $float, im: $float) -> Self {
                Self { re, im }
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                self.re
                    .total_cmp(&other.re)
                    .then(self.im.total_cmp(&other.im))
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.cmp(other) == Ordering::Equal
            }
        }

        impl Eq for $name {}

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "({}{:+}j)", self.re, self.im)
            }
        }
    };
}

complex_type!(Complex32, f32);
complex_type!(Complex64, f64);

/// Point in time: seconds since the epoch, nanoseconds, and the id of the
/// machine that produced it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    seconds: i64,
    nanoseconds: u32,
    #[serde(default)]
    machine_id: i32,
}

impl Timestamp {
    pub const NANOS_PER_SECOND: u32 = 1_000_000_000;

    pub fn new(seconds: i64, nanoseconds: u32, machine_id: i32) -> Result<Self, ConversionError> {
        if nanoseconds >= Self::NANOS_PER_SECOND {
            return Err(ConversionError::InvalidTimestamp(format!(
                "nanoseconds {} not below one second",
                nanoseconds
            )));
        }
        Ok(Timestamp {
            seconds,
            nanoseconds,
            machine_id,
        })
    }

    /// Accepts the wide integers produced by the embedded decomposer
    pub fn from_parts(seconds: i64, nanoseconds: i64, machine_id: i64) -> Result<Self, ConversionError> {
        let nanoseconds = u32::try_from(nanoseconds)
            .map_err(|_| ConversionError::InvalidTimestamp(format!("nanoseconds {}", nanoseconds)))?;
        let machine_id = i32::try_from(machine_id)
            .map_err(|_| ConversionError::out_of_range("timestamp machine id", machine_id))?;
        Self::new(seconds, nanoseconds, machine_id)
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    pub fn nanoseconds(&self) -> u32 {
        self.nanoseconds
    }

    pub fn machine_id(&self) -> i32 {
        self.machine_id
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}@{}", self.seconds, self.nanoseconds, self.machine_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_validation() {
        assert!(Timestamp::new(10, 999_999_999, 0).is_ok());
        assert!(Timestamp::new(10, 1_000_000_000, 0).is_err());
        assert!(Timestamp::from_parts(1, -1, 0).is_err());
        assert!(Timestamp::from_parts(1, 5, i64::MAX).is_err());
        let ts = Timestamp::from_parts(-5, 250, 7).unwrap();
        assert_eq!(ts.to_string(), "-5.000000250@7");
    }

    #[test]
    fn test_complex_total_order() {
        let nan = Complex64::new(f64::NAN, 0.0);
        assert_eq!(nan, nan);
        assert!(Complex64::new(1.0, -1.0) < Complex64::new(1.0, 2.0));
        assert_ne!(Complex32::new(0.0, 0.0), Complex32::new(-0.0, 0.0));
    }
}
