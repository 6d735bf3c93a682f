// ABOUTME: 32-bit wraparound checksum algebra used for bucket validation
// ABOUTME: Normalizes signed, unsigned, and decimal-string inputs to canonical u32

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};

/// A bucket operation checksum.
///
/// The server computes per-bucket checksums as a sum over operation
/// checksums modulo 2^32. Local arithmetic must match that exactly:
/// addition and subtraction always wrap, never widen to 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Checksum(u32);

impl Checksum {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Normalize a signed 32-bit value to the canonical unsigned form.
    ///
    /// The protocol transmits checksums as either signed or unsigned
    /// 32-bit integers depending on the server runtime; both encode the
    /// same bit pattern.
    pub fn from_i32(value: i32) -> Self {
        Self(value as u32)
    }

    /// Normalize an arbitrary 64-bit value by truncating to the low 32 bits.
    pub fn from_i64(value: i64) -> Self {
        Self(value as u32)
    }
}

impl Add for Checksum {
    type Output = Checksum;

    fn add(self, rhs: Self) -> Self::Output {
        Checksum(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Checksum {
    fn add_assign(&mut self, rhs: Self) {
        self.0 = self.0.wrapping_add(rhs.0);
    }
}

impl Sub for Checksum {
    type Output = Checksum;

    fn sub(self, rhs: Self) -> Self::Output {
        Checksum(self.0.wrapping_sub(rhs.0))
    }
}

impl SubAssign for Checksum {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 = self.0.wrapping_sub(rhs.0);
    }
}

impl From<u32> for Checksum {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ChecksumVisitor;

        impl Visitor<'_> for ChecksumVisitor {
            type Value = Checksum;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a 32-bit checksum as an integer or decimal string")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Checksum, E> {
                Ok(Checksum(value as u32))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Checksum, E> {
                Ok(Checksum::from_i64(value))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Checksum, E> {
                let parsed: i64 = value
                    .parse()
                    .map_err(|_| E::custom(format!("invalid checksum string: {value}")))?;
                Ok(Checksum::from_i64(parsed))
            }
        }

        deserializer.deserialize_any(ChecksumVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addition_wraps_at_32_bits() {
        let a = Checksum::new(u32::MAX);
        let b = Checksum::new(10);
        assert_eq!((a + b).value(), 9);
    }

    #[test]
    fn subtraction_wraps_at_32_bits() {
        let a = Checksum::new(3);
        let b = Checksum::new(10);
        assert_eq!((a - b).value(), u32::MAX - 6);
    }

    #[test]
    fn normalizes_negative_values() {
        assert_eq!(Checksum::from_i32(-1).value(), u32::MAX);
        assert_eq!(Checksum::from_i64(-1).value(), u32::MAX);
    }

    #[test]
    fn add_sub_round_trips() {
        let mut c = Checksum::new(123);
        c += Checksum::from_i32(-456);
        c -= Checksum::from_i32(-456);
        assert_eq!(c.value(), 123);
    }

    #[test]
    fn deserializes_all_wire_shapes() {
        let from_unsigned: Checksum = serde_json::from_str("3573495687").unwrap();
        assert_eq!(from_unsigned.value(), 3573495687);

        let from_signed: Checksum = serde_json::from_str("-721471609").unwrap();
        assert_eq!(from_signed.value(), 3573495687);

        let from_string: Checksum = serde_json::from_str("\"-721471609\"").unwrap();
        assert_eq!(from_string.value(), 3573495687);
    }
}
