//! 160-bit identifiers and the XOR distance metric.
//!
//! Identifiers are stored big-endian, so the derived byte-wise ordering is
//! the numeric ordering of the underlying unsigned integer. Distances are
//! themselves identifiers: `a.xor(&b)` interpreted as a number.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Result, TypesError};

/// A 160-bit unsigned integer used as peer identifier and location key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Id([u8; Id::BYTES]);

impl Id {
    /// Width of an identifier in bits.
    pub const BITS: usize = 160;

    /// Width of an identifier in bytes.
    pub const BYTES: usize = 20;

    /// The all-zero identifier. Never a valid peer id.
    pub const ZERO: Id = Id([0u8; Id::BYTES]);

    /// The largest identifier.
    pub const MAX: Id = Id([0xFFu8; Id::BYTES]);

    /// Wrap raw big-endian bytes.
    pub const fn from_bytes(bytes: [u8; Id::BYTES]) -> Self {
        Self(bytes)
    }

    /// Build an identifier from a slice, which must be exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; Id::BYTES] =
            bytes
                .try_into()
                .map_err(|_| TypesError::InvalidLength {
                    expected: Id::BYTES,
                    got: bytes.len(),
                })?;
        Ok(Self(array))
    }

    /// Build an identifier whose low 64 bits are `value`.
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; Id::BYTES];
        bytes[Id::BYTES - 8..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    /// Draw a uniformly random identifier.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; Id::BYTES];
        rng.fill(&mut bytes[..]);
        Self(bytes)
    }

    /// Raw big-endian bytes.
    pub fn as_bytes(&self) -> &[u8; Id::BYTES] {
        &self.0
    }

    /// Whether this is the zero identifier.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Bitwise XOR, i.e. the Kademlia distance between two identifiers.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0u8; Id::BYTES];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Id(result)
    }

    /// Number of significant bits; zero for [`Id::ZERO`].
    pub fn bit_length(&self) -> usize {
        Self::BITS - self.leading_zeros()
    }

    /// Number of leading zero bits.
    pub fn leading_zeros(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        Self::BITS
    }

    /// The distance class of `other` relative to `self`:
    /// `bit_length(self XOR other) - 1`.
    ///
    /// Returns `None` if both identifiers are equal.
    pub fn class_of(&self, other: &Id) -> Option<usize> {
        self.xor(other).bit_length().checked_sub(1)
    }

    /// Low 64 bits, handy for diagnostics and tests.
    pub fn low_u64(&self) -> u64 {
        let mut tail = [0u8; 8];
        tail.copy_from_slice(&self.0[Id::BYTES - 8..]);
        u64::from_be_bytes(tail)
    }
}

impl From<[u8; Id::BYTES]> for Id {
    fn from(bytes: [u8; Id::BYTES]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = hex::encode(self.0);
        let trimmed = encoded.trim_start_matches('0');
        if trimmed.is_empty() {
            write!(f, "0x0")
        } else {
            write!(f, "0x{trimmed}")
        }
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl FromStr for Id {
    type Err = TypesError;

    /// Parse a hex identifier, with or without a `0x` prefix. Short inputs are
    /// left-padded with zeros.
    fn from_str(s: &str) -> Result<Self> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        if digits.is_empty() || digits.len() > Id::BYTES * 2 {
            return Err(TypesError::InvalidHex(s.to_string()));
        }
        let padded = format!("{:0>width$}", digits, width = Id::BYTES * 2);
        let mut bytes = [0u8; Id::BYTES];
        hex::decode_to_slice(&padded, &mut bytes)
            .map_err(|_| TypesError::InvalidHex(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_distance() {
        let a = Id::ZERO;
        let b = Id::MAX;
        assert_eq!(a.xor(&b), Id::MAX);
        assert_eq!(a.xor(&a), Id::ZERO);
        assert_eq!(Id::from_u64(0x7f).xor(&Id::from_u64(0x80)), Id::from_u64(0xff));
    }

    #[test]
    fn test_bit_length() {
        assert_eq!(Id::ZERO.bit_length(), 0);
        assert_eq!(Id::from_u64(1).bit_length(), 1);
        assert_eq!(Id::from_u64(2).bit_length(), 2);
        assert_eq!(Id::from_u64(3).bit_length(), 2);
        assert_eq!(Id::MAX.bit_length(), 160);
        let mut top = [0u8; Id::BYTES];
        top[0] = 0x80;
        assert_eq!(Id::from_bytes(top).bit_length(), 160);
    }

    #[test]
    fn test_class_of() {
        let a = Id::from_u64(0x7f);
        let b = Id::from_u64(0x80);
        let c = Id::from_u64(0xff);
        assert_eq!(a.class_of(&b), Some(7));
        assert_eq!(b.class_of(&c), Some(6));
        assert_eq!(a.class_of(&a), None);
        assert_eq!(Id::from_u64(1).class_of(&Id::from_u64(2)), Some(1));
        assert_eq!(Id::from_u64(1).class_of(&Id::from_u64(4)), Some(2));
    }

    #[test]
    fn test_ordering_is_numeric() {
        assert!(Id::from_u64(1) < Id::from_u64(2));
        assert!(Id::from_u64(0xff) < Id::from_u64(0x100));
        let mut high = [0u8; Id::BYTES];
        high[0] = 1;
        assert!(Id::from_u64(u64::MAX) < Id::from_bytes(high));
    }

    #[test]
    fn test_display_and_parse() {
        assert_eq!(Id::ZERO.to_string(), "0x0");
        assert_eq!(Id::from_u64(0x1234).to_string(), "0x1234");
        let parsed: Id = "0x1234".parse().expect("parse hex");
        assert_eq!(parsed, Id::from_u64(0x1234));
        let parsed: Id = "ff".parse().expect("parse bare hex");
        assert_eq!(parsed, Id::from_u64(0xff));
        assert_eq!(Id::MAX.to_string().parse::<Id>().expect("round trip"), Id::MAX);
        assert!("0x".parse::<Id>().is_err());
        assert!("zz".parse::<Id>().is_err());
        assert!("1".repeat(41).parse::<Id>().is_err());
    }

    #[test]
    fn test_from_slice_length() {
        assert!(Id::from_slice(&[0u8; 20]).is_ok());
        assert_eq!(
            Id::from_slice(&[0u8; 3]),
            Err(TypesError::InvalidLength {
                expected: 20,
                got: 3
            })
        );
    }

    #[test]
    fn test_serde_as_hex_string() {
        let id = Id::from_u64(0xabc);
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"0xabc\"");
        let back: Id = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }

    #[test]
    fn test_random_ids_differ() {
        let mut rng = rand::thread_rng();
        let a = Id::random(&mut rng);
        let b = Id::random(&mut rng);
        assert_ne!(a, b);
        assert_eq!(Id::from_u64(42).low_u64(), 42);
    }
}
