//! Arbitrary-precision integers as they travel on the wire.
//!
//! Both codecs encode integers as a sign plus a big-endian magnitude, so the
//! value type stores exactly that: no leading zero bytes, and zero is never
//! negative. Equality of two [`Integer`]s is therefore plain byte equality.

use std::fmt;

/// Largest magnitude either codec accepts (an 8192-bit integer).
pub const MAX_MAGNITUDE_BYTES: usize = 1024;

/// Decimal digits in the largest [`MAX_MAGNITUDE_BYTES`] magnitude.
pub const MAX_DECIMAL_DIGITS: usize = 2467;

/// Digits folded in per pass of [`Integer::from_decimal`].
const CHUNK_DIGITS: usize = 9;

/// A signed integer of any size.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Integer {
    negative: bool,
    magnitude: Vec<u8>,
}

impl Integer {
    /// The integer zero.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Build from a sign and a big-endian magnitude. Leading zero bytes are stripped.
    pub fn from_sign_magnitude(negative: bool, magnitude: &[u8]) -> Self {
        let magnitude = strip_leading_zeros(magnitude).to_vec();
        let negative = negative && !magnitude.is_empty();
        Self {
            negative,
            magnitude,
        }
    }

    /// Parse a run of ASCII decimal digits into a magnitude with the given sign.
    ///
    /// Returns `None` if `digits` is empty or contains a non-digit byte.
    pub fn from_decimal(negative: bool, digits: &[u8]) -> Option<Self> {
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return None;
        }
        // Little-endian base 2^32 limbs, fed nine decimal digits at a time.
        let mut limbs: Vec<u32> = Vec::with_capacity(digits.len() / CHUNK_DIGITS + 1);
        let head = digits.len() % CHUNK_DIGITS;
        let chunks = std::iter::once(&digits[..head])
            .filter(|c| !c.is_empty())
            .chain(digits[head..].chunks(CHUNK_DIGITS));
        for chunk in chunks {
            let scale = 10u64.pow(chunk.len() as u32);
            let mut carry = chunk
                .iter()
                .fold(0u64, |acc, d| acc * 10 + u64::from(d - b'0'));
            for limb in limbs.iter_mut() {
                let v = u64::from(*limb) * scale + carry;
                *limb = v as u32;
                carry = v >> 32;
            }
            if carry > 0 {
                limbs.push(carry as u32);
            }
        }
        let magnitude: Vec<u8> = limbs.iter().rev().flat_map(|l| l.to_be_bytes()).collect();
        Some(Self::from_sign_magnitude(negative, &magnitude))
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    pub fn is_zero(&self) -> bool {
        self.magnitude.is_empty()
    }

    /// Minimal big-endian magnitude. Empty for zero.
    pub fn magnitude(&self) -> &[u8] {
        &self.magnitude
    }

    /// Decimal digits of the magnitude, without a sign.
    pub fn magnitude_decimal(&self) -> String {
        if self.magnitude.is_empty() {
            return "0".to_string();
        }
        let mut rest = self.magnitude.clone();
        let mut digits = Vec::new();
        while !rest.is_empty() {
            let mut remainder: u16 = 0;
            for byte in rest.iter_mut() {
                let v = (remainder << 8) | u16::from(*byte);
                *byte = (v / 10) as u8;
                remainder = v % 10;
            }
            digits.push(char::from(b'0' + remainder as u8));
            let first = rest.iter().position(|b| *b != 0).unwrap_or(rest.len());
            rest.drain(..first);
        }
        digits.iter().rev().collect()
    }

    fn magnitude_u64(&self) -> Option<u64> {
        if self.magnitude.len() > 8 {
            return None;
        }
        Some(
            self.magnitude
                .iter()
                .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
        )
    }

    pub fn to_u64(&self) -> Option<u64> {
        if self.negative {
            return None;
        }
        self.magnitude_u64()
    }

    pub fn to_i64(&self) -> Option<i64> {
        let magnitude = self.magnitude_u64()?;
        if self.negative {
            if magnitude > (i64::MAX as u64) + 1 {
                return None;
            }
            Some((magnitude as i64).wrapping_neg())
        } else {
            i64::try_from(magnitude).ok()
        }
    }
}

impl From<u64> for Integer {
    fn from(v: u64) -> Self {
        Self::from_sign_magnitude(false, &v.to_be_bytes())
    }
}

impl From<i64> for Integer {
    fn from(v: i64) -> Self {
        Self::from_sign_magnitude(v < 0, &v.unsigned_abs().to_be_bytes())
    }
}

impl From<u32> for Integer {
    fn from(v: u32) -> Self {
        Self::from(u64::from(v))
    }
}

impl From<i32> for Integer {
    fn from(v: i32) -> Self {
        Self::from(i64::from(v))
    }
}

impl From<usize> for Integer {
    fn from(v: usize) -> Self {
        Self::from(v as u64)
    }
}

impl fmt::Display for Integer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negative {
            write!(f, "-")?;
        }
        write!(f, "{}", self.magnitude_decimal())
    }
}

pub(crate) fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[first..]
}

/// `magnitude - 1` for a non-zero minimal magnitude, result minimal.
pub(crate) fn decrement(magnitude: &[u8]) -> Vec<u8> {
    let mut out = magnitude.to_vec();
    for byte in out.iter_mut().rev() {
        if *byte == 0 {
            *byte = 0xff;
        } else {
            *byte -= 1;
            break;
        }
    }
    strip_leading_zeros(&out).to_vec()
}

/// `magnitude + 1`, result minimal.
pub(crate) fn increment(magnitude: &[u8]) -> Vec<u8> {
    let mut out = magnitude.to_vec();
    for byte in out.iter_mut().rev() {
        if *byte == 0xff {
            *byte = 0;
        } else {
            *byte += 1;
            return out;
        }
    }
    out.insert(0, 1);
    out
}
