//! Certificate serial numbers.
//!
//! Serials are arbitrary-precision positive integers. On disk and in file
//! names they appear as lowercase hexadecimal without a prefix and without
//! leading zeros. All comparisons are numeric, so a serial that does not
//! fit in a machine word behaves exactly like a small one.

use std::fmt;
use std::str::FromStr;

use num_bigint::BigUint;
use openssl::bn::BigNum;

use crate::commons::error::Error;

//------------ Serial --------------------------------------------------------

#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Serial(BigUint);

impl Serial {
    pub fn zero() -> Self {
        Serial(BigUint::default())
    }

    /// Returns the serial following this one.
    pub fn next(&self) -> Self {
        Serial(&self.0 + 1u32)
    }

    /// Parses a lowercase or uppercase hex representation.
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        BigUint::parse_bytes(s.trim().as_bytes(), 16)
            .map(Serial)
            .ok_or_else(|| {
                Error::parse(format!("'{}' is not a hex serial", s))
            })
    }

    /// The canonical hex representation: lowercase, no prefix.
    pub fn to_hex(&self) -> String {
        self.0.to_str_radix(16)
    }

    /// Creates a serial from big-endian magnitude bytes.
    pub fn from_bytes_be(bytes: &[u8]) -> Self {
        Serial(BigUint::from_bytes_be(bytes))
    }

    /// The big-endian magnitude bytes, for DER INTEGER encoding.
    pub fn to_bytes_be(&self) -> Vec<u8> {
        self.0.to_bytes_be()
    }

    /// Converts to an openssl big number for certificate templates.
    pub fn to_bignum(&self) -> Result<BigNum, Error> {
        BigNum::from_hex_str(&self.to_hex()).map_err(|e| {
            Error::crypto(format!(
                "cannot convert serial '{}': {}",
                self.to_hex(),
                e
            ))
        })
    }
}

//--- From

impl From<u64> for Serial {
    fn from(value: u64) -> Self {
        Serial(BigUint::from(value))
    }
}

impl From<BigUint> for Serial {
    fn from(value: BigUint) -> Self {
        Serial(value)
    }
}

//--- FromStr and Display

impl FromStr for Serial {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

//------------ Tests ---------------------------------------------------------
