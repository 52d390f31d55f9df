//! Storage abstractions for the PKI engine.
//!
//! A PKI composes three collaborators: a [`KeyStorage`] persisting
//! certificate/key pairs, a [`SerialProvider`] handing out unique
//! monotonic serial numbers and a [`CrlHolder`] keeping the one current
//! revocation list. The file-backed default implementations live in
//! [`disk`]; an easy-rsa v3 compatible layout lives in [`compliant`].

pub mod compliant;
pub mod disk;
pub mod index;

use crate::commons::error::Error;
use crate::commons::serial::Serial;
use crate::crypto::Crl;
use crate::pki::pair::X509Pair;

//------------ KeyStorage ----------------------------------------------------

/// Persists and retrieves certificate/key pairs.
pub trait KeyStorage {
    /// Stores a pair, replacing any previous pair with the same identity.
    fn put(&self, pair: &X509Pair) -> Result<(), Error>;

    /// Returns all pairs stored under the common name.
    ///
    /// A common name without any pairs is a [`Error::NotFound`].
    fn get_by_cn(&self, cn: &str) -> Result<Vec<X509Pair>, Error>;

    /// Returns the single pair with the given serial.
    fn get_by_serial(&self, serial: &Serial) -> Result<X509Pair, Error>;

    /// Removes all pairs stored under the common name.
    fn delete_by_cn(&self, cn: &str) -> Result<(), Error>;

    /// Removes the single pair with the given serial.
    fn delete_by_serial(&self, serial: &Serial) -> Result<(), Error>;

    /// Returns every stored pair.
    fn get_all(&self) -> Result<Vec<X509Pair>, Error>;

    /// Returns the pair with the highest serial under the common name.
    fn get_last_by_cn(&self, cn: &str) -> Result<X509Pair, Error> {
        let mut pairs = self.get_by_cn(cn)?;
        pairs.sort_by(|a, b| b.serial().cmp(a.serial()));
        pairs
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(format!("cn '{}'", cn)))
    }
}

//------------ SerialProvider ------------------------------------------------

/// Yields unique positive serial numbers.
pub trait SerialProvider {
    /// Returns the next serial and advances the counter atomically.
    fn next(&self) -> Result<Serial, Error>;
}

//------------ CrlHolder -----------------------------------------------------

/// Holds the single serialized CRL artifact of a PKI.
pub trait CrlHolder {
    /// Replaces the artifact wholesale.
    fn put(&self, content: &[u8]) -> Result<(), Error>;

    /// Returns the current list; an empty list if none exists yet.
    fn get(&self) -> Result<Crl, Error>;
}
