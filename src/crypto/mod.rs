//! Certificate and CRL construction.

pub mod cert;
pub mod crl;

pub use self::cert::{CertOption, CertRole, SubjectTemplate};
pub use self::crl::{Crl, CrlEntry};
