//! Crate-wide constants.

use std::time::Duration;

pub const EASYRSA_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const EASYRSA_APP: &str = "easyrsa";

/// Pem block label for X.509 certificates.
pub const PEM_CERTIFICATE_BLOCK: &str = "CERTIFICATE";

/// Pem block label for PKCS#1 RSA private keys.
pub const PEM_RSA_PRIVATE_KEY_BLOCK: &str = "RSA PRIVATE KEY";

/// Pem block label for certificate revocation lists.
pub const PEM_X509_CRL_BLOCK: &str = "X509 CRL";

/// Default RSA modulus size in bits.
pub const DEFAULT_KEY_SIZE_BITS: u32 = 2048;

/// Default certificate and CRL lifetime in years.
pub const DEFAULT_EXPIRE_YEARS: i64 = 99;

/// Certificates become valid slightly in the past to absorb clock skew.
pub const NOT_BEFORE_BACKDATE_MINUTES: i64 = 10;

/// File name extensions used by the directory storage.
pub const CERT_FILE_EXTENSION: &str = "crt";
pub const KEY_FILE_EXTENSION: &str = "key";

/// Default file names under the key directory.
pub const SERIAL_FILE_NAME: &str = "serial";
pub const CRL_FILE_NAME: &str = "crl.pem";

/// The common name under which CA pairs are stored.
pub const CA_COMMON_NAME: &str = "ca";

/// How long a single advisory lock acquisition may take in total.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// The pause between advisory lock attempts.
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Mode bits for artifacts on disk.
pub const MODE_KEY: u32 = 0o600;
pub const MODE_CERT: u32 = 0o644;
pub const MODE_KEY_DIR: u32 = 0o750;

pub const EASYRSA_CLI_KEY_DIR_ARG: &str = "key-dir";
pub const EASYRSA_CLI_KEY_DIR_DFLT: &str = "keys";
pub const EASYRSA_CLI_CONFIG_ARG: &str = "config";
pub const EASYRSA_CLI_CONFIG_DFLT: &str = "./easyrsa.toml";
pub const EASYRSA_CLI_LOG_LEVEL_ARG: &str = "log-level";
