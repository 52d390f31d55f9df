//! Key storage in the easy-rsa v3 on-disk layout.
//!
//! This storage can be dropped onto a PKI directory created with the
//! easy-rsa v3 scripts: issued certificates live in `issued/<cn>.crt`,
//! keys in `private/<cn>.key`, serial-indexed copies in
//! `certs_by_serial/<SERIAL>.crt` (uppercase hex) and the CA itself in
//! `ca.crt`. An OpenSSL ca-style `index.txt` tracks every certificate.
//! Deleting does not unlink anything; artifacts are parked under
//! `revoked/` the way easy-rsa's own revoke does it.
//!
//! The layout holds one certificate per common name, so `get_by_cn`
//! returns at most one pair here.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use x509_parser::prelude::*;

use crate::commons::error::Error;
use crate::commons::file;
use crate::commons::serial::Serial;
use crate::constants::{CA_COMMON_NAME, MODE_CERT, MODE_KEY};
use crate::pki::pair::X509Pair;
use crate::storage::index::{Index, Record};
use crate::storage::KeyStorage;

const INDEX_FILE: &str = "index.txt";

//------------ CompliantKeyStorage -------------------------------------------

#[derive(Clone, Debug)]
pub struct CompliantKeyStorage {
    pkidir: PathBuf,
}

impl CompliantKeyStorage {
    pub fn new(pkidir: impl Into<PathBuf>) -> Self {
        CompliantKeyStorage {
            pkidir: pkidir.into(),
        }
    }

    fn init_dir(&self) -> Result<(), Error> {
        for dir in [
            self.pkidir.clone(),
            self.pkidir.join("certs_by_serial"),
            self.pkidir.join("issued"),
            self.pkidir.join("private"),
            self.pkidir.join("reqs"),
            self.pkidir.join("revoked"),
            self.pkidir.join("revoked/certs_by_serial"),
            self.pkidir.join("revoked/private_by_serial"),
        ] {
            file::create_dir(&dir)?;
        }
        Ok(())
    }

    fn cert_path(&self, cn: &str) -> PathBuf {
        if cn == CA_COMMON_NAME {
            self.pkidir.join("ca.crt")
        } else {
            self.pkidir.join("issued").join(format!("{}.crt", cn))
        }
    }

    fn key_path(&self, cn: &str) -> PathBuf {
        self.pkidir.join("private").join(format!("{}.key", cn))
    }

    fn serial_path(&self, serial: &Serial) -> PathBuf {
        self.pkidir
            .join("certs_by_serial")
            .join(format!("{}.crt", serial.to_hex().to_uppercase()))
    }

    fn load_index(&self) -> Result<Index, Error> {
        let path = self.pkidir.join(INDEX_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => Index::decode(&text),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Ok(Index::new())
            }
            Err(err) => Err(Error::io(
                format!("can't read index '{}'", path.display()),
                err,
            )),
        }
    }

    fn store_index(&self, index: &Index) -> Result<(), Error> {
        let path = self.pkidir.join(INDEX_FILE);
        file::save_atomic(index.encode().as_bytes(), &path, MODE_CERT)
    }

    /// Reads one pair off the layout, recovering the serial from the
    /// certificate itself.
    fn read_pair(&self, cn: &str) -> Result<X509Pair, Error> {
        let cert_path = self.cert_path(cn);
        let cert_pem = match fs::read(&cert_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::not_found(format!("cn '{}'", cn)))
            }
            Err(err) => {
                return Err(Error::io(
                    format!("can't read cert '{}'", cert_path.display()),
                    err,
                ))
            }
        };
        let key_path = self.key_path(cn);
        let key_pem = fs::read(&key_path).map_err(|e| {
            Error::io(format!("can't read key '{}'", key_path.display()), e)
        })?;
        let serial = cert_serial(&cert_pem)?;
        Ok(X509Pair::new(key_pem, cert_pem, cn, serial))
    }
}

impl KeyStorage for CompliantKeyStorage {
    fn put(&self, pair: &X509Pair) -> Result<(), Error> {
        if pair.cn().is_empty() {
            return Err(Error::invalid("empty cn"));
        }
        self.init_dir()?;

        file::save_atomic(
            pair.cert_pem(),
            &self.cert_path(pair.cn()),
            MODE_CERT,
        )?;
        file::save_atomic(
            pair.cert_pem(),
            &self.serial_path(pair.serial()),
            MODE_CERT,
        )?;
        file::save_atomic(pair.key_pem(), &self.key_path(pair.cn()), MODE_KEY)?;

        let (expiry, dn) = cert_expiry_and_dn(pair.cert_pem())?;
        let serial_hex = pair.serial().to_hex().to_uppercase();
        let mut index = self.load_index()?;
        if index.find_by_serial_mut(&serial_hex).is_none() {
            index.push(Record::issued(expiry, serial_hex, dn));
        }
        self.store_index(&index)
    }

    fn get_by_cn(&self, cn: &str) -> Result<Vec<X509Pair>, Error> {
        if cn.is_empty() {
            return Err(Error::not_found("cn ''"));
        }
        Ok(vec![self.read_pair(cn)?])
    }

    fn get_by_serial(&self, serial: &Serial) -> Result<X509Pair, Error> {
        let path = self.serial_path(serial);
        let cert_pem = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::not_found(format!(
                    "serial '{}'",
                    serial
                )))
            }
            Err(err) => {
                return Err(Error::io(
                    format!("can't read cert '{}'", path.display()),
                    err,
                ))
            }
        };
        let cn = cert_common_name(&cert_pem)?;
        let key_path = self.key_path(&cn);
        let key_pem = fs::read(&key_path).map_err(|e| {
            Error::io(format!("can't read key '{}'", key_path.display()), e)
        })?;
        Ok(X509Pair::new(key_pem, cert_pem, cn, serial.clone()))
    }

    fn delete_by_cn(&self, cn: &str) -> Result<(), Error> {
        let pair = self.read_pair(cn)?;
        self.init_dir()?;

        let serial_hex = pair.serial().to_hex().to_uppercase();
        park(
            &self.cert_path(cn),
            &self
                .pkidir
                .join("revoked/certs_by_serial")
                .join(format!("{}.crt", serial_hex)),
        )?;
        park(
            &self.key_path(cn),
            &self
                .pkidir
                .join("revoked/private_by_serial")
                .join(format!("{}.key", serial_hex)),
        )?;
        let _ = fs::remove_file(self.serial_path(pair.serial()));

        let mut index = self.load_index()?;
        if let Some(record) = index.find_by_serial_mut(&serial_hex) {
            record.revoke(Utc::now(), None);
        }
        self.store_index(&index)
    }

    fn delete_by_serial(&self, serial: &Serial) -> Result<(), Error> {
        let pair = self.get_by_serial(serial)?;
        self.delete_by_cn(pair.cn())
    }

    fn get_all(&self) -> Result<Vec<X509Pair>, Error> {
        let mut res = Vec::new();
        if self.pkidir.join("ca.crt").is_file() {
            res.push(self.read_pair(CA_COMMON_NAME)?);
        }
        let issued = self.pkidir.join("issued");
        let entries = match fs::read_dir(&issued) {
            Ok(entries) => entries,
            Err(_) => return Ok(res),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let cn = match path
                .file_stem()
                .and_then(|stem| stem.to_str())
            {
                Some(cn) => cn.to_string(),
                None => continue,
            };
            if let Ok(pair) = self.read_pair(&cn) {
                res.push(pair);
            }
        }
        Ok(res)
    }
}

/// Moves an artifact into the revoked/ subtree.
fn park(from: &Path, to: &Path) -> Result<(), Error> {
    fs::rename(from, to).map_err(|e| {
        Error::io(
            format!(
                "can't move '{}' to '{}'",
                from.display(),
                to.display()
            ),
            e,
        )
    })
}

//------------ Certificate introspection -------------------------------------

fn parse_cert_pem(cert_pem: &[u8]) -> Result<Vec<u8>, Error> {
    let block = ::pem::parse(cert_pem)
        .map_err(|e| Error::parse(format!("bad cert pem: {}", e)))?;
    Ok(block.contents().to_vec())
}

fn cert_serial(cert_pem: &[u8]) -> Result<Serial, Error> {
    let der = parse_cert_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| Error::parse(format!("bad cert der: {}", e)))?;
    Ok(Serial::from_bytes_be(cert.raw_serial()))
}

fn cert_common_name(cert_pem: &[u8]) -> Result<String, Error> {
    let der = parse_cert_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| Error::parse(format!("bad cert der: {}", e)))?;
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|cn| cn.to_string())
        .ok_or_else(|| Error::parse("certificate without a common name"));
    cn
}

fn cert_expiry_and_dn(
    cert_pem: &[u8],
) -> Result<(chrono::DateTime<Utc>, String), Error> {
    let der = parse_cert_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| Error::parse(format!("bad cert der: {}", e)))?;

    let expiry = Utc
        .timestamp_opt(cert.validity().not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| Error::parse("certificate expiry out of range"))?;

    let mut dn = String::new();
    for attr in [
        ("C", cert.subject().iter_country().next()),
        ("O", cert.subject().iter_organization().next()),
        ("OU", cert.subject().iter_organizational_unit().next()),
        ("CN", cert.subject().iter_common_name().next()),
    ] {
        if let (label, Some(value)) = attr {
            if let Ok(value) = value.as_str() {
                dn.push_str(&format!("/{}={}", label, value));
            }
        }
    }
    Ok((expiry, dn))
}

//------------ Tests ---------------------------------------------------------
