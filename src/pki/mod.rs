//! The PKI engine.
//!
//! A [`Pki`] owns three collaborators (key storage, serial provider and
//! CRL holder) plus the subject template stamped onto every issued
//! certificate. All operations are synchronous; the collaborators take
//! care of their own on-disk consistency.

pub mod pair;

use std::fs;
use std::path::Path;

use chrono::{Duration, Utc};

use crate::commons::error::Error;
use crate::commons::serial::Serial;
use crate::constants::{
    CA_COMMON_NAME, CRL_FILE_NAME, DEFAULT_EXPIRE_YEARS, MODE_KEY_DIR,
    SERIAL_FILE_NAME,
};
use crate::crypto::cert::CertTemplate;
use crate::crypto::{CertOption, CertRole, Crl, CrlEntry, SubjectTemplate};
use crate::pki::pair::X509Pair;
use crate::storage::disk::{DirKeyStorage, FileCrlHolder, FileSerialProvider};
use crate::storage::{CrlHolder, KeyStorage, SerialProvider};

//------------ Pki -----------------------------------------------------------

pub struct Pki<S, P, C> {
    storage: S,
    serial_provider: P,
    crl_holder: C,
    subj_template: SubjectTemplate,
}

impl<S, P, C> Pki<S, P, C> {
    pub fn new(
        storage: S,
        serial_provider: P,
        crl_holder: C,
        subj_template: SubjectTemplate,
    ) -> Self {
        Pki {
            storage,
            serial_provider,
            crl_holder,
            subj_template,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }
}

impl<S, P, C> Pki<S, P, C>
where
    S: KeyStorage,
    P: SerialProvider,
    C: CrlHolder,
{
    /// Creates a new self-signed CA pair.
    ///
    /// The pair is stored under the common name "ca" regardless of any
    /// CN option; a PKI may hold several CA generations and the one with
    /// the highest serial wins.
    pub fn new_ca(&self, opts: &[CertOption]) -> Result<X509Pair, Error> {
        let (key, key_pem) = crate::crypto::cert::generate_default_key()?;

        let serial = self.serial_provider.next()?;
        let mut template = CertTemplate::ca(CA_COMMON_NAME, serial.clone());
        template.apply(opts);

        let cert = template.sign(&self.subj_template, &key, None)?;
        let cert_pem = cert
            .to_pem()
            .map_err(|e| Error::crypto(format!("can't encode cert: {}", e)))?;

        let pair =
            X509Pair::new(key_pem, cert_pem, CA_COMMON_NAME, serial.clone());
        self.storage.put(&pair)?;

        debug!("issued new ca with serial {}", serial);
        Ok(pair)
    }

    /// Issues a new end-entity pair of the given role, signed by the
    /// latest CA.
    pub fn new_cert(
        &self,
        cn: &str,
        role: CertRole,
    ) -> Result<X509Pair, Error> {
        let preset = match role {
            CertRole::Client => CertOption::Client,
            CertRole::Server => CertOption::Server,
        };
        self.new_cert_with(cn, &[preset])
    }

    /// Issues a new end-entity pair with explicit options.
    ///
    /// The template starts out as a client certificate; options are
    /// applied in order on top of that.
    pub fn new_cert_with(
        &self,
        cn: &str,
        opts: &[CertOption],
    ) -> Result<X509Pair, Error> {
        let ca_pair = self.get_last_ca()?;
        let (ca_key, ca_cert) = ca_pair.decode()?;

        let (key, key_pem) = crate::crypto::cert::generate_default_key()?;

        let serial = self.serial_provider.next()?;
        let mut template =
            CertTemplate::end_entity(cn, serial.clone(), CertRole::Client);
        template.apply(opts);

        let cert =
            template.sign(&self.subj_template, &key, Some((&ca_key, &ca_cert)))?;
        let cert_pem = cert
            .to_pem()
            .map_err(|e| Error::crypto(format!("can't encode cert: {}", e)))?;

        let pair = X509Pair::new(key_pem, cert_pem, cn, serial.clone());
        self.storage.put(&pair)?;

        debug!("issued cert for cn '{}' with serial {}", cn, serial);
        Ok(pair)
    }

    /// Returns the current revocation list, empty if none exists yet.
    pub fn get_crl(&self) -> Result<Crl, Error> {
        self.crl_holder.get()
    }

    /// Returns the CA pair with the highest serial.
    pub fn get_last_ca(&self) -> Result<X509Pair, Error> {
        self.get_last_by_cn(CA_COMMON_NAME)
    }

    /// Returns the pair with the highest serial under a common name.
    pub fn get_last_by_cn(&self, cn: &str) -> Result<X509Pair, Error> {
        self.storage.get_last_by_cn(cn)
    }

    /// Revokes a single serial.
    ///
    /// The whole revocation list is rebuilt, de-duplicated and re-signed
    /// by the latest CA. Revoking a serial twice is a no-op for the
    /// list's content.
    pub fn revoke_one(&self, serial: &Serial) -> Result<(), Error> {
        let mut crl = self.crl_holder.get()?;

        let mut ca_pairs = self.storage.get_by_cn(CA_COMMON_NAME)?;
        ca_pairs.sort_by(|a, b| b.serial().cmp(a.serial()));
        let ca_pair = ca_pairs
            .first()
            .ok_or_else(|| Error::not_found("ca pair for signing crl"))?;
        let (ca_key, ca_cert) = ca_pair.decode()?;
        let ca_der = ca_cert
            .to_der()
            .map_err(|e| Error::crypto(format!("can't encode ca: {}", e)))?;

        crl.push(CrlEntry::now(serial.clone()));
        crl.dedup_by_serial();

        let now = Utc::now();
        let next_update = now + Duration::hours(24 * 365 * DEFAULT_EXPIRE_YEARS);
        let pem = crl.to_signed_pem(&ca_der, &ca_key, now, next_update)?;

        self.crl_holder.put(&pem)?;

        debug!("revoked serial {}", serial);
        Ok(())
    }

    /// Revokes every pair stored under the common name.
    ///
    /// Not atomic: if one revocation fails, earlier ones stay in effect.
    pub fn revoke_all_by_cn(&self, cn: &str) -> Result<(), Error> {
        let pairs = self.storage.get_by_cn(cn)?;
        for pair in &pairs {
            self.revoke_one(pair.serial())?;
        }
        Ok(())
    }

    /// Returns whether the serial is on the current revocation list.
    pub fn is_revoked(&self, serial: &Serial) -> Result<bool, Error> {
        Ok(self.get_crl()?.contains(serial))
    }
}

//------------ DiskPki -------------------------------------------------------

/// The default PKI over the file-backed collaborators.
pub type DiskPki = Pki<DirKeyStorage, FileSerialProvider, FileCrlHolder>;

/// Sets up a file-backed PKI rooted at `pki_dir`.
///
/// The directory is created (mode 0750) if it does not exist yet; the
/// serial counter and CRL live directly underneath it.
pub fn init_disk_pki(
    pki_dir: &Path,
    subj_template: SubjectTemplate,
) -> Result<DiskPki, Error> {
    if !pki_dir.is_dir() {
        fs::create_dir_all(pki_dir).map_err(|e| {
            Error::io(
                format!("can't create '{}'", pki_dir.display()),
                e,
            )
        })?;
        set_dir_mode(pki_dir)?;
    }
    Ok(Pki::new(
        DirKeyStorage::new(pki_dir),
        FileSerialProvider::new(pki_dir.join(SERIAL_FILE_NAME)),
        FileCrlHolder::new(pki_dir.join(CRL_FILE_NAME)),
        subj_template,
    ))
}

#[cfg(unix)]
fn set_dir_mode(dir: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(dir, fs::Permissions::from_mode(MODE_KEY_DIR))
        .map_err(|e| {
            Error::io(
                format!("can't set mode on '{}'", dir.display()),
                e,
            )
        })
}

#[cfg(not(unix))]
fn set_dir_mode(_dir: &Path) -> Result<(), Error> {
    Ok(())
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::test;
    use crate::storage::compliant::CompliantKeyStorage;

    #[test]
    fn new_cert_without_ca_fails() {
        test::test_under_tmp(|dir| {
            let pki =
                init_disk_pki(&dir, SubjectTemplate::default()).unwrap();
            let err = pki.new_cert("early", CertRole::Client).unwrap_err();
            assert!(err.is_not_found());
        })
    }

    #[test]
    fn end_entity_is_signed_by_the_ca() {
        test::test_under_tmp(|dir| {
            let pki =
                init_disk_pki(&dir, SubjectTemplate::default()).unwrap();
            pki.new_ca(&[]).unwrap();
            let pair = pki.new_cert("alice", CertRole::Client).unwrap();

            let (_, cert) = pair.decode().unwrap();
            let (_, ca_cert) = pki.get_last_ca().unwrap().decode().unwrap();
            let ca_key = ca_cert.public_key().unwrap();
            assert!(cert.verify(&ca_key).unwrap());
        })
    }

    #[test]
    fn works_against_the_compliant_layout() {
        test::test_under_tmp(|dir| {
            let pki = Pki::new(
                CompliantKeyStorage::new(dir.join("pki")),
                FileSerialProvider::new(dir.join("pki-serial")),
                FileCrlHolder::new(dir.join("pki-crl.pem")),
                SubjectTemplate::default(),
            );

            pki.new_ca(&[]).unwrap();
            let server =
                pki.new_cert("server", CertRole::Server).unwrap();

            assert!(dir.join("pki/ca.crt").is_file());
            assert!(dir.join("pki/issued/server.crt").is_file());

            pki.revoke_one(server.serial()).unwrap();
            assert!(pki.is_revoked(server.serial()).unwrap());
        })
    }
}
