//! The file-backed storage implementations.
//!
//! Pairs are kept in per-common-name directories as
//! `<keydir>/<cn>/<serial-hex>.crt` and `.key`. The serial counter and
//! the CRL live in single files next to them, each guarded by an
//! advisory lock file so that several issuers on the same host can share
//! one key directory. All writes replace their target atomically.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::commons::error::Error;
use crate::commons::file;
use crate::commons::serial::Serial;
use crate::constants::{
    CERT_FILE_EXTENSION, KEY_FILE_EXTENSION, LOCK_RETRY_INTERVAL,
    LOCK_TIMEOUT, MODE_CERT, MODE_KEY,
};
use crate::crypto::Crl;
use crate::pki::pair::X509Pair;
use crate::storage::{CrlHolder, KeyStorage, SerialProvider};

//------------ FileLock ------------------------------------------------------

/// An advisory lock on a file, acquired with a bounded retry loop.
///
/// The lock is host-local and cooperative: it serializes processes that
/// take it, nothing more. Acquisition retries every 100 ms and gives up
/// after 10 seconds in total.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    lock: fd_lock::RwLock<File>,
}

impl FileLock {
    /// Opens (creating if necessary) the lock file at `path`.
    pub fn create(path: &Path) -> Result<Self, Error> {
        let mut options = OpenOptions::new();
        options.create(true).truncate(false).read(true).write(true);
        let lock_file = options.open(path).map_err(|e| {
            Error::io(
                format!("failed to open lock file '{}'", path.display()),
                e,
            )
        })?;
        Ok(FileLock {
            path: path.to_path_buf(),
            lock: fd_lock::RwLock::new(lock_file),
        })
    }

    /// Takes the exclusive lock.
    pub fn write(
        &mut self,
    ) -> Result<fd_lock::RwLockWriteGuard<'_, File>, Error> {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match self.lock.try_write() {
                Ok(_) => break,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::lock_timeout(self.path.display()));
                    }
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(err) => {
                    return Err(Error::io(
                        format!(
                            "failed to lock '{}'",
                            self.path.display()
                        ),
                        err,
                    ))
                }
            }
        }
        self.lock.try_write().map_err(|err| {
            Error::io(
                format!("failed to lock '{}'", self.path.display()),
                err,
            )
        })
    }

    /// Takes the shared lock.
    pub fn read(
        &mut self,
    ) -> Result<fd_lock::RwLockReadGuard<'_, File>, Error> {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match self.lock.try_read() {
                Ok(guard) => return Ok(guard),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::lock_timeout(self.path.display()));
                    }
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(err) => {
                    return Err(Error::io(
                        format!(
                            "failed to lock '{}'",
                            self.path.display()
                        ),
                        err,
                    ))
                }
            }
        }
    }
}

/// The lock file guarding `path`.
fn lock_path_for(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.lock", path.display()))
}

//------------ DirKeyStorage -------------------------------------------------

/// Key storage keeping pairs as `<keydir>/<cn>/<serial-hex>.[crt,key]`.
#[derive(Clone, Debug)]
pub struct DirKeyStorage {
    keydir: PathBuf,
}

impl DirKeyStorage {
    pub fn new(keydir: impl Into<PathBuf>) -> Self {
        DirKeyStorage {
            keydir: keydir.into(),
        }
    }

    /// Derives the cert and key paths for a pair, creating its directory.
    fn make_paths(&self, pair: &X509Pair) -> Result<(PathBuf, PathBuf), Error> {
        if pair.cn().is_empty() {
            return Err(Error::invalid("empty cn"));
        }
        let base = file::sub_dir(&self.keydir, pair.cn())?;
        let serial_hex = pair.serial().to_hex();
        Ok((
            base.join(format!("{}.{}", serial_hex, CERT_FILE_EXTENSION)),
            base.join(format!("{}.{}", serial_hex, KEY_FILE_EXTENSION)),
        ))
    }

    /// Reads the pair belonging to a certificate file.
    ///
    /// Returns `None` when the file name is not a hex serial or either
    /// half cannot be read, so that lookups skip foreign files silently.
    fn read_pair(&self, cert_path: &Path, cn: &str) -> Option<X509Pair> {
        let serial = cert_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| Serial::from_hex(stem).ok())?;
        let key_path = cert_path.with_extension(KEY_FILE_EXTENSION);
        let cert_pem = fs::read(cert_path).ok()?;
        let key_pem = fs::read(&key_path).ok()?;
        Some(X509Pair::new(key_pem, cert_pem, cn, serial))
    }
}

impl KeyStorage for DirKeyStorage {
    fn put(&self, pair: &X509Pair) -> Result<(), Error> {
        let (cert_path, key_path) = self.make_paths(pair)?;
        file::save_atomic(pair.cert_pem(), &cert_path, MODE_CERT)?;
        file::save_atomic(pair.key_pem(), &key_path, MODE_KEY)?;
        debug!(
            "stored pair cn '{}' serial {} under {}",
            pair.cn(),
            pair.serial(),
            self.keydir.display()
        );
        Ok(())
    }

    fn get_by_cn(&self, cn: &str) -> Result<Vec<X509Pair>, Error> {
        let dir = self.keydir.join(cn);
        if cn.is_empty() || !dir.is_dir() {
            return Err(Error::not_found(format!("cn '{}'", cn)));
        }
        let mut res = Vec::new();
        visit_cert_files(&dir, &mut |cert_path| {
            if let Some(pair) = self.read_pair(cert_path, cn) {
                res.push(pair);
            }
        });
        if res.is_empty() {
            return Err(Error::not_found(format!("cn '{}'", cn)));
        }
        Ok(res)
    }

    fn get_by_serial(&self, serial: &Serial) -> Result<X509Pair, Error> {
        let mut res = None;
        visit_cert_files(&self.keydir, &mut |cert_path| {
            if res.is_some() {
                return;
            }
            let stem_serial = cert_path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| Serial::from_hex(stem).ok());
            if stem_serial.as_ref() != Some(serial) {
                return;
            }
            let cn = match parent_dir_name(cert_path) {
                Some(cn) => cn,
                None => return,
            };
            res = self.read_pair(cert_path, &cn);
        });
        res.ok_or_else(|| Error::not_found(format!("serial '{}'", serial)))
    }

    fn delete_by_cn(&self, cn: &str) -> Result<(), Error> {
        if cn.is_empty() {
            return Err(Error::invalid("empty cn"));
        }
        let dir = self.keydir.join(cn);
        fs::remove_dir_all(&dir).map_err(|e| {
            Error::io(
                format!("can't delete cn '{}' in '{}'", cn, dir.display()),
                e,
            )
        })
    }

    fn delete_by_serial(&self, serial: &Serial) -> Result<(), Error> {
        let pair = self.get_by_serial(serial)?;
        let serial_hex = pair.serial().to_hex();
        let base = self.keydir.join(pair.cn());
        for extension in [CERT_FILE_EXTENSION, KEY_FILE_EXTENSION] {
            let path = base.join(format!("{}.{}", serial_hex, extension));
            fs::remove_file(&path).map_err(|e| {
                Error::io(
                    format!("can't delete '{}'", path.display()),
                    e,
                )
            })?;
        }
        Ok(())
    }

    fn get_all(&self) -> Result<Vec<X509Pair>, Error> {
        let mut res = Vec::new();
        visit_cert_files(&self.keydir, &mut |cert_path| {
            if let Some(cn) = parent_dir_name(cert_path) {
                if let Some(pair) = self.read_pair(cert_path, &cn) {
                    res.push(pair);
                }
            }
        });
        Ok(res)
    }
}

/// Recurses a directory, calling `op` for every certificate file found.
///
/// Unreadable directories and entries are skipped.
fn visit_cert_files<F: FnMut(&Path)>(dir: &Path, op: &mut F) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            visit_cert_files(&path, op);
        } else if path
            .extension()
            .map(|ext| ext == CERT_FILE_EXTENSION)
            .unwrap_or(false)
        {
            op(&path);
        }
    }
}

fn parent_dir_name(path: &Path) -> Option<String> {
    path.parent()
        .and_then(|dir| dir.file_name())
        .and_then(|name| name.to_str())
        .map(|name| name.to_string())
}

//------------ FileSerialProvider --------------------------------------------

/// A serial counter persisted as lowercase hex in a single file.
///
/// The read-increment-write cycle runs under an exclusive advisory lock
/// on a sibling lock file, and the counter is replaced atomically, so
/// concurrent issuers each observe a strictly increasing sequence.
#[derive(Clone, Debug)]
pub struct FileSerialProvider {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileSerialProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        FileSerialProvider { path, lock_path }
    }
}

impl SerialProvider for FileSerialProvider {
    fn next(&self) -> Result<Serial, Error> {
        let mut lock = FileLock::create(&self.lock_path)?;
        let _guard = lock.write()?;

        let stored = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(Error::io(
                    format!(
                        "can't read serial file '{}'",
                        self.path.display()
                    ),
                    err,
                ))
            }
        };

        // Best effort: anything that does not parse as hex counts as
        // zero, so a damaged counter restarts at one.
        let stored = String::from_utf8_lossy(&stored);
        let current = Serial::from_hex(stored.trim()).unwrap_or_default();
        let next = current.next();

        file::save_atomic(next.to_hex().as_bytes(), &self.path, MODE_CERT)?;

        Ok(next)
    }
}

//------------ FileCrlHolder -------------------------------------------------

/// The CRL artifact as a single file.
///
/// Writers hold the exclusive advisory lock and replace the file
/// atomically; readers hold the shared lock and treat a missing or empty
/// file as an empty revocation list.
#[derive(Clone, Debug)]
pub struct FileCrlHolder {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileCrlHolder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        FileCrlHolder { path, lock_path }
    }
}

impl CrlHolder for FileCrlHolder {
    fn put(&self, content: &[u8]) -> Result<(), Error> {
        if self.path.is_dir() {
            return Err(Error::invalid(format!(
                "'{}' is a directory",
                self.path.display()
            )));
        }
        let mut lock = FileLock::create(&self.lock_path)?;
        let _guard = lock.write()?;

        file::save_atomic(content, &self.path, MODE_CERT)
    }

    fn get(&self) -> Result<Crl, Error> {
        let mut lock = FileLock::create(&self.lock_path)?;
        let _guard = lock.read()?;

        match fs::metadata(&self.path) {
            Ok(meta) if meta.len() > 0 => {}
            _ => return Ok(Crl::empty()),
        }
        let bytes = file::read(&self.path)?;
        Crl::from_pem(&bytes)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::test;
    use crate::crypto::cert::{generate_default_key, CertTemplate};
    use crate::crypto::{CrlEntry, SubjectTemplate};
    use chrono::{Duration, Utc};

    fn pair(cn: &str, serial: u64) -> X509Pair {
        X509Pair::new(
            format!("key for {}", serial).into_bytes(),
            format!("cert for {}", serial).into_bytes(),
            cn,
            Serial::from(serial),
        )
    }

    #[test]
    fn serial_provider_starts_at_one() {
        test::test_under_tmp(|dir| {
            let provider = FileSerialProvider::new(dir.join("serial"));
            assert_eq!(provider.next().unwrap(), Serial::from(1));
            assert_eq!(provider.next().unwrap(), Serial::from(2));
            assert_eq!(provider.next().unwrap(), Serial::from(3));
            assert_eq!(
                fs::read_to_string(dir.join("serial")).unwrap(),
                "3"
            );
        })
    }

    #[test]
    fn serial_provider_continues_from_stored_value() {
        test::test_under_tmp(|dir| {
            let path = dir.join("serial");
            fs::write(&path, "ff").unwrap();
            let provider = FileSerialProvider::new(&path);
            assert_eq!(provider.next().unwrap(), Serial::from(0x100));
            assert_eq!(fs::read_to_string(&path).unwrap(), "100");
        })
    }

    #[test]
    fn serial_provider_restarts_on_garbage() {
        test::test_under_tmp(|dir| {
            let path = dir.join("serial");
            fs::write(&path, "certainly not hex").unwrap();
            let provider = FileSerialProvider::new(&path);
            assert_eq!(provider.next().unwrap(), Serial::from(1));
        })
    }

    #[test]
    fn serial_provider_is_unique_across_threads() {
        test::test_under_tmp(|dir| {
            let provider = FileSerialProvider::new(dir.join("serial"));
            let mut all = std::thread::scope(|scope| {
                let handles: Vec<_> = (0..4)
                    .map(|_| {
                        scope.spawn(|| {
                            (0..10)
                                .map(|_| provider.next().unwrap())
                                .collect::<Vec<_>>()
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .flat_map(|handle| handle.join().unwrap())
                    .collect::<Vec<_>>()
            });
            all.sort();
            let expected: Vec<_> =
                (1..=40u64).map(Serial::from).collect();
            assert_eq!(all, expected);
        })
    }

    #[test]
    fn put_then_lookup_agree() {
        test::test_under_tmp(|dir| {
            let storage = DirKeyStorage::new(&dir);
            let alice = pair("alice", 2);
            storage.put(&alice).unwrap();

            let by_cn = storage.get_by_cn("alice").unwrap();
            assert_eq!(by_cn, vec![alice.clone()]);

            let by_serial =
                storage.get_by_serial(&Serial::from(2)).unwrap();
            assert_eq!(by_serial, alice);

            assert!(dir.join("alice/2.crt").is_file());
            assert!(dir.join("alice/2.key").is_file());
        })
    }

    #[cfg(unix)]
    #[test]
    fn put_applies_key_and_cert_modes() {
        use std::os::unix::fs::PermissionsExt;

        test::test_under_tmp(|dir| {
            let storage = DirKeyStorage::new(&dir);
            storage.put(&pair("alice", 2)).unwrap();

            let cert_mode = fs::metadata(dir.join("alice/2.crt"))
                .unwrap()
                .permissions()
                .mode();
            let key_mode = fs::metadata(dir.join("alice/2.key"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(cert_mode & 0o777, 0o644);
            assert_eq!(key_mode & 0o777, 0o600);
        })
    }

    #[test]
    fn lookups_fail_with_not_found() {
        test::test_under_tmp(|dir| {
            let storage = DirKeyStorage::new(&dir);
            assert!(storage.get_by_cn("nobody").unwrap_err().is_not_found());
            assert!(storage.get_by_cn("").unwrap_err().is_not_found());
            assert!(storage
                .get_by_serial(&Serial::from(9))
                .unwrap_err()
                .is_not_found());
            assert!(storage
                .get_last_by_cn("nobody")
                .unwrap_err()
                .is_not_found());
        })
    }

    #[test]
    fn put_rejects_empty_cn() {
        test::test_under_tmp(|dir| {
            let storage = DirKeyStorage::new(&dir);
            let err = storage.put(&pair("", 1)).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)));
        })
    }

    #[test]
    fn get_last_by_cn_compares_numerically() {
        test::test_under_tmp(|dir| {
            let storage = DirKeyStorage::new(&dir);
            // serial 10 is 'a' in hex and sorts before '2' as a string
            storage.put(&pair("ca", 2)).unwrap();
            storage.put(&pair("ca", 10)).unwrap();

            let last = storage.get_last_by_cn("ca").unwrap();
            assert_eq!(*last.serial(), Serial::from(10));
        })
    }

    #[test]
    fn lookup_handles_serials_beyond_64_bits() {
        test::test_under_tmp(|dir| {
            let storage = DirKeyStorage::new(&dir);
            let serial = Serial::from_hex("1ffffffffffffffffff").unwrap();
            let wide = X509Pair::new(
                &b"key"[..],
                &b"cert"[..],
                "wide",
                serial.clone(),
            );
            storage.put(&wide).unwrap();

            assert_eq!(storage.get_by_serial(&serial).unwrap(), wide);
        })
    }

    #[test]
    fn lookups_skip_foreign_files() {
        test::test_under_tmp(|dir| {
            let storage = DirKeyStorage::new(&dir);
            storage.put(&pair("alice", 2)).unwrap();
            // not a hex serial, and a cert without its key
            fs::write(dir.join("alice/readme.crt"), "hello").unwrap();
            fs::write(dir.join("alice/3.crt"), "orphaned").unwrap();

            let pairs = storage.get_by_cn("alice").unwrap();
            assert_eq!(pairs.len(), 1);
            assert_eq!(storage.get_all().unwrap().len(), 1);
        })
    }

    #[test]
    fn delete_by_cn_removes_the_directory() {
        test::test_under_tmp(|dir| {
            let storage = DirKeyStorage::new(&dir);
            storage.put(&pair("alice", 1)).unwrap();
            storage.put(&pair("alice", 2)).unwrap();

            storage.delete_by_cn("alice").unwrap();
            assert!(!dir.join("alice").exists());
            assert!(storage.get_by_cn("alice").unwrap_err().is_not_found());
        })
    }

    #[test]
    fn delete_by_serial_removes_one_pair() {
        test::test_under_tmp(|dir| {
            let storage = DirKeyStorage::new(&dir);
            storage.put(&pair("alice", 1)).unwrap();
            storage.put(&pair("alice", 2)).unwrap();

            storage.delete_by_serial(&Serial::from(1)).unwrap();
            assert!(!dir.join("alice/1.crt").exists());
            assert!(!dir.join("alice/1.key").exists());
            assert!(dir.join("alice/2.crt").is_file());
        })
    }

    #[test]
    fn get_all_spans_common_names() {
        test::test_under_tmp(|dir| {
            let storage = DirKeyStorage::new(&dir);
            storage.put(&pair("ca", 1)).unwrap();
            storage.put(&pair("alice", 2)).unwrap();
            storage.put(&pair("bob", 3)).unwrap();

            let mut cns: Vec<_> = storage
                .get_all()
                .unwrap()
                .into_iter()
                .map(|p| p.cn().to_string())
                .collect();
            cns.sort();
            assert_eq!(cns, vec!["alice", "bob", "ca"]);
        })
    }

    #[test]
    fn crl_holder_returns_empty_without_file() {
        test::test_under_tmp(|dir| {
            let holder = FileCrlHolder::new(dir.join("crl.pem"));
            assert!(holder.get().unwrap().entries().is_empty());

            // an empty file is just as fine
            fs::write(dir.join("crl.pem"), "").unwrap();
            assert!(holder.get().unwrap().entries().is_empty());
        })
    }

    #[test]
    fn crl_holder_roundtrips_a_signed_list() {
        test::test_under_tmp(|dir| {
            let (key, _pem) = generate_default_key().unwrap();
            let ca = CertTemplate::ca("ca", Serial::from(1))
                .sign(&SubjectTemplate::default(), &key, None)
                .unwrap();
            let ca_der = ca.to_der().unwrap();

            let now = Utc::now();
            let mut crl = Crl::empty();
            crl.push(CrlEntry::new(Serial::from(300), now));
            let pem = crl
                .to_signed_pem(&ca_der, &key, now, now + Duration::days(1))
                .unwrap();

            let holder = FileCrlHolder::new(dir.join("crl.pem"));
            holder.put(&pem).unwrap();

            let read_back = holder.get().unwrap();
            assert_eq!(read_back.entries().len(), 1);
            assert!(read_back.contains(&Serial::from(300)));
        })
    }

    #[test]
    fn crl_holder_rejects_directory_target() {
        test::test_under_tmp(|dir| {
            let holder = FileCrlHolder::new(&dir);
            let err = holder.put(b"whatever").unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)));
        })
    }

    #[test]
    fn crl_holder_propagates_parse_errors() {
        test::test_under_tmp(|dir| {
            let path = dir.join("crl.pem");
            fs::write(&path, "not a pem at all").unwrap();
            let holder = FileCrlHolder::new(&path);
            let err = holder.get().unwrap_err();
            assert!(matches!(err, Error::Parse(_)));
        })
    }
}
