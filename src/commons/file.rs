//! Filesystem helper functions.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::NamedTempFile;

use crate::commons::error::Error;

/// Creates a sub dir if needed, returns the full path to it.
pub fn sub_dir(base: &Path, name: &str) -> Result<PathBuf, Error> {
    let mut full_path = base.to_path_buf();
    full_path.push(name);
    create_dir(&full_path)?;
    Ok(full_path)
}

pub fn create_dir(dir: &Path) -> Result<(), Error> {
    if !dir.is_dir() {
        fs::create_dir_all(dir).map_err(|e| {
            Error::io(
                format!("could not create dir '{}'", dir.display()),
                e,
            )
        })?;
    }
    Ok(())
}

/// Derive the path for a file under a base directory.
pub fn file_path(base_path: &Path, file_name: &str) -> PathBuf {
    let mut path = base_path.to_path_buf();
    path.push(file_name);
    path
}

/// Reads a file to Bytes.
pub fn read(path: &Path) -> Result<Bytes, Error> {
    let bytes = fs::read(path).map_err(|e| {
        Error::io(format!("could not read '{}'", path.display()), e)
    })?;
    Ok(Bytes::from(bytes))
}

/// Replaces the file at `path` with `content`.
///
/// The content is written to a temporary sibling in the same directory,
/// flushed, given the requested mode bits and then renamed over the
/// target. Readers observe either the old content or the new content,
/// never a torn write. The temporary file is cleaned up on error.
pub fn save_atomic(content: &[u8], path: &Path, mode: u32) -> Result<(), Error> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| {
        Error::io(
            format!("could not create temp file in '{}'", dir.display()),
            e,
        )
    })?;
    tmp.write_all(content).map_err(|e| {
        Error::io(
            format!("could not write temp file for '{}'", path.display()),
            e,
        )
    })?;
    tmp.as_file().sync_all().map_err(|e| {
        Error::io(
            format!("could not flush temp file for '{}'", path.display()),
            e,
        )
    })?;
    set_mode(tmp.path(), mode)?;
    tmp.persist(path).map_err(|e| {
        Error::io(
            format!("could not replace '{}' with temp file", path.display()),
            e.error,
        )
    })?;

    trace!("Saved file: {}", path.display());
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
        Error::io(
            format!("could not set mode on '{}'", path.display()),
            e,
        )
    })
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), Error> {
    Ok(())
}

//------------ Tests ---------------------------------------------------------
