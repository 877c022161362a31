//! File system helpers: plain and atomic saves, lock files and directory
//! moves.
use std::{
    fs,
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use bytes::Bytes;
use log::trace;
use tempfile::NamedTempFile;

use crate::commons::error::IoError;

/// Creates a dir, and its parents, if needed.
pub fn create_dir(dir: &Path) -> Result<(), IoError> {
    if !dir.is_dir() {
        fs::create_dir_all(dir).map_err(|e| {
            IoError::new(format!("could not create dir: {}", dir.display()), e)
        })?;
    }
    Ok(())
}

/// Derive the path for this file.
pub fn file_path(base_path: &Path, file_name: &str) -> PathBuf {
    let mut path = base_path.to_path_buf();
    path.push(file_name);
    path
}

/// Reads a file to Bytes
pub fn read(path: &Path) -> Result<Bytes, IoError> {
    let mut f = File::open(path)
        .map_err(|e| IoError::new(format!("Could not open: '{}'", path.display()), e))?;
    let mut bytes = Vec::new();
    f.read_to_end(&mut bytes)
        .map_err(|e| IoError::new(format!("Could not read: {}", path.display()), e))?;
    Ok(Bytes::from(bytes))
}

/// Saves a file, creating parent dirs as needed.
///
/// The content is written to a temporary file in `tmp_dir` first and then
/// renamed into place, so readers see either the old or the new content.
/// The `tmp_dir` must be on the same file system as `path`.
pub fn save_atomic(content: &[u8], path: &Path, tmp_dir: &Path) -> Result<(), IoError> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    create_dir(tmp_dir)?;

    let mut tmp_file = NamedTempFile::new_in(tmp_dir).map_err(|e| {
        IoError::new(
            format!("writing temp file failed for '{}'", path.display()),
            e,
        )
    })?;
    tmp_file.write_all(content).map_err(|e| {
        IoError::new(
            format!("failed to write temp file '{}'", tmp_file.path().display()),
            e,
        )
    })?;
    tmp_file.as_file().sync_all().map_err(|e| {
        IoError::new(
            format!("failed to sync temp file '{}'", tmp_file.path().display()),
            e,
        )
    })?;

    tmp_file.persist(path).map_err(|err| {
        IoError::new(
            format!(
                "failed to rename temp file '{}' to '{}'",
                err.file.path().display(),
                path.display()
            ),
            err.error,
        )
    })?;

    trace!("Saved file: {}", path.display());
    Ok(())
}

/// Writes a new file and syncs it to disk before returning.
///
/// Fails if the file already exists.
pub fn write_synced(content: &[u8], path: &Path) -> Result<(), IoError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| IoError::new(format!("could not create '{}'", path.display()), e))?;
    file.write_all(content)
        .map_err(|e| IoError::new(format!("could not write '{}'", path.display()), e))?;
    file.sync_all()
        .map_err(|e| IoError::new(format!("could not sync '{}'", path.display()), e))
}

/// Syncs a directory, making renames and new entries in it durable.
pub fn sync_dir(dir: &Path) -> Result<(), IoError> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| IoError::new(format!("could not sync dir '{}'", dir.display()), e))
}

/// Reads a file, `Ok(None)` if it does not exist.
pub fn read_if_exists(path: &Path) -> Result<Option<Bytes>, IoError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(Bytes::from(bytes))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(IoError::new(
            format!("failed to read file '{}'", path.display()),
            err,
        )),
    }
}

/// Deletes a file if it exists, returns whether there was a file.
pub fn delete_if_exists(path: &Path) -> Result<bool, IoError> {
    match fs::remove_file(path) {
        Ok(()) => {
            trace!("Removed file: {}", path.display());
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(IoError::new(
            format!("Could not remove file: {}", path.display()),
            e,
        )),
    }
}

/// Renames a file or directory. Atomic when both are on the same file
/// system.
pub fn rename(from: &Path, to: &Path) -> Result<(), IoError> {
    fs::rename(from, to).map_err(|e| {
        IoError::new(
            format!("could not move '{}' to '{}'", from.display(), to.display()),
            e,
        )
    })
}

pub fn remove_dir_all(dir: &Path) -> Result<(), IoError> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(|e| {
            IoError::new(format!("could not remove-all dir: {}", dir.display()), e)
        })?;
    }
    Ok(())
}

/// Lists the file stems of all files in `dir` with the given extension.
///
/// Hidden files (starting with a '.') are skipped. A missing directory
/// yields an empty list.
pub fn list_stems_with_extension(dir: &Path, extension: &str) -> Result<Vec<String>, IoError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => {
            return Err(IoError::new(
                format!("could not read dir: {}", dir.display()),
                e,
            ));
        }
    };

    let mut res = vec![];
    for entry in entries {
        let entry = entry
            .map_err(|e| IoError::new(format!("could not read dir: {}", dir.display()), e))?;
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if !stem.starts_with('.') {
                res.push(stem.to_string());
            }
        }
    }
    res.sort();
    Ok(res)
}

//------------ FileLock ------------------------------------------------------

/// An exclusive advisory lock on a file in a lock directory.
///
/// Used to serialize structural changes to a directory tree between
/// processes.
#[derive(Debug)]
pub struct FileLock {
    lock: fd_lock::RwLock<File>,
}

impl FileLock {
    pub fn create(lock_dir: &Path, name: &str) -> Result<Self, IoError> {
        create_dir(lock_dir)?;
        let lock_path = file_path(lock_dir, name);

        let mut options = OpenOptions::new();
        options.create(true).truncate(false).read(true).write(true);
        let lock_file = options.open(&lock_path).map_err(|err| {
            IoError::new(
                format!("failed to open lock file '{}'", lock_path.display()),
                err,
            )
        })?;

        Ok(FileLock {
            lock: fd_lock::RwLock::new(lock_file),
        })
    }

    pub fn write(&mut self) -> Result<fd_lock::RwLockWriteGuard<'_, File>, IoError> {
        self.lock
            .write()
            .map_err(|e| IoError::new("Cannot get file lock", e))
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::test::test_under_tmp;

    #[test]
    fn save_atomic_replaces_content() {
        test_under_tmp(|d| {
            let path = d.join("sub").join("file.json");
            let tmp = d.join("tmp");
            save_atomic(b"first", &path, &tmp).unwrap();
            save_atomic(b"second", &path, &tmp).unwrap();
            assert_eq!(read(&path).unwrap().as_ref(), b"second");
            assert_eq!(fs::read_dir(&tmp).unwrap().count(), 0);
            assert_eq!(read_if_exists(&path).unwrap().unwrap().as_ref(), b"second");
            assert!(read_if_exists(&d.join("missing")).unwrap().is_none());
        })
    }

    #[test]
    fn write_synced_creates_new_files_only() {
        test_under_tmp(|d| {
            let path = d.join("store.p12");
            write_synced(b"content", &path).unwrap();
            sync_dir(&d).unwrap();
            assert_eq!(read(&path).unwrap().as_ref(), b"content");
            assert!(write_synced(b"other", &path).is_err());
            assert_eq!(read(&path).unwrap().as_ref(), b"content");
        })
    }

    #[test]
    fn list_stems_skips_hidden_and_other_extensions() {
        test_under_tmp(|d| {
            fs::write(d.join("B.p12"), b"").unwrap();
            fs::write(d.join("A.p12"), b"").unwrap();
            fs::write(d.join(".softtoken.p12"), b"").unwrap();
            fs::write(d.join("notes.txt"), b"").unwrap();
            assert_eq!(
                list_stems_with_extension(&d, "p12").unwrap(),
                vec!["A".to_string(), "B".to_string()]
            );
            assert!(list_stems_with_extension(&d.join("missing"), "p12")
                .unwrap()
                .is_empty());
        })
    }

    #[test]
    fn delete_if_exists_reports_presence() {
        test_under_tmp(|d| {
            let path = d.join("f");
            fs::write(&path, b"x").unwrap();
            assert!(delete_if_exists(&path).unwrap());
            assert!(!delete_if_exists(&path).unwrap());
        })
    }
}
