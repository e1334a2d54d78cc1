//! Filesystem helpers shared by the briefcase cache.

use std::path::Path;

use anyhow::{bail, Error};

/// Create a directory (and all of its parents). Idempotent.
pub fn create_path<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let path = path.as_ref();
    if let Err(err) = std::fs::create_dir_all(path) {
        bail!("unable to create directory {:?} - {}", path, err);
    }
    Ok(())
}

/// Remove a directory tree if it exists. Missing directories are not an error.
pub fn remove_dir_all_if_exists<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let path = path.as_ref();
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => bail!("unable to remove directory {:?} - {}", path, err),
    }
}

/// Remove a file if it exists. Missing files are not an error.
pub fn remove_file_if_exists<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let path = path.as_ref();
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => bail!("unable to remove file {:?} - {}", path, err),
    }
}

/// Walk from `start` up towards `stop` (exclusive), removing each directory
/// that is empty. Stops at the first non-empty directory. Best effort - the
/// caller does not care whether a sibling appeared concurrently.
pub fn remove_empty_parents(start: &Path, stop: &Path) -> Result<(), Error> {
    let mut current = start;
    while current != stop && current.starts_with(stop) {
        match std::fs::remove_dir(current) {
            Ok(()) => {}
            Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(_) => break, // not empty (or not ours to remove)
        }
        current = match current.parent() {
            Some(parent) => parent,
            None => break,
        };
    }
    Ok(())
}

/// True if the directory exists and contains no entries.
pub fn dir_is_empty<P: AsRef<Path>>(path: P) -> bool {
    match std::fs::read_dir(path.as_ref()) {
        Ok(mut iter) => iter.next().is_none(),
        Err(_) => false,
    }
}
