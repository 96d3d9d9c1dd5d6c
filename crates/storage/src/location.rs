use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::StoreError;

const MEMORY_PREFIX: &str = "sqlite::memory:";
const URL_PREFIX: &str = "sqlite://";

/// Where the History Store lives: a JSON document on disk or a SQLite database URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    JsonFile(PathBuf),
    Sqlite(String),
}

impl StoreLocation {
    pub fn is_sqlite(&self) -> bool {
        matches!(self, Self::Sqlite(_))
    }

    /// Creates the directory the store will be written into.
    pub fn ensure_parent_dir(&self) -> Result<(), StoreError> {
        match self {
            Self::JsonFile(path) => create_parent(path),
            Self::Sqlite(url) => ensure_sqlite_parent_dir(url),
        }
    }
}

impl FromStr for StoreLocation {
    type Err = StoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(StoreError::InvalidLocation(
                "history store location is empty".into(),
            ));
        }
        if raw.starts_with("sqlite:") {
            validate_sqlite_path(raw)?;
            return Ok(Self::Sqlite(raw.to_string()));
        }
        Ok(Self::JsonFile(PathBuf::from(raw)))
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JsonFile(path) => write!(f, "{}", path.display()),
            Self::Sqlite(url) => f.write_str(url),
        }
    }
}

fn create_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }
    Ok(())
}

pub(crate) fn ensure_sqlite_parent_dir(url: &str) -> Result<(), StoreError> {
    match sqlite_file_path(url) {
        Some(path) => create_parent(&path),
        None => Ok(()),
    }
}

/// Database file named by a `sqlite://` URL, without query parameters. Other
/// URLs, including in-memory ones, name no file. `sqlite:///C:/data/h.db` yields `C:/data/h.db`.
pub(crate) fn sqlite_file_path(url: &str) -> Option<PathBuf> {
    let rest = url.strip_prefix(URL_PREFIX)?;
    let path = rest.split_once('?').map_or(rest, |(path, _)| path);
    let path = match path.as_bytes() {
        [b'/', drive, b':', ..] if drive.is_ascii_alphabetic() => &path[1..],
        _ => path,
    };
    Some(PathBuf::from(path))
}

pub(crate) fn validate_sqlite_path(url: &str) -> Result<(), StoreError> {
    if url.starts_with(MEMORY_PREFIX) {
        return Ok(());
    }
    match sqlite_file_path(url) {
        None => Err(StoreError::InvalidLocation(
            "sqlite store must start with `sqlite://` or use `sqlite::memory:`".into(),
        )),
        Some(path) if path.as_os_str().is_empty() => Err(StoreError::InvalidLocation(
            "sqlite store is missing a filesystem component after `sqlite://`".into(),
        )),
        Some(_) => Ok(()),
    }
}
