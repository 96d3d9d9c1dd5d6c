use std::io::{self, Write};
use std::path::{Path, PathBuf};

use model::HistoryDocument;
use tempfile::NamedTempFile;
use tokio::{fs, task};

use crate::StoreError;

/// Whole-document JSON persistence. Writes go to a temporary file in the target
/// directory and are renamed over the document, so readers see either the old or
/// the new content.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<HistoryDocument, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(HistoryDocument::new())
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    pub async fn save(&self, doc: &HistoryDocument) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(doc).map_err(StoreError::Encode)?;
        let path = self.path.clone();
        task::spawn_blocking(move || write_atomically(&path, &bytes)).await??;
        Ok(())
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let io_err = |at: &Path| {
        let at = at.to_path_buf();
        move |source| StoreError::Io { path: at, source }
    };

    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err(dir))?;
    // temp files start out owner-only; readers of the document may run as another user
    if let Some(permissions) = document_permissions(path) {
        tmp.as_file()
            .set_permissions(permissions)
            .map_err(io_err(tmp.path()))?;
    }
    tmp.write_all(bytes).map_err(io_err(tmp.path()))?;
    tmp.as_file().sync_all().map_err(io_err(tmp.path()))?;
    tmp.persist(path).map_err(|err| StoreError::Io {
        path: path.to_path_buf(),
        source: err.error,
    })?;
    Ok(())
}

/// Mode of the document being replaced, or 0644 for a new one.
fn document_permissions(path: &Path) -> Option<std::fs::Permissions> {
    match std::fs::metadata(path) {
        Ok(meta) => Some(meta.permissions()),
        Err(_) => new_document_permissions(),
    }
}

#[cfg(unix)]
fn new_document_permissions() -> Option<std::fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(std::fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn new_document_permissions() -> Option<std::fs::Permissions> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use model::HistoryEntry;

    fn sample_document() -> HistoryDocument {
        let mut doc = HistoryDocument::new();
        doc.get_or_create("Alpha#0001", "alpha")
            .history
            .push(HistoryEntry {
                timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap(),
                rank: 50,
                rank_score: 1000,
                league: "Bronze 4".into(),
                league_number: 1,
                change: 0,
            });
        doc
    }

    #[tokio::test]
    async fn missing_document_loads_as_empty() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = JsonFileStore::new(dir.path().join("player-history.json"));
        assert!(store.load().await.expect("load works").is_empty());
    }

    #[tokio::test]
    async fn saved_document_is_read_back_and_replaces_previous() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = JsonFileStore::new(dir.path().join("player-history.json"));

        store.save(&HistoryDocument::new()).await.expect("first save");
        let doc = sample_document();
        store.save(&doc).await.expect("second save");

        assert_eq!(store.load().await.expect("load works"), doc);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .map(|e| e.file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("player-history.json")]);
    }

    #[tokio::test]
    async fn corrupt_document_is_an_error_and_left_untouched() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("player-history.json");
        std::fs::write(&path, b"{ not json").expect("write fixture");

        let store = JsonFileStore::new(&path);
        let err = store.load().await.expect_err("corrupt document rejected");
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert_eq!(std::fs::read(&path).expect("read back"), b"{ not json");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn saved_document_is_world_readable_and_keeps_existing_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("player-history.json");
        let store = JsonFileStore::new(&path);
        let mode = |path: &Path| std::fs::metadata(path).expect("metadata").permissions().mode() & 0o777;

        store.save(&sample_document()).await.expect("first save");
        assert_eq!(mode(&path), 0o644);

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640)).expect("chmod");
        store.save(&HistoryDocument::new()).await.expect("second save");
        assert_eq!(mode(&path), 0o640);
    }

    #[tokio::test]
    async fn document_with_null_upstream_values_loads() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("player-history.json");
        std::fs::write(
            &path,
            br#"{"A":{"name":"A","steamName":null,"history":[{"timestamp":"2025-06-01T10:00:00.000Z","rank":1,"rankScore":10,"league":"Gold 1","leagueNumber":12,"change":null}]}}"#,
        )
        .expect("write fixture");

        let doc = JsonFileStore::new(&path).load().await.expect("legacy document loads");
        assert_eq!(doc.entry_count(), 1);
        assert_eq!(doc.get("A").expect("player present").history[0].change, 0);
    }
}
