//! Access to the directory of point-in-time leaderboard captures.
//!
//! Each capture is a JSON file named `<prefix>-YYYYMMDD_HHMM.json` holding
//! `{ "data": [ ...player records... ] }`. The capture instant comes from the
//! file name, read as UTC. Files are validated here so the merger only ever
//! sees well-formed records.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

pub const SNAPSHOT_EXTENSION: &str = ".json";

const STAMP_LEN: usize = 13;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("snapshot file name `{0}` does not carry a YYYYMMDD_HHMM capture stamp")]
    InvalidFileName(String),
    #[error("snapshot content is malformed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record {index} is invalid: {reason}")]
    InvalidRecord { index: usize, reason: &'static str },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> SnapshotError + '_ {
    move |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One player row as published by the leaderboard API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub name: String,
    #[serde(default)]
    pub steam_name: Option<String>,
    #[serde(default)]
    pub psn_name: Option<String>,
    #[serde(default)]
    pub xbox_name: Option<String>,
    pub rank: i64,
    pub rank_score: i64,
    pub league: String,
    pub league_number: i32,
    #[serde(default)]
    pub change: Option<i64>,
}

impl SnapshotRecord {
    /// First non-empty alternate-platform name, if the player has one.
    pub fn display_name(&self) -> Option<&str> {
        [&self.steam_name, &self.psn_name, &self.xbox_name]
            .into_iter()
            .filter_map(|name| name.as_deref())
            .map(str::trim)
            .find(|name| !name.is_empty())
    }

    pub fn rank_change(&self) -> i64 {
        self.change.unwrap_or(0)
    }

    fn validate(&self, index: usize) -> Result<(), SnapshotError> {
        let reason = if self.name.trim().is_empty() {
            "player name is empty"
        } else if self.rank < 1 {
            "rank must be positive"
        } else if self.league.trim().is_empty() {
            "league is empty"
        } else {
            return Ok(());
        };
        Err(SnapshotError::InvalidRecord { index, reason })
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotFile {
    data: Vec<SnapshotRecord>,
}

/// A validated capture, ready to be folded into history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub file_name: String,
    pub captured_at: DateTime<Utc>,
    pub records: Vec<SnapshotRecord>,
}

/// Derives the capture instant from a `<prefix>-YYYYMMDD_HHMM.json` file name.
pub fn captured_at_from_file_name(file_name: &str) -> Result<DateTime<Utc>, SnapshotError> {
    let invalid = || SnapshotError::InvalidFileName(file_name.to_string());
    let stem = file_name.strip_suffix(SNAPSHOT_EXTENSION).ok_or_else(invalid)?;
    let stamp = stem.rsplit_once('-').map_or(stem, |(_, stamp)| stamp);
    parse_stamp(stamp).ok_or_else(invalid)
}

fn parse_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    if stamp.len() != STAMP_LEN || stamp.as_bytes()[8] != b'_' {
        return None;
    }
    let field = |from: usize, to: usize| -> Option<u32> {
        let digits = stamp.get(from..to)?;
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    };
    let date = NaiveDate::from_ymd_opt(field(0, 4)? as i32, field(4, 6)?, field(6, 8)?)?;
    let naive = date.and_hms_opt(field(9, 11)?, field(11, 13)?, 0)?;
    Some(Utc.from_utc_datetime(&naive))
}

/// File name a producer should use for a capture taken at `captured_at`.
pub fn snapshot_file_name(prefix: &str, captured_at: DateTime<Utc>) -> String {
    format!(
        "{prefix}-{}{SNAPSHOT_EXTENSION}",
        captured_at.format("%Y%m%d_%H%M")
    )
}

pub fn parse_snapshot(
    file_name: &str,
    captured_at: DateTime<Utc>,
    bytes: &[u8],
) -> Result<Snapshot, SnapshotError> {
    let file: SnapshotFile = serde_json::from_slice(bytes)?;
    for (index, record) in file.data.iter().enumerate() {
        record.validate(index)?;
    }
    Ok(Snapshot {
        file_name: file_name.to_string(),
        captured_at,
        records: file.data,
    })
}

/// A snapshot file waiting to be merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSnapshot {
    pub file_name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SnapshotDir {
    root: PathBuf,
}

impl SnapshotDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lists `.json` files in file-name order. A missing directory has nothing pending.
    pub async fn pending(&self) -> Result<Vec<PendingSnapshot>, SnapshotError> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(dir = %self.root.display(), "snapshot directory does not exist");
                return Ok(Vec::new());
            }
            Err(err) => return Err(io_error(&self.root)(err)),
        };

        let mut pending = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(io_error(&self.root))? {
            let Ok(file_name) = entry.file_name().into_string() else {
                continue;
            };
            if !file_name.ends_with(SNAPSHOT_EXTENSION) {
                continue;
            }
            let file_type = entry.file_type().await.map_err(io_error(&entry.path()))?;
            if !file_type.is_file() {
                continue;
            }
            pending.push(PendingSnapshot {
                file_name,
                path: entry.path(),
            });
        }
        pending.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(pending)
    }

    pub async fn load(&self, pending: &PendingSnapshot) -> Result<Snapshot, SnapshotError> {
        let captured_at = captured_at_from_file_name(&pending.file_name)?;
        let bytes = fs::read(&pending.path)
            .await
            .map_err(io_error(&pending.path))?;
        parse_snapshot(&pending.file_name, captured_at, &bytes)
    }

    /// Deletes a consumed snapshot. Already-removed files are not an error.
    pub async fn remove(&self, pending: &PendingSnapshot) -> Result<(), SnapshotError> {
        match fs::remove_file(&pending.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&pending.path)(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn capture_time_comes_from_file_name() {
        assert_eq!(
            captured_at_from_file_name("s9-20250601_1000.json").unwrap(),
            at(2025, 6, 1, 10, 0)
        );
        assert_eq!(
            captured_at_from_file_name("ranked-crossplay-20251231_2359.json").unwrap(),
            at(2025, 12, 31, 23, 59)
        );
        assert_eq!(
            captured_at_from_file_name("20250601_0905.json").unwrap(),
            at(2025, 6, 1, 9, 5)
        );
    }

    #[test]
    fn rejects_file_names_without_valid_stamp() {
        for name in [
            "s9-20250601_1000.txt",
            "s9-20250601.json",
            "s9-2025060a_1000.json",
            "s9-20251301_1000.json",
            "s9-20250601_2460.json",
            "s9-20250601-1000.json",
        ] {
            assert!(
                matches!(
                    captured_at_from_file_name(name),
                    Err(SnapshotError::InvalidFileName(_))
                ),
                "`{name}` should be rejected"
            );
        }
    }

    #[test]
    fn file_name_round_trips_through_stamp() {
        let captured = at(2025, 6, 1, 11, 30);
        let name = snapshot_file_name("s9", captured);
        assert_eq!(name, "s9-20250601_1130.json");
        assert_eq!(captured_at_from_file_name(&name).unwrap(), captured);
    }

    #[test]
    fn parses_records_and_ignores_unknown_fields() {
        let raw = br#"{
            "meta": { "leaderboardVersion": "s9" },
            "count": 2,
            "data": [
                { "rank": 1, "change": 3, "name": "Alpha#0001", "steamName": "alpha",
                  "psnName": "", "xboxName": "", "clubTag": "CLUB",
                  "leagueNumber": 21, "league": "Ruby", "rankScore": 55000 },
                { "rank": 2, "name": "Bravo#0002", "steamName": "", "psnName": "bravo_psn",
                  "leagueNumber": 20, "league": "Diamond 1", "rankScore": 49000 }
            ]
        }"#;
        let snapshot = parse_snapshot("s9-20250601_1000.json", at(2025, 6, 1, 10, 0), raw)
            .expect("snapshot parses");
        assert_eq!(snapshot.records.len(), 2);
        assert_eq!(snapshot.records[0].display_name(), Some("alpha"));
        assert_eq!(snapshot.records[0].rank_change(), 3);
        assert_eq!(snapshot.records[1].display_name(), Some("bravo_psn"));
        assert_eq!(snapshot.records[1].rank_change(), 0);
    }

    #[test]
    fn missing_data_field_is_malformed() {
        let err = parse_snapshot("s9-20250601_1000.json", at(2025, 6, 1, 10, 0), br#"{"count":0}"#)
            .expect_err("data is required");
        assert!(matches!(err, SnapshotError::Json(_)));
        assert!(err.to_string().contains("data"));
    }

    #[test]
    fn blank_player_name_is_rejected() {
        let raw = br#"{"data":[{"name":"  ","rank":1,"rankScore":1,"league":"Ruby","leagueNumber":21}]}"#;
        let err = parse_snapshot("s9-20250601_1000.json", at(2025, 6, 1, 10, 0), raw)
            .expect_err("blank name rejected");
        assert!(matches!(err, SnapshotError::InvalidRecord { index: 0, .. }));
    }

    #[tokio::test]
    async fn lists_json_files_in_name_order() {
        let dir = tempfile::tempdir().expect("temp dir");
        for name in [
            "s9-20250601_1100.json",
            "notes.txt",
            "s9-20250601_0900.json",
            "s9-20250601_1000.json",
        ] {
            std::fs::write(dir.path().join(name), b"{}").expect("write fixture");
        }
        std::fs::create_dir(dir.path().join("nested.json")).expect("create dir");

        let store = SnapshotDir::new(dir.path());
        let names: Vec<String> = store
            .pending()
            .await
            .expect("listing works")
            .into_iter()
            .map(|p| p.file_name)
            .collect();
        assert_eq!(
            names,
            vec![
                "s9-20250601_0900.json",
                "s9-20250601_1000.json",
                "s9-20250601_1100.json",
            ]
        );
    }

    #[tokio::test]
    async fn missing_directory_has_nothing_pending() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = SnapshotDir::new(dir.path().join("absent"));
        assert!(store.pending().await.expect("missing dir is fine").is_empty());
    }

    #[tokio::test]
    async fn load_and_remove_snapshot() {
        let dir = tempfile::tempdir().expect("temp dir");
        let name = "s9-20250601_1000.json";
        std::fs::write(
            dir.path().join(name),
            br#"{"data":[{"name":"A","rank":50,"rankScore":1000,"league":"Bronze 4","leagueNumber":1}]}"#,
        )
        .expect("write fixture");

        let store = SnapshotDir::new(dir.path());
        let pending = store.pending().await.expect("listing works");
        assert_eq!(pending.len(), 1);

        let snapshot = store.load(&pending[0]).await.expect("snapshot loads");
        assert_eq!(snapshot.captured_at, at(2025, 6, 1, 10, 0));
        assert_eq!(snapshot.records[0].rank_score, 1000);

        store.remove(&pending[0]).await.expect("remove works");
        store.remove(&pending[0]).await.expect("second remove is a no-op");
        assert!(store.pending().await.expect("listing works").is_empty());
    }
}
