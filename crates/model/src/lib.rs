use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Default number of entries retained per player.
pub const MAX_HISTORY_ENTRIES: usize = 500;

// Older documents store upstream values verbatim, including `null`.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One timestamped observation of a player's ranked state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub rank: i64,
    pub rank_score: i64,
    pub league: String,
    pub league_number: i32,
    /// Rank-position delta reported by the leaderboard for this capture.
    #[serde(default, deserialize_with = "null_as_default")]
    pub change: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerHistoryRecord {
    pub name: String,
    #[serde(default, alias = "steamName", deserialize_with = "null_as_default")]
    pub display_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub history: Vec<HistoryEntry>,
}

impl PlayerHistoryRecord {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            history: Vec::new(),
        }
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.history.last()
    }

    /// Position of the entry recorded at `timestamp`, or the insertion point that keeps
    /// the series sorted.
    pub fn locate(&self, timestamp: DateTime<Utc>) -> Result<usize, usize> {
        self.history.binary_search_by_key(&timestamp, |entry| entry.timestamp)
    }

    pub fn has_entry_at(&self, timestamp: DateTime<Utc>) -> bool {
        self.locate(timestamp).is_ok()
    }

    /// Drops the oldest entries until at most `cap` remain. Returns how many were evicted.
    pub fn enforce_retention(&mut self, cap: usize) -> usize {
        let excess = self.history.len().saturating_sub(cap);
        if excess > 0 {
            self.history.drain(..excess);
        }
        excess
    }

    /// Restores the series invariants on data that did not come from the merger:
    /// ascending timestamps, one entry per timestamp, at most `cap` entries.
    /// Returns true when anything changed.
    pub fn normalize(&mut self, cap: usize) -> bool {
        let before = self.history.len();
        let sorted = self
            .history
            .windows(2)
            .all(|pair| pair[0].timestamp < pair[1].timestamp);
        if !sorted {
            // stable sort keeps the first-written entry ahead of later duplicates
            self.history.sort_by_key(|entry| entry.timestamp);
            self.history.dedup_by_key(|entry| entry.timestamp);
        }
        let evicted = self.enforce_retention(cap);
        !sorted || evicted > 0 || self.history.len() != before
    }
}

/// The whole History Store: player identifier to that player's series.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryDocument {
    players: BTreeMap<String, PlayerHistoryRecord>,
}

impl HistoryDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&PlayerHistoryRecord> {
        self.players.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut PlayerHistoryRecord> {
        self.players.get_mut(name)
    }

    pub fn get_or_create(&mut self, name: &str, display_name: &str) -> &mut PlayerHistoryRecord {
        self.players
            .entry(name.to_string())
            .or_insert_with(|| PlayerHistoryRecord::new(name, display_name))
    }

    pub fn insert(&mut self, record: PlayerHistoryRecord) {
        self.players.insert(record.name.clone(), record);
    }

    pub fn players(&self) -> impl Iterator<Item = &PlayerHistoryRecord> {
        self.players.values()
    }

    pub fn players_mut(&mut self) -> impl Iterator<Item = &mut PlayerHistoryRecord> {
        self.players.values_mut()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.players.values().map(|p| p.history.len()).sum()
    }
}

/// Outcome of one merge run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub run_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub snapshots_seen: usize,
    pub snapshots_merged: usize,
    pub rejected_files: Vec<String>,
    pub entries_appended: usize,
    pub duplicates_skipped: usize,
    pub entries_evicted: usize,
    pub players_total: usize,
    pub store_written: bool,
    pub delete_failures: usize,
}

impl MergeReport {
    pub fn snapshots_rejected(&self) -> usize {
        self.rejected_files.len()
    }
}
