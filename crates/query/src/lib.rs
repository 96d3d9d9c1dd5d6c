//! Read path over the History Store: one player's series, cut to a time range
//! and annotated with the rank-score change between consecutive visible entries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use model::{HistoryDocument, HistoryEntry, PlayerHistoryRecord};
use serde::{Deserialize, Serialize};
use storage::{HistoryStore, StoreError};
use thiserror::Error;
use tracing::debug;

/// Start of the current competitive season.
pub const DEFAULT_SEASON_START: &str = "2025-12-01T00:00:00Z";

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("player name is required")]
    MissingPlayerName,
    #[error("unknown range `{0}`, expected one of 24h, 7d, season")]
    InvalidRange(String),
    #[error("no history found for player `{0}`")]
    NotFound(String),
    #[error("history store unavailable: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeRange {
    #[serde(rename = "24h")]
    Day,
    #[default]
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "season")]
    Season,
}

impl TimeRange {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Day => "24h",
            Self::Week => "7d",
            Self::Season => "season",
        }
    }

    /// Earliest timestamp included in the range. The bound is inclusive.
    pub fn cutoff(self, now: DateTime<Utc>, season_start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Day => now - Duration::hours(24),
            Self::Week => now - Duration::days(7),
            Self::Season => season_start,
        }
    }
}

impl FromStr for TimeRange {
    type Err = QueryError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "24h" => Ok(Self::Day),
            "7d" => Ok(Self::Week),
            "season" => Ok(Self::Season),
            other => Err(QueryError::InvalidRange(other.to_string())),
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotatedEntry {
    #[serde(flatten)]
    pub entry: HistoryEntry,
    pub point_change: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerHistoryView {
    pub name: String,
    pub display_name: String,
    pub range: TimeRange,
    pub history: Vec<AnnotatedEntry>,
    /// Size of the player's full series, regardless of range.
    pub total_snapshots: usize,
}

/// Entries at or after `cutoff`, each carrying its score change from the previous
/// visible entry. The first visible entry always has a change of zero.
pub fn annotate_window(record: &PlayerHistoryRecord, cutoff: DateTime<Utc>) -> Vec<AnnotatedEntry> {
    let mut previous: Option<i64> = None;
    record
        .history
        .iter()
        .filter(|entry| entry.timestamp >= cutoff)
        .map(|entry| {
            let point_change = previous.map_or(0, |score| entry.rank_score - score);
            previous = Some(entry.rank_score);
            AnnotatedEntry {
                entry: entry.clone(),
                point_change,
            }
        })
        .collect()
}

pub fn player_history(
    doc: &HistoryDocument,
    name: &str,
    range: TimeRange,
    now: DateTime<Utc>,
    season_start: DateTime<Utc>,
) -> Result<PlayerHistoryView, QueryError> {
    let record = doc
        .get(name)
        .filter(|record| !record.history.is_empty())
        .ok_or_else(|| QueryError::NotFound(name.to_string()))?;

    Ok(PlayerHistoryView {
        name: record.name.clone(),
        display_name: record.display_name.clone(),
        range,
        history: annotate_window(record, range.cutoff(now, season_start)),
        total_snapshots: record.history.len(),
    })
}

/// Validates raw request parameters: a non-blank player name and an optional range.
///
/// An absent range selects the week. A range that is present but unrecognized
/// selects the whole season, matching what the dashboard has always shown.
pub fn parse_params(
    name: Option<&str>,
    range: Option<&str>,
) -> Result<(String, TimeRange), QueryError> {
    let name = name
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or(QueryError::MissingPlayerName)?;
    let range = match range.map(str::trim).filter(|r| !r.is_empty()) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            debug!(range = raw, "unrecognized range, using season window");
            TimeRange::Season
        }),
        None => TimeRange::default(),
    };
    Ok((name.to_string(), range))
}

#[derive(Debug, Clone)]
pub struct QueryService {
    store: HistoryStore,
    season_start: DateTime<Utc>,
}

impl QueryService {
    pub fn new(store: HistoryStore, season_start: DateTime<Utc>) -> Self {
        Self {
            store,
            season_start,
        }
    }

    pub fn season_start(&self) -> DateTime<Utc> {
        self.season_start
    }

    pub async fn query(
        &self,
        name: Option<&str>,
        range: Option<&str>,
    ) -> Result<PlayerHistoryView, QueryError> {
        self.query_at(name, range, Utc::now()).await
    }

    pub async fn query_at(
        &self,
        name: Option<&str>,
        range: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<PlayerHistoryView, QueryError> {
        let (name, range) = parse_params(name, range)?;
        let doc = self.store.load().await?;
        let view = player_history(&doc, &name, range, now, self.season_start)?;
        debug!(
            player = %name,
            %range,
            visible = view.history.len(),
            total = view.total_snapshots,
            "history query served"
        );
        Ok(view)
    }
}
