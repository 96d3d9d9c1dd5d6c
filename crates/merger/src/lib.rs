//! Folds pending leaderboard snapshots into the History Store.
//!
//! A run loads the store once, folds every readable snapshot in file-name
//! order, writes the store once, and only then deletes the snapshots it
//! consumed. A crash or a failed write leaves both the store and the snapshot
//! directory as they were, so the next run simply repeats the work.

use chrono::{DateTime, Utc};
use model::{HistoryDocument, HistoryEntry, MergeReport, MAX_HISTORY_ENTRIES};
use snapshots::{PendingSnapshot, Snapshot, SnapshotDir, SnapshotError, SnapshotRecord};
use storage::{HistoryStore, StoreError};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("failed to load history store: {0}")]
    Load(#[source] StoreError),
    #[error("failed to persist history store: {0}")]
    Persist(#[source] StoreError),
    #[error("failed to list pending snapshots: {0}")]
    Snapshots(#[from] SnapshotError),
}

/// Counters for one folded snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldStats {
    pub appended: usize,
    pub duplicates: usize,
    pub evicted: usize,
}

fn entry_from(record: &SnapshotRecord, timestamp: DateTime<Utc>) -> HistoryEntry {
    HistoryEntry {
        timestamp,
        rank: record.rank,
        rank_score: record.rank_score,
        league: record.league.clone(),
        league_number: record.league_number,
        change: record.rank_change(),
    }
}

/// Applies one snapshot to the document.
///
/// Every record is stamped with the snapshot's capture time. A player that already
/// has an entry at that instant is left untouched; otherwise the entry is inserted
/// in timestamp order and the series is trimmed to `retention` entries, oldest first.
pub fn fold_snapshot(doc: &mut HistoryDocument, snapshot: &Snapshot, retention: usize) -> FoldStats {
    let mut stats = FoldStats::default();
    for record in &snapshot.records {
        let display_name = record.display_name().unwrap_or_default();
        let player = doc.get_or_create(&record.name, display_name);
        let slot = match player.locate(snapshot.captured_at) {
            Ok(_) => {
                stats.duplicates += 1;
                continue;
            }
            Err(slot) => slot,
        };

        if !display_name.is_empty() && player.display_name != display_name {
            player.display_name = display_name.to_string();
        }
        player
            .history
            .insert(slot, entry_from(record, snapshot.captured_at));
        stats.appended += 1;
        stats.evicted += player.enforce_retention(retention);
    }
    stats
}

pub struct Merger {
    store: HistoryStore,
    snapshots: SnapshotDir,
    retention: usize,
}

impl Merger {
    pub fn new(store: HistoryStore, snapshots: SnapshotDir) -> Self {
        Self {
            store,
            snapshots,
            retention: MAX_HISTORY_ENTRIES,
        }
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    pub async fn run(&self) -> Result<MergeReport, MergeError> {
        let run_id = Uuid::new_v4().to_string();
        let mut report = MergeReport {
            run_id: run_id.clone(),
            started_at: Some(Utc::now()),
            ..MergeReport::default()
        };

        let mut doc = self.store.load().await.map_err(MergeError::Load)?;
        let mut normalized = 0usize;
        for record in doc.players_mut() {
            if record.normalize(self.retention) {
                normalized += 1;
            }
        }
        if normalized > 0 {
            warn!(%run_id, players = normalized, "repaired series order or size in loaded store");
        }

        let pending = self.snapshots.pending().await?;
        report.snapshots_seen = pending.len();
        info!(
            %run_id,
            snapshots = pending.len(),
            dir = %self.snapshots.root().display(),
            "merging snapshots"
        );

        let mut consumed = Vec::with_capacity(pending.len());
        for file in pending {
            let snapshot = match self.snapshots.load(&file).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(%run_id, file = %file.file_name, error = %err, "skipping malformed snapshot");
                    report.rejected_files.push(file.file_name);
                    continue;
                }
            };

            let stats = fold_snapshot(&mut doc, &snapshot, self.retention);
            debug!(
                %run_id,
                file = %file.file_name,
                captured_at = %snapshot.captured_at,
                records = snapshot.records.len(),
                appended = stats.appended,
                duplicates = stats.duplicates,
                evicted = stats.evicted,
                "snapshot folded"
            );
            report.entries_appended += stats.appended;
            report.duplicates_skipped += stats.duplicates;
            report.entries_evicted += stats.evicted;
            consumed.push(file);
        }
        report.snapshots_merged = consumed.len();
        report.players_total = doc.len();

        if report.entries_appended > 0 || normalized > 0 {
            self.store.save(&doc).await.map_err(MergeError::Persist)?;
            report.store_written = true;
        }

        report.delete_failures = self.remove_consumed(&run_id, &consumed).await;

        info!(
            %run_id,
            merged = report.snapshots_merged,
            rejected = report.snapshots_rejected(),
            appended = report.entries_appended,
            duplicates = report.duplicates_skipped,
            evicted = report.entries_evicted,
            players = report.players_total,
            written = report.store_written,
            "merge run complete"
        );
        Ok(report)
    }

    /// Deletes snapshots already folded into a persisted store. Returns how many
    /// could not be removed; those are skipped as duplicates on the next run.
    async fn remove_consumed(&self, run_id: &str, consumed: &[PendingSnapshot]) -> usize {
        let mut failures = 0;
        for file in consumed {
            if let Err(err) = self.snapshots.remove(file).await {
                warn!(%run_id, file = %file.file_name, error = %err, "failed to delete consumed snapshot");
                failures += 1;
            }
        }
        failures
    }
}
