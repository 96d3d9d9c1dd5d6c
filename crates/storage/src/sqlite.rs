use std::str::FromStr;

use chrono::{TimeZone, Utc};
use model::{HistoryDocument, HistoryEntry, PlayerHistoryRecord};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::StoreError;

pub const INIT_SQL: &str = include_str!("../../../scripts/init_db.sql");

const MEMORY_PREFIX: &str = "sqlite::memory:";

/// History Store kept in SQLite. A save replaces every row inside one transaction.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let mut pool_options = SqlitePoolOptions::new().max_connections(5);
        if url.starts_with(MEMORY_PREFIX) {
            // every connection to `:memory:` is a separate database
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;
        run_init_sql(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn load(&self) -> Result<HistoryDocument, StoreError> {
        let mut tx = self.pool.begin().await?;

        let players = sqlx::query("SELECT name, display_name FROM players ORDER BY name")
            .fetch_all(&mut *tx)
            .await?;
        let entries = sqlx::query(
            "SELECT player, ts_ms, rank_position, rank_score, league, league_number, rank_change \
             FROM history_entries ORDER BY player, ts_ms",
        )
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut doc = HistoryDocument::new();
        for row in players {
            doc.insert(PlayerHistoryRecord::new(
                row.try_get::<String, _>("name")?,
                row.try_get::<String, _>("display_name")?,
            ));
        }
        for row in entries {
            let player: String = row.try_get("player")?;
            let ts_ms: i64 = row.try_get("ts_ms")?;
            let timestamp = Utc
                .timestamp_millis_opt(ts_ms)
                .single()
                .ok_or(StoreError::Timestamp(ts_ms))?;
            let entry = HistoryEntry {
                timestamp,
                rank: row.try_get("rank_position")?,
                rank_score: row.try_get("rank_score")?,
                league: row.try_get("league")?,
                league_number: row.try_get("league_number")?,
                change: row.try_get("rank_change")?,
            };
            if let Some(record) = doc.get_mut(&player) {
                record.history.push(entry);
            }
        }
        Ok(doc)
    }

    pub async fn save(&self, doc: &HistoryDocument) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM history_entries")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM players").execute(&mut *tx).await?;

        for record in doc.players() {
            sqlx::query("INSERT INTO players (name, display_name) VALUES (?1, ?2)")
                .bind(&record.name)
                .bind(&record.display_name)
                .execute(&mut *tx)
                .await?;
            for entry in &record.history {
                sqlx::query(
                    "INSERT INTO history_entries \
                     (player, ts_ms, rank_position, rank_score, league, league_number, rank_change) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .bind(&record.name)
                .bind(entry.timestamp.timestamp_millis())
                .bind(entry.rank)
                .bind(entry.rank_score)
                .bind(&entry.league)
                .bind(entry.league_number)
                .bind(entry.change)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

async fn run_init_sql(pool: &SqlitePool) -> Result<(), StoreError> {
    for statement in INIT_SQL.split(';') {
        let trimmed = statement.trim();
        if trimmed.is_empty() {
            continue;
        }
        sqlx::query(trimmed).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hour: u32, score: i64) -> HistoryEntry {
        HistoryEntry {
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, hour, 0, 0).unwrap(),
            rank: 10,
            rank_score: score,
            league: "Diamond 3".into(),
            league_number: 18,
            change: -1,
        }
    }

    #[tokio::test]
    async fn fresh_database_loads_as_empty() {
        let store = SqliteStore::connect("sqlite::memory:").await.expect("connect");
        assert!(store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn save_replaces_previous_content() {
        let dir = tempfile::tempdir().expect("temp dir");
        let url = format!("sqlite://{}", dir.path().join("history.db").display());
        let store = SqliteStore::connect(&url).await.expect("connect");

        let mut first = HistoryDocument::new();
        first.get_or_create("Gone#0001", "gone").history.push(entry(9, 1));
        store.save(&first).await.expect("first save");

        let mut second = HistoryDocument::new();
        let record = second.get_or_create("Alpha#0001", "alpha");
        record.history.push(entry(10, 1000));
        record.history.push(entry(11, 1200));
        store.save(&second).await.expect("second save");

        let reopened = SqliteStore::connect(&url).await.expect("reconnect");
        let loaded = reopened.load().await.expect("load");
        assert_eq!(loaded, second);
        assert!(loaded.get("Gone#0001").is_none());
    }

    #[tokio::test]
    async fn duplicate_timestamps_are_refused() {
        let store = SqliteStore::connect("sqlite::memory:").await.expect("connect");
        let mut doc = HistoryDocument::new();
        let record = doc.get_or_create("Alpha#0001", "");
        record.history.push(entry(10, 1));
        record.history.push(entry(10, 2));

        store.save(&doc).await.expect_err("primary key rejects duplicates");
        assert!(store.load().await.expect("load").is_empty());
    }
}
