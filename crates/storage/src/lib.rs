//! Durable History Store: one document mapping player identifier to that player's
//! time series, read and replaced wholesale.

use std::io;
use std::path::PathBuf;

use model::HistoryDocument;
use thiserror::Error;
use tracing::info;

mod json;
mod location;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use json::JsonFileStore;
pub use location::StoreLocation;
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteStore, INIT_SQL};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid history store location: {0}")]
    InvalidLocation(String),
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("history document {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode history document: {0}")]
    Encode(#[source] serde_json::Error),
    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),
    #[error("stored timestamp {0}ms is out of range")]
    Timestamp(i64),
    #[error("this build has no sqlite support")]
    SqliteDisabled,
    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub enum HistoryStore {
    Json(JsonFileStore),
    #[cfg(feature = "sqlite")]
    Sqlite(SqliteStore),
}

impl HistoryStore {
    pub async fn open(location: &StoreLocation) -> Result<Self, StoreError> {
        location.ensure_parent_dir()?;
        match location {
            StoreLocation::JsonFile(path) => Ok(Self::Json(JsonFileStore::new(path.clone()))),
            #[cfg(feature = "sqlite")]
            StoreLocation::Sqlite(url) => Ok(Self::Sqlite(SqliteStore::connect(url).await?)),
            #[cfg(not(feature = "sqlite"))]
            StoreLocation::Sqlite(_) => Err(StoreError::SqliteDisabled),
        }
    }

    pub fn backend(&self) -> &'static str {
        match self {
            Self::Json(_) => "json",
            #[cfg(feature = "sqlite")]
            Self::Sqlite(_) => "sqlite",
        }
    }

    /// Reads the whole document. An absent store is an empty document.
    pub async fn load(&self) -> Result<HistoryDocument, StoreError> {
        match self {
            Self::Json(store) => store.load().await,
            #[cfg(feature = "sqlite")]
            Self::Sqlite(store) => store.load().await,
        }
    }

    /// Replaces the whole document atomically.
    pub async fn save(&self, doc: &HistoryDocument) -> Result<(), StoreError> {
        match self {
            Self::Json(store) => store.save(doc).await,
            #[cfg(feature = "sqlite")]
            Self::Sqlite(store) => store.save(doc).await,
        }
    }
}

pub async fn open_store(location: &StoreLocation) -> Result<HistoryStore, StoreError> {
    let store = HistoryStore::open(location).await?;
    info!(location = %location, backend = store.backend(), "history store opened");
    Ok(store)
}
