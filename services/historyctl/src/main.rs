use std::path::PathBuf;

use admin_ipc::{send_request, AdminRequest, AdminResponse, DEFAULT_SOCKET_PATH};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use merger::Merger;
use model::MAX_HISTORY_ENTRIES;
use query::{QueryService, TimeRange, DEFAULT_SEASON_START};
use snapshots::SnapshotDir;
use storage::{open_store, StoreLocation};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "ADMIN_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask the running daemon for its status.
    Status,
    /// Ask the running daemon to merge pending snapshots now.
    Merge,
    /// Merge pending snapshots in this process, without a daemon.
    Process(LocalStore),
    /// Print one player's history as the dashboard would see it.
    Show {
        name: String,
        #[arg(long, default_value = "7d")]
        range: TimeRange,
        #[command(flatten)]
        local: LocalStore,
    },
}

#[derive(Args, Debug)]
struct LocalStore {
    #[arg(long, env = "HISTORY_STORE", default_value = "data/player-history.json")]
    history_store: StoreLocation,

    #[arg(long, env = "SNAPSHOT_DIR", default_value = "data/snapshots")]
    snapshot_dir: PathBuf,

    #[arg(
        long,
        env = "HISTORY_RETENTION",
        default_value_t = MAX_HISTORY_ENTRIES as u64,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    retention: u64,

    #[arg(long, env = "SEASON_START", default_value = DEFAULT_SEASON_START)]
    season_start: DateTime<Utc>,
}

async fn process_locally(local: &LocalStore) -> Result<String> {
    let store = open_store(&local.history_store).await?;
    let report = Merger::new(store, SnapshotDir::new(&local.snapshot_dir))
        .with_retention(local.retention as usize)
        .run()
        .await?;
    Ok(serde_json::to_string_pretty(&report)?)
}

async fn show(local: &LocalStore, name: &str, range: TimeRange) -> Result<String> {
    let store = open_store(&local.history_store).await?;
    let view = QueryService::new(store, local.season_start)
        .query(Some(name), Some(range.as_str()))
        .await?;
    Ok(serde_json::to_string_pretty(&view)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let output = match &cli.command {
        Command::Status => remote(&cli.socket, AdminRequest::Status).await?,
        Command::Merge => remote(&cli.socket, AdminRequest::Merge).await?,
        Command::Process(local) => process_locally(local).await?,
        Command::Show { name, range, local } => show(local, name, *range).await?,
    };
    println!("{output}");
    Ok(())
}

async fn remote(socket: &str, req: AdminRequest) -> Result<String> {
    let resp = send_request(socket, &req).await?;
    if let AdminResponse::Error(message) = &resp {
        bail!("daemon reported an error: {message}");
    }
    Ok(serde_json::to_string(&resp)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::HistoryDocument;

    fn local(dir: &std::path::Path) -> LocalStore {
        LocalStore {
            history_store: StoreLocation::JsonFile(dir.join("player-history.json")),
            snapshot_dir: dir.join("snapshots"),
            retention: 500,
            season_start: DEFAULT_SEASON_START.parse().unwrap(),
        }
    }

    #[test]
    fn show_parses_range_and_store_flags() {
        let cli = Cli::try_parse_from([
            "historyctl",
            "show",
            "Alpha#0001",
            "--range",
            "season",
            "--history-store",
            "sqlite://data/history.db",
        ])
        .expect("parses");
        match cli.command {
            Command::Show { name, range, local } => {
                assert_eq!(name, "Alpha#0001");
                assert_eq!(range, TimeRange::Season);
                assert!(local.history_store.is_sqlite());
            }
            other => panic!("unexpected command {other:?}"),
        }

        assert!(Cli::try_parse_from(["historyctl", "show", "A", "--range", "1y"]).is_err());
        assert!(Cli::try_parse_from(["historyctl", "process", "--retention", "0"]).is_err());
    }

    #[tokio::test]
    async fn process_then_show_reads_merged_history() {
        let dir = tempfile::tempdir().unwrap();
        let local = local(dir.path());
        std::fs::create_dir_all(&local.snapshot_dir).unwrap();
        let now = Utc::now();
        let file_name = snapshots::snapshot_file_name("s9", now);
        std::fs::write(
            local.snapshot_dir.join(&file_name),
            r#"{"data":[{"name":"Alpha#0001","steamName":"alpha","rank":3,"rankScore":41000,"league":"Diamond 1","leagueNumber":20,"change":1}]}"#,
        )
        .unwrap();

        let report: serde_json::Value =
            serde_json::from_str(&process_locally(&local).await.unwrap()).unwrap();
        assert_eq!(report["entries_appended"], 1);
        assert!(!local.snapshot_dir.join(&file_name).exists());

        let view: serde_json::Value =
            serde_json::from_str(&show(&local, "Alpha#0001", TimeRange::Season).await.unwrap())
                .unwrap();
        assert_eq!(view["displayName"], "alpha");
        assert_eq!(view["totalSnapshots"], 1);

        let doc: HistoryDocument =
            serde_json::from_slice(&std::fs::read(dir.path().join("player-history.json")).unwrap())
                .unwrap();
        assert_eq!(doc.entry_count(), 1);
    }
}
