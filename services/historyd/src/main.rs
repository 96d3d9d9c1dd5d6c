use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, RwLock},
    time::Duration,
};

use admin_ipc::{run_server, AdminRequest, AdminResponse, AdminStatus, DEFAULT_SOCKET_PATH};
use chrono::{DateTime, Utc};
use clap::Parser;
use http_api::ApiState;
use merger::{MergeError, Merger};
use metrics::MetricsHandle;
use model::{MergeReport, MAX_HISTORY_ENTRIES};
use query::{QueryService, DEFAULT_SEASON_START};
use snapshots::SnapshotDir;
use storage::{open_store, StoreLocation};
use tokio::{net::TcpListener, sync::Mutex, task, time};
use tracing::{error, info, Level};
use uuid::Uuid;

#[derive(Parser, Debug)]
struct Args {
    /// JSON document path, or a `sqlite://` URL.
    #[arg(long, env = "HISTORY_STORE", default_value = "data/player-history.json")]
    history_store: StoreLocation,

    #[arg(long, env = "SNAPSHOT_DIR", default_value = "data/snapshots")]
    snapshot_dir: PathBuf,

    #[arg(long, env = "LISTEN_ADDR", default_value = "127.0.0.1:3000")]
    listen_addr: SocketAddr,

    #[arg(long, env = "ADMIN_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    admin_socket: String,

    #[arg(long, env = "METRICS_ADDR", default_value = "127.0.0.1:9109")]
    metrics_addr: SocketAddr,

    /// Seconds between scheduled merges; 0 leaves merging to `historyctl merge`.
    #[arg(long, env = "MERGE_INTERVAL_SECS", default_value_t = 3600)]
    merge_interval_secs: u64,

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

fn log_startup(args: &Args, run_id: &str) {
    info!(store = %args.history_store, "history store configured");
    info!(dir = %args.snapshot_dir.display(), "snapshot directory configured");
    info!(addr = %args.listen_addr, "history api bind planned");
    info!(socket = %args.admin_socket, "admin socket bind planned");
    info!(addr = %args.metrics_addr, "metrics bind planned");
    info!(
        interval_secs = args.merge_interval_secs,
        retention = args.retention,
        season_start = %args.season_start,
        "merge policy configured"
    );
    info!(%run_id, "run initialized");
}

/// Serializes merge runs inside this process and remembers the latest outcome.
#[derive(Clone)]
struct MergeCoordinator {
    merger: Arc<Merger>,
    gate: Arc<Mutex<()>>,
    last: Arc<RwLock<Option<MergeReport>>>,
    metrics: MetricsHandle,
}

impl MergeCoordinator {
    fn new(merger: Merger, metrics: MetricsHandle) -> Self {
        Self {
            merger: Arc::new(merger),
            gate: Arc::new(Mutex::new(())),
            last: Arc::new(RwLock::new(None)),
            metrics,
        }
    }

    async fn run_once(&self, trigger: &'static str) -> Result<MergeReport, MergeError> {
        let _running = self.gate.lock().await;
        match self.merger.run().await {
            Ok(report) => {
                self.metrics.record_merge(&report);
                if let Ok(mut guard) = self.last.write() {
                    *guard = Some(report.clone());
                }
                info!(trigger, run_id = %report.run_id, "merge finished");
                Ok(report)
            }
            Err(err) => {
                self.metrics.record_merge_failure();
                error!(trigger, error = %err, "merge run failed");
                Err(err)
            }
        }
    }

    fn in_progress(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    fn last_report(&self) -> Option<MergeReport> {
        self.last.read().ok().and_then(|guard| guard.clone())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    info!(
        store = %args.history_store,
        socket = %args.admin_socket,
        "booting historyd"
    );

    let run_id = Uuid::new_v4().to_string();
    let store = open_store(&args.history_store).await?;
    log_startup(&args, &run_id);

    let metrics = MetricsHandle::new()?;
    let merger = Merger::new(store.clone(), SnapshotDir::new(&args.snapshot_dir))
        .with_retention(args.retention as usize);
    let coordinator = MergeCoordinator::new(merger, metrics.clone());

    let admin_coordinator = coordinator.clone();
    let socket_path = args.admin_socket.clone();
    let status_template = AdminStatus {
        run_id: run_id.clone(),
        history_store: args.history_store.to_string(),
        snapshot_dir: args.snapshot_dir.display().to_string(),
        merge_in_progress: false,
        last_merge: None,
    };
    task::spawn(async move {
        let handler = move |req: AdminRequest| {
            let coordinator = admin_coordinator.clone();
            let status = status_template.clone();
            async move {
                let resp = match req {
                    AdminRequest::Status => AdminResponse::Status(AdminStatus {
                        merge_in_progress: coordinator.in_progress(),
                        last_merge: coordinator.last_report(),
                        ..status
                    }),
                    AdminRequest::Merge => AdminResponse::Merged(coordinator.run_once("admin").await?),
                };
                anyhow::Ok(resp)
            }
        };
        if let Err(err) = run_server(&socket_path, handler).await {
            error!(error = ?err, "admin ipc server failed");
        }
    });

    let metrics_addr = args.metrics_addr;
    let metrics_task = metrics.clone();
    task::spawn(async move {
        if let Err(err) = metrics_task.serve(metrics_addr).await {
            error!(error = ?err, "metrics server error");
        }
    });

    let listener = TcpListener::bind(args.listen_addr).await?;
    let api_state = ApiState {
        query: QueryService::new(store, args.season_start),
        metrics,
    };
    task::spawn(async move {
        if let Err(err) = http_api::serve(listener, api_state).await {
            error!(error = ?err, "history api server failed");
        }
    });

    if args.merge_interval_secs > 0 {
        let scheduled = coordinator.clone();
        let interval = Duration::from_secs(args.merge_interval_secs);
        task::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                ticker.tick().await;
                // failures are logged and counted by the coordinator
                let _ = scheduled.run_once("schedule").await;
            }
        });
    } else {
        info!("scheduled merging disabled");
    }

    info!(
        run_id = %run_id,
        listen_addr = %args.listen_addr,
        admin_socket = %args.admin_socket,
        metrics_addr = %args.metrics_addr,
        "ready"
    );

    tokio::signal::ctrl_c().await?;
    info!(run_id = %run_id, "shutting down");
    Ok(())
}
