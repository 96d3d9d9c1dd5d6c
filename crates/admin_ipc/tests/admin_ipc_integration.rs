#![cfg(unix)]

use std::sync::{Arc, Mutex};

use admin_ipc::{send_request, AdminRequest, AdminResponse, AdminStatus};
use anyhow::anyhow;
use model::MergeReport;
use tokio::time::{sleep, Duration};

fn status_of(last_merge: Option<MergeReport>) -> AdminStatus {
    AdminStatus {
        run_id: "run-123".to_string(),
        history_store: "data/player-history.json".to_string(),
        snapshot_dir: "data/snapshots".to_string(),
        merge_in_progress: false,
        last_merge,
    }
}

#[tokio::test]
async fn status_merge_status_flow() {
    let dir = tempfile::tempdir().expect("temp dir");
    let socket_path = dir.path().join("admin.sock");
    let socket_str = socket_path
        .to_str()
        .expect("socket path should be utf-8")
        .to_string();

    let last_merge: Arc<Mutex<Option<MergeReport>>> = Arc::new(Mutex::new(None));
    let handler_state = Arc::clone(&last_merge);

    let server_socket = socket_str.clone();
    let handler = move |req: AdminRequest| {
        let state = Arc::clone(&handler_state);
        async move {
            let mut last = state.lock().map_err(|_| anyhow!("state poisoned"))?;
            let resp = match req {
                AdminRequest::Status => AdminResponse::Status(status_of(last.clone())),
                AdminRequest::Merge => {
                    let report = MergeReport {
                        run_id: "merge-1".to_string(),
                        snapshots_seen: 2,
                        snapshots_merged: 2,
                        entries_appended: 10,
                        store_written: true,
                        ..MergeReport::default()
                    };
                    *last = Some(report.clone());
                    AdminResponse::Merged(report)
                }
            };
            anyhow::Ok(resp)
        }
    };
    let server_task =
        tokio::spawn(async move { admin_ipc::run_server(&server_socket, handler).await });

    // Allow the server task to start listening.
    sleep(Duration::from_millis(50)).await;

    let initial = send_request(&socket_str, &AdminRequest::Status)
        .await
        .expect("initial status");
    assert_eq!(initial, AdminResponse::Status(status_of(None)));

    let merged = send_request(&socket_str, &AdminRequest::Merge)
        .await
        .expect("merge resp");
    match merged {
        AdminResponse::Merged(report) => {
            assert_eq!(report.run_id, "merge-1");
            assert_eq!(report.entries_appended, 10);
        }
        other => panic!("expected merge report, got {other:?}"),
    }

    let after = send_request(&socket_str, &AdminRequest::Status)
        .await
        .expect("status after merge");
    match after {
        AdminResponse::Status(AdminStatus { last_merge, .. }) => {
            assert_eq!(last_merge.map(|r| r.snapshots_merged), Some(2));
        }
        other => panic!("expected status response after merge, got {other:?}"),
    }

    server_task.abort();
    let _ = std::fs::remove_file(socket_path);
}

#[tokio::test]
async fn handler_errors_are_reported_to_the_client() {
    let dir = tempfile::tempdir().expect("temp dir");
    let socket_str = dir
        .path()
        .join("admin.sock")
        .to_str()
        .expect("socket path should be utf-8")
        .to_string();

    let server_socket = socket_str.clone();
    let server_task = tokio::spawn(async move {
        admin_ipc::run_server(&server_socket, |_req| async {
            Err::<AdminResponse, _>(anyhow!("history store unavailable"))
        })
        .await
    });
    sleep(Duration::from_millis(50)).await;

    let resp = send_request(&socket_str, &AdminRequest::Merge)
        .await
        .expect("response even on failure");
    match resp {
        AdminResponse::Error(message) => assert!(message.contains("history store unavailable")),
        other => panic!("expected error response, got {other:?}"),
    }

    server_task.abort();
}
