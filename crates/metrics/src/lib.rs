use std::net::SocketAddr;

use anyhow::Result;
use hyper::{
    header::{HeaderValue, CONTENT_TYPE},
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use model::MergeReport;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::{info, warn};

#[derive(Clone)]
pub struct MetricsHandle {
    registry: Registry,
    merge_runs: IntCounter,
    merge_failures: IntCounter,
    snapshots_merged: IntCounter,
    snapshots_rejected: IntCounter,
    entries_appended: IntCounter,
    entries_evicted: IntCounter,
    queries: IntCounterVec,
}

impl MetricsHandle {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let merge_runs = counter("history_merge_runs_total", "Completed merge runs")?;
        let merge_failures = counter(
            "history_merge_failures_total",
            "Merge runs aborted by a store failure",
        )?;
        let snapshots_merged = counter(
            "history_snapshots_merged_total",
            "Snapshot files folded into history",
        )?;
        let snapshots_rejected = counter(
            "history_snapshots_rejected_total",
            "Snapshot files skipped as malformed",
        )?;
        let entries_appended =
            counter("history_entries_appended_total", "History entries appended")?;
        let entries_evicted = counter(
            "history_entries_evicted_total",
            "History entries evicted by the retention cap",
        )?;
        let queries = IntCounterVec::new(
            Opts::new("history_queries_total", "Player history queries by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(queries.clone()))?;

        Ok(Self {
            registry,
            merge_runs,
            merge_failures,
            snapshots_merged,
            snapshots_rejected,
            entries_appended,
            entries_evicted,
            queries,
        })
    }

    pub fn record_merge(&self, report: &MergeReport) {
        self.merge_runs.inc();
        self.snapshots_merged.inc_by(report.snapshots_merged as u64);
        self.snapshots_rejected
            .inc_by(report.snapshots_rejected() as u64);
        self.entries_appended.inc_by(report.entries_appended as u64);
        self.entries_evicted.inc_by(report.entries_evicted as u64);
    }

    pub fn record_merge_failure(&self) {
        self.merge_failures.inc();
    }

    pub fn record_query(&self, outcome: &str) {
        self.queries.with_label_values(&[outcome]).inc();
    }

    /// Current metrics in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let make_svc = make_service_fn(move |_| {
            let handle = self.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_req: Request<Body>| {
                    let handle = handle.clone();
                    async move { Ok::<_, hyper::Error>(handle.exposition()) }
                }))
            }
        });

        let server = Server::bind(&addr).serve(make_svc);
        info!(%addr, "metrics exporter listening");
        server.await?;
        Ok(())
    }

    fn exposition(&self) -> Response<Body> {
        match self.render() {
            Ok(text) => {
                let mut response = Response::new(Body::from(text));
                let content_type = TextEncoder::new().format_type().parse::<HeaderValue>();
                if let Ok(value) = content_type {
                    response.headers_mut().insert(CONTENT_TYPE, value);
                }
                response
            }
            Err(err) => {
                warn!(error = ?err, "failed to encode metrics");
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
    }
}
