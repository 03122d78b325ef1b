use anyhow::{Context, Result};
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder
/// Returns a handle that can be used to render metrics for scraping
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")
}

/// Background task to update process metrics
/// Updates uptime and memory usage metrics every 5 seconds until `shutdown` fires
pub async fn process_metrics_task(shutdown: CancellationToken) {
    let start_time = Instant::now();

    loop {
        metrics::gauge!("process.uptime.seconds").set(start_time.elapsed().as_secs() as f64);
        metrics::gauge!("process.is_up").set(1.0);

        // Resident set size from procfs (Linux-specific)
        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status")
                && let Some(line) = status.lines().find(|l| l.starts_with("VmRSS:"))
                && let Some(kb_str) = line.split_whitespace().nth(1)
                && let Ok(kb) = kb_str.parse::<f64>()
            {
                metrics::gauge!("process.memory.bytes").set(kb * 1024.0);
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }
    }
    metrics::gauge!("process.is_up").set(0.0);
    debug!("Process metrics task stopped");
}

/// Initialize feed and store metrics to zero/default values
/// This ensures metrics always appear in Prometheus queries even if no events have occurred
pub fn initialize_telemetry_metrics() {
    // Connection metrics, one series per feed
    for feed in ["adsb", "gps"] {
        metrics::gauge!("feed.connection.connected", "feed" => feed).set(0.0);
        metrics::counter!("feed.connection.failed_total", "feed" => feed).absolute(0);
    }

    // Aircraft track store
    metrics::counter!("adsb.lines.applied_total").absolute(0);
    metrics::counter!("adsb.lines.skipped_total", "reason" => "shape").absolute(0);
    metrics::counter!("adsb.lines.skipped_total", "reason" => "field").absolute(0);
    metrics::counter!("adsb.tracks.evicted_total").absolute(0);
    metrics::gauge!("adsb.tracks.active").set(0.0);

    // GPS fix store
    metrics::counter!("gps.sentences.applied_total").absolute(0);
    metrics::counter!("gps.sentences.skipped_total", "reason" => "shape").absolute(0);
    metrics::counter!("gps.sentences.skipped_total", "reason" => "field").absolute(0);
    metrics::gauge!("gps.satellites.active").set(0.0);
}

/// Install the global recorder once; later calls are no-ops
///
/// Must run before [`initialize_telemetry_metrics`], which writes through it.
pub fn install_recorder() -> Result<()> {
    if METRICS_HANDLE.get().is_some() {
        return Ok(());
    }
    let handle = init_metrics()?;
    // A concurrent install would already have failed in init_metrics
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

/// Serve `/metrics` on the given port until `shutdown` fires or the listener fails
pub async fn start_metrics_server(port: u16, shutdown: CancellationToken) -> Result<()> {
    install_recorder()?;

    tokio::spawn(process_metrics_task(shutdown.clone()));

    let app = Router::new().route(
        "/metrics",
        get(|| async {
            METRICS_HANDLE
                .get()
                .map(PrometheusHandle::render)
                .unwrap_or_default()
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting metrics server on http://{}/metrics", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Metrics server failed")
}
