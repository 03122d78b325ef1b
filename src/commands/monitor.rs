use anyhow::{Context, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info};

use winglet_telemetry::context::TelemetryContext;
use winglet_telemetry::settings::TelemetryConfig;

/// Run both feeds until SIGINT/SIGTERM, logging a summary every `report_every`
pub async fn handle_monitor(config: TelemetryConfig, report_every: Duration) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    if let Some(port) = config.metrics.port {
        // Recorder first, so the zeroed series land in it
        winglet_telemetry::metrics::install_recorder()?;
        winglet_telemetry::metrics::initialize_telemetry_metrics();
        let metrics_shutdown = shutdown.clone();
        tokio::spawn(
            async move {
                if let Err(e) =
                    winglet_telemetry::metrics::start_metrics_server(port, metrics_shutdown).await
                {
                    error!("Metrics server stopped: {:#}", e);
                }
            }
            .instrument(tracing::info_span!("metrics_server")),
        );
    }

    info!(
        "Monitoring ADS-B at {}:{} and GPS at {}:{}",
        config.adsb.host, config.adsb.port, config.gps.host, config.gps.port
    );

    let mut context = TelemetryContext::from_config(&config);
    let handles = context.start(shutdown.clone());

    let mut ticker = tokio::time::interval(report_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => log_summary(&context),
        }
    }

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Telemetry task failed: {}", e);
        }
    }
    info!("Telemetry stopped");
    Ok(())
}

fn log_summary(context: &TelemetryContext) {
    let airspace = context.aircraft().airspace();
    let nearest = airspace
        .values()
        .filter(|t| !t.distance_nm.is_nan())
        .min_by(|a, b| a.distance_nm.total_cmp(&b.distance_nm));

    match nearest {
        Some(track) => info!(
            "ADS-B {}: {} aircraft, nearest {} ({}) at {:.1} NM bearing {:.0}",
            context.adsb_link().state(),
            airspace.len(),
            track.icao_hex(),
            track.call_sign.as_deref().unwrap_or("-"),
            track.distance_nm,
            track.bearing_deg
        ),
        None => info!(
            "ADS-B {}: {} aircraft",
            context.adsb_link().state(),
            airspace.len()
        ),
    }

    let gps = context.gps();
    let reading = gps.last_reading();
    let constellation = gps.constellation();
    if reading.valid {
        info!(
            "GPS {:?}: {:.5},{:.5} at {:.1} kt, {} tracked, {} in view, hdop {:.1}",
            gps.gps_state(),
            reading.latitude,
            reading.longitude,
            reading.speed_knots,
            constellation.sats_tracked,
            gps.ephemeris().len(),
            constellation.hdop
        );
    } else {
        info!(
            "GPS {:?}: no fix, {} in view",
            gps.gps_state(),
            gps.ephemeris().len()
        );
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM
fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            }
            shutdown.cancel();
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received SIGINT (Ctrl+C), shutting down..."),
                Err(err) => error!("Failed to listen for SIGINT signal: {}", err),
            }
            shutdown.cancel();
        });
    }

    Ok(())
}
