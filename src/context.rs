use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::{ConnectionLink, ConnectionWorker};
use crate::nmea::GpsFixStore;
use crate::sbs::{AircraftTrackStore, spawn_decay_sweeper};
use crate::settings::{Settings, TelemetryConfig};

/// Owns both feeds and everything they share
///
/// Built once from config and handed to whatever displays the data. The GPS
/// store is the aircraft store's reference position, and the settings are
/// both the decay threshold source and the last-known-position seed.
pub struct TelemetryContext {
    settings: Arc<Settings>,
    aircraft: Arc<AircraftTrackStore>,
    gps: Arc<GpsFixStore>,
    adsb_link: ConnectionLink,
    gps_link: ConnectionLink,
    workers: Option<Workers>,
    sweep_interval: Duration,
}

struct Workers {
    adsb: ConnectionWorker<AircraftTrackStore>,
    gps: ConnectionWorker<GpsFixStore>,
}

impl TelemetryContext {
    pub fn from_config(config: &TelemetryConfig) -> Self {
        let settings = Arc::new(Settings::from_config(config));
        let gps = Arc::new(GpsFixStore::new(
            settings.clone(),
            config.gps.handshake.clone(),
        ));
        let aircraft = Arc::new(AircraftTrackStore::new(settings.clone(), gps.clone()));

        let adsb_worker = ConnectionWorker::new(config.adsb_connection(), aircraft.clone());
        let gps_worker = ConnectionWorker::new(config.gps_connection(), gps.clone());

        Self {
            settings,
            aircraft,
            gps,
            adsb_link: adsb_worker.link(),
            gps_link: gps_worker.link(),
            workers: Some(Workers {
                adsb: adsb_worker,
                gps: gps_worker,
            }),
            sweep_interval: config.sweep_interval(),
        }
    }

    /// Spawn both feed workers and the aircraft decay sweeper
    ///
    /// Everything stops when `shutdown` is cancelled; await the returned
    /// handles to know the stores have been cleared. Only the first call
    /// starts anything.
    pub fn start(&mut self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let Some(workers) = self.workers.take() else {
            warn!("Telemetry feeds already started");
            return Vec::new();
        };

        info!(
            "Starting telemetry feeds (aircraft sweep every {:?})",
            self.sweep_interval
        );
        vec![
            workers.adsb.spawn(shutdown.clone()),
            workers.gps.spawn(shutdown.clone()),
            spawn_decay_sweeper(self.aircraft.clone(), self.sweep_interval, shutdown),
        ]
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn aircraft(&self) -> &Arc<AircraftTrackStore> {
        &self.aircraft
    }

    pub fn gps(&self) -> &Arc<GpsFixStore> {
        &self.gps
    }

    pub fn adsb_link(&self) -> &ConnectionLink {
        &self.adsb_link
    }

    pub fn gps_link(&self) -> &ConnectionLink {
        &self.gps_link
    }
}
