use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, trace, warn};

use super::parser::{SbsUpdate, route_line};
use crate::connection::{ConnectionLink, LineHandler};
use crate::decode::{DecodeOutcome, SkipReason, evict_stale};
use crate::geo_math::{GeoPoint, great_circle_bearing_deg, haversine_distance_nm};
use crate::settings::SettingsProvider;

/// Source of the point aircraft distance and bearing are measured from
pub trait ReferencePosition: Send + Sync {
    fn reference_position(&self) -> Option<GeoPoint>;
}

impl ReferencePosition for GeoPoint {
    fn reference_position(&self) -> Option<GeoPoint> {
        Some(*self)
    }
}

impl ReferencePosition for Option<GeoPoint> {
    fn reference_position(&self) -> Option<GeoPoint> {
        *self
    }
}

/// Everything known about one aircraft
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackRecord {
    pub icao24: u32,
    /// Type of the last message applied (1-8)
    pub message_type: u8,
    pub call_sign: Option<String>,
    pub altitude: Option<i32>,
    pub ground_speed: Option<i32>,
    pub track_angle_deg: Option<f32>,
    pub latitude: Option<f32>,
    pub longitude: Option<f32>,
    pub squawk: Option<i32>,
    pub on_ground: Option<bool>,
    /// NaN until a position arrives while a reference position is known
    pub distance_nm: f32,
    /// NaN until a position arrives while a reference position is known
    pub bearing_deg: f32,
    pub last_message_at: DateTime<Utc>,
}

impl TrackRecord {
    fn new(icao24: u32, now: DateTime<Utc>) -> Self {
        Self {
            icao24,
            message_type: 0,
            call_sign: None,
            altitude: None,
            ground_speed: None,
            track_angle_deg: None,
            latitude: None,
            longitude: None,
            squawk: None,
            on_ground: None,
            distance_nm: f32::NAN,
            bearing_deg: f32::NAN,
            last_message_at: now,
        }
    }

    /// ICAO address formatted the way feeds print it
    pub fn icao_hex(&self) -> String {
        format!("{:06X}", self.icao24)
    }

    fn apply(&mut self, update: SbsUpdate, reference: Option<GeoPoint>, now: DateTime<Utc>) {
        self.message_type = update.message_type.as_u8();

        if let Some(call_sign) = update.callsign {
            self.call_sign = Some(call_sign);
        }
        if let Some(altitude) = update.altitude {
            self.altitude = Some(altitude);
        }
        if let Some(speed) = update.ground_speed {
            self.ground_speed = Some(speed);
        }
        if let Some(track) = update.track_deg {
            self.track_angle_deg = Some(track);
        }
        if let Some((lat, lon)) = update.position {
            self.latitude = Some(lat);
            self.longitude = Some(lon);
            if let Some(from) = reference {
                self.distance_nm = haversine_distance_nm(
                    from.latitude as f64,
                    from.longitude as f64,
                    lat as f64,
                    lon as f64,
                ) as f32;
                self.bearing_deg = great_circle_bearing_deg(
                    from.latitude as f64,
                    from.longitude as f64,
                    lat as f64,
                    lon as f64,
                );
            }
        }
        if let Some(squawk) = update.squawk {
            self.squawk = Some(squawk);
        }
        if let Some(on_ground) = update.on_ground {
            self.on_ground = Some(on_ground);
        }

        self.last_message_at = update.timestamp.unwrap_or(now);
    }
}

/// Live aircraft table fed by a BaseStation feed
///
/// All mutation happens on the feed worker; readers only ever get copies.
pub struct AircraftTrackStore {
    tracks: Mutex<BTreeMap<u32, TrackRecord>>,
    settings: Arc<dyn SettingsProvider>,
    reference: Arc<dyn ReferencePosition>,
    connected_tx: watch::Sender<bool>,
}

impl AircraftTrackStore {
    pub fn new(settings: Arc<dyn SettingsProvider>, reference: Arc<dyn ReferencePosition>) -> Self {
        let (connected_tx, _) = watch::channel(false);
        Self {
            tracks: Mutex::new(BTreeMap::new()),
            settings,
            reference,
            connected_tx,
        }
    }

    /// Decode one BaseStation line, stamping undated messages with the current time
    pub fn handle_sbs_line(&self, line: &str) -> DecodeOutcome {
        self.handle_line_at(line, Utc::now())
    }

    /// Decode one BaseStation line against an explicit clock
    ///
    /// `now` stamps messages without a logged date and is the reference for
    /// the eviction sweep that follows every routed message.
    pub fn handle_line_at(&self, line: &str, now: DateTime<Utc>) -> DecodeOutcome {
        let routed = match route_line(line) {
            Ok(routed) => routed,
            Err(reason) => {
                trace!("Ignoring line: {}", reason);
                metrics::counter!("adsb.lines.skipped_total", "reason" => "shape").increment(1);
                return DecodeOutcome::Skipped(reason);
            }
        };

        // Read before taking our own lock
        let reference = self.reference.reference_position();
        let threshold = self.decay_threshold();

        let mut tracks = self.lock_tracks();
        let result: Result<(), SkipReason> = routed.decode().map(|update| {
            tracks
                .entry(update.icao24)
                .or_insert_with(|| TrackRecord::new(update.icao24, now))
                .apply(update, reference, now);
        });
        let evicted = evict_stale(&mut tracks, now, threshold, |t| t.last_message_at);
        let active = tracks.len();
        drop(tracks);

        record_sweep(evicted, active);
        match &result {
            Ok(()) => metrics::counter!("adsb.lines.applied_total").increment(1),
            Err(reason) => {
                debug!("Discarding message for {:06X}: {}", routed.icao24, reason);
                metrics::counter!("adsb.lines.skipped_total", "reason" => "field").increment(1);
            }
        }
        result.into()
    }

    /// Remove every track not heard from within the decay threshold
    pub fn sweep_stale(&self, now: DateTime<Utc>) -> usize {
        let threshold = self.decay_threshold();
        let mut tracks = self.lock_tracks();
        let evicted = evict_stale(&mut tracks, now, threshold, |t| t.last_message_at);
        let active = tracks.len();
        drop(tracks);
        record_sweep(evicted, active);
        evicted
    }

    /// Consistent copy of the whole table
    pub fn airspace(&self) -> BTreeMap<u32, TrackRecord> {
        self.lock_tracks().clone()
    }

    pub fn track(&self, icao24: u32) -> Option<TrackRecord> {
        self.lock_tracks().get(&icao24).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_tracks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock_tracks().clear();
        metrics::gauge!("adsb.tracks.active").set(0.0);
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    /// Feed connection status as seen by this store
    pub fn subscribe_connection(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    fn decay_threshold(&self) -> TimeDelta {
        let seconds = i64::try_from(self.settings.adsb_decay_seconds()).unwrap_or(i64::MAX);
        TimeDelta::try_seconds(seconds).unwrap_or(TimeDelta::MAX)
    }

    fn lock_tracks(&self) -> MutexGuard<'_, BTreeMap<u32, TrackRecord>> {
        self.tracks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn record_sweep(evicted: usize, active: usize) {
    if evicted > 0 {
        trace!("Evicted {} stale tracks", evicted);
        metrics::counter!("adsb.tracks.evicted_total").increment(evicted as u64);
    }
    metrics::gauge!("adsb.tracks.active").set(active as f64);
}

impl LineHandler for AircraftTrackStore {
    fn handle_line(&self, line: &str) {
        self.handle_sbs_line(line);
    }

    fn on_connection_changed(&self, connected: bool, _link: &ConnectionLink) {
        if !connected {
            let dropped = self.len();
            self.clear();
            if dropped > 0 {
                info!("ADS-B feed lost, cleared {} tracks", dropped);
            }
        }
        self.connected_tx.send_replace(connected);
    }
}

/// Sweep the table on a fixed interval so tracks decay while the feed is quiet
pub fn spawn_decay_sweeper(
    store: Arc<AircraftTrackStore>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    if every.is_zero() {
        warn!("Zero decay sweep interval, sweeping every millisecond instead");
    }
    let every = every.max(Duration::from_millis(1));
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Skip the first tick (immediate execution)
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        store.sweep_stale(Utc::now());
                    }
                }
            }
            debug!("Decay sweeper stopped");
        }
        .instrument(tracing::info_span!("adsb_decay_sweeper")),
    )
}
