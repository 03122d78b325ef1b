use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, trace};

use super::sentence::{Gga, Gsa, Gsv, NmeaSentence, PosStatus, Rmc, parse_sentence};
use crate::connection::{ConnectionLink, LineHandler};
use crate::decode::{DecodeOutcome, evict_stale};
use crate::geo_math::GeoPoint;
use crate::sbs::ReferencePosition;
use crate::settings::PositionSeed;

/// Satellites are re-reported every fix cycle, so they age out quickly
pub const SATELLITE_DECAY_SECONDS: i64 = 10;

/// Latest RMC-derived position
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FixReading {
    pub valid: bool,
    pub latitude: f32,
    pub longitude: f32,
    pub speed_knots: f32,
    pub timestamp: Option<DateTime<Utc>>,
}

impl FixReading {
    pub fn position(&self) -> Option<GeoPoint> {
        self.valid
            .then(|| GeoPoint::new(self.latitude, self.longitude))
    }

    fn from_rmc(rmc: &Rmc) -> Self {
        match rmc.fix {
            Some(fix) => FixReading {
                valid: true,
                latitude: fix.latitude,
                longitude: fix.longitude,
                speed_knots: fix.speed_knots,
                timestamp: rmc.timestamp,
            },
            None => FixReading {
                timestamp: rmc.timestamp,
                ..FixReading::default()
            },
        }
    }
}

/// All invalid readings are equal; valid ones compare by position, speed and time
impl PartialEq for FixReading {
    fn eq(&self, other: &Self) -> bool {
        match (self.valid, other.valid) {
            (false, false) => true,
            (true, true) => {
                self.latitude == other.latitude
                    && self.longitude == other.longitude
                    && self.speed_knots == other.speed_knots
                    && self.timestamp == other.timestamp
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SatelliteRecord {
    pub elevation_deg: i32,
    pub azimuth_deg: i32,
    /// 0 if visible but not used in the solution
    pub signal_cno: i32,
    pub last_seen_at: DateTime<Utc>,
}

/// Latest solution-quality values, overwritten per sentence type
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ConstellationSummary {
    pub sats_tracked: i32,
    pub msl_altitude_m: f32,
    pub pos_status: PosStatus,
    pub pdop: f32,
    pub hdop: f32,
    pub vdop: f32,
}

impl ConstellationSummary {
    fn apply_gga(&mut self, gga: &Gga) {
        if let Some(sats) = gga.sats_tracked {
            self.sats_tracked = sats;
        }
        if let Some(altitude) = gga.msl_altitude_m {
            self.msl_altitude_m = altitude;
        }
    }

    fn apply_gsa(&mut self, gsa: &Gsa) {
        if let Some(status) = gsa.pos_status {
            self.pos_status = status;
        }
        if let Some(pdop) = gsa.pdop {
            self.pdop = pdop;
        }
        if let Some(hdop) = gsa.hdop {
            self.hdop = hdop;
        }
        if let Some(vdop) = gsa.vdop {
            self.vdop = vdop;
        }
    }
}

/// Receiver status as shown on the status bar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GpsLockState {
    Disconnected,
    NoLock,
    Locked,
}

#[derive(Debug)]
struct FixState {
    reading: FixReading,
    satellites: BTreeMap<u32, SatelliteRecord>,
    constellation: ConstellationSummary,
    /// Survives disconnects; the reference point for aircraft distances
    last_known: Option<GeoPoint>,
}

/// Current GPS fix and satellite table fed by an NMEA stream
pub struct GpsFixStore {
    state: Mutex<FixState>,
    seed: Arc<dyn PositionSeed>,
    handshake: Vec<String>,
    reading_tx: watch::Sender<FixReading>,
    lock_tx: watch::Sender<GpsLockState>,
}

impl GpsFixStore {
    /// `handshake` is written, in order, every time the feed connects
    pub fn new(seed: Arc<dyn PositionSeed>, handshake: Vec<String>) -> Self {
        let last_known = seed.last_known_position();
        let (reading_tx, _) = watch::channel(FixReading::default());
        let (lock_tx, _) = watch::channel(GpsLockState::Disconnected);
        Self {
            state: Mutex::new(FixState {
                reading: FixReading::default(),
                satellites: BTreeMap::new(),
                constellation: ConstellationSummary::default(),
                last_known,
            }),
            seed,
            handshake,
            reading_tx,
            lock_tx,
        }
    }

    pub fn handle_nmea_line(&self, line: &str) -> DecodeOutcome {
        self.handle_line_at(line, Utc::now())
    }

    /// Decode one sentence, then age out satellites not seen since `now - 10s`
    pub fn handle_line_at(&self, line: &str, now: DateTime<Utc>) -> DecodeOutcome {
        let parsed = parse_sentence(line);

        let mut state = self.lock_inner();
        let mut remembered = None;
        if let Ok(sentence) = &parsed {
            match sentence {
                NmeaSentence::Rmc(rmc) => {
                    let reading = FixReading::from_rmc(rmc);
                    if let Some(position) = reading.position() {
                        state.last_known = Some(position);
                        remembered = Some(position);
                    }
                    state.reading = reading;
                }
                NmeaSentence::Gga(gga) => state.constellation.apply_gga(gga),
                NmeaSentence::Gsa(gsa) => state.constellation.apply_gsa(gsa),
                NmeaSentence::Gsv(gsv) => apply_gsv(&mut state.satellites, gsv, now),
            }
        }
        let evicted = evict_stale(
            &mut state.satellites,
            now,
            TimeDelta::seconds(SATELLITE_DECAY_SECONDS),
            |s| s.last_seen_at,
        );
        let active = state.satellites.len();
        let reading = state.reading;
        drop(state);

        if evicted > 0 {
            trace!("Evicted {} stale satellites", evicted);
        }
        metrics::gauge!("gps.satellites.active").set(active as f64);

        match parsed {
            Ok(NmeaSentence::Rmc(_)) => {
                self.publish_reading(reading);
                self.publish_lock(if reading.valid {
                    GpsLockState::Locked
                } else {
                    GpsLockState::NoLock
                });
                if let Some(position) = remembered {
                    self.seed.remember_position(position);
                }
            }
            Ok(_) => {}
            Err(reason) => {
                if reason.is_field_error() {
                    debug!("Discarding sentence: {}", reason);
                    metrics::counter!("gps.sentences.skipped_total", "reason" => "field")
                        .increment(1);
                } else {
                    trace!("Ignoring line: {}", reason);
                    metrics::counter!("gps.sentences.skipped_total", "reason" => "shape")
                        .increment(1);
                }
                return DecodeOutcome::Skipped(reason);
            }
        }

        metrics::counter!("gps.sentences.applied_total").increment(1);
        DecodeOutcome::Applied
    }

    pub fn last_reading(&self) -> FixReading {
        self.lock_inner().reading
    }

    /// Copy of the satellite table, keyed by svid (secondary constellation offset by 100)
    pub fn ephemeris(&self) -> BTreeMap<u32, SatelliteRecord> {
        self.lock_inner().satellites.clone()
    }

    pub fn constellation(&self) -> ConstellationSummary {
        self.lock_inner().constellation
    }

    /// Last valid position, or the persisted seed before the first lock
    pub fn last_known_position(&self) -> Option<GeoPoint> {
        self.lock_inner().last_known
    }

    pub fn gps_state(&self) -> GpsLockState {
        *self.lock_tx.borrow()
    }

    /// Notified only when the reading changes under [`FixReading`] equality
    pub fn subscribe_readings(&self) -> watch::Receiver<FixReading> {
        self.reading_tx.subscribe()
    }

    pub fn subscribe_lock_state(&self) -> watch::Receiver<GpsLockState> {
        self.lock_tx.subscribe()
    }

    /// Forget the current fix and every satellite; the last known position stays
    pub fn clear(&self) {
        let mut state = self.lock_inner();
        state.reading = FixReading::default();
        state.satellites.clear();
        state.constellation = ConstellationSummary::default();
        drop(state);

        metrics::gauge!("gps.satellites.active").set(0.0);
        self.publish_reading(FixReading::default());
    }

    fn publish_reading(&self, reading: FixReading) {
        self.reading_tx.send_if_modified(|current| {
            if *current == reading {
                false
            } else {
                *current = reading;
                true
            }
        });
    }

    fn publish_lock(&self, lock: GpsLockState) {
        self.lock_tx.send_if_modified(|current| {
            if *current == lock {
                false
            } else {
                debug!("GPS state {:?} -> {:?}", current, lock);
                *current = lock;
                true
            }
        });
    }

    fn lock_inner(&self) -> MutexGuard<'_, FixState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn apply_gsv(satellites: &mut BTreeMap<u32, SatelliteRecord>, gsv: &Gsv, now: DateTime<Utc>) {
    for sat in &gsv.satellites {
        satellites.insert(
            sat.svid,
            SatelliteRecord {
                elevation_deg: sat.elevation_deg,
                azimuth_deg: sat.azimuth_deg,
                signal_cno: sat.cno,
                last_seen_at: now,
            },
        );
    }
}

impl ReferencePosition for GpsFixStore {
    fn reference_position(&self) -> Option<GeoPoint> {
        self.last_known_position()
    }
}

impl LineHandler for GpsFixStore {
    fn handle_line(&self, line: &str) {
        self.handle_nmea_line(line);
    }

    fn on_connection_changed(&self, connected: bool, link: &ConnectionLink) {
        if connected {
            // Lock state waits for the first RMC
            for command in &self.handshake {
                link.write_data(command.as_bytes());
            }
            return;
        }

        self.clear();
        self.publish_lock(GpsLockState::Disconnected);
        info!("GPS feed lost, cleared fix and satellites");
    }
}
