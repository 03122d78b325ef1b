//! Offline replay of captured feed files.
//!
//! Captures are old by the time they are replayed, so the store clock
//! follows the timestamps in the data instead of the wall clock. Otherwise
//! every record would be evicted by the first sweep.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use winglet_telemetry::decode::{DecodeOutcome, SkipReason};
use winglet_telemetry::geo_math::GeoPoint;
use winglet_telemetry::nmea::{
    ConstellationSummary, FixReading, GpsFixStore, NmeaSentence, SatelliteRecord, parse_sentence,
};
use winglet_telemetry::sbs::{AircraftTrackStore, TrackRecord, route_line};
use winglet_telemetry::settings::Settings;

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct ReplayStats {
    pub lines: usize,
    pub applied: usize,
    pub ignored: usize,
    pub malformed: usize,
}

impl ReplayStats {
    fn record(&mut self, outcome: &DecodeOutcome) {
        self.lines += 1;
        match outcome {
            DecodeOutcome::Applied => self.applied += 1,
            DecodeOutcome::Skipped(SkipReason::Shape(_)) => self.ignored += 1,
            DecodeOutcome::Skipped(SkipReason::Field { .. }) => self.malformed += 1,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SbsReplay {
    pub stats: ReplayStats,
    pub aircraft: BTreeMap<String, TrackRecord>,
}

#[derive(Debug, Serialize)]
pub struct NmeaReplay {
    pub stats: ReplayStats,
    pub reading: FixReading,
    pub constellation: ConstellationSummary,
    pub ephemeris: BTreeMap<u32, SatelliteRecord>,
}

/// Feed a BaseStation capture through a fresh track store
pub fn replay_sbs(
    contents: &str,
    reference: Option<GeoPoint>,
    decay_seconds: u64,
) -> SbsReplay {
    let settings = Arc::new(Settings::default());
    settings.set_adsb_decay_seconds(decay_seconds);
    let store = AircraftTrackStore::new(settings, Arc::new(reference));

    let mut stats = ReplayStats::default();
    let mut clock: Option<DateTime<Utc>> = None;

    for line in contents.lines() {
        if let Some(logged) = route_line(line)
            .and_then(|routed| routed.decode())
            .ok()
            .and_then(|update| update.timestamp)
        {
            clock = Some(clock.map_or(logged, |c| c.max(logged)));
        }
        let now = clock.unwrap_or_else(Utc::now);
        stats.record(&store.handle_line_at(line, now));
    }

    let aircraft = store
        .airspace()
        .into_values()
        .map(|track| (track.icao_hex(), track))
        .collect();
    SbsReplay { stats, aircraft }
}

/// Feed an NMEA capture through a fresh fix store
pub fn replay_nmea(contents: &str) -> NmeaReplay {
    let store = GpsFixStore::new(Arc::new(Settings::default()), Vec::new());

    let mut stats = ReplayStats::default();
    let mut clock: Option<DateTime<Utc>> = None;

    for line in contents.lines() {
        if let Ok(NmeaSentence::Rmc(rmc)) = parse_sentence(line)
            && let Some(fix_time) = rmc.timestamp
        {
            clock = Some(fix_time);
        }
        let now = clock.unwrap_or_else(Utc::now);
        stats.record(&store.handle_line_at(line, now));
    }

    NmeaReplay {
        stats,
        reading: store.last_reading(),
        constellation: store.constellation(),
        ephemeris: store.ephemeris(),
    }
}

pub fn handle_replay_sbs(
    path: &Path,
    reference: Option<GeoPoint>,
    decay_seconds: u64,
) -> Result<()> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    let replay = replay_sbs(&contents, reference, decay_seconds);
    info!(
        "Replayed {} lines from {:?}: {} applied, {} ignored, {} malformed, {} aircraft remain",
        replay.stats.lines,
        path,
        replay.stats.applied,
        replay.stats.ignored,
        replay.stats.malformed,
        replay.aircraft.len()
    );
    println!("{}", serde_json::to_string_pretty(&replay)?);
    Ok(())
}

pub fn handle_replay_nmea(path: &Path) -> Result<()> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    let replay = replay_nmea(&contents);
    info!(
        "Replayed {} lines from {:?}: {} applied, {} ignored, {} malformed",
        replay.stats.lines,
        path,
        replay.stats.applied,
        replay.stats.ignored,
        replay.stats.malformed
    );
    println!("{}", serde_json::to_string_pretty(&replay)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_sbs_follows_capture_clock() {
        let capture = "\
MSG,1,1,1,4CA2D6,1,2008/11/28,23:48:18.611,2008/11/28,23:48:18.611,RYR1427 ,,,,,,,,,,,0
STA,,5,179,400AE7,10103,2008/11/28,14:58:51.153,2008/11/28,14:58:51.153,RM
MSG,3,1,1,4CA2D6,1,2008/11/28,23:48:19.000,2008/11/28,23:48:19.000,,36000,,,51.5,-0.5,,,0,0,0,0
MSG,3,1,1,4CA2D6,1,2008/11/28,23:48:20.000,2008/11/28,23:48:20.000,,3X000,,,51.5,-0.5,,,0,0,0,0
";
        let replay = replay_sbs(capture, Some(GeoPoint::new(51.5, -0.5)), 60);

        assert_eq!(
            replay.stats,
            ReplayStats {
                lines: 4,
                applied: 2,
                ignored: 1,
                malformed: 1,
            }
        );
        let track = &replay.aircraft["4CA2D6"];
        assert_eq!(track.call_sign.as_deref(), Some("RYR1427"));
        assert_eq!(track.altitude, Some(36000));
        assert_eq!(track.distance_nm, 0.0);
    }

    #[test]
    fn test_replay_nmea_summarises_final_state() {
        let capture = [
            "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A".to_string(),
            "$GPGSV,1,1,02,03,45,123,40,07,10,300,,1*65".to_string(),
            "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47".to_string(),
            "gpsd chatter".to_string(),
        ]
        .join("\n");

        let replay = replay_nmea(&capture);
        assert_eq!(replay.stats.applied, 3);
        assert_eq!(replay.stats.ignored, 1);
        assert!(replay.reading.valid);
        assert_eq!(replay.constellation.sats_tracked, 8);
        assert_eq!(replay.ephemeris.len(), 2);

        let json = serde_json::to_value(&replay).unwrap();
        assert_eq!(json["reading"]["valid"], true);
    }
}
