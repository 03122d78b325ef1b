//! NMEA-0183 GPS feed, as relayed by gpsd's watcher mode.

pub mod fix_store;
pub mod sentence;

pub use fix_store::{
    ConstellationSummary, FixReading, GpsFixStore, GpsLockState, SatelliteRecord,
};
pub use sentence::{NmeaSentence, PosStatus, Talker, parse_sentence};
