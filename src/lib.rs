//! winglet-telemetry - ADS-B and GPS feed ingestion for the winglet badge
//!
//! Keeps a reconnecting connection to a BaseStation aircraft feed and an
//! NMEA GPS feed, decodes both into live tables with time-based eviction,
//! and works out each aircraft's distance and bearing from the badge.

pub mod connection;
pub mod context;
pub mod decode;
pub mod geo_math;
pub mod log_format;
pub mod metrics;
pub mod nmea;
pub mod sbs;
pub mod settings;

pub use connection::{ConnectionConfig, ConnectionLink, ConnectionState, ConnectionWorker, LineHandler};
pub use context::TelemetryContext;
pub use decode::{DecodeOutcome, SkipReason};
pub use geo_math::GeoPoint;
pub use nmea::{FixReading, GpsFixStore, GpsLockState};
pub use sbs::{AircraftTrackStore, TrackRecord};
pub use settings::{Settings, TelemetryConfig};
