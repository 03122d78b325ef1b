//! BaseStation (SBS-1, port 30003) aircraft feed.

pub mod parser;
pub mod track_store;

pub use parser::{SbsMessageType, SbsUpdate, route_line};
pub use track_store::{AircraftTrackStore, ReferencePosition, TrackRecord, spawn_decay_sweeper};
