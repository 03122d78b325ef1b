pub mod monitor;
pub mod replay;

pub use monitor::handle_monitor;
pub use replay::{handle_replay_nmea, handle_replay_sbs};
