use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::connection::ConnectionConfig;
use crate::geo_math::GeoPoint;

/// Environment variable that overrides the config file location
pub const CONFIG_ENV_VAR: &str = "WINGLET_TELEMETRY_CONFIG";

/// Config file used when nothing else is specified
pub const DEFAULT_CONFIG_FILE: &str = "./winglet-telemetry.toml";

/// gpsd command that attaches the receiver to the daemon
pub const GPSD_DEVICE_COMMAND: &str = "?DEVICE={\"path\":\"/dev/gps0\",\"native\":0}\n";

/// gpsd command that turns on the NMEA watcher stream
pub const GPSD_WATCH_COMMAND: &str = "?WATCH={\"enable\":true,\"nmea\":true}\n";

/// Aircraft decay threshold choices offered on the badge's settings menu
pub const ADSB_DECAY_CHOICES_SECONDS: [u64; 6] = [15, 30, 60, 120, 180, 300];

/// Read access to the user-adjustable aircraft decay threshold
pub trait SettingsProvider: Send + Sync {
    fn adsb_decay_seconds(&self) -> u64;
}

/// Persistence for the last position the badge knew about
///
/// Seeds the reference point used for aircraft distance/bearing before the
/// first GPS lock.
pub trait PositionSeed: Send + Sync {
    fn last_known_position(&self) -> Option<GeoPoint>;

    /// Called on every valid fix
    fn remember_position(&self, position: GeoPoint) {
        let _ = position;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdsbSection {
    pub host: String,
    pub port: u16,
    pub decay_seconds: u64,
    pub sweep_interval_ms: u64,
}

impl Default for AdsbSection {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 30003,
            decay_seconds: 60,
            sweep_interval_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsSection {
    pub host: String,
    pub port: u16,
    /// Written once, in order, every time the connection comes up
    pub handshake: Vec<String>,
}

impl Default for GpsSection {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 2947,
            handshake: vec![
                GPSD_DEVICE_COMMAND.to_string(),
                GPSD_WATCH_COMMAND.to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    pub connect_timeout_ms: u64,
    pub retry_delay_ms: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            retry_delay_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionSection {
    pub last_latitude: Option<f32>,
    pub last_longitude: Option<f32>,
}

impl PositionSection {
    /// Both coordinates, or nothing
    pub fn seed(&self) -> Option<GeoPoint> {
        match (self.last_latitude, self.last_longitude) {
            (Some(lat), Some(lon)) => Some(GeoPoint::new(lat, lon)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub port: Option<u16>,
}

/// Top-level configuration file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub adsb: AdsbSection,
    pub gps: GpsSection,
    pub connection: ConnectionSection,
    pub position: PositionSection,
    pub metrics: MetricsSection,
}

impl TelemetryConfig {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let config: TelemetryConfig =
            toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))?;
        config
            .validate()
            .with_context(|| format!("Invalid config in {:?}", path))?;
        Ok(config)
    }

    /// Reject values the feeds cannot run with
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.adsb.sweep_interval_ms > 0,
            "[adsb] sweep_interval_ms must be greater than zero"
        );
        ensure!(
            self.connection.connect_timeout_ms > 0,
            "[connection] connect_timeout_ms must be greater than zero"
        );
        Ok(())
    }

    /// Load config from a TOML file, falling back to defaults if it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("No config file at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    pub fn adsb_connection(&self) -> ConnectionConfig {
        self.connection_for("adsb", &self.adsb.host, self.adsb.port)
    }

    pub fn gps_connection(&self) -> ConnectionConfig {
        self.connection_for("gps", &self.gps.host, self.gps.port)
    }

    /// Never zero, even for a config that skipped [`TelemetryConfig::validate`]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.adsb.sweep_interval_ms.max(1))
    }

    fn connection_for(&self, feed: &str, host: &str, port: u16) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_millis(self.connection.connect_timeout_ms),
            retry_delay: Duration::from_millis(self.connection.retry_delay_ms),
            ..ConnectionConfig::new(feed, host, port)
        }
    }
}

/// Resolve the config file path.
///
/// Priority:
/// 1. explicit path (the `--config` flag)
/// 2. `WINGLET_TELEMETRY_CONFIG` env var
/// 3. `./winglet-telemetry.toml`
pub fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        return PathBuf::from(path);
    }
    PathBuf::from(DEFAULT_CONFIG_FILE)
}

/// Runtime settings shared by the stores
///
/// Values can be changed while the feeds are running; readers pick up the
/// new value on their next sweep.
#[derive(Debug)]
pub struct Settings {
    adsb_decay_seconds: AtomicU64,
    last_position: Mutex<Option<GeoPoint>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            adsb_decay_seconds: AtomicU64::new(AdsbSection::default().decay_seconds),
            last_position: Mutex::new(None),
        }
    }
}

impl Settings {
    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self {
            adsb_decay_seconds: AtomicU64::new(config.adsb.decay_seconds),
            last_position: Mutex::new(config.position.seed()),
        }
    }

    pub fn set_adsb_decay_seconds(&self, seconds: u64) {
        if !ADSB_DECAY_CHOICES_SECONDS.contains(&seconds) {
            tracing::debug!("Aircraft decay threshold {}s is not a menu choice", seconds);
        }
        self.adsb_decay_seconds.store(seconds, Ordering::Relaxed);
    }
}

impl SettingsProvider for Settings {
    fn adsb_decay_seconds(&self) -> u64 {
        self.adsb_decay_seconds.load(Ordering::Relaxed)
    }
}

impl PositionSeed for Settings {
    fn last_known_position(&self) -> Option<GeoPoint> {
        *self
            .last_position
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn remember_position(&self, position: GeoPoint) {
        *self
            .last_position
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(position);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_badge_services() {
        let config = TelemetryConfig::default();
        assert_eq!(config.adsb.port, 30003);
        assert_eq!(config.gps.port, 2947);
        assert_eq!(config.adsb.decay_seconds, 60);
        assert_eq!(config.gps.handshake.len(), 2);
        assert!(config.gps.handshake[1].starts_with("?WATCH="));

        let adsb = config.adsb_connection();
        assert_eq!(adsb.feed, "adsb");
        assert_eq!(adsb.address(), "localhost:30003");
        assert_eq!(adsb.connect_timeout, Duration::from_secs(5));
        assert_eq!(adsb.retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_sweep_interval_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("telemetry.toml");
        std::fs::write(&path, "[adsb]\nsweep_interval_ms = 0\n").unwrap();

        let err = TelemetryConfig::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("sweep_interval_ms"), "{err:#}");

        let mut config = TelemetryConfig::default();
        config.adsb.sweep_interval_ms = 0;
        assert!(config.validate().is_err());
        assert_eq!(config.sweep_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("telemetry.toml");
        std::fs::write(
            &path,
            r#"
[adsb]
host = "192.168.1.233"
decay_seconds = 120

[position]
last_latitude = 32.845469
last_longitude = -97.258741
"#,
        )
        .unwrap();

        let config = TelemetryConfig::load(&path).unwrap();
        assert_eq!(config.adsb.host, "192.168.1.233");
        assert_eq!(config.adsb.port, 30003);
        assert_eq!(config.adsb.decay_seconds, 120);
        assert_eq!(config.gps.host, "localhost");

        let settings = Settings::from_config(&config);
        assert_eq!(settings.adsb_decay_seconds(), 120);
        let seed = settings.last_known_position().unwrap();
        assert!((seed.latitude - 32.845469).abs() < 1e-5);
        assert!((seed.longitude + 97.258741).abs() < 1e-5);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("telemetry.toml");
        std::fs::write(&path, "[adsb]\nport = \"not a port\"\n").unwrap();
        assert!(TelemetryConfig::load(&path).is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = TelemetryConfig::load_or_default(&temp_dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.adsb.port, 30003);
    }

    #[test]
    fn test_half_a_seed_is_no_seed() {
        let mut config = TelemetryConfig::default();
        config.position.last_latitude = Some(10.0);
        assert!(Settings::from_config(&config).last_known_position().is_none());
    }

    #[test]
    fn test_decay_threshold_is_mutable_at_runtime() {
        let settings = Settings::default();
        assert_eq!(settings.adsb_decay_seconds(), 60);
        settings.set_adsb_decay_seconds(15);
        assert_eq!(settings.adsb_decay_seconds(), 15);
    }

    #[test]
    #[serial]
    fn test_config_path_priority() {
        // SAFETY: serialized with every other test that touches this variable
        unsafe { std::env::remove_var(CONFIG_ENV_VAR) };
        assert_eq!(config_path(None), PathBuf::from(DEFAULT_CONFIG_FILE));

        unsafe { std::env::set_var(CONFIG_ENV_VAR, "/etc/winglet/telemetry.toml") };
        assert_eq!(
            config_path(None),
            PathBuf::from("/etc/winglet/telemetry.toml")
        );
        assert_eq!(
            config_path(Some(PathBuf::from("/tmp/x.toml"))),
            PathBuf::from("/tmp/x.toml")
        );
        unsafe { std::env::remove_var(CONFIG_ENV_VAR) };
    }
}
