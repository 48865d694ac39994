//! Configuration management.
use crate::error::{AppResult, SensorError};
use serde::Deserialize;
use std::path::PathBuf;

/// Top-level settings for a sensor deployment.
///
/// Every section has working defaults so a `Settings::default()` is directly
/// usable against a sensor on the default serial parameters and a local
/// broker. Values are overridden from a TOML file via [`Settings::from_file`].
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    /// Serial transport parameters.
    pub link: LinkSettings,
    /// Raw stream logger parameters.
    pub logging: LoggerSettings,
    /// Telemetry publisher parameters.
    pub telemetry: PublisherSettings,
}

/// Serial transport parameters.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LinkSettings {
    /// Port path, e.g. `/dev/ttyUSB0` or `COM5`. `None` leaves the choice to
    /// the caller (port selection UIs live outside this crate).
    pub port: Option<String>,
    /// Baud rate. The sensor streams at 921600.
    pub baud_rate: u32,
    /// Port read timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 921_600,
            timeout_ms: 500,
        }
    }
}

/// Raw stream logger parameters.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggerSettings {
    /// Directory log files are created in, relative to the working directory.
    pub directory: PathBuf,
    /// Rotation threshold in bytes. A file is closed and a new one opened
    /// once a size check sees it at or above this size.
    pub max_file_size: u64,
    /// Appended-byte interval between file size checks.
    pub size_check_interval: u64,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("Logging_data"),
            // 150 MB, roughly 2.5 h of stream at the sensor's data rate
            max_file_size: 150_000_000,
            size_check_interval: 100_000,
        }
    }
}

/// Telemetry publisher parameters.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PublisherSettings {
    /// Broker host name or address.
    pub broker: String,
    /// Broker port.
    pub port: u16,
    /// Optional broker credentials.
    pub username: Option<String>,
    /// Optional broker credentials.
    pub password: Option<String>,
    /// Sensor id; one publisher instance per id. Appears in topic names and
    /// in every environment record.
    pub sensor_id: u8,
    /// High-frequency sample rate in Hz. Also the batch length: one batch
    /// holds one second of samples.
    pub sample_rate: usize,
    /// Environment publish rate in Hz.
    pub env_sample_rate: f64,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            sensor_id: 1,
            sample_rate: 1000,
            env_sample_rate: 1.0,
        }
    }
}

impl Settings {
    /// Loads settings from a TOML file, falling back to defaults for any
    /// missing section or key.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let s = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .map_err(SensorError::Config)?;

        s.try_deserialize().map_err(SensorError::Config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_sensor_parameters() {
        let settings = Settings::default();
        assert_eq!(settings.link.baud_rate, 921_600);
        assert_eq!(settings.link.timeout_ms, 500);
        assert_eq!(settings.logging.max_file_size, 150_000_000);
        assert_eq!(settings.logging.size_check_interval, 100_000);
        assert_eq!(settings.logging.directory, PathBuf::from("Logging_data"));
        assert_eq!(settings.telemetry.sample_rate, 1000);
        assert_eq!(settings.telemetry.sensor_id, 1);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sensor.toml");
        let mut file = std::fs::File::create(&path).expect("create config");
        write!(
            file,
            r#"
            [link]
            port = "/dev/ttyUSB1"
            baud_rate = 115200

            [telemetry]
            broker = "broker.example"
            sensor_id = 7
            sample_rate = 500
            "#
        )
        .expect("write config");

        let settings =
            Settings::from_file(path.to_str().expect("utf-8 path")).expect("load settings");
        assert_eq!(settings.link.port.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(settings.link.baud_rate, 115_200);
        // untouched sections keep their defaults
        assert_eq!(settings.link.timeout_ms, 500);
        assert_eq!(settings.logging.max_file_size, 150_000_000);
        assert_eq!(settings.telemetry.broker, "broker.example");
        assert_eq!(settings.telemetry.sensor_id, 7);
        assert_eq!(settings.telemetry.sample_rate, 500);
    }
}
