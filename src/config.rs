use crate::alert::{AlertPolicy, DEFAULT_COOLDOWN, DEFAULT_THRESHOLD};
use crate::error::ConfigError;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_SENSOR_TOPIC: &str = "greendot/sensor/data";
pub const DEFAULT_ALERT_TOPIC: &str = "greendot/status";
pub const MAX_HISTORY_WINDOW_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorKind {
    Threshold,
    Weighted,
}

impl FromStr for EstimatorKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "threshold" => Ok(EstimatorKind::Threshold),
            "weighted" => Ok(EstimatorKind::Weighted),
            _ => Err(ConfigError::UnknownEstimator(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    sensor_topic: Option<String>,
    #[serde(default)]
    alert_topic: Option<String>,
    #[serde(default)]
    alert_threshold: Option<f64>,
    #[serde(default)]
    alert_cooldown_secs: Option<u64>,
    #[serde(default)]
    estimator: Option<String>,
    #[serde(default)]
    scorer_url: Option<String>,
}

fn setup_config_path() -> Option<PathBuf> {
    env::var("FIRE_SETUP_CONFIG_PATH")
        .ok()
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path()?;
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env values"
            );
            return None;
        }
    };
    match parse_setup_overrides(contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse setup config; using env values"
            );
            None
        }
    }
}

fn parse_setup_overrides(mut bytes: Vec<u8>) -> Result<SetupConfigOverrides, simd_json::Error> {
    simd_json::serde::from_slice(&mut bytes)
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: FromStr>(key: &str) -> Option<T> {
    env_value(key).and_then(|value| value.parse::<T>().ok())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Fills in settings from the setup file. `env_is_set` reports whether the
/// environment already supplied a key; environment values always win.
fn apply_setup_overrides(
    config: &mut Config,
    overrides: &SetupConfigOverrides,
    env_is_set: impl Fn(&str) -> bool,
) {
    if !env_is_set("FIRE_MQTT_PORT") {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if !env_is_set("FIRE_MQTT_USERNAME") {
        if let Some(username) = overrides.mqtt_username.as_deref() {
            config.mqtt_username = non_empty(Some(username));
        }
    }
    if !env_is_set("FIRE_MQTT_PASSWORD") {
        if let Some(password) = overrides.mqtt_password.as_deref() {
            config.mqtt_password = non_empty(Some(password));
        }
    }
    if !env_is_set("FIRE_SENSOR_TOPIC") {
        if let Some(topic) = non_empty(overrides.sensor_topic.as_deref()) {
            config.sensor_topic = topic;
        }
    }
    if !env_is_set("FIRE_ALERT_TOPIC") {
        if let Some(topic) = non_empty(overrides.alert_topic.as_deref()) {
            config.alert_topic = topic;
        }
    }
    if !env_is_set("FIRE_ALERT_THRESHOLD") {
        if let Some(threshold) = overrides.alert_threshold {
            config.alert_threshold = threshold;
        }
    }
    if !env_is_set("FIRE_ALERT_COOLDOWN_SECS") {
        if let Some(value) = overrides.alert_cooldown_secs.filter(|v| *v != 0) {
            config.alert_cooldown_secs = value;
        }
    }
    if !env_is_set("FIRE_ESTIMATOR") {
        if let Some(name) = non_empty(overrides.estimator.as_deref()) {
            config.estimator_name = name;
        }
    }
    if !env_is_set("FIRE_SCORER_URL") {
        if let Some(url) = non_empty(overrides.scorer_url.as_deref()) {
            config.scorer_url = Some(url);
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_connect_timeout_secs: u64,
    pub sensor_topic: String,
    pub alert_topic: String,
    pub alert_threshold: f64,
    pub alert_cooldown_secs: u64,
    pub estimator_name: String,
    pub history_window_secs: u64,
    pub history_max_samples: usize,
    pub scorer_url: Option<String>,
    pub scorer_token: Option<String>,
    pub scorer_timeout_ms: u64,
    pub lane_capacity: usize,
    pub stats_interval_secs: u64,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides();

        let database_url = env_value("FIRE_DATABASE_URL")
            .or_else(|| env_value("DATABASE_URL"))
            .or_else(|| {
                setup_overrides
                    .as_ref()
                    .and_then(|ov| non_empty(ov.database_url.as_deref()))
            })
            .context("FIRE_DATABASE_URL or DATABASE_URL is required (or database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);

        let mqtt_host = env_value("FIRE_MQTT_HOST")
            .or_else(|| {
                setup_overrides
                    .as_ref()
                    .and_then(|ov| non_empty(ov.mqtt_host.as_deref()))
            })
            .context("FIRE_MQTT_HOST is required (or mqtt_host in the setup config)")?;

        let mut config = Self {
            database_url,
            db_pool_size: env_parsed("FIRE_DB_POOL_SIZE").unwrap_or(10),
            mqtt_host,
            mqtt_port: env_parsed("FIRE_MQTT_PORT").unwrap_or(1883),
            mqtt_username: env_value("FIRE_MQTT_USERNAME"),
            mqtt_password: env_value("FIRE_MQTT_PASSWORD"),
            mqtt_client_id: env_value("FIRE_MQTT_CLIENT_ID")
                .unwrap_or_else(|| format!("fire-cloud-{}", std::process::id())),
            mqtt_keepalive_secs: env_parsed("FIRE_MQTT_KEEPALIVE_SECS").unwrap_or(30),
            mqtt_connect_timeout_secs: env_parsed("FIRE_MQTT_CONNECT_TIMEOUT_SECS").unwrap_or(10),
            sensor_topic: env_value("FIRE_SENSOR_TOPIC")
                .unwrap_or_else(|| DEFAULT_SENSOR_TOPIC.to_string()),
            alert_topic: env_value("FIRE_ALERT_TOPIC")
                .unwrap_or_else(|| DEFAULT_ALERT_TOPIC.to_string()),
            alert_threshold: match env_value("FIRE_ALERT_THRESHOLD") {
                Some(raw) => raw
                    .parse::<f64>()
                    .with_context(|| format!("FIRE_ALERT_THRESHOLD is not a number: {raw}"))?,
                None => DEFAULT_THRESHOLD,
            },
            alert_cooldown_secs: env_parsed("FIRE_ALERT_COOLDOWN_SECS")
                .unwrap_or(DEFAULT_COOLDOWN.as_secs()),
            estimator_name: env_value("FIRE_ESTIMATOR").unwrap_or_else(|| "threshold".to_string()),
            history_window_secs: env_parsed("FIRE_HISTORY_WINDOW_SECS").unwrap_or(1800),
            history_max_samples: env_parsed("FIRE_HISTORY_MAX_SAMPLES").unwrap_or(512),
            scorer_url: env_value("FIRE_SCORER_URL"),
            scorer_token: env_value("FIRE_SCORER_TOKEN"),
            scorer_timeout_ms: env_parsed("FIRE_SCORER_TIMEOUT_MS").unwrap_or(5000),
            lane_capacity: env_parsed("FIRE_LANE_CAPACITY").unwrap_or(64),
            stats_interval_secs: env_parsed("FIRE_STATS_INTERVAL_SECS").unwrap_or(60),
            otlp_endpoint: env_value("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides, |key| env_value(key).is_some());
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_threshold(self.alert_threshold)?;
        validate_history_window(self.history_window_secs)?;
        self.estimator()?;
        Ok(())
    }

    pub fn estimator(&self) -> Result<EstimatorKind, ConfigError> {
        self.estimator_name.parse()
    }

    pub fn alert_policy(&self) -> AlertPolicy {
        AlertPolicy {
            threshold: self.alert_threshold,
            cooldown: Duration::from_secs(self.alert_cooldown_secs),
        }
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.mqtt_connect_timeout_secs.max(1))
    }

    pub fn history_window(&self) -> Duration {
        Duration::from_secs(self.history_window_secs)
    }

    pub fn scorer_timeout(&self) -> Duration {
        Duration::from_millis(self.scorer_timeout_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }
}

fn validate_threshold(threshold: f64) -> Result<(), ConfigError> {
    if threshold.is_finite() && (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange("FIRE_ALERT_THRESHOLD", threshold))
    }
}

fn validate_history_window(secs: u64) -> Result<(), ConfigError> {
    if (1..=MAX_HISTORY_WINDOW_SECS).contains(&secs) {
        Ok(())
    } else {
        Err(ConfigError::DurationOutOfRange(
            "FIRE_HISTORY_WINDOW_SECS",
            MAX_HISTORY_WINDOW_SECS,
            secs,
        ))
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some((scheme, rest)) = url.split_once("://") {
        if let Some(base) = scheme.strip_prefix("postgresql+") {
            if !base.is_empty() {
                return format!("postgresql://{rest}");
            }
        }
    }
    url
}
