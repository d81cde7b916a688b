//! Pipeline configuration: YAML file + `.env` + environment overrides.
//!
//! A missing file means defaults. A file that exists but cannot be read or
//! parsed, or a value that fails validation, is fatal at startup.

use crate::error::ConfigError;
use crate::rules::{AlertRule, RuleProfile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

pub const CONFIG_ENV: &str = "SKYWATCH_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "skywatch.yaml";

/// Backoff floor; reconnect attempts never come closer together than this.
pub const MIN_BACKOFF_MS: u64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkywatchConfig {
    pub broker: BrokerConf,
    pub backoff: BackoffConf,
    /// Topic shared by the producer and every consumer.
    pub topic: String,
    pub watch: WatchConf,
    pub rules: RulesConf,
    pub alerts: AlertsConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConf {
    pub host: String,
    pub port: u16,
    pub keepalive_secs: u64,
    /// Prefix for the MQTT client id; role and a random suffix are appended.
    pub client_id: String,
    pub publish_timeout_ms: u64,
    /// Request queue size between the client handle and the network loop.
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConf {
    pub base_ms: u64,
    pub cap_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConf {
    pub path: PathBuf,
    pub poll_interval_ms: u64,
    pub delimiter: char,
    /// Treat a last line with no trailing newline as a write still in progress.
    pub require_trailing_newline: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConf {
    pub profile: RuleProfile,
    /// rule id -> replacement threshold
    pub overrides: BTreeMap<String, f64>,
    pub extra: Vec<AlertRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConf {
    pub console: bool,
    pub file: Option<PathBuf>,
    /// Republish alert events as JSON here for the dashboard / mailer.
    pub forward_topic: Option<String>,
}

impl Default for SkywatchConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConf::default(),
            backoff: BackoffConf::default(),
            topic: "weather/readings".into(),
            watch: WatchConf::default(),
            rules: RulesConf::default(),
            alerts: AlertsConf::default(),
        }
    }
}

impl Default for BrokerConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            keepalive_secs: 60,
            client_id: "skywatch".into(),
            publish_timeout_ms: 2_000,
            channel_capacity: 10,
        }
    }
}

impl Default for BackoffConf {
    fn default() -> Self {
        Self {
            base_ms: 500,
            cap_ms: 30_000,
        }
    }
}

impl Default for WatchConf {
    fn default() -> Self {
        Self {
            path: PathBuf::from("sample_logs/readings.csv"),
            poll_interval_ms: 500,
            delimiter: ',',
            require_trailing_newline: true,
        }
    }
}

impl Default for AlertsConf {
    fn default() -> Self {
        Self {
            console: true,
            file: Some(PathBuf::from("alerts.txt")),
            forward_topic: None,
        }
    }
}

impl BrokerConf {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// `skywatch-producer-1a2b3c4d`: unique per process so two instances never
    /// kick each other off the broker.
    pub fn client_id_for(&self, role: &str) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}", self.client_id, role, &suffix[..8])
    }
}

impl WatchConf {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn delimiter_byte(&self) -> u8 {
        // validate() guarantees ASCII
        self.delimiter as u8
    }
}

impl SkywatchConfig {
    /// Loads `.env`, then the YAML file named by `SKYWATCH_CONFIG`, then
    /// environment overrides, then validates.
    pub async fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());

        let mut cfg = Self::from_file(Path::new(&path)).await?;
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("no config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(&txt).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `SKYWATCH_*` overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("SKYWATCH_BROKER_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = lookup("SKYWATCH_BROKER_PORT") {
            self.broker.port = port.trim().parse().map_err(|_| {
                ConfigError::invalid("SKYWATCH_BROKER_PORT", format!("not a port number: {port:?}"))
            })?;
        }
        if let Some(secs) = lookup("SKYWATCH_KEEPALIVE_SECS") {
            self.broker.keepalive_secs = secs.trim().parse().map_err(|_| {
                ConfigError::invalid("SKYWATCH_KEEPALIVE_SECS", format!("not a number: {secs:?}"))
            })?;
        }
        if let Some(topic) = lookup("SKYWATCH_TOPIC") {
            self.topic = topic;
        }
        if let Some(path) = lookup("SKYWATCH_WATCH_PATH") {
            self.watch.path = PathBuf::from(path);
        }
        if let Some(file) = lookup("SKYWATCH_ALERT_FILE") {
            self.alerts.file = if file.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(file))
            };
        }
        if let Some(profile) = lookup("SKYWATCH_RULE_PROFILE") {
            self.rules.profile = profile.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::invalid("broker.host", "must not be empty"));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::invalid("broker.port", "must be non-zero"));
        }
        if self.broker.keepalive_secs == 0 {
            return Err(ConfigError::invalid("broker.keepalive_secs", "must be at least 1"));
        }
        if self.broker.channel_capacity == 0 {
            return Err(ConfigError::invalid("broker.channel_capacity", "must be at least 1"));
        }
        if self.broker.publish_timeout_ms == 0 {
            return Err(ConfigError::invalid("broker.publish_timeout_ms", "must be non-zero"));
        }
        if self.topic.trim().is_empty() {
            return Err(ConfigError::invalid("topic", "must not be empty"));
        }
        if self.topic.contains(['+', '#']) {
            return Err(ConfigError::invalid("topic", "wildcards are not allowed in a publish topic"));
        }
        if self.watch.path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("watch.path", "must not be empty"));
        }
        if self.watch.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("watch.poll_interval_ms", "must be non-zero"));
        }
        if !self.watch.delimiter.is_ascii() || self.watch.delimiter == '"' {
            return Err(ConfigError::invalid(
                "watch.delimiter",
                format!("{:?} is not a usable single-byte delimiter", self.watch.delimiter),
            ));
        }
        if self.backoff.cap_ms < self.backoff.base_ms {
            return Err(ConfigError::invalid("backoff.cap_ms", "must be >= backoff.base_ms"));
        }
        if let Some(topic) = &self.alerts.forward_topic {
            if topic.trim().is_empty() || topic == &self.topic {
                return Err(ConfigError::invalid(
                    "alerts.forward_topic",
                    "must be non-empty and differ from the readings topic",
                ));
            }
        }
        crate::rules::resolve(&self.rules)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = SkywatchConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.broker.port, 1883);
        assert_eq!(cfg.topic, "weather/readings");
        assert_eq!(cfg.rules.profile, RuleProfile::Demo);
    }

    #[test]
    fn env_overrides_win() {
        let mut cfg = SkywatchConfig::default();
        cfg.apply_env(env(&[
            ("SKYWATCH_BROKER_HOST", "broker.lan"),
            ("SKYWATCH_BROKER_PORT", "8883"),
            ("SKYWATCH_TOPIC", "site/a/readings"),
            ("SKYWATCH_RULE_PROFILE", "friendly"),
            ("SKYWATCH_ALERT_FILE", ""),
        ]))
        .unwrap();
        assert_eq!(cfg.broker.host, "broker.lan");
        assert_eq!(cfg.broker.port, 8883);
        assert_eq!(cfg.topic, "site/a/readings");
        assert_eq!(cfg.rules.profile, RuleProfile::Friendly);
        assert!(cfg.alerts.file.is_none());
    }

    #[test]
    fn bad_port_is_fatal() {
        let mut cfg = SkywatchConfig::default();
        let err = cfg
            .apply_env(env(&[("SKYWATCH_BROKER_PORT", "eighty")]))
            .unwrap_err();
        assert!(err.to_string().contains("SKYWATCH_BROKER_PORT"));
    }

    #[test]
    fn missing_connection_parameters_fail_validation() {
        let mut cfg = SkywatchConfig::default();
        cfg.broker.host = "  ".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { field, .. }) if field == "broker.host"));

        let mut cfg = SkywatchConfig::default();
        cfg.topic.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = SkywatchConfig::default();
        cfg.broker.port = 0;
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SkywatchConfig::from_file(&dir.path().join("absent.yaml"))
            .await
            .unwrap();
        assert_eq!(cfg.broker.host, "localhost");
    }

    #[tokio::test]
    async fn partial_yaml_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "broker:\n  host: mqtt.example\nrules:\n  profile: friendly\n  overrides:\n    high-wind: 8.0\nwatch:\n  delimiter: ';'"
        )
        .unwrap();

        let cfg = SkywatchConfig::from_file(file.path()).await.unwrap();
        assert_eq!(cfg.broker.host, "mqtt.example");
        assert_eq!(cfg.broker.port, 1883);
        assert_eq!(cfg.rules.overrides.get("high-wind"), Some(&8.0));
        assert_eq!(cfg.watch.delimiter_byte(), b';');
        cfg.validate().unwrap();
    }

    #[test]
    fn example_config_is_valid() {
        let cfg: SkywatchConfig =
            serde_yaml::from_str(include_str!("../../skywatch.example.yaml")).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.rules.extra.len(), 1);
        assert_eq!(cfg.alerts.file.as_deref(), Some(Path::new("alerts.txt")));
    }

    #[tokio::test]
    async fn invalid_yaml_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "broker: [not, a, map").unwrap();
        let err = SkywatchConfig::from_file(file.path()).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
