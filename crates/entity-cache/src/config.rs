use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "entity_cache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Settings shared by the caches of all entity types.
///
/// Per type overrides live in [`EntityCacheOptions`](crate::EntityCacheOptions).
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
    /// Idle time after which an entry becomes eligible for eviction.
    #[serde(with = "humantime_serde")]
    pub expire_after_access: Duration,

    /// Interval in which dirty entities are written back to the store.
    ///
    /// The persistence sweep runs twice per interval.
    #[serde(with = "humantime_serde")]
    pub persist_interval: Duration,

    /// Upper bound for loading a single entity on a cache miss.
    #[serde(with = "humantime_serde")]
    pub load_timeout: Duration,

    /// Upper bound for loading the missing entities of a `get_all` call.
    #[serde(with = "humantime_serde")]
    pub bulk_load_timeout: Duration,

    /// Initial capacity of a cache.
    pub initial_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            expire_after_access: Duration::from_secs(5 * 60),
            persist_interval: Duration::from_secs(60),
            load_timeout: Duration::from_secs(5),
            bulk_load_timeout: Duration::from_secs(10),
            initial_size: 1024,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// Settings of the entity caches.
    pub cache: CacheSettings,
}

impl Config {
    /// Loads the configuration from a YAML file, or returns the defaults without a path.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_settings() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.cache, CacheSettings::default());
        assert_eq!(cfg.cache.expire_after_access, Duration::from_secs(300));

        // individual settings can be overridden without touching the others
        let yaml = r#"
            cache:
              expire_after_access: 10m
              load_timeout: 500ms
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.cache.expire_after_access, Duration::from_secs(600));
        assert_eq!(cfg.cache.load_timeout, Duration::from_millis(500));
        assert_eq!(cfg.cache.persist_interval, Duration::from_secs(60));
        assert_eq!(cfg.cache.bulk_load_timeout, Duration::from_secs(10));
        assert_eq!(cfg.cache.initial_size, 1024);
    }

    #[test]
    fn test_logging() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert!(cfg.logging.enable_backtraces);

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_metrics() {
        let yaml = r#"
            metrics:
              statsd: 127.0.0.1:8125
              custom_tags:
                region: eu
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.metrics.statsd.as_deref(), Some("127.0.0.1:8125"));
        assert_eq!(cfg.metrics.prefix, "entity_cache");
        assert_eq!(cfg.metrics.custom_tags["region"], "eu");
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            cache:
              not_a_setting: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
