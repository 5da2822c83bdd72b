use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::event::AttributeRef;

/// Worker count used when the configured pool size is not positive.
pub const DEFAULT_EVENT_SENDING_THREAD_POOL_SIZE: usize = 5;

/// Top-level configuration for the `flag-events` binary.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// SDK key reported in diagnostic events.
    #[serde(default)]
    pub sdk_key: String,

    /// Event pipeline configuration.
    #[serde(default)]
    pub events: EventsConfig,

    /// HTTP delivery configuration.
    #[serde(default)]
    pub http: HttpSenderConfig,
}

/// Event pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Redact every optional context attribute. Default: false.
    #[serde(default)]
    pub all_attributes_private: bool,

    /// Maximum events buffered between flushes. Negative values mean 1.
    /// Default: 100.
    #[serde(default = "default_capacity")]
    pub capacity: i64,

    /// Interval between automatic flushes. Default: 5s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Interval between periodic diagnostic events. Default: 15m.
    #[serde(default = "default_diagnostic_recording_interval", with = "humantime_serde")]
    pub diagnostic_recording_interval: Duration,

    /// Number of delivery workers. Zero and negative values both mean the
    /// default of 5: a pool without workers could never deliver.
    #[serde(default = "default_event_sending_thread_pool_size")]
    pub event_sending_thread_pool_size: i64,

    /// Base URI handed to the event sender.
    #[serde(default = "default_events_uri")]
    pub events_uri: String,

    /// Start in background mode (no periodic diagnostics). Default: false.
    #[serde(default)]
    pub initially_in_background: bool,

    /// Start offline (no flushing or diagnostics). Default: false.
    #[serde(default)]
    pub initially_offline: bool,

    /// Attribute references to redact from every context.
    #[serde(default)]
    pub private_attributes: Vec<String>,

    /// Dedup cache flush interval used when the deduplicator does not report
    /// one. Ignored without a deduplicator.
    #[serde(default, with = "humantime_serde")]
    pub context_keys_flush_interval: Option<Duration>,
}

/// HTTP delivery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSenderConfig {
    /// Per-request timeout. Default: 30s.
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Extra headers added to every request (e.g. Authorization).
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Keep idle connections open between requests. Default: true.
    #[serde(default = "default_true")]
    pub keep_alive: bool,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_capacity() -> i64 {
    100
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_diagnostic_recording_interval() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_event_sending_thread_pool_size() -> i64 {
    DEFAULT_EVENT_SENDING_THREAD_POOL_SIZE as i64
}

fn default_events_uri() -> String {
    "https://events.example.com".to_string()
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            sdk_key: String::new(),
            events: EventsConfig::default(),
            http: HttpSenderConfig::default(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            all_attributes_private: false,
            capacity: default_capacity(),
            flush_interval: default_flush_interval(),
            diagnostic_recording_interval: default_diagnostic_recording_interval(),
            event_sending_thread_pool_size: default_event_sending_thread_pool_size(),
            events_uri: default_events_uri(),
            initially_in_background: false,
            initially_offline: false,
            private_attributes: Vec::new(),
            context_keys_flush_interval: None,
        }
    }
}

impl Default for HttpSenderConfig {
    fn default() -> Self {
        Self {
            timeout: default_http_timeout(),
            headers: HashMap::new(),
            keep_alive: true,
        }
    }
}

// --- Normalisation ---

impl EventsConfig {
    /// Effective buffer capacity.
    pub fn capacity(&self) -> usize {
        usize::try_from(self.capacity).unwrap_or(1)
    }

    /// Effective number of delivery workers. Zero workers could never
    /// drain the handoff slot, so it is treated like a negative value.
    pub fn worker_count(&self) -> usize {
        match usize::try_from(self.event_sending_thread_pool_size) {
            Ok(0) | Err(_) => DEFAULT_EVENT_SENDING_THREAD_POOL_SIZE,
            Ok(n) => n,
        }
    }

    pub fn private_attribute_refs(&self) -> Vec<AttributeRef> {
        self.private_attributes
            .iter()
            .map(|a| AttributeRef::new(a))
            .collect()
    }

    /// Validate the pipeline settings.
    pub fn validate(&self) -> Result<()> {
        if self.flush_interval.is_zero() {
            bail!("events.flush_interval must be positive");
        }

        if self.diagnostic_recording_interval.is_zero() {
            bail!("events.diagnostic_recording_interval must be positive");
        }

        if self.events_uri.is_empty() {
            bail!("events.events_uri is required");
        }

        for attr in self.private_attribute_refs() {
            if !attr.is_valid() {
                bail!("events.private_attributes: invalid attribute reference \"{attr}\"");
            }
        }

        Ok(())
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        self.events.validate()?;

        if self.http.timeout.is_zero() {
            bail!("http.timeout must be positive");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.events.capacity, 100);
        assert_eq!(cfg.events.flush_interval, Duration::from_secs(5));
        assert_eq!(
            cfg.events.diagnostic_recording_interval,
            Duration::from_secs(900)
        );
        assert_eq!(cfg.events.worker_count(), 5);
        assert_eq!(cfg.http.timeout, Duration::from_secs(30));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_negative_capacity_becomes_one() {
        let cfg = EventsConfig {
            capacity: -5,
            ..Default::default()
        };
        assert_eq!(cfg.capacity(), 1);

        let cfg = EventsConfig {
            capacity: 0,
            ..Default::default()
        };
        assert_eq!(cfg.capacity(), 0);
    }

    #[test]
    fn test_worker_count_falls_back_to_default() {
        for size in [-1, 0] {
            let cfg = EventsConfig {
                event_sending_thread_pool_size: size,
                ..Default::default()
            };
            assert_eq!(cfg.worker_count(), DEFAULT_EVENT_SENDING_THREAD_POOL_SIZE);
        }
        let cfg = EventsConfig {
            event_sending_thread_pool_size: 2,
            ..Default::default()
        };
        assert_eq!(cfg.worker_count(), 2);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
log_level: debug
sdk_key: sdk-123456
events:
  capacity: 1000
  flush_interval: 2s
  diagnostic_recording_interval: 1m
  events_uri: http://localhost:8080
  private_attributes: [email, /address/city]
  context_keys_flush_interval: 5m
http:
  timeout: 10s
  headers:
    Authorization: sdk-123456
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse yaml");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.events.capacity(), 1000);
        assert_eq!(cfg.events.flush_interval, Duration::from_secs(2));
        assert_eq!(
            cfg.events.diagnostic_recording_interval,
            Duration::from_secs(60)
        );
        assert_eq!(
            cfg.events.context_keys_flush_interval,
            Some(Duration::from_secs(300))
        );
        assert_eq!(cfg.events.private_attribute_refs().len(), 2);
        assert_eq!(cfg.http.headers["Authorization"], "sdk-123456");
        assert!(cfg.http.keep_alive);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_zero_flush_interval() {
        let cfg = Config {
            events: EventsConfig {
                flush_interval: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("flush_interval"));
    }

    #[test]
    fn test_validation_zero_diagnostic_interval() {
        let cfg = Config {
            events: EventsConfig {
                diagnostic_recording_interval: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("diagnostic_recording_interval"));
    }

    #[test]
    fn test_validation_missing_events_uri() {
        let mut cfg = Config::default();
        cfg.events.events_uri.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("events_uri"));
    }

    #[test]
    fn test_validation_invalid_private_attribute() {
        let mut cfg = Config::default();
        cfg.events.private_attributes = vec!["/".to_string()];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("private_attributes"));
    }
}
