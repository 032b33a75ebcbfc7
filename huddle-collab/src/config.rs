use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Events buffered per connection before it is dropped as too slow
    pub outbound_queue_capacity: usize,
    /// How long an empty document session survives before eviction
    pub idle_grace_period: Duration,
    /// Interval between writes of changed documents
    pub persist_interval: Duration,
    /// Largest accepted document update in bytes
    pub max_update_bytes: usize,
    /// Tell senders when a signaling target does not exist
    pub report_unknown_signal_target: bool,
    /// RocksDB file store path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// JSON identity/membership directory (None = empty directory)
    pub directory_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_queue_capacity: 256,
            idle_grace_period: Duration::from_secs(300),
            persist_interval: Duration::from_secs(30),
            max_update_bytes: 1024 * 1024,
            report_unknown_signal_target: false,
            storage_path: None,
            directory_path: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from `HUDDLE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let bind_addr = lookup("HUDDLE_BIND_ADDR").unwrap_or(defaults.bind_addr);

        let outbound_queue_capacity = match lookup("HUDDLE_OUTBOUND_QUEUE") {
            Some(v) => match v.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(ConfigError::Invalid("HUDDLE_OUTBOUND_QUEUE", v)),
            },
            None => defaults.outbound_queue_capacity,
        };

        let idle_grace_period = parse_secs(&lookup, "HUDDLE_IDLE_GRACE_SECS")?
            .unwrap_or(defaults.idle_grace_period);

        let persist_interval = match parse_secs(&lookup, "HUDDLE_PERSIST_INTERVAL_SECS")? {
            Some(d) if d.is_zero() => {
                return Err(ConfigError::Invalid("HUDDLE_PERSIST_INTERVAL_SECS", "0".into()))
            }
            Some(d) => d,
            None => defaults.persist_interval,
        };

        let max_update_bytes = match lookup("HUDDLE_MAX_UPDATE_BYTES") {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid("HUDDLE_MAX_UPDATE_BYTES", v))?,
            None => defaults.max_update_bytes,
        };

        let report_unknown_signal_target = match lookup("HUDDLE_REPORT_UNKNOWN_SIGNAL") {
            Some(v) => match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => return Err(ConfigError::Invalid("HUDDLE_REPORT_UNKNOWN_SIGNAL", v)),
            },
            None => defaults.report_unknown_signal_target,
        };

        let storage_path = lookup("HUDDLE_STORAGE_PATH")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let directory_path = lookup("HUDDLE_DIRECTORY")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        Ok(ServerConfig {
            bind_addr,
            outbound_queue_capacity,
            idle_grace_period,
            persist_interval,
            max_update_bytes,
            report_unknown_signal_target,
            storage_path,
            directory_path,
        })
    }
}

fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    match lookup(name) {
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| ConfigError::Invalid(name, v)),
        None => Ok(None),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    /// Variable name and the rejected value.
    Invalid(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid(name, value) => write!(f, "Invalid value for {name}: {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.outbound_queue_capacity, 256);
        assert_eq!(config.idle_grace_period, Duration::from_secs(300));
        assert_eq!(config.persist_interval, Duration::from_secs(30));
        assert_eq!(config.max_update_bytes, 1024 * 1024);
        assert!(!config.report_unknown_signal_target);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HUDDLE_BIND_ADDR", "0.0.0.0:4000"),
            ("HUDDLE_OUTBOUND_QUEUE", "32"),
            ("HUDDLE_IDLE_GRACE_SECS", "5"),
            ("HUDDLE_REPORT_UNKNOWN_SIGNAL", "true"),
            ("HUDDLE_STORAGE_PATH", "/tmp/huddle"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:4000");
        assert_eq!(config.outbound_queue_capacity, 32);
        assert_eq!(config.idle_grace_period, Duration::from_secs(5));
        assert!(config.report_unknown_signal_target);
        assert_eq!(config.storage_path, Some(PathBuf::from("/tmp/huddle")));
    }

    #[test]
    fn test_invalid_values_rejected() {
        for (name, value) in [
            ("HUDDLE_OUTBOUND_QUEUE", "0"),
            ("HUDDLE_OUTBOUND_QUEUE", "many"),
            ("HUDDLE_IDLE_GRACE_SECS", "-1"),
            ("HUDDLE_PERSIST_INTERVAL_SECS", "0"),
            ("HUDDLE_REPORT_UNKNOWN_SIGNAL", "maybe"),
        ] {
            let result = ServerConfig::from_lookup(lookup(&[(name, value)]));
            assert!(
                matches!(result, Err(ConfigError::Invalid(n, _)) if n == name),
                "{name}={value} should be rejected"
            );
        }
    }
}
