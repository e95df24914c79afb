use crate::error::{EtudeError, EtudeResult};
use serde::Deserialize;
use std::path::PathBuf;

/// Server configuration.
///
/// Every field has a default, so a partial TOML table or a handful of
/// `ETUDE_*` variables is enough.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address (default: 0.0.0.0)
    pub host: String,

    /// Listen port; 0 picks an ephemeral port (default: 8080)
    pub port: u16,

    /// Directory files are served from (default: current directory)
    pub doc_root: PathBuf,

    /// Worker threads (default: number of CPUs)
    pub workers: usize,

    /// Capacity of the request queue (default: 10000)
    pub max_requests: usize,

    /// Size of the connection table; descriptors at or above it are refused
    /// (default: 65535)
    pub max_connections: usize,

    /// Events fetched per `epoll_wait` (default: 10000)
    pub max_events: usize,

    /// Per-connection read buffer in bytes (default: 2048)
    pub read_buffer_size: usize,

    /// Per-connection header buffer in bytes (default: 1024)
    pub write_buffer_size: usize,

    /// Seconds between idle-timer ticks (default: 5)
    pub timeslot_secs: u64,

    /// Idle time before a connection is closed (default: 3 timeslots)
    pub idle_timeout_secs: u64,
}

pub const DEFAULT_TIMESLOT_SECS: u64 = 5;

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            doc_root: PathBuf::from("."),
            workers: num_cpus::get(),
            max_requests: 10_000,
            max_connections: 65_535,
            max_events: 10_000,
            read_buffer_size: 2048,
            write_buffer_size: 1024,
            timeslot_secs: DEFAULT_TIMESLOT_SECS,
            idle_timeout_secs: 3 * DEFAULT_TIMESLOT_SECS,
        }
    }
}

impl ServerConfig {
    /// Overrides fields from `lookup`, which maps `ETUDE_*` names to values,
    /// usually `|key| std::env::var(key).ok()`.
    pub fn merge_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> EtudeResult<Self> {
        if let Some(host) = lookup("ETUDE_HOST") {
            self.host = host;
        }
        if let Some(root) = lookup("ETUDE_DOC_ROOT") {
            self.doc_root = PathBuf::from(root);
        }
        parse_var(&lookup, "ETUDE_PORT", &mut self.port)?;
        parse_var(&lookup, "ETUDE_WORKERS", &mut self.workers)?;
        parse_var(&lookup, "ETUDE_MAX_REQUESTS", &mut self.max_requests)?;
        parse_var(&lookup, "ETUDE_MAX_CONNECTIONS", &mut self.max_connections)?;
        parse_var(&lookup, "ETUDE_MAX_EVENTS", &mut self.max_events)?;
        parse_var(&lookup, "ETUDE_READ_BUFFER_SIZE", &mut self.read_buffer_size)?;
        parse_var(&lookup, "ETUDE_WRITE_BUFFER_SIZE", &mut self.write_buffer_size)?;

        let mut timeslot = self.timeslot_secs;
        parse_var(&lookup, "ETUDE_TIMESLOT_SECS", &mut timeslot)?;
        self.set_timeslot(timeslot);
        parse_var(&lookup, "ETUDE_IDLE_TIMEOUT_SECS", &mut self.idle_timeout_secs)?;
        Ok(self)
    }

    /// Changes the tick interval. An idle timeout still at its default of
    /// three timeslots follows along.
    pub fn set_timeslot(&mut self, secs: u64) {
        if self.idle_timeout_secs == self.timeslot_secs.saturating_mul(3) {
            self.idle_timeout_secs = secs.saturating_mul(3);
        }
        self.timeslot_secs = secs;
    }

    pub fn validate(&self) -> EtudeResult<()> {
        let positive = [
            ("workers", self.workers),
            ("max_requests", self.max_requests),
            ("max_connections", self.max_connections),
            ("max_events", self.max_events),
            ("read_buffer_size", self.read_buffer_size),
            ("write_buffer_size", self.write_buffer_size),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(EtudeError::InvalidConfig(format!("{name} must be positive")));
        }
        if self.timeslot_secs == 0 || self.timeslot_secs > u64::from(u32::MAX) {
            return Err(EtudeError::InvalidConfig(
                "timeslot_secs must be between 1 and 2^32-1".into(),
            ));
        }
        if self.idle_timeout_secs == 0 {
            return Err(EtudeError::InvalidConfig(
                "idle_timeout_secs must be positive".into(),
            ));
        }
        if i32::try_from(self.max_events).is_err() {
            return Err(EtudeError::InvalidConfig("max_events is too large".into()));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> EtudeResult<()>
where
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| EtudeError::InvalidConfig(format!("{key}={raw:?}: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        assert_eq!(config.max_requests, 10_000);
        assert_eq!(config.max_connections, 65_535);
        assert_eq!(config.idle_timeout_secs, 15);
        assert!(config.workers >= 1);
        config.validate().unwrap();
    }

    #[test]
    fn environment_overrides() {
        let config = ServerConfig::default()
            .merge_from(lookup(&[
                ("ETUDE_PORT", "9000"),
                ("ETUDE_DOC_ROOT", "/srv/www"),
                ("ETUDE_WORKERS", " 3 "),
                ("ETUDE_TIMESLOT_SECS", "2"),
            ]))
            .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.doc_root, PathBuf::from("/srv/www"));
        assert_eq!(config.workers, 3);
        assert_eq!(config.idle_timeout_secs, 6, "idle timeout follows the timeslot");
    }

    #[test]
    fn explicit_idle_timeout_wins() {
        let config = ServerConfig::default()
            .merge_from(lookup(&[
                ("ETUDE_TIMESLOT_SECS", "2"),
                ("ETUDE_IDLE_TIMEOUT_SECS", "30"),
            ]))
            .unwrap();
        assert_eq!(config.idle_timeout_secs, 30);
    }

    #[test]
    fn bad_numbers_are_reported() {
        let err = ServerConfig::default()
            .merge_from(lookup(&[("ETUDE_PORT", "http")]))
            .unwrap_err();
        assert!(err.to_string().contains("ETUDE_PORT"));
    }

    #[test]
    fn zero_sizes_fail_validation() {
        let config = ServerConfig {
            max_requests: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
        let config = ServerConfig {
            timeslot_secs: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
