//! Controller configuration.
//!
//! Defaults can be overridden from the environment:
//! - `CONNTRACK_MAX_ENTRIES`: slot ceiling, or `unlimited`
//! - `CONNTRACK_TIMEOUT`: linger after release, in seconds (fractions allowed)

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const MAX_ENTRIES_VAR: &str = "CONNTRACK_MAX_ENTRIES";
pub const TIMEOUT_VAR: &str = "CONNTRACK_TIMEOUT";

/// A quarter of the commonly quoted absolute maximum on a Linux system.
pub const DEFAULT_MAX_ENTRIES: usize = 1 << 14;

/// UDP is the main offender, and its kernel default is around 30s.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How many distinct entries may be occupied at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capacity {
    Limited(usize),
    Unlimited,
}

impl Capacity {
    pub fn has_room(&self, occupied: usize) -> bool {
        match *self {
            Capacity::Limited(max) => occupied < max,
            Capacity::Unlimited => true,
        }
    }
}

impl Default for Capacity {
    fn default() -> Self {
        Capacity::Limited(DEFAULT_MAX_ENTRIES)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {var}: expected a non-negative integer or 'unlimited', got '{value}'")]
    InvalidMaxEntries { var: &'static str, value: String },
    #[error("invalid {var}: expected a non-negative number of seconds, got '{value}'")]
    InvalidTimeout { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConntrackConfig {
    pub capacity: Capacity,
    /// Linger applied to every entry unless the instance's timeout is overridden.
    pub default_timeout: Duration,
}

impl Default for ConntrackConfig {
    fn default() -> Self {
        Self {
            capacity: Capacity::default(),
            default_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ConntrackConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup(MAX_ENTRIES_VAR) {
            config.capacity = parse_capacity(&value).ok_or(ConfigError::InvalidMaxEntries {
                var: MAX_ENTRIES_VAR,
                value,
            })?;
        }

        if let Some(value) = lookup(TIMEOUT_VAR) {
            config.default_timeout = parse_seconds(&value).ok_or(ConfigError::InvalidTimeout {
                var: TIMEOUT_VAR,
                value,
            })?;
        }

        Ok(config)
    }
}

/// Parse a slot ceiling: a non-negative integer or `unlimited`.
pub fn parse_capacity(value: &str) -> Option<Capacity> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("unlimited") {
        return Some(Capacity::Unlimited);
    }
    value.parse::<usize>().ok().map(Capacity::Limited)
}

fn parse_seconds(value: &str) -> Option<Duration> {
    let secs = value.trim().parse::<f64>().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = ConntrackConfig::default();
        assert_eq!(config.capacity, Capacity::Limited(16384));
        assert_eq!(config.default_timeout, Duration::from_secs(30));
    }

    #[test]
    fn unset_vars_keep_defaults() {
        let config = ConntrackConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ConntrackConfig::default());
    }

    #[test]
    fn reads_overrides() {
        let config = ConntrackConfig::from_lookup(lookup(&[
            (MAX_ENTRIES_VAR, " 128 "),
            (TIMEOUT_VAR, "0.25"),
        ]))
        .unwrap();
        assert_eq!(config.capacity, Capacity::Limited(128));
        assert_eq!(config.default_timeout, Duration::from_millis(250));

        let config =
            ConntrackConfig::from_lookup(lookup(&[(MAX_ENTRIES_VAR, "Unlimited")])).unwrap();
        assert_eq!(config.capacity, Capacity::Unlimited);
    }

    #[test]
    fn rejects_malformed_values() {
        let err = ConntrackConfig::from_lookup(lookup(&[(MAX_ENTRIES_VAR, "-1")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidMaxEntries {
                var: MAX_ENTRIES_VAR,
                value: "-1".to_string()
            }
        );

        let err = ConntrackConfig::from_lookup(lookup(&[(TIMEOUT_VAR, "soon")])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid CONNTRACK_TIMEOUT: expected a non-negative number of seconds, got 'soon'"
        );

        assert!(ConntrackConfig::from_lookup(lookup(&[(TIMEOUT_VAR, "-3")])).is_err());
        assert!(ConntrackConfig::from_lookup(lookup(&[(TIMEOUT_VAR, "inf")])).is_err());
    }

    #[test]
    fn capacity_room() {
        assert!(Capacity::Limited(1).has_room(0));
        assert!(!Capacity::Limited(1).has_room(1));
        assert!(!Capacity::Limited(0).has_room(0));
        assert!(Capacity::Unlimited.has_room(usize::MAX));
    }
}
