//! Run settings for the probe scheduler

use super::message::MAX_PADDING_BYTES;
use crate::transport::TransportId;
use crate::DEFAULT_INTERVAL_MS;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

fn default_interval_ms() -> i64 {
    DEFAULT_INTERVAL_MS as i64
}

/// Probe cadence, size, and per-transport enable flags
///
/// Values are stored as configured and normalized on read, so a bad value
/// coming from a config file or the API degrades to the default instead of
/// being rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSettings {
    /// Tick interval in milliseconds (non-positive means default)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: i64,
    /// Filler bytes added to each probe (non-positive means none, capped at
    /// [`MAX_PADDING_BYTES`])
    #[serde(default)]
    pub padding_bytes: i64,
    /// Per-transport enable flags; missing entries count as enabled
    #[serde(default)]
    pub enabled: BTreeMap<TransportId, bool>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            padding_bytes: 0,
            enabled: BTreeMap::new(),
        }
    }
}

impl ProbeSettings {
    /// Parse a user-supplied interval, falling back to the default
    pub fn parse_interval(raw: &str) -> i64 {
        raw.trim()
            .parse::<i64>()
            .ok()
            .filter(|ms| *ms > 0)
            .unwrap_or_else(default_interval_ms)
    }

    /// Effective tick interval
    pub fn interval(&self) -> Duration {
        if self.interval_ms > 0 {
            Duration::from_millis(self.interval_ms as u64)
        } else {
            Duration::from_millis(DEFAULT_INTERVAL_MS)
        }
    }

    /// Effective padding size in bytes, capped at [`MAX_PADDING_BYTES`]
    pub fn padding(&self) -> usize {
        self.padding_bytes.clamp(0, MAX_PADDING_BYTES as i64) as usize
    }

    /// Whether probes should be sent on `id`
    pub fn is_enabled(&self, id: TransportId) -> bool {
        self.enabled.get(&id).copied().unwrap_or(true)
    }

    /// Set the enable flag for one transport
    pub fn set_enabled(&mut self, id: TransportId, enabled: bool) {
        self.enabled.insert(id, enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ProbeSettings::default();
        assert_eq!(settings.interval(), Duration::from_millis(100));
        assert_eq!(settings.padding(), 0);
        for id in TransportId::ALL {
            assert!(settings.is_enabled(id));
        }
    }

    #[test]
    fn test_invalid_interval_falls_back() {
        let settings = ProbeSettings {
            interval_ms: -5,
            ..Default::default()
        };
        assert_eq!(settings.interval(), Duration::from_millis(100));
        assert_eq!(ProbeSettings::parse_interval("abc"), 100);
        assert_eq!(ProbeSettings::parse_interval("0"), 100);
        assert_eq!(ProbeSettings::parse_interval(" 250 "), 250);
    }

    #[test]
    fn test_negative_padding_means_none() {
        let settings = ProbeSettings {
            padding_bytes: -10,
            ..Default::default()
        };
        assert_eq!(settings.padding(), 0);
    }

    #[test]
    fn test_oversized_padding_is_capped() {
        let settings = ProbeSettings {
            padding_bytes: 70_000,
            ..Default::default()
        };
        assert_eq!(settings.padding(), MAX_PADDING_BYTES);

        let huge = ProbeSettings {
            padding_bytes: i64::MAX,
            ..Default::default()
        };
        assert_eq!(huge.padding(), MAX_PADDING_BYTES);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let settings: ProbeSettings =
            serde_json::from_str(r#"{"enabled":{"unreliable":false}}"#).unwrap();
        assert_eq!(settings.interval_ms, 100);
        assert!(!settings.is_enabled(TransportId::Unreliable));
        assert!(settings.is_enabled(TransportId::Stream));
    }
}
