//! REST API endpoints for rttprobe
//!
//! All endpoints are under /api/v1/ and return JSON.

use crate::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use rttprobe_core::probe::message::MAX_PADDING_BYTES;
use rttprobe_core::{EngineSnapshot, EngineState, ProbeEngine, ProbeSettings, TransportId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-transport connection and enable status
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransportStatus {
    pub transport: TransportId,
    pub open: bool,
    pub enabled: bool,
}

/// Application status response
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StatusResponse {
    pub version: String,
    pub build_date: String,
    pub state: EngineState,
    pub running: bool,
    pub sequence_counter: u64,
    pub transports: Vec<TransportStatus>,
}

impl StatusResponse {
    fn from_engine(engine: &ProbeEngine) -> Self {
        let snapshot = engine.snapshot();
        Self {
            version: rttprobe_core::VERSION.to_string(),
            build_date: rttprobe_core::BUILD_DATE.to_string(),
            state: engine.state(),
            running: snapshot.running,
            sequence_counter: snapshot.sequence_counter,
            transports: snapshot
                .transports
                .iter()
                .map(|t| TransportStatus {
                    transport: t.transport,
                    open: t.open,
                    enabled: t.enabled,
                })
                .collect(),
        }
    }
}

/// Run toggle request
#[derive(Deserialize)]
pub struct RunRequest {
    pub running: bool,
}

/// Run toggle response
#[derive(Serialize, Deserialize, Debug)]
pub struct RunResponse {
    /// False when the engine was already in the requested state
    pub changed: bool,
    #[serde(flatten)]
    pub status: StatusResponse,
}

/// Configuration response
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct ConfigResponse {
    pub interval_ms: u64,
    pub padding_bytes: usize,
    pub enabled: BTreeMap<TransportId, bool>,
}

impl From<&ProbeSettings> for ConfigResponse {
    fn from(settings: &ProbeSettings) -> Self {
        Self {
            interval_ms: settings.interval().as_millis() as u64,
            padding_bytes: settings.padding(),
            enabled: TransportId::ALL
                .into_iter()
                .map(|id| (id, settings.is_enabled(id)))
                .collect(),
        }
    }
}

/// Configuration update request
#[derive(Deserialize, Default)]
pub struct ConfigUpdate {
    pub interval_ms: Option<i64>,
    pub padding_bytes: Option<i64>,
    #[serde(default)]
    pub enabled: BTreeMap<TransportId, bool>,
}

impl ConfigUpdate {
    /// Apply on top of `settings`, rejecting out-of-range values
    pub fn apply(self, mut settings: ProbeSettings) -> Result<ProbeSettings, String> {
        if let Some(interval_ms) = self.interval_ms {
            if interval_ms <= 0 {
                return Err(format!("interval_ms must be positive, got {}", interval_ms));
            }
            settings.interval_ms = interval_ms;
        }
        if let Some(padding_bytes) = self.padding_bytes {
            if padding_bytes < 0 {
                return Err(format!(
                    "padding_bytes must not be negative, got {}",
                    padding_bytes
                ));
            }
            if padding_bytes > MAX_PADDING_BYTES as i64 {
                return Err(format!(
                    "padding_bytes must be at most {}, got {}",
                    MAX_PADDING_BYTES, padding_bytes
                ));
            }
            settings.padding_bytes = padding_bytes;
        }
        for (id, enabled) in self.enabled {
            settings.set_enabled(id, enabled);
        }
        Ok(settings)
    }
}

/// GET /api/v1/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse::from_engine(&state.engine))
}

/// GET /api/v1/stats
pub async fn get_stats(State(state): State<AppState>) -> Json<EngineSnapshot> {
    Json(state.engine.snapshot())
}

/// POST /api/v1/run
pub async fn set_running(
    State(state): State<AppState>,
    Json(req): Json<RunRequest>,
) -> Json<RunResponse> {
    let changed = if req.running {
        state.engine.start()
    } else {
        state.engine.stop()
    };
    if !changed {
        tracing::debug!(running = req.running, "Run state unchanged");
    }
    Json(RunResponse {
        changed,
        status: StatusResponse::from_engine(&state.engine),
    })
}

/// GET /api/v1/config
pub async fn get_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    Json(ConfigResponse::from(&state.engine.settings()))
}

/// PATCH /api/v1/config
pub async fn update_config(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> Result<Json<ConfigResponse>, (StatusCode, String)> {
    let settings = update
        .apply(state.engine.settings())
        .map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    state.engine.update_settings(settings);
    Ok(Json(ConfigResponse::from(&state.engine.settings())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_update_partial() {
        let json = r#"{"padding_bytes": 64}"#;
        let update: ConfigUpdate = serde_json::from_str(json).unwrap();
        let settings = update.apply(ProbeSettings::default()).unwrap();
        assert_eq!(settings.padding(), 64);
        assert_eq!(settings.interval_ms, 100);
    }

    #[test]
    fn test_config_update_toggles_transport() {
        let json = r#"{"enabled": {"unreliable": false}}"#;
        let update: ConfigUpdate = serde_json::from_str(json).unwrap();
        let settings = update.apply(ProbeSettings::default()).unwrap();
        assert!(!settings.is_enabled(TransportId::Unreliable));
        assert!(settings.is_enabled(TransportId::Stream));
    }

    #[test]
    fn test_config_update_rejects_bad_values() {
        let zero = ConfigUpdate {
            interval_ms: Some(0),
            ..ConfigUpdate::default()
        };
        assert!(zero.apply(ProbeSettings::default()).is_err());

        let negative = ConfigUpdate {
            padding_bytes: Some(-1),
            ..ConfigUpdate::default()
        };
        assert!(negative.apply(ProbeSettings::default()).is_err());

        let oversized = ConfigUpdate {
            padding_bytes: Some(70_000),
            ..ConfigUpdate::default()
        };
        assert!(oversized.apply(ProbeSettings::default()).is_err());

        let largest = ConfigUpdate {
            padding_bytes: Some(MAX_PADDING_BYTES as i64),
            ..ConfigUpdate::default()
        };
        let settings = largest.apply(ProbeSettings::default()).unwrap();
        assert_eq!(settings.padding(), MAX_PADDING_BYTES);
    }

    #[test]
    fn test_config_response_lists_every_transport() {
        let response = ConfigResponse::from(&ProbeSettings::default());
        assert_eq!(response.interval_ms, 100);
        assert_eq!(response.enabled.len(), 3);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["enabled"]["stream"], true);
    }

    #[test]
    fn test_run_response_flattens_status() {
        let response = RunResponse {
            changed: false,
            status: StatusResponse {
                version: "0.1.0".to_string(),
                build_date: "2026-01-01".to_string(),
                state: EngineState::Idle,
                running: false,
                sequence_counter: 0,
                transports: vec![],
            },
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["changed"], false);
        assert_eq!(json["state"], "idle");
        assert_eq!(json["version"], "0.1.0");
    }
}
