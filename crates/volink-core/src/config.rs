//! Tuning for the prediction layer.
//!
//! Defaults match a 15 Hz input rate. Values can come from JSON and be
//! overridden from the environment:
//! - `VOLINK_CAMERA_THROTTLE_MS`
//! - `VOLINK_SLICE_THROTTLE_MS`
//! - `VOLINK_STROKE_THROTTLE_MS`
//! - `VOLINK_INSTANT_LOCAL_UPDATE` (`true`/`false`)
//! - `VOLINK_DRAW_TOGGLE_WINDOW_MS`

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Input throttling period: 15 events per second.
pub const DEFAULT_THROTTLE_MS: u64 = 1000 / 15;

/// Two drawing toggles closer than this count as a double toggle.
pub const DEFAULT_DRAW_TOGGLE_WINDOW_MS: u64 = 275;

pub const DEFAULT_MIN_ZOOM: f64 = 0.5;
pub const DEFAULT_MAX_ZOOM: f64 = 4.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid zoom range: {min}..{max}")]
    ZoomRange { min: f64, max: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub camera_throttle_ms: u64,
    pub slice_throttle_ms: u64,
    pub stroke_throttle_ms: u64,
    /// Apply local camera and slice changes before the echo arrives.
    pub instant_local_update: bool,
    pub draw_toggle_window_ms: u64,
    pub min_zoom: f64,
    pub max_zoom: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            camera_throttle_ms: DEFAULT_THROTTLE_MS,
            slice_throttle_ms: DEFAULT_THROTTLE_MS,
            stroke_throttle_ms: DEFAULT_THROTTLE_MS,
            instant_local_update: true,
            draw_toggle_window_ms: DEFAULT_DRAW_TOGGLE_WINDOW_MS,
            min_zoom: DEFAULT_MIN_ZOOM,
            max_zoom: DEFAULT_MAX_ZOOM,
        }
    }
}

impl SyncConfig {
    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Self {
        Self {
            camera_throttle_ms: env_parse("VOLINK_CAMERA_THROTTLE_MS", self.camera_throttle_ms),
            slice_throttle_ms: env_parse("VOLINK_SLICE_THROTTLE_MS", self.slice_throttle_ms),
            stroke_throttle_ms: env_parse("VOLINK_STROKE_THROTTLE_MS", self.stroke_throttle_ms),
            instant_local_update: env_parse("VOLINK_INSTANT_LOCAL_UPDATE", self.instant_local_update),
            draw_toggle_window_ms: env_parse("VOLINK_DRAW_TOGGLE_WINDOW_MS", self.draw_toggle_window_ms),
            ..self
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid = self.min_zoom.is_finite()
            && self.max_zoom.is_finite()
            && self.min_zoom > 0.0
            && self.min_zoom <= self.max_zoom;
        if !valid {
            return Err(ConfigError::ZoomRange { min: self.min_zoom, max: self.max_zoom });
        }
        Ok(())
    }

    pub fn camera_throttle(&self) -> Duration {
        Duration::from_millis(self.camera_throttle_ms)
    }

    pub fn slice_throttle(&self) -> Duration {
        Duration::from_millis(self.slice_throttle_ms)
    }

    pub fn stroke_throttle(&self) -> Duration {
        Duration::from_millis(self.stroke_throttle_ms)
    }

    pub fn draw_toggle_window(&self) -> Duration {
        Duration::from_millis(self.draw_toggle_window_ms)
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
