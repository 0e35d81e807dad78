use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{BridgeError, FrameShape, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bridge: BridgeConfig,
}

impl AppConfig {
    /// Parses a JSON document. Missing fields fall back to their defaults.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.bridge.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

/// What happens to the iteration counter when a stopped bridge is started again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Count from zero again, with a fresh timestamp baseline.
    #[default]
    ResetIteration,
    /// Carry on from the last published iteration.
    Continue,
}

/// Construction parameters for a [`Bridge`](crate::Bridge).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub device_index: i32,
    /// Target sampling rate in ticks per second.
    pub frequency: f64,
    /// Opaque identifier handed to the publication transport.
    pub segment_id: String,
    pub shape: FrameShape,
    pub restart: RestartPolicy,
    /// Number of past observations readers can still catch up on.
    pub history: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            frequency: 100.0,
            segment_id: "camera_bridge_demo".to_string(),
            shape: FrameShape::WEBCAM,
            restart: RestartPolicy::default(),
            history: 8,
        }
    }
}

impl BridgeConfig {
    pub fn new(device_index: i32, frequency: f64, segment_id: impl Into<String>) -> Self {
        Self {
            device_index,
            frequency,
            segment_id: segment_id.into(),
            ..Default::default()
        }
    }

    pub fn with_shape(mut self, shape: FrameShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_history(mut self, history: usize) -> Self {
        self.history = history;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.period()?;
        if self.segment_id.is_empty() {
            return Err(BridgeError::Config("segment id must not be empty".into()));
        }
        if self.shape.byte_len() == 0 {
            return Err(BridgeError::Config(format!(
                "frame shape {}x{}x{} holds no bytes",
                self.shape.width, self.shape.height, self.shape.channels
            )));
        }
        if self.history == 0 {
            return Err(BridgeError::Config("history must hold at least one observation".into()));
        }
        Ok(())
    }

    /// Duration of one tick.
    ///
    /// # Errors
    ///
    /// [`BridgeError::InvalidFrequency`] unless the frequency is positive and
    /// its period fits in a [`Duration`].
    pub fn period(&self) -> Result<Duration> {
        if !self.frequency.is_finite() || self.frequency <= 0.0 {
            return Err(BridgeError::InvalidFrequency(self.frequency));
        }
        Duration::try_from_secs_f64(1.0 / self.frequency)
            .map_err(|_| BridgeError::InvalidFrequency(self.frequency))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_keep_defaults() {
        let config =
            AppConfig::from_json_str(r#"{ "bridge": { "frequency": 30.0, "restart": "continue" } }"#)
                .unwrap();

        assert_eq!(config.bridge.frequency, 30.0);
        assert_eq!(config.bridge.restart, RestartPolicy::Continue);
        assert_eq!(config.bridge.device_index, 0);
        assert_eq!(config.bridge.shape, FrameShape::WEBCAM);
    }

    #[test]
    fn rejects_non_positive_frequency() {
        let err = AppConfig::from_json_str(r#"{ "bridge": { "frequency": 0.0 } }"#).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidFrequency(f) if f == 0.0));

        let config = BridgeConfig::new(0, f64::NAN, "seg");
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_segment_and_shape() {
        assert!(matches!(
            BridgeConfig::new(0, 10.0, "").validate(),
            Err(BridgeError::Config(_))
        ));
        let zero = BridgeConfig::default().with_shape(FrameShape::new(0, 4, 3));
        assert!(matches!(zero.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn period_matches_frequency() {
        let config = BridgeConfig::new(0, 50.0, "seg");
        assert_eq!(config.period().unwrap(), Duration::from_millis(20));
    }

    #[test]
    fn rejects_frequencies_whose_period_overflows() {
        for frequency in [1e-20, 5e-324] {
            let config = BridgeConfig::new(0, frequency, "seg");
            assert!(matches!(
                config.validate(),
                Err(BridgeError::InvalidFrequency(f)) if f == frequency
            ));
            assert!(config.period().is_err());
        }
    }

    #[test]
    fn rejects_empty_history() {
        let config = BridgeConfig::default().with_history(0);
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));
        assert_eq!(BridgeConfig::default().history, 8);
    }
}
