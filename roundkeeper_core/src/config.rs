//! Session configuration.
//!
//! Scene names, timeouts, the survival region and the catalog are all
//! supplied from outside the core. Every section has sensible defaults so a
//! config file only needs to name what differs.
//!
//! ```json
//! {
//!   "round": { "play_scene": "arena", "timeout_secs": 300, "revive_delay_secs": 3,
//!              "region": { "shape": "box", "center": [0, 0, 0], "half_extents": [20, 10, 20] } },
//!   "placement": { "settle_delay_secs": 1, "fallback_item": "fallback" }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::catalog::Anchor;
use crate::geometry::{Pose, SurvivalRegion};
use crate::messages::LoadMode;

/// Configuration loading/validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration for one host session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Host update rate in Hz (default: 30)
    pub tick_rate_hz: u32,

    pub round: RoundConfig,

    pub transition: TransitionConfig,

    pub placement: PlacementConfig,

    /// Composite structure spawned at session start, if any
    pub composite: Option<CompositeConfig>,

    pub catalog: CatalogConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 30,
            round: RoundConfig::default(),
            transition: TransitionConfig::default(),
            placement: PlacementConfig::default(),
            composite: None,
            catalog: CatalogConfig {
                entries: vec![
                    CatalogEntryConfig {
                        item_id: "player".to_string(),
                        anchors: vec![],
                    },
                    CatalogEntryConfig {
                        item_id: "fallback".to_string(),
                        anchors: vec![],
                    },
                ],
            },
        }
    }
}

impl SessionConfig {
    /// Parses a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Checks values serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate_hz == 0 {
            return Err(ConfigError::Invalid("tick_rate_hz must be > 0".into()));
        }
        if self.round.play_scene.is_empty() {
            return Err(ConfigError::Invalid("round.play_scene is empty".into()));
        }
        check_secs("round.timeout_secs", self.round.timeout_secs)?;
        check_secs("round.revive_delay_secs", self.round.revive_delay_secs)?;
        check_secs("transition.cue_duration_secs", self.transition.cue_duration_secs)?;
        check_secs("placement.settle_delay_secs", self.placement.settle_delay_secs)?;
        Ok(())
    }

    /// Duration of one host update.
    pub fn tick(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate_hz.max(1) as f64)
    }
}

fn check_secs(name: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::Invalid(format!("{} must be a finite, non-negative number", name)));
    }
    Ok(())
}

/// Converts validated seconds to a `Duration`; bad values collapse to zero.
pub(crate) fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// Round timer and survival check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundConfig {
    /// Entering this scene starts the countdown
    pub play_scene: String,

    /// Fallback hand-off destination when no orchestrator is present
    pub destination_scene: String,

    /// Scenes in which peers show the countdown
    pub tracked_scenes: Vec<String>,

    /// Countdown length (default: 300)
    pub timeout_secs: f64,

    /// Delay between elimination and revival (default: 3)
    pub revive_delay_secs: f64,

    /// Survival volume; absent means nobody survives
    pub region: Option<SurvivalRegion>,

    /// Catalog item spawned for each connecting player
    pub player_item: String,

    /// Health given to player entities
    pub player_max_health: f32,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            play_scene: "arena".to_string(),
            destination_scene: "lobby".to_string(),
            tracked_scenes: vec!["arena".to_string()],
            timeout_secs: 300.0,
            revive_delay_secs: 3.0,
            region: None,
            player_item: "player".to_string(),
            player_max_health: 100.0,
        }
    }
}

impl RoundConfig {
    pub fn timeout(&self) -> Duration {
        secs(self.timeout_secs)
    }

    pub fn revive_delay(&self) -> Duration {
        secs(self.revive_delay_secs)
    }

    pub fn is_tracked(&self, scene: &str) -> bool {
        self.tracked_scenes.iter().any(|s| s == scene)
    }
}

/// Scene transition choreography.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionConfig {
    /// How long the closing cue holds before the load is issued (default: 1.5)
    pub cue_duration_secs: f64,

    pub load_mode: LoadMode,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            cue_duration_secs: 1.5,
            load_mode: LoadMode::Single,
        }
    }
}

impl TransitionConfig {
    pub fn cue_duration(&self) -> Duration {
        secs(self.cue_duration_secs)
    }
}

/// Placeholder conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Wait after scene entry before converting (default: 1)
    pub settle_delay_secs: f64,

    /// Item used when a placeholder's id is not in the catalog
    pub fallback_item: String,

    /// Destroy converted entities when their scene unloads
    pub destroy_with_scene: bool,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            settle_delay_secs: 1.0,
            fallback_item: "fallback".to_string(),
            destroy_with_scene: true,
        }
    }
}

impl PlacementConfig {
    pub fn settle_delay(&self) -> Duration {
        secs(self.settle_delay_secs)
    }
}

/// A root entity plus parts mounted on its anchors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeConfig {
    pub root_item: String,

    #[serde(default)]
    pub root_pose: Pose,

    #[serde(default)]
    pub root_destroy_with_scene: bool,

    /// Used for the root or a part whose item is not in the catalog
    #[serde(default)]
    pub fallback_item: Option<String>,

    #[serde(default)]
    pub parts: Vec<PartConfig>,
}

/// One dependent part of a composite structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartConfig {
    /// Anchor name on the root template
    pub anchor: String,

    pub item: String,

    #[serde(default)]
    pub destroy_with_scene: bool,
}

/// Catalog contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub entries: Vec<CatalogEntryConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntryConfig {
    pub item_id: String,

    #[serde(default)]
    pub anchors: Vec<Anchor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.tick_rate_hz, 30);
        assert_eq!(config.round.timeout(), Duration::from_secs(300));
        assert_eq!(config.round.revive_delay(), Duration::from_secs(3));
        assert_eq!(config.transition.cue_duration(), Duration::from_millis(1500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{
            "round": {
                "timeout_secs": 60,
                "region": { "shape": "box", "center": [0, 0, 0], "half_extents": [5, 5, 5] }
            }
        }"#;
        let config = SessionConfig::from_json_str(json).unwrap();

        assert_eq!(config.round.timeout(), Duration::from_secs(60));
        assert_eq!(config.round.play_scene, "arena");
        assert!(config.round.region.is_some());
        assert_eq!(config.placement.fallback_item, "fallback");
    }

    #[test]
    fn test_negative_duration_rejected() {
        let json = r#"{ "round": { "revive_delay_secs": -1 } }"#;
        assert!(matches!(
            SessionConfig::from_json_str(json),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        assert!(matches!(
            SessionConfig::from_json_str("{ round: "),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_composite_section() {
        let json = r#"{
            "composite": {
                "root_item": "ship",
                "parts": [ { "anchor": "mast", "item": "flag" } ]
            }
        }"#;
        let config = SessionConfig::from_json_str(json).unwrap();
        let composite = config.composite.unwrap();
        assert_eq!(composite.parts.len(), 1);
        assert!(!composite.parts[0].destroy_with_scene);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            SessionConfig::load("/definitely/not/here.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
