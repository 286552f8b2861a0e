use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::layout;

pub const DEFAULT_FACE_MODEL: &str = "scrfd_500m_bnkps.onnx";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Options recognized by a scan. Snapshotted into the session on every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Max Hamming distance between perceptual hashes of near-duplicates.
    #[serde(alias = "pHashThreshold")]
    pub phash_threshold: u32,
    #[serde(alias = "keepPerCluster")]
    pub keep_per_cluster: usize,
    #[serde(alias = "eventGapHours")]
    pub event_gap_hours: f64,
    #[serde(alias = "faceDetectionEnabled")]
    pub face_detection_enabled: bool,
    /// Byte-identical clusters keep a single copy regardless of `keep_per_cluster`.
    pub exact_duplicates_keep_one: bool,
    /// Singleton photos scoring below this are suggested DELETE instead of KEEP.
    pub singleton_delete_floor: Option<f64>,
    /// IoU above which detections from different scales count as one face.
    pub face_merge_iou: f32,
    /// Faces smaller than this (shorter side, pixels) get no expression signals.
    pub min_expression_face_px: u32,
    /// SCRFD ONNX model for the built-in detector. Falls back to
    /// `<data dir>/photocull/models/scrfd_500m_bnkps.onnx` when unset.
    #[serde(alias = "faceModelPath")]
    pub face_model_path: Option<PathBuf>,
    /// Detections below this confidence are dropped.
    pub face_min_confidence: f32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            phash_threshold: 8,
            keep_per_cluster: 2,
            event_gap_hours: 4.0,
            face_detection_enabled: true,
            exact_duplicates_keep_one: true,
            singleton_delete_floor: None,
            face_merge_iou: 0.3,
            min_expression_face_px: 48,
            face_model_path: None,
            face_min_confidence: 0.5,
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.phash_threshold > 64 {
            return Err(ConfigError::Invalid(format!(
                "phash_threshold must be between 0 and 64, got {}",
                self.phash_threshold
            )));
        }
        if self.keep_per_cluster == 0 {
            return Err(ConfigError::Invalid(
                "keep_per_cluster must be at least 1".to_string(),
            ));
        }
        if !self.event_gap_hours.is_finite() || self.event_gap_hours < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "event_gap_hours must be a non-negative number, got {}",
                self.event_gap_hours
            )));
        }
        if !(0.0..=1.0).contains(&self.face_merge_iou) {
            return Err(ConfigError::Invalid(format!(
                "face_merge_iou must be within 0.0..=1.0, got {}",
                self.face_merge_iou
            )));
        }
        if !(0.0..=1.0).contains(&self.face_min_confidence) {
            return Err(ConfigError::Invalid(format!(
                "face_min_confidence must be within 0.0..=1.0, got {}",
                self.face_min_confidence
            )));
        }
        Ok(())
    }

    /// The face model to load: the configured path, else the default model
    /// location if a file exists there.
    pub fn resolved_face_model(&self) -> Option<PathBuf> {
        if let Some(path) = &self.face_model_path {
            return Some(path.clone());
        }
        dirs::data_dir()
            .map(|dir| dir.join("photocull").join("models").join(DEFAULT_FACE_MODEL))
            .filter(|path| path.is_file())
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ScanConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Resolve the config for `folder`: an explicit file wins, then the
    /// folder's own `.photocull/config.toml`, then the user config dir,
    /// then defaults.
    pub fn load_for_folder(folder: &Path, explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }

        for candidate in config_candidates(folder) {
            if candidate.is_file() {
                log::debug!("Loading scan config from {}", candidate.display());
                return Self::load_from_file(&candidate);
            }
        }

        Ok(Self::default())
    }
}

fn config_candidates(folder: &Path) -> Vec<PathBuf> {
    let mut candidates = vec![layout::state_dir(folder).join(layout::CONFIG_FILE)];
    if let Some(config_dir) = dirs::config_dir() {
        candidates.push(config_dir.join("photocull").join(layout::CONFIG_FILE));
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ScanConfig::default();
        assert_eq!(config.phash_threshold, 8);
        assert_eq!(config.keep_per_cluster, 2);
        assert_eq!(config.event_gap_hours, 4.0);
        assert!(config.face_detection_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ScanConfig::from_toml_str("keep_per_cluster = 1\n").unwrap();
        assert_eq!(config.keep_per_cluster, 1);
        assert_eq!(config.phash_threshold, 8);
    }

    #[test]
    fn test_camel_case_aliases() {
        let config = ScanConfig::from_toml_str(
            "pHashThreshold = 12\nkeepPerCluster = 3\neventGapHours = 1.5\nfaceDetectionEnabled = false\n",
        )
        .unwrap();
        assert_eq!(config.phash_threshold, 12);
        assert_eq!(config.keep_per_cluster, 3);
        assert_eq!(config.event_gap_hours, 1.5);
        assert!(!config.face_detection_enabled);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            ScanConfig::from_toml_str("keep_per_cluster = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ScanConfig::from_toml_str("event_gap_hours = -2.0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ScanConfig::from_toml_str("phash_threshold = \"eight\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_face_model_settings() {
        let config = ScanConfig::from_toml_str(
            "faceModelPath = \"/models/scrfd.onnx\"\nface_min_confidence = 0.6\n",
        )
        .unwrap();
        assert_eq!(config.resolved_face_model(), Some(PathBuf::from("/models/scrfd.onnx")));
        assert_eq!(config.face_min_confidence, 0.6);

        assert!(matches!(
            ScanConfig::from_toml_str("face_min_confidence = 1.5"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_folder_config_file_is_used() {
        let temp_dir = TempDir::new().unwrap();
        let state = layout::ensure_state_dir(temp_dir.path()).unwrap();
        fs::write(state.join(layout::CONFIG_FILE), "phash_threshold = 5\n").unwrap();

        let config = ScanConfig::load_for_folder(temp_dir.path(), None).unwrap();
        assert_eq!(config.phash_threshold, 5);
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope.toml");
        assert!(matches!(
            ScanConfig::load_for_folder(temp_dir.path(), Some(&missing)),
            Err(ConfigError::Io { .. })
        ));
    }
}
