use std::path::PathBuf;

use rollcall_core::classifier::{
    ClassifierParams, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_MAX_MATCH_DISTANCE,
};

/// Consecutive positive frames required before an identity is marked.
const DEFAULT_FRAME_CONFIRMATION: u32 = 5;
/// Grace window after class start; marks beyond it are Late.
const DEFAULT_LATE_AFTER_MINUTES: i64 = 30;
/// Detections smaller than this edge length (pixels) are discarded.
const DEFAULT_MIN_FACE_SIZE: u32 = 50;
/// A session with no frame activity for this long is reclaimable.
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
/// An unmarked identity unseen for this long loses its track.
const DEFAULT_TRACK_EXPIRY_SECS: u64 = 60;

/// Engine configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the ONNX face detection model. `None` runs sessions in
    /// degraded mode: the frame's center crop stands in for detection.
    pub detector_model: Option<PathBuf>,
    /// Minimum classifier confidence for a positive recognition.
    pub confidence_threshold: f32,
    /// Maximum nearest-neighbor distance for a positive recognition.
    pub max_match_distance: f32,
    /// Consecutive positive frames before an identity is marked.
    pub frame_confirmation: u32,
    /// Minutes after class start before a mark counts as Late.
    pub late_after_minutes: i64,
    /// Minimum face edge length in pixels.
    pub min_face_size: u32,
    /// Seconds of inactivity before a session is reclaimable.
    pub idle_timeout_secs: u64,
    /// Seconds before an unmarked identity's track expires.
    pub track_expiry_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            detector_model: None,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            max_match_distance: DEFAULT_MAX_MATCH_DISTANCE,
            frame_confirmation: DEFAULT_FRAME_CONFIRMATION,
            late_after_minutes: DEFAULT_LATE_AFTER_MINUTES,
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            track_expiry_secs: DEFAULT_TRACK_EXPIRY_SECS,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            detector_model: std::env::var("ROLLCALL_DETECTOR_MODEL")
                .ok()
                .map(PathBuf::from),
            confidence_threshold: env_f32(
                "ROLLCALL_CONFIDENCE_THRESHOLD",
                defaults.confidence_threshold,
            ),
            max_match_distance: env_f32(
                "ROLLCALL_MAX_MATCH_DISTANCE",
                defaults.max_match_distance,
            ),
            frame_confirmation: env_u32(
                "ROLLCALL_FRAME_CONFIRMATION",
                defaults.frame_confirmation,
            ),
            late_after_minutes: env_i64(
                "ROLLCALL_LATE_AFTER_MINUTES",
                defaults.late_after_minutes,
            ),
            min_face_size: env_u32("ROLLCALL_MIN_FACE_SIZE", defaults.min_face_size),
            idle_timeout_secs: env_u64("ROLLCALL_IDLE_TIMEOUT_SECS", defaults.idle_timeout_secs),
            track_expiry_secs: env_u64("ROLLCALL_TRACK_EXPIRY_SECS", defaults.track_expiry_secs),
        }
    }

    /// Decision parameters handed to the classifier.
    pub fn classifier_params(&self) -> ClassifierParams {
        ClassifierParams {
            confidence_threshold: self.confidence_threshold,
            max_match_distance: self.max_match_distance,
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.detector_model.is_none());
        assert_eq!(config.confidence_threshold, DEFAULT_CONFIDENCE_THRESHOLD);
        assert_eq!(config.max_match_distance, DEFAULT_MAX_MATCH_DISTANCE);
        assert_eq!(config.frame_confirmation, 5);
        assert_eq!(config.late_after_minutes, 30);
        assert_eq!(config.min_face_size, 50);
    }

    #[test]
    fn test_classifier_params_mirror_config() {
        let config = EngineConfig {
            confidence_threshold: 0.9,
            max_match_distance: 1234.0,
            ..EngineConfig::default()
        };
        let params = config.classifier_params();
        assert_eq!(params.confidence_threshold, 0.9);
        assert_eq!(params.max_match_distance, 1234.0);
    }

    #[test]
    fn test_env_helpers_fall_back_on_garbage() {
        // Keys chosen to never collide with real ROLLCALL_* settings.
        std::env::set_var("ROLLCALL_TEST_BAD_F32", "not-a-number");
        assert_eq!(env_f32("ROLLCALL_TEST_BAD_F32", 0.5), 0.5);
        assert_eq!(env_u64("ROLLCALL_TEST_UNSET_U64", 7), 7);

        std::env::set_var("ROLLCALL_TEST_GOOD_U32", "9");
        assert_eq!(env_u32("ROLLCALL_TEST_GOOD_U32", 1), 9);
    }
}
