use serde::{Deserialize, Serialize};

/// Side length of the normalized face grid fed to the classifier.
pub const GRID_SIZE: usize = 50;

/// Flattened feature dimension: one byte per grid pixel.
pub const FEATURE_DIM: usize = GRID_SIZE * GRID_SIZE;

/// One normalized face sample: `GRID_SIZE` × `GRID_SIZE` intensities, row-major.
///
/// The constructor enforces the dimension, so every sample in a training set
/// is directly comparable to every query without further length checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSample {
    pixels: Vec<u8>,
}

impl FeatureSample {
    /// Wrap row-major pixels. Returns `None` unless exactly `FEATURE_DIM` bytes.
    pub fn from_pixels(pixels: Vec<u8>) -> Option<Self> {
        (pixels.len() == FEATURE_DIM).then_some(Self { pixels })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }
}

/// Bounding box for a detected face within a source image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedFace {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector score in [0, 1]. Zero for the whole-image fallback region.
    pub score: f32,
}

impl DetectedFace {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }
}

/// Outcome of classifying one normalized sample against a trained model.
///
/// `identity` is `Some` only when both decision gates passed; the observed
/// confidence and nearest-neighbor distance are reported either way, so a
/// negative result still tells the caller how close it came.
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub identity: Option<String>,
    /// Derived score in [0, 1].
    pub confidence: f32,
    /// Euclidean distance to the nearest training sample.
    pub distance: f32,
}
