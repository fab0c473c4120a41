//! rollcall-core: attendance recognition primitives.
//!
//! Feature codec for stored face samples, ONNX face detection, pixel-space
//! k-NN identity classification and enrollment-side sample augmentation.

pub mod augment;
pub mod classifier;
pub mod codec;
pub mod detector;
pub mod imaging;
pub mod types;

pub use classifier::{ClassifierParams, Model, TrainingSet};
pub use codec::SampleBlock;
pub use types::{Classification, DetectedFace, FeatureSample, FEATURE_DIM, GRID_SIZE};
