//! k-nearest-neighbor identity classifier over normalized face samples.
//!
//! Training flattens every stored sample into one f32 matrix; classification
//! is a full scan for the k nearest rows with an inverse-distance-weighted
//! vote. Two independent gates decide whether the winning identity counts as
//! a positive: the derived confidence and the raw nearest-neighbor distance.

use crate::imaging;
use crate::types::{Classification, FeatureSample, FEATURE_DIM};
use ndarray::{Array2, ArrayView1};
use thiserror::Error;

// --- Named constants (no magic numbers) ---
/// Upper bound on k; the effective k is min(K_NEIGHBORS, sample count).
const K_NEIGHBORS: usize = 5;
/// Distance floor keeping inverse-distance vote weights finite, so an exact
/// match dominates the ballot without dividing by zero.
const MIN_NEIGHBOR_DISTANCE: f32 = 1e-3;

/// Default confidence gate.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.70;
/// Default nearest-neighbor distance gate, in Euclidean units over
/// [`FEATURE_DIM`]-dimensional 0-255 intensity vectors.
pub const DEFAULT_MAX_MATCH_DISTANCE: f32 = 4000.0;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("training set contains no samples")]
    EmptyTrainingSet,
}

/// Tunable decision parameters.
///
/// The defaults are calibrated for Euclidean distance over the raw feature
/// grid. Both numbers must be re-derived if the feature representation or
/// the distance metric changes; they are deployment settings, not universal
/// constants.
#[derive(Debug, Clone, Copy)]
pub struct ClassifierParams {
    pub confidence_threshold: f32,
    pub max_match_distance: f32,
}

impl Default for ClassifierParams {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            max_match_distance: DEFAULT_MAX_MATCH_DISTANCE,
        }
    }
}

/// Per-cohort training data: identity label to its stored samples.
#[derive(Debug, Default)]
pub struct TrainingSet {
    entries: Vec<(String, Vec<FeatureSample>)>,
}

impl TrainingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add samples for one identity, merging with any earlier push for it.
    pub fn push(&mut self, identity: impl Into<String>, samples: Vec<FeatureSample>) {
        let identity = identity.into();
        match self.entries.iter_mut().find(|(id, _)| *id == identity) {
            Some((_, existing)) => existing.extend(samples),
            None => self.entries.push((identity, samples)),
        }
    }

    pub fn identity_count(&self) -> usize {
        self.entries.iter().filter(|(_, s)| !s.is_empty()).count()
    }

    pub fn sample_count(&self) -> usize {
        self.entries.iter().map(|(_, s)| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count() == 0
    }
}

/// Immutable trained model. Safe to share and query from any thread.
#[derive(Debug)]
pub struct Model {
    /// Equalized samples, one row each.
    features: Array2<f32>,
    /// Row index to identity index.
    labels: Vec<u32>,
    identities: Vec<String>,
    k: usize,
    params: ClassifierParams,
}

/// Train a model over the set. Stored samples are histogram-equalized here so
/// they meet equalized query samples on the same footing.
pub fn train(set: &TrainingSet, params: ClassifierParams) -> Result<Model, TrainError> {
    let n = set.sample_count();
    if n == 0 {
        return Err(TrainError::EmptyTrainingSet);
    }

    let mut features = Array2::<f32>::zeros((n, FEATURE_DIM));
    let mut labels = Vec::with_capacity(n);
    let mut identities = Vec::new();

    let mut row = 0usize;
    for (identity, samples) in &set.entries {
        if samples.is_empty() {
            continue;
        }
        let label = identities.len() as u32;
        identities.push(identity.clone());
        for sample in samples {
            let mut pixels = sample.pixels().to_vec();
            imaging::equalize(&mut pixels);
            for (col, &p) in pixels.iter().enumerate() {
                features[[row, col]] = p as f32;
            }
            labels.push(label);
            row += 1;
        }
    }

    let k = K_NEIGHBORS.min(n);
    tracing::debug!(
        identities = identities.len(),
        samples = n,
        k,
        "trained k-NN classifier"
    );

    Ok(Model { features, labels, identities, k, params })
}

impl Model {
    /// Classify one normalized (equalized) query sample.
    pub fn classify(&self, sample: &FeatureSample) -> Classification {
        let query: Vec<f32> = sample.pixels().iter().map(|&p| p as f32).collect();

        let mut dists: Vec<(f32, u32)> = Vec::with_capacity(self.labels.len());
        for (row, &label) in self.labels.iter().enumerate() {
            dists.push((euclidean(self.features.row(row), &query), label));
        }
        dists.sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let neighbors = &dists[..self.k.min(dists.len())];
        let nearest = neighbors[0].0;

        // Inverse-distance vote over the k nearest.
        let mut votes = vec![0.0f32; self.identities.len()];
        let mut ballot = 0.0f32;
        for &(d, label) in neighbors {
            let weight = 1.0 / d.max(MIN_NEIGHBOR_DISTANCE);
            votes[label as usize] += weight;
            ballot += weight;
        }

        let mut best = 0usize;
        for (i, &mass) in votes.iter().enumerate().skip(1) {
            if mass > votes[best] {
                best = i;
            }
        }
        let agreement = if ballot > 0.0 { votes[best] / ballot } else { 0.0 };

        // Scale agreement by how far the nearest neighbor sits below the bound.
        let headroom = if self.params.max_match_distance > 0.0 {
            ((self.params.max_match_distance - nearest) / self.params.max_match_distance)
                .clamp(0.0, 1.0)
        } else {
            0.0
        };
        let confidence = agreement * headroom;

        let positive = confidence >= self.params.confidence_threshold
            && nearest <= self.params.max_match_distance;

        Classification {
            identity: positive.then(|| self.identities[best].clone()),
            confidence,
            distance: nearest,
        }
    }

    pub fn identities(&self) -> &[String] {
        &self.identities
    }

    pub fn sample_count(&self) -> usize {
        self.labels.len()
    }

    pub fn k(&self) -> usize {
        self.k
    }
}

fn euclidean(row: ArrayView1<f32>, query: &[f32]) -> f32 {
    row.iter()
        .zip(query)
        .map(|(a, b)| (a - b).powi(2))
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Constant-intensity sample: equalization leaves it unchanged, so
    /// distances between two constants are exactly |a - b| * GRID_SIZE.
    fn flat(value: u8) -> FeatureSample {
        FeatureSample::from_pixels(vec![value; FEATURE_DIM]).unwrap()
    }

    fn set_of(entries: &[(&str, u8, usize)]) -> TrainingSet {
        let mut set = TrainingSet::new();
        for &(identity, value, count) in entries {
            set.push(identity, (0..count).map(|_| flat(value)).collect());
        }
        set
    }

    #[test]
    fn test_empty_set_rejected() {
        let err = train(&TrainingSet::new(), ClassifierParams::default()).unwrap_err();
        assert!(matches!(err, TrainError::EmptyTrainingSet));
    }

    #[test]
    fn test_push_only_empty_vecs_still_rejected() {
        let mut set = TrainingSet::new();
        set.push("ghost", Vec::new());
        assert!(set.is_empty());
        assert!(train(&set, ClassifierParams::default()).is_err());
    }

    #[test]
    fn test_identical_sample_high_confidence() {
        let set = set_of(&[("ana", 60, 6), ("bo", 200, 6)]);
        let model = train(&set, ClassifierParams::default()).unwrap();

        let result = model.classify(&flat(60));
        assert_eq!(result.identity.as_deref(), Some("ana"));
        assert!(result.confidence >= DEFAULT_CONFIDENCE_THRESHOLD, "conf {}", result.confidence);
        assert!(result.distance < 1.0, "distance {}", result.distance);
    }

    #[test]
    fn test_identical_sample_matches_even_in_tiny_cohort() {
        // One sample per identity: k = 2, but the exact match's inverse-distance
        // weight dominates the vote.
        let set = set_of(&[("ana", 60, 1), ("bo", 200, 1)]);
        let model = train(&set, ClassifierParams::default()).unwrap();
        assert_eq!(model.k(), 2);

        let result = model.classify(&flat(60));
        assert_eq!(result.identity.as_deref(), Some("ana"));
        assert!(result.confidence >= DEFAULT_CONFIDENCE_THRESHOLD, "conf {}", result.confidence);
    }

    #[test]
    fn test_distance_gate_rejects_far_query() {
        let set = set_of(&[("ana", 230, 6)]);
        let model = train(&set, ClassifierParams::default()).unwrap();

        // |230 - 100| * 50 = 6500, past the 4000 bound.
        let result = model.classify(&flat(100));
        assert!(result.identity.is_none());
        assert!((result.distance - 6500.0).abs() < 1.0, "distance {}", result.distance);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_split_vote_fails_confidence_gate() {
        // Two identities equidistant from the query: the vote splits evenly,
        // so agreement ~0.5 and the confidence gate rejects.
        let set = set_of(&[("ana", 100, 2), ("bo", 104, 2)]);
        let model = train(&set, ClassifierParams::default()).unwrap();

        let result = model.classify(&flat(102));
        assert!(result.identity.is_none());
        assert!(result.confidence < DEFAULT_CONFIDENCE_THRESHOLD);
        // Both neighbors sit at |2| * 50 = 100.
        assert!((result.distance - 100.0).abs() < 1.0);
    }

    #[test]
    fn test_k_caps_at_sample_count() {
        let set = set_of(&[("solo", 90, 3)]);
        let model = train(&set, ClassifierParams::default()).unwrap();
        assert_eq!(model.k(), 3);
        assert_eq!(model.sample_count(), 3);
    }

    #[test]
    fn test_confidence_bounded() {
        let set = set_of(&[("ana", 60, 6), ("bo", 130, 6)]);
        let model = train(&set, ClassifierParams::default()).unwrap();
        for value in [0u8, 60, 95, 130, 255] {
            let result = model.classify(&flat(value));
            assert!((0.0..=1.0).contains(&result.confidence), "conf {}", result.confidence);
        }
    }

    #[test]
    fn test_custom_params_respected() {
        let set = set_of(&[("ana", 60, 6)]);
        // Tight distance bound: even a 500-unit query must fail.
        let params = ClassifierParams { confidence_threshold: 0.7, max_match_distance: 400.0 };
        let model = train(&set, params).unwrap();

        let result = model.classify(&flat(70)); // distance 500
        assert!(result.identity.is_none());

        let exact = model.classify(&flat(60));
        assert_eq!(exact.identity.as_deref(), Some("ana"));
    }

    #[test]
    fn test_merged_pushes_for_same_identity() {
        let mut set = TrainingSet::new();
        set.push("ana", vec![flat(60); 2]);
        set.push("ana", vec![flat(62); 2]);
        assert_eq!(set.identity_count(), 1);
        assert_eq!(set.sample_count(), 4);

        let model = train(&set, ClassifierParams::default()).unwrap();
        assert_eq!(model.identities(), &["ana".to_string()]);
    }
}
