//! Live recognition session: encoded frames in, marking events out.
//!
//! A session owns its cohort's trained model, an optional detector and the
//! per-identity confirmation tracks. Frame processing is synchronous and CPU
//! bound; the registry keeps it off the async runtime.

use std::collections::HashMap;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use rollcall_core::detector::FaceDetector;
use rollcall_core::{imaging, DetectedFace, Model};
use serde::Serialize;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::track::{AttendanceStatus, MarkingEvent, TrackState, TrackedIdentity};

/// One face region and what the classifier made of it.
#[derive(Debug, Clone, Serialize)]
pub struct FaceObservation {
    pub bounds: DetectedFace,
    /// Recognized identity, if the classification passed both gates.
    pub identity: Option<String>,
    pub confidence: f32,
    pub distance: f32,
}

/// Outcome of processing a single frame.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameReport {
    /// Faces found by the detector on this frame.
    pub faces_detected: usize,
    /// True when no detector face was available and the frame's center crop
    /// stood in.
    pub fallback_used: bool,
    pub observations: Vec<FaceObservation>,
    /// Identities confirmed on this frame. At most one event per identity
    /// per session.
    pub marking_events: Vec<MarkingEvent>,
}

/// Session counters, reported live and at stop.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: Uuid,
    pub cohort: String,
    pub started_at: DateTime<Utc>,
    pub class_start: DateTime<Utc>,
    pub frames_processed: u64,
    pub frames_rejected: u64,
    pub faces_detected: u64,
    pub identities_marked: usize,
    pub present: usize,
    pub late: usize,
    /// Identities currently in an unconfirmed run.
    pub active_tracks: usize,
}

pub(crate) struct RecognitionSession {
    id: Uuid,
    cohort: String,
    model: Model,
    detector: Option<FaceDetector>,
    config: EngineConfig,
    started_at: DateTime<Utc>,
    class_start: DateTime<Utc>,
    tracks: HashMap<String, TrackedIdentity>,
    marked: Vec<MarkingEvent>,
    frames_processed: u64,
    frames_rejected: u64,
    faces_detected: u64,
    last_activity: Instant,
}

impl RecognitionSession {
    pub(crate) fn new(
        id: Uuid,
        cohort: String,
        model: Model,
        detector: Option<FaceDetector>,
        config: EngineConfig,
        class_start: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            cohort,
            model,
            detector,
            config,
            started_at: Utc::now(),
            class_start,
            tracks: HashMap::new(),
            marked: Vec::new(),
            frames_processed: 0,
            frames_rejected: 0,
            faces_detected: 0,
            last_activity: Instant::now(),
        }
    }

    /// Run one frame through detect, classify and track advancement.
    ///
    /// Rejected frames (undecodable bytes, detector failure) return the error
    /// and leave all attendance state untouched; the session stays usable.
    pub(crate) fn process_frame(
        &mut self,
        frame: &[u8],
        now: DateTime<Utc>,
    ) -> Result<FrameReport, EngineError> {
        self.last_activity = Instant::now();

        let gray = match imaging::decode_frame(frame) {
            Ok(gray) => gray,
            Err(err) => {
                self.frames_rejected += 1;
                tracing::warn!(session = %self.id, error = %err, "frame rejected: undecodable");
                return Err(err.into());
            }
        };

        let mut report = FrameReport::default();

        let regions = match &mut self.detector {
            Some(detector) => match detector.detect(&gray) {
                Ok(faces) => faces,
                Err(err) => {
                    self.frames_rejected += 1;
                    tracing::warn!(session = %self.id, error = %err, "frame rejected: detector failure");
                    return Err(err.into());
                }
            },
            None => Vec::new(),
        };

        report.faces_detected = regions.len();
        self.faces_detected += regions.len() as u64;

        let regions = if regions.is_empty() {
            report.fallback_used = true;
            vec![imaging::fallback_region(&gray)]
        } else {
            regions
        };

        // Best positive classification per identity on this frame. Two
        // regions resolving to the same identity advance its run once.
        let mut positives: HashMap<String, (f32, f32)> = HashMap::new();
        for region in &regions {
            let Some(sample) = imaging::extract_features(&gray, region) else {
                continue;
            };
            let result = self.model.classify(&sample);
            if let Some(identity) = &result.identity {
                let entry = positives
                    .entry(identity.clone())
                    .or_insert((result.confidence, result.distance));
                if result.confidence > entry.0 {
                    *entry = (result.confidence, result.distance);
                }
            }
            report.observations.push(FaceObservation {
                bounds: region.clone(),
                identity: result.identity,
                confidence: result.confidence,
                distance: result.distance,
            });
        }

        let grace = Duration::minutes(self.config.late_after_minutes);
        for (identity, &(confidence, distance)) in &positives {
            let track = self
                .tracks
                .entry(identity.clone())
                .or_insert_with(|| TrackedIdentity::new(now));
            if track.observe_hit(now, self.config.frame_confirmation) {
                let status = if now > self.class_start + grace {
                    AttendanceStatus::Late
                } else {
                    AttendanceStatus::Present
                };
                let event = MarkingEvent {
                    identity: identity.clone(),
                    status,
                    confidence,
                    distance,
                    at: now,
                };
                tracing::info!(
                    session = %self.id,
                    cohort = %self.cohort,
                    identity = %identity,
                    status = ?status,
                    confidence,
                    "identity marked"
                );
                self.marked.push(event.clone());
                report.marking_events.push(event);
            }
        }

        // Everyone not recognized on this frame loses any in-progress run.
        for (identity, track) in self.tracks.iter_mut() {
            if !positives.contains_key(identity) {
                track.observe_miss();
            }
        }

        // Stale unmarked tracks expire; marked ones persist for stats.
        let expiry = Duration::seconds(self.config.track_expiry_secs as i64);
        self.tracks
            .retain(|_, track| track.is_marked() || now.signed_duration_since(track.last_seen()) <= expiry);

        self.frames_processed += 1;
        Ok(report)
    }

    pub(crate) fn stats(&self) -> SessionStats {
        let present = self
            .marked
            .iter()
            .filter(|event| event.status == AttendanceStatus::Present)
            .count();
        let active_tracks = self
            .tracks
            .values()
            .filter(|track| matches!(track.state(), TrackState::Candidate(_)))
            .count();
        SessionStats {
            session_id: self.id,
            cohort: self.cohort.clone(),
            started_at: self.started_at,
            class_start: self.class_start,
            frames_processed: self.frames_processed,
            frames_rejected: self.frames_rejected,
            faces_detected: self.faces_detected,
            identities_marked: self.marked.len(),
            present,
            late: self.marked.len() - present,
            active_tracks,
        }
    }

    /// Time since the last `process_frame` call.
    pub(crate) fn idle_for(&self) -> StdDuration {
        self.last_activity.elapsed()
    }
}
