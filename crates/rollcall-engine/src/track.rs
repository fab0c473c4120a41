//! Per-identity confirmation tracking.
//!
//! A single-frame recognition is treated as noise until it repeats: an
//! identity is marked only after an unbroken run of positive frames, and one
//! missed frame cancels the run. Marked is terminal for the session, so each
//! identity produces at most one marking event.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    /// No confirmation run in progress.
    Unseen,
    /// Recognized on this many consecutive frames, not yet confirmed.
    Candidate(u32),
    /// Confirmed and marked. Terminal.
    Marked,
}

#[derive(Debug)]
pub struct TrackedIdentity {
    state: TrackState,
    last_seen: DateTime<Utc>,
    hits: u64,
}

impl TrackedIdentity {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { state: TrackState::Unseen, last_seen: now, hits: 0 }
    }

    /// Record a positive frame. Returns true exactly once, on the frame where
    /// the run reaches `required` and the identity transitions to Marked.
    pub fn observe_hit(&mut self, now: DateTime<Utc>, required: u32) -> bool {
        self.last_seen = now;
        self.hits += 1;
        match self.state {
            TrackState::Marked => false,
            TrackState::Unseen | TrackState::Candidate(_) => {
                let run = match self.state {
                    TrackState::Candidate(n) => n + 1,
                    _ => 1,
                };
                if run >= required.max(1) {
                    self.state = TrackState::Marked;
                    true
                } else {
                    self.state = TrackState::Candidate(run);
                    false
                }
            }
        }
    }

    /// Record a frame where the identity was not positively recognized.
    pub fn observe_miss(&mut self) {
        if let TrackState::Candidate(_) = self.state {
            self.state = TrackState::Unseen;
        }
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn is_marked(&self) -> bool {
        matches!(self.state, TrackState::Marked)
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    /// Total positive frames, across all runs.
    pub fn hits(&self) -> u64 {
        self.hits
    }
}

/// Whether a marked identity arrived inside the grace window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Late,
}

/// Emitted once per identity per session, at the moment of confirmation.
#[derive(Debug, Clone, Serialize)]
pub struct MarkingEvent {
    pub identity: String,
    pub status: AttendanceStatus,
    /// Confidence of the recognition on the confirming frame.
    pub confidence: f32,
    pub distance: f32,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const REQUIRED: u32 = 5;

    fn t0() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_new_track_is_unseen() {
        let track = TrackedIdentity::new(t0());
        assert_eq!(track.state(), TrackState::Unseen);
        assert!(!track.is_marked());
        assert_eq!(track.hits(), 0);
    }

    #[test]
    fn test_marks_on_exactly_the_required_frame() {
        let mut track = TrackedIdentity::new(t0());
        for i in 1..REQUIRED {
            assert!(!track.observe_hit(t0(), REQUIRED), "marked early at frame {i}");
            assert_eq!(track.state(), TrackState::Candidate(i));
        }
        assert!(track.observe_hit(t0(), REQUIRED));
        assert!(track.is_marked());
    }

    #[test]
    fn test_marked_is_terminal() {
        let mut track = TrackedIdentity::new(t0());
        for _ in 0..REQUIRED {
            track.observe_hit(t0(), REQUIRED);
        }
        assert!(track.is_marked());
        assert!(!track.observe_hit(t0(), REQUIRED), "second marking event");
        track.observe_miss();
        assert!(track.is_marked(), "miss demoted a marked identity");
        assert_eq!(track.hits(), (REQUIRED + 1) as u64);
    }

    #[test]
    fn test_single_miss_resets_the_run() {
        let mut track = TrackedIdentity::new(t0());
        for _ in 0..REQUIRED - 1 {
            track.observe_hit(t0(), REQUIRED);
        }
        assert_eq!(track.state(), TrackState::Candidate(REQUIRED - 1));

        track.observe_miss();
        assert_eq!(track.state(), TrackState::Unseen);

        // The run restarts from scratch: marking now takes the full count.
        for i in 1..REQUIRED {
            assert!(!track.observe_hit(t0(), REQUIRED), "marked early at frame {i}");
        }
        assert!(track.observe_hit(t0(), REQUIRED));
    }

    #[test]
    fn test_miss_on_unseen_is_noop() {
        let mut track = TrackedIdentity::new(t0());
        track.observe_miss();
        assert_eq!(track.state(), TrackState::Unseen);
    }

    #[test]
    fn test_required_one_marks_immediately() {
        let mut track = TrackedIdentity::new(t0());
        assert!(track.observe_hit(t0(), 1));
        assert!(track.is_marked());
    }

    #[test]
    fn test_required_zero_behaves_as_one() {
        let mut track = TrackedIdentity::new(t0());
        assert!(track.observe_hit(t0(), 0));
    }

    #[test]
    fn test_last_seen_follows_hits() {
        let start = t0();
        let later = start + Duration::seconds(3);
        let mut track = TrackedIdentity::new(start);
        track.observe_hit(later, REQUIRED);
        assert_eq!(track.last_seen(), later);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let event = MarkingEvent {
            identity: "ana".to_string(),
            status: AttendanceStatus::Late,
            confidence: 0.91,
            distance: 350.0,
            at: t0(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "late");
        assert_eq!(json["identity"], "ana");
    }
}
