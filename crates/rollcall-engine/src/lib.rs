//! rollcall-engine: cohort attendance sessions over the recognition core.
//!
//! The engine trains one classifier per cohort from enrolled sample blocks,
//! runs live recognition sessions that turn frame streams into marking
//! events, and audits class photos against rosters. Storage of enrollment
//! data and attendance records stays behind the [`source::TrainingSource`]
//! seam and the caller respectively.

pub mod audit;
pub mod config;
pub mod error;
pub mod registry;
pub mod session;
pub mod source;
pub mod track;

pub use audit::{
    apply_manual_audit, AuditDecision, AuditOutcome, AuditRecord, AuditStatus, BulkAuditReport,
};
pub use config::EngineConfig;
pub use error::EngineError;
pub use registry::SessionRegistry;
pub use session::{FaceObservation, FrameReport, SessionStats};
pub use source::{EnrolledIdentity, MemorySource, SourceError, TrainingSource};
pub use track::{AttendanceStatus, MarkingEvent};
