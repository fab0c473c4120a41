//! Attendance audits: one-shot class-photo sweeps and manual overrides.
//!
//! A bulk audit treats a single photo as ground truth for a whole roster:
//! every face in the photo is classified, then each roster member gets
//! exactly one outcome. Manual audit decisions are pure record rewrites;
//! persistence stays with the caller.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use image::GrayImage;
use rollcall_core::detector::FaceDetector;
use rollcall_core::{imaging, DetectedFace, Model};
use serde::Serialize;

use crate::error::EngineError;

/// Audit state carried on an attendance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Unaudited,
    Pass,
    Fail,
}

/// Reviewer decision applied to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditDecision {
    Pass,
    Fail,
    /// Withdraw an earlier decision, returning the record to Unaudited.
    Revoke,
}

/// Review trail for one attendance record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub status: AuditStatus,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl AuditRecord {
    pub fn unaudited() -> Self {
        Self { status: AuditStatus::Unaudited, decided_by: None, decided_at: None }
    }
}

/// Apply a reviewer decision to a record.
///
/// Every decision stamps the actor and time, including Revoke: a withdrawn
/// decision still shows who withdrew it.
pub fn apply_manual_audit(
    current: &AuditRecord,
    decision: AuditDecision,
    actor: &str,
    at: DateTime<Utc>,
) -> AuditRecord {
    let status = match decision {
        AuditDecision::Pass => AuditStatus::Pass,
        AuditDecision::Fail => AuditStatus::Fail,
        AuditDecision::Revoke => AuditStatus::Unaudited,
    };
    tracing::debug!(from = ?current.status, to = ?status, actor, "manual audit decision");
    AuditRecord {
        status,
        decided_by: Some(actor.to_string()),
        decided_at: Some(at),
    }
}

/// Per-roster-member outcome of a bulk audit.
#[derive(Debug, Clone, Serialize)]
pub struct AuditOutcome {
    pub identity: String,
    pub status: AuditStatus,
    /// Zero when the member was not found in the photo.
    pub confidence: f32,
    pub message: String,
}

/// Result of auditing one class photo against a roster.
#[derive(Debug, Serialize)]
pub struct BulkAuditReport {
    /// One outcome per roster member, in roster order.
    pub outcomes: Vec<AuditOutcome>,
    /// Face regions examined, including the center-crop fallback when the
    /// detector found none.
    pub faces_detected: usize,
    /// Examined regions that matched nobody on the roster's cohort model.
    pub unmatched_faces: usize,
    pub pass_count: usize,
    pub fail_count: usize,
}

/// Audit a class photo: classify every face, then resolve the roster so each
/// member gets exactly one outcome.
///
/// There is no multi-frame confirmation here; the classifier's confidence
/// and distance gates are the only defense against a lookalike passing, so
/// a single photo trades recall safety for convenience.
pub fn run_bulk_audit(
    model: &Model,
    mut detector: Option<FaceDetector>,
    photo: &[u8],
    roster: &[String],
) -> Result<BulkAuditReport, EngineError> {
    let gray = imaging::decode_frame(photo)?;

    let mut regions = match detector.as_mut() {
        Some(detector) => detector.detect(&gray)?,
        None => Vec::new(),
    };
    if regions.is_empty() {
        regions.push(imaging::fallback_region(&gray));
    }

    Ok(audit_regions(model, &gray, &regions, roster))
}

/// Classification and roster resolution over already-detected regions.
fn audit_regions(
    model: &Model,
    gray: &GrayImage,
    regions: &[DetectedFace],
    roster: &[String],
) -> BulkAuditReport {
    let matched = classify_regions(model, gray, regions);
    let unmatched_faces = regions.len().saturating_sub(matched.len());
    let outcomes = resolve_roster(&matched, roster);

    let pass_count = outcomes.iter().filter(|o| o.status == AuditStatus::Pass).count();
    let fail_count = outcomes.len() - pass_count;
    tracing::info!(
        faces = regions.len(),
        unmatched = unmatched_faces,
        pass = pass_count,
        fail = fail_count,
        "bulk audit complete"
    );

    BulkAuditReport {
        outcomes,
        faces_detected: regions.len(),
        unmatched_faces,
        pass_count,
        fail_count,
    }
}

/// Best positive confidence per identity across the photo's regions. Two
/// regions claiming the same identity collapse to the higher confidence;
/// equal confidence keeps the earlier region.
fn classify_regions(
    model: &Model,
    gray: &GrayImage,
    regions: &[DetectedFace],
) -> HashMap<String, f32> {
    let mut matched: HashMap<String, f32> = HashMap::new();
    for region in regions {
        let Some(sample) = imaging::extract_features(gray, region) else {
            continue;
        };
        let result = model.classify(&sample);
        if let Some(identity) = result.identity {
            let entry = matched.entry(identity).or_insert(result.confidence);
            if result.confidence > *entry {
                *entry = result.confidence;
            }
        }
    }
    matched
}

/// One outcome per roster member, in roster order. Absent members fail with
/// zero confidence rather than being dropped.
fn resolve_roster(matched: &HashMap<String, f32>, roster: &[String]) -> Vec<AuditOutcome> {
    roster
        .iter()
        .map(|identity| match matched.get(identity) {
            Some(&confidence) => AuditOutcome {
                identity: identity.clone(),
                status: AuditStatus::Pass,
                confidence,
                message: format!("verified at {:.0}% confidence", confidence * 100.0),
            },
            None => AuditOutcome {
                identity: identity.clone(),
                status: AuditStatus::Fail,
                confidence: 0.0,
                message: "not detected in audit photo".to_string(),
            },
        })
        .collect()
}
