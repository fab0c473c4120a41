//! Session registry: trains cohort models and owns the live sessions.
//!
//! The registry is a clone-safe handle. Training and frame processing are
//! CPU bound and run on the blocking pool; the async side only does map
//! bookkeeping and lock management. Each session sits behind its own mutex,
//! so slow frames in one cohort never stall another.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use rollcall_core::classifier::{self, TrainingSet};
use rollcall_core::detector::FaceDetector;
use rollcall_core::{codec, FeatureSample, Model, FEATURE_DIM};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audit::{self, BulkAuditReport};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::session::{FrameReport, RecognitionSession, SessionStats};
use crate::source::TrainingSource;

/// Clone-safe handle to the set of live recognition sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<RecognitionSession>>>>,
    source: Arc<dyn TrainingSource>,
    config: EngineConfig,
}

impl SessionRegistry {
    pub fn new(source: Arc<dyn TrainingSource>, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                source,
                config,
            }),
        }
    }

    /// Train the cohort's model and start a recognition session for it.
    ///
    /// Fails with [`EngineError::NoTrainingData`] when the cohort has no
    /// usable enrollment; a missing or unloadable detector model degrades
    /// the session to center-crop mode instead of failing it.
    pub async fn init_session(
        &self,
        cohort: &str,
        class_start: DateTime<Utc>,
    ) -> Result<Uuid, EngineError> {
        let source = Arc::clone(&self.inner.source);
        let config = self.inner.config.clone();
        let cohort_owned = cohort.to_string();

        // Training inflates and equalizes every stored sample; keep it off
        // the async runtime.
        let (model, detector) = tokio::task::spawn_blocking(move || {
            let model = build_model(source.as_ref(), &cohort_owned, &config)?;
            let detector = load_detector(&config);
            Ok::<_, EngineError>((model, detector))
        })
        .await
        .map_err(|err| EngineError::Task(err.to_string()))??;

        let id = Uuid::new_v4();
        let session = RecognitionSession::new(
            id,
            cohort.to_string(),
            model,
            detector,
            self.inner.config.clone(),
            class_start,
        );
        self.inner
            .sessions
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(session)));
        tracing::info!(session = %id, cohort, "recognition session started");
        Ok(id)
    }

    /// Feed one encoded frame to a session.
    pub async fn process_frame(
        &self,
        id: Uuid,
        frame: Vec<u8>,
    ) -> Result<FrameReport, EngineError> {
        let session = self.lookup(id).await?;
        tokio::task::spawn_blocking(move || {
            let mut guard = session.blocking_lock();
            guard.process_frame(&frame, Utc::now())
        })
        .await
        .map_err(|err| EngineError::Task(err.to_string()))?
    }

    pub async fn session_stats(&self, id: Uuid) -> Result<SessionStats, EngineError> {
        let session = self.lookup(id).await?;
        let stats = session.lock().await.stats();
        Ok(stats)
    }

    /// Stop a session and return its final statistics.
    pub async fn stop_session(&self, id: Uuid) -> Result<SessionStats, EngineError> {
        let session = self
            .inner
            .sessions
            .write()
            .await
            .remove(&id)
            .ok_or(EngineError::SessionNotFound(id))?;
        let stats = session.lock().await.stats();
        tracing::info!(
            session = %id,
            cohort = %stats.cohort,
            marked = stats.identities_marked,
            frames = stats.frames_processed,
            "session stopped"
        );
        Ok(stats)
    }

    /// Reclaim sessions idle past the configured timeout. Returns how many
    /// were removed. A session busy in a frame is skipped, never interrupted;
    /// a later sweep picks it up.
    pub async fn reap_idle(&self) -> usize {
        let timeout = StdDuration::from_secs(self.inner.config.idle_timeout_secs);
        let mut sessions = self.inner.sessions.write().await;
        let stale: Vec<Uuid> = sessions
            .iter()
            .filter_map(|(id, session)| match session.try_lock() {
                Ok(guard) if guard.idle_for() >= timeout => Some(*id),
                _ => None,
            })
            .collect();
        for id in &stale {
            sessions.remove(id);
            tracing::info!(session = %id, "idle session reclaimed");
        }
        stale.len()
    }

    /// Spawn a background task sweeping for idle sessions on an interval.
    pub fn spawn_reaper(&self, every: StdDuration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reaped = registry.reap_idle().await;
                if reaped > 0 {
                    tracing::debug!(reaped, "reaper sweep");
                }
            }
        })
    }

    /// One-shot audit of a class photo against a roster. Trains the cohort
    /// model fresh; no session is created.
    pub async fn bulk_audit(
        &self,
        cohort: &str,
        photo: Vec<u8>,
        roster: Vec<String>,
    ) -> Result<BulkAuditReport, EngineError> {
        let source = Arc::clone(&self.inner.source);
        let config = self.inner.config.clone();
        let cohort = cohort.to_string();
        tokio::task::spawn_blocking(move || {
            let model = build_model(source.as_ref(), &cohort, &config)?;
            let detector = load_detector(&config);
            audit::run_bulk_audit(&model, detector, &photo, &roster)
        })
        .await
        .map_err(|err| EngineError::Task(err.to_string()))?
    }

    async fn lookup(&self, id: Uuid) -> Result<Arc<Mutex<RecognitionSession>>, EngineError> {
        self.inner
            .sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(EngineError::SessionNotFound(id))
    }

    #[cfg(test)]
    pub(crate) async fn session_handle(&self, id: Uuid) -> Option<Arc<Mutex<RecognitionSession>>> {
        self.inner.sessions.read().await.get(&id).cloned()
    }
}

/// Decode every enrolled block of the cohort and train a model. Undecodable
/// or wrong-shape blocks are skipped with a warning rather than failing the
/// whole cohort.
fn build_model(
    source: &dyn TrainingSource,
    cohort: &str,
    config: &EngineConfig,
) -> Result<Model, EngineError> {
    let enrolled = source.load_cohort(cohort)?;

    let mut set = TrainingSet::new();
    for entry in &enrolled {
        let block = match codec::decode(&entry.block) {
            Ok(block) => block,
            Err(err) => {
                tracing::warn!(
                    cohort,
                    identity = %entry.identity,
                    error = %err,
                    "skipping undecodable sample block"
                );
                continue;
            }
        };
        if block.cols() != FEATURE_DIM {
            tracing::warn!(
                cohort,
                identity = %entry.identity,
                cols = block.cols(),
                expected = FEATURE_DIM,
                "skipping sample block with wrong feature width"
            );
            continue;
        }
        let samples: Vec<FeatureSample> = block
            .row_iter()
            .filter_map(|row| FeatureSample::from_pixels(row.to_vec()))
            .collect();
        set.push(entry.identity.clone(), samples);
    }

    if set.is_empty() {
        return Err(EngineError::NoTrainingData { cohort: cohort.to_string() });
    }

    let model = classifier::train(&set, config.classifier_params())
        .map_err(|_| EngineError::NoTrainingData { cohort: cohort.to_string() })?;
    tracing::info!(
        cohort,
        identities = model.identities().len(),
        samples = model.sample_count(),
        "cohort model trained"
    );
    Ok(model)
}

/// Load the detector if a model path is configured and loads cleanly.
/// Failure degrades to center-crop fallback instead of blocking the session.
fn load_detector(config: &EngineConfig) -> Option<FaceDetector> {
    let path = config.detector_model.as_deref()?;
    match FaceDetector::load(path, config.min_face_size) {
        Ok(detector) => Some(detector),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "face detector unavailable; sessions fall back to center crop"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditStatus;
    use crate::source::MemorySource;
    use image::{GrayImage, Luma};
    use rollcall_core::{augment, imaging, SampleBlock};

    const SIDE: u32 = 200;

    fn ramp() -> GrayImage {
        GrayImage::from_fn(SIDE, SIDE, |x, _| Luma([(x * 255 / SIDE) as u8]))
    }

    fn inverted_ramp() -> GrayImage {
        GrayImage::from_fn(SIDE, SIDE, |x, _| Luma([255 - (x * 255 / SIDE) as u8]))
    }

    fn png_bytes(img: &GrayImage) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageLuma8(img.clone())
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn block_for(img: &GrayImage) -> Vec<u8> {
        let region = imaging::fallback_region(img);
        let crop = imaging::crop_region(img, &region).unwrap();
        let sample = imaging::raw_sample(&crop).unwrap();
        let block = SampleBlock::from_samples(&[sample.clone(), sample.clone(), sample]).unwrap();
        codec::encode(&block).unwrap()
    }

    fn registry_with(config: EngineConfig) -> SessionRegistry {
        let mut source = MemorySource::new();
        source.insert("algebra-101", "ana", block_for(&ramp()));
        source.insert("algebra-101", "bo", block_for(&inverted_ramp()));
        SessionRegistry::new(Arc::new(source), config)
    }

    #[tokio::test]
    async fn test_init_session_trains_cohort_model() {
        let registry = registry_with(EngineConfig::default());
        let id = registry.init_session("algebra-101", Utc::now()).await.unwrap();

        let stats = registry.session_stats(id).await.unwrap();
        assert_eq!(stats.cohort, "algebra-101");
        assert_eq!(stats.frames_processed, 0);
        assert_eq!(stats.identities_marked, 0);
    }

    #[tokio::test]
    async fn test_init_unknown_cohort_has_no_training_data() {
        let registry = registry_with(EngineConfig::default());
        let err = registry.init_session("geometry-202", Utc::now()).await.unwrap_err();
        assert!(matches!(err, EngineError::NoTrainingData { .. }));
    }

    #[tokio::test]
    async fn test_truncated_block_excluded_without_failing_cohort() {
        let mut bad = block_for(&inverted_ramp());
        bad.truncate(bad.len() / 2);

        let mut source = MemorySource::new();
        source.insert("algebra-101", "ana", block_for(&ramp()));
        source.insert("algebra-101", "bo", bad);
        let registry = SessionRegistry::new(Arc::new(source), EngineConfig::default());

        // bo's block is unreadable; the cohort still trains on ana alone.
        let id = registry.init_session("algebra-101", Utc::now()).await.unwrap();
        assert!(registry.session_stats(id).await.is_ok());
    }

    #[tokio::test]
    async fn test_all_blocks_corrupt_means_no_training_data() {
        let mut source = MemorySource::new();
        source.insert("algebra-101", "ana", vec![0xde, 0xad, 0xbe, 0xef]);
        let registry = SessionRegistry::new(Arc::new(source), EngineConfig::default());

        let err = registry.init_session("algebra-101", Utc::now()).await.unwrap_err();
        assert!(matches!(err, EngineError::NoTrainingData { .. }));
    }

    #[tokio::test]
    async fn test_frames_drive_marking() {
        let registry = registry_with(EngineConfig::default());
        let id = registry.init_session("algebra-101", Utc::now()).await.unwrap();
        let frame = png_bytes(&ramp());

        for _ in 0..4 {
            let report = registry.process_frame(id, frame.clone()).await.unwrap();
            assert!(report.marking_events.is_empty());
        }
        let report = registry.process_frame(id, frame.clone()).await.unwrap();
        assert_eq!(report.marking_events.len(), 1);
        assert_eq!(report.marking_events[0].identity, "ana");

        let stats = registry.session_stats(id).await.unwrap();
        assert_eq!(stats.identities_marked, 1);
        assert_eq!(stats.frames_processed, 5);
    }

    #[tokio::test]
    async fn test_stop_returns_final_stats_once() {
        let registry = registry_with(EngineConfig::default());
        let id = registry.init_session("algebra-101", Utc::now()).await.unwrap();

        let stats = registry.stop_session(id).await.unwrap();
        assert_eq!(stats.cohort, "algebra-101");

        assert!(matches!(
            registry.stop_session(id).await.unwrap_err(),
            EngineError::SessionNotFound(_)
        ));
        assert!(matches!(
            registry.process_frame(id, Vec::new()).await.unwrap_err(),
            EngineError::SessionNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_unknown_session_id_rejected() {
        let registry = registry_with(EngineConfig::default());
        let err = registry.process_frame(Uuid::new_v4(), Vec::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_reap_idle_reclaims_quiet_sessions() {
        let config = EngineConfig { idle_timeout_secs: 0, ..EngineConfig::default() };
        let registry = registry_with(config);
        let id = registry.init_session("algebra-101", Utc::now()).await.unwrap();

        assert_eq!(registry.reap_idle().await, 1);
        assert!(matches!(
            registry.session_stats(id).await.unwrap_err(),
            EngineError::SessionNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_reap_skips_busy_session() {
        let config = EngineConfig { idle_timeout_secs: 0, ..EngineConfig::default() };
        let registry = registry_with(config);
        let id = registry.init_session("algebra-101", Utc::now()).await.unwrap();

        let handle = registry.session_handle(id).await.unwrap();
        let guard = handle.lock().await;
        assert_eq!(registry.reap_idle().await, 0, "reaped a busy session");
        drop(guard);

        assert_eq!(registry.reap_idle().await, 1);
    }

    #[tokio::test]
    async fn test_bulk_audit_one_outcome_per_roster_member() {
        let registry = registry_with(EngineConfig::default());
        let roster = vec!["ana".to_string(), "bo".to_string(), "cara".to_string()];

        let report = registry
            .bulk_audit("algebra-101", png_bytes(&ramp()), roster)
            .await
            .unwrap();

        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.outcomes[0].identity, "ana");
        assert_eq!(report.outcomes[0].status, AuditStatus::Pass);
        assert_eq!(report.outcomes[1].status, AuditStatus::Fail);
        assert_eq!(report.outcomes[2].status, AuditStatus::Fail);
        assert_eq!(report.pass_count, 1);
        assert_eq!(report.fail_count, 2);
        assert_eq!(report.unmatched_faces, 0);
    }

    #[tokio::test]
    async fn test_augmented_enrollment_blocks_train() {
        use rand::rngs::StdRng;
        use rand::SeedableRng;

        let img = ramp();
        let region = imaging::fallback_region(&img);
        let crop = imaging::crop_region(&img, &region).unwrap();
        let samples = augment::augment(&crop, 10, &mut StdRng::seed_from_u64(5));
        let block = codec::encode(&SampleBlock::from_samples(&samples).unwrap()).unwrap();

        let mut source = MemorySource::new();
        source.insert("algebra-101", "ana", block);
        let registry = SessionRegistry::new(Arc::new(source), EngineConfig::default());

        let id = registry.init_session("algebra-101", Utc::now()).await.unwrap();
        assert!(registry.session_stats(id).await.is_ok());
    }

    #[tokio::test]
    async fn test_spawn_reaper_sweeps_in_background() {
        let config = EngineConfig { idle_timeout_secs: 0, ..EngineConfig::default() };
        let registry = registry_with(config);
        let id = registry.init_session("algebra-101", Utc::now()).await.unwrap();

        let reaper = registry.spawn_reaper(StdDuration::from_millis(10));
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        reaper.abort();

        assert!(registry.session_handle(id).await.is_none());
    }
}
