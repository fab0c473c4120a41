use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rollcall_core::detector::FaceDetector;
use rollcall_core::{augment, codec, imaging, DetectedFace, SampleBlock};
use rollcall_engine::{
    EngineConfig, EnrolledIdentity, SessionRegistry, SourceError, TrainingSource,
};

/// File extension for encoded sample blocks.
const BLOCK_EXTENSION: &str = "fsb";

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance recognition CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll one identity from a photo into a cohort directory
    Enroll {
        /// Photo containing the face to enroll
        photo: PathBuf,
        /// Identity label (becomes the block's file name)
        #[arg(short, long)]
        identity: String,
        /// Cohort directory to write the sample block into
        #[arg(short, long)]
        out: PathBuf,
        /// Number of augmented samples to generate
        #[arg(long, default_value_t = augment::DEFAULT_SAMPLE_COUNT)]
        samples: usize,
        /// Seed for reproducible augmentation
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Show the shape and intensity stats of a sample block file
    Inspect {
        /// Sample block file
        file: PathBuf,
    },
    /// Replay frame images through a live session and print marking events
    Replay {
        /// Cohort directory holding enrolled sample blocks
        #[arg(short, long)]
        cohort_dir: PathBuf,
        /// Frame images, in playback order
        #[arg(required = true)]
        frames: Vec<PathBuf>,
        /// Class start time, RFC 3339 (defaults to now)
        #[arg(long)]
        class_start: Option<String>,
        /// Emit the final stats as JSON
        #[arg(long)]
        json: bool,
    },
    /// Audit a class photo against a roster
    Audit {
        /// Cohort directory holding enrolled sample blocks
        #[arg(short, long)]
        cohort_dir: PathBuf,
        /// Class photo to audit
        photo: PathBuf,
        /// Roster file, one identity per line (defaults to all enrolled)
        #[arg(long)]
        roster: Option<PathBuf>,
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Filesystem training source: `<root>/<cohort>/<identity>.fsb`.
struct DirSource {
    root: PathBuf,
}

impl TrainingSource for DirSource {
    fn load_cohort(&self, cohort: &str) -> Result<Vec<EnrolledIdentity>, SourceError> {
        let dir = self.root.join(cohort);
        if !dir.is_dir() {
            return Err(SourceError::CohortNotFound(cohort.to_string()));
        }
        let mut enrolled = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOCK_EXTENSION) {
                continue;
            }
            let Some(identity) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            enrolled.push(EnrolledIdentity {
                identity: identity.to_string(),
                block: fs::read(&path)?,
            });
        }
        enrolled.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(enrolled)
    }
}

/// Split a cohort directory path into the source root and the cohort name.
fn split_cohort_dir(dir: &Path) -> Result<(PathBuf, String)> {
    let dir = dir
        .canonicalize()
        .with_context(|| format!("cohort directory {} not accessible", dir.display()))?;
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .context("cohort directory has no usable name")?
        .to_string();
    let root = dir
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));
    Ok((root, name))
}

fn registry_for(dir: &Path) -> Result<(SessionRegistry, String)> {
    let (root, cohort) = split_cohort_dir(dir)?;
    let registry = SessionRegistry::new(Arc::new(DirSource { root }), EngineConfig::from_env());
    Ok((registry, cohort))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll { photo, identity, out, samples, seed } => {
            run_enroll(&photo, &identity, &out, samples, seed)
        }
        Commands::Inspect { file } => run_inspect(&file),
        Commands::Replay { cohort_dir, frames, class_start, json } => {
            run_replay(&cohort_dir, &frames, class_start.as_deref(), json).await
        }
        Commands::Audit { cohort_dir, photo, roster, json } => {
            run_audit(&cohort_dir, &photo, roster.as_deref(), json).await
        }
    }
}

/// Pick the face to enroll: the largest detector face when a detector is
/// configured, otherwise the photo's center crop.
fn enrollment_region(gray: &image::GrayImage, config: &EngineConfig) -> Result<DetectedFace> {
    let Some(model_path) = config.detector_model.as_deref() else {
        tracing::warn!("ROLLCALL_DETECTOR_MODEL not set; enrolling from the photo's center crop");
        return Ok(imaging::fallback_region(gray));
    };

    let mut detector = FaceDetector::load(model_path, config.min_face_size)?;
    let faces = detector.detect(gray)?;
    let largest = faces
        .into_iter()
        .max_by(|a, b| a.area().total_cmp(&b.area()));
    match largest {
        Some(face) => Ok(face),
        None => {
            tracing::warn!("no face detected; enrolling from the photo's center crop");
            Ok(imaging::fallback_region(gray))
        }
    }
}

fn run_enroll(
    photo: &Path,
    identity: &str,
    out: &Path,
    samples: usize,
    seed: Option<u64>,
) -> Result<()> {
    if samples == 0 {
        bail!("--samples must be at least 1");
    }

    let bytes = fs::read(photo).with_context(|| format!("reading {}", photo.display()))?;
    let gray = imaging::decode_frame(&bytes).context("decoding enrollment photo")?;

    let config = EngineConfig::from_env();
    let region = enrollment_region(&gray, &config)?;
    let crop = imaging::crop_region(&gray, &region)
        .context("face region too small to crop")?;

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let family = augment::augment(&crop, samples, &mut rng);
    if family.is_empty() {
        bail!("augmentation produced no samples");
    }

    let block = SampleBlock::from_samples(&family)?;
    let encoded = codec::encode(&block)?;

    fs::create_dir_all(out).with_context(|| format!("creating {}", out.display()))?;
    let path = out.join(format!("{identity}.{BLOCK_EXTENSION}"));
    fs::write(&path, &encoded).with_context(|| format!("writing {}", path.display()))?;

    println!(
        "enrolled '{}': {} samples ({} bytes) -> {}",
        identity,
        block.rows(),
        encoded.len(),
        path.display()
    );
    Ok(())
}

fn run_inspect(file: &Path) -> Result<()> {
    let bytes = fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let block = codec::decode(&bytes)?;

    let data = block.data();
    let min = data.iter().copied().min().unwrap_or(0);
    let max = data.iter().copied().max().unwrap_or(0);
    let mean = if data.is_empty() {
        0.0
    } else {
        data.iter().map(|&p| p as f64).sum::<f64>() / data.len() as f64
    };

    println!("{}", file.display());
    println!("  samples:   {}", block.rows());
    println!("  features:  {}", block.cols());
    println!("  intensity: min {min}, max {max}, mean {mean:.1}");
    Ok(())
}

async fn run_replay(
    cohort_dir: &Path,
    frames: &[PathBuf],
    class_start: Option<&str>,
    json: bool,
) -> Result<()> {
    let class_start = match class_start {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("invalid --class-start '{raw}'"))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let (registry, cohort) = registry_for(cohort_dir)?;
    let session = registry.init_session(&cohort, class_start).await?;
    println!("session {session} started for cohort '{cohort}'");

    for frame_path in frames {
        let bytes = fs::read(frame_path)
            .with_context(|| format!("reading {}", frame_path.display()))?;
        match registry.process_frame(session, bytes).await {
            Ok(report) => {
                for event in &report.marking_events {
                    println!(
                        "{}  MARKED {} ({:?}, confidence {:.2})",
                        frame_path.display(),
                        event.identity,
                        event.status,
                        event.confidence
                    );
                }
            }
            Err(err) => eprintln!("{}  rejected: {err}", frame_path.display()),
        }
    }

    let stats = registry.stop_session(session).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!(
            "frames {} (rejected {}), marked {} (present {}, late {})",
            stats.frames_processed,
            stats.frames_rejected,
            stats.identities_marked,
            stats.present,
            stats.late
        );
    }
    Ok(())
}

/// Roster from a file (one identity per line, blanks skipped) or, when no
/// file is given, everyone enrolled in the cohort directory.
fn load_roster(roster: Option<&Path>, cohort_dir: &Path) -> Result<Vec<String>> {
    if let Some(path) = roster {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading roster {}", path.display()))?;
        let names: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            bail!("roster {} is empty", path.display());
        }
        return Ok(names);
    }

    let mut names = Vec::new();
    for entry in fs::read_dir(cohort_dir)
        .with_context(|| format!("reading cohort directory {}", cohort_dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(BLOCK_EXTENSION) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            names.push(stem.to_string());
        }
    }
    names.sort();
    if names.is_empty() {
        bail!("no enrolled identities in {}", cohort_dir.display());
    }
    Ok(names)
}

async fn run_audit(
    cohort_dir: &Path,
    photo: &Path,
    roster: Option<&Path>,
    json: bool,
) -> Result<()> {
    let names = load_roster(roster, cohort_dir)?;
    let bytes = fs::read(photo).with_context(|| format!("reading {}", photo.display()))?;

    let (registry, cohort) = registry_for(cohort_dir)?;
    let report = registry.bulk_audit(&cohort, bytes, names).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for outcome in &report.outcomes {
        println!("{:?}  {}  {}", outcome.status, outcome.identity, outcome.message);
    }
    println!(
        "faces {}, unmatched {}, pass {}, fail {}",
        report.faces_detected, report.unmatched_faces, report.pass_count, report.fail_count
    );
    Ok(())
}
