use rollcall_core::sampler::DEFAULT_SAMPLE_INTERVAL;
use rollcall_core::{Identity, Roster, RosterError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_REPORT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_REPORT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing the SCRFD and ArcFace ONNX files.
    pub model_dir: PathBuf,
    /// TOML roster; the demo class is used when unset.
    pub roster_path: Option<PathBuf>,
    /// Maximum Euclidean distance accepted as a match.
    ///
    /// The 0.6 default is strict for unit-length ArcFace descriptors (cosine
    /// 0.82). The usual ArcFace acceptance of cosine 0.40 is about 1.10 here,
    /// so classroom webcams typically need `ROLLCALL_MATCH_THRESHOLD=1.0` or so.
    pub match_threshold: f32,
    /// Never zero; a zero in the environment falls back to the default.
    pub sample_interval: Duration,
    /// Frames discarded per capture while auto-exposure settles.
    pub warmup_frames: usize,
    /// Consecutive tick failures before escalating the log level.
    pub escalate_after: u32,
    /// Where to write the annotated frame after every tick, if anywhere.
    pub overlay_path: Option<PathBuf>,
    pub report_model: String,
    pub report_endpoint: String,
    pub api_key: Option<String>,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self {
            camera_device: std::env::var("ROLLCALL_CAMERA_DEVICE")
                .unwrap_or_else(|_| rollcall_hw::DEFAULT_DEVICE.to_string()),
            model_dir: std::env::var("ROLLCALL_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| rollcall_core::default_model_dir()),
            roster_path: env_path("ROLLCALL_ROSTER"),
            match_threshold: env_f32(
                "ROLLCALL_MATCH_THRESHOLD",
                rollcall_core::DEFAULT_MATCH_THRESHOLD,
            ),
            sample_interval: sample_interval(
                std::env::var("ROLLCALL_SAMPLE_INTERVAL_MS").ok().as_deref(),
            ),
            warmup_frames: env_usize("ROLLCALL_WARMUP_FRAMES", 4),
            escalate_after: env_u64("ROLLCALL_ESCALATE_AFTER", 10) as u32,
            overlay_path: env_path("ROLLCALL_OVERLAY_PATH"),
            report_model: std::env::var("ROLLCALL_REPORT_MODEL")
                .unwrap_or_else(|_| DEFAULT_REPORT_MODEL.to_string()),
            report_endpoint: std::env::var("ROLLCALL_REPORT_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_REPORT_ENDPOINT.to_string()),
            api_key: std::env::var("ROLLCALL_API_KEY")
                .or_else(|_| std::env::var("API_KEY"))
                .ok()
                .filter(|k| !k.trim().is_empty()),
            bus: match std::env::var("ROLLCALL_BUS").as_deref() {
                Ok("system") => BusKind::System,
                _ => BusKind::Session,
            },
        }
    }

    pub fn load_roster(&self) -> Result<Roster, RosterFileError> {
        match &self.roster_path {
            Some(path) => load_roster_file(path),
            None => {
                tracing::info!("no roster file configured, using the demo class");
                Ok(demo_roster()?)
            }
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key).filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_f32(key: &str, default: f32) -> f32 {
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

fn sample_interval(raw: Option<&str>) -> Duration {
    match raw.map(|v| v.parse::<u64>()) {
        Some(Ok(0)) => {
            tracing::warn!("ROLLCALL_SAMPLE_INTERVAL_MS=0 is not allowed, using the default");
            DEFAULT_SAMPLE_INTERVAL
        }
        Some(Ok(ms)) => Duration::from_millis(ms),
        _ => DEFAULT_SAMPLE_INTERVAL,
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Error, Debug)]
pub enum RosterFileError {
    #[error("failed to read roster {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid roster TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Invalid(#[from] RosterError),
}

#[derive(Debug, Deserialize)]
struct RosterFile {
    #[serde(default)]
    student: Vec<StudentEntry>,
}

#[derive(Debug, Deserialize)]
struct StudentEntry {
    id: u32,
    name: String,
    image: String,
}

pub fn parse_roster(text: &str) -> Result<Roster, RosterFileError> {
    let file: RosterFile = toml::from_str(text)?;
    let identities = file
        .student
        .into_iter()
        .map(|s| Identity::new(s.id, s.name, s.image))
        .collect();
    Ok(Roster::new(identities)?)
}

pub fn load_roster_file(path: &Path) -> Result<Roster, RosterFileError> {
    let text = std::fs::read_to_string(path).map_err(|source| RosterFileError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let roster = parse_roster(&text)?;
    tracing::info!(path = %path.display(), students = roster.len(), "roster loaded");
    Ok(roster)
}

/// Six students with placeholder portraits.
pub fn demo_roster() -> Result<Roster, RosterError> {
    let names = [
        "Emily Carter",
        "Benjamin Lee",
        "Olivia Chen",
        "Daniel Rodriguez",
        "Sophia Nguyen",
        "Liam Goldberg",
    ];
    Roster::new(
        names
            .iter()
            .zip(1u32..)
            .map(|(name, id)| {
                let seed = name.split_whitespace().next().unwrap_or(name).to_lowercase();
                Identity::new(id, *name, format!("https://picsum.photos/seed/{seed}/200/200"))
            })
            .collect(),
    )
}
