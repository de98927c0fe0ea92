//! rollcall-core: Face-recognition attendance engine.
//!
//! SCRFD finds faces and ArcFace describes them, both through ONNX Runtime on
//! the CPU. Descriptors from a roster's reference photos form the gallery; a
//! periodic sampler matches live faces against it and marks the ledger.

pub mod alignment;
pub mod detector;
pub mod enrollment;
pub mod extractor;
pub mod ledger;
pub mod matcher;
pub mod overlay;
pub mod recognizer;
pub mod report;
pub mod sampler;
pub mod types;

use std::path::PathBuf;

pub use enrollment::{
    enroll, Enrollment, EnrollmentError, FetchError, ReferenceFetcher, SkipReason,
};
pub use extractor::{DescriptorExtractor, ExtractError, ModelBundle, Readiness};
pub use ledger::{AttendanceLedger, AttendanceSnapshot, SharedLedger};
pub use matcher::{FaceMatcher, MatcherError, DEFAULT_MATCH_THRESHOLD};
pub use overlay::{Overlay, OverlayBox};
pub use report::{build_summary_prompt, ReportError, ReportRequester};
pub use sampler::{
    FrameRead, FrameSource, Sampler, SamplerConfig, SamplerError, SamplerHandle, SamplerState,
    SamplerStats, SourceError,
};
pub use types::{
    AttendanceStatus, BoundingBox, Descriptor, Detection, GrayFrame, Identity, IdentityId,
    MatchLabel, MatchResult, RecognitionEvent, Roster, RosterError,
};

/// `$XDG_DATA_HOME/rollcall/models`, falling back to `~/.local/share/rollcall/models`.
pub fn default_model_dir() -> PathBuf {
    let base = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share"))
        })
        .unwrap_or_else(|| PathBuf::from("/usr/share"));
    base.join("rollcall").join("models")
}
