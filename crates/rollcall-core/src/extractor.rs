//! Descriptor extraction as a capability: find faces in an image and attach a
//! descriptor to each.
//!
//! [`OnnxExtractor`] is the production engine (SCRFD + ArcFace). [`ModelBundle`]
//! wraps whichever engine is in use behind a shared, lazily loaded handle so the
//! enrollment and sampling paths never touch model lifecycle directly.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{Detection, GrayFrame};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum ExtractError {
    /// The detection resource is missing or failed to load. Not the same as "no face".
    #[error("face models unavailable: {0}")]
    Unavailable(String),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("extraction failed: {0}")]
    Failed(String),
}

/// Finds faces and computes their descriptors.
///
/// Both calls return an empty result rather than an error when no face is present.
pub trait DescriptorExtractor: Send {
    /// Every face in the image, most confident first.
    fn detect_all(&mut self, image: &GrayFrame) -> Result<Vec<Detection>, ExtractError>;

    /// The single most confident face, if any.
    fn detect_best(&mut self, image: &GrayFrame) -> Result<Option<Detection>, ExtractError> {
        Ok(self.detect_all(image)?.into_iter().next())
    }
}

/// SCRFD detection followed by ArcFace description.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, ExtractError> {
        let scrfd = model_dir.join(SCRFD_MODEL_FILE);
        let arcface = model_dir.join(ARCFACE_MODEL_FILE);
        let detector = FaceDetector::load(&scrfd.to_string_lossy())?;
        let recognizer = FaceRecognizer::load(&arcface.to_string_lossy())?;
        Ok(Self { detector, recognizer })
    }
}

impl DescriptorExtractor for OnnxExtractor {
    fn detect_all(&mut self, image: &GrayFrame) -> Result<Vec<Detection>, ExtractError> {
        let faces = self.detector.detect(image)?;
        let mut detections = Vec::with_capacity(faces.len());
        for bbox in faces {
            if bbox.landmarks.is_none() {
                tracing::debug!(confidence = bbox.confidence, "skipping face without landmarks");
                continue;
            }
            let descriptor = self.recognizer.describe(image, &bbox)?;
            detections.push(Detection { bbox, descriptor });
        }
        Ok(detections)
    }

    fn detect_best(&mut self, image: &GrayFrame) -> Result<Option<Detection>, ExtractError> {
        // Only the top face needs a descriptor.
        let faces = self.detector.detect(image)?;
        let Some(bbox) = faces.into_iter().find(|b| b.landmarks.is_some()) else {
            return Ok(None);
        };
        let descriptor = self.recognizer.describe(image, &bbox)?;
        Ok(Some(Detection { bbox, descriptor }))
    }
}

/// Load state of a [`ModelBundle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum Readiness {
    NotLoaded,
    Ready,
    Failed(String),
}

enum BundleState {
    NotLoaded,
    Ready(Box<dyn DescriptorExtractor>),
    Failed(String),
}

/// Shared handle to the detection resource.
///
/// Cloning is cheap; all clones see the same load state. Calls are serialized
/// on an internal lock, so callers on the blocking pool never run two
/// inferences on one session at once.
#[derive(Clone)]
pub struct ModelBundle {
    state: Arc<Mutex<BundleState>>,
}

impl Default for ModelBundle {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelBundle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BundleState::NotLoaded)),
        }
    }

    /// A bundle that is already ready with the given engine.
    pub fn with_extractor(extractor: impl DescriptorExtractor + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(BundleState::Ready(Box::new(extractor)))),
        }
    }

    pub fn readiness(&self) -> Readiness {
        match &*self.lock() {
            BundleState::NotLoaded => Readiness::NotLoaded,
            BundleState::Ready(_) => Readiness::Ready,
            BundleState::Failed(reason) => Readiness::Failed(reason.clone()),
        }
    }

    /// Run `loader` on the blocking pool unless the bundle is already ready.
    ///
    /// Loading again after success is a no-op; after a failure it retries.
    pub async fn load<F>(&self, loader: F) -> Readiness
    where
        F: FnOnce() -> Result<Box<dyn DescriptorExtractor>, ExtractError> + Send + 'static,
    {
        if self.readiness() == Readiness::Ready {
            return Readiness::Ready;
        }

        let outcome = tokio::task::spawn_blocking(loader)
            .await
            .unwrap_or_else(|e| Err(ExtractError::Failed(format!("model loader panicked: {e}"))));

        let mut state = self.lock();
        if matches!(*state, BundleState::Ready(_)) {
            // A concurrent load won the race; keep its engine.
            return Readiness::Ready;
        }
        match outcome {
            Ok(extractor) => {
                tracing::info!("face models ready");
                *state = BundleState::Ready(extractor);
                Readiness::Ready
            }
            Err(e) => {
                tracing::error!(error = %e, "face models failed to load");
                let reason = e.to_string();
                *state = BundleState::Failed(reason.clone());
                Readiness::Failed(reason)
            }
        }
    }

    /// Load the ONNX engine from a model directory.
    pub async fn load_onnx(&self, model_dir: PathBuf) -> Readiness {
        self.load(move || {
            OnnxExtractor::load(&model_dir).map(|e| Box::new(e) as Box<dyn DescriptorExtractor>)
        })
        .await
    }

    pub fn detect_all(&self, image: &GrayFrame) -> Result<Vec<Detection>, ExtractError> {
        self.with_engine(|engine| engine.detect_all(image))
    }

    pub fn detect_best(&self, image: &GrayFrame) -> Result<Option<Detection>, ExtractError> {
        self.with_engine(|engine| engine.detect_best(image))
    }

    fn with_engine<T>(
        &self,
        f: impl FnOnce(&mut dyn DescriptorExtractor) -> Result<T, ExtractError>,
    ) -> Result<T, ExtractError> {
        match &mut *self.lock() {
            BundleState::Ready(engine) => f(engine.as_mut()),
            BundleState::NotLoaded => Err(ExtractError::Unavailable("models not loaded".into())),
            BundleState::Failed(reason) => Err(ExtractError::Unavailable(reason.clone())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BundleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
