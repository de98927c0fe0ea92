//! Roster enrollment: one reference photo per identity becomes one labeled descriptor.

use crate::extractor::{ExtractError, ModelBundle};
use crate::matcher::{FaceMatcher, MatcherError};
use crate::types::{GrayFrame, Identity, LabeledDescriptor, Roster};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("undecodable image: {0}")]
    Decode(String),
}

/// Loads a reference image by URI.
#[async_trait]
pub trait ReferenceFetcher: Send + Sync {
    async fn fetch(&self, uri: &str) -> Result<GrayFrame, FetchError>;
}

/// Why an identity ended up without a descriptor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    FetchFailed(String),
    NoFace,
    ExtractionFailed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedIdentity {
    pub identity: Identity,
    pub reason: SkipReason,
}

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("face models unavailable: {0}")]
    ModelsUnavailable(String),
    #[error("no usable faces in any reference image ({} identities skipped)", .skipped.len())]
    NoUsableFaces { skipped: Vec<SkippedIdentity> },
}

/// Enrollment output, in roster order.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub descriptors: Vec<LabeledDescriptor>,
    pub skipped: Vec<SkippedIdentity>,
}

impl Enrollment {
    /// True when at least one identity could not be enrolled.
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }

    pub fn into_matcher(self, threshold: f32) -> Result<FaceMatcher, MatcherError> {
        FaceMatcher::new(self.descriptors, threshold)
    }
}

/// Fetch every reference image concurrently, then extract one descriptor per
/// identity. Identities that fail are skipped with a warning; only a missing
/// detection resource or an entirely empty result is an error.
pub async fn enroll(
    roster: &Roster,
    fetcher: &dyn ReferenceFetcher,
    bundle: &ModelBundle,
) -> Result<Enrollment, EnrollmentError> {
    let fetched = join_all(
        roster
            .identities()
            .iter()
            .map(|identity| fetcher.fetch(&identity.reference_image)),
    )
    .await;

    let mut descriptors = Vec::new();
    let mut skipped = Vec::new();

    for (identity, image) in roster.identities().iter().zip(fetched) {
        let outcome = match image {
            Err(e) => Err(SkipReason::FetchFailed(e.to_string())),
            Ok(image) => match describe(bundle, image).await {
                Ok(Some(descriptor)) => Ok(descriptor),
                Ok(None) => Err(SkipReason::NoFace),
                Err(ExtractError::Unavailable(reason)) => {
                    return Err(EnrollmentError::ModelsUnavailable(reason));
                }
                Err(e) => Err(SkipReason::ExtractionFailed(e.to_string())),
            },
        };

        match outcome {
            Ok(descriptor) => {
                tracing::debug!(id = %identity.id, name = %identity.name, "enrolled");
                descriptors.push(LabeledDescriptor {
                    identity_id: identity.id,
                    descriptor,
                });
            }
            Err(reason) => {
                tracing::warn!(
                    id = %identity.id,
                    name = %identity.name,
                    uri = %identity.reference_image,
                    ?reason,
                    "skipping identity: no usable reference face"
                );
                skipped.push(SkippedIdentity {
                    identity: identity.clone(),
                    reason,
                });
            }
        }
    }

    if descriptors.is_empty() {
        tracing::error!(skipped = skipped.len(), "enrollment produced no usable faces");
        return Err(EnrollmentError::NoUsableFaces { skipped });
    }

    tracing::info!(
        enrolled = descriptors.len(),
        skipped = skipped.len(),
        roster = roster.len(),
        "enrollment complete"
    );
    Ok(Enrollment { descriptors, skipped })
}

async fn describe(
    bundle: &ModelBundle,
    image: GrayFrame,
) -> Result<Option<crate::types::Descriptor>, ExtractError> {
    let bundle = bundle.clone();
    let best = tokio::task::spawn_blocking(move || bundle.detect_best(&image))
        .await
        .map_err(|e| ExtractError::Failed(format!("extraction task failed: {e}")))??;
    Ok(best.map(|d| d.descriptor))
}
