//! Nearest-neighbour classification of descriptors against the enrolled roster.

use crate::types::{Descriptor, IdentityId, LabeledDescriptor, MatchLabel, MatchResult};
use thiserror::Error;

/// Euclidean distance at or below which a face counts as a match.
///
/// On unit-length ArcFace descriptors `d = sqrt(2 - 2 cos)`, so 0.6 only
/// accepts cosine similarity >= 0.82. Production ArcFace deployments accept
/// around cosine 0.40 (d ~ 1.10); expect real webcams to need 1.0..1.1.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug, PartialEq)]
pub enum MatcherError {
    #[error("no enrolled descriptors")]
    EmptyGallery,
    #[error("invalid match threshold {0}")]
    InvalidThreshold(f32),
    #[error("descriptor for identity {identity} has length {actual}, expected {expected}")]
    LengthMismatch {
        identity: IdentityId,
        expected: usize,
        actual: usize,
    },
}

/// Immutable gallery of enrolled descriptors plus a distance threshold.
///
/// Distances tie-break toward the earlier gallery entry, so with a gallery
/// built in roster order the first enrolled identity wins.
#[derive(Debug, Clone)]
pub struct FaceMatcher {
    gallery: Vec<LabeledDescriptor>,
    threshold: f32,
    dim: usize,
}

impl FaceMatcher {
    pub fn new(gallery: Vec<LabeledDescriptor>, threshold: f32) -> Result<Self, MatcherError> {
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(MatcherError::InvalidThreshold(threshold));
        }
        let dim = gallery.first().ok_or(MatcherError::EmptyGallery)?.descriptor.len();
        if let Some(bad) = gallery.iter().find(|l| l.descriptor.len() != dim) {
            return Err(MatcherError::LengthMismatch {
                identity: bad.identity_id,
                expected: dim,
                actual: bad.descriptor.len(),
            });
        }
        Ok(Self {
            gallery,
            threshold,
            dim,
        })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn len(&self) -> usize {
        self.gallery.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gallery.is_empty()
    }

    /// Enrolled identities, in gallery order.
    pub fn identities(&self) -> impl Iterator<Item = IdentityId> + '_ {
        self.gallery.iter().map(|l| l.identity_id)
    }

    /// Classify `query` as the nearest enrolled identity within threshold.
    ///
    /// A non-match still reports the nearest distance. A query of the wrong
    /// length cannot be compared and comes back unknown at infinite distance.
    pub fn find_best_match(&self, query: &Descriptor) -> MatchResult {
        if query.len() != self.dim {
            tracing::warn!(
                expected = self.dim,
                actual = query.len(),
                "query descriptor has wrong length"
            );
            return MatchResult {
                label: MatchLabel::Unknown,
                distance: f32::INFINITY,
            };
        }

        let mut best: Option<(IdentityId, f32)> = None;
        for entry in &self.gallery {
            let distance = query.euclidean_distance(&entry.descriptor);
            // Strict `<` keeps the earliest entry on ties; NaN never wins.
            let closer = match best {
                None => !distance.is_nan(),
                Some((_, d)) => distance < d,
            };
            if closer {
                best = Some((entry.identity_id, distance));
            }
        }

        match best {
            Some((id, distance)) if distance <= self.threshold => MatchResult {
                label: MatchLabel::Known(id),
                distance,
            },
            Some((_, distance)) => MatchResult {
                label: MatchLabel::Unknown,
                distance,
            },
            None => MatchResult {
                label: MatchLabel::Unknown,
                distance: f32::INFINITY,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labeled(id: u32, values: Vec<f32>) -> LabeledDescriptor {
        LabeledDescriptor {
            identity_id: IdentityId(id),
            descriptor: Descriptor::new(values),
        }
    }

    fn query(values: Vec<f32>) -> Descriptor {
        Descriptor::new(values)
    }

    #[test]
    fn test_empty_gallery_refused() {
        assert_eq!(FaceMatcher::new(vec![], 0.6).unwrap_err(), MatcherError::EmptyGallery);
    }

    #[test]
    fn test_invalid_threshold_refused() {
        let g = vec![labeled(1, vec![0.0])];
        assert!(matches!(
            FaceMatcher::new(g.clone(), -0.1),
            Err(MatcherError::InvalidThreshold(_))
        ));
        assert!(matches!(FaceMatcher::new(g, f32::NAN), Err(MatcherError::InvalidThreshold(_))));
    }

    #[test]
    fn test_mixed_lengths_refused() {
        let gallery = vec![labeled(1, vec![0.0, 0.0]), labeled(2, vec![0.0])];
        let err = FaceMatcher::new(gallery, 0.6).unwrap_err();
        assert_eq!(
            err,
            MatcherError::LengthMismatch { identity: IdentityId(2), expected: 2, actual: 1 }
        );
    }

    #[test]
    fn test_nearest_identity_wins() {
        let m = FaceMatcher::new(
            vec![
                labeled(1, vec![0.0, 0.0]),
                labeled(2, vec![1.0, 0.0]),
                labeled(3, vec![0.0, 1.0]),
            ],
            0.6,
        )
        .unwrap();
        let r = m.find_best_match(&query(vec![0.9, 0.1]));
        assert_eq!(r.label, MatchLabel::Known(IdentityId(2)));
        assert!((r.distance - (0.02f32).sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_distance_equal_to_threshold_is_accepted() {
        let m = FaceMatcher::new(vec![labeled(1, vec![0.0])], 0.5).unwrap();
        let r = m.find_best_match(&query(vec![0.5]));
        assert_eq!(r.label, MatchLabel::Known(IdentityId(1)));
        assert_eq!(r.distance, 0.5);
    }

    #[test]
    fn test_distance_just_above_threshold_is_unknown() {
        let m = FaceMatcher::new(vec![labeled(1, vec![0.0])], 0.5).unwrap();
        let r = m.find_best_match(&query(vec![0.5001]));
        assert_eq!(r.label, MatchLabel::Unknown);
        assert!((r.distance - 0.5001).abs() < 1e-6);
    }

    #[test]
    fn test_tie_resolves_to_first_enrolled() {
        // Query sits exactly between identities 7 and 3; 7 is enrolled first.
        let gallery = vec![labeled(7, vec![-1.0, 0.0]), labeled(3, vec![1.0, 0.0])];
        let m = FaceMatcher::new(gallery, 2.0).unwrap();
        for _ in 0..100 {
            let r = m.find_best_match(&query(vec![0.0, 0.0]));
            assert_eq!(r.label, MatchLabel::Known(IdentityId(7)));
        }
    }

    #[test]
    fn test_unknown_reports_min_distance() {
        let m = FaceMatcher::new(vec![labeled(1, vec![0.0]), labeled(2, vec![3.0])], 0.6).unwrap();
        let r = m.find_best_match(&query(vec![2.1]));
        assert_eq!(r.label, MatchLabel::Unknown);
        assert!((r.distance - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_wrong_length_query_is_unknown() {
        let m = FaceMatcher::new(vec![labeled(1, vec![0.0, 0.0])], 0.6).unwrap();
        let r = m.find_best_match(&query(vec![0.0]));
        assert_eq!(r.label, MatchLabel::Unknown);
        assert!(r.distance.is_infinite());
    }

    #[test]
    fn test_nan_query_never_matches() {
        let m = FaceMatcher::new(vec![labeled(1, vec![0.0])], 0.6).unwrap();
        assert_eq!(m.find_best_match(&query(vec![f32::NAN])).label, MatchLabel::Unknown);
    }
}
