use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Stable roster identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub u32);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A person on the roster together with the URI of their reference photo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub name: String,
    pub reference_image: String,
}

impl Identity {
    pub fn new(id: u32, name: impl Into<String>, reference_image: impl Into<String>) -> Self {
        Self {
            id: IdentityId(id),
            name: name.into(),
            reference_image: reference_image.into(),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RosterError {
    #[error("duplicate identity id {0}")]
    DuplicateId(IdentityId),
    #[error("duplicate identity name {0:?}")]
    DuplicateName(String),
}

/// Fixed, ordered list of identities for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Roster {
    identities: Vec<Identity>,
}

impl Roster {
    pub fn new(identities: Vec<Identity>) -> Result<Self, RosterError> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for identity in &identities {
            if !ids.insert(identity.id) {
                return Err(RosterError::DuplicateId(identity.id));
            }
            if !names.insert(identity.name.as_str()) {
                return Err(RosterError::DuplicateName(identity.name.clone()));
            }
        }
        Ok(Self { identities })
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn get(&self, id: IdentityId) -> Option<&Identity> {
        self.identities.iter().find(|i| i.id == id)
    }

    pub fn name_of(&self, id: IdentityId) -> Option<&str> {
        self.get(id).map(|i| i.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Absent,
    Present,
}

/// A grayscale image handed to the extractor: a reference still or a video frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayFrame {
    /// Row-major luma bytes, `width * height` long.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl GrayFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self { data, width, height }
    }

    /// Decode any format the `image` crate understands and convert to luma.
    pub fn decode(bytes: &[u8]) -> Result<Self, image::ImageError> {
        let luma = image::load_from_memory(bytes)?.into_luma8();
        let (width, height) = luma.dimensions();
        Ok(Self {
            data: luma.into_raw(),
            width,
            height,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }
}

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Fixed-length face descriptor (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
    /// Model version that produced this descriptor (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance between two descriptors of equal length.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// A face found in one image. Discarded after matching.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub descriptor: Descriptor,
}

/// Enrolled descriptor for one roster identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledDescriptor {
    pub identity_id: IdentityId,
    pub descriptor: Descriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchLabel {
    Known(IdentityId),
    Unknown,
}

/// Outcome of matching one descriptor against the enrolled set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchResult {
    pub label: MatchLabel,
    /// Distance to the nearest enrolled descriptor, reported even on a non-match.
    pub distance: f32,
}

impl MatchResult {
    pub fn identity(&self) -> Option<IdentityId> {
        match self.label {
            MatchLabel::Known(id) => Some(id),
            MatchLabel::Unknown => None,
        }
    }
}

/// "This identity was seen on the current tick."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecognitionEvent {
    pub identity_id: IdentityId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance() {
        let a = Descriptor::new(vec![0.0, 0.0]);
        let b = Descriptor::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_roster_rejects_duplicate_id() {
        let err = Roster::new(vec![
            Identity::new(1, "Alice", "a.png"),
            Identity::new(1, "Bob", "b.png"),
        ])
        .unwrap_err();
        assert_eq!(err, RosterError::DuplicateId(IdentityId(1)));
    }

    #[test]
    fn test_roster_rejects_duplicate_name() {
        let err = Roster::new(vec![
            Identity::new(1, "Alice", "a.png"),
            Identity::new(2, "Alice", "b.png"),
        ])
        .unwrap_err();
        assert_eq!(err, RosterError::DuplicateName("Alice".into()));
    }

    #[test]
    fn test_roster_lookup_keeps_order() {
        let roster = Roster::new(vec![
            Identity::new(7, "Carol", "c.png"),
            Identity::new(3, "Alice", "a.png"),
        ])
        .unwrap();
        assert_eq!(roster.identities()[0].name, "Carol");
        assert_eq!(roster.name_of(IdentityId(3)), Some("Alice"));
        assert_eq!(roster.name_of(IdentityId(9)), None);
    }

    #[test]
    fn test_gray_frame_decode_png() {
        let img = image::GrayImage::from_pixel(4, 3, image::Luma([200u8]));
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        let frame = GrayFrame::decode(&bytes).unwrap();
        assert_eq!((frame.width, frame.height), (4, 3));
        assert!(frame.data.iter().all(|&p| p == 200));
    }

    #[test]
    fn test_gray_frame_decode_garbage() {
        assert!(GrayFrame::decode(b"not an image").is_err());
    }
}
