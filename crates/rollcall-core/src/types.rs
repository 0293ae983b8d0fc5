use ndarray::{Array4, ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Side length of the square canonical image, in pixels.
pub const CANONICAL_SIZE: usize = 100;
/// Color channels in a canonical image.
pub const CANONICAL_CHANNELS: usize = 3;

/// An inbound image payload, valid for the duration of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawImage {
    /// Embedded data URI: metadata prefix, a comma, then the base64 payload.
    DataUri(String),
    /// Image file on the local filesystem.
    Path(PathBuf),
}

impl RawImage {
    /// Classify a caller-supplied string: `data:` prefixed strings are data
    /// URIs, anything else is treated as a filesystem path.
    pub fn parse(source: &str) -> Self {
        if source.trim_start().starts_with("data:") {
            RawImage::DataUri(source.to_string())
        } else {
            RawImage::Path(PathBuf::from(source))
        }
    }

    /// Short, log-safe description of where the image came from.
    pub fn describe(&self) -> String {
        match self {
            RawImage::DataUri(s) => format!("data-uri ({} bytes)", s.len()),
            RawImage::Path(p) => p.display().to_string(),
        }
    }
}

/// Order of the color channels in an interleaved pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// Channel order every canonical image is stored in.
pub const CANONICAL_ORDER: ChannelOrder = ChannelOrder::Bgr;

/// Fixed-geometry `(N, 100, 100, 3)` BGR pixel tensor.
///
/// Always constructed through the preprocessor, which guarantees the trailing
/// three dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalImage {
    pixels: Array4<u8>,
}

impl CanonicalImage {
    pub(crate) fn from_array(pixels: Array4<u8>) -> Self {
        debug_assert_eq!(
            &pixels.shape()[1..],
            &[CANONICAL_SIZE, CANONICAL_SIZE, CANONICAL_CHANNELS]
        );
        Self { pixels }
    }

    /// Number of images along the batch axis.
    pub fn batch_len(&self) -> usize {
        self.pixels.len_of(Axis(0))
    }

    /// Full tensor shape, `[N, H, W, C]`.
    pub fn shape(&self) -> [usize; 4] {
        let s = self.pixels.shape();
        [s[0], s[1], s[2], s[3]]
    }

    /// One image of the batch as an `(H, W, C)` view.
    pub fn image(&self, index: usize) -> ArrayView3<'_, u8> {
        self.pixels.index_axis(Axis(0), index)
    }

    pub fn as_array(&self) -> &Array4<u8> {
        &self.pixels
    }

    /// Pixel values in standard (row-major NHWC) order, widened to `f32`.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.pixels.iter().map(|&p| p as f32).collect()
    }
}

/// Serialized classifier weights for one identity. Opaque outside `model`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifact {
    bytes: Vec<u8>,
}

impl ModelArtifact {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Why a probe was not accepted for the claimed identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoMatchReason {
    /// No artifact has been trained for the identity.
    ArtifactMissing,
    /// The positive-class probability did not exceed the threshold.
    Rejected,
    /// The probability fell inside the rejection band around the threshold.
    Uncertain,
}

/// Outcome of verifying a probe against one identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchDecision {
    Match {
        identity: String,
        /// Positive-class probability in [0, 1].
        confidence: f32,
    },
    NoMatch {
        reason: NoMatchReason,
        /// Positive-class probability, if the classifier ran.
        confidence: Option<f32>,
    },
}

impl MatchDecision {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchDecision::Match { .. })
    }

    /// The matched identity, or `None` for every no-match outcome.
    pub fn identity(&self) -> Option<&str> {
        match self {
            MatchDecision::Match { identity, .. } => Some(identity),
            MatchDecision::NoMatch { .. } => None,
        }
    }

    pub fn into_identity(self) -> Option<String> {
        match self {
            MatchDecision::Match { identity, .. } => Some(identity),
            MatchDecision::NoMatch { .. } => None,
        }
    }
}
