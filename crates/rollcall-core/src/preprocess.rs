//! Canonicalization of decoded images into the classifier's input geometry.

use crate::codec::DecodedImage;
use crate::types::{
    CanonicalImage, ChannelOrder, CANONICAL_CHANNELS, CANONICAL_ORDER, CANONICAL_SIZE,
};
use image::imageops::FilterType;
use ndarray::{Array4, Axis};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("image has zero width or height")]
    EmptyImage,
    #[error("grayscale input rejected: {0:?} has no color channels")]
    UnsupportedChannels(image::ColorType),
    #[error("cannot stack an empty batch")]
    EmptyBatch,
    #[error("batch shape mismatch: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Resizes and reorders decoded images into [`CanonicalImage`]s.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    allow_grayscale: bool,
    filter: FilterType,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Preprocessor {
    pub fn new(allow_grayscale: bool) -> Self {
        Self {
            allow_grayscale,
            filter: FilterType::Triangle,
        }
    }

    /// Produce a single-image batch of shape `(1, 100, 100, 3)` in BGR order.
    ///
    /// Alpha is discarded. Grayscale is replicated across all three channels
    /// when allowed.
    pub fn normalize(&self, decoded: &DecodedImage) -> Result<CanonicalImage, PreprocessError> {
        if decoded.width() == 0 || decoded.height() == 0 {
            return Err(PreprocessError::EmptyImage);
        }
        if decoded.is_grayscale() && !self.allow_grayscale {
            return Err(PreprocessError::UnsupportedChannels(decoded.image.color()));
        }

        let size = CANONICAL_SIZE as u32;
        let rgb = decoded
            .image
            .resize_exact(size, size, self.filter)
            .to_rgb8();

        let pixels = Array4::from_shape_fn(
            (1, CANONICAL_SIZE, CANONICAL_SIZE, CANONICAL_CHANNELS),
            |(_, y, x, c)| rgb.get_pixel(x as u32, y as u32).0[source_channel(decoded.order, c)],
        );

        Ok(CanonicalImage::from_array(pixels))
    }

    /// Concatenate single- or multi-image batches along the batch axis.
    pub fn stack(images: &[CanonicalImage]) -> Result<CanonicalImage, PreprocessError> {
        if images.is_empty() {
            return Err(PreprocessError::EmptyBatch);
        }
        let views: Vec<_> = images.iter().map(|i| i.as_array().view()).collect();
        let pixels = ndarray::concatenate(Axis(0), &views)?;
        Ok(CanonicalImage::from_array(pixels))
    }
}

/// Index into a pixel in `from` order that holds canonical channel `c`.
fn source_channel(from: ChannelOrder, c: usize) -> usize {
    if from == CANONICAL_ORDER {
        c
    } else {
        // RGB <-> BGR is a reversal of the three channels.
        CANONICAL_CHANNELS - 1 - c
    }
}
