//! Image codec: turns a [`RawImage`] into decoded pixels.
//!
//! Accepts either a data URI (`data:image/png;base64,....`) or a path to an
//! image file. Decoding is format-sniffed from the payload's magic bytes, so
//! the metadata prefix of a data URI is never trusted.

use crate::types::{ChannelOrder, RawImage};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("data URI has no ',' separating metadata from payload")]
    MissingPayload,
    #[error("malformed base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("cannot read image file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("not a decodable image: {0}")]
    Image(#[from] image::ImageError),
}

/// Pixels produced by the codec, tagged with the channel order they are in.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub image: DynamicImage,
    pub order: ChannelOrder,
}

impl DecodedImage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// True when the source had no color channels (luma or luma+alpha).
    pub fn is_grayscale(&self) -> bool {
        !self.image.color().has_color()
    }
}

/// Decode a raw image from either supported source.
pub fn decode(source: &RawImage) -> Result<DecodedImage, DecodeError> {
    let bytes = match source {
        RawImage::DataUri(uri) => decode_data_uri(uri)?,
        RawImage::Path(path) => read_file(path)?,
    };
    decode_bytes(&bytes)
}

/// Decode an in-memory image container (PNG, JPEG, BMP, ...).
pub fn decode_bytes(bytes: &[u8]) -> Result<DecodedImage, DecodeError> {
    let image = image::load_from_memory(bytes)?;
    tracing::trace!(
        width = image.width(),
        height = image.height(),
        color = ?image.color(),
        "decoded image"
    );
    // The decoder always yields RGB(A)/luma layouts, whatever the source.
    Ok(DecodedImage {
        image,
        order: ChannelOrder::Rgb,
    })
}

/// Strip everything up to and including the first comma, then base64-decode.
fn decode_data_uri(uri: &str) -> Result<Vec<u8>, DecodeError> {
    let (_, payload) = uri.split_once(',').ok_or(DecodeError::MissingPayload)?;
    Ok(STANDARD.decode(payload.trim())?)
}

fn read_file(path: &Path) -> Result<Vec<u8>, DecodeError> {
    std::fs::read(path).map_err(|source| DecodeError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 100, 50]));
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn data_uri(bytes: &[u8]) -> String {
        format!("data:image/png;base64,{}", STANDARD.encode(bytes))
    }

    #[test]
    fn test_decode_data_uri() {
        let raw = RawImage::DataUri(data_uri(&png_bytes(12, 8)));
        let decoded = decode(&raw).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (12, 8));
        assert_eq!(decoded.order, ChannelOrder::Rgb);
        assert!(!decoded.is_grayscale());
    }

    #[test]
    fn test_decode_data_uri_ignores_metadata_prefix() {
        // Prefix claims JPEG; payload is PNG. Sniffing wins.
        let encoded = STANDARD.encode(png_bytes(4, 4));
        let raw = RawImage::DataUri(format!("data:image/jpeg;base64,{encoded}"));
        assert!(decode(&raw).is_ok());
    }

    #[test]
    fn test_decode_missing_comma() {
        let raw = RawImage::DataUri("data:image/png;base64".into());
        assert!(matches!(decode(&raw), Err(DecodeError::MissingPayload)));
    }

    #[test]
    fn test_decode_truncated_base64() {
        let mut uri = data_uri(&png_bytes(16, 16));
        // Drop the padding and one more symbol so the length is no longer valid.
        let cut = uri.trim_end_matches('=').len() - 1;
        uri.truncate(cut);
        let err = decode(&RawImage::DataUri(uri)).unwrap_err();
        assert!(matches!(err, DecodeError::Base64(_) | DecodeError::Image(_)), "got {err:?}");
    }

    #[test]
    fn test_decode_invalid_base64_alphabet() {
        let raw = RawImage::DataUri("data:image/png;base64,@@@@not*base64".into());
        assert!(matches!(decode(&raw), Err(DecodeError::Base64(_))));
    }

    #[test]
    fn test_decode_valid_base64_not_an_image() {
        let raw = RawImage::DataUri(format!("data:,{}", STANDARD.encode(b"hello world")));
        assert!(matches!(decode(&raw), Err(DecodeError::Image(_))));
    }

    #[test]
    fn test_decode_missing_file() {
        let raw = RawImage::Path(PathBuf::from("/nonexistent/rollcall/probe.png"));
        assert!(matches!(decode(&raw), Err(DecodeError::Io { .. })));
    }

    #[test]
    fn test_decode_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.png");
        std::fs::write(&path, png_bytes(30, 20)).unwrap();
        let decoded = decode(&RawImage::Path(path)).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (30, 20));
        assert_eq!(decoded.order, ChannelOrder::Rgb);
    }
}
