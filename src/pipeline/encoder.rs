use std::path::Path;

use image::{ExtendedColorType, ImageFormat};
use serde::{Deserialize, Serialize};

use super::recorder::LoggerError;
use crate::capture::FrameHeader;

/// Writes one frame's pixels to a file
pub trait FrameEncoder: Send + Sync {
    /// File extension, without the dot
    fn extension(&self) -> &'static str;

    fn encode(&self, path: &Path, header: &FrameHeader, pixels: &[u8]) -> Result<(), LoggerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFileFormat {
    Tiff,
    Png,
    Jpeg,
}

impl ImageFileFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFileFormat::Tiff => "tif",
            ImageFileFormat::Png => "png",
            ImageFileFormat::Jpeg => "jpg",
        }
    }

    fn image_format(self) -> ImageFormat {
        match self {
            ImageFileFormat::Tiff => ImageFormat::Tiff,
            ImageFileFormat::Png => ImageFormat::Png,
            ImageFileFormat::Jpeg => ImageFormat::Jpeg,
        }
    }
}

/// 8-bit grayscale image files through the `image` crate
#[derive(Debug, Clone, Copy)]
pub struct ImageFileEncoder {
    format: ImageFileFormat,
}

impl ImageFileEncoder {
    pub fn new(format: ImageFileFormat) -> Self {
        Self { format }
    }
}

impl FrameEncoder for ImageFileEncoder {
    fn extension(&self) -> &'static str {
        self.format.extension()
    }

    fn encode(&self, path: &Path, header: &FrameHeader, pixels: &[u8]) -> Result<(), LoggerError> {
        let encode_err = |reason: String| LoggerError::Encode {
            path: path.to_path_buf(),
            reason,
        };

        let width = u32::try_from(header.width).map_err(|_| encode_err("width overflow".into()))?;
        let height =
            u32::try_from(header.height).map_err(|_| encode_err("height overflow".into()))?;
        let needed = header.pixel_count();
        if pixels.len() < needed {
            return Err(encode_err(format!(
                "{} pixel bytes for a {}x{} frame",
                pixels.len(),
                width,
                height
            )));
        }

        image::save_buffer_with_format(
            path,
            &pixels[..needed],
            width,
            height,
            ExtendedColorType::L8,
            self.format.image_format(),
        )
        .map_err(|e| encode_err(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32) -> (FrameHeader, Vec<u8>) {
        let header = FrameHeader::new(w, h, 1, 0);
        let pixels = (0..w * h).map(|i| (i % 256) as u8).collect();
        (header, pixels)
    }

    #[test]
    fn test_tiff_and_png_readable() {
        let dir = tempfile::tempdir().unwrap();
        let (header, pixels) = gradient(32, 16);

        for format in [ImageFileFormat::Tiff, ImageFileFormat::Png] {
            let encoder = ImageFileEncoder::new(format);
            let path = dir.path().join(format!("frame.{}", encoder.extension()));
            encoder.encode(&path, &header, &pixels).unwrap();

            let img = image::open(&path).unwrap().into_luma8();
            assert_eq!(img.dimensions(), (32, 16));
            assert_eq!(img.as_raw(), &pixels);
        }
    }

    #[test]
    fn test_short_payload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (header, pixels) = gradient(8, 8);
        let encoder = ImageFileEncoder::new(ImageFileFormat::Png);

        let err = encoder
            .encode(&dir.path().join("x.png"), &header, &pixels[..10])
            .unwrap_err();
        assert!(matches!(err, LoggerError::Encode { .. }));
    }
}
