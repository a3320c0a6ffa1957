//! Pulled frames and RGBA assembly

use gstreamer_video as gst_video;
use image::RgbaImage;

use crate::error::{HarnessError, Result};

/// Bytes per pixel of the RGBA layout the harness negotiates
pub const RGBA_BYTES_PER_PIXEL: usize = 4;

/// One pixel buffer pulled from a sink, with the geometry its caps declared
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    format: gst_video::VideoFormat,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: gst_video::VideoFormat) -> Self {
        Self { data, width, height, format }
    }

    /// Tightly packed RGBA frame
    pub fn rgba(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self::new(data, width, height, gst_video::VideoFormat::Rgba)
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn format(&self) -> gst_video::VideoFormat {
        self.format
    }

    /// Every byte is zero (what a freshly started Xvfb shows)
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }

    /// Assemble the bytes into an RGBA image of the given size
    ///
    /// # Errors
    /// [`HarnessError::SizeMismatch`] unless `len == width * height * 4`.
    pub fn into_rgba_image(self, width: u32, height: u32) -> Result<RgbaImage> {
        let expected = rgba_len(width, height);
        let actual = self.data.len();
        if expected != Some(actual) {
            return Err(HarnessError::SizeMismatch {
                width,
                height,
                expected: expected.unwrap_or(usize::MAX),
                actual,
            });
        }
        RgbaImage::from_raw(width, height, self.data).ok_or(HarnessError::SizeMismatch {
            width,
            height,
            expected: actual,
            actual,
        })
    }
}

/// Byte length of a packed RGBA buffer, `None` on overflow
fn rgba_len(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(RGBA_BYTES_PER_PIXEL)
}

/// Copy `height` rows of `row_bytes` out of a buffer laid out with `stride`
pub(crate) fn strip_row_padding(src: &[u8], row_bytes: usize, stride: usize, height: usize) -> Vec<u8> {
    if stride == row_bytes {
        return src.to_vec();
    }
    let mut packed = Vec::with_capacity(row_bytes * height);
    for row in src.chunks(stride).take(height) {
        packed.extend_from_slice(&row[..row_bytes.min(row.len())]);
    }
    packed
}
