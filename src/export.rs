//! Image export

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use image::{ImageError, ImageFormat, RgbaImage};

use crate::error::{HarnessError, Result};

/// Write `image` to `path` as PNG, creating or truncating the file
pub fn export_png(image: &RgbaImage, path: &Path) -> Result<()> {
    export_image(image, path, ImageFormat::Png)
}

/// Write `image` to `path` in `format`
///
/// Bytes already flushed when an error occurs are left in place.
///
/// # Errors
/// - [`HarnessError::Encode`] for a zero-area image or an encoder failure
/// - [`HarnessError::Io`] if the file cannot be created or written
pub fn export_image(image: &RgbaImage, path: &Path, format: ImageFormat) -> Result<()> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(HarnessError::Encode(format!("cannot encode a {width}x{height} image")));
    }

    let io_err = |source: std::io::Error| HarnessError::Io { path: path.to_path_buf(), source };

    let file = File::create(path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    image.write_to(&mut writer, format).map_err(|e| match e {
        ImageError::IoError(source) => io_err(source),
        other => HarnessError::Encode(other.to_string()),
    })?;
    writer.flush().map_err(io_err)?;

    log::info!("💾 Saved {}x{} image to {}", width, height, path.display());
    Ok(())
}
