use crate::{Error, Result};
use image::{DynamicImage, ImageFormat};
use std::path::{Path, PathBuf};

const PREVIEW_WIDTH: u32 = 150;
const PREVIEW_HEIGHT: u32 = 100;

/// Writes small inline previews next to downloaded images.
pub struct PreviewMaker {
    width: u32,
    height: u32,
}

impl PreviewMaker {
    pub fn new() -> Self {
        Self {
            width: PREVIEW_WIDTH,
            height: PREVIEW_HEIGHT,
        }
    }

    fn preview_path(source: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "image".to_string());
        source.with_file_name(format!("{}_thumb.png", stem))
    }

    fn save_preview_sync(image: DynamicImage, width: u32, height: u32, target: &Path) -> Result<()> {
        let resized = image.resize_exact(width, height, image::imageops::FilterType::Lanczos3);
        resized.save_with_format(target, ImageFormat::Png)?;
        Ok(())
    }

    /// Decode `source` and write a fixed-size PNG thumbnail beside it.
    pub async fn make_preview(&self, source: &Path) -> Result<PathBuf> {
        let source = source.to_path_buf();
        let target = Self::preview_path(&source);
        let (width, height) = (self.width, self.height);

        tokio::task::spawn_blocking({
            let target = target.clone();
            move || {
                let image = image::open(&source)?;
                Self::save_preview_sync(image, width, height, &target)
            }
        })
        .await
        .map_err(|e| Error::Invariant(format!("Preview task join error: {}", e)))??;

        Ok(target)
    }
}

impl Default for PreviewMaker {
    fn default() -> Self {
        Self::new()
    }
}
