use image::codecs::jpeg::JpegEncoder;
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;

use crate::core::layout;
use crate::core::progress::CancellationToken;

pub const THUMBNAIL_SIZE: u32 = 200;
pub const THUMBNAIL_QUALITY: u8 = 85;

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("Operation cancelled")]
    Cancelled,
}

/// Review thumbnails cached under `<folder>/.photocull/thumbs`, keyed by a
/// hash of the photo path, size and modification time. Editing a photo
/// therefore yields a fresh thumbnail.
pub struct ThumbnailCache {
    dir: PathBuf,
    size: u32,
    quality: u8,
}

impl ThumbnailCache {
    pub fn for_folder(folder: &Path) -> Self {
        Self::new(layout::thumbs_dir(folder))
    }

    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            size: THUMBNAIL_SIZE,
            quality: THUMBNAIL_QUALITY,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn thumbnail_path(&self, photo_path: &Path) -> Result<PathBuf, ThumbnailError> {
        let metadata = fs::metadata(photo_path)
            .ok()
            .filter(|m| m.is_file())
            .ok_or_else(|| ThumbnailError::InvalidPath {
                path: photo_path.to_string_lossy().to_string(),
            })?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);

        let mut hasher = blake3::Hasher::new();
        hasher.update(photo_path.to_string_lossy().as_bytes());
        hasher.update(&metadata.len().to_le_bytes());
        hasher.update(&modified.to_le_bytes());
        let key = hasher.finalize().to_hex();
        Ok(self.dir.join(format!("{}.jpg", &key.as_str()[..24])))
    }

    /// Return the cached thumbnail, generating it if missing.
    pub fn get_or_create(&self, photo_path: &Path) -> Result<PathBuf, ThumbnailError> {
        let thumbnail_path = self.thumbnail_path(photo_path)?;
        if thumbnail_path.is_file() {
            return Ok(thumbnail_path);
        }

        fs::create_dir_all(&self.dir)?;
        let img = image::open(photo_path)?;
        let thumbnail = self.fit(img);
        self.save_thumbnail(&thumbnail, &thumbnail_path)?;
        Ok(thumbnail_path)
    }

    /// Generate thumbnails in parallel. Photos not yet started when the
    /// token fires report `Cancelled`.
    pub fn generate_batch(
        &self,
        photo_paths: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Vec<(PathBuf, Result<PathBuf, ThumbnailError>)> {
        photo_paths
            .par_iter()
            .map(|path| {
                if cancel.is_cancelled() {
                    return (path.clone(), Err(ThumbnailError::Cancelled));
                }
                let result = self.get_or_create(path);
                if let Err(e) = &result {
                    log::warn!("Thumbnail failed for {}: {}", path.display(), e);
                }
                (path.clone(), result)
            })
            .collect()
    }

    /// Remove every cached thumbnail.
    pub fn clear(&self) -> Result<usize, ThumbnailError> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Downscale to fit within the thumbnail box, keeping aspect ratio.
    /// Smaller images are left as they are.
    fn fit(&self, img: DynamicImage) -> DynamicImage {
        let (width, height) = img.dimensions();
        if width <= self.size && height <= self.size {
            return img;
        }
        img.resize(self.size, self.size, FilterType::Lanczos3)
    }

    fn save_thumbnail(&self, img: &DynamicImage, path: &Path) -> Result<(), ThumbnailError> {
        let rgb_img = img.to_rgb8();
        let mut output = fs::File::create(path)?;
        let encoder = JpegEncoder::new_with_quality(&mut output, self.quality);
        rgb_img.write_with_encoder(encoder)?;
        Ok(())
    }
}
