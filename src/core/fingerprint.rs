use chrono::NaiveDateTime;
use std::fs;
use std::path::Path;

use crate::core::exif::ExifService;
use crate::core::hash::HashService;
use crate::core::perceptual::{PerceptualHash, PerceptualHasher};
use crate::database::models::FingerprintRecord;

/// Content hash, perceptual hash and capture time of one photo.
///
/// Either both hashes are present or neither is: a file that cannot be read
/// or decoded carries no fingerprint and is never clustered with anything.
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub content_hash: Option<String>,
    pub perceptual_hash: Option<PerceptualHash>,
    pub capture_time: Option<NaiveDateTime>,
}

impl Fingerprint {
    pub fn unreadable() -> Self {
        Self {
            content_hash: None,
            perceptual_hash: None,
            capture_time: None,
        }
    }

    pub fn is_readable(&self) -> bool {
        self.content_hash.is_some()
    }

    pub fn into_record(self, path: String) -> FingerprintRecord {
        FingerprintRecord {
            path,
            content_hash: self.content_hash,
            perceptual_hash: self.perceptual_hash.map(|h| h.to_hex()),
            capture_time: self.capture_time,
        }
    }
}

#[derive(Default)]
pub struct Fingerprinter {
    hash_service: HashService,
    perceptual: PerceptualHasher,
    exif_service: ExifService,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fingerprint a file, reading it from disk once.
    pub fn fingerprint(&self, path: &Path) -> Fingerprint {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Cannot read {}: {}", path.display(), e);
                return Fingerprint::unreadable();
            }
        };

        let image = match image::load_from_memory(&bytes) {
            Ok(image) => image,
            Err(e) => {
                log::warn!("Cannot decode {}: {}", path.display(), e);
                return Fingerprint::unreadable();
            }
        };

        Fingerprint {
            content_hash: Some(self.hash_service.hash_bytes(&bytes)),
            perceptual_hash: Some(self.perceptual.hash(&image)),
            capture_time: self.exif_service.capture_time(&bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use tempfile::TempDir;

    fn create_test_image(path: &Path, width: u32, height: u32) {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            let intensity = ((x + y) % 256) as u8;
            Rgb([intensity, intensity, intensity])
        });
        img.save(path).unwrap();
    }

    #[test]
    fn test_identical_files_share_fingerprint() {
        let temp_dir = TempDir::new().unwrap();
        let a = temp_dir.path().join("a.png");
        let b = temp_dir.path().join("b.png");
        create_test_image(&a, 64, 48);
        fs::copy(&a, &b).unwrap();

        let fingerprinter = Fingerprinter::new();
        let fa = fingerprinter.fingerprint(&a);
        let fb = fingerprinter.fingerprint(&b);

        assert!(fa.is_readable());
        assert_eq!(fa, fb);
        assert_eq!(fa.capture_time, None);
    }

    #[test]
    fn test_corrupt_file_has_no_hashes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.jpg");
        fs::write(&path, b"\xff\xd8 truncated").unwrap();

        let fingerprint = Fingerprinter::new().fingerprint(&path);
        assert_eq!(fingerprint, Fingerprint::unreadable());
        assert!(!fingerprint.is_readable());
    }

    #[test]
    fn test_missing_file_is_unreadable() {
        let fingerprint = Fingerprinter::new().fingerprint(Path::new("/non/existent/file.jpg"));
        assert!(!fingerprint.is_readable());
    }

    #[test]
    fn test_record_stores_hex_hash() {
        let fingerprint = Fingerprint {
            content_hash: Some("abc".to_string()),
            perceptual_hash: Some(PerceptualHash::from_u64(0xff)),
            capture_time: None,
        };
        let record = fingerprint.into_record("/p/a.jpg".to_string());
        assert_eq!(record.perceptual_hash.as_deref(), Some("00000000000000ff"));
    }
}
