//! On-disk layout of a scanned folder: the hidden state directory, the
//! output folders created by apply, and the file types the scanner accepts.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const STATE_DIR: &str = ".photocull";
pub const DB_FILE: &str = "session.db";
pub const THUMBS_DIR: &str = "thumbs";
pub const LOGS_DIR: &str = "logs";
pub const CONFIG_FILE: &str = "config.toml";

pub const KEEP_FOLDER: &str = "03_KEEP";
pub const ARCHIVE_DUPES_FOLDER: &str = "04_ARCHIVE_DUPES";
pub const ARCHIVE_LOW_QUALITY_FOLDER: &str = "05_ARCHIVE_LOW_QUALITY";

pub const OUTPUT_FOLDERS: [&str; 3] = [KEEP_FOLDER, ARCHIVE_DUPES_FOLDER, ARCHIVE_LOW_QUALITY_FOLDER];

pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

pub fn state_dir(folder: &Path) -> PathBuf {
    folder.join(STATE_DIR)
}

pub fn ensure_state_dir(folder: &Path) -> io::Result<PathBuf> {
    let dir = state_dir(folder);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn db_path(folder: &Path) -> PathBuf {
    state_dir(folder).join(DB_FILE)
}

pub fn thumbs_dir(folder: &Path) -> PathBuf {
    state_dir(folder).join(THUMBS_DIR)
}

pub fn logs_dir(folder: &Path) -> PathBuf {
    state_dir(folder).join(LOGS_DIR)
}

pub fn has_session(folder: &Path) -> bool {
    db_path(folder).is_file()
}

/// Directory names pruned from every walk of the source folder.
pub fn is_excluded_dir(name: &str) -> bool {
    name == STATE_DIR || OUTPUT_FOLDERS.contains(&name)
}

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
}

/// Returns `dest` if free, otherwise the first free `stem_N.ext` sibling
/// counting up from 1. Never returns an existing path.
pub fn resolve_collision(dest: &Path) -> PathBuf {
    if !dest.exists() {
        return dest.to_path_buf();
    }

    let parent = dest.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = dest
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = dest.extension().map(|e| e.to_string_lossy().into_owned());

    let mut counter = 1u32;
    loop {
        let name = match &ext {
            Some(ext) => format!("{}_{}.{}", stem, counter, ext),
            None => format!("{}_{}", stem, counter),
        };
        let candidate = parent.join(name);
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_supported_extensions_case_insensitive() {
        assert!(is_supported_image(Path::new("/a/b.JPG")));
        assert!(is_supported_image(Path::new("/a/b.jpeg")));
        assert!(is_supported_image(Path::new("/a/b.Png")));
        assert!(!is_supported_image(Path::new("/a/b.gif")));
        assert!(!is_supported_image(Path::new("/a/noext")));
    }

    #[test]
    fn test_excluded_dirs() {
        assert!(is_excluded_dir(".photocull"));
        assert!(is_excluded_dir("03_KEEP"));
        assert!(is_excluded_dir("04_ARCHIVE_DUPES"));
        assert!(is_excluded_dir("05_ARCHIVE_LOW_QUALITY"));
        assert!(!is_excluded_dir("holiday"));
    }

    #[test]
    fn test_resolve_collision_counts_up() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("img.jpg");
        assert_eq!(resolve_collision(&dest), dest);

        fs::write(&dest, b"a").unwrap();
        let first = resolve_collision(&dest);
        assert_eq!(first, temp_dir.path().join("img_1.jpg"));

        fs::write(&first, b"b").unwrap();
        assert_eq!(resolve_collision(&dest), temp_dir.path().join("img_2.jpg"));
    }
}
