//! Applying verdicts to the filesystem, and undoing the latest batch.
//!
//! KEEP moves into `03_KEEP`, ARCHIVE into `04_ARCHIVE_DUPES` for exact
//! duplicates and `05_ARCHIVE_LOW_QUALITY` otherwise, DELETE goes to the
//! system trash. Nothing is ever overwritten: a name clash gets a numeric
//! suffix. Every operation, failed or not, is recorded in the apply log and
//! in CSV and JSON files under `.photocull/logs`.

use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::core::layout;
use crate::database::models::{
    ApplyLogEntry, Destination, DupKind, Photo, SessionStatus, Verdict,
};
use crate::database::repositories::{ApplyLogRepository, PhotoRepository, SessionRepository};
use crate::database::{SessionStore, StoreError};

#[derive(Debug, Error)]
pub enum FileOpError {
    #[error("Session store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("CSV log error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON log error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Nothing to undo")]
    NothingToUndo,

    #[error("Only the latest batch ({latest}) can be undone, not batch {requested}")]
    NotLatestBatch { requested: i64, latest: i64 },

    #[error("Batch {0} has already been undone")]
    AlreadyUndone(i64),
}

/// Where DELETE verdicts go.
pub trait TrashBin: Send + Sync {
    fn send_to_trash(&self, path: &Path) -> io::Result<()>;
}

/// The platform recycle bin.
pub struct SystemTrash;

impl TrashBin for SystemTrash {
    fn send_to_trash(&self, path: &Path) -> io::Result<()> {
        trash::delete(path).map_err(|e| io::Error::other(format!("trash error: {}", e)))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    /// `None` when there was nothing to apply.
    pub batch_id: Option<i64>,
    pub entries: Vec<ApplyLogEntry>,
    pub log_files: Vec<PathBuf>,
}

impl ApplyReport {
    pub fn succeeded(&self) -> usize {
        self.entries.iter().filter(|e| e.success).count()
    }

    pub fn failed(&self) -> usize {
        self.entries.iter().filter(|e| !e.success).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoredFile {
    pub photo_path: String,
    pub from: PathBuf,
    pub to: PathBuf,
    /// The original path was taken, so the photo now lives at `to` and its
    /// record follows it there.
    pub relocated: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UndoReport {
    pub batch_id: i64,
    pub restored: Vec<RestoredFile>,
    /// Photos sent to the trash; they have to be restored by hand.
    pub not_undoable: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub removed_dirs: Vec<PathBuf>,
}

/// One row of the CSV and JSON apply logs.
#[derive(Debug, Clone, Serialize)]
struct LogRow {
    batch_id: i64,
    photo_path: String,
    destination: String,
    destination_folder: String,
    verdict: String,
    dup_kind: String,
    cluster_id: Option<i64>,
    success: bool,
    error: String,
    applied_at: String,
}

#[derive(Debug, Serialize)]
struct LogSummary {
    total_processed: usize,
    kept: usize,
    archived: usize,
    deleted: usize,
    archived_dupes: usize,
    archived_low_quality: usize,
    failed: usize,
}

#[derive(Debug, Serialize)]
struct JsonLog<'a> {
    session_id: &'a str,
    batch_id: i64,
    applied_at: &'a str,
    source_folder: String,
    entries: &'a [LogRow],
    summary: LogSummary,
}

pub struct FileOperator {
    folder: PathBuf,
    trash: Arc<dyn TrashBin>,
}

impl FileOperator {
    pub fn new(folder: &Path) -> Self {
        Self {
            folder: folder.to_path_buf(),
            trash: Arc::new(SystemTrash),
        }
    }

    pub fn with_trash(mut self, trash: Arc<dyn TrashBin>) -> Self {
        self.trash = trash;
        self
    }

    pub fn destination_folder(&self, photo: &Photo) -> Option<&'static str> {
        match photo.verdict {
            Verdict::Keep => Some(layout::KEEP_FOLDER),
            Verdict::Archive if photo.dup_kind == DupKind::Exact => Some(layout::ARCHIVE_DUPES_FOLDER),
            Verdict::Archive => Some(layout::ARCHIVE_LOW_QUALITY_FOLDER),
            Verdict::Delete | Verdict::Review => None,
        }
    }

    /// Apply every decided, not yet applied photo as one numbered batch.
    ///
    /// Failures are recorded per photo and do not stop the batch.
    pub fn apply(&self, store: &mut SessionStore) -> Result<ApplyReport, FileOpError> {
        let pending: Vec<Photo> = store
            .photos()
            .all()?
            .into_iter()
            .filter(|p| p.verdict != Verdict::Review && p.applied_batch.is_none())
            .collect();

        if pending.is_empty() {
            log::info!("No decided photos to apply");
            return Ok(ApplyReport::default());
        }

        let batch_id = store.apply_log().next_batch_id()?;
        let session_id = store
            .sessions()
            .get()?
            .map(|s| s.id)
            .unwrap_or_default();
        log::info!("Applying batch {} ({} photos)", batch_id, pending.len());

        let mut entries = Vec::with_capacity(pending.len());
        let mut rows = Vec::with_capacity(pending.len());
        for photo in &pending {
            let (destination, result) = self.apply_one(photo);
            let folder_name = self.destination_folder(photo).unwrap_or("");
            let entry = ApplyLogEntry {
                batch_id,
                photo_path: photo.path.clone(),
                source_path: photo.path.clone(),
                destination,
                verdict: photo.verdict,
                success: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
                applied_at: Utc::now().to_rfc3339(),
                undone: false,
            };
            if let Some(error) = &entry.error {
                log::warn!("Could not apply {} to {}: {}", entry.verdict, photo.path, error);
            }
            rows.push(LogRow {
                batch_id,
                photo_path: entry.photo_path.clone(),
                destination: entry.destination.to_string(),
                destination_folder: folder_name.to_string(),
                verdict: entry.verdict.to_string(),
                dup_kind: String::from(photo.dup_kind),
                cluster_id: photo.cluster_id,
                success: entry.success,
                error: entry.error.clone().unwrap_or_default(),
                applied_at: entry.applied_at.clone(),
            });
            entries.push(entry);
        }

        store.write(|conn| {
            ApplyLogRepository::new(conn).insert_entries(&entries)?;
            let photos = PhotoRepository::new(conn);
            for entry in entries.iter().filter(|e| e.success) {
                photos.set_applied(&entry.photo_path, Some(batch_id))?;
            }
            let sessions = SessionRepository::new(conn);
            sessions.set_last_batch(Some(batch_id))?;
            sessions.set_status(SessionStatus::Applied)?;
            Ok(())
        })?;

        let log_files = match self.write_logs(&session_id, batch_id, &rows) {
            Ok(files) => files,
            Err(e) => {
                log::error!("Failed to write apply logs for batch {}: {}", batch_id, e);
                Vec::new()
            }
        };

        let report = ApplyReport {
            batch_id: Some(batch_id),
            entries,
            log_files,
        };
        log::info!(
            "Batch {} applied: {} succeeded, {} failed",
            batch_id,
            report.succeeded(),
            report.failed()
        );
        Ok(report)
    }

    fn apply_one(&self, photo: &Photo) -> (Destination, io::Result<()>) {
        let source = Path::new(&photo.path);
        if !source.is_file() {
            return (
                Destination::Unassigned,
                Err(io::Error::new(io::ErrorKind::NotFound, "source file missing")),
            );
        }

        match self.destination_folder(photo) {
            Some(folder_name) => {
                let dir = self.folder.join(folder_name);
                if let Err(e) = fs::create_dir_all(&dir) {
                    return (Destination::Unassigned, Err(e));
                }
                let target = layout::resolve_collision(&dir.join(&photo.file_name));
                let destination = Destination::Path(target.to_string_lossy().to_string());
                (destination, move_file(source, &target))
            }
            None => (Destination::RecycleBin, self.trash.send_to_trash(source)),
        }
    }

    /// Undo the latest batch. Moves are reversed newest first; trashed photos
    /// are reported as not undoable.
    pub fn undo(&self, store: &mut SessionStore, batch_id: i64) -> Result<UndoReport, FileOpError> {
        let latest = store
            .apply_log()
            .latest_batch_id()?
            .ok_or(FileOpError::NothingToUndo)?;
        if batch_id != latest {
            return Err(FileOpError::NotLatestBatch {
                requested: batch_id,
                latest,
            });
        }
        if store.apply_log().is_undone(batch_id)? {
            return Err(FileOpError::AlreadyUndone(batch_id));
        }

        let entries = store.apply_log().entries(batch_id)?;
        let mut report = UndoReport {
            batch_id,
            ..UndoReport::default()
        };

        for entry in entries.iter().rev().filter(|e| e.success) {
            let moved_to = match &entry.destination {
                Destination::Path(path) => PathBuf::from(path),
                Destination::RecycleBin => {
                    report.not_undoable.push(entry.photo_path.clone());
                    continue;
                }
                Destination::Unassigned => continue,
            };

            if !moved_to.is_file() {
                report.failed.push((
                    entry.photo_path.clone(),
                    format!("{} no longer exists", moved_to.display()),
                ));
                continue;
            }

            let original = Path::new(&entry.source_path);
            if let Some(parent) = original.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    report.failed.push((entry.photo_path.clone(), e.to_string()));
                    continue;
                }
            }

            let target = layout::resolve_collision(original);
            let relocated = target != original;
            if relocated {
                log::warn!(
                    "{} is occupied, restoring to {}",
                    original.display(),
                    target.display()
                );
            }
            match move_file(&moved_to, &target) {
                Ok(()) => report.restored.push(RestoredFile {
                    photo_path: entry.photo_path.clone(),
                    from: moved_to,
                    to: target,
                    relocated,
                }),
                Err(e) => report.failed.push((entry.photo_path.clone(), e.to_string())),
            }
        }

        store.write(|conn| {
            ApplyLogRepository::new(conn).mark_undone(batch_id)?;
            let photos = PhotoRepository::new(conn);
            for restored in &report.restored {
                if restored.relocated {
                    let new_path = restored.to.to_string_lossy();
                    photos.relocate(&restored.photo_path, &new_path)?;
                    photos.set_applied(&new_path, None)?;
                } else {
                    photos.set_applied(&restored.photo_path, None)?;
                }
            }
            let sessions = SessionRepository::new(conn);
            sessions.set_last_batch(None)?;
            sessions.set_status(SessionStatus::Scanned)?;
            Ok(())
        })?;

        report.removed_dirs = self.remove_empty_output_dirs();
        log::info!(
            "Batch {} undone: {} restored, {} not undoable, {} failed",
            batch_id,
            report.restored.len(),
            report.not_undoable.len(),
            report.failed.len()
        );
        Ok(report)
    }

    pub fn undo_latest(&self, store: &mut SessionStore) -> Result<UndoReport, FileOpError> {
        let latest = store
            .apply_log()
            .latest_batch_id()?
            .ok_or(FileOpError::NothingToUndo)?;
        self.undo(store, latest)
    }

    fn remove_empty_output_dirs(&self) -> Vec<PathBuf> {
        let mut removed = Vec::new();
        for name in layout::OUTPUT_FOLDERS {
            let dir = self.folder.join(name);
            let is_empty = fs::read_dir(&dir)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if is_empty {
                match fs::remove_dir(&dir) {
                    Ok(()) => removed.push(dir),
                    Err(e) => log::warn!("Could not remove {}: {}", dir.display(), e),
                }
            }
        }
        removed
    }

    fn write_logs(&self, session_id: &str, batch_id: i64, rows: &[LogRow]) -> Result<Vec<PathBuf>, FileOpError> {
        let log_dir = layout::logs_dir(&self.folder);
        fs::create_dir_all(&log_dir)?;

        let now = Utc::now();
        let stem = format!("apply_batch_{:04}_{}", batch_id, now.format("%Y-%m-%dT%H-%M-%S"));

        let csv_path = log_dir.join(format!("{}.csv", stem));
        let mut writer = csv::Writer::from_path(&csv_path)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;

        let count = |pred: &dyn Fn(&LogRow) -> bool| rows.iter().filter(|r| pred(r)).count();
        let applied_at = now.to_rfc3339();
        let json = JsonLog {
            session_id,
            batch_id,
            applied_at: &applied_at,
            source_folder: self.folder.to_string_lossy().to_string(),
            entries: rows,
            summary: LogSummary {
                total_processed: rows.len(),
                kept: count(&|r| r.success && r.verdict == Verdict::Keep.as_str()),
                archived: count(&|r| r.success && r.verdict == Verdict::Archive.as_str()),
                deleted: count(&|r| r.success && r.verdict == Verdict::Delete.as_str()),
                archived_dupes: count(&|r| r.success && r.destination_folder == layout::ARCHIVE_DUPES_FOLDER),
                archived_low_quality: count(&|r| {
                    r.success && r.destination_folder == layout::ARCHIVE_LOW_QUALITY_FOLDER
                }),
                failed: count(&|r| !r.success),
            },
        };
        let json_path = log_dir.join(format!("{}.json", stem));
        fs::write(&json_path, serde_json::to_string_pretty(&json)?)?;

        Ok(vec![csv_path, json_path])
    }
}

/// Rename, falling back to copy and delete across filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            fs::copy(from, to)?;
            if let Err(remove_err) = fs::remove_file(from) {
                let _ = fs::remove_file(to);
                return Err(remove_err);
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}
