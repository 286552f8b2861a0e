//! Entry points for a front end. Errors cross this boundary as strings.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;

use crate::config::ScanConfig;
use crate::core::file_ops::{ApplyReport, FileOperator, UndoReport};
use crate::core::progress::{CancellationToken, ChannelReporter, ScanEvent};
use crate::core::scanner::{ScanError, ScanStatus, ScannerService};
use crate::database::SessionStore;
use crate::database::models::{ScanPhase, Verdict};

/// A scan running on its own thread.
pub struct ScanHandle {
    events: mpsc::UnboundedReceiver<ScanEvent>,
    token: CancellationToken,
    worker: Option<JoinHandle<ScanStatus>>,
    last_phase: ScanPhase,
}

impl ScanHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Block until the next event. `None` once the scan thread is gone and
    /// every event has been received.
    pub fn next_event_blocking(&mut self) -> Option<ScanEvent> {
        let event = self.events.blocking_recv();
        self.observe(event.as_ref());
        event
    }

    pub fn try_next_event(&mut self) -> Option<ScanEvent> {
        let event = self.events.try_recv().ok();
        self.observe(event.as_ref());
        event
    }

    /// Wait for the scan thread and return its final status.
    pub fn wait(mut self) -> ScanStatus {
        let Some(worker) = self.worker.take() else {
            return ScanStatus::Failed {
                phase: self.last_phase,
                cause: "scan already collected".to_string(),
            };
        };
        match worker.join() {
            Ok(status) => status,
            Err(_) => {
                while let Some(event) = self.try_next_event() {
                    if let ScanEvent::Finished(status) = event {
                        return status;
                    }
                }
                log::error!("Scan thread panicked during {}", self.last_phase);
                ScanStatus::Failed {
                    phase: self.last_phase,
                    cause: "scan thread panicked".to_string(),
                }
            }
        }
    }

    fn observe(&mut self, event: Option<&ScanEvent>) {
        if let Some(ScanEvent::Progress(progress)) = event {
            self.last_phase = progress.phase;
        }
    }
}

/// Start scanning `folder` in the background.
pub fn start_scan(folder: &Path, config: ScanConfig) -> Result<ScanHandle, String> {
    start_scan_with(ScannerService::new(folder, config))
}

/// Start a configured scanner in the background. Its progress reporter is
/// replaced by the handle's event channel.
pub fn start_scan_with(scanner: ScannerService) -> Result<ScanHandle, String> {
    if !scanner.folder().is_dir() {
        return Err(ScanError::InvalidPath {
            path: scanner.folder().to_string_lossy().to_string(),
        }
        .to_string());
    }
    scanner.config().validate().map_err(|e| e.to_string())?;

    let (sender, receiver) = mpsc::unbounded_channel();
    let token = scanner.cancellation_token();
    let scanner = scanner.with_reporter(Arc::new(ChannelReporter::new(sender.clone())));

    let worker = thread::Builder::new()
        .name("photocull-scan".to_string())
        .spawn(move || {
            let status = match SessionStore::open(scanner.folder()) {
                Ok(mut store) => scanner.run(&mut store),
                Err(e) => {
                    log::error!("Cannot open session for {}: {}", scanner.folder().display(), e);
                    ScanStatus::Failed {
                        phase: ScanPhase::Collecting,
                        cause: e.to_string(),
                    }
                }
            };
            let _ = sender.send(ScanEvent::Finished(status.clone()));
            status
        })
        .map_err(|e| format!("Failed to start scan thread: {}", e))?;

    Ok(ScanHandle {
        events: receiver,
        token,
        worker: Some(worker),
        last_phase: ScanPhase::Collecting,
    })
}

pub fn cancel_scan(handle: &ScanHandle) {
    handle.cancel();
}

/// Read-side view of a session. Safe to use while a scan is running.
pub fn open_session(folder: &Path) -> Result<SessionStore, String> {
    SessionStore::open_reader(folder).map_err(|e| e.to_string())
}

pub fn set_verdict(folder: &Path, photo_path: &str, verdict: Verdict) -> Result<(), String> {
    let store = SessionStore::open_existing(folder).map_err(|e| e.to_string())?;
    store
        .photos()
        .set_user_verdict(photo_path, verdict)
        .map_err(|e| e.to_string())
}

pub fn apply_verdicts(folder: &Path) -> Result<ApplyReport, String> {
    let mut store = SessionStore::open_existing(folder).map_err(|e| e.to_string())?;
    FileOperator::new(folder)
        .apply(&mut store)
        .map_err(|e| e.to_string())
}

pub fn undo_last_apply(folder: &Path) -> Result<UndoReport, String> {
    let mut store = SessionStore::open_existing(folder).map_err(|e| e.to_string())?;
    FileOperator::new(folder)
        .undo_latest(&mut store)
        .map_err(|e| e.to_string())
}

/// Forget everything scanned for `folder`. Files on disk are not touched.
pub fn reset_session(folder: &Path) -> Result<(), String> {
    let mut store = SessionStore::open_existing(folder).map_err(|e| e.to_string())?;
    store.reset().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use tempfile::TempDir;

    fn create_test_image(path: &Path, width: u32, height: u32) {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            let intensity = ((x * 3 + y) % 256) as u8;
            Rgb([intensity, intensity, intensity])
        });
        img.save(path).unwrap();
    }

    #[test]
    fn test_background_scan_reports_and_finishes() {
        let temp_dir = TempDir::new().unwrap();
        create_test_image(&temp_dir.path().join("a.png"), 32, 32);

        let config = ScanConfig {
            face_detection_enabled: false,
            ..ScanConfig::default()
        };
        let mut handle = start_scan(temp_dir.path(), config).unwrap();

        let mut saw_progress = false;
        let mut finished = None;
        while let Some(event) = handle.next_event_blocking() {
            match event {
                ScanEvent::Progress(_) => saw_progress = true,
                ScanEvent::Finished(status) => finished = Some(status),
            }
        }
        assert!(saw_progress);
        assert!(finished.unwrap().is_completed());
        assert!(handle.wait().is_completed());

        let reader = open_session(temp_dir.path()).unwrap();
        assert_eq!(reader.photos().count().unwrap(), 1);
    }

    #[test]
    fn test_start_scan_rejects_bad_input() {
        let temp_dir = TempDir::new().unwrap();
        assert!(start_scan(&temp_dir.path().join("missing"), ScanConfig::default()).is_err());

        let bad = ScanConfig {
            keep_per_cluster: 0,
            ..ScanConfig::default()
        };
        assert!(start_scan(temp_dir.path(), bad).is_err());
    }

    #[test]
    fn test_commands_need_a_session() {
        let temp_dir = TempDir::new().unwrap();
        assert!(open_session(temp_dir.path()).is_err());
        assert!(set_verdict(temp_dir.path(), "/x.jpg", Verdict::Keep).is_err());
        assert!(undo_last_apply(temp_dir.path()).is_err());
    }
}
