use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::{ConfigError, ScanConfig};
use crate::core::duplicate::{ClusterCandidate, DuplicateDetector};
use crate::core::events::group_events;
use crate::core::faces::{self, FaceDetector};
use crate::core::fingerprint::Fingerprinter;
use crate::core::layout;
use crate::core::progress::{CancellationToken, ProgressReporter, ScanProgress, SilentReporter};
use crate::core::scoring::{PhotoScore, ScoringService};
use crate::core::suggest::{suggest_all, SuggestionPolicy};
use crate::database::models::{
    DiscoveredFile, FingerprintRecord, Photo, ScanPhase, ScoreRecord, SessionStatus,
};
use crate::database::repositories::{
    ClusterRepository, EventRepository, PhotoRepository, SessionRepository,
};
use crate::database::{SessionStore, StoreError};

/// Photos processed between cancellation checks and progress reports.
pub const PROGRESS_INTERVAL: usize = 50;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Session store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Operation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub total_photos: usize,
    pub added: usize,
    pub changed: usize,
    pub orphaned: usize,
    pub fingerprinted: usize,
    pub unreadable: usize,
    pub scored: usize,
    pub clusters: usize,
    pub duplicate_clusters: usize,
    pub events: usize,
    pub suggested: usize,
}

/// How a scan ended. Cancelled and failed scans keep every phase they
/// committed; the next run picks up from there.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScanStatus {
    Completed { summary: ScanSummary },
    Cancelled { phase: ScanPhase },
    Failed { phase: ScanPhase, cause: String },
}

impl ScanStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, ScanStatus::Completed { .. })
    }
}

/// Walk `folder` for supported images, pruning the state directory and the
/// apply output folders. Unreadable entries are skipped with a warning.
pub fn discover_files(
    folder: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<DiscoveredFile>, ScanError> {
    let walker = WalkDir::new(folder)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !layout::is_excluded_dir(&entry.file_name().to_string_lossy())
        });

    let mut files = Vec::new();
    for entry in walker {
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() || !layout::is_supported_image(entry.path()) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                log::warn!("Cannot stat {}: {}", entry.path().display(), e);
                continue;
            }
        };
        let modified = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        files.push(DiscoveredFile {
            path: entry.path().to_string_lossy().to_string(),
            file_name: entry.file_name().to_string_lossy().to_string(),
            file_size: metadata.len() as i64,
            modified,
        });
    }

    Ok(files)
}

/// Runs the scan phases against a session store:
/// collect, fingerprint, cluster, score, group events, suggest.
///
/// Every phase commits its results in one transaction. Per-photo phases
/// (fingerprinting, scoring) check for cancellation every
/// [`PROGRESS_INTERVAL`] photos and commit what they finished before
/// stopping, so a rerun only processes the remainder.
pub struct ScannerService {
    folder: PathBuf,
    config: ScanConfig,
    detector: Option<Arc<dyn FaceDetector>>,
    reporter: Arc<dyn ProgressReporter>,
    cancellation_token: CancellationToken,
    fingerprinter: Fingerprinter,
}

impl ScannerService {
    pub fn new(folder: &Path, config: ScanConfig) -> Self {
        Self {
            folder: folder.to_path_buf(),
            config,
            detector: None,
            reporter: Arc::new(SilentReporter),
            cancellation_token: CancellationToken::new(),
            fingerprinter: Fingerprinter::new(),
        }
    }

    pub fn with_face_detector(mut self, detector: Arc<dyn FaceDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn cancel_scan(&self) {
        self.cancellation_token.cancel();
    }

    /// Run a scan to completion, cancellation or failure. The session status
    /// is updated to match the returned value.
    pub fn run(&self, store: &mut SessionStore) -> ScanStatus {
        let mut phase = ScanPhase::Collecting;
        let mut summary = ScanSummary::default();

        let (status, session_status) = match self.run_phases(store, &mut phase, &mut summary) {
            Ok(()) => {
                log::info!(
                    "Scan of {} complete: {} photos, {} duplicate clusters",
                    self.folder.display(),
                    summary.total_photos,
                    summary.duplicate_clusters
                );
                (ScanStatus::Completed { summary }, SessionStatus::Scanned)
            }
            Err(ScanError::Cancelled) => {
                log::info!("Scan cancelled during {}", phase);
                (ScanStatus::Cancelled { phase }, SessionStatus::Cancelled)
            }
            Err(e) => {
                log::error!("Scan failed during {}: {}", phase, e);
                let cause = e.to_string();
                (
                    ScanStatus::Failed {
                        phase,
                        cause: cause.clone(),
                    },
                    SessionStatus::Failed(cause),
                )
            }
        };

        let result = store.write(|conn| SessionRepository::new(conn).set_status(session_status));
        if let Err(e) = result {
            log::error!("Could not record scan status: {}", e);
        }
        status
    }

    fn run_phases(
        &self,
        store: &mut SessionStore,
        phase: &mut ScanPhase,
        summary: &mut ScanSummary,
    ) -> Result<(), ScanError> {
        if !self.folder.is_dir() {
            return Err(ScanError::InvalidPath {
                path: self.folder.to_string_lossy().to_string(),
            });
        }
        self.config.validate()?;
        self.prepare(store)?;

        *phase = ScanPhase::Collecting;
        self.checkpoint()?;
        self.collect(store, summary)?;

        *phase = ScanPhase::Fingerprinting;
        self.checkpoint()?;
        self.fingerprint(store, summary)?;

        *phase = ScanPhase::Clustering;
        self.checkpoint()?;
        self.cluster(store, summary)?;

        *phase = ScanPhase::Scoring;
        self.checkpoint()?;
        self.score(store, summary)?;

        *phase = ScanPhase::Events;
        self.checkpoint()?;
        self.assign_events(store, summary)?;

        *phase = ScanPhase::Suggesting;
        self.checkpoint()?;
        self.suggest(store, summary)?;

        *phase = ScanPhase::Complete;
        store.write(|conn| SessionRepository::new(conn).set_phase(ScanPhase::Complete))?;
        self.reporter.on_phase_complete(ScanPhase::Complete);
        Ok(())
    }

    fn checkpoint(&self) -> Result<(), ScanError> {
        if self.cancellation_token.is_cancelled() {
            Err(ScanError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Create the session on first run and snapshot this run's options.
    /// Toggling face detection invalidates every stored score.
    fn prepare(&self, store: &mut SessionStore) -> Result<(), ScanError> {
        let folder = self.folder.to_string_lossy().to_string();
        let config = &self.config;
        store.write(|conn| {
            let sessions = SessionRepository::new(conn);
            let previous = sessions.get_or_create(&folder, config)?;
            if previous.config.face_detection_enabled != config.face_detection_enabled {
                let reset = PhotoRepository::new(conn).reset_scores()?;
                log::info!(
                    "Face detection {} since last scan, rescoring {} photos",
                    if config.face_detection_enabled { "enabled" } else { "disabled" },
                    reset
                );
            }
            sessions.save_config(config)?;
            sessions.set_status(SessionStatus::Scanning)?;
            Ok(())
        })?;
        Ok(())
    }

    fn collect(&self, store: &mut SessionStore, summary: &mut ScanSummary) -> Result<(), ScanError> {
        self.reporter.on_phase_start(ScanPhase::Collecting, 0);
        let discovered = discover_files(&self.folder, &self.cancellation_token)?;
        let total = discovered.len();

        let stats = store.write(|conn| {
            let stats = PhotoRepository::new(conn).reconcile(&discovered)?;
            let sessions = SessionRepository::new(conn);
            sessions.set_progress(total as i64, stats.unchanged as i64)?;
            sessions.set_phase(ScanPhase::Collecting)?;
            Ok(stats)
        })?;

        log::info!(
            "Collected {} photos: {} new, {} changed, {} gone, {} back",
            total,
            stats.added,
            stats.changed,
            stats.orphaned,
            stats.restored
        );
        summary.total_photos = total;
        summary.added = stats.added;
        summary.changed = stats.changed;
        summary.orphaned = stats.orphaned;

        self.reporter.on_progress(&ScanProgress {
            phase: ScanPhase::Collecting,
            processed: total,
            total,
        });
        self.reporter.on_phase_complete(ScanPhase::Collecting);
        Ok(())
    }

    fn fingerprint(&self, store: &mut SessionStore, summary: &mut ScanSummary) -> Result<(), ScanError> {
        let pending = store.photos().pending_fingerprint()?;
        let total = pending.len();
        self.reporter.on_phase_start(ScanPhase::Fingerprinting, total);

        let mut records: Vec<FingerprintRecord> = Vec::with_capacity(total);
        let mut cancelled = false;
        for chunk in pending.chunks(PROGRESS_INTERVAL) {
            if self.cancellation_token.is_cancelled() {
                cancelled = true;
                break;
            }
            let batch: Vec<FingerprintRecord> = chunk
                .par_iter()
                .map(|photo| {
                    self.fingerprinter
                        .fingerprint(Path::new(&photo.path))
                        .into_record(photo.path.clone())
                })
                .collect();
            records.extend(batch);
            self.reporter.on_progress(&ScanProgress {
                phase: ScanPhase::Fingerprinting,
                processed: records.len(),
                total,
            });
        }

        let done = records.len();
        let unreadable = records.iter().filter(|r| r.content_hash.is_none()).count();
        let total_photos = summary.total_photos as i64;
        store.write(|conn| {
            PhotoRepository::new(conn).save_fingerprints(&records)?;
            let sessions = SessionRepository::new(conn);
            sessions.set_progress(total_photos, total_photos - (total - done) as i64)?;
            if !cancelled {
                sessions.set_phase(ScanPhase::Fingerprinting)?;
            }
            Ok(())
        })?;
        summary.fingerprinted = done;
        summary.unreadable = unreadable;
        log::info!("Fingerprinted {} of {} pending photos ({} unreadable)", done, total, unreadable);

        if cancelled {
            return Err(ScanError::Cancelled);
        }
        self.reporter.on_phase_complete(ScanPhase::Fingerprinting);
        Ok(())
    }

    fn cluster(&self, store: &mut SessionStore, summary: &mut ScanSummary) -> Result<(), ScanError> {
        let photos = store.photos().all()?;
        self.reporter.on_phase_start(ScanPhase::Clustering, photos.len());

        let candidates: Vec<ClusterCandidate> = photos.iter().map(ClusterCandidate::from_photo).collect();
        let result = DuplicateDetector::new(self.config.phash_threshold).cluster(&candidates);

        store.write(|conn| {
            ClusterRepository::new(conn).replace_all(&result.clusters)?;
            PhotoRepository::new(conn).assign_clusters(&result.assignments)?;
            SessionRepository::new(conn).set_phase(ScanPhase::Clustering)?;
            Ok(())
        })?;
        summary.clusters = result.clusters.len();
        summary.duplicate_clusters = result.duplicate_clusters();

        self.reporter.on_progress(&ScanProgress {
            phase: ScanPhase::Clustering,
            processed: photos.len(),
            total: photos.len(),
        });
        self.reporter.on_phase_complete(ScanPhase::Clustering);
        Ok(())
    }

    /// Score photos that have none yet. Byte-identical photos are decoded
    /// once and share the score.
    fn score(&self, store: &mut SessionStore, summary: &mut ScanSummary) -> Result<(), ScanError> {
        let pending = store.photos().pending_scoring()?;
        let total = pending.len();
        self.reporter.on_phase_start(ScanPhase::Scoring, total);

        let scorer = ScoringService::new(faces::analyzer_for(&self.config, self.detector.clone()));
        let groups = group_by_content(&pending);

        let mut records: Vec<ScoreRecord> = Vec::with_capacity(total);
        let mut cancelled = false;
        for chunk in groups.chunks(PROGRESS_INTERVAL) {
            if self.cancellation_token.is_cancelled() {
                cancelled = true;
                break;
            }
            let batch: Vec<ScoreRecord> = chunk
                .par_iter()
                .flat_map_iter(|group| {
                    let score = if group.readable {
                        scorer.score_path(Path::new(group.members[0]))
                    } else {
                        PhotoScore::unreadable()
                    };
                    group.members.iter().map(move |path| ScoreRecord {
                        path: path.to_string(),
                        sharpness: score.metrics.sharpness,
                        brightness: score.metrics.brightness,
                        quality_score: score.quality_score,
                        faces: score.faces,
                    })
                })
                .collect();
            records.extend(batch);
            self.reporter.on_progress(&ScanProgress {
                phase: ScanPhase::Scoring,
                processed: records.len(),
                total,
            });
        }

        store.write(|conn| {
            PhotoRepository::new(conn).save_scores(&records)?;
            if !cancelled {
                SessionRepository::new(conn).set_phase(ScanPhase::Scoring)?;
            }
            Ok(())
        })?;
        summary.scored = records.len();
        log::info!("Scored {} of {} pending photos", records.len(), total);

        if cancelled {
            return Err(ScanError::Cancelled);
        }
        self.reporter.on_phase_complete(ScanPhase::Scoring);
        Ok(())
    }

    fn assign_events(&self, store: &mut SessionStore, summary: &mut ScanSummary) -> Result<(), ScanError> {
        let photos = store.photos().all()?;
        self.reporter.on_phase_start(ScanPhase::Events, photos.len());

        let dated: Vec<(String, Option<_>)> = photos
            .iter()
            .map(|photo| (photo.path.clone(), photo.capture_time))
            .collect();
        let grouping = group_events(&dated, self.config.event_gap_hours);

        store.write(|conn| {
            EventRepository::new(conn).replace_all(&grouping.events)?;
            PhotoRepository::new(conn).assign_events(&grouping.assignments)?;
            SessionRepository::new(conn).set_phase(ScanPhase::Events)?;
            Ok(())
        })?;
        summary.events = grouping.events.len();

        self.reporter.on_phase_complete(ScanPhase::Events);
        Ok(())
    }

    /// Recompute suggestions from scratch. User decisions and applied
    /// photos keep their verdicts.
    fn suggest(&self, store: &mut SessionStore, summary: &mut ScanSummary) -> Result<(), ScanError> {
        self.reporter.on_phase_start(ScanPhase::Suggesting, summary.total_photos);
        let policy = SuggestionPolicy::from(&self.config);

        let suggested = store.write(|conn| {
            let photos = PhotoRepository::new(conn);
            photos.reset_suggestions()?;
            let all = photos.all()?;
            let clusters = ClusterRepository::new(conn).all()?;
            let verdicts = suggest_all(&clusters, &all, &policy);
            let saved = photos.save_suggestions(&verdicts)?;
            SessionRepository::new(conn).set_phase(ScanPhase::Suggesting)?;
            Ok(saved)
        })?;
        summary.suggested = suggested;

        self.reporter.on_phase_complete(ScanPhase::Suggesting);
        Ok(())
    }
}

struct ContentGroup<'a> {
    readable: bool,
    members: Vec<&'a str>,
}

/// Group photos sharing a content hash. Photos without one stand alone.
fn group_by_content(photos: &[Photo]) -> Vec<ContentGroup<'_>> {
    let mut by_hash: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut groups = Vec::new();
    for photo in photos {
        match photo.content_hash.as_deref() {
            Some(hash) => by_hash.entry(hash).or_default().push(&photo.path),
            None => groups.push(ContentGroup {
                readable: false,
                members: vec![&photo.path],
            }),
        }
    }
    groups.extend(by_hash.into_values().map(|members| ContentGroup {
        readable: true,
        members,
    }));
    groups
}
