use exif::experimental::Writer;
use exif::{Field, In, Tag, Value};
use image::{ImageBuffer, ImageFormat, Rgb, RgbImage};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use photocull::config::ScanConfig;
use photocull::core::faces::{BoundingBox, FaceDetector, FaceError};
use photocull::core::file_ops::{FileOperator, TrashBin};
use photocull::core::layout;
use photocull::core::progress::{CancellationToken, ProgressReporter, ScanProgress};
use photocull::core::scanner::{ScanStatus, ScanSummary, ScannerService};
use photocull::database::SessionStore;
use photocull::database::models::{ClusterKind, DiscoveredFile, DupKind, ScanPhase, Verdict};
use photocull::database::repositories::PhotoRepository;
use photocull::schema::{self, MIGRATIONS};

fn create_test_image(path: &Path, width: u32, height: u32) {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        let intensity = ((x + y) % 256) as u8;
        Rgb([intensity, intensity, intensity])
    });
    img.save(path).unwrap();
}

/// A small PNG whose bytes differ for every `seed`.
fn create_seeded_image(path: &Path, seed: u32) {
    let img = ImageBuffer::from_fn(8, 8, |x, y| {
        Rgb([(seed % 256) as u8, (x * 32) as u8, ((y * 32 + seed / 256) % 256) as u8])
    });
    img.save(path).unwrap();
}

/// A JPEG whose APP1 segment carries `taken` as EXIF DateTimeOriginal.
fn create_dated_jpeg(path: &Path, seed: u8, taken: &str) {
    let img: RgbImage = ImageBuffer::from_fn(32, 32, |x, y| {
        Rgb([seed.wrapping_mul(40), (x * 8) as u8, (y * 8) as u8])
    });
    let mut jpeg = Vec::new();
    img.write_to(&mut io::Cursor::new(&mut jpeg), ImageFormat::Jpeg)
        .unwrap();

    let field = Field {
        tag: Tag::DateTimeOriginal,
        ifd_num: In::PRIMARY,
        value: Value::Ascii(vec![taken.as_bytes().to_vec()]),
    };
    let mut writer = Writer::new();
    writer.push_field(&field);
    let mut tiff = io::Cursor::new(Vec::new());
    writer.write(&mut tiff, false).unwrap();
    let tiff = tiff.into_inner();

    let mut bytes = jpeg[..2].to_vec();
    bytes.extend_from_slice(&[0xFF, 0xE1]);
    bytes.extend_from_slice(&((tiff.len() + 8) as u16).to_be_bytes());
    bytes.extend_from_slice(b"Exif\0\0");
    bytes.extend_from_slice(&tiff);
    bytes.extend_from_slice(&jpeg[2..]);
    fs::write(path, bytes).unwrap();
}

fn no_faces() -> ScanConfig {
    ScanConfig {
        face_detection_enabled: false,
        ..ScanConfig::default()
    }
}

fn scan(folder: &Path, store: &mut SessionStore) -> ScanSummary {
    match ScannerService::new(folder, no_faces()).run(store) {
        ScanStatus::Completed { summary } => summary,
        other => panic!("scan did not complete: {:?}", other),
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[derive(Default)]
struct FakeTrash {
    trashed: Mutex<Vec<PathBuf>>,
}

impl TrashBin for FakeTrash {
    fn send_to_trash(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)?;
        self.trashed.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}

/// Cancels the scan once fingerprinting has finished `after` photos.
struct CancelDuringFingerprinting {
    token: CancellationToken,
    after: usize,
}

impl ProgressReporter for CancelDuringFingerprinting {
    fn on_progress(&self, progress: &ScanProgress) {
        if progress.phase == ScanPhase::Fingerprinting && progress.processed >= self.after {
            self.token.cancel();
        }
    }
}

/// Sees one face in the middle of every photo.
struct CenterFaceDetector;

impl FaceDetector for CenterFaceDetector {
    fn detect_faces(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, FaceError> {
        let (width, height) = image.dimensions();
        Ok(vec![BoundingBox::new(width / 4, height / 4, width / 2, height / 2)])
    }
}

#[test]
fn test_identical_copies_form_one_exact_cluster() {
    let temp_dir = TempDir::new().unwrap();
    let original = temp_dir.path().join("beach.png");
    let copy = temp_dir.path().join("beach_copy.png");
    create_test_image(&original, 64, 64);
    fs::copy(&original, &copy).unwrap();

    let mut store = SessionStore::open(temp_dir.path()).unwrap();
    let summary = scan(temp_dir.path(), &mut store);
    assert_eq!(summary.clusters, 1);
    assert_eq!(summary.duplicate_clusters, 1);

    let clusters = store.clusters().all().unwrap();
    assert_eq!(clusters[0].kind, ClusterKind::ExactDuplicate);
    assert_eq!(clusters[0].members, vec![path_str(&original), path_str(&copy)]);

    let photos = store.photos().all().unwrap();
    assert!(photos.iter().all(|p| p.dup_kind == DupKind::Exact));
    assert_eq!(photos[0].quality_score, photos[1].quality_score);
    // Equal scores: the smaller path wins.
    assert_eq!(photos[0].verdict, Verdict::Keep);
    assert_eq!(photos[1].verdict, Verdict::Archive);
}

#[test]
fn test_corrupt_file_stays_alone_with_zero_score() {
    let temp_dir = TempDir::new().unwrap();
    create_test_image(&temp_dir.path().join("good.png"), 64, 64);
    let broken = temp_dir.path().join("broken.jpg");
    fs::write(&broken, b"\xff\xd8\xff not really a jpeg").unwrap();

    let mut store = SessionStore::open(temp_dir.path()).unwrap();
    let summary = scan(temp_dir.path(), &mut store);
    assert_eq!(summary.unreadable, 1);
    assert_eq!(summary.duplicate_clusters, 0);

    let photo = store.photos().find(&path_str(&broken)).unwrap().unwrap();
    assert!(photo.fingerprinted);
    assert!(photo.content_hash.is_none());
    assert_eq!(photo.quality_score, 0.0);
    assert_eq!(photo.dup_kind, DupKind::None);
    assert_eq!(store.photos().in_cluster(photo.cluster_id.unwrap()).unwrap().len(), 1);
}

#[test]
fn test_cancelled_scan_resumes_where_it_stopped() {
    let temp_dir = TempDir::new().unwrap();
    for i in 0..120 {
        create_seeded_image(&temp_dir.path().join(format!("img_{:03}.png", i)), i);
    }

    let mut store = SessionStore::open(temp_dir.path()).unwrap();
    let token = CancellationToken::new();
    let reporter = Arc::new(CancelDuringFingerprinting {
        token: token.clone(),
        after: 50,
    });
    let status = ScannerService::new(temp_dir.path(), no_faces())
        .with_cancellation_token(token)
        .with_reporter(reporter)
        .run(&mut store);

    assert_eq!(
        status,
        ScanStatus::Cancelled {
            phase: ScanPhase::Fingerprinting
        }
    );
    assert_eq!(store.photos().pending_fingerprint().unwrap().len(), 70);
    let session = store.sessions().get().unwrap().unwrap();
    assert_eq!(session.phase, Some(ScanPhase::Collecting));

    let summary = scan(temp_dir.path(), &mut store);
    assert_eq!(summary.added, 0);
    assert_eq!(summary.fingerprinted, 70);
    assert_eq!(summary.scored, 120);
    assert!(store.photos().pending_fingerprint().unwrap().is_empty());
    assert!(store.photos().all().unwrap().iter().all(|p| p.verdict != Verdict::Review));
}

#[test]
fn test_rescan_is_deterministic() {
    let temp_dir = TempDir::new().unwrap();
    for i in 0..6 {
        create_seeded_image(&temp_dir.path().join(format!("p{}.png", i)), i * 40);
    }
    let a = temp_dir.path().join("p0.png");
    fs::copy(&a, temp_dir.path().join("p0_copy.png")).unwrap();

    let mut store = SessionStore::open(temp_dir.path()).unwrap();
    scan(temp_dir.path(), &mut store);
    let clusters = store.clusters().all().unwrap();
    let photos = store.photos().all().unwrap();

    let summary = scan(temp_dir.path(), &mut store);
    assert_eq!(summary.fingerprinted, 0);
    assert_eq!(summary.scored, 0);
    assert_eq!(store.clusters().all().unwrap(), clusters);
    assert_eq!(store.photos().all().unwrap(), photos);
}

#[test]
fn test_user_override_survives_rescan() {
    let temp_dir = TempDir::new().unwrap();
    let a = temp_dir.path().join("a.png");
    create_test_image(&a, 64, 64);
    fs::copy(&a, temp_dir.path().join("b.png")).unwrap();

    let mut store = SessionStore::open(temp_dir.path()).unwrap();
    scan(temp_dir.path(), &mut store);
    store.photos().set_user_verdict(&path_str(&a), Verdict::Delete).unwrap();

    scan(temp_dir.path(), &mut store);
    let photo = store.photos().find(&path_str(&a)).unwrap().unwrap();
    assert_eq!(photo.verdict, Verdict::Delete);
    assert!(photo.user_override);

    // The remaining copy now takes the single keep slot.
    let other = store
        .photos()
        .find(&path_str(&temp_dir.path().join("b.png")))
        .unwrap()
        .unwrap();
    assert_eq!(other.verdict, Verdict::Keep);
}

#[test]
fn test_user_override_survives_file_change() {
    let temp_dir = TempDir::new().unwrap();
    let a = temp_dir.path().join("a.png");
    create_test_image(&a, 64, 64);

    let mut store = SessionStore::open(temp_dir.path()).unwrap();
    scan(temp_dir.path(), &mut store);
    store.photos().set_user_verdict(&path_str(&a), Verdict::Delete).unwrap();

    create_test_image(&a, 96, 64);
    let summary = scan(temp_dir.path(), &mut store);
    assert_eq!(summary.changed, 1);

    let photo = store.photos().find(&path_str(&a)).unwrap().unwrap();
    assert_eq!(photo.verdict, Verdict::Delete);
    assert!(photo.user_override);
    assert!(photo.fingerprinted);
}

#[test]
fn test_exif_capture_times_drive_events() {
    let temp_dir = TempDir::new().unwrap();
    let folder = temp_dir.path();
    let morning = folder.join("z_morning.jpg");
    let noon = folder.join("a_noon.jpg");
    let evening = folder.join("m_evening.jpg");
    create_dated_jpeg(&morning, 1, "2024:05:01 10:00:00");
    create_dated_jpeg(&noon, 2, "2024:05:01 12:30:00");
    create_dated_jpeg(&evening, 3, "2024:05:01 19:00:00");
    create_test_image(&folder.join("undated.png"), 32, 32);

    let mut store = SessionStore::open(folder).unwrap();
    let summary = scan(folder, &mut store);
    assert_eq!(summary.events, 2);

    let photo = store.photos().find(&path_str(&morning)).unwrap().unwrap();
    assert_eq!(
        photo.capture_time.map(|t| t.to_string()),
        Some("2024-05-01 10:00:00".to_string())
    );
    let undated = store
        .photos()
        .find(&path_str(&folder.join("undated.png")))
        .unwrap()
        .unwrap();
    assert_eq!(undated.capture_time, None);
    assert_eq!(undated.event_id, None);

    // Members run in capture order even where path order disagrees.
    let events = store.events().all().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].members, vec![path_str(&morning), path_str(&noon)]);
    assert_eq!(events[1].members, vec![path_str(&evening)]);

    let listed: Vec<String> = store
        .photos()
        .in_event(events[0].id)
        .unwrap()
        .into_iter()
        .map(|p| p.path)
        .collect();
    assert_eq!(listed, events[0].members);
}

#[test]
fn test_apply_then_undo_restores_files_and_state() {
    let temp_dir = TempDir::new().unwrap();
    let a = temp_dir.path().join("a.png");
    let b = temp_dir.path().join("b.png");
    let c = temp_dir.path().join("c.png");
    create_test_image(&a, 64, 64);
    fs::copy(&a, &b).unwrap();
    create_seeded_image(&c, 7);

    let mut store = SessionStore::open(temp_dir.path()).unwrap();
    scan(temp_dir.path(), &mut store);
    store.photos().set_user_verdict(&path_str(&a), Verdict::Keep).unwrap();
    store.photos().set_user_verdict(&path_str(&b), Verdict::Archive).unwrap();
    store.photos().set_user_verdict(&path_str(&c), Verdict::Delete).unwrap();
    let before = store.photos().all().unwrap();

    let trash = Arc::new(FakeTrash::default());
    let operator = FileOperator::new(temp_dir.path()).with_trash(trash.clone());
    let report = operator.apply(&mut store).unwrap();
    assert_eq!(report.batch_id, Some(1));
    assert_eq!(report.failed(), 0);
    assert!(temp_dir.path().join(layout::KEEP_FOLDER).join("a.png").is_file());
    assert!(temp_dir.path().join(layout::ARCHIVE_DUPES_FOLDER).join("b.png").is_file());
    assert_eq!(trash.trashed.lock().unwrap().as_slice(), &[c.clone()]);

    let undo = operator.undo_latest(&mut store).unwrap();
    assert_eq!(undo.restored.len(), 2);
    assert_eq!(undo.not_undoable, vec![path_str(&c)]);
    assert!(a.is_file());
    assert!(b.is_file());
    assert!(!temp_dir.path().join(layout::KEEP_FOLDER).exists());

    let after = store.photos().all().unwrap();
    for (old, new) in before.iter().zip(after.iter()) {
        assert_eq!(old.verdict, new.verdict);
        assert_eq!(new.applied_batch, if new.path == path_str(&c) { Some(1) } else { None });
    }
    assert!(store.apply_log().batches().unwrap()[0].undone);
}

#[test]
fn test_reader_sees_committed_state_during_write() {
    let temp_dir = TempDir::new().unwrap();
    let folder = temp_dir.path().to_path_buf();
    let mut writer = SessionStore::open(&folder).unwrap();

    let file = DiscoveredFile {
        path: path_str(&folder.join("a.jpg")),
        file_name: "a.jpg".to_string(),
        file_size: 10,
        modified: 1,
    };
    writer
        .write(|conn| {
            PhotoRepository::new(conn).reconcile(&[file.clone()])?;
            let reader = SessionStore::open_reader(&folder)?;
            assert_eq!(reader.photos().count()?, 0);
            Ok(())
        })
        .unwrap();

    let reader = SessionStore::open_reader(&folder).unwrap();
    assert_eq!(reader.photos().count().unwrap(), 1);
}

#[test]
fn test_old_session_upgrades_with_rows_intact() {
    let temp_dir = TempDir::new().unwrap();
    layout::ensure_state_dir(temp_dir.path()).unwrap();
    {
        let conn = rusqlite::Connection::open(layout::db_path(temp_dir.path())).unwrap();
        (MIGRATIONS[0].apply)(&conn).unwrap();
        schema::set_version(&conn, 1).unwrap();
        conn.execute(
            "INSERT INTO photos (path, file_name, file_size, modified, verdict, user_override)
             VALUES ('/old/a.jpg', 'a.jpg', 5, 9, 'KEEP', 1)",
            [],
        )
        .unwrap();
    }

    let store = SessionStore::open(temp_dir.path()).unwrap();
    assert_eq!(store.schema_version().unwrap(), schema::SCHEMA_VERSION);

    let photo = store.photos().find("/old/a.jpg").unwrap().unwrap();
    assert_eq!(photo.verdict, Verdict::Keep);
    assert!(photo.user_override);
    assert_eq!(photo.capture_time, None);
    assert_eq!(photo.faces.face_count, 0);
}

#[test]
fn test_face_detector_feeds_scores() {
    let temp_dir = TempDir::new().unwrap();
    let a = temp_dir.path().join("portrait.png");
    create_test_image(&a, 64, 64);

    let mut store = SessionStore::open(temp_dir.path()).unwrap();
    let status = ScannerService::new(temp_dir.path(), ScanConfig::default())
        .with_face_detector(Arc::new(CenterFaceDetector))
        .run(&mut store);
    assert!(status.is_completed());

    let photo = store.photos().find(&path_str(&a)).unwrap().unwrap();
    assert_eq!(photo.faces.face_count, 1);
    assert!(photo.faces.eyes_open.is_none());
}
