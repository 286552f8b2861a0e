use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::database::models::{
    format_capture_time, parse_capture_time, ClusterAssignment, DiscoveredFile, DupKind,
    FaceSummary, FingerprintRecord, Photo, ReconcileStats, ScoreRecord, Verdict,
};
use crate::database::StoreError;

const PHOTO_COLUMNS: &str = "path, file_name, file_size, modified, content_hash, perceptual_hash, \
     capture_time, fingerprinted, sharpness, brightness, quality_score, face_count, eyes_open, \
     smile, naturalness, head_pose_frontal, isolation, scored, cluster_id, dup_kind, event_id, \
     verdict, user_override, orphaned, applied_batch";

pub struct PhotoRepository<'c> {
    conn: &'c Connection,
}

impl<'c> PhotoRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Bring the photo table in line with a fresh walk of the source folder.
    ///
    /// New paths are inserted, files whose size or mtime changed lose all
    /// derived data, paths that disappeared are marked orphaned and paths
    /// that came back are restored.
    pub fn reconcile(&self, discovered: &[DiscoveredFile]) -> Result<ReconcileStats, StoreError> {
        let mut existing: HashMap<String, (i64, i64, bool)> = HashMap::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT path, file_size, modified, orphaned FROM photos")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    (row.get::<_, i64>(1)?, row.get::<_, i64>(2)?, row.get::<_, bool>(3)?),
                ))
            })?;
            for row in rows {
                let (path, state) = row?;
                existing.insert(path, state);
            }
        }

        let mut stats = ReconcileStats::default();
        let mut seen: HashSet<&str> = HashSet::with_capacity(discovered.len());

        for file in discovered {
            seen.insert(file.path.as_str());
            match existing.get(&file.path) {
                None => {
                    self.conn.execute(
                        "INSERT INTO photos (path, file_name, file_size, modified) VALUES (?1, ?2, ?3, ?4)",
                        params![file.path, file.file_name, file.file_size, file.modified],
                    )?;
                    stats.added += 1;
                }
                Some(&(size, modified, _)) if size != file.file_size || modified != file.modified => {
                    self.reset_changed(file)?;
                    stats.changed += 1;
                }
                Some(&(_, _, true)) => {
                    self.conn.execute(
                        "UPDATE photos SET orphaned = 0 WHERE path = ?1",
                        params![file.path],
                    )?;
                    stats.restored += 1;
                }
                Some(_) => stats.unchanged += 1,
            }
        }

        for (path, &(_, _, orphaned)) in &existing {
            if orphaned || seen.contains(path.as_str()) {
                continue;
            }
            self.conn.execute(
                "UPDATE photos SET orphaned = 1, cluster_id = NULL, dup_kind = 'none', event_id = NULL
                 WHERE path = ?1",
                params![path],
            )?;
            stats.orphaned += 1;
        }

        Ok(stats)
    }

    fn reset_changed(&self, file: &DiscoveredFile) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE photos SET
                file_name = ?2, file_size = ?3, modified = ?4,
                content_hash = NULL, perceptual_hash = NULL, capture_time = NULL,
                fingerprinted = 0, sharpness = 0.0, brightness = 0.0, quality_score = 0.0,
                face_count = 0, eyes_open = NULL, smile = NULL, naturalness = NULL,
                head_pose_frontal = NULL, isolation = 0.0, scored = 0,
                cluster_id = NULL, dup_kind = 'none', event_id = NULL,
                verdict = CASE WHEN user_override = 1 THEN verdict ELSE 'REVIEW' END,
                orphaned = 0, applied_batch = NULL
             WHERE path = ?1",
            params![file.path, file.file_name, file.file_size, file.modified],
        )?;
        Ok(())
    }

    /// Active (non-orphaned) photos ordered by path.
    pub fn all(&self) -> Result<Vec<Photo>, StoreError> {
        self.query_photos(
            &format!("SELECT {} FROM photos WHERE orphaned = 0 ORDER BY path", PHOTO_COLUMNS),
            [],
        )
    }

    pub fn find(&self, path: &str) -> Result<Option<Photo>, StoreError> {
        let photo = self
            .conn
            .query_row(
                &format!("SELECT {} FROM photos WHERE path = ?1", PHOTO_COLUMNS),
                params![path],
                map_photo,
            )
            .optional()?;
        Ok(photo)
    }

    pub fn pending_fingerprint(&self) -> Result<Vec<Photo>, StoreError> {
        self.query_photos(
            &format!(
                "SELECT {} FROM photos WHERE orphaned = 0 AND fingerprinted = 0 ORDER BY path",
                PHOTO_COLUMNS
            ),
            [],
        )
    }

    pub fn pending_scoring(&self) -> Result<Vec<Photo>, StoreError> {
        self.query_photos(
            &format!(
                "SELECT {} FROM photos
                 WHERE orphaned = 0 AND fingerprinted = 1 AND scored = 0 ORDER BY path",
                PHOTO_COLUMNS
            ),
            [],
        )
    }

    pub fn in_cluster(&self, cluster_id: i64) -> Result<Vec<Photo>, StoreError> {
        self.query_photos(
            &format!(
                "SELECT {} FROM photos WHERE orphaned = 0 AND cluster_id = ?1 ORDER BY path",
                PHOTO_COLUMNS
            ),
            params![cluster_id],
        )
    }

    /// Members of an event in capture order.
    pub fn in_event(&self, event_id: i64) -> Result<Vec<Photo>, StoreError> {
        self.query_photos(
            &format!(
                "SELECT {} FROM photos WHERE orphaned = 0 AND event_id = ?1
                 ORDER BY capture_time, path",
                PHOTO_COLUMNS
            ),
            params![event_id],
        )
    }

    fn query_photos<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Photo>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let photos = stmt
            .query_map(params, map_photo)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(photos)
    }

    pub fn save_fingerprints(&self, records: &[FingerprintRecord]) -> Result<(), StoreError> {
        let mut stmt = self.conn.prepare(
            "UPDATE photos SET content_hash = ?2, perceptual_hash = ?3, capture_time = ?4, fingerprinted = 1
             WHERE path = ?1",
        )?;
        for record in records {
            stmt.execute(params![
                record.path,
                record.content_hash,
                record.perceptual_hash,
                record.capture_time.as_ref().map(format_capture_time),
            ])?;
        }
        Ok(())
    }

    pub fn save_scores(&self, records: &[ScoreRecord]) -> Result<(), StoreError> {
        let mut stmt = self.conn.prepare(
            "UPDATE photos SET sharpness = ?2, brightness = ?3, quality_score = ?4,
                face_count = ?5, eyes_open = ?6, smile = ?7, naturalness = ?8,
                head_pose_frontal = ?9, isolation = ?10, scored = 1
             WHERE path = ?1",
        )?;
        for record in records {
            stmt.execute(params![
                record.path,
                record.sharpness,
                record.brightness,
                record.quality_score,
                record.faces.face_count,
                record.faces.eyes_open,
                record.faces.smile,
                record.faces.naturalness,
                record.faces.head_pose_frontal,
                record.faces.isolation,
            ])?;
        }
        Ok(())
    }

    /// Force every photo to be scored again on the next scan.
    pub fn reset_scores(&self) -> Result<usize, StoreError> {
        Ok(self.conn.execute("UPDATE photos SET scored = 0", [])?)
    }

    /// Replace every cluster assignment with `assignments`.
    pub fn assign_clusters(&self, assignments: &[ClusterAssignment]) -> Result<(), StoreError> {
        self.conn
            .execute("UPDATE photos SET cluster_id = NULL, dup_kind = 'none'", [])?;
        let mut stmt = self
            .conn
            .prepare("UPDATE photos SET cluster_id = ?2, dup_kind = ?3 WHERE path = ?1")?;
        for assignment in assignments {
            stmt.execute(params![
                assignment.path,
                assignment.cluster_id,
                String::from(assignment.dup_kind),
            ])?;
        }
        Ok(())
    }

    /// Replace every event assignment with `assignments`.
    pub fn assign_events(&self, assignments: &[(String, i64)]) -> Result<(), StoreError> {
        self.conn.execute("UPDATE photos SET event_id = NULL", [])?;
        let mut stmt = self
            .conn
            .prepare("UPDATE photos SET event_id = ?2 WHERE path = ?1")?;
        for (path, event_id) in assignments {
            stmt.execute(params![path, event_id])?;
        }
        Ok(())
    }

    /// Return machine suggestions on unapplied photos to REVIEW. User
    /// overrides are left alone.
    pub fn reset_suggestions(&self) -> Result<usize, StoreError> {
        Ok(self.conn.execute(
            "UPDATE photos SET verdict = 'REVIEW' WHERE user_override = 0 AND applied_batch IS NULL",
            [],
        )?)
    }

    /// Write machine suggestions. Rows carrying a user override are skipped.
    pub fn save_suggestions(&self, verdicts: &[(String, Verdict)]) -> Result<usize, StoreError> {
        let mut stmt = self
            .conn
            .prepare("UPDATE photos SET verdict = ?2 WHERE path = ?1 AND user_override = 0")?;
        let mut updated = 0;
        for (path, verdict) in verdicts {
            updated += stmt.execute(params![path, String::from(*verdict)])?;
        }
        Ok(updated)
    }

    /// Record a user decision. REVIEW clears the override so the next scan
    /// may suggest again.
    pub fn set_user_verdict(&self, path: &str, verdict: Verdict) -> Result<(), StoreError> {
        let user_override = verdict != Verdict::Review;
        let updated = self.conn.execute(
            "UPDATE photos SET verdict = ?2, user_override = ?3 WHERE path = ?1 AND orphaned = 0",
            params![path, String::from(verdict), user_override],
        )?;
        if updated == 0 {
            return Err(StoreError::PhotoNotFound(path.to_string()));
        }
        Ok(())
    }

    pub fn set_applied(&self, path: &str, batch_id: Option<i64>) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE photos SET applied_batch = ?2 WHERE path = ?1",
            params![path, batch_id],
        )?;
        Ok(())
    }

    /// Point a photo's record at the file's new location. A stale record
    /// already at `new_path` is dropped.
    pub fn relocate(&self, old_path: &str, new_path: &str) -> Result<(), StoreError> {
        let file_name = Path::new(new_path)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        self.conn
            .execute("DELETE FROM photos WHERE path = ?1", params![new_path])?;
        let updated = self.conn.execute(
            "UPDATE photos SET path = ?2, file_name = ?3 WHERE path = ?1",
            params![old_path, new_path, file_name],
        )?;
        if updated == 0 {
            return Err(StoreError::PhotoNotFound(old_path.to_string()));
        }
        Ok(())
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM photos WHERE orphaned = 0", [], |row| row.get(0))?)
    }

    pub fn count_by_verdict(&self) -> Result<Vec<(Verdict, i64)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT verdict, COUNT(*) FROM photos WHERE orphaned = 0 GROUP BY verdict ORDER BY verdict",
        )?;
        let counts = stmt
            .query_map([], |row| {
                Ok((Verdict::from(row.get::<_, String>(0)?), row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    }
}

fn map_photo(row: &Row<'_>) -> rusqlite::Result<Photo> {
    let capture_time: Option<String> = row.get(6)?;
    let face_count: i64 = row.get(11)?;
    Ok(Photo {
        path: row.get(0)?,
        file_name: row.get(1)?,
        file_size: row.get(2)?,
        modified: row.get(3)?,
        content_hash: row.get(4)?,
        perceptual_hash: row.get(5)?,
        capture_time: capture_time.as_deref().and_then(parse_capture_time),
        fingerprinted: row.get(7)?,
        sharpness: row.get(8)?,
        brightness: row.get(9)?,
        quality_score: row.get(10)?,
        faces: FaceSummary {
            face_count: u32::try_from(face_count).unwrap_or(0),
            eyes_open: row.get(12)?,
            smile: row.get(13)?,
            naturalness: row.get(14)?,
            head_pose_frontal: row.get(15)?,
            isolation: row.get(16)?,
        },
        scored: row.get(17)?,
        cluster_id: row.get(18)?,
        dup_kind: DupKind::from(row.get::<_, String>(19)?),
        event_id: row.get(20)?,
        verdict: Verdict::from(row.get::<_, String>(21)?),
        user_override: row.get(22)?,
        orphaned: row.get(23)?,
        applied_batch: row.get(24)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SessionStore;
    use std::path::Path;

    fn discovered(path: &str, size: i64, modified: i64) -> DiscoveredFile {
        DiscoveredFile {
            path: path.to_string(),
            file_name: Path::new(path)
                .file_name()
                .unwrap()
                .to_string_lossy()
                .to_string(),
            file_size: size,
            modified,
        }
    }

    fn store() -> SessionStore {
        SessionStore::open_in_memory(Path::new("/photos")).unwrap()
    }

    #[test]
    fn test_reconcile_inserts_and_orphans() {
        let store = store();
        let repo = store.photos();

        let stats = repo
            .reconcile(&[discovered("/photos/a.jpg", 10, 1), discovered("/photos/b.jpg", 20, 1)])
            .unwrap();
        assert_eq!(stats.added, 2);

        let stats = repo.reconcile(&[discovered("/photos/a.jpg", 10, 1)]).unwrap();
        assert_eq!(stats.unchanged, 1);
        assert_eq!(stats.orphaned, 1);
        assert_eq!(repo.count().unwrap(), 1);
        assert!(repo.find("/photos/b.jpg").unwrap().unwrap().orphaned);

        let stats = repo
            .reconcile(&[discovered("/photos/a.jpg", 10, 1), discovered("/photos/b.jpg", 20, 1)])
            .unwrap();
        assert_eq!(stats.restored, 1);
        assert_eq!(repo.count().unwrap(), 2);
    }

    #[test]
    fn test_changed_file_loses_derived_data() {
        let store = store();
        let repo = store.photos();
        repo.reconcile(&[discovered("/photos/a.jpg", 10, 1)]).unwrap();
        repo.save_fingerprints(&[FingerprintRecord {
            path: "/photos/a.jpg".to_string(),
            content_hash: Some("abc".to_string()),
            perceptual_hash: Some("00ff".to_string()),
            capture_time: None,
        }])
        .unwrap();
        assert!(repo.pending_fingerprint().unwrap().is_empty());

        let stats = repo.reconcile(&[discovered("/photos/a.jpg", 11, 2)]).unwrap();
        assert_eq!(stats.changed, 1);

        let photo = repo.find("/photos/a.jpg").unwrap().unwrap();
        assert!(!photo.fingerprinted);
        assert_eq!(photo.content_hash, None);
        assert_eq!(photo.file_size, 11);
    }

    #[test]
    fn test_changed_file_keeps_user_verdict() {
        let store = store();
        let repo = store.photos();
        repo.reconcile(&[discovered("/photos/a.jpg", 10, 1), discovered("/photos/b.jpg", 10, 1)])
            .unwrap();
        repo.set_user_verdict("/photos/a.jpg", Verdict::Delete).unwrap();
        repo.save_suggestions(&[("/photos/b.jpg".to_string(), Verdict::Archive)])
            .unwrap();

        let stats = repo
            .reconcile(&[discovered("/photos/a.jpg", 11, 1), discovered("/photos/b.jpg", 11, 1)])
            .unwrap();
        assert_eq!(stats.changed, 2);

        let a = repo.find("/photos/a.jpg").unwrap().unwrap();
        assert_eq!(a.verdict, Verdict::Delete);
        assert!(a.user_override);
        assert!(!a.fingerprinted);

        let b = repo.find("/photos/b.jpg").unwrap().unwrap();
        assert_eq!(b.verdict, Verdict::Review);
        assert!(!b.user_override);
    }

    #[test]
    fn test_user_verdict_survives_suggestion_reset() {
        let store = store();
        let repo = store.photos();
        repo.reconcile(&[discovered("/photos/a.jpg", 10, 1), discovered("/photos/b.jpg", 10, 1)])
            .unwrap();

        repo.set_user_verdict("/photos/a.jpg", Verdict::Delete).unwrap();
        repo.save_suggestions(&[
            ("/photos/a.jpg".to_string(), Verdict::Keep),
            ("/photos/b.jpg".to_string(), Verdict::Archive),
        ])
        .unwrap();
        repo.reset_suggestions().unwrap();

        let a = repo.find("/photos/a.jpg").unwrap().unwrap();
        let b = repo.find("/photos/b.jpg").unwrap().unwrap();
        assert_eq!(a.verdict, Verdict::Delete);
        assert!(a.user_override);
        assert_eq!(b.verdict, Verdict::Review);

        repo.set_user_verdict("/photos/a.jpg", Verdict::Review).unwrap();
        assert!(!repo.find("/photos/a.jpg").unwrap().unwrap().user_override);
    }

    #[test]
    fn test_unknown_photo_verdict_is_an_error() {
        let store = store();
        assert!(matches!(
            store.photos().set_user_verdict("/photos/missing.jpg", Verdict::Keep),
            Err(StoreError::PhotoNotFound(_))
        ));
    }

    #[test]
    fn test_scores_round_trip_with_missing_expressions() {
        let store = store();
        let repo = store.photos();
        repo.reconcile(&[discovered("/photos/a.jpg", 10, 1)]).unwrap();
        repo.save_scores(&[ScoreRecord {
            path: "/photos/a.jpg".to_string(),
            sharpness: 120.5,
            brightness: 99.0,
            quality_score: 2.3,
            faces: FaceSummary {
                face_count: 2,
                eyes_open: None,
                smile: Some(0.5),
                naturalness: None,
                head_pose_frontal: None,
                isolation: 1.0,
            },
        }])
        .unwrap();

        let photo = repo.find("/photos/a.jpg").unwrap().unwrap();
        assert!(photo.scored);
        assert_eq!(photo.faces.face_count, 2);
        assert_eq!(photo.faces.eyes_open, None);
        assert_eq!(photo.faces.smile, Some(0.5));
    }
}
