use rusqlite::{params, Connection};

use crate::database::models::{ApplyLogEntry, BatchSummary, Destination, RECYCLE_BIN_SENTINEL, Verdict};
use crate::database::StoreError;

pub struct ApplyLogRepository<'c> {
    conn: &'c Connection,
}

impl<'c> ApplyLogRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Batch ids count up from 1 and are never reused.
    pub fn next_batch_id(&self) -> Result<i64, StoreError> {
        Ok(self.conn.query_row(
            "SELECT COALESCE(MAX(batch_id), 0) + 1 FROM apply_log",
            [],
            |row| row.get(0),
        )?)
    }

    pub fn latest_batch_id(&self) -> Result<Option<i64>, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT MAX(batch_id) FROM apply_log", [], |row| row.get(0))?)
    }

    pub fn insert_entries(&self, entries: &[ApplyLogEntry]) -> Result<(), StoreError> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO apply_log
                (batch_id, seq, photo_path, source_path, destination, verdict, success, error, applied_at, undone)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;
        for (seq, entry) in entries.iter().enumerate() {
            stmt.execute(params![
                entry.batch_id,
                seq as i64,
                entry.photo_path,
                entry.source_path,
                String::from(entry.destination.clone()),
                String::from(entry.verdict),
                entry.success,
                entry.error,
                entry.applied_at,
                entry.undone,
            ])?;
        }
        Ok(())
    }

    /// Entries of one batch in the order they were applied.
    pub fn entries(&self, batch_id: i64) -> Result<Vec<ApplyLogEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT batch_id, photo_path, source_path, destination, verdict, success, error, applied_at, undone
             FROM apply_log WHERE batch_id = ?1 ORDER BY seq",
        )?;
        let entries = stmt
            .query_map(params![batch_id], |row| {
                Ok(ApplyLogEntry {
                    batch_id: row.get(0)?,
                    photo_path: row.get(1)?,
                    source_path: row.get(2)?,
                    destination: Destination::from(row.get::<_, String>(3)?),
                    verdict: Verdict::from(row.get::<_, String>(4)?),
                    success: row.get(5)?,
                    error: row.get(6)?,
                    applied_at: row.get(7)?,
                    undone: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn mark_undone(&self, batch_id: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE apply_log SET undone = 1 WHERE batch_id = ?1",
            params![batch_id],
        )?;
        Ok(())
    }

    pub fn is_undone(&self, batch_id: i64) -> Result<bool, StoreError> {
        let undone: Option<bool> = self.conn.query_row(
            "SELECT MAX(undone) FROM apply_log WHERE batch_id = ?1",
            params![batch_id],
            |row| row.get(0),
        )?;
        Ok(undone.unwrap_or(false))
    }

    pub fn batches(&self) -> Result<Vec<BatchSummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT batch_id, MIN(applied_at),
                    SUM(CASE WHEN success = 1 AND destination != ?1 THEN 1 ELSE 0 END),
                    SUM(CASE WHEN success = 1 AND destination = ?1 THEN 1 ELSE 0 END),
                    SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END),
                    MAX(undone)
             FROM apply_log GROUP BY batch_id ORDER BY batch_id",
        )?;
        let batches = stmt
            .query_map(params![RECYCLE_BIN_SENTINEL], |row| {
                Ok(BatchSummary {
                    batch_id: row.get(0)?,
                    applied_at: row.get(1)?,
                    moved: row.get(2)?,
                    trashed: row.get(3)?,
                    failed: row.get(4)?,
                    undone: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SessionStore;
    use std::path::Path;

    fn entry(batch_id: i64, path: &str, destination: Destination, success: bool) -> ApplyLogEntry {
        ApplyLogEntry {
            batch_id,
            photo_path: path.to_string(),
            source_path: path.to_string(),
            destination,
            verdict: Verdict::Archive,
            success,
            error: (!success).then(|| "permission denied".to_string()),
            applied_at: "2024-01-01T00:00:00Z".to_string(),
            undone: false,
        }
    }

    #[test]
    fn test_batch_ids_increase() {
        let store = SessionStore::open_in_memory(Path::new("/photos")).unwrap();
        let repo = store.apply_log();
        assert_eq!(repo.next_batch_id().unwrap(), 1);
        assert_eq!(repo.latest_batch_id().unwrap(), None);

        repo.insert_entries(&[entry(1, "/photos/a.jpg", Destination::RecycleBin, true)])
            .unwrap();
        assert_eq!(repo.next_batch_id().unwrap(), 2);
        assert_eq!(repo.latest_batch_id().unwrap(), Some(1));
    }

    #[test]
    fn test_batch_summary_counts() {
        let store = SessionStore::open_in_memory(Path::new("/photos")).unwrap();
        let repo = store.apply_log();
        repo.insert_entries(&[
            entry(1, "/photos/a.jpg", Destination::Path("/photos/03_KEEP/a.jpg".into()), true),
            entry(1, "/photos/b.jpg", Destination::RecycleBin, true),
            entry(1, "/photos/c.jpg", Destination::Unassigned, false),
        ])
        .unwrap();

        let batches = repo.batches().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].moved, 1);
        assert_eq!(batches[0].trashed, 1);
        assert_eq!(batches[0].failed, 1);
        assert!(!batches[0].undone);

        repo.mark_undone(1).unwrap();
        assert!(repo.is_undone(1).unwrap());
        let entries = repo.entries(1).unwrap();
        assert_eq!(entries[1].destination, Destination::RecycleBin);
        assert!(entries.iter().all(|e| e.undone));
    }
}
