use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::config::ScanConfig;
use crate::database::models::{ScanPhase, SessionState, SessionStatus};
use crate::database::StoreError;
use crate::schema;

pub struct SessionRepository<'c> {
    conn: &'c Connection,
}

impl<'c> SessionRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self) -> Result<Option<SessionState>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, source_folder, status, phase, phash_threshold, keep_per_cluster,
                        event_gap_hours, face_detection_enabled, config_json,
                        total_files, processed_files, last_batch_id, created_at, updated_at
                 FROM session LIMIT 1",
                [],
                |row| {
                    Ok(SessionRow {
                        id: row.get(0)?,
                        source_folder: row.get(1)?,
                        status: row.get(2)?,
                        phase: row.get(3)?,
                        phash_threshold: row.get(4)?,
                        keep_per_cluster: row.get(5)?,
                        event_gap_hours: row.get(6)?,
                        face_detection_enabled: row.get(7)?,
                        config_json: row.get(8)?,
                        total_files: row.get(9)?,
                        processed_files: row.get(10)?,
                        last_batch_id: row.get(11)?,
                        created_at: row.get(12)?,
                        updated_at: row.get(13)?,
                    })
                },
            )
            .optional()?;

        let Some(row) = row else {
            return Ok(None);
        };

        let config = match row.config_json.as_deref() {
            Some(json) => serde_json::from_str(json)?,
            None => ScanConfig {
                phash_threshold: row.phash_threshold,
                keep_per_cluster: row.keep_per_cluster as usize,
                event_gap_hours: row.event_gap_hours,
                face_detection_enabled: row.face_detection_enabled,
                ..ScanConfig::default()
            },
        };

        Ok(Some(SessionState {
            id: row.id,
            source_folder: row.source_folder,
            schema_version: schema::current_version(self.conn)?,
            config,
            status: SessionStatus::from(row.status),
            phase: row.phase.as_deref().and_then(ScanPhase::parse),
            total_files: row.total_files,
            processed_files: row.processed_files,
            last_batch_id: row.last_batch_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }))
    }

    pub fn create(&self, source_folder: &str, config: &ScanConfig) -> Result<SessionState, StoreError> {
        let now = Utc::now().to_rfc3339();
        let id = format!("ses_{}", Uuid::new_v4().simple());

        self.conn.execute(
            "INSERT INTO session (id, source_folder, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id, source_folder, String::from(SessionStatus::New), now],
        )?;
        self.save_config(config)?;

        self.get()?
            .ok_or_else(|| StoreError::NoSession(source_folder.to_string()))
    }

    pub fn get_or_create(&self, source_folder: &str, config: &ScanConfig) -> Result<SessionState, StoreError> {
        match self.get()? {
            Some(session) => Ok(session),
            None => self.create(source_folder, config),
        }
    }

    /// Snapshot the options the next scan runs with.
    pub fn save_config(&self, config: &ScanConfig) -> Result<(), StoreError> {
        let json = serde_json::to_string(config)?;
        self.conn.execute(
            "UPDATE session SET phash_threshold = ?1, keep_per_cluster = ?2, event_gap_hours = ?3,
                face_detection_enabled = ?4, config_json = ?5, updated_at = ?6",
            params![
                config.phash_threshold,
                config.keep_per_cluster as i64,
                config.event_gap_hours,
                config.face_detection_enabled,
                json,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn set_status(&self, status: SessionStatus) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE session SET status = ?1, updated_at = ?2",
            params![String::from(status), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_phase(&self, phase: ScanPhase) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE session SET phase = ?1, updated_at = ?2",
            params![phase.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_progress(&self, total_files: i64, processed_files: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE session SET total_files = ?1, processed_files = ?2",
            params![total_files, processed_files],
        )?;
        Ok(())
    }

    pub fn set_last_batch(&self, batch_id: Option<i64>) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE session SET last_batch_id = ?1, updated_at = ?2",
            params![batch_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

struct SessionRow {
    id: String,
    source_folder: String,
    status: String,
    phase: Option<String>,
    phash_threshold: u32,
    keep_per_cluster: i64,
    event_gap_hours: f64,
    face_detection_enabled: bool,
    config_json: Option<String>,
    total_files: i64,
    processed_files: i64,
    last_batch_id: Option<i64>,
    created_at: String,
    updated_at: String,
}
