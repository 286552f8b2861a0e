pub mod models;
pub mod repositories;

use rusqlite::{Connection, TransactionBehavior};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::layout;
use crate::schema::{self, MIGRATIONS, SCHEMA_VERSION};
use repositories::{
    ApplyLogRepository, ClusterRepository, EventRepository, PhotoRepository, SessionRepository,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Migration to schema version {version} failed: {message}")]
    Migration { version: i32, message: String },

    #[error("Session database uses schema version {found}, newer than supported version {supported}")]
    UnsupportedVersion { found: i32, supported: i32 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No session found in {0}")]
    NoSession(String),

    #[error("Photo not found in session: {0}")]
    PhotoNotFound(String),
}

/// Durable scan session for one source folder, kept in
/// `<folder>/.photocull/session.db`.
///
/// The database runs in WAL mode so a reader opened with [`SessionStore::open_reader`]
/// sees the last committed state while a scan holds a write transaction.
/// Each thread opens its own store; connections are never shared.
pub struct SessionStore {
    conn: Connection,
    folder: PathBuf,
}

impl SessionStore {
    /// Open (creating if needed) the session store for `folder` and bring its
    /// schema up to date.
    pub fn open(folder: &Path) -> Result<Self, StoreError> {
        layout::ensure_state_dir(folder)?;
        let conn = Connection::open(layout::db_path(folder))?;
        let mut store = SessionStore {
            conn,
            folder: folder.to_path_buf(),
        };
        store.configure_pragmas()?;
        store.migrate()?;
        Ok(store)
    }

    /// Open an existing session without creating one.
    pub fn open_existing(folder: &Path) -> Result<Self, StoreError> {
        if !layout::has_session(folder) {
            return Err(StoreError::NoSession(folder.display().to_string()));
        }
        Self::open(folder)
    }

    /// Read-only connection for inspecting a session while a scan is running.
    pub fn open_reader(folder: &Path) -> Result<Self, StoreError> {
        if !layout::has_session(folder) {
            return Err(StoreError::NoSession(folder.display().to_string()));
        }
        let conn = Connection::open(layout::db_path(folder))?;
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA query_only = ON;",
        )?;
        let store = SessionStore {
            conn,
            folder: folder.to_path_buf(),
        };
        let found = store.schema_version()?;
        if found > SCHEMA_VERSION {
            return Err(StoreError::UnsupportedVersion {
                found,
                supported: SCHEMA_VERSION,
            });
        }
        Ok(store)
    }

    pub fn open_in_memory(folder: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let mut store = SessionStore {
            conn,
            folder: folder.to_path_buf(),
        };
        store.configure_pragmas()?;
        store.migrate()?;
        Ok(store)
    }

    fn configure_pragmas(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        log::debug!("Session store pragmas configured (WAL mode)");
        Ok(())
    }

    fn migrate(&mut self) -> Result<(), StoreError> {
        let current = schema::current_version(&self.conn)?;
        if current > SCHEMA_VERSION {
            return Err(StoreError::UnsupportedVersion {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }

        for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
            let tx = self.conn.transaction()?;
            (migration.apply)(&tx).map_err(|e| StoreError::Migration {
                version: migration.version,
                message: e.to_string(),
            })?;
            schema::set_version(&tx, migration.version)?;
            tx.commit()?;
            log::info!(
                "Session schema migrated to version {} ({})",
                migration.version,
                migration.description
            );
        }

        Ok(())
    }

    pub fn schema_version(&self) -> Result<i32, StoreError> {
        Ok(schema::current_version(&self.conn)?)
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside one write transaction. Nothing `f` wrote is visible to
    /// other connections unless it returns `Ok`.
    pub fn write<T, F>(&mut self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn photos(&self) -> PhotoRepository<'_> {
        PhotoRepository::new(&self.conn)
    }

    pub fn clusters(&self) -> ClusterRepository<'_> {
        ClusterRepository::new(&self.conn)
    }

    pub fn events(&self) -> EventRepository<'_> {
        EventRepository::new(&self.conn)
    }

    pub fn sessions(&self) -> SessionRepository<'_> {
        SessionRepository::new(&self.conn)
    }

    pub fn apply_log(&self) -> ApplyLogRepository<'_> {
        ApplyLogRepository::new(&self.conn)
    }

    /// Drop every derived row so the next scan starts from scratch. The apply
    /// log survives so past batches stay auditable.
    pub fn reset(&mut self) -> Result<(), StoreError> {
        self.write(|conn| {
            conn.execute_batch(
                "DELETE FROM photos;
                 DELETE FROM clusters;
                 DELETE FROM events;
                 DELETE FROM session;",
            )?;
            Ok(())
        })?;
        log::info!("Session reset for {}", self.folder.display());
        Ok(())
    }
}
