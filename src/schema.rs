//! Session database schema and its forward-only migrations.
//!
//! `PRAGMA user_version` records the applied version. Every migration only
//! adds tables or columns with defaults, so a database written by an older
//! build opens with its rows intact. Column additions check `pragma_table_info`
//! first, making each step safe to re-run after an interrupted upgrade.

use rusqlite::{params, Connection};

// Schema version (increment when adding a migration)
pub const SCHEMA_VERSION: i32 = 3;

pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub apply: fn(&Connection) -> rusqlite::Result<()>,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "session, photos, clusters and apply log",
        apply: migrate_v1,
    },
    Migration {
        version: 2,
        description: "capture times and events",
        apply: migrate_v2,
    },
    Migration {
        version: 3,
        description: "face signals and config snapshot",
        apply: migrate_v3,
    },
];

pub fn current_version(conn: &Connection) -> rusqlite::Result<i32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

pub fn set_version(conn: &Connection, version: i32) -> rusqlite::Result<()> {
    conn.execute_batch(&format!("PRAGMA user_version = {}", version))
}

fn migrate_v1(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS session (
            id TEXT PRIMARY KEY,
            source_folder TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'new',
            phase TEXT,
            phash_threshold INTEGER NOT NULL DEFAULT 8,
            keep_per_cluster INTEGER NOT NULL DEFAULT 2,
            total_files INTEGER NOT NULL DEFAULT 0,
            processed_files INTEGER NOT NULL DEFAULT 0,
            last_batch_id INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS photos (
            path TEXT PRIMARY KEY,
            file_name TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            modified INTEGER NOT NULL,
            content_hash TEXT,
            perceptual_hash TEXT,
            fingerprinted INTEGER NOT NULL DEFAULT 0,
            sharpness REAL NOT NULL DEFAULT 0.0,
            brightness REAL NOT NULL DEFAULT 0.0,
            quality_score REAL NOT NULL DEFAULT 0.0,
            scored INTEGER NOT NULL DEFAULT 0,
            cluster_id INTEGER,
            dup_kind TEXT NOT NULL DEFAULT 'none',
            verdict TEXT NOT NULL DEFAULT 'REVIEW',
            user_override INTEGER NOT NULL DEFAULT 0,
            orphaned INTEGER NOT NULL DEFAULT 0,
            applied_batch INTEGER
        );

        CREATE TABLE IF NOT EXISTS clusters (
            id INTEGER PRIMARY KEY,
            kind TEXT NOT NULL,
            member_count INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS apply_log (
            batch_id INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            photo_path TEXT NOT NULL,
            source_path TEXT NOT NULL,
            destination TEXT NOT NULL,
            verdict TEXT NOT NULL,
            success INTEGER NOT NULL,
            error TEXT,
            applied_at TEXT NOT NULL,
            undone INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (batch_id, seq)
        );

        CREATE INDEX IF NOT EXISTS idx_photos_content_hash ON photos(content_hash);
        CREATE INDEX IF NOT EXISTS idx_photos_cluster ON photos(cluster_id);
        CREATE INDEX IF NOT EXISTS idx_apply_log_photo ON apply_log(photo_path);
        "#,
    )
}

fn migrate_v2(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            photo_count INTEGER NOT NULL
        );
        "#,
    )?;
    add_column(conn, "photos", "capture_time", "TEXT")?;
    add_column(conn, "photos", "event_id", "INTEGER")?;
    add_column(conn, "session", "event_gap_hours", "REAL NOT NULL DEFAULT 4.0")?;
    conn.execute_batch("CREATE INDEX IF NOT EXISTS idx_photos_event ON photos(event_id);")
}

fn migrate_v3(conn: &Connection) -> rusqlite::Result<()> {
    add_column(conn, "photos", "face_count", "INTEGER NOT NULL DEFAULT 0")?;
    add_column(conn, "photos", "eyes_open", "REAL")?;
    add_column(conn, "photos", "smile", "REAL")?;
    add_column(conn, "photos", "naturalness", "REAL")?;
    add_column(conn, "photos", "head_pose_frontal", "REAL")?;
    add_column(conn, "photos", "isolation", "REAL NOT NULL DEFAULT 0.0")?;
    add_column(conn, "session", "face_detection_enabled", "INTEGER NOT NULL DEFAULT 1")?;
    add_column(conn, "session", "config_json", "TEXT")
}

pub fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        params![table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn add_column(conn: &Connection, table: &str, column: &str, decl: &str) -> rusqlite::Result<()> {
    if has_column(conn, table, column)? {
        return Ok(());
    }
    conn.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_contiguous() {
        for (index, migration) in MIGRATIONS.iter().enumerate() {
            assert_eq!(migration.version, index as i32 + 1);
        }
        assert_eq!(MIGRATIONS.last().map(|m| m.version), Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_migrations_can_rerun() {
        let conn = Connection::open_in_memory().unwrap();
        for migration in MIGRATIONS {
            (migration.apply)(&conn).unwrap();
        }
        for migration in MIGRATIONS {
            (migration.apply)(&conn).unwrap();
        }
        assert!(has_column(&conn, "photos", "face_count").unwrap());
        assert!(has_column(&conn, "session", "config_json").unwrap());
    }

    #[test]
    fn test_add_column_keeps_rows() {
        let conn = Connection::open_in_memory().unwrap();
        migrate_v1(&conn).unwrap();
        conn.execute(
            "INSERT INTO photos (path, file_name, file_size, modified) VALUES ('/a.jpg', 'a.jpg', 10, 1)",
            [],
        )
        .unwrap();

        migrate_v2(&conn).unwrap();
        migrate_v3(&conn).unwrap();

        let (name, faces): (String, i64) = conn
            .query_row("SELECT file_name, face_count FROM photos", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(name, "a.jpg");
        assert_eq!(faces, 0);
    }
}
