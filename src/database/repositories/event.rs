use rusqlite::{params, Connection};
use std::collections::HashMap;

use crate::database::models::{format_capture_time, parse_capture_time, Event};
use crate::database::StoreError;

pub struct EventRepository<'c> {
    conn: &'c Connection,
}

impl<'c> EventRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn replace_all(&self, events: &[Event]) -> Result<(), StoreError> {
        self.conn.execute("DELETE FROM events", [])?;
        let mut stmt = self.conn.prepare(
            "INSERT INTO events (id, start_time, end_time, photo_count) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for event in events {
            stmt.execute(params![
                event.id,
                format_capture_time(&event.start),
                format_capture_time(&event.end),
                event.members.len() as i64
            ])?;
        }
        Ok(())
    }

    /// All events in id order. Members are listed by capture time, then path.
    pub fn all(&self) -> Result<Vec<Event>, StoreError> {
        let mut members: HashMap<i64, Vec<String>> = HashMap::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT event_id, path FROM photos
                 WHERE event_id IS NOT NULL AND orphaned = 0 ORDER BY capture_time, path",
            )?;
            let rows =
                stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
            for row in rows {
                let (event_id, path) = row?;
                members.entry(event_id).or_default().push(path);
            }
        }

        let mut stmt = self
            .conn
            .prepare("SELECT id, start_time, end_time FROM events ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut events = Vec::with_capacity(rows.len());
        for (id, start, end) in rows {
            let (Some(start), Some(end)) = (parse_capture_time(&start), parse_capture_time(&end))
            else {
                log::warn!("Skipping event {} with unreadable time range", id);
                continue;
            };
            events.push(Event {
                id,
                start,
                end,
                members: members.remove(&id).unwrap_or_default(),
            });
        }
        Ok(events)
    }
}
