use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;

use crate::database::models::{Cluster, ClusterKind};
use crate::database::StoreError;

pub struct ClusterRepository<'c> {
    conn: &'c Connection,
}

impl<'c> ClusterRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Replace the stored clusters. Photo assignments are written separately
    /// by `PhotoRepository::assign_clusters` in the same transaction.
    pub fn replace_all(&self, clusters: &[Cluster]) -> Result<(), StoreError> {
        self.conn.execute("DELETE FROM clusters", [])?;
        let mut stmt = self
            .conn
            .prepare("INSERT INTO clusters (id, kind, member_count) VALUES (?1, ?2, ?3)")?;
        for cluster in clusters {
            stmt.execute(params![
                cluster.id,
                String::from(cluster.kind),
                cluster.members.len() as i64
            ])?;
        }
        Ok(())
    }

    /// All clusters ordered by id, members ascending by path.
    pub fn all(&self) -> Result<Vec<Cluster>, StoreError> {
        let mut members = self.members_by_cluster()?;

        let mut stmt = self.conn.prepare("SELECT id, kind FROM clusters ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, ClusterKind::from(row.get::<_, String>(1)?)))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .map(|(id, kind)| Cluster {
                id,
                kind,
                members: members.remove(&id).unwrap_or_default(),
            })
            .collect())
    }

    pub fn find(&self, id: i64) -> Result<Option<Cluster>, StoreError> {
        let kind = self
            .conn
            .query_row("SELECT kind FROM clusters WHERE id = ?1", params![id], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;

        let Some(kind) = kind else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT path FROM photos WHERE cluster_id = ?1 AND orphaned = 0 ORDER BY path",
        )?;
        let members = stmt
            .query_map(params![id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(Cluster {
            id,
            kind: ClusterKind::from(kind),
            members,
        }))
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM clusters", [], |row| row.get(0))?)
    }

    fn members_by_cluster(&self) -> Result<HashMap<i64, Vec<String>>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT cluster_id, path FROM photos
             WHERE cluster_id IS NOT NULL AND orphaned = 0 ORDER BY path",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;

        let mut members: HashMap<i64, Vec<String>> = HashMap::new();
        for row in rows {
            let (cluster_id, path) = row?;
            members.entry(cluster_id).or_default().push(path);
        }
        Ok(members)
    }
}
