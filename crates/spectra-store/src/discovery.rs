//! Discovered-group rows, the mention-edge graph and the crawl audit log.

use chrono::{DateTime, Utc};
use rusqlite::Row;

use crate::error::Result;
use crate::store::Store;
use crate::types::{parse_rfc3339, DiscoveredGroup, GroupEdge};

impl Store {
    /// Record a discovered link. First sighting wins; later sightings are
    /// ignored (uniqueness by link).
    pub fn record_discovered_group(
        &self,
        link: &str,
        kind: &str,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now = now.to_rfc3339();
        self.with_retry("record_discovered_group", |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO discovered_groups
                 (group_link, group_type, date_discovered, source)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![link, kind, now, source],
            )
        })?;
        Ok(())
    }

    pub fn discovered_group(&self, link: &str) -> Result<Option<DiscoveredGroup>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT group_link, group_type, date_discovered, source, priority, status,
                    last_checked, title
             FROM discovered_groups WHERE group_link = ?1",
            [link],
            row_to_group,
        ) {
            Ok(g) => Ok(Some(g)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every known group link.
    pub fn discovered_links(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT group_link FROM discovered_groups ORDER BY id")?;
        let links = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(links)
    }

    pub fn set_group_status(&self, link: &str, status: &str, now: DateTime<Utc>) -> Result<()> {
        let now = now.to_rfc3339();
        self.with_retry("set_group_status", |conn| {
            conn.execute(
                "UPDATE discovered_groups SET status = ?1, last_checked = ?2
                 WHERE group_link = ?3",
                rusqlite::params![status, now, link],
            )
        })?;
        Ok(())
    }

    pub fn set_group_priority(&self, link: &str, priority: f64) -> Result<()> {
        self.with_retry("set_group_priority", |conn| {
            conn.execute(
                "UPDATE discovered_groups SET priority = ?1 WHERE group_link = ?2",
                rusqlite::params![priority, link],
            )
        })?;
        Ok(())
    }

    /// The `n` highest-priority groups at or above `min_priority`, skipping
    /// already-archived ones.
    pub fn priority_targets(&self, n: usize, min_priority: f64) -> Result<Vec<DiscoveredGroup>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT group_link, group_type, date_discovered, source, priority, status,
                    last_checked, title
             FROM discovered_groups
             WHERE priority >= ?1 AND status != 'archived'
             ORDER BY priority DESC, group_link LIMIT ?2",
        )?;
        let groups = stmt
            .query_map(rusqlite::params![min_priority, n as i64], row_to_group)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(groups)
    }

    /// Accumulate one observation of `source → target`; repeated sightings
    /// add to the edge weight.
    pub fn add_group_relationship(
        &self,
        source: &str,
        target: &str,
        kind: &str,
        weight: f64,
    ) -> Result<()> {
        self.with_retry("add_group_relationship", |conn| {
            conn.execute(
                "INSERT INTO group_relationships
                 (source_group, target_group, relationship_type, weight)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(source_group, target_group, relationship_type)
                 DO UPDATE SET weight = weight + excluded.weight",
                rusqlite::params![source, target, kind, weight],
            )
        })?;
        Ok(())
    }

    /// The full current edge set (weights summed across relationship kinds).
    pub fn group_relationships(&self) -> Result<Vec<GroupEdge>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT source_group, target_group, SUM(weight)
             FROM group_relationships GROUP BY source_group, target_group",
        )?;
        let edges = stmt
            .query_map([], |row| {
                Ok(GroupEdge {
                    source: row.get(0)?,
                    target: row.get(1)?,
                    weight: row.get(2)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(edges)
    }

    /// Append one crawl audit row.
    pub fn record_discovery_source(
        &self,
        source_entity: &str,
        groups_found: usize,
        depth: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now = now.to_rfc3339();
        self.with_retry("record_discovery_source", |conn| {
            conn.execute(
                "INSERT INTO discovery_sources (source_entity, date_crawled, groups_found, depth)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![source_entity, now, groups_found as i64, depth],
            )
        })?;
        Ok(())
    }
}

fn row_to_group(row: &Row<'_>) -> rusqlite::Result<DiscoveredGroup> {
    let discovered: String = row.get(2)?;
    let checked: Option<String> = row.get(6)?;
    Ok(DiscoveredGroup {
        link: row.get(0)?,
        kind: row.get(1)?,
        discovered_at: parse_rfc3339(&discovered).unwrap_or_else(|_| Utc::now()),
        source: row.get(3)?,
        priority: row.get(4)?,
        status: row.get(5)?,
        last_checked: checked.as_deref().and_then(|s| parse_rfc3339(s).ok()),
        title: row.get(7)?,
    })
}
