//! Quarantine entry persistence.

use super::{parse_uuid, RepoError, RepoResult};
use crate::model::quarantine::QuarantineEntry;
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

const ENTRY_SELECT_SQL: &str = "SELECT
    uuid,
    project_uuid,
    quarantined_at,
    original_bag_path,
    original_user_path,
    quarantine_path,
    purge_at,
    reason
FROM quarantine_entries";

pub trait QuarantineRepository {
    fn create_entry(&self, entry: &QuarantineEntry) -> RepoResult<()>;
    fn get_entry_for_project(&self, project_id: Uuid) -> RepoResult<Option<QuarantineEntry>>;
    /// All entries, soonest purge first.
    fn list_entries(&self) -> RepoResult<Vec<QuarantineEntry>>;
    /// Entries whose `purge_at <= now_ms`, soonest first.
    fn list_expired(&self, now_ms: i64) -> RepoResult<Vec<QuarantineEntry>>;
    fn update_purge_at(&self, project_id: Uuid, purge_at: i64) -> RepoResult<()>;
    fn delete_entry(&self, project_id: Uuid) -> RepoResult<()>;
}

pub struct SqliteQuarantineRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteQuarantineRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    fn query_entries(&self, sql: &str, bind: Option<i64>) -> RepoResult<Vec<QuarantineEntry>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = match bind {
            Some(value) => stmt.query([value])?,
            None => stmt.query([])?,
        };
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(parse_entry_row(row)?);
        }
        Ok(entries)
    }
}

impl QuarantineRepository for SqliteQuarantineRepository<'_> {
    fn create_entry(&self, entry: &QuarantineEntry) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO quarantine_entries (
                uuid,
                project_uuid,
                quarantined_at,
                original_bag_path,
                original_user_path,
                quarantine_path,
                purge_at,
                reason
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
            params![
                entry.uuid.to_string(),
                entry.project_uuid.to_string(),
                entry.quarantined_at,
                entry.original_bag_path.as_str(),
                entry.original_user_path.as_deref(),
                entry.quarantine_path.as_str(),
                entry.purge_at,
                entry.reason.as_deref(),
            ],
        )?;
        Ok(())
    }

    fn get_entry_for_project(&self, project_id: Uuid) -> RepoResult<Option<QuarantineEntry>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{ENTRY_SELECT_SQL} WHERE project_uuid = ?1;"))?;
        let mut rows = stmt.query([project_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(parse_entry_row(row)?)),
            None => Ok(None),
        }
    }

    fn list_entries(&self) -> RepoResult<Vec<QuarantineEntry>> {
        self.query_entries(
            &format!("{ENTRY_SELECT_SQL} ORDER BY purge_at ASC, project_uuid ASC;"),
            None,
        )
    }

    fn list_expired(&self, now_ms: i64) -> RepoResult<Vec<QuarantineEntry>> {
        self.query_entries(
            &format!(
                "{ENTRY_SELECT_SQL} WHERE purge_at <= ?1 ORDER BY purge_at ASC, project_uuid ASC;"
            ),
            Some(now_ms),
        )
    }

    fn update_purge_at(&self, project_id: Uuid, purge_at: i64) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE quarantine_entries SET purge_at = ?1 WHERE project_uuid = ?2;",
            params![purge_at, project_id.to_string()],
        )?;
        if changed == 0 {
            return Err(RepoError::not_found("quarantine entry", project_id));
        }
        Ok(())
    }

    fn delete_entry(&self, project_id: Uuid) -> RepoResult<()> {
        let changed = self.conn.execute(
            "DELETE FROM quarantine_entries WHERE project_uuid = ?1;",
            [project_id.to_string()],
        )?;
        if changed == 0 {
            return Err(RepoError::not_found("quarantine entry", project_id));
        }
        Ok(())
    }
}

fn parse_entry_row(row: &Row<'_>) -> RepoResult<QuarantineEntry> {
    let uuid_text: String = row.get("uuid")?;
    let project_text: String = row.get("project_uuid")?;
    Ok(QuarantineEntry {
        uuid: parse_uuid(&uuid_text, "quarantine_entries.uuid")?,
        project_uuid: parse_uuid(&project_text, "quarantine_entries.project_uuid")?,
        quarantined_at: row.get("quarantined_at")?,
        original_bag_path: row.get("original_bag_path")?,
        original_user_path: row.get("original_user_path")?,
        quarantine_path: row.get("quarantine_path")?,
        purge_at: row.get("purge_at")?,
        reason: row.get("reason")?,
    })
}
