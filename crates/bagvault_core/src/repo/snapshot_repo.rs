//! Integrity snapshot persistence.
//!
//! # Invariants
//! - Snapshots and their entries are append-only.
//! - "Latest" means highest `seq`, never highest timestamp.

use super::{from_db_int, parse_uuid, to_db_int, RepoError, RepoResult};
use crate::checksum::Algorithm;
use crate::model::snapshot::{Layer, SnapshotEntry, VaultSnapshot};
use rusqlite::{params, Connection, Row};

const SNAPSHOT_SELECT_SQL: &str = "SELECT
    seq,
    uuid,
    scanned_at,
    algorithm,
    user_checksum,
    bag_checksum,
    user_files,
    bag_files,
    anomalies
FROM vault_snapshots";

pub trait SnapshotRepository {
    /// Stores the snapshot with its entries; `snapshot.seq` is ignored and
    /// the stored record is returned.
    fn create_snapshot(
        &self,
        snapshot: &VaultSnapshot,
        entries: &[SnapshotEntry],
    ) -> RepoResult<VaultSnapshot>;
    fn latest_snapshot(&self) -> RepoResult<Option<VaultSnapshot>>;
    fn list_entries(&self, snapshot_seq: i64) -> RepoResult<Vec<SnapshotEntry>>;
    /// Newest first.
    fn list_snapshots(&self, limit: u32) -> RepoResult<Vec<VaultSnapshot>>;
}

pub struct SqliteSnapshotRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteSnapshotRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl SnapshotRepository for SqliteSnapshotRepository<'_> {
    fn create_snapshot(
        &self,
        snapshot: &VaultSnapshot,
        entries: &[SnapshotEntry],
    ) -> RepoResult<VaultSnapshot> {
        let anomalies = serde_json::to_string(&snapshot.anomalies)
            .map_err(|err| RepoError::InvalidData(format!("cannot encode anomalies: {err}")))?;
        self.conn.execute(
            "INSERT INTO vault_snapshots (
                uuid,
                scanned_at,
                algorithm,
                user_checksum,
                bag_checksum,
                user_files,
                bag_files,
                anomalies
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
            params![
                snapshot.uuid.to_string(),
                snapshot.scanned_at,
                snapshot.algorithm.as_str(),
                snapshot.user_checksum.as_str(),
                snapshot.bag_checksum.as_str(),
                to_db_int(snapshot.user_files, "vault_snapshots.user_files")?,
                to_db_int(snapshot.bag_files, "vault_snapshots.bag_files")?,
                anomalies,
            ],
        )?;
        let seq = self.conn.last_insert_rowid();

        let mut stmt = self.conn.prepare(
            "INSERT INTO snapshot_entries (snapshot_seq, layer, rel_path, digest, size)
             VALUES (?1, ?2, ?3, ?4, ?5);",
        )?;
        for entry in entries {
            stmt.execute(params![
                seq,
                entry.layer.as_str(),
                entry.rel_path.as_str(),
                entry.digest.as_str(),
                to_db_int(entry.size, "snapshot_entries.size")?,
            ])?;
        }

        Ok(VaultSnapshot {
            seq,
            ..snapshot.clone()
        })
    }

    fn latest_snapshot(&self) -> RepoResult<Option<VaultSnapshot>> {
        Ok(self.list_snapshots(1)?.into_iter().next())
    }

    fn list_entries(&self, snapshot_seq: i64) -> RepoResult<Vec<SnapshotEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT layer, rel_path, digest, size
             FROM snapshot_entries
             WHERE snapshot_seq = ?1
             ORDER BY rel_path ASC;",
        )?;
        let mut rows = stmt.query([snapshot_seq])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let layer_text: String = row.get("layer")?;
            let layer = Layer::parse(&layer_text).ok_or_else(|| {
                RepoError::InvalidData(format!(
                    "invalid layer `{layer_text}` in snapshot_entries.layer"
                ))
            })?;
            entries.push(SnapshotEntry {
                layer,
                rel_path: row.get("rel_path")?,
                digest: row.get("digest")?,
                size: from_db_int(row.get("size")?, "snapshot_entries.size")?,
            });
        }
        Ok(entries)
    }

    fn list_snapshots(&self, limit: u32) -> RepoResult<Vec<VaultSnapshot>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SNAPSHOT_SELECT_SQL} ORDER BY seq DESC LIMIT ?1;"
        ))?;
        let mut rows = stmt.query([i64::from(limit)])?;
        let mut snapshots = Vec::new();
        while let Some(row) = rows.next()? {
            snapshots.push(parse_snapshot_row(row)?);
        }
        Ok(snapshots)
    }
}

fn parse_snapshot_row(row: &Row<'_>) -> RepoResult<VaultSnapshot> {
    let uuid_text: String = row.get("uuid")?;
    let algorithm_text: String = row.get("algorithm")?;
    let anomalies_text: String = row.get("anomalies")?;

    let algorithm = Algorithm::parse(&algorithm_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "unknown algorithm `{algorithm_text}` in vault_snapshots.algorithm"
        ))
    })?;
    let anomalies = serde_json::from_str(&anomalies_text).map_err(|err| {
        RepoError::InvalidData(format!("invalid JSON in vault_snapshots.anomalies: {err}"))
    })?;

    Ok(VaultSnapshot {
        seq: row.get("seq")?,
        uuid: parse_uuid(&uuid_text, "vault_snapshots.uuid")?,
        scanned_at: row.get("scanned_at")?,
        algorithm,
        user_checksum: row.get("user_checksum")?,
        bag_checksum: row.get("bag_checksum")?,
        user_files: from_db_int(row.get("user_files")?, "vault_snapshots.user_files")?,
        bag_files: from_db_int(row.get("bag_files")?, "vault_snapshots.bag_files")?,
        anomalies,
    })
}

#[cfg(test)]
mod tests {
    use super::{SnapshotRepository, SqliteSnapshotRepository};
    use crate::checksum::Algorithm;
    use crate::db::open_db_in_memory;
    use crate::model::snapshot::{
        Anomaly, AnomalyKind, Layer, Severity, SnapshotEntry, VaultSnapshot,
    };
    use uuid::Uuid;

    fn snapshot(anomalies: Vec<Anomaly>) -> VaultSnapshot {
        VaultSnapshot {
            seq: 0,
            uuid: Uuid::new_v4(),
            scanned_at: 100,
            algorithm: Algorithm::Blake3,
            user_checksum: "aa".repeat(32),
            bag_checksum: "bb".repeat(32),
            user_files: 1,
            bag_files: 0,
            anomalies,
        }
    }

    #[test]
    fn latest_snapshot_is_highest_seq() {
        let conn = open_db_in_memory().unwrap();
        let repo = SqliteSnapshotRepository::new(&conn);
        assert_eq!(repo.latest_snapshot().unwrap(), None);

        let entry = SnapshotEntry {
            layer: Layer::User,
            rel_path: "projects/a/x.txt".to_string(),
            digest: "cc".repeat(32),
            size: 3,
        };
        let first = repo.create_snapshot(&snapshot(Vec::new()), &[entry.clone()]).unwrap();
        let anomaly = Anomaly {
            kind: AnomalyKind::MissingFile,
            severity: Severity::Critical,
            layer: Layer::User,
            paths: vec!["projects/a/x.txt".to_string()],
            detail: "file is missing".to_string(),
        };
        let second = repo.create_snapshot(&snapshot(vec![anomaly]), &[]).unwrap();

        assert!(second.seq > first.seq);
        assert_eq!(repo.latest_snapshot().unwrap(), Some(second));
        assert_eq!(repo.list_entries(first.seq).unwrap(), vec![entry]);
    }

    #[test]
    fn snapshots_cannot_be_deleted() {
        let conn = open_db_in_memory().unwrap();
        let repo = SqliteSnapshotRepository::new(&conn);
        repo.create_snapshot(&snapshot(Vec::new()), &[]).unwrap();

        assert!(conn.execute("DELETE FROM vault_snapshots;", []).is_err());
    }
}
