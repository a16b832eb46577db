//! Package, payload fixity and location persistence.
//!
//! # Invariants
//! - At most one package per project and one project per package root.
//! - `locations` is the only place that tracks where an entity currently
//!   lives; quarantine, restore and purge rewrite it, never the package row.

use super::{bool_to_int, from_db_int, parse_uuid, to_db_int, RepoError, RepoResult};
use crate::checksum::{Algorithm, DigestSet};
use crate::model::package::{BagitPackage, LocationKind, PackageFile, PackageId};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use uuid::Uuid;

const PACKAGE_SELECT_SQL: &str = "SELECT
    uuid,
    project_uuid,
    root_path,
    manifest_algorithms,
    manifest_digest,
    bag_size,
    payload_bytes,
    payload_files,
    is_valid,
    validated_at,
    created_at
FROM packages";

pub trait PackageRepository {
    fn create_package(
        &self,
        package: &BagitPackage,
        files: &[PackageFile],
    ) -> RepoResult<PackageId>;
    fn get_package(&self, id: PackageId) -> RepoResult<Option<BagitPackage>>;
    fn get_package_for_project(&self, project_id: Uuid) -> RepoResult<Option<BagitPackage>>;
    /// Payload entries sorted by relative path.
    fn list_files(&self, package_id: PackageId) -> RepoResult<Vec<PackageFile>>;
    fn record_validation(&self, id: PackageId, is_valid: bool, validated_at: i64) -> RepoResult<()>;
    /// Deletes the package row and its payload entries.
    fn delete_package(&self, id: PackageId) -> RepoResult<()>;
}

/// Identifier -> current vault-relative path lookup.
pub trait LocationRepository {
    fn set_location(
        &self,
        entity: Uuid,
        kind: LocationKind,
        rel_path: &str,
        now_ms: i64,
    ) -> RepoResult<()>;
    fn get_location(&self, entity: Uuid, kind: LocationKind) -> RepoResult<Option<String>>;
    fn delete_location(&self, entity: Uuid, kind: LocationKind) -> RepoResult<()>;
}

pub struct SqlitePackageRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqlitePackageRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl PackageRepository for SqlitePackageRepository<'_> {
    fn create_package(
        &self,
        package: &BagitPackage,
        files: &[PackageFile],
    ) -> RepoResult<PackageId> {
        if package.manifest_algorithms.is_empty() {
            return Err(RepoError::InvalidData(format!(
                "package {} has no manifest algorithm",
                package.uuid
            )));
        }
        self.conn.execute(
            "INSERT INTO packages (
                uuid,
                project_uuid,
                root_path,
                manifest_algorithms,
                manifest_digest,
                bag_size,
                payload_bytes,
                payload_files,
                is_valid,
                validated_at,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11);",
            params![
                package.uuid.to_string(),
                package.project_uuid.to_string(),
                package.root_path.as_str(),
                algorithms_to_db(&package.manifest_algorithms),
                package.manifest_digest.as_str(),
                to_db_int(package.bag_size, "packages.bag_size")?,
                to_db_int(package.payload_bytes, "packages.payload_bytes")?,
                to_db_int(package.payload_files, "packages.payload_files")?,
                bool_to_int(package.is_valid),
                package.validated_at,
                package.created_at,
            ],
        )?;

        let mut stmt = self.conn.prepare(
            "INSERT INTO package_files (package_uuid, rel_path, size, digests)
             VALUES (?1, ?2, ?3, ?4);",
        )?;
        for file in files {
            stmt.execute(params![
                package.uuid.to_string(),
                file.rel_path.as_str(),
                to_db_int(file.size, "package_files.size")?,
                digests_to_db(&file.digests)?,
            ])?;
        }
        Ok(package.uuid)
    }

    fn get_package(&self, id: PackageId) -> RepoResult<Option<BagitPackage>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{PACKAGE_SELECT_SQL} WHERE uuid = ?1;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(parse_package_row(row)?)),
            None => Ok(None),
        }
    }

    fn get_package_for_project(&self, project_id: Uuid) -> RepoResult<Option<BagitPackage>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{PACKAGE_SELECT_SQL} WHERE project_uuid = ?1;"))?;
        let mut rows = stmt.query([project_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(parse_package_row(row)?)),
            None => Ok(None),
        }
    }

    fn list_files(&self, package_id: PackageId) -> RepoResult<Vec<PackageFile>> {
        let mut stmt = self.conn.prepare(
            "SELECT rel_path, size, digests
             FROM package_files
             WHERE package_uuid = ?1
             ORDER BY rel_path ASC;",
        )?;
        let mut rows = stmt.query([package_id.to_string()])?;
        let mut files = Vec::new();
        while let Some(row) = rows.next()? {
            let digests_text: String = row.get("digests")?;
            files.push(PackageFile {
                rel_path: row.get("rel_path")?,
                size: from_db_int(row.get("size")?, "package_files.size")?,
                digests: digests_from_db(&digests_text)?,
            });
        }
        Ok(files)
    }

    fn record_validation(
        &self,
        id: PackageId,
        is_valid: bool,
        validated_at: i64,
    ) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE packages SET is_valid = ?1, validated_at = ?2 WHERE uuid = ?3;",
            params![bool_to_int(is_valid), validated_at, id.to_string()],
        )?;
        if changed == 0 {
            return Err(RepoError::not_found("package", id));
        }
        Ok(())
    }

    fn delete_package(&self, id: PackageId) -> RepoResult<()> {
        let changed = self
            .conn
            .execute("DELETE FROM packages WHERE uuid = ?1;", [id.to_string()])?;
        if changed == 0 {
            return Err(RepoError::not_found("package", id));
        }
        Ok(())
    }
}

impl LocationRepository for SqlitePackageRepository<'_> {
    fn set_location(
        &self,
        entity: Uuid,
        kind: LocationKind,
        rel_path: &str,
        now_ms: i64,
    ) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO locations (entity_uuid, kind, rel_path, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (entity_uuid, kind)
             DO UPDATE SET rel_path = excluded.rel_path, updated_at = excluded.updated_at;",
            params![entity.to_string(), kind.as_str(), rel_path, now_ms],
        )?;
        Ok(())
    }

    fn get_location(&self, entity: Uuid, kind: LocationKind) -> RepoResult<Option<String>> {
        let path = self
            .conn
            .query_row(
                "SELECT rel_path FROM locations WHERE entity_uuid = ?1 AND kind = ?2;",
                params![entity.to_string(), kind.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(path)
    }

    fn delete_location(&self, entity: Uuid, kind: LocationKind) -> RepoResult<()> {
        self.conn.execute(
            "DELETE FROM locations WHERE entity_uuid = ?1 AND kind = ?2;",
            params![entity.to_string(), kind.as_str()],
        )?;
        Ok(())
    }
}

fn parse_package_row(row: &Row<'_>) -> RepoResult<BagitPackage> {
    let uuid_text: String = row.get("uuid")?;
    let project_text: String = row.get("project_uuid")?;
    let algorithms_text: String = row.get("manifest_algorithms")?;
    let is_valid: i64 = row.get("is_valid")?;

    Ok(BagitPackage {
        uuid: parse_uuid(&uuid_text, "packages.uuid")?,
        project_uuid: parse_uuid(&project_text, "packages.project_uuid")?,
        root_path: row.get("root_path")?,
        manifest_algorithms: algorithms_from_db(&algorithms_text)?,
        manifest_digest: row.get("manifest_digest")?,
        bag_size: from_db_int(row.get("bag_size")?, "packages.bag_size")?,
        payload_bytes: from_db_int(row.get("payload_bytes")?, "packages.payload_bytes")?,
        payload_files: from_db_int(row.get("payload_files")?, "packages.payload_files")?,
        is_valid: is_valid == 1,
        validated_at: row.get("validated_at")?,
        created_at: row.get("created_at")?,
    })
}

fn algorithms_to_db(algorithms: &[Algorithm]) -> String {
    algorithms
        .iter()
        .map(|algorithm| algorithm.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

fn algorithms_from_db(value: &str) -> RepoResult<Vec<Algorithm>> {
    value
        .split(',')
        .map(|name| {
            Algorithm::parse(name).ok_or_else(|| {
                RepoError::InvalidData(format!(
                    "unknown algorithm `{name}` in packages.manifest_algorithms"
                ))
            })
        })
        .collect()
}

fn digests_to_db(digests: &DigestSet) -> RepoResult<String> {
    let by_name: BTreeMap<&str, &str> = digests
        .iter()
        .map(|(algorithm, digest)| (algorithm.as_str(), digest.as_str()))
        .collect();
    serde_json::to_string(&by_name)
        .map_err(|err| RepoError::InvalidData(format!("cannot encode digests: {err}")))
}

fn digests_from_db(value: &str) -> RepoResult<DigestSet> {
    let by_name: BTreeMap<String, String> = serde_json::from_str(value).map_err(|err| {
        RepoError::InvalidData(format!("invalid JSON in package_files.digests: {err}"))
    })?;
    by_name
        .into_iter()
        .map(|(name, digest)| {
            Algorithm::parse(&name)
                .map(|algorithm| (algorithm, digest))
                .ok_or_else(|| {
                    RepoError::InvalidData(format!(
                        "unknown algorithm `{name}` in package_files.digests"
                    ))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{LocationRepository, PackageRepository, SqlitePackageRepository};
    use crate::checksum::Algorithm;
    use crate::db::open_db_in_memory;
    use crate::model::package::{BagitPackage, LocationKind, PackageFile};
    use crate::model::project::ArchivedProject;
    use crate::repo::project_repo::{ProjectRepository, SqliteProjectRepository};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn package_for(project_uuid: Uuid) -> BagitPackage {
        BagitPackage {
            uuid: Uuid::new_v4(),
            project_uuid,
            root_path: format!(".bags/p-{}", project_uuid.simple()),
            manifest_algorithms: vec![Algorithm::Sha256, Algorithm::Sha512],
            manifest_digest: "ab".repeat(32),
            bag_size: 2048,
            payload_bytes: 12,
            payload_files: 1,
            is_valid: true,
            validated_at: Some(5),
            created_at: 5,
        }
    }

    #[test]
    fn package_roundtrips_with_files() {
        let conn = open_db_in_memory().unwrap();
        let project = ArchivedProject::new("pkg", None, 0);
        SqliteProjectRepository::new(&conn)
            .create_project(&project)
            .unwrap();
        let repo = SqlitePackageRepository::new(&conn);
        let package = package_for(project.uuid);
        let file = PackageFile {
            rel_path: "docs/readme.md".to_string(),
            size: 12,
            digests: BTreeMap::from([
                (Algorithm::Sha256, "11".repeat(32)),
                (Algorithm::Md5, "22".repeat(16)),
            ]),
        };

        repo.create_package(&package, &[file.clone()]).unwrap();
        assert_eq!(
            repo.get_package_for_project(project.uuid).unwrap(),
            Some(package.clone())
        );
        assert_eq!(repo.list_files(package.uuid).unwrap(), vec![file]);

        repo.record_validation(package.uuid, false, 9).unwrap();
        let reloaded = repo.get_package(package.uuid).unwrap().unwrap();
        assert!(!reloaded.is_valid);
        assert_eq!(reloaded.validated_at, Some(9));

        repo.delete_package(package.uuid).unwrap();
        assert!(repo.list_files(package.uuid).unwrap().is_empty());
    }

    #[test]
    fn second_package_for_project_is_rejected() {
        let conn = open_db_in_memory().unwrap();
        let project = ArchivedProject::new("pkg", None, 0);
        SqliteProjectRepository::new(&conn)
            .create_project(&project)
            .unwrap();
        let repo = SqlitePackageRepository::new(&conn);

        repo.create_package(&package_for(project.uuid), &[]).unwrap();
        let mut second = package_for(project.uuid);
        second.root_path = ".bags/other".to_string();
        assert!(repo.create_package(&second, &[]).is_err());
    }

    #[test]
    fn locations_upsert_and_delete() {
        let conn = open_db_in_memory().unwrap();
        let repo = SqlitePackageRepository::new(&conn);
        let entity = Uuid::new_v4();

        repo.set_location(entity, LocationKind::Bag, ".bags/a", 1).unwrap();
        repo.set_location(entity, LocationKind::Bag, ".quarantine/x/bag", 2)
            .unwrap();
        assert_eq!(
            repo.get_location(entity, LocationKind::Bag).unwrap().as_deref(),
            Some(".quarantine/x/bag")
        );
        assert_eq!(repo.get_location(entity, LocationKind::UserCopy).unwrap(), None);

        repo.delete_location(entity, LocationKind::Bag).unwrap();
        assert_eq!(repo.get_location(entity, LocationKind::Bag).unwrap(), None);
    }
}
