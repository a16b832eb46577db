//! Project repository.
//!
//! # Invariants
//! - Writes call `ArchivedProject::validate()` first.
//! - Default listings hide quarantined and purged projects.
//! - Listing order is `created_at DESC, uuid ASC`.

use super::{
    from_db_int, parse_optional_uuid, parse_uuid, push_page, to_db_int, RepoError, RepoResult,
};
use crate::model::project::{ArchivedProject, ProjectId, ProjectState};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::PathBuf;

const PROJECT_SELECT_SQL: &str = "SELECT
    uuid,
    name,
    description,
    state,
    file_count,
    total_size,
    package_uuid,
    last_error,
    created_at,
    updated_at,
    archived_at
FROM projects";

/// Listing options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectListQuery {
    pub include_quarantined: bool,
    pub include_purged: bool,
    /// Restricts results to these states when non-empty.
    pub states: Vec<ProjectState>,
    pub limit: Option<u32>,
    pub offset: u32,
}

impl ProjectListQuery {
    /// Every project in one of `states`, regardless of visibility flags.
    pub fn in_states(states: &[ProjectState]) -> Self {
        Self {
            include_quarantined: true,
            include_purged: true,
            states: states.to_vec(),
            limit: None,
            offset: 0,
        }
    }
}

pub trait ProjectRepository {
    fn create_project(&self, project: &ArchivedProject) -> RepoResult<ProjectId>;
    fn update_project(&self, project: &ArchivedProject) -> RepoResult<()>;
    fn get_project(&self, id: ProjectId) -> RepoResult<Option<ArchivedProject>>;
    fn list_projects(&self, query: &ProjectListQuery) -> RepoResult<Vec<ArchivedProject>>;
    /// Replaces the recorded input paths used to retry packaging.
    fn replace_sources(&self, id: ProjectId, paths: &[PathBuf]) -> RepoResult<()>;
    fn list_sources(&self, id: ProjectId) -> RepoResult<Vec<PathBuf>>;
}

pub struct SqliteProjectRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteProjectRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl ProjectRepository for SqliteProjectRepository<'_> {
    fn create_project(&self, project: &ArchivedProject) -> RepoResult<ProjectId> {
        project.validate()?;
        self.conn.execute(
            "INSERT INTO projects (
                uuid,
                name,
                description,
                state,
                file_count,
                total_size,
                package_uuid,
                last_error,
                created_at,
                updated_at,
                archived_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11);",
            params![
                project.uuid.to_string(),
                project.name.as_str(),
                project.description.as_deref(),
                project.state.as_str(),
                to_db_int(project.file_count, "projects.file_count")?,
                to_db_int(project.total_size, "projects.total_size")?,
                project.package_uuid.map(|id| id.to_string()),
                project.last_error.as_deref(),
                project.created_at,
                project.updated_at,
                project.archived_at,
            ],
        )?;
        Ok(project.uuid)
    }

    fn update_project(&self, project: &ArchivedProject) -> RepoResult<()> {
        project.validate()?;
        let changed = self.conn.execute(
            "UPDATE projects
             SET
                name = ?1,
                description = ?2,
                state = ?3,
                file_count = ?4,
                total_size = ?5,
                package_uuid = ?6,
                last_error = ?7,
                updated_at = ?8,
                archived_at = ?9
             WHERE uuid = ?10;",
            params![
                project.name.as_str(),
                project.description.as_deref(),
                project.state.as_str(),
                to_db_int(project.file_count, "projects.file_count")?,
                to_db_int(project.total_size, "projects.total_size")?,
                project.package_uuid.map(|id| id.to_string()),
                project.last_error.as_deref(),
                project.updated_at,
                project.archived_at,
                project.uuid.to_string(),
            ],
        )?;
        if changed == 0 {
            return Err(RepoError::not_found("project", project.uuid));
        }
        Ok(())
    }

    fn get_project(&self, id: ProjectId) -> RepoResult<Option<ArchivedProject>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{PROJECT_SELECT_SQL} WHERE uuid = ?1;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(parse_project_row(row)?)),
            None => Ok(None),
        }
    }

    fn list_projects(&self, query: &ProjectListQuery) -> RepoResult<Vec<ArchivedProject>> {
        let mut sql = format!("{PROJECT_SELECT_SQL} WHERE 1 = 1");
        let mut bind_values: Vec<Value> = Vec::new();

        if !query.include_quarantined {
            sql.push_str(" AND state <> 'quarantined'");
        }
        if !query.include_purged {
            sql.push_str(" AND state <> 'purged'");
        }
        if !query.states.is_empty() {
            let placeholders = vec!["?"; query.states.len()].join(", ");
            sql.push_str(&format!(" AND state IN ({placeholders})"));
            bind_values.extend(
                query
                    .states
                    .iter()
                    .map(|state| Value::Text(state.as_str().to_string())),
            );
        }
        sql.push_str(" ORDER BY created_at DESC, uuid ASC");
        push_page(&mut sql, &mut bind_values, query.limit, query.offset);

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut projects = Vec::new();
        while let Some(row) = rows.next()? {
            projects.push(parse_project_row(row)?);
        }
        Ok(projects)
    }

    fn replace_sources(&self, id: ProjectId, paths: &[PathBuf]) -> RepoResult<()> {
        self.conn.execute(
            "DELETE FROM project_sources WHERE project_uuid = ?1;",
            [id.to_string()],
        )?;
        let mut stmt = self.conn.prepare(
            "INSERT INTO project_sources (project_uuid, position, path) VALUES (?1, ?2, ?3);",
        )?;
        for (position, path) in paths.iter().enumerate() {
            let text = path.to_str().ok_or_else(|| {
                RepoError::InvalidData(format!("source path is not UTF-8: {}", path.display()))
            })?;
            stmt.execute(params![id.to_string(), position as i64, text])?;
        }
        Ok(())
    }

    fn list_sources(&self, id: ProjectId) -> RepoResult<Vec<PathBuf>> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM projects WHERE uuid = ?1;",
                [id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(RepoError::not_found("project", id));
        }
        let mut stmt = self.conn.prepare(
            "SELECT path FROM project_sources WHERE project_uuid = ?1 ORDER BY position ASC;",
        )?;
        let paths = stmt
            .query_map([id.to_string()], |row| row.get::<_, String>(0))?
            .map(|path| path.map(PathBuf::from))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(paths)
    }
}

fn parse_project_row(row: &Row<'_>) -> RepoResult<ArchivedProject> {
    let uuid_text: String = row.get("uuid")?;
    let state_text: String = row.get("state")?;
    let state = ProjectState::parse(&state_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid project state `{state_text}` in projects.state"))
    })?;

    Ok(ArchivedProject {
        uuid: parse_uuid(&uuid_text, "projects.uuid")?,
        name: row.get("name")?,
        description: row.get("description")?,
        state,
        file_count: from_db_int(row.get("file_count")?, "projects.file_count")?,
        total_size: from_db_int(row.get("total_size")?, "projects.total_size")?,
        package_uuid: parse_optional_uuid(row.get("package_uuid")?, "projects.package_uuid")?,
        last_error: row.get("last_error")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        archived_at: row.get("archived_at")?,
    })
}
