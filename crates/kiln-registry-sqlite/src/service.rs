use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use kiln_core::{BuildId, RegistryImage, RunUuid, VersionId};
use kiln_registry::{BuildStatus, BuildUpdate, CreateBuild, RegistryService, RemoteBuild, RemoteVersion, ServiceError, TemplateType};
use rusqlite::{ffi, params, Connection, OptionalExtension, Row};

/// Registry transport persisted in a local SQLite file.
pub struct SqliteService {
    conn: Mutex<Connection>,
    destination: String,
}

impl SqliteService {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path).with_context(|| format!("open sqlite db {}", db_path.display()))?;
        Self::init(conn, format!("local/{}", db_path.display()))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, "local/memory".to_string())
    }

    fn init(conn: Connection, destination: String) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(include_str!("../migrations/0001_init.sql")).context("apply registry schema")?;
        Ok(Self { conn: Mutex::new(conn), destination })
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or_default()
}

pub(crate) fn db_err(e: rusqlite::Error) -> ServiceError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &e {
        match failure.extended_code {
            ffi::SQLITE_CONSTRAINT_PRIMARYKEY | ffi::SQLITE_CONSTRAINT_UNIQUE => return ServiceError::AlreadyExists(e.to_string()),
            ffi::SQLITE_CONSTRAINT_FOREIGNKEY => return ServiceError::NotFound(e.to_string()),
            _ => {}
        }
    }
    ServiceError::Transport(e.to_string())
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, ServiceError> {
    serde_json::to_string(value).map_err(|e| ServiceError::InvalidArgument(e.to_string()))
}

const BUILD_COLUMNS: &str = "id, version_id, component_type, run_uuid, status, cloud_provider, labels_json, images_json";

fn build_from_row(r: &Row<'_>) -> rusqlite::Result<RemoteBuild> {
    let labels_json: String = r.get(6)?;
    let images_json: String = r.get(7)?;
    Ok(RemoteBuild {
        id: BuildId::from_str(r.get::<_, String>(0)?),
        version_id: VersionId::from_str(r.get::<_, String>(1)?),
        component_type: r.get(2)?,
        run_uuid: RunUuid::from_str(r.get::<_, String>(3)?),
        status: BuildStatus::parse(&r.get::<_, String>(4)?),
        cloud_provider: r.get(5)?,
        labels: serde_json::from_str(&labels_json).unwrap_or_default(),
        images: serde_json::from_str::<Vec<RegistryImage>>(&images_json).unwrap_or_default(),
    })
}

fn read_build(conn: &Connection, id: &BuildId) -> Result<RemoteBuild, ServiceError> {
    conn.query_row(&format!("SELECT {BUILD_COLUMNS} FROM builds WHERE id=?1"), params![id.as_str()], build_from_row)
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| ServiceError::NotFound(format!("build {id}")))
}

#[async_trait]
impl RegistryService for SqliteService {
    fn destination(&self) -> String {
        self.destination.clone()
    }

    async fn create_bucket(&self, name: &str, description: &str, labels: &BTreeMap<String, String>) -> Result<(), ServiceError> {
        if name.is_empty() {
            return Err(ServiceError::InvalidArgument("no bucket name was passed in".into()));
        }
        let now = now_unix();
        self.conn()
            .execute(
                "INSERT INTO buckets(name, description, labels_json, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
                params![name, description, to_json(labels)?, now],
            )
            .map_err(db_err)?;
        tracing::debug!(bucket = name, "created bucket");
        Ok(())
    }

    async fn update_bucket(&self, name: &str, description: &str, labels: &BTreeMap<String, String>) -> Result<(), ServiceError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE buckets SET description=?2, labels_json=?3, updated_at=?4 WHERE name=?1",
                params![name, description, to_json(labels)?, now_unix()],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(ServiceError::NotFound(format!("bucket {name}")));
        }
        Ok(())
    }

    async fn create_version(&self, bucket: &str, fingerprint: &str, template_type: TemplateType) -> Result<RemoteVersion, ServiceError> {
        if fingerprint.is_empty() {
            return Err(ServiceError::InvalidArgument("no valid fingerprint was passed in".into()));
        }
        let id = VersionId::new();
        self.conn()
            .execute(
                "INSERT INTO versions(id, bucket_name, fingerprint, template_type, complete, created_at) VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![id.as_str(), bucket, fingerprint, template_type.as_str(), now_unix()],
            )
            .map_err(db_err)?;
        Ok(RemoteVersion { id, bucket_name: bucket.to_string(), fingerprint: fingerprint.to_string(), template_type, complete: false })
    }

    async fn get_version(&self, bucket: &str, fingerprint: &str) -> Result<RemoteVersion, ServiceError> {
        let found = self
            .conn()
            .query_row(
                "SELECT id, template_type, complete FROM versions WHERE bucket_name=?1 AND fingerprint=?2",
                params![bucket, fingerprint],
                |r| {
                    Ok(RemoteVersion {
                        id: VersionId::from_str(r.get::<_, String>(0)?),
                        bucket_name: bucket.to_string(),
                        fingerprint: fingerprint.to_string(),
                        template_type: TemplateType::parse(&r.get::<_, String>(1)?),
                        complete: r.get::<_, i64>(2)? != 0,
                    })
                },
            )
            .optional()
            .map_err(db_err)?;
        // Missing versions are reported the way the protocol expects before creating one.
        found.ok_or_else(|| ServiceError::Aborted(format!("no version of {bucket} for fingerprint {fingerprint}")))
    }

    async fn create_build(&self, req: CreateBuild) -> Result<RemoteBuild, ServiceError> {
        if req.component_type.is_empty() {
            return Err(ServiceError::InvalidArgument("no build component type was passed in".into()));
        }
        let id = BuildId::new();
        let now = now_unix();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO builds(id, version_id, component_type, run_uuid, status, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![id.as_str(), req.version_id.as_str(), req.component_type, req.run_uuid.as_str(), req.status.as_str(), now],
        )
        .map_err(db_err)?;
        read_build(&conn, &id)
    }

    async fn update_build(&self, update: BuildUpdate) -> Result<RemoteBuild, ServiceError> {
        if update.build_id.is_empty() {
            return Err(ServiceError::InvalidArgument("no valid build id was passed in".into()));
        }
        if update.status == BuildStatus::Unset {
            return Err(ServiceError::InvalidArgument("no build status was passed in".into()));
        }

        let conn = self.conn();
        let tx = conn.unchecked_transaction().map_err(db_err)?;
        let current = read_build(&tx, &update.build_id)?;

        tx.execute(
            "UPDATE builds SET run_uuid=?2, status=?3, updated_at=?4 WHERE id=?1",
            params![update.build_id.as_str(), update.run_uuid.as_str(), update.status.as_str(), now_unix()],
        )
        .map_err(db_err)?;
        if let Some(provider) = &update.cloud_provider {
            tx.execute("UPDATE builds SET cloud_provider=?2 WHERE id=?1", params![update.build_id.as_str(), provider])
                .map_err(db_err)?;
        }
        if let Some(source) = &update.source_image_id {
            tx.execute("UPDATE builds SET source_image_id=?2 WHERE id=?1", params![update.build_id.as_str(), source])
                .map_err(db_err)?;
        }
        if let Some(parent) = &update.source_version_id {
            tx.execute("UPDATE builds SET source_version_id=?2 WHERE id=?1", params![update.build_id.as_str(), parent])
                .map_err(db_err)?;
        }
        if let Some(channel) = &update.source_channel_id {
            tx.execute("UPDATE builds SET source_channel_id=?2 WHERE id=?1", params![update.build_id.as_str(), channel])
                .map_err(db_err)?;
        }
        if let Some(labels) = &update.labels {
            tx.execute("UPDATE builds SET labels_json=?2 WHERE id=?1", params![update.build_id.as_str(), to_json(labels)?])
                .map_err(db_err)?;
        }
        if let Some(metadata) = &update.metadata {
            tx.execute("UPDATE builds SET metadata_json=?2 WHERE id=?1", params![update.build_id.as_str(), to_json(metadata)?])
                .map_err(db_err)?;
        }
        if let Some(images) = &update.images {
            tx.execute("UPDATE builds SET images_json=?2 WHERE id=?1", params![update.build_id.as_str(), to_json(images)?])
                .map_err(db_err)?;
        }

        if update.status == BuildStatus::Done {
            let pending: i64 = tx
                .query_row(
                    "SELECT COUNT(1) FROM builds WHERE version_id=?1 AND status != ?2",
                    params![current.version_id.as_str(), BuildStatus::Done.as_str()],
                    |r| r.get(0),
                )
                .map_err(db_err)?;
            if pending == 0 {
                tx.execute("UPDATE versions SET complete=1 WHERE id=?1", params![current.version_id.as_str()]).map_err(db_err)?;
                tracing::info!(version_id = %current.version_id, "every build is done, version complete");
            }
        }

        let updated = read_build(&tx, &update.build_id)?;
        tx.commit().map_err(db_err)?;
        Ok(updated)
    }

    async fn list_builds(&self, _bucket: &str, version_id: &VersionId) -> Result<Vec<RemoteBuild>, ServiceError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!("SELECT {BUILD_COLUMNS} FROM builds WHERE version_id=?1 ORDER BY component_type"))
            .map_err(db_err)?;
        let rows = stmt.query_map(params![version_id.as_str()], build_from_row).map_err(db_err)?;
        let mut builds = vec![];
        for row in rows {
            builds.push(row.map_err(db_err)?);
        }
        Ok(builds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sqlite_open_and_migrate() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested").join("registry.db");
        let _ = SqliteService::open(&db_path).unwrap();
        // Reopening runs the idempotent schema again.
        let svc = SqliteService::open(&db_path).unwrap();
        assert!(svc.destination().starts_with("local/"));
    }

    #[tokio::test]
    async fn duplicate_bucket_is_already_exists() {
        let svc = SqliteService::open_in_memory().unwrap();
        svc.create_bucket("web", "", &BTreeMap::new()).await.unwrap();
        let err = svc.create_bucket("web", "", &BTreeMap::new()).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn version_needs_its_bucket() {
        let svc = SqliteService::open_in_memory().unwrap();
        let err = svc.create_version("nope", "fp", TemplateType::Block).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
