use std::path::PathBuf;

use kiln_core::{RegistryImage, VersionId};
use kiln_registry::{RemoteVersion, ServiceError, TemplateType};
use rusqlite::{params, OptionalExtension, Row};

use crate::service::{db_err, SqliteService};

/// Where the local registry lives unless `KILN_REGISTRY_DB` or the user
/// settings say otherwise.
pub const DEFAULT_DATABASE: &str = "~/.kiln/registry.db";

/// Expands `~` and `$VARS` in `path`, falling back to [`DEFAULT_DATABASE`].
pub fn database_path(path: Option<&str>) -> PathBuf {
    let raw = path.filter(|p| !p.is_empty()).unwrap_or(DEFAULT_DATABASE);
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(raw),
    }
}

/// One published image together with the component that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedImage {
    pub component_type: String,
    pub image: RegistryImage,
}

fn version_from_row(r: &Row<'_>) -> rusqlite::Result<RemoteVersion> {
    Ok(RemoteVersion {
        id: VersionId::from_str(r.get::<_, String>(0)?),
        bucket_name: r.get(1)?,
        fingerprint: r.get(2)?,
        template_type: TemplateType::parse(&r.get::<_, String>(3)?),
        complete: r.get::<_, i64>(4)? != 0,
    })
}

const VERSION_COLUMNS: &str = "id, bucket_name, fingerprint, template_type, complete";

impl SqliteService {
    /// Most recently created complete version of `bucket`.
    pub fn latest_complete_version(&self, bucket: &str) -> Result<Option<RemoteVersion>, ServiceError> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM versions WHERE bucket_name=?1 AND complete=1 ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                params![bucket],
                version_from_row,
            )
            .optional()
            .map_err(db_err)
    }

    pub fn version_by_id(&self, id: &str) -> Result<Option<RemoteVersion>, ServiceError> {
        self.conn()
            .query_row(&format!("SELECT {VERSION_COLUMNS} FROM versions WHERE id=?1"), params![id], version_from_row)
            .optional()
            .map_err(db_err)
    }

    pub fn version_by_fingerprint(&self, bucket: &str, fingerprint: &str) -> Result<Option<RemoteVersion>, ServiceError> {
        self.conn()
            .query_row(
                &format!("SELECT {VERSION_COLUMNS} FROM versions WHERE bucket_name=?1 AND fingerprint=?2"),
                params![bucket, fingerprint],
                version_from_row,
            )
            .optional()
            .map_err(db_err)
    }

    pub fn published_images(&self, version_id: &VersionId) -> Result<Vec<PublishedImage>, ServiceError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT component_type, images_json FROM builds WHERE version_id=?1 ORDER BY component_type")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![version_id.as_str()], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .map_err(db_err)?;

        let mut out = Vec::new();
        for row in rows {
            let (component_type, images_json) = row.map_err(db_err)?;
            let images: Vec<RegistryImage> =
                serde_json::from_str(&images_json).map_err(|e| ServiceError::Transport(format!("decode images of {component_type}: {e}")))?;
            out.extend(images.into_iter().map(|image| PublishedImage { component_type: component_type.clone(), image }));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_path_defaults_and_expands() {
        assert_eq!(database_path(Some("/tmp/r.db")), PathBuf::from("/tmp/r.db"));
        let default = database_path(None);
        assert!(default.ends_with(".kiln/registry.db"), "{}", default.display());
        assert!(!default.starts_with("~"));
    }

    #[test]
    fn lookups_on_empty_database() {
        let svc = SqliteService::open_in_memory().unwrap();
        assert!(svc.latest_complete_version("web").unwrap().is_none());
        assert!(svc.version_by_id("nope").unwrap().is_none());
        assert!(svc.published_images(&VersionId::from_str("nope")).unwrap().is_empty());
    }
}
