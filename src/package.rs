use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::storage::Warehouse;

/// A stored copy of one uploaded source file.
#[derive(Debug, Clone)]
pub struct Source {
    pub package_id: String,
    pub filename: String,
    pub location: ObjectPath,
    data: Bytes,
}

impl Source {
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

/// Container for the source files of one import. Files are copied into the
/// warehouse under `packages/<id>/` so a load can be re-run from the same bytes.
#[derive(Debug, Clone)]
pub struct SourcePackage {
    id: String,
    warehouse: Warehouse,
}

impl SourcePackage {
    pub fn new(warehouse: Warehouse) -> Self {
        Self::with_id(warehouse, Uuid::new_v4().simple().to_string())
    }

    pub fn with_id(warehouse: Warehouse, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            warehouse,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn location(&self, filename: &str) -> ObjectPath {
        self.warehouse
            .path(&format!("packages/{}/{}", self.id, filename))
    }

    pub async fn ingest_bytes(&self, filename: &str, data: impl Into<Bytes>) -> Result<Source> {
        let filename = sanitize_filename(filename)?;
        let data: Bytes = data.into();
        let location = self.location(&filename);

        info!(
            "Ingesting {} ({} bytes) into package {}",
            filename,
            data.len(),
            self.id
        );
        self.warehouse.put(&location, data.to_vec()).await?;

        Ok(Source {
            package_id: self.id.clone(),
            filename,
            location,
            data,
        })
    }

    pub async fn ingest_path(&self, path: impl AsRef<Path>) -> Result<Source> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("source.csv")
            .to_string();
        let data = tokio::fs::read(path).await?;
        self.ingest_bytes(&filename, data).await
    }

    /// Re-reads a previously ingested file.
    pub async fn open(&self, filename: &str) -> Result<Source> {
        let filename = sanitize_filename(filename)?;
        let location = self.location(&filename);
        let data = self
            .warehouse
            .get(&location)
            .await?
            .ok_or_else(|| EngineError::Storage {
                message: format!("{} not found in package {}", filename, self.id),
            })?;

        Ok(Source {
            package_id: self.id.clone(),
            filename,
            location,
            data,
        })
    }
}

fn sanitize_filename(filename: &str) -> Result<String> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or("").trim();
    if name.is_empty() || name == "." || name == ".." {
        return Err(EngineError::validation(format!(
            "invalid source file name '{}'",
            filename
        )));
    }
    Ok(name.to_string())
}
