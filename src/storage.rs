use datafusion::execution::config::SessionConfig;
use datafusion::execution::context::SessionContext;
use datafusion::execution::object_store::ObjectStoreUrl;
use datafusion::execution::runtime_env::RuntimeEnvBuilder;
use futures::TryStreamExt;
use object_store::{
    aws::AmazonS3Builder, gcp::GoogleCloudStorageBuilder, local::LocalFileSystem,
    memory::InMemory, path::Path as ObjectPath, ObjectStore, PutPayload,
};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::error::{EngineError, Result};

pub const DEFAULT_MEMORY_LIMIT: usize = 4 * 1024 * 1024 * 1024;

/// Object store holding every fact table and uploaded source package, plus the
/// factory for DataFusion sessions that can read from it.
#[derive(Debug, Clone)]
pub struct Warehouse {
    store: Arc<dyn ObjectStore>,
    store_url: ObjectStoreUrl,
    root: ObjectPath,
    memory_limit: usize,
}

fn create_gcs_client(bucket_name: &str) -> Result<Arc<dyn ObjectStore>> {
    let mut builder = GoogleCloudStorageBuilder::new().with_bucket_name(bucket_name);

    if let Ok(service_account_path) = std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
        builder = builder.with_service_account_path(service_account_path);
    }

    let store = builder.build().map_err(|e| EngineError::ConfigError {
        message: format!(
            "Failed to create GCS client for bucket '{}': {}",
            bucket_name, e
        ),
    })?;

    Ok(Arc::new(store))
}

fn create_s3_client(bucket_name: &str) -> Result<Arc<dyn ObjectStore>> {
    let store = AmazonS3Builder::from_env()
        .with_bucket_name(bucket_name)
        .build()
        .map_err(|e| EngineError::ConfigError {
            message: format!("Failed to create S3 client for bucket '{}': {}", bucket_name, e),
        })?;

    Ok(Arc::new(store))
}

impl Warehouse {
    /// Opens a warehouse from `memory://`, `file:///abs/dir`, `s3://bucket/prefix`
    /// or `gs://bucket/prefix`.
    pub fn from_url(warehouse_url: &str) -> Result<Self> {
        let url = Url::parse(warehouse_url).map_err(|e| EngineError::ConfigError {
            message: format!("Invalid warehouse URL '{}': {}", warehouse_url, e),
        })?;
        let prefix = url.path().trim_matches('/').to_string();

        let (store, store_url): (Arc<dyn ObjectStore>, String) = match url.scheme() {
            "memory" => (Arc::new(InMemory::new()), "memory://".to_string()),
            "file" => {
                let dir = url.to_file_path().map_err(|_| EngineError::ConfigError {
                    message: format!("Invalid file warehouse URL: {}", warehouse_url),
                })?;
                std::fs::create_dir_all(&dir)?;
                (Arc::new(LocalFileSystem::new()), "file://".to_string())
            }
            "s3" => {
                let bucket = url.host_str().ok_or_else(|| EngineError::ConfigError {
                    message: "Invalid S3 URL: missing bucket".to_string(),
                })?;
                info!("Creating S3 client for bucket: {}", bucket);
                (create_s3_client(bucket)?, format!("s3://{}", bucket))
            }
            "gs" => {
                let bucket = url.host_str().ok_or_else(|| EngineError::ConfigError {
                    message: "Invalid GCS URL: missing bucket".to_string(),
                })?;
                info!("Creating GCS client for bucket: {}", bucket);
                (create_gcs_client(bucket)?, format!("gs://{}", bucket))
            }
            scheme => {
                return Err(EngineError::ConfigError {
                    message: format!("Unsupported storage scheme: {}", scheme),
                });
            }
        };

        let store_url = ObjectStoreUrl::parse(&store_url)?;
        info!("Warehouse opened at {}", warehouse_url);

        Ok(Self {
            store,
            store_url,
            root: ObjectPath::from(prefix),
            memory_limit: DEFAULT_MEMORY_LIMIT,
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_url("memory://")
    }

    pub fn with_memory_limit(mut self, memory_limit: usize) -> Self {
        self.memory_limit = memory_limit;
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Object path below the warehouse root.
    pub fn path(&self, relative: &str) -> ObjectPath {
        let root = self.root.as_ref();
        if root.is_empty() {
            ObjectPath::from(relative)
        } else {
            ObjectPath::from(format!("{}/{}", root, relative))
        }
    }

    /// URL of a directory below the root, in the form DataFusion listing tables expect.
    pub fn directory_url(&self, relative: &str) -> String {
        format!("{}{}/", self.store_url.as_str(), self.path(relative))
    }

    pub async fn put(&self, path: &ObjectPath, bytes: Vec<u8>) -> Result<()> {
        debug!("Writing {} bytes to {}", bytes.len(), path);
        self.store.put(path, PutPayload::from(bytes)).await?;
        Ok(())
    }

    pub async fn get(&self, path: &ObjectPath) -> Result<Option<bytes::Bytes>> {
        match self.store.get(path).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list(&self, prefix: &ObjectPath) -> Result<Vec<ObjectPath>> {
        let objects: Vec<_> = self.store.list(Some(prefix)).try_collect().await?;
        Ok(objects.into_iter().map(|meta| meta.location).collect())
    }

    /// Deletes everything below `prefix`. Returns the number of removed objects.
    pub async fn delete_prefix(&self, prefix: &ObjectPath) -> Result<usize> {
        let objects = self.list(prefix).await?;
        for location in &objects {
            match self.store.delete(location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(objects.len())
    }

    /// Fresh query session with the warehouse store registered. Sessions are
    /// cheap and never shared between queries.
    pub fn session(&self) -> Result<SessionContext> {
        let runtime = RuntimeEnvBuilder::new()
            .with_memory_limit(self.memory_limit, 0.8)
            .build()
            .map_err(|e| EngineError::ConfigError {
                message: format!("Failed to build DataFusion runtime environment: {}", e),
            })?;

        let ctx = SessionContext::new_with_config_rt(SessionConfig::new(), runtime.into());
        ctx.register_object_store(self.store_url.as_ref(), self.store.clone());
        Ok(ctx)
    }
}
