use async_trait::async_trait;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::{
    pooled_connection::{
        deadpool::{Object, Pool},
        AsyncDieselConnectionManager,
    },
    AsyncConnection, AsyncPgConnection, RunQueryDsl,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::info;
use uuid::Uuid;

use crate::access::Viewer;
use crate::catalog::Dataset;
use crate::error::{EngineError, Result};
use crate::models::*;
use crate::schema::*;
use crate::store::DatasetStore;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Clone)]
pub struct PgDatasetStore {
    pool: Pool<AsyncPgConnection>,
}

impl PgDatasetStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder(config)
            .build()
            .map_err(|e| EngineError::ConfigError {
                message: format!("Failed to create database pool: {}", e),
            })?;

        let store = Self { pool };
        store.run_migrations(database_url).await?;

        Ok(store)
    }

    pub async fn run_migrations(&self, database_url: &str) -> Result<()> {
        use diesel::Connection;
        use diesel::PgConnection;

        // diesel_migrations has no async harness, so migrations run on a
        // blocking connection off the runtime threads.
        let database_url = database_url.to_string();
        tokio::task::spawn_blocking(move || {
            let mut connection = PgConnection::establish(&database_url).map_err(|e| {
                EngineError::ConfigError {
                    message: format!("Failed to establish connection for migrations: {}", e),
                }
            })?;

            connection
                .run_pending_migrations(MIGRATIONS)
                .map_err(|e| EngineError::ConfigError {
                    message: format!("Failed to run migrations: {}", e),
                })?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::InternalError {
            message: format!("Migration task failed: {}", e),
        })?
    }

    async fn connection(&self) -> Result<Object<AsyncPgConnection>> {
        self.pool.get().await.map_err(|e| EngineError::Database {
            message: format!("Failed to get database connection: {}", e),
        })
    }
}

fn rows_into_datasets(rows: Vec<DatasetRow>) -> Result<Vec<Dataset>> {
    rows.into_iter().map(Dataset::try_from).collect()
}

#[async_trait]
impl DatasetStore for PgDatasetStore {
    async fn insert(&self, dataset: &Dataset) -> Result<()> {
        info!("Adding dataset {} to catalog", dataset.name);
        let mut conn = self.connection().await?;
        let row = NewDatasetRow::from_dataset(dataset)?;

        match diesel::insert_into(datasets::table)
            .values(&row)
            .execute(&mut conn)
            .await
        {
            Ok(_) => Ok(()),
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                Err(EngineError::Conflict {
                    name: dataset.name.clone(),
                })
            }
            Err(e) => Err(EngineError::Database {
                message: format!("Failed to insert dataset: {}", e),
            }),
        }
    }

    async fn save(&self, dataset: &Dataset) -> Result<()> {
        let mut conn = self.connection().await?;
        let changes = DatasetChanges::from_dataset(dataset)?;

        let updated = diesel::update(datasets::table.find(&dataset.id))
            .set(&changes)
            .execute(&mut conn)
            .await
            .map_err(|e| EngineError::Database {
                message: format!("Failed to update dataset: {}", e),
            })?;

        if updated == 0 {
            return Err(EngineError::DatasetNotFound {
                name: dataset.name.clone(),
            });
        }
        Ok(())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Dataset>> {
        let mut conn = self.connection().await?;

        let row = datasets::table
            .filter(datasets::name.eq(name))
            .select(DatasetRow::as_select())
            .get_result::<DatasetRow>(&mut conn)
            .await
            .optional()
            .map_err(|e| EngineError::Database {
                message: format!("Failed to fetch dataset: {}", e),
            })?;

        row.map(Dataset::try_from).transpose()
    }

    async fn list_visible(&self, viewer: &Viewer) -> Result<Vec<Dataset>> {
        let mut conn = self.connection().await?;

        let mut query = datasets::table.select(DatasetRow::as_select()).into_boxed();
        if !viewer.is_admin() {
            query = match viewer.account_id() {
                Some(account) => {
                    let managed = dataset_managers::table
                        .filter(dataset_managers::account_id.eq(account))
                        .select(dataset_managers::dataset_id);
                    query.filter(
                        datasets::private
                            .eq(false)
                            .or(datasets::id.eq_any(managed)),
                    )
                }
                None => query.filter(datasets::private.eq(false)),
            };
        }

        let rows = query
            .load::<DatasetRow>(&mut conn)
            .await
            .map_err(|e| EngineError::Database {
                message: format!("Failed to fetch datasets: {}", e),
            })?;

        rows_into_datasets(rows)
    }

    async fn delete(&self, dataset_id: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let dataset_id = dataset_id.to_string();

        conn.transaction::<_, EngineError, _>(|conn| {
            Box::pin(async move {
                diesel::delete(
                    dataset_managers::table.filter(dataset_managers::dataset_id.eq(&dataset_id)),
                )
                .execute(conn)
                .await?;

                let deleted = diesel::delete(datasets::table.find(&dataset_id))
                    .execute(conn)
                    .await?;

                Ok(deleted > 0)
            })
        })
        .await
    }

    async fn add_manager(&self, dataset_id: &str, account_id: Uuid) -> Result<()> {
        let mut conn = self.connection().await?;
        let row = ManagerRow {
            dataset_id: dataset_id.to_string(),
            account_id,
        };

        match diesel::insert_into(dataset_managers::table)
            .values(&row)
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await
        {
            Ok(_) => Ok(()),
            Err(DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, _)) => {
                Err(EngineError::DatasetNotFound {
                    name: dataset_id.to_string(),
                })
            }
            Err(e) => Err(EngineError::Database {
                message: format!("Failed to add manager: {}", e),
            }),
        }
    }

    async fn remove_manager(&self, dataset_id: &str, account_id: Uuid) -> Result<bool> {
        let mut conn = self.connection().await?;

        let removed = diesel::delete(
            dataset_managers::table
                .filter(dataset_managers::dataset_id.eq(dataset_id))
                .filter(dataset_managers::account_id.eq(account_id)),
        )
        .execute(&mut conn)
        .await?;

        Ok(removed > 0)
    }

    async fn managers(&self, dataset_id: &str) -> Result<Vec<Uuid>> {
        let mut conn = self.connection().await?;

        let accounts = dataset_managers::table
            .filter(dataset_managers::dataset_id.eq(dataset_id))
            .select(dataset_managers::account_id)
            .order(dataset_managers::account_id.asc())
            .load::<Uuid>(&mut conn)
            .await?;

        Ok(accounts)
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.connection().await?;

        conn.transaction::<_, EngineError, _>(|conn| {
            Box::pin(async move {
                diesel::delete(dataset_managers::table).execute(conn).await?;
                diesel::delete(datasets::table).execute(conn).await?;
                Ok(())
            })
        })
        .await
    }
}
