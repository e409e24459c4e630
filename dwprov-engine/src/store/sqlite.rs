use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

use super::InstanceStore;
use crate::error::Result;
use crate::types::{ResourceId, ResourceSpec, TrackedInstance};

/// SQLite-backed store for tracked instances
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: &str) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tracked_instances (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                parent_identifier TEXT NOT NULL,
                attributes TEXT NOT NULL,
                generation INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn row_to_instance(r: &SqliteRow) -> Result<TrackedInstance> {
    let id = ResourceId::try_from(r.get::<String, _>("id"))?;
    let name: String = r.get("name");
    let attributes = serde_json::from_str(r.get::<&str, _>("attributes"))?;

    Ok(TrackedInstance {
        id,
        name: name.clone(),
        spec: ResourceSpec {
            name,
            parent_identifier: r.get("parent_identifier"),
            attributes,
        },
        generation: r.get::<i64, _>("generation") as u64,
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

#[async_trait]
impl InstanceStore for SqliteStore {
    async fn get(&self, id: &ResourceId) -> Result<Option<TrackedInstance>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, parent_identifier, attributes, generation, created_at, updated_at
            FROM tracked_instances WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_instance).transpose()
    }

    async fn list(&self) -> Result<Vec<TrackedInstance>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, parent_identifier, attributes, generation, created_at, updated_at
            FROM tracked_instances ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_instance).collect()
    }

    async fn put(&self, instance: &TrackedInstance) -> Result<()> {
        let attributes = serde_json::to_string(&instance.spec.attributes)?;

        sqlx::query(
            r#"
            INSERT INTO tracked_instances (id, name, parent_identifier, attributes, generation, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                parent_identifier = excluded.parent_identifier,
                attributes = excluded.attributes,
                generation = excluded.generation,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(instance.id.to_string())
        .bind(&instance.name)
        .bind(&instance.spec.parent_identifier)
        .bind(&attributes)
        .bind(instance.generation as i64)
        .bind(&instance.created_at)
        .bind(&instance.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove(&self, id: &ResourceId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tracked_instances WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
