//! PostgreSQL resource store.
//!
//! Rows are stored as JSONB documents next to the columns queries filter on.
//! The latest-version rule is a deferred exclusion constraint, so a lost race
//! surfaces at commit time as SQLSTATE `23P01`.
//!
//! ## Configuration
//!
//! [`PostgresConfig::from_env`] reads `DATABASE_URL` plus the pool knobs
//! `DB_MAX_CONNECTIONS`, `DB_MIN_CONNECTIONS`, `DB_CONNECT_TIMEOUT_SECS`,
//! `DB_IDLE_TIMEOUT_SECS` and `DB_MAX_LIFETIME_SECS`.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row};
use uuid::Uuid;

use crate::config::env_parse;
use crate::types::{
    Concept, Container, ContainerId, Direction, Mapping, Resource, ResourceId, ResourceKind,
};
use super::{GraphStore, ResourceStore, StoreFailure, StoreTransaction};

/// Schema statements, applied in order by [`PostgresStore::migrate`].
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS terminology_containers (
        id UUID PRIMARY KEY,
        versioned_object_id UUID NOT NULL,
        data JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS terminology_resources (
        id UUID PRIMARY KEY,
        versioned_object_id UUID NOT NULL,
        kind TEXT NOT NULL,
        mnemonic TEXT NOT NULL,
        parent_id UUID NOT NULL,
        is_latest_version BOOLEAN NOT NULL DEFAULT FALSE,
        from_concept_id UUID,
        to_concept_id UUID,
        created_at TIMESTAMPTZ NOT NULL,
        data JSONB NOT NULL,
        CONSTRAINT terminology_one_latest_version
            EXCLUDE USING btree (versioned_object_id WITH =) WHERE (is_latest_version)
            DEFERRABLE INITIALLY DEFERRED
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS terminology_resources_parent_idx
        ON terminology_resources (parent_id, kind, mnemonic)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS terminology_members (
        container_id UUID NOT NULL,
        resource_id UUID NOT NULL REFERENCES terminology_resources (id) ON DELETE CASCADE,
        PRIMARY KEY (container_id, resource_id)
    )
    "#,
];

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Connection string.
    pub database_url: String,
    /// Pool ceiling (default: 10).
    pub max_connections: u32,
    /// Connections kept open while idle (default: 2).
    pub min_connections: u32,
    /// Seconds to wait for a free connection (default: 10).
    pub connect_timeout_secs: u64,
    /// Seconds before an idle connection is closed (default: 300).
    pub idle_timeout_secs: u64,
    /// Seconds before any connection is recycled (default: 1800).
    pub max_lifetime_secs: u64,
}

impl PostgresConfig {
    /// Read the `DATABASE_URL` and `DB_*` variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            database_url: env_parse("DATABASE_URL")
                .unwrap_or_else(|| "postgresql://localhost/terminology".to_string()),
            max_connections: env_parse("DB_MAX_CONNECTIONS").unwrap_or(10),
            min_connections: env_parse("DB_MIN_CONNECTIONS").unwrap_or(2),
            connect_timeout_secs: env_parse("DB_CONNECT_TIMEOUT_SECS").unwrap_or(10),
            idle_timeout_secs: env_parse("DB_IDLE_TIMEOUT_SECS").unwrap_or(300),
            max_lifetime_secs: env_parse("DB_MAX_LIFETIME_SECS").unwrap_or(1800),
        }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Error type for PostgreSQL store.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Container not found.
    #[error("Container not found: {0}")]
    ContainerNotFound(ContainerId),
}

impl StoreFailure for PostgresError {
    fn is_integrity_violation(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db)) => {
                matches!(db.code().as_deref(), Some("23505") | Some("23P01"))
            }
            _ => false,
        }
    }
}

/// Extra row filter appended to a container-scoped query as `$3`.
enum Filter {
    None,
    VersionedObject(Uuid),
    Mnemonic(String),
    Origin(Direction, Uuid),
    ChildOf(String),
    AnyOf(Vec<Uuid>),
}

impl Filter {
    fn clause(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::VersionedObject(_) => "AND r.versioned_object_id = $3",
            Self::Mnemonic(_) => "AND r.mnemonic = $3",
            Self::Origin(Direction::Forward, _) => "AND r.from_concept_id = $3",
            Self::Origin(Direction::Reverse, _) => "AND r.to_concept_id = $3",
            Self::ChildOf(_) => "AND jsonb_exists(r.data->'parent_concepts', $3)",
            Self::AnyOf(_) => "AND r.versioned_object_id = ANY($3)",
        }
    }
}

fn kind_of(resource: &Resource) -> &'static str {
    resource.kind().as_str()
}

fn endpoint(resource: &Resource, direction: Direction) -> Option<Uuid> {
    resource
        .as_mapping()
        .and_then(|m| m.origin(direction).concept)
        .map(|id| id.as_uuid())
}

fn parse_resource(row: &PgRow) -> Result<Resource, sqlx::Error> {
    let Json(resource): Json<Resource> = row.try_get("data")?;
    Ok(resource)
}

/// PostgreSQL resource store.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Open a pool for the given settings.
    pub async fn new(config: PostgresConfig) -> Result<Self, sqlx::Error> {
        tracing::info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Opening terminology store pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .test_before_acquire(true)
            .connect(&config.database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Open a pool configured from the environment.
    pub async fn from_env() -> Result<Self, sqlx::Error> {
        Self::new(PostgresConfig::from_env()).await
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and constraints if missing.
    pub async fn migrate(&self) -> Result<(), PostgresError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Insert or replace a container row.
    pub async fn save_container(&self, container: &Container) -> Result<(), PostgresError> {
        sqlx::query(
            r#"
            INSERT INTO terminology_containers (id, versioned_object_id, data)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(container.id.as_uuid())
        .bind(container.versioned_object_id.as_uuid())
        .bind(Json(container))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn scoped(
        &self,
        container: &ContainerId,
        kind: ResourceKind,
        filter: Filter,
    ) -> Result<Vec<Resource>, PostgresError> {
        let row = self
            .get_container(container)
            .await?
            .ok_or(PostgresError::ContainerNotFound(*container))?;
        let scope = if row.is_head() && row.is_source() {
            "r.parent_id = $1 AND r.id = r.versioned_object_id"
        } else {
            "r.id IN (SELECT resource_id FROM terminology_members WHERE container_id = $1)"
        };
        let sql = format!(
            "SELECT r.data FROM terminology_resources r WHERE {scope} AND r.kind = $2 {} ORDER BY r.mnemonic, r.id",
            filter.clause()
        );
        let query = sqlx::query(&sql).bind(container.as_uuid()).bind(kind.as_str());
        let query = match filter {
            Filter::None => query,
            Filter::VersionedObject(id) | Filter::Origin(_, id) => query.bind(id),
            Filter::Mnemonic(s) | Filter::ChildOf(s) => query.bind(s),
            Filter::AnyOf(ids) => query.bind(ids),
        };
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(parse_resource)
            .collect::<Result<Vec<_>, _>>()
            .map_err(PostgresError::from)
    }

    async fn scoped_concepts(&self, container: &ContainerId, filter: Filter) -> Result<Vec<Concept>, PostgresError> {
        Ok(self
            .scoped(container, ResourceKind::Concept, filter)
            .await?
            .into_iter()
            .filter_map(|r| match r {
                Resource::Concept(c) => Some(c),
                Resource::Mapping(_) => None,
            })
            .collect())
    }

    async fn scoped_mappings(&self, container: &ContainerId, filter: Filter) -> Result<Vec<Mapping>, PostgresError> {
        Ok(self
            .scoped(container, ResourceKind::Mapping, filter)
            .await?
            .into_iter()
            .filter_map(|r| match r {
                Resource::Mapping(m) => Some(m),
                Resource::Concept(_) => None,
            })
            .collect())
    }
}

#[async_trait]
impl GraphStore for PostgresStore {
    type Error = PostgresError;

    async fn get_container(&self, id: &ContainerId) -> Result<Option<Container>, Self::Error> {
        let row = sqlx::query("SELECT data FROM terminology_containers WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(ref r) => {
                let Json(container): Json<Container> = r.try_get("data")?;
                Ok(Some(container))
            }
            None => Ok(None),
        }
    }

    async fn get_resource(&self, id: &ResourceId) -> Result<Option<Resource>, Self::Error> {
        let row = sqlx::query("SELECT data FROM terminology_resources WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(ref r) => Ok(Some(parse_resource(r)?)),
            None => Ok(None),
        }
    }

    async fn versions_of(&self, versioned_object_id: &ResourceId) -> Result<Vec<Resource>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM terminology_resources
            WHERE versioned_object_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(versioned_object_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(parse_resource)
            .collect::<Result<Vec<_>, _>>()
            .map_err(PostgresError::from)
    }

    async fn container_concepts(&self, container: &ContainerId) -> Result<Vec<Concept>, Self::Error> {
        self.scoped_concepts(container, Filter::None).await
    }

    async fn container_mappings(&self, container: &ContainerId) -> Result<Vec<Mapping>, Self::Error> {
        self.scoped_mappings(container, Filter::None).await
    }

    async fn resolve_concept(
        &self,
        container: &ContainerId,
        versioned_object_id: &ResourceId,
    ) -> Result<Option<Concept>, Self::Error> {
        let mut found = self
            .scoped_concepts(container, Filter::VersionedObject(versioned_object_id.as_uuid()))
            .await?;
        found.sort_by(|a, b| b.info.updated_at.cmp(&a.info.updated_at));
        Ok(found.into_iter().next())
    }

    async fn resolve_concept_by_mnemonic(
        &self,
        container: &ContainerId,
        mnemonic: &str,
    ) -> Result<Option<Concept>, Self::Error> {
        let mut found = self.scoped_concepts(container, Filter::Mnemonic(mnemonic.to_string())).await?;
        found.sort_by(|a, b| b.info.updated_at.cmp(&a.info.updated_at));
        Ok(found.into_iter().next())
    }

    async fn resolve_mapping_by_mnemonic(
        &self,
        container: &ContainerId,
        mnemonic: &str,
    ) -> Result<Option<Mapping>, Self::Error> {
        let found = self.scoped_mappings(container, Filter::Mnemonic(mnemonic.to_string())).await?;
        Ok(found.into_iter().next())
    }

    async fn mappings_for(
        &self,
        container: &ContainerId,
        concept: &ResourceId,
        direction: Direction,
    ) -> Result<Vec<Mapping>, Self::Error> {
        self.scoped_mappings(container, Filter::Origin(direction, concept.as_uuid())).await
    }

    async fn hierarchy_neighbors(
        &self,
        container: &ContainerId,
        concept: &Concept,
        direction: Direction,
    ) -> Result<Vec<Concept>, Self::Error> {
        let filter = match direction {
            Direction::Forward => Filter::ChildOf(concept.versioned_object_id().to_string()),
            Direction::Reverse => {
                if concept.parent_concepts.is_empty() {
                    return Ok(Vec::new());
                }
                Filter::AnyOf(concept.parent_concepts.iter().map(|id| id.as_uuid()).collect())
            }
        };
        self.scoped_concepts(container, filter).await
    }
}

#[async_trait]
impl ResourceStore for PostgresStore {
    type Transaction = PostgresTransaction;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error> {
        Ok(PostgresTransaction { tx: self.pool.begin().await? })
    }
}

/// Transaction over a [`PostgresStore`].
pub struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    type Error = PostgresError;

    async fn lock_versioned_object(&mut self, versioned_object_id: &ResourceId) -> Result<(), Self::Error> {
        // Advisory lock: the group may not have a HEAD row yet.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(versioned_object_id.to_string())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn lock_mnemonic(
        &mut self,
        container: &ContainerId,
        kind: ResourceKind,
        mnemonic: &str,
    ) -> Result<(), Self::Error> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("{kind}:{container}:{mnemonic}"))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn get(&mut self, id: &ResourceId) -> Result<Option<Resource>, Self::Error> {
        let row = sqlx::query("SELECT data FROM terminology_resources WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await?;
        match row {
            Some(ref r) => Ok(Some(parse_resource(r)?)),
            None => Ok(None),
        }
    }

    async fn latest_version(
        &mut self,
        versioned_object_id: &ResourceId,
        exclude: Option<&ResourceId>,
    ) -> Result<Option<Resource>, Self::Error> {
        let row = sqlx::query(
            r#"
            SELECT data FROM terminology_resources
            WHERE versioned_object_id = $1 AND is_latest_version
              AND ($2::uuid IS NULL OR id <> $2)
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(versioned_object_id.as_uuid())
        .bind(exclude.map(|id| id.as_uuid()))
        .fetch_optional(&mut *self.tx)
        .await?;
        match row {
            Some(ref r) => Ok(Some(parse_resource(r)?)),
            None => Ok(None),
        }
    }

    async fn insert(&mut self, resource: &Resource) -> Result<(), Self::Error> {
        let info = resource.info();
        sqlx::query(
            r#"
            INSERT INTO terminology_resources
                (id, versioned_object_id, kind, mnemonic, parent_id, is_latest_version,
                 from_concept_id, to_concept_id, created_at, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(info.id.as_uuid())
        .bind(info.versioned_object_id.as_uuid())
        .bind(kind_of(resource))
        .bind(resource.mnemonic())
        .bind(info.parent.as_uuid())
        .bind(info.is_latest_version)
        .bind(endpoint(resource, Direction::Forward))
        .bind(endpoint(resource, Direction::Reverse))
        .bind(info.created_at)
        .bind(Json(resource))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update(&mut self, resource: &Resource) -> Result<(), Self::Error> {
        let info = resource.info();
        let result = sqlx::query(
            r#"
            UPDATE terminology_resources
            SET mnemonic = $2, is_latest_version = $3, from_concept_id = $4,
                to_concept_id = $5, data = $6
            WHERE id = $1
            "#,
        )
        .bind(info.id.as_uuid())
        .bind(resource.mnemonic())
        .bind(info.is_latest_version)
        .bind(endpoint(resource, Direction::Forward))
        .bind(endpoint(resource, Direction::Reverse))
        .bind(Json(resource))
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(PostgresError::Database(sqlx::Error::RowNotFound));
        }
        Ok(())
    }

    async fn delete(&mut self, id: &ResourceId) -> Result<(), Self::Error> {
        sqlx::query("DELETE FROM terminology_resources WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn add_member(&mut self, container: &ContainerId, id: &ResourceId) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT INTO terminology_members (container_id, resource_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(container.as_uuid())
        .bind(id.as_uuid())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn remove_member(&mut self, container: &ContainerId, id: &ResourceId) -> Result<(), Self::Error> {
        sqlx::query("DELETE FROM terminology_members WHERE container_id = $1 AND resource_id = $2")
            .bind(container.as_uuid())
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self) -> Result<(), Self::Error> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), Self::Error> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_clauses_bind_third_parameter() {
        assert_eq!(Filter::None.clause(), "");
        assert!(Filter::Mnemonic("C1".into()).clause().contains("$3"));
        assert!(Filter::Origin(Direction::Reverse, Uuid::nil()).clause().contains("to_concept_id"));
    }

    #[test]
    fn test_schema_defers_latest_constraint() {
        let resources = SCHEMA[1];
        assert!(resources.contains("EXCLUDE USING btree"));
        assert!(resources.contains("DEFERRABLE INITIALLY DEFERRED"));
    }
}
