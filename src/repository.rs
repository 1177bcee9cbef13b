//! `ClientRepository` boundary — spec.md §1's "persistent client repository
//! (a simple CRUD-over-SQL layer)", out of scope for the core but specified
//! at its boundary.
//!
//! Grounded on original_source's `internal/repository/` (`Client` interface
//! + `ClientRepo` Postgres implementation over `RateLimitClient`). Not wired
//! into the hot path — `RateLimiter` is the single source of truth for live
//! policy, exactly as `NewService` in the original never calls the
//! repository either. An operator who wants rate-limit policy to survive a
//! restart reads it back through this trait at startup and replays it via
//! `RateLimiter::upsert_client`.

use async_trait::async_trait;
use dashmap::DashMap;

/// Row shape shared with the admin API — original_source's `RateLimitClient`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRecord {
    pub id: String,
    pub capacity: u32,
    pub refill_rate: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("client `{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[async_trait]
pub trait ClientRepository: Send + Sync {
    async fn create(&self, record: ClientRecord) -> Result<(), RepositoryError>;
    async fn get(&self, id: &str) -> Result<ClientRecord, RepositoryError>;
    async fn update(&self, record: ClientRecord) -> Result<(), RepositoryError>;
    async fn delete(&self, id: &str) -> Result<(), RepositoryError>;
    async fn list(&self) -> Result<Vec<ClientRecord>, RepositoryError>;
}

/// Default implementation: an in-memory map, same shape the admin API's
/// `RateLimiter` already mutates. Useful for tests and for deployments that
/// don't need policy to survive a restart (spec.md's default — persistence
/// across restarts is an explicit non-goal of the core).
#[derive(Default)]
pub struct InMemoryClientRepository {
    rows: DashMap<String, ClientRecord>,
}

impl InMemoryClientRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClientRepository for InMemoryClientRepository {
    async fn create(&self, record: ClientRecord) -> Result<(), RepositoryError> {
        self.rows.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<ClientRecord, RepositoryError> {
        self.rows.get(id).map(|r| r.clone()).ok_or_else(|| RepositoryError::NotFound(id.to_string()))
    }

    async fn update(&self, record: ClientRecord) -> Result<(), RepositoryError> {
        if !self.rows.contains_key(&record.id) {
            return Err(RepositoryError::NotFound(record.id));
        }
        self.rows.insert(record.id.clone(), record);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), RepositoryError> {
        self.rows.remove(id).map(|_| ()).ok_or_else(|| RepositoryError::NotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<ClientRecord>, RepositoryError> {
        Ok(self.rows.iter().map(|e| e.value().clone()).collect())
    }
}

/// Postgres-backed implementation, gated behind the `postgres` feature.
/// Mirrors original_source's `ClientRepo` table (`rate_limit_clients`).
#[cfg(feature = "postgres")]
pub mod postgres {
    use super::{ClientRecord, ClientRepository, RepositoryError};
    use async_trait::async_trait;
    use sqlx::PgPool;

    pub struct PostgresClientRepository {
        pool: PgPool,
    }

    impl PostgresClientRepository {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl ClientRepository for PostgresClientRepository {
        async fn create(&self, record: ClientRecord) -> Result<(), RepositoryError> {
            sqlx::query("INSERT INTO rate_limit_clients (id, capacity, refill_rate) VALUES ($1, $2, $3)")
                .bind(&record.id)
                .bind(record.capacity as i32)
                .bind(record.refill_rate)
                .execute(&self.pool)
                .await
                .map_err(anyhow::Error::from)?;
            Ok(())
        }

        async fn get(&self, id: &str) -> Result<ClientRecord, RepositoryError> {
            let row: Option<(String, i32, f64)> =
                sqlx::query_as("SELECT id, capacity, refill_rate FROM rate_limit_clients WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(anyhow::Error::from)?;
            row.map(|(id, capacity, refill_rate)| ClientRecord { id, capacity: capacity as u32, refill_rate })
                .ok_or_else(|| RepositoryError::NotFound(id.to_string()))
        }

        async fn update(&self, record: ClientRecord) -> Result<(), RepositoryError> {
            let result = sqlx::query("UPDATE rate_limit_clients SET capacity = $1, refill_rate = $2 WHERE id = $3")
                .bind(record.capacity as i32)
                .bind(record.refill_rate)
                .bind(&record.id)
                .execute(&self.pool)
                .await
                .map_err(anyhow::Error::from)?;
            if result.rows_affected() == 0 {
                return Err(RepositoryError::NotFound(record.id));
            }
            Ok(())
        }

        async fn delete(&self, id: &str) -> Result<(), RepositoryError> {
            let result = sqlx::query("DELETE FROM rate_limit_clients WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(anyhow::Error::from)?;
            if result.rows_affected() == 0 {
                return Err(RepositoryError::NotFound(id.to_string()));
            }
            Ok(())
        }

        async fn list(&self) -> Result<Vec<ClientRecord>, RepositoryError> {
            let rows: Vec<(String, i32, f64)> =
                sqlx::query_as("SELECT id, capacity, refill_rate FROM rate_limit_clients")
                    .fetch_all(&self.pool)
                    .await
                    .map_err(anyhow::Error::from)?;
            Ok(rows.into_iter().map(|(id, capacity, refill_rate)| ClientRecord { id, capacity: capacity as u32, refill_rate }).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> ClientRecord {
        ClientRecord { id: id.to_string(), capacity: 10, refill_rate: 2.0 }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let repo = InMemoryClientRepository::new();
        repo.create(record("alice")).await.unwrap();
        let fetched = repo.get("alice").await.unwrap();
        assert_eq!(fetched, record("alice"));
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let repo = InMemoryClientRepository::new();
        assert!(matches!(repo.get("ghost").await, Err(RepositoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn update_unknown_is_not_found() {
        let repo = InMemoryClientRepository::new();
        assert!(matches!(repo.update(record("ghost")).await, Err(RepositoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let repo = InMemoryClientRepository::new();
        repo.create(record("bob")).await.unwrap();
        repo.delete("bob").await.unwrap();
        assert!(matches!(repo.get("bob").await, Err(RepositoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_returns_every_row() {
        let repo = InMemoryClientRepository::new();
        repo.create(record("a")).await.unwrap();
        repo.create(record("b")).await.unwrap();
        let mut ids: Vec<_> = repo.list().await.unwrap().into_iter().map(|r| r.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
