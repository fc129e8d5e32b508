use db::{DbConfig, DbError, SurrealStore};

/// A store over its own empty in-memory database.
pub async fn store() -> Result<SurrealStore, DbError> {
    SurrealStore::connect(DbConfig::memory()).await
}
