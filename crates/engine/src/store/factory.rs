use std::sync::Arc;

use crate::store::{DatabaseConfig, DatabaseType, MemoryStore, PostgresStore, SqliteStore, Store};

pub async fn create_store(config: &DatabaseConfig) -> crate::Result<Arc<dyn Store>> {
    config.validate().map_err(crate::Error::Config)?;

    match config.db_type {
        DatabaseType::Sqlite => {
            let path = config
                .sqlite_path
                .as_ref()
                .ok_or_else(|| crate::Error::Config("SQLite path not configured".into()))?;
            if path.as_os_str() != ":memory:" {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let path = path
                .to_str()
                .ok_or_else(|| crate::Error::Config(format!("SQLite path is not valid UTF-8: {:?}", path)))?;
            Ok(Arc::new(SqliteStore::new(path, config.max_connections).await?))
        }
        DatabaseType::Postgres => {
            let connection_string = config.connection_string.as_ref().ok_or_else(|| {
                crate::Error::Config("PostgreSQL connection string not configured".into())
            })?;
            Ok(Arc::new(PostgresStore::new(connection_string, config.max_connections).await?))
        }
        DatabaseType::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}

/// Builds a store from a bare URL, as used for per-tenant databases.
pub async fn create_store_for_url(url: &str, max_connections: u32) -> crate::Result<Arc<dyn Store>> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        Ok(Arc::new(PostgresStore::new(url, max_connections).await?))
    } else if url == "memory" {
        Ok(Arc::new(MemoryStore::new()))
    } else {
        Ok(Arc::new(SqliteStore::new(url, max_connections).await?))
    }
}
