pub mod artifacts;
pub mod postgres_store;
pub mod sqlite_store;
pub mod store;

use std::sync::Arc;

use anyhow::Result;

pub use artifacts::{format_timestamp, sanitize_name, ArtifactLayout};
pub use postgres_store::PostgresStore;
pub use sqlite_store::SqliteStore;
pub use store::CatalogStore;

/// Opens Postgres when a database URL is configured, otherwise the SQLite
/// catalog under the data root.
pub async fn open_catalog(
    layout: &ArtifactLayout,
    database_url: Option<&str>,
) -> Result<Arc<dyn CatalogStore>> {
    match database_url {
        Some(url) if !url.trim().is_empty() => {
            tracing::info!("using postgres catalog");
            Ok(Arc::new(PostgresStore::new(url).await?))
        }
        _ => {
            let path = layout.catalog_db_path();
            tracing::info!(path = %path.display(), "using sqlite catalog");
            Ok(Arc::new(SqliteStore::new(path)?))
        }
    }
}
