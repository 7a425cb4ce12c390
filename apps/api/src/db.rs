use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Creates the PostgreSQL pool backing the prior candidate store.
/// Sized so every concurrent batch run can record its result without queueing.
pub async fn create_pool(database_url: &str, batch_concurrency: usize) -> Result<PgPool> {
    let max_connections = u32::try_from(batch_concurrency).unwrap_or(u32::MAX).max(2);
    info!("Connecting to PostgreSQL (max {max_connections} connections)...");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    info!("PostgreSQL connection pool established");
    Ok(pool)
}
