//! Connection setup for the two stores: Postgres for durable rows,
//! Redis for the product cache and the job queue.

use std::time::Duration;

use redis::{
    aio::{ConnectionManager, ConnectionManagerConfig},
    Client,
};
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::error::AppError;

const SCHEMA: &str = include_str!("schema.sql");

pub async fn init_redis(redis_url: &str) -> Result<ConnectionManager, AppError> {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(100));

    let client = Client::open(redis_url)?;
    let connection_manager = client.get_connection_manager_with_config(config).await?;

    Ok(connection_manager)
}

pub async fn init_postgres(database_url: &str) -> Result<PgPool, AppError> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    apply_schema(&pool).await?;

    Ok(pool)
}

async fn apply_schema(pool: &PgPool) -> Result<(), AppError> {
    for statement in schema_statements(SCHEMA) {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}
