//! Database schema wiring.

use sqlx::PgPool;
use tracing::info;

use crate::error::{PersistenceError, map_sqlx_error};

const SCHEMA: &str = include_str!("../migrations/0001_rollcall.sql");

/// Create every table and index this crate uses. Safe to run on every start.
pub async fn apply_schema(pool: &PgPool) -> Result<(), PersistenceError> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("apply_schema", e))?;

    info!("database schema applied");
    Ok(())
}
