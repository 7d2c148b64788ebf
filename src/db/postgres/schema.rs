//! Table creation (auto-migration on startup)

use super::PostgresDb;
use crate::error::Result;

pub const SAMPLES_TABLE: &str = "teltonika_samples";
pub const ATTRIBUTES_TABLE: &str = "teltonika_attributes";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS teltonika_samples (
        time TIMESTAMPTZ NOT NULL,
        host TEXT NOT NULL,
        metric TEXT NOT NULL,
        value DOUBLE PRECISION NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_teltonika_samples_host_metric_time
        ON teltonika_samples (host, metric, time DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS teltonika_attributes (
        time TIMESTAMPTZ NOT NULL,
        host TEXT NOT NULL,
        name TEXT NOT NULL,
        value TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_teltonika_attributes_host_name_time
        ON teltonika_attributes (host, name, time DESC)
    "#,
];

impl PostgresDb {
    /// Ensure tables exist, optionally as TimescaleDB hypertables
    pub async fn create_tables(&self, hypertables: bool) -> Result<()> {
        for sql in SCHEMA {
            tracing::debug!("Executing: {}", sql.trim());
            sqlx::query(sql).execute(self.pool()).await?;
        }

        if hypertables {
            for table in [SAMPLES_TABLE, ATTRIBUTES_TABLE] {
                self.create_hypertable(table).await?;
            }
        }

        Ok(())
    }

    async fn create_hypertable(&self, table: &str) -> Result<()> {
        let sql = "SELECT create_hypertable($1::regclass, 'time', if_not_exists => TRUE)";
        tracing::debug!("Executing: {} [{}]", sql, table);

        match sqlx::query(sql).bind(table).execute(self.pool()).await {
            Ok(_) => Ok(()),
            Err(e) if is_already_hypertable(&e) => {
                tracing::debug!("Table {} is already a hypertable", table);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn is_already_hypertable(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.message().contains("already a hypertable"))
        .unwrap_or(false)
}
