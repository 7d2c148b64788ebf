//! Postgres database module

mod samples;
mod schema;

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

use crate::db::SampleStore;
use crate::error::{MonitorError, Result};
use crate::models::{DeviceAttribute, TelemetrySample};

/// Postgres database wrapper
#[derive(Clone)]
pub struct PostgresDb {
    pool: PgPool,
}

impl PostgresDb {
    /// Connect to Postgres
    pub async fn connect(url: &str) -> Result<Self> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|e| MonitorError::Config(format!("invalid database URL: {}", e)))?;

        tracing::info!("Connecting to Postgres...");

        // One writer; a second connection lets a broken one be replaced
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        tracing::info!("Postgres connected successfully");

        Ok(Self { pool })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl SampleStore for PostgresDb {
    async fn ensure_tables(&self, hypertables: bool) -> Result<()> {
        self.create_tables(hypertables).await
    }

    async fn write_samples(&self, samples: &[TelemetrySample]) -> Result<usize> {
        self.insert_samples(samples).await
    }

    async fn write_attributes(&self, attributes: &[DeviceAttribute]) -> Result<usize> {
        self.insert_attributes(attributes).await
    }
}
