//! teltonika_samples / teltonika_attributes inserts
//!
//! Rows are inserted one at a time so a rejected row does not take the rest
//! of the cycle with it. Losing the connection stops the batch early.

use super::schema::{ATTRIBUTES_TABLE, SAMPLES_TABLE};
use super::PostgresDb;
use crate::error::{MonitorError, Result};
use crate::models::{DeviceAttribute, TelemetrySample};

impl PostgresDb {
    /// Insert samples, returning the number stored
    pub async fn insert_samples(&self, samples: &[TelemetrySample]) -> Result<usize> {
        let mut outcome = BatchOutcome::new(SAMPLES_TABLE, samples.len());

        for sample in samples {
            let result = sqlx::query(
                r#"
                INSERT INTO teltonika_samples (time, host, metric, value)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(sample.time)
            .bind(&sample.host)
            .bind(&sample.metric)
            .bind(sample.value)
            .execute(self.pool())
            .await;

            if !outcome.record(&sample.metric, result) {
                break;
            }
        }

        outcome.finish()
    }

    /// Insert attributes, returning the number stored
    pub async fn insert_attributes(&self, attributes: &[DeviceAttribute]) -> Result<usize> {
        let mut outcome = BatchOutcome::new(ATTRIBUTES_TABLE, attributes.len());

        for attribute in attributes {
            let result = sqlx::query(
                r#"
                INSERT INTO teltonika_attributes (time, host, name, value)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(attribute.time)
            .bind(&attribute.host)
            .bind(&attribute.name)
            .bind(&attribute.value)
            .execute(self.pool())
            .await;

            if !outcome.record(&attribute.name, result) {
                break;
            }
        }

        outcome.finish()
    }
}

/// Running tally for a batch of single-row inserts
struct BatchOutcome {
    table: &'static str,
    total: usize,
    inserted: usize,
    first_error: Option<String>,
}

impl BatchOutcome {
    fn new(table: &'static str, total: usize) -> Self {
        Self {
            table,
            total,
            inserted: 0,
            first_error: None,
        }
    }

    /// Returns false when the batch should stop
    fn record<T>(&mut self, key: &str, result: std::result::Result<T, sqlx::Error>) -> bool {
        match result {
            Ok(_) => {
                self.inserted += 1;
                true
            }
            Err(e) => {
                tracing::warn!("Failed to insert {} row {}: {}", self.table, key, e);
                let fatal_for_batch = is_connection_error(&e);
                self.first_error.get_or_insert_with(|| e.to_string());
                !fatal_for_batch
            }
        }
    }

    fn finish(self) -> Result<usize> {
        match self.first_error {
            None => Ok(self.inserted),
            Some(e) => Err(MonitorError::Storage(format!(
                "{} of {} rows written to {}: {}",
                self.inserted, self.total, self.table, e
            ))),
        }
    }
}

fn is_connection_error(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}
