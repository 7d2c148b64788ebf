//! Database module - Postgres/TimescaleDB storage

pub mod postgres;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{DeviceAttribute, TelemetrySample};

pub use self::postgres::PostgresDb;

/// Destination for telemetry rows
#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Create tables if missing; safe to call repeatedly
    async fn ensure_tables(&self, hypertables: bool) -> Result<()>;

    /// Insert numeric samples, returning how many rows were stored
    async fn write_samples(&self, samples: &[TelemetrySample]) -> Result<usize>;

    /// Insert text attributes, returning how many rows were stored
    async fn write_attributes(&self, attributes: &[DeviceAttribute]) -> Result<usize>;
}
