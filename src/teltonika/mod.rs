//! Teltonika router SSH integration module
//!
//! - `client`: SSH session handling and host key pinning
//! - `gsmctl`: modem value query and parsing
//! - `sync`: periodic ingestion loop

pub mod client;
pub mod gsmctl;
pub mod sync;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::RouterReading;

pub use client::{SshSession, SshTarget};
pub use sync::TeltonikaSyncer;

/// Source of router readings, one session at a time
#[async_trait]
pub trait RouterSource: Send + Sync {
    type Session: Send;

    /// Open an authenticated session
    async fn connect(&self) -> Result<Self::Session>;

    /// Read the current values over an open session
    async fn read_values(&self, session: &mut Self::Session) -> Result<RouterReading>;

    /// Whether the session can still be used for the next cycle
    fn is_alive(&self, session: &Self::Session) -> bool;

    /// Release the session
    async fn disconnect(&self, session: Self::Session);

    /// Host name recorded on every row
    fn host(&self) -> &str;
}

/// gsmctl over SSH
pub struct TeltonikaRouter {
    target: SshTarget,
}

impl TeltonikaRouter {
    pub fn new(target: SshTarget) -> Self {
        Self { target }
    }
}

#[async_trait]
impl RouterSource for TeltonikaRouter {
    type Session = SshSession;

    async fn connect(&self) -> Result<SshSession> {
        SshSession::connect(&self.target).await
    }

    async fn read_values(&self, session: &mut SshSession) -> Result<RouterReading> {
        let stdout = session.exec(&gsmctl::command()).await?;
        gsmctl::parse_output(&stdout)
    }

    fn is_alive(&self, session: &SshSession) -> bool {
        session.state() == client::ConnectionState::Connected
    }

    async fn disconnect(&self, session: SshSession) {
        session.close().await;
    }

    fn host(&self) -> &str {
        &self.target.host
    }
}
