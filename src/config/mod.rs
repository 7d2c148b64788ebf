//! Configuration module
//!
//! Settings are layered: optional `config/default.*` file, then
//! `TELTONIKA_MONITOR__<SECTION>__<KEY>` environment variables, then CLI flags.

use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;

use crate::error::MonitorError;
use crate::teltonika::client::{HostKey, SshTarget};

#[derive(Debug, Parser)]
#[command(name = "teltonika-monitor", version)]
#[command(about = "Read available data from a Teltonika router and insert into postgres")]
pub struct Cli {
    /// The host name or IP address of the router
    #[arg(long, short = 'H')]
    pub host: Option<String>,

    /// The ssh username for the host
    #[arg(long, short = 'U')]
    pub user: Option<String>,

    /// The ssh password for the host
    #[arg(long, short = 'P')]
    pub password: Option<String>,

    /// The ssh port of the router
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// The SSH host key (base64, as in known_hosts)
    #[arg(long = "host-key", short = 'K', env = "HOST_KEY", hide_env_values = true)]
    pub host_key: Option<String>,

    /// Postgres database URL
    #[arg(long)]
    pub database_url: Option<String>,

    /// Create tables as hypertables. Use only with TimescaleDB
    #[arg(long)]
    pub hypertables: bool,

    /// Polling interval in seconds
    #[arg(long, short = 'i')]
    pub interval: Option<u64>,

    /// Hide status output. Only errors will be shown
    #[arg(long, short = 'q', conflicts_with = "debug")]
    pub quiet: bool,

    /// Show debug logging
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// tracing filter for the verbosity flags; `None` leaves room for RUST_LOG
    pub fn log_directives(&self) -> Option<&'static str> {
        if self.debug {
            Some("teltonika_monitor=debug,info")
        } else if self.quiet {
            Some("error")
        } else {
            None
        }
    }
}

pub const DEFAULT_LOG_DIRECTIVES: &str = "teltonika_monitor=info,warn";

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub poll: PollConfig,
}

#[derive(Debug, Deserialize)]
pub struct RouterConfig {
    pub host: Option<String>,
    #[serde(default = "default_user")]
    pub user: String,
    pub password: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub host_key: Option<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            host: None,
            user: default_user(),
            password: None,
            port: default_ssh_port(),
            host_key: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default)]
    pub hypertables: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            hypertables: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
        }
    }
}

fn default_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_database_url() -> String {
    "postgres://postgres@localhost/postgres".to_string()
}

fn default_interval() -> u64 {
    60
}

/// Validated settings the monitor runs with
#[derive(Debug, Clone)]
pub struct Settings {
    pub target: SshTarget,
    pub database_url: String,
    pub hypertables: bool,
    pub interval: Duration,
}

impl Config {
    pub fn load(cli: &Cli) -> Result<Self, MonitorError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::Environment::with_prefix("TELTONIKA_MONITOR").separator("__"));

        let settings = Self::apply_cli(builder, cli)
            .and_then(|b| b.build())
            .map_err(|e| MonitorError::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| MonitorError::Config(e.to_string()))
    }

    fn apply_cli(
        mut builder: config::ConfigBuilder<config::builder::DefaultState>,
        cli: &Cli,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        if let Some(host) = &cli.host {
            builder = builder.set_override("router.host", host.as_str())?;
        }
        if let Some(user) = &cli.user {
            builder = builder.set_override("router.user", user.as_str())?;
        }
        if let Some(password) = &cli.password {
            builder = builder.set_override("router.password", password.as_str())?;
        }
        if let Some(port) = cli.port {
            builder = builder.set_override("router.port", i64::from(port))?;
        }
        if let Some(key) = &cli.host_key {
            builder = builder.set_override("router.host_key", key.as_str())?;
        }
        if let Some(url) = &cli.database_url {
            builder = builder.set_override("database.url", url.as_str())?;
        }
        if cli.hypertables {
            builder = builder.set_override("database.hypertables", true)?;
        }
        if let Some(interval) = cli.interval {
            let interval = i64::try_from(interval).unwrap_or(i64::MAX);
            builder = builder.set_override("poll.interval_secs", interval)?;
        }
        Ok(builder)
    }

    /// Check required values. Nothing here touches the network.
    pub fn into_settings(self) -> Result<Settings, MonitorError> {
        let host = non_empty(self.router.host)
            .ok_or_else(|| MonitorError::Config("router host is required (--host)".into()))?;
        let password = non_empty(self.router.password).ok_or_else(|| {
            MonitorError::Config("router password is required (--password)".into())
        })?;
        let host_key = non_empty(self.router.host_key).ok_or_else(|| {
            MonitorError::Config(
                "SSH host key is required (--host-key or HOST_KEY); unknown hosts are not trusted"
                    .into(),
            )
        })?;
        let host_key = HostKey::parse(&host_key)?;

        validate_database_url(&self.database.url)?;

        if self.poll.interval_secs == 0 {
            return Err(MonitorError::Config(
                "polling interval must be a positive number of seconds".into(),
            ));
        }

        Ok(Settings {
            target: SshTarget {
                host,
                port: self.router.port,
                user: self.router.user,
                password,
                host_key,
            },
            database_url: self.database.url,
            hypertables: self.database.hypertables,
            interval: Duration::from_secs(self.poll.interval_secs),
        })
    }
}

fn validate_database_url(raw: &str) -> Result<(), MonitorError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| MonitorError::Config(format!("invalid database URL: {}", e)))?;
    if !matches!(parsed.scheme(), "postgres" | "postgresql") {
        return Err(MonitorError::Config(format!(
            "invalid database URL: unsupported scheme {}",
            parsed.scheme()
        )));
    }
    PgConnectOptions::from_str(raw)
        .map_err(|e| MonitorError::Config(format!("invalid database URL: {}", e)))?;
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Database URL with any password replaced, for log output
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() && parsed.set_password(Some("****")).is_err() {
                return "<redacted url>".to_string();
            }
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}
