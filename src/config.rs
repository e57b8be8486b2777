//! Database configuration and connection-string assembly
//!
//! Mirrors the `database` section of the Python `ConfigFile` this crate's
//! behavior is ported from: `{hostname, port, username, password,
//! app_db_name, sys_db_name?}`. Everything else in a deployment's config
//! (telemetry, runtime options, env map) belongs to the application layer
//! and is out of scope here.

use std::time::Duration;

/// Suffix appended to `app_db_name` when `sys_db_name` is not set.
pub const SYS_DB_SUFFIX: &str = "_dbos_sys";

/// Schema all durable tables live under, in both the app and system
/// databases.
pub const SCHEMA_NAME: &str = "dbos";

/// Environment variable that, when set and `executor_id == "local"`, tells
/// the recovery engine that a managed platform will perform local recovery
/// itself.
pub const VMID_ENV_VAR: &str = "DBOS__VMID";

/// Database connection parameters.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub app_db_name: String,
    pub sys_db_name: Option<String>,
}

impl DatabaseConfig {
    pub fn new(
        hostname: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        app_db_name: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            username: username.into(),
            password: password.into(),
            app_db_name: app_db_name.into(),
            sys_db_name: None,
        }
    }

    pub fn with_sys_db_name(mut self, name: impl Into<String>) -> Self {
        self.sys_db_name = Some(name.into());
        self
    }

    /// The resolved system database name: `sys_db_name` if set, otherwise
    /// `"<app_db_name>_dbos_sys"`.
    pub fn sys_db_name(&self) -> String {
        self.sys_db_name
            .clone()
            .unwrap_or_else(|| format!("{}{}", self.app_db_name, SYS_DB_SUFFIX))
    }

    /// Connection string for the application database.
    pub fn app_db_url(&self) -> String {
        self.url_for(&self.app_db_name)
    }

    /// Connection string for the system database.
    pub fn sys_db_url(&self) -> String {
        self.url_for(&self.sys_db_name())
    }

    /// Connection string for the `postgres` maintenance database, used to
    /// `CREATE DATABASE` the app/sys databases on first boot.
    pub fn maintenance_db_url(&self) -> String {
        self.url_for("postgres")
    }

    fn url_for(&self, database: &str) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.hostname, self.port, database
        )
    }
}

/// Pool sizing shared by both the AppDB and SysDB connection pools
/// (spec §5: size 20, overflow 5, 30s acquire timeout).
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 25, // 20 base + 5 overflow, collapsed to one pool
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Tunables for the buffered writer (C6).
#[derive(Debug, Clone, Copy)]
pub struct BufferConfig {
    pub flush_interval: Duration,
    pub flush_batch_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs_f64(1.0),
            flush_batch_size: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_default_sys_db_name() {
        let cfg = DatabaseConfig::new("localhost", 5432, "u", "p", "myapp");
        assert_eq!(cfg.sys_db_name(), "myapp_dbos_sys");
    }

    #[test]
    fn explicit_sys_db_name_wins() {
        let cfg = DatabaseConfig::new("localhost", 5432, "u", "p", "myapp")
            .with_sys_db_name("custom_sys");
        assert_eq!(cfg.sys_db_name(), "custom_sys");
    }

    #[test]
    fn builds_connection_urls() {
        let cfg = DatabaseConfig::new("db.internal", 5433, "u", "p", "myapp");
        assert_eq!(cfg.app_db_url(), "postgres://u:p@db.internal:5433/myapp");
        assert_eq!(
            cfg.sys_db_url(),
            "postgres://u:p@db.internal:5433/myapp_dbos_sys"
        );
        assert_eq!(
            cfg.maintenance_db_url(),
            "postgres://u:p@db.internal:5433/postgres"
        );
    }
}
