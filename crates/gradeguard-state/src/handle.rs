//! SurrealDB connection configuration
//!
//! Supports in-memory (`mem://`), embedded on-disk (`surrealkv://`) and
//! remote (`ws://`/`wss://`) connections, selected from the environment.

use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::info;

use crate::error::StateError;
use crate::migrations;
use crate::Result;

/// Default embedded database location when nothing is configured.
pub const DEFAULT_LOCAL_PATH: &str = ".gradeguard/db";

/// Credentials for a remote SurrealDB endpoint.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Connection URL (`mem://`, `surrealkv://path`, `wss://host`)
    pub url: String,
    /// Namespace (default: "gradeguard")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    pub credentials: Option<Credentials>,
}

impl StoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            namespace: "gradeguard".to_string(),
            database: "main".to_string(),
            credentials: None,
        }
    }

    /// Throwaway in-process database.
    pub fn in_memory() -> Self {
        Self::new("mem://")
    }

    /// Embedded on-disk database at `path`.
    pub fn local(path: impl AsRef<std::path::Path>) -> Self {
        Self::new(format!("surrealkv://{}", path.as_ref().display()))
    }

    /// Set custom namespace
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    /// Set custom database
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        is_root: bool,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
            is_root,
        });
        self
    }

    /// Create from environment variables
    ///
    /// Reads, in order of precedence:
    /// - SURREALDB_ENDPOINT + SURREALDB_USERNAME + SURREALDB_PASSWORD
    ///   (remote; SURREALDB_ROOT=true for root users)
    /// - GRADEGUARD_DB_URL (any supported URL, no auth)
    /// - otherwise `surrealkv://.gradeguard/db`
    ///
    /// SURREALDB_NAMESPACE / SURREALDB_DATABASE override the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("SURREALDB_ENDPOINT") {
            Ok(endpoint) => {
                let username = std::env::var("SURREALDB_USERNAME")
                    .map_err(|_| StateError::Config("SURREALDB_USERNAME not set".into()))?;
                let password = std::env::var("SURREALDB_PASSWORD")
                    .map_err(|_| StateError::Config("SURREALDB_PASSWORD not set".into()))?;
                let is_root = std::env::var("SURREALDB_ROOT")
                    .map(|v| v.eq_ignore_ascii_case("true"))
                    .unwrap_or(false);
                Self::new(endpoint).with_credentials(username, password, is_root)
            }
            Err(_) => match std::env::var("GRADEGUARD_DB_URL") {
                Ok(url) => Self::new(url),
                Err(_) => Self::local(DEFAULT_LOCAL_PATH),
            },
        };

        if let Ok(ns) = std::env::var("SURREALDB_NAMESPACE") {
            config = config.with_namespace(ns);
        }
        if let Ok(db) = std::env::var("SURREALDB_DATABASE") {
            config = config.with_database(db);
        }
        Ok(config)
    }

    fn local_dir(&self) -> Option<&str> {
        self.url.strip_prefix("surrealkv://")
    }
}

/// Open a connection, authenticate, select namespace/database and migrate.
pub async fn connect(config: &StoreConfig) -> Result<Surreal<Any>> {
    if let Some(dir) = config.local_dir() {
        std::fs::create_dir_all(dir).map_err(|e| {
            StateError::Connection(format!("Failed to create database directory {dir}: {e}"))
        })?;
    }

    let db = surrealdb::engine::any::connect(config.url.as_str())
        .await
        .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {e}", config.url)))?;

    if let Some(creds) = &config.credentials {
        if creds.is_root {
            db.signin(Root {
                username: &creds.username,
                password: &creds.password,
            })
            .await
            .map_err(|e| StateError::Connection(format!("Root auth failed: {e}")))?;
        } else {
            db.signin(Database {
                namespace: &config.namespace,
                database: &config.database,
                username: &creds.username,
                password: &creds.password,
            })
            .await
            .map_err(|e| StateError::Connection(format!("DB auth failed: {e}")))?;
        }
    }

    db.use_ns(&config.namespace)
        .use_db(&config.database)
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;

    migrations::init_schema(&db).await?;
    info!(url = %config.url, namespace = %config.namespace, "gradebook store connected");
    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_config_uses_surrealkv_scheme() {
        let config = StoreConfig::local("/tmp/gg");
        assert_eq!(config.url, "surrealkv:///tmp/gg");
        assert_eq!(config.local_dir(), Some("/tmp/gg"));
        assert_eq!(config.namespace, "gradeguard");
    }

    #[test]
    fn in_memory_has_no_local_dir() {
        assert_eq!(StoreConfig::in_memory().local_dir(), None);
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = StoreConfig::in_memory()
            .with_namespace("school")
            .with_database("exams")
            .with_credentials("root", "secret", true);
        assert_eq!(config.namespace, "school");
        assert_eq!(config.database, "exams");
        assert!(config.credentials.unwrap().is_root);
    }
}
