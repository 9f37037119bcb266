use crate::query::SessionSettings;
use pgsession_core::Charset;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub queries: Vec<QueryConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// 0 means unlimited.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// 0 disables the read timeout.
    #[serde(default)]
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
            idle_timeout_secs: 0,
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:5432".to_string()
}

fn default_max_connections() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default)]
    pub charset: Charset,
    #[serde(default = "default_server_version")]
    pub server_version: String,
    #[serde(default)]
    pub parameter_status: BTreeMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            charset: Charset::default(),
            server_version: default_server_version(),
            parameter_status: BTreeMap::new(),
        }
    }
}

fn default_server_version() -> String {
    SessionSettings::default().server_version
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetricsConfig {
    pub listen_addr: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    /// Databases clients may select. Empty allows any name.
    #[serde(default)]
    pub databases: Vec<String>,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UserConfig {
    pub username: String,
    pub password_hash: Option<String>,
    pub password_plain: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Error,
}

/// A canned answer for the scripted backend.
#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    pub sql: String,
    pub kind: QueryKind,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
    #[serde(default)]
    pub rows_affected: u64,
    pub message: Option<String>,
}

impl Config {
    pub fn from_path(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.server.listen_addr.is_empty() {
            return Err(anyhow::anyhow!("server.listen_addr is empty"));
        }
        if self.logging.level.parse::<tracing::Level>().is_err() {
            return Err(anyhow::anyhow!(format!(
                "unknown logging.level {}",
                self.logging.level
            )));
        }
        for user in &self.auth.users {
            if user.password_hash.is_some() && user.password_plain.is_some() {
                return Err(anyhow::anyhow!(format!(
                    "user {} has both password_hash and password_plain",
                    user.username
                )));
            }
        }
        for query in &self.queries {
            match query.kind {
                QueryKind::Select => {
                    if query.columns.is_empty() {
                        return Err(anyhow::anyhow!(format!(
                            "select query {:?} declares no columns",
                            query.sql
                        )));
                    }
                    if let Some(row) = query.rows.iter().find(|r| r.len() != query.columns.len()) {
                        return Err(anyhow::anyhow!(format!(
                            "query {:?} has a row of {} cells for {} columns",
                            query.sql,
                            row.len(),
                            query.columns.len()
                        )));
                    }
                }
                QueryKind::Error if query.message.is_none() => {
                    return Err(anyhow::anyhow!(format!(
                        "error query {:?} has no message",
                        query.sql
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.server.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            server_version: self.session.server_version.clone(),
            parameter_status: self.session.parameter_status.clone(),
        }
    }
}
