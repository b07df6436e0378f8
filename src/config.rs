use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::limits::MAX_CREDENTIALS;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("credential entry {0:?} is not user:password")]
    MalformedCredential(String),
    #[error("credential for user {0:?} given twice")]
    DuplicateUser(String),
    #[error("no credentials configured")]
    NoCredentials,
    #[error("more than {MAX_CREDENTIALS} credentials configured")]
    TooManyCredentials,
}

/// Server settings, read once at startup from `SLOTD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// user → password
    pub credentials: HashMap<String, String>,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    var(key).and_then(|s| s.trim().parse().ok())
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable numbers fall back to their defaults; malformed credentials
    /// are an error.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let credentials = match var("SLOTD_CREDENTIALS") {
            Some(spec) => parse_credentials(&spec)?,
            None => parse_credentials("slotd:slotd")?,
        };
        Ok(Self {
            bind: var("SLOTD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&var, "SLOTD_PORT").unwrap_or(5433),
            data_dir: var("SLOTD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            credentials,
            max_connections: parsed(&var, "SLOTD_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: parsed(&var, "SLOTD_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: parsed(&var, "SLOTD_METRICS_PORT"),
            tls_cert: var("SLOTD_TLS_CERT").map(PathBuf::from),
            tls_key: var("SLOTD_TLS_KEY").map(PathBuf::from),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotd.wal")
    }
}

/// `user:password[,user:password…]`. Passwords may contain `:`.
pub fn parse_credentials(spec: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut credentials = HashMap::new();
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (user, password) = entry
            .split_once(':')
            .filter(|(u, p)| !u.is_empty() && !p.is_empty())
            .ok_or_else(|| ConfigError::MalformedCredential(entry.to_string()))?;
        if credentials
            .insert(user.to_string(), password.to_string())
            .is_some()
        {
            return Err(ConfigError::DuplicateUser(user.to_string()));
        }
        if credentials.len() > MAX_CREDENTIALS {
            return Err(ConfigError::TooManyCredentials);
        }
    }
    if credentials.is_empty() {
        return Err(ConfigError::NoCredentials);
    }
    Ok(credentials)
}
