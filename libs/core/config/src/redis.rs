use crate::{env_optional, env_parse_required, env_required, ConfigError, FromEnv};
use std::fmt;

/// Redis connection settings
///
/// Environment variables:
/// - `REDIS_HOST` (required) - hostname or IP address
/// - `REDIS_PORT` (required) - TCP port
/// - `REDIS_DB` (required) - logical database index
/// - `REDIS_PASSWORD` (optional) - empty or unset means no AUTH
#[derive(Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: u32,
    pub password: Option<String>,
}

impl RedisConfig {
    pub fn new(host: impl Into<String>, port: u16, db: u32) -> Self {
        Self {
            host: host.into(),
            port,
            db,
            password: None,
        }
    }

    /// Set the password (empty string clears it)
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        let password = password.into();
        self.password = (!password.is_empty()).then_some(password);
        self
    }

    /// Connection URL understood by the redis client, e.g. `redis://:pw@host:6379/0`
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                urlencoding::encode(password),
                self.host,
                self.port,
                self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    /// Same as [`url`](Self::url) with the password masked, for logs
    pub fn redacted_url(&self) -> String {
        match &self.password {
            Some(_) => format!("redis://:***@{}:{}/{}", self.host, self.port, self.db),
            None => self.url(),
        }
    }
}

impl fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db", &self.db)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl FromEnv for RedisConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let host = env_required("REDIS_HOST")?;
        if host.trim().is_empty() {
            return Err(ConfigError::MissingEnvVar("REDIS_HOST".to_string()));
        }

        Ok(Self {
            host,
            port: env_parse_required("REDIS_PORT")?,
            db: env_parse_required("REDIS_DB")?,
            password: env_optional("REDIS_PASSWORD"),
        })
    }
}
