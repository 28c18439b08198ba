//! Application configuration: detail view API and S3 archive

use core_config::{env_optional, env_or_default, env_parse_or, ConfigError, FromEnv};
use std::fmt;
use std::time::Duration;

const DEFAULT_DETAIL_VIEW_API: &str = "http://localhost:8000/api/detail";
const DEFAULT_API_TIMEOUT_SECS: u64 = 45;
const DEFAULT_S3_REGION: &str = "us-east-1";

/// Detail view API endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailApiConfig {
    pub url: String,
    pub timeout: Duration,
}

impl FromEnv for DetailApiConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let secs = env_parse_or("API_TIMEOUT", DEFAULT_API_TIMEOUT_SECS)?;

        Ok(Self {
            url: env_or_default("DETAIL_VIEW_API", DEFAULT_DETAIL_VIEW_API),
            timeout: Duration::from_secs(secs),
        })
    }
}

/// S3-compatible object store holding the enriched documents
#[derive(Clone, PartialEq, Eq)]
pub struct S3Config {
    pub access_key: String,
    pub secret_key: String,
    pub endpoint_url: String,
    pub bucket: String,
    pub region: String,
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("access_key", &self.access_key)
            .field("secret_key", &"***")
            .field("endpoint_url", &self.endpoint_url)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .finish()
    }
}

impl FromEnv for S3Config {
    /// All four required variables are checked before failing, so one start-up
    /// attempt reports every missing name.
    fn from_env() -> Result<Self, ConfigError> {
        let mut missing = Vec::new();
        let mut required = |key: &str| {
            env_optional(key).unwrap_or_else(|| {
                missing.push(key.to_string());
                String::new()
            })
        };

        let access_key = required("S3_ACCESS_KEY");
        let secret_key = required("S3_SECRET_KEY");
        let endpoint_url = required("S3_ENDPOINT_URL");
        let bucket = required("S3_BUCKET_NAME");

        if !missing.is_empty() {
            return Err(ConfigError::MissingEnvVars(missing));
        }

        Ok(Self {
            access_key,
            secret_key,
            endpoint_url,
            bucket,
            region: env_or_default("S3_REGION", DEFAULT_S3_REGION),
        })
    }
}

/// Everything the consumer needs beyond the worker core
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub detail_api: DetailApiConfig,
    pub s3: S3Config,
}

impl FromEnv for AppConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            detail_api: DetailApiConfig::from_env()?,
            s3: S3Config::from_env()?,
        })
    }
}
