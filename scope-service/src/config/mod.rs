use service_core::config::{CommonConfig, Environment};
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::services::AnonymousAccess;

#[derive(Debug, Clone)]
pub struct ScopeConfig {
    pub common: CommonConfig,
    pub environment: Environment,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: Option<RedisConfig>,
    pub cache: CacheConfig,
    pub anonymous_access: AnonymousAccess,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL of the distributed tier.
    pub ttl_seconds: u64,
    /// TTL of the process-local tier.
    pub local_ttl_seconds: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn local_ttl(&self) -> Duration {
        Duration::from_secs(self.local_ttl_seconds)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 300,
            local_ttl_seconds: 300,
        }
    }
}

impl ScopeConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = CommonConfig::load()?;

        let environment = resolve_environment(&common, env::var("ENVIRONMENT").ok())?;
        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| common.log_level.clone());

        let is_prod = environment == Environment::Prod;

        let config = ScopeConfig {
            otlp_endpoint: env::var("OTLP_ENDPOINT")
                .ok()
                .or_else(|| common.otlp_endpoint.clone()),
            common,
            environment,
            service_name: get_env("SERVICE_NAME", Some("scope-service"), is_prod)?,
            log_level,
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10", is_prod)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1", is_prod)?,
            },
            redis: env::var("REDIS_URL").ok().map(|url| RedisConfig { url }),
            cache: CacheConfig {
                ttl_seconds: parse_env("SCOPE_CACHE_TTL_SECONDS", "300", is_prod)?,
                local_ttl_seconds: parse_env("SCOPE_LOCAL_CACHE_TTL_SECONDS", "300", is_prod)?,
            },
            anonymous_access: get_env("SCOPE_ANONYMOUS_ACCESS", Some("deny"), is_prod)?
                .parse()
                .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.cache.ttl_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SCOPE_CACHE_TTL_SECONDS must be positive"
            )));
        }

        if self.cache.local_ttl_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SCOPE_LOCAL_CACHE_TTL_SECONDS must be positive"
            )));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_MIN_CONNECTIONS exceeds DATABASE_MAX_CONNECTIONS"
            )));
        }

        if self.environment == Environment::Prod {
            if self.anonymous_access == AnonymousAccess::Unfiltered {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "SCOPE_ANONYMOUS_ACCESS=unfiltered is not allowed in production"
                )));
            }

            if self.redis.is_none() {
                tracing::warn!("REDIS_URL not set in production - distributed scope cache disabled");
            }
        }

        Ok(())
    }
}

/// Environment of the shared layer unless `ENVIRONMENT` names another one.
fn resolve_environment(
    common: &CommonConfig,
    explicit: Option<String>,
) -> Result<Environment, AppError> {
    match explicit {
        Some(value) => value
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e))),
        None => Ok(common.environment.clone()),
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{} is invalid: {}", key, e)))
}
