use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use tracing::warn;

use parley_gateway::RegistryConfig;

const DEV_SECRET: &str = "dev-secret-change-me";

/// Process configuration, read from `PARLEY_*` environment variables
/// (a `.env` file is loaded first if present).
#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub registry: RegistryConfig,
    pub max_connections: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let jwt_secret = std::env::var("PARLEY_JWT_SECRET").unwrap_or_else(|_| DEV_SECRET.into());
        if jwt_secret == DEV_SECRET {
            warn!("PARLEY_JWT_SECRET is not set, using the development secret");
        }

        let defaults = RegistryConfig::default();
        let config = Self {
            jwt_secret,
            db_path: std::env::var("PARLEY_DB_PATH")
                .unwrap_or_else(|_| "parley.db".into())
                .into(),
            host: std::env::var("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: parse_var("PARLEY_PORT", 3000)?,
            registry: RegistryConfig {
                queue_depth: parse_var("PARLEY_QUEUE_DEPTH", defaults.queue_depth)?,
                shards: parse_var("PARLEY_REGISTRY_SHARDS", defaults.shards)?,
            },
            max_connections: parse_var("PARLEY_MAX_CONNECTIONS", 10_000)?,
        };

        if config.registry.queue_depth == 0 {
            anyhow::bail!("PARLEY_QUEUE_DEPTH must be at least 1");
        }
        if config.registry.shards == 0 {
            anyhow::bail!("PARLEY_REGISTRY_SHARDS must be at least 1");
        }
        Ok(config)
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_variable_uses_default() {
        let value: u16 = parse_var("PARLEY_TEST_SURELY_UNSET", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn listen_address_parses() {
        let config = Config {
            jwt_secret: "s".into(),
            db_path: "x.db".into(),
            host: "127.0.0.1".into(),
            port: 4000,
            registry: RegistryConfig::default(),
            max_connections: 1,
        };
        assert_eq!(config.addr().unwrap().port(), 4000);
    }
}
