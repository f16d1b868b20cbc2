//! Process configuration: CLI flags with `ARESTOR_*` environment fallbacks.

use anyhow::{anyhow, Result};
use clap::Parser;

use crate::store::{StoreBackend, DEFAULT_RETRIES};

#[derive(Debug, Clone, Parser)]
#[command(name = "arestor", version, about = "Mock cloud metadata service")]
pub struct Config {
    /// Address the HTTP server binds to.
    #[arg(long, env = "ARESTOR_BIND_ADDR", default_value = "0.0.0.0:8088")]
    pub bind_addr: String,

    #[arg(long, env = "ARESTOR_REDIS_HOST", default_value = "127.0.0.1")]
    pub redis_host: String,

    #[arg(long, env = "ARESTOR_REDIS_PORT", default_value_t = 6379)]
    pub redis_port: u16,

    /// Logical Redis database index.
    #[arg(long, env = "ARESTOR_REDIS_DATABASE", default_value_t = 0)]
    pub redis_database: i64,

    /// Backend override: a `redis://` URL or `memory`.
    #[arg(long, env = "ARESTOR_STORE")]
    pub store: Option<String>,

    /// Connection attempts before a store access fails.
    #[arg(long, env = "ARESTOR_STORE_RETRIES", default_value_t = DEFAULT_RETRIES)]
    pub retries: u32,
}

impl Config {
    pub fn backend(&self) -> Result<StoreBackend> {
        match self.store.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(spec) => StoreBackend::from_spec(spec)
                .ok_or_else(|| anyhow!("unsupported store backend {:?}", spec)),
            None => Ok(StoreBackend::redis(
                &self.redis_host,
                self.redis_port,
                self.redis_database,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_local_redis() {
        let cfg = Config::try_parse_from(["arestor"]).unwrap();
        assert_eq!(cfg.retries, 3);
        assert_eq!(
            cfg.backend().unwrap(),
            StoreBackend::Redis {
                url: "redis://127.0.0.1:6379/0".into()
            }
        );
    }

    #[test]
    fn store_flag_overrides_redis_parts() {
        let cfg = Config::try_parse_from([
            "arestor",
            "--redis-host",
            "10.1.1.1",
            "--store",
            "memory",
            "--retries",
            "5",
        ])
        .unwrap();
        assert_eq!(cfg.backend().unwrap(), StoreBackend::Memory);
        assert_eq!(cfg.retries, 5);

        let bad = Config::try_parse_from(["arestor", "--store", "sled:/tmp/db"]).unwrap();
        assert!(bad.backend().is_err());
    }
}
