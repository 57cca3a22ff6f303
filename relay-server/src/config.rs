//! 命令行参数

use clap::{Parser, ValueEnum};
use relay_store::RedisStoreConfig;
use std::net::SocketAddr;
use std::path::PathBuf;

/// 存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    Redis,
    Sqlite,
}

/// Relay server CLI
#[derive(Parser, Debug)]
#[command(name = "relay-server")]
#[command(version, about = "Session relay with command-risk gating")]
pub struct Args {
    /// Listen address
    #[arg(short, long, env = "RELAY_BIND", default_value = "0.0.0.0:10010")]
    pub bind: SocketAddr,

    /// Store backend
    #[arg(long, env = "RELAY_STORE", value_enum, default_value_t = StoreKind::Sqlite)]
    pub store: StoreKind,

    /// SQLite database path
    #[arg(long, env = "RELAY_SQLITE_PATH", default_value = "relay.db")]
    pub sqlite_path: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    // ==================== Redis ====================

    /// Redis host
    #[arg(long, env = "REDIS_HOST", default_value = "localhost")]
    pub redis_host: String,

    /// Redis port
    #[arg(long, env = "REDIS_PORT", default_value = "6379")]
    pub redis_port: u16,

    /// Redis password
    #[arg(long, env = "REDIS_PASSWORD")]
    pub redis_password: Option<String>,

    /// Redis key prefix
    #[arg(long, env = "REDIS_PREFIX", default_value = "relay:")]
    pub redis_prefix: String,
}

impl Args {
    pub fn redis_config(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            host: self.redis_host.clone(),
            port: self.redis_port,
            password: self.redis_password.clone(),
            key_prefix: self.redis_prefix.clone(),
            ..RedisStoreConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["relay-server"]);
        assert_eq!(args.bind.port(), 10010);
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_redis_selection() {
        let args = Args::parse_from([
            "relay-server",
            "--store",
            "redis",
            "--redis-host",
            "cache.internal",
            "--redis-prefix",
            "test:",
        ]);
        assert_eq!(args.store, StoreKind::Redis);

        let config = args.redis_config();
        assert_eq!(config.host, "cache.internal");
        assert_eq!(config.key_prefix, "test:");
    }
}
