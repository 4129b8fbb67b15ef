//! Configuration management
//! Process environment only: store endpoints and startup toggles. Runtime
//! behavior (venues, symbols, thresholds) lives in the `bot:config` key on
//! the store and hot-reloads over pub/sub.

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "cexarb-monitor", about = "Cross-exchange arbitrage monitor")]
pub struct ProcessConfig {
    /// Key/value + pub/sub store URL (config, status, book cache)
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// SQLite path for the opportunity sink
    #[arg(long, env = "DATABASE_PATH", default_value = "opportunities.db")]
    pub database_path: String,

    /// Fetch venue pair lists at startup to seed the symbol registry
    #[arg(long, env = "DISCOVER_PAIRS")]
    pub discover_pairs: bool,
}

pub fn load_config() -> ProcessConfig {
    dotenv::dotenv().ok();
    ProcessConfig::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProcessConfig::parse_from(["cexarb-monitor"]);
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.database_path, "opportunities.db");
        assert!(!config.discover_pairs);
    }

    #[test]
    fn test_flag_overrides() {
        let config = ProcessConfig::parse_from([
            "cexarb-monitor",
            "--redis-url",
            "redis://cache:6379/1",
            "--database-path",
            "/tmp/opps.db",
            "--discover-pairs",
        ]);
        assert_eq!(config.redis_url, "redis://cache:6379/1");
        assert_eq!(config.database_path, "/tmp/opps.db");
        assert!(config.discover_pairs);
    }
}
