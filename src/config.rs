//! Environment-based Configuration for paywatch
//!
//! Loads the watcher's runtime settings from environment variables.
//! No secret material is ever read from the environment: receiver keys are
//! generated per payment and never leave process memory.
//!
//! # Environment Variables
//!
//! - `PAYWATCH_NETWORK` - "mainnet" or "testnet" (default: "testnet")
//! - `PAYWATCH_ESPLORA_URL` - Esplora API endpoint (default: blockstream.info for the network)
//! - `PAYWATCH_POLL_INTERVAL_SECS` - Reconciliation interval (default: 60)
//! - `PAYWATCH_FEED_INTERVAL_SECS` - Live feed refresh interval (default: 10)
//! - `PAYWATCH_FEE_RATE` - Forwarding fee rate in sat/vB (default: 10 mainnet, 2 testnet)
//! - `PAYWATCH_MAIN_WALLET` - Wallet that receives forwarded funds (optional)
//! - `PAYWATCH_LOG_LEVEL` - Logging level (trace, debug, info, warn, error)
//! - `PAYWATCH_LOG_JSON` - Set to "1" for JSON log output

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Network a payment is made on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" | "bitcoin" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            _ => Err(ConfigError::InvalidValue(
                "PAYWATCH_NETWORK".to_string(),
                format!("unknown network: {}", s),
            )),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Network {
    /// Network name as used in logs and events
    pub fn name(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        }
    }

    /// Get default Esplora API for this network
    pub fn default_esplora_url(&self) -> &'static str {
        match self {
            Network::Mainnet => crate::esplora::MAINNET_URL,
            Network::Testnet => crate::esplora::TESTNET_URL,
        }
    }

    /// Get bitcoin network enum
    pub fn bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
        }
    }

    /// Default forwarding fee rate (sat/vB)
    pub fn default_fee_rate(&self) -> u64 {
        match self {
            Network::Mainnet => 10,
            Network::Testnet => 2,
        }
    }
}

/// Settings for the watcher binary
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Network environment
    pub network: Network,

    /// Esplora API endpoint
    pub esplora_url: String,

    /// Reconciliation interval
    pub poll_interval: Duration,

    /// Live feed refresh interval
    pub feed_interval: Duration,

    /// Forwarding fee rate (sat/vB)
    pub fee_rate: u64,

    /// Default forwarding destination
    pub main_wallet: Option<String>,

    /// Log level
    pub log_level: String,

    /// Emit JSON logs
    pub log_json: bool,
}

impl ServiceConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let network: Network = env::var("PAYWATCH_NETWORK")
            .unwrap_or_else(|_| "testnet".to_string())
            .parse()?;

        let esplora_url = env::var("PAYWATCH_ESPLORA_URL")
            .unwrap_or_else(|_| network.default_esplora_url().to_string());

        let poll_interval = Duration::from_secs(parse_or(
            "PAYWATCH_POLL_INTERVAL_SECS",
            crate::payment::DEFAULT_POLL_INTERVAL_SECS,
        )?);
        if poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "PAYWATCH_POLL_INTERVAL_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let feed_interval = Duration::from_secs(parse_or("PAYWATCH_FEED_INTERVAL_SECS", 10)?);
        if feed_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "PAYWATCH_FEED_INTERVAL_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let fee_rate = parse_or("PAYWATCH_FEE_RATE", network.default_fee_rate())?;

        let main_wallet = env::var("PAYWATCH_MAIN_WALLET")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let log_level = env::var("PAYWATCH_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_json = env::var("PAYWATCH_LOG_JSON").map(|v| v == "1").unwrap_or(false);

        Ok(Self {
            network,
            esplora_url,
            poll_interval,
            feed_interval,
            fee_rate,
            main_wallet,
            log_level,
            log_json,
        })
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("=== paywatch Configuration ===");
        println!("Network: {}", self.network);
        println!("Esplora API: {}", self.esplora_url);
        println!("Poll Interval: {}s", self.poll_interval.as_secs());
        println!("Feed Interval: {}s", self.feed_interval.as_secs());
        println!("Fee Rate: {} sat/vB", self.fee_rate);
        println!(
            "Main Wallet: {}",
            self.main_wallet.as_deref().unwrap_or("(none)")
        );
        println!("Log Level: {}", self.log_level);
        println!("==============================");
    }
}

/// Parse a numeric env var, falling back to `default` when unset
fn parse_or<T: FromStr>(var_name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(var_name) {
        Ok(value) => value.trim().parse().map_err(|_| {
            ConfigError::InvalidValue(var_name.to_string(), "must be a number".to_string())
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_parsing() {
        assert!(matches!("mainnet".parse::<Network>(), Ok(Network::Mainnet)));
        assert!(matches!("testnet".parse::<Network>(), Ok(Network::Testnet)));
        assert!(matches!("TEST".parse::<Network>(), Ok(Network::Testnet)));
        assert!("devnet".parse::<Network>().is_err());
    }

    #[test]
    fn test_network_defaults() {
        assert_eq!(Network::Mainnet.bitcoin_network(), bitcoin::Network::Bitcoin);
        assert_eq!(Network::Testnet.bitcoin_network(), bitcoin::Network::Testnet);
        assert!(Network::Testnet.default_esplora_url().contains("testnet"));
        assert_eq!(Network::Mainnet.to_string(), "mainnet");
    }

    #[test]
    fn test_print_summary() {
        let mut config = ServiceConfig {
            network: Network::Testnet,
            esplora_url: Network::Testnet.default_esplora_url().to_string(),
            poll_interval: Duration::from_secs(60),
            feed_interval: Duration::from_secs(10),
            fee_rate: Network::Testnet.default_fee_rate(),
            main_wallet: None,
            log_level: "info".to_string(),
            log_json: false,
        };
        config.print_summary();

        config.main_wallet = Some("tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx".to_string());
        config.print_summary();
    }

    #[test]
    fn test_parse_or_default() {
        let value: u64 = parse_or("PAYWATCH_TEST_SURELY_UNSET_VAR", 42).unwrap();
        assert_eq!(value, 42);
    }
}
