//! paywatch - Bitcoin Payment Watcher
//!
//! Tracks a single expected Bitcoin payment: provisions a receiving address,
//! watches it through a live feed and periodic reconciliation, confirms once
//! enough sufficiently-deep funds arrived, and optionally forwards them to a
//! main wallet.
//!
//! ```rust,ignore
//! let client = Arc::new(EsploraClient::for_network(Network::Testnet));
//! let feed = Arc::new(EsploraFeed::new((*client).clone(), Duration::from_secs(10)));
//! let payment = Payment::new(
//!     PaymentOptions::from_btc(0.0001, Network::Testnet).confirmations(1),
//!     PaymentServices::new(client.clone(), client, feed),
//! )?;
//!
//! let mut events = payment.subscribe();
//! payment.start().await;
//! while let Some(event) = events.recv().await { /* ... */ }
//! ```

pub mod config;
pub mod error;
pub mod esplora;
pub mod logging;
pub mod payment;

// Re-exports: configuration
pub use config::{ConfigError, Network, ServiceConfig};

// Re-exports: errors
pub use error::{PaymentError, Result};

// Re-exports: Esplora adapters
pub use esplora::{EsploraClient, EsploraError, EsploraFeed};

// Re-exports: payment tracking
pub use payment::{
    Payment, PaymentConfig, PaymentEvent, PaymentOptions, PaymentServices, PaymentState,
    Subscription, TransferResult,
};

/// Satoshi conversion helpers
pub mod units {
    pub const SATS_PER_BTC: u64 = 100_000_000;

    /// Convert BTC to satoshis, rounding half away from zero
    pub fn btc_to_sats(btc: f64) -> u64 {
        (btc * SATS_PER_BTC as f64).round() as u64
    }

    pub fn sats_to_btc(sats: u64) -> f64 {
        sats as f64 / SATS_PER_BTC as f64
    }

    pub fn format_sats(sats: u64) -> String {
        let btc = sats_to_btc(sats);
        format!("{} sats ({:.8} BTC)", sats, btc)
    }

}
