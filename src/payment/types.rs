//! Payment Types
//!
//! Types for tracking a single expected payment through its lifecycle:
//! initialized → detected → confirmed (or cancelled from any non-terminal state)

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::scheduler::FireMode;
use crate::config::Network;
use crate::units;

/// Default number of confirmations before a payment is accepted
pub const DEFAULT_MIN_CONFIRMATIONS: u32 = 6;

/// Default reconciliation interval
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Status of a payment through its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PaymentState {
    /// Listening for transactions to the receiver address
    Initialized = 1,
    /// At least one transaction to the receiver has been seen
    Detected = 2,
    /// Expected amount received with the required depth
    Confirmed = 3,
    /// Cancelled by the caller
    Cancelled = 4,
}

impl PaymentState {
    /// Check if no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Cancelled)
    }

    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode the atomic representation. `0` means the payment never started.
    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Initialized),
            2 => Some(Self::Detected),
            3 => Some(Self::Confirmed),
            4 => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialized => write!(f, "initialized"),
            Self::Detected => write!(f, "detected"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A transaction paying into the receiver address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedTransaction {
    /// Transaction ID
    pub txid: String,
    /// Amount paid to the receiver, in satoshis
    pub amount_sats: u64,
    /// Confirmation depth, if the source reported one
    pub confirmations: Option<u32>,
    /// Funding address, if the source reported one
    pub sender: Option<String>,
}

impl ObservedTransaction {
    pub fn new(txid: impl Into<String>, amount_sats: u64) -> Self {
        Self {
            txid: txid.into(),
            amount_sats,
            confirmations: None,
            sender: None,
        }
    }

    pub fn with_confirmations(mut self, confirmations: u32) -> Self {
        self.confirmations = Some(confirmations);
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Confirmation depth, treating an unknown depth as unconfirmed
    pub fn depth(&self) -> u32 {
        self.confirmations.unwrap_or(0)
    }
}

/// Notification published on the lifecycle bus
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PaymentEvent {
    /// A new transaction to the receiver was recorded
    Detected { transaction: ObservedTransaction },
    /// The payment is complete
    Confirmed {
        amount_sats: u64,
        confirmations: u32,
        from: Vec<String>,
    },
    /// The received balance was sent to the main wallet
    Forwarded {
        txid: String,
        amount_sats: u64,
        destination: String,
    },
    /// A forwarding attempt failed; funds remain at the receiver
    ForwardFailed { error: String },
    /// The payment was cancelled before completing
    Cancelled,
}

impl PaymentEvent {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Detected { .. } => "detected",
            Self::Confirmed { .. } => "confirmed",
            Self::Forwarded { .. } => "forwarded",
            Self::ForwardFailed { .. } => "forward_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Construction parameters for a payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOptions {
    /// Expected amount in satoshis (must be positive)
    pub amount_sats: u64,
    /// Minimum confirmations per transaction
    pub confirmations: u32,
    /// Network the payment is made on
    pub network: Network,
    /// Pre-existing receiver address; one is provisioned when absent
    pub receiver: Option<String>,
    /// Wallet to forward the received balance to once confirmed
    pub main_wallet: Option<String>,
}

impl PaymentOptions {
    /// Expect `amount_sats` satoshis on `network`
    pub fn new(amount_sats: u64, network: Network) -> Self {
        Self {
            amount_sats,
            confirmations: DEFAULT_MIN_CONFIRMATIONS,
            network,
            receiver: None,
            main_wallet: None,
        }
    }

    /// Expect an amount given in BTC
    pub fn from_btc(amount_btc: f64, network: Network) -> Self {
        Self::new(units::btc_to_sats(amount_btc), network)
    }

    pub fn confirmations(mut self, confirmations: u32) -> Self {
        self.confirmations = confirmations;
        self
    }

    pub fn receiver(mut self, address: impl Into<String>) -> Self {
        self.receiver = Some(address.into());
        self
    }

    pub fn main_wallet(mut self, address: impl Into<String>) -> Self {
        self.main_wallet = Some(address.into());
        self
    }
}

/// What the evaluator checks a payment against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentTerms {
    pub receiver: String,
    pub network: Network,
    pub expected_sats: u64,
    pub min_confirmations: u32,
}

/// Runtime configuration for a payment instance
#[derive(Debug, Clone)]
pub struct PaymentConfig {
    /// Reconciliation interval
    pub poll_interval: Duration,
    /// Whether reconciliation fires once immediately on start
    pub fire_mode: FireMode,
    /// Buffered notifications per subscriber
    pub event_capacity: usize,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            fire_mode: FireMode::AfterInterval,
            event_capacity: 64,
        }
    }
}
