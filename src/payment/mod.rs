//! Payment Module
//!
//! Tracks a single expected Bitcoin payment through its lifecycle:
//!
//! ```text
//! INITIALIZED → DETECTED → CONFIRMED
//!      └────────────┴──→ CANCELLED
//! ```
//!
//! ## Components
//!
//! - **provisioner**: Generates the receiving keypair and address
//! - **ledger**: Deduplicates observed transactions, keeps the running total
//! - **evaluator**: Local total plus authoritative balance decide completion
//! - **feed**: Live transaction feed (fast detection path)
//! - **scheduler**: Periodic reconciliation (catches anything the feed missed)
//! - **forwarder**: Sends the confirmed balance to the main wallet
//! - **bus**: Lifecycle notifications for subscribers
//! - **service**: The `Payment` state machine tying it together
//!
//! ## Flow Overview
//!
//! 1. Caller creates a `Payment` and shares its receiver address
//! 2. `start()` subscribes to the feed and starts reconciliation
//! 3. Each new transaction publishes `detected`
//! 4. Once enough sufficiently-deep funds are seen and the balance agrees,
//!    `confirmed` is published exactly once
//! 5. With a main wallet configured, the balance is forwarded

pub mod bus;
pub mod chain;
pub mod evaluator;
pub mod feed;
pub mod forwarder;
pub mod ledger;
pub mod provisioner;
pub mod scheduler;
pub mod service;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use bus::{LifecycleBus, Subscription};
pub use chain::{BalanceQueryError, Broadcaster, ChainService, TransferOrder};
pub use evaluator::{CompletionSummary, ConfirmationEvaluator, Evaluation, PendingReason};
pub use feed::{ConnectionError, FeedEvent, FeedHandler, LiveFeedSubscriber, TransactionFeed};
pub use forwarder::{PayoutForwarder, TransferError, TransferResult};
pub use ledger::{RecordOutcome, TransactionLedger};
pub use provisioner::{
    parse_address, AddressError, AddressProvisioner, KeyGenerationError, OsRandom, RandomSource,
    ReceiverKeys,
};
pub use scheduler::{FireMode, PollingScheduler, TickOutcome};
pub use service::{Payment, PaymentServices};
pub use types::{
    ObservedTransaction, PaymentConfig, PaymentEvent, PaymentOptions, PaymentState, PaymentTerms,
    DEFAULT_MIN_CONFIRMATIONS, DEFAULT_POLL_INTERVAL_SECS,
};
