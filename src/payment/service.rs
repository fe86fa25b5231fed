//! Payment Service
//!
//! Tracks one expected payment through its lifecycle:
//! initialized → detected → confirmed, with cancel from any non-terminal state
//!
//! # Flow:
//! 1. Construction provisions a receiving keypair (or accepts a given address)
//! 2. `start()` subscribes to the live feed and starts the reconciliation timer
//! 3. Feed events and reconciliation ticks both record into the ledger and
//!    re-evaluate the payment
//! 4. The first Complete evaluation wins a compare-and-set into Confirmed,
//!    stops both triggers and forwards the balance to the main wallet
//!
//! Every trigger holds a shared guard on the shutdown gate while it runs.
//! `dispose()` cancels the shutdown token and then takes the gate exclusively,
//! so once it returns no trigger is running and none will start.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bus::{LifecycleBus, Subscription};
use super::chain::{Broadcaster, ChainService};
use super::evaluator::{CompletionSummary, ConfirmationEvaluator, Evaluation};
use super::feed::{FeedHandler, LiveFeedSubscriber, TransactionFeed};
use super::forwarder::{PayoutForwarder, TransferError, TransferResult};
use super::ledger::TransactionLedger;
use super::provisioner::{parse_address, AddressProvisioner, OsRandom, RandomSource, ReceiverKeys};
use super::scheduler::{PollingScheduler, TickOutcome};
use super::types::{
    ObservedTransaction, PaymentConfig, PaymentEvent, PaymentOptions, PaymentState, PaymentTerms,
};
use crate::config::Network;
use crate::error::PaymentError;
use crate::logging::{log_feed_event, log_forward_event, log_payment_event};

/// Raw state value before a successful `start()`
const NOT_STARTED: u8 = 0;

/// External collaborators a payment runs against
#[derive(Clone)]
pub struct PaymentServices {
    pub chain: Arc<dyn ChainService>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub feed: Arc<dyn TransactionFeed>,
    pub random: Arc<dyn RandomSource>,
}

impl PaymentServices {
    /// Services using the OS random source for key generation
    pub fn new(
        chain: Arc<dyn ChainService>,
        broadcaster: Arc<dyn Broadcaster>,
        feed: Arc<dyn TransactionFeed>,
    ) -> Self {
        Self {
            chain,
            broadcaster,
            feed,
            random: Arc::new(OsRandom),
        }
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }
}

/// A single expected payment. Cheap to clone; clones share the same instance.
#[derive(Clone)]
pub struct Payment {
    inner: Arc<PaymentInner>,
}

struct PaymentInner {
    id: String,
    receiver: String,
    network: Network,
    main_wallet: Option<String>,
    config: PaymentConfig,

    expected_sats: AtomicU64,
    min_confirmations: AtomicU32,
    /// `PaymentState` as u8, `NOT_STARTED` before start
    state: AtomicU8,
    /// Mirrors `ledger.total()` for synchronous reads
    total: AtomicU64,
    ledger: RwLock<TransactionLedger>,

    /// Held until forwarding completes or the payment is disposed
    keys: Mutex<Option<ReceiverKeys>>,
    has_keys: AtomicBool,
    forwarded: AtomicBool,

    chain: Arc<dyn ChainService>,
    evaluator: ConfirmationEvaluator,
    forwarder: PayoutForwarder,
    feed: LiveFeedSubscriber,
    scheduler: PollingScheduler,
    bus: LifecycleBus,

    shutdown: CancellationToken,
    gate: RwLock<()>,
}

impl Payment {
    /// Create a payment with the default runtime configuration
    pub fn new(options: PaymentOptions, services: PaymentServices) -> Result<Self, PaymentError> {
        Self::with_config(options, services, PaymentConfig::default())
    }

    /// Create a payment. Fails if the options are invalid or no receiving
    /// keypair could be generated.
    pub fn with_config(
        options: PaymentOptions,
        services: PaymentServices,
        config: PaymentConfig,
    ) -> Result<Self, PaymentError> {
        if options.amount_sats == 0 {
            return Err(PaymentError::Validation(
                "expected amount must be positive".to_string(),
            ));
        }

        let network = options.network;
        let main_wallet = match options.main_wallet.as_deref() {
            Some(wallet) => Some(parse_address(wallet, network)?.to_string()),
            None => None,
        };

        let (receiver, keys) = match options.receiver.as_deref() {
            Some(address) => {
                let receiver = AddressProvisioner::accept(address, network)?;
                warn!(
                    target: "paywatch::payment",
                    %receiver,
                    "receiver address supplied without key material, forwarding unavailable"
                );
                (receiver, None)
            }
            None => {
                let keys = AddressProvisioner::with_random(services.random.clone()).provision(network)?;
                (keys.address().to_string(), Some(keys))
            }
        };

        let shutdown = CancellationToken::new();
        let id = uuid::Uuid::new_v4().to_string();

        info!(
            target: "paywatch::payment",
            payment_id = %id,
            %receiver,
            %network,
            expected_sats = options.amount_sats,
            min_confirmations = options.confirmations,
            forwarding = main_wallet.is_some(),
            "payment created"
        );

        let inner = PaymentInner {
            id,
            receiver,
            network,
            main_wallet,
            expected_sats: AtomicU64::new(options.amount_sats),
            min_confirmations: AtomicU32::new(options.confirmations),
            state: AtomicU8::new(NOT_STARTED),
            total: AtomicU64::new(0),
            ledger: RwLock::new(TransactionLedger::new()),
            has_keys: AtomicBool::new(keys.is_some()),
            keys: Mutex::new(keys),
            forwarded: AtomicBool::new(false),
            evaluator: ConfirmationEvaluator::new(services.chain.clone()),
            forwarder: PayoutForwarder::new(services.chain.clone(), services.broadcaster),
            chain: services.chain,
            feed: LiveFeedSubscriber::new(services.feed, &shutdown),
            scheduler: PollingScheduler::with_cancel(config.poll_interval, &shutdown),
            bus: LifecycleBus::new(config.event_capacity),
            config,
            shutdown,
            gate: RwLock::new(()),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Unique id of this payment, used to correlate logs
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn receiver_address(&self) -> &str {
        &self.inner.receiver
    }

    pub fn network(&self) -> Network {
        self.inner.network
    }

    pub fn main_wallet(&self) -> Option<&str> {
        self.inner.main_wallet.as_deref()
    }

    /// Whether key material for the receiver is still held
    pub fn can_forward(&self) -> bool {
        self.inner.has_keys.load(Ordering::SeqCst)
    }

    /// Expected amount in satoshis
    pub fn expected_amount(&self) -> u64 {
        self.inner.expected_sats.load(Ordering::SeqCst)
    }

    /// Change the expected amount; takes effect on the next evaluation
    pub fn set_expected_amount(&self, amount_sats: u64) -> Result<(), PaymentError> {
        if amount_sats == 0 {
            return Err(PaymentError::Validation(
                "expected amount must be positive".to_string(),
            ));
        }
        self.inner.expected_sats.store(amount_sats, Ordering::SeqCst);
        Ok(())
    }

    pub fn min_confirmations(&self) -> u32 {
        self.inner.min_confirmations.load(Ordering::SeqCst)
    }

    pub fn set_min_confirmations(&self, confirmations: u32) {
        self.inner
            .min_confirmations
            .store(confirmations, Ordering::SeqCst);
    }

    /// Current state; `None` until `start()` succeeds
    pub fn state(&self) -> Option<PaymentState> {
        self.inner.current_state()
    }

    /// Sum of distinct transactions received, in satoshis
    pub fn total_received(&self) -> u64 {
        self.inner.total.load(Ordering::SeqCst)
    }

    /// Transactions recorded so far, in first-seen order
    pub async fn transactions(&self) -> Vec<ObservedTransaction> {
        self.inner.ledger.read().await.transactions().cloned().collect()
    }

    /// Subscribe to lifecycle notifications
    pub fn subscribe(&self) -> Subscription {
        self.inner.bus.subscribe()
    }

    /// Subscribe to the live feed and start reconciliation.
    ///
    /// Returns false if the feed could not be established. The payment then
    /// stays unstarted and `start()` may be called again.
    pub async fn start(&self) -> bool {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return false;
        }

        // Feed events wait on the gate until the state is set
        let _gate = inner.gate.write().await;
        if inner.shutdown.is_cancelled() {
            return false;
        }
        if inner.current_state().is_some() {
            return true;
        }

        let handler = Arc::new(FeedBridge {
            payment: Arc::downgrade(inner),
        });
        if !inner.feed.subscribe(&inner.receiver, inner.network, handler).await {
            log_feed_event("feed_unavailable", &inner.id, &inner.receiver, Some("subscription failed"));
            return false;
        }
        log_feed_event("feed_subscribed", &inner.id, &inner.receiver, None);

        inner
            .state
            .store(PaymentState::Initialized.as_u8(), Ordering::SeqCst);

        let payment = Arc::downgrade(inner);
        inner.scheduler.start(inner.config.fire_mode, move || {
            let payment = payment.clone();
            async move {
                match payment.upgrade() {
                    Some(inner) => inner.tick().await,
                    None => TickOutcome::Stop,
                }
            }
        });

        info!(
            target: "paywatch::payment",
            payment_id = %inner.id,
            receiver = %inner.receiver,
            poll_interval_secs = inner.scheduler.period().as_secs(),
            "payment started"
        );
        true
    }

    /// Run one reconciliation pass now and return the resulting state
    pub async fn reconcile(&self) -> Result<PaymentState, PaymentError> {
        let inner = &self.inner;
        let Some(_gate) = inner.enter().await else {
            return Err(PaymentError::InvalidState("payment disposed".to_string()));
        };
        let Some(state) = inner.current_state() else {
            return Err(PaymentError::InvalidState("payment not started".to_string()));
        };

        if !state.is_terminal() {
            inner.reconcile_pass().await;
        }

        inner
            .current_state()
            .ok_or_else(|| PaymentError::InvalidState("payment not started".to_string()))
    }

    /// Retry forwarding after a failed attempt. Only valid once confirmed.
    pub async fn retry_forwarding(&self) -> Result<TransferResult, PaymentError> {
        let inner = &self.inner;
        if inner.current_state() != Some(PaymentState::Confirmed) {
            return Err(PaymentError::InvalidState(
                "forwarding requires a confirmed payment".to_string(),
            ));
        }
        let Some(_gate) = inner.enter().await else {
            return Err(PaymentError::InvalidState("payment disposed".to_string()));
        };

        inner.forward_attempt().await
    }

    /// Cancel the payment. Only possible from a non-terminal state.
    pub async fn cancel(&self) -> bool {
        let inner = &self.inner;

        // Ledger guard orders Cancelled after any Detected being published
        let ledger = inner.ledger.write().await;
        let mut current = inner.state.load(Ordering::SeqCst);
        loop {
            match PaymentState::from_u8(current) {
                Some(PaymentState::Initialized) | Some(PaymentState::Detected) => {}
                _ => return false,
            }
            match inner.state.compare_exchange(
                current,
                PaymentState::Cancelled.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        inner.bus.publish(PaymentEvent::Cancelled);
        let total = ledger.total();
        drop(ledger);

        inner.scheduler.stop();
        inner.feed.unsubscribe().await;
        // No forwarding from a terminal Cancelled state
        inner.erase_keys().await;
        log_payment_event("payment_cancelled", &inner.id, total, true, None);
        true
    }

    /// Stop all activity, end subscriptions and erase key material.
    /// No feed or reconciliation callback runs after this returns.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();

        // Wait for in-flight triggers
        let _gate = inner.gate.write().await;

        inner.scheduler.stop();
        inner.feed.unsubscribe().await;
        inner.bus.close();
        inner.erase_keys().await;

        info!(target: "paywatch::payment", payment_id = %inner.id, "payment disposed");
    }
}

impl std::fmt::Debug for Payment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payment")
            .field("id", &self.inner.id)
            .field("receiver", &self.inner.receiver)
            .field("network", &self.inner.network)
            .field("state", &self.state())
            .field("expected_sats", &self.expected_amount())
            .field("total_sats", &self.total_received())
            .finish()
    }
}

impl PaymentInner {
    fn current_state(&self) -> Option<PaymentState> {
        PaymentState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn is_terminal(&self) -> bool {
        self.current_state().is_some_and(|s| s.is_terminal())
    }

    fn terms(&self) -> PaymentTerms {
        PaymentTerms {
            receiver: self.receiver.clone(),
            network: self.network,
            expected_sats: self.expected_sats.load(Ordering::SeqCst),
            min_confirmations: self.min_confirmations.load(Ordering::SeqCst),
        }
    }

    /// Shared gate guard, or `None` once shutdown has begun
    async fn enter(&self) -> Option<RwLockReadGuard<'_, ()>> {
        let guard = self.gate.read().await;
        if self.shutdown.is_cancelled() {
            None
        } else {
            Some(guard)
        }
    }

    async fn on_feed_transaction(self: &Arc<Self>, tx: ObservedTransaction) {
        let Some(_gate) = self.enter().await else {
            return;
        };
        if self.is_terminal() {
            return;
        }

        self.record(tx).await;
        self.evaluate_and_settle().await;
    }

    async fn tick(self: &Arc<Self>) -> TickOutcome {
        let Some(_gate) = self.enter().await else {
            return TickOutcome::Stop;
        };
        if self.is_terminal() {
            return TickOutcome::Stop;
        }

        self.reconcile_pass().await;

        if self.is_terminal() {
            TickOutcome::Stop
        } else {
            TickOutcome::Continue
        }
    }

    /// Pull the address history into the ledger, then evaluate
    async fn reconcile_pass(self: &Arc<Self>) {
        match self
            .chain
            .address_transactions(&self.receiver, self.network)
            .await
        {
            Ok(transactions) => {
                for tx in transactions {
                    self.record(tx).await;
                }
            }
            Err(e) => {
                warn!(
                    target: "paywatch::payment",
                    payment_id = %self.id,
                    error = %e,
                    "transaction query failed, evaluating known transactions"
                );
            }
        }

        self.evaluate_and_settle().await;
    }

    /// Record a transaction; returns true if it was new
    async fn record(&self, tx: ObservedTransaction) -> bool {
        if tx.amount_sats == 0 || self.is_terminal() {
            return false;
        }

        // State changes into Confirmed and Cancelled also take this guard
        let mut ledger = self.ledger.write().await;
        if self.is_terminal() {
            return false;
        }

        let outcome = ledger.record(tx.clone());
        self.total.store(outcome.total, Ordering::SeqCst);

        if !outcome.newly_recorded {
            return false;
        }

        info!(
            target: "paywatch::payment",
            payment_id = %self.id,
            txid = %tx.txid,
            amount_sats = tx.amount_sats,
            total_sats = outcome.total,
            "transaction detected"
        );

        // Only the first transaction moves the state; later ones find Detected
        let _ = self.state.compare_exchange(
            PaymentState::Initialized.as_u8(),
            PaymentState::Detected.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );

        self.bus.publish(PaymentEvent::Detected { transaction: tx });
        drop(ledger);
        true
    }

    /// Evaluate a ledger snapshot; confirm on Complete
    async fn evaluate_and_settle(self: &Arc<Self>) -> bool {
        if self.current_state() != Some(PaymentState::Detected) {
            return false;
        }

        let snapshot = self.ledger.read().await.clone();
        match self.evaluator.evaluate(&self.terms(), &snapshot).await {
            Evaluation::Complete(summary) => self.confirm(summary).await,
            Evaluation::Pending(reason) => {
                debug!(target: "paywatch::payment", payment_id = %self.id, ?reason, "payment pending");
                false
            }
        }
    }

    /// Detected → Confirmed. Exactly one caller gets past the exchange.
    async fn confirm(self: &Arc<Self>, summary: CompletionSummary) -> bool {
        let ledger = self.ledger.write().await;
        if self
            .state
            .compare_exchange(
                PaymentState::Detected.as_u8(),
                PaymentState::Confirmed.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return false;
        }

        let total = ledger.total();
        self.bus.publish(PaymentEvent::Confirmed {
            amount_sats: total,
            confirmations: summary.confirmations,
            from: summary.from,
        });
        drop(ledger);

        info!(
            target: "paywatch::payment",
            payment_id = %self.id,
            total_sats = total,
            balance_sats = summary.balance_sats,
            confirmations = summary.confirmations,
            "payment confirmed"
        );
        log_payment_event("payment_confirmed", &self.id, total, true, None);

        self.scheduler.stop();
        self.feed.unsubscribe().await;

        if self.main_wallet.is_some() {
            let payment = self.clone();
            tokio::spawn(async move {
                let Some(_gate) = payment.enter().await else {
                    return;
                };
                // Outcome is published on the bus
                let _ = payment.forward_attempt().await;
            });
        }

        true
    }

    /// One serialized forwarding attempt. Publishes the outcome.
    async fn forward_attempt(&self) -> Result<TransferResult, PaymentError> {
        let Some(destination) = self.main_wallet.as_deref() else {
            return Err(PaymentError::Validation(
                "no main wallet configured".to_string(),
            ));
        };

        let mut keys = self.keys.lock().await;
        if self.forwarded.load(Ordering::SeqCst) {
            return Ok(TransferResult::NothingToForward);
        }

        let result = match keys.as_ref() {
            Some(held) => {
                self.forwarder
                    .forward(&self.receiver, held, destination, self.network)
                    .await
            }
            None => Err(TransferError::NoKeyMaterial),
        };

        if result.is_ok() {
            // Nothing left to spend; drop the secret
            keys.take();
            self.has_keys.store(false, Ordering::SeqCst);
            self.forwarded.store(true, Ordering::SeqCst);
        }
        drop(keys);

        match &result {
            Ok(TransferResult::Sent { txid, amount_sats }) => {
                log_forward_event("payment_forwarded", &self.id, *amount_sats, destination, true, Some(txid), None);
                self.bus.publish(PaymentEvent::Forwarded {
                    txid: txid.clone(),
                    amount_sats: *amount_sats,
                    destination: destination.to_string(),
                });
            }
            Ok(TransferResult::NothingToForward) => {
                debug!(target: "paywatch::forward", payment_id = %self.id, "nothing to forward");
            }
            Err(e) => {
                let error = e.to_string();
                log_forward_event("forward_failed", &self.id, 0, destination, false, None, Some(&error));
                self.bus.publish(PaymentEvent::ForwardFailed { error });
            }
        }

        result.map_err(PaymentError::from)
    }

    async fn erase_keys(&self) {
        self.keys.lock().await.take();
        self.has_keys.store(false, Ordering::SeqCst);
    }
}

impl Drop for PaymentInner {
    fn drop(&mut self) {
        // Stop detached tasks when the last handle goes away without dispose()
        self.shutdown.cancel();
    }
}

/// Routes feed callbacks to a payment without keeping it alive
struct FeedBridge {
    payment: Weak<PaymentInner>,
}

#[async_trait]
impl FeedHandler for FeedBridge {
    async fn on_transaction(&self, tx: ObservedTransaction) {
        if let Some(payment) = self.payment.upgrade() {
            payment.on_feed_transaction(tx).await;
        }
    }

    async fn on_failure(&self, reason: String) {
        if let Some(payment) = self.payment.upgrade() {
            // Reconciliation keeps running without the feed
            log_feed_event("feed_failed", &payment.id, &payment.receiver, Some(&reason));
        }
    }
}
