//! Live Feed Subscriber
//!
//! Bridges an external push feed of address transactions to a handler.
//! This is the fast detection path; the polling scheduler covers anything
//! the feed misses.
//!
//! Connecting is asynchronous and may fail. Failure is reported as `false`
//! ("not listening") so the caller can retry or give up.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::ObservedTransaction;
use crate::config::Network;

/// Feed connection errors
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("feed connection failed: {0}")]
    Connect(String),

    #[error("cannot listen on {address}: {reason}")]
    Listen { address: String, reason: String },
}

/// Event delivered by a transaction feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Transaction(ObservedTransaction),
    /// The feed hit a problem; delivery may or may not continue
    Failure(String),
}

/// Address-scoped transaction event source
#[async_trait]
pub trait TransactionFeed: Send + Sync {
    /// Connect to the feed for `network`
    async fn connect(&self, network: Network) -> Result<(), ConnectionError>;

    /// Start delivering events for `address`
    async fn listen(&self, address: &str) -> Result<mpsc::Receiver<FeedEvent>, ConnectionError>;

    /// Stop delivering events for `address` and release the connection
    async fn teardown(&self, address: &str);
}

/// Receives feed events
#[async_trait]
pub trait FeedHandler: Send + Sync {
    async fn on_transaction(&self, tx: ObservedTransaction);

    async fn on_failure(&self, reason: String);
}

/// Owns one feed subscription
pub struct LiveFeedSubscriber {
    feed: Arc<dyn TransactionFeed>,
    cancel: CancellationToken,
    /// Address being listened on; taken exactly once by teardown
    address: Mutex<Option<String>>,
    listening: Arc<AtomicBool>,
    subscribing: AtomicBool,
}

impl LiveFeedSubscriber {
    /// Subscriber that also stops when `parent` is cancelled
    pub fn new(feed: Arc<dyn TransactionFeed>, parent: &CancellationToken) -> Self {
        Self {
            feed,
            cancel: parent.child_token(),
            address: Mutex::new(None),
            listening: Arc::new(AtomicBool::new(false)),
            subscribing: AtomicBool::new(false),
        }
    }

    /// Connect and start delivering events for `address` to `handler`.
    ///
    /// Returns false if the feed could not be established; no events will
    /// be delivered in that case and the call may be retried.
    pub async fn subscribe(
        &self,
        address: &str,
        network: Network,
        handler: Arc<dyn FeedHandler>,
    ) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if self.subscribing.swap(true, Ordering::SeqCst) {
            // Already subscribed, or a concurrent attempt is in flight
            return self.is_listening();
        }

        if let Err(e) = self.feed.connect(network).await {
            warn!(target: "paywatch::feed", %address, %network, error = %e, "feed connection failed");
            self.subscribing.store(false, Ordering::SeqCst);
            return false;
        }

        let mut events = match self.feed.listen(address).await {
            Ok(events) => events,
            Err(e) => {
                warn!(target: "paywatch::feed", %address, error = %e, "feed listen failed");
                self.feed.teardown(address).await;
                self.subscribing.store(false, Ordering::SeqCst);
                return false;
            }
        };

        *self.address.lock().unwrap_or_else(PoisonError::into_inner) = Some(address.to_string());
        self.listening.store(true, Ordering::SeqCst);
        info!(target: "paywatch::feed", %address, %network, "listening for transactions");

        let cancel = self.cancel.clone();
        let listening = self.listening.clone();
        let watched = address.to_string();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };

                match event {
                    Some(FeedEvent::Transaction(tx)) => {
                        debug!(target: "paywatch::feed", address = %watched, txid = %tx.txid, "feed transaction");
                        handler.on_transaction(tx).await;
                    }
                    Some(FeedEvent::Failure(reason)) => handler.on_failure(reason).await,
                    None => {
                        if !cancel.is_cancelled() {
                            handler.on_failure("feed closed".to_string()).await;
                        }
                        break;
                    }
                }
            }

            listening.store(false, Ordering::SeqCst);
            debug!(target: "paywatch::feed", address = %watched, "feed delivery stopped");
        });

        true
    }

    /// Stop delivery and tear the feed down. Safe to call repeatedly, and
    /// from inside a handler callback.
    pub async fn unsubscribe(&self) {
        self.cancel.cancel();
        self.listening.store(false, Ordering::SeqCst);

        let address = self
            .address
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(address) = address {
            self.feed.teardown(&address).await;
            info!(target: "paywatch::feed", %address, "feed unsubscribed");
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }
}
