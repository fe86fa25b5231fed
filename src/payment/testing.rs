//! In-memory collaborators for payment tests

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use super::chain::{BalanceQueryError, Broadcaster, ChainService, TransferOrder};
use super::feed::{ConnectionError, FeedEvent, FeedHandler, TransactionFeed};
use super::forwarder::TransferError;
use super::types::ObservedTransaction;
use crate::config::Network;

/// Chain with a settable balance and transaction list
#[derive(Default)]
pub struct FakeChain {
    balance: AtomicU64,
    transactions: Mutex<Vec<ObservedTransaction>>,
    fail_balance: AtomicBool,
    balance_calls: AtomicU32,
}

impl FakeChain {
    pub fn with_balance(balance: u64) -> Arc<Self> {
        let chain = Self::default();
        chain.balance.store(balance, Ordering::SeqCst);
        Arc::new(chain)
    }

    pub fn set_balance(&self, balance: u64) {
        self.balance.store(balance, Ordering::SeqCst);
    }

    pub fn current_balance(&self) -> u64 {
        self.balance.load(Ordering::SeqCst)
    }

    /// Make the transaction visible to reconciliation
    pub fn add_transaction(&self, tx: ObservedTransaction) {
        let mut txs = self.transactions.lock().unwrap();
        txs.retain(|existing| existing.txid != tx.txid);
        txs.push(tx);
    }

    pub fn set_fail_balance(&self, fail: bool) {
        self.fail_balance.store(fail, Ordering::SeqCst);
    }

    pub fn balance_calls(&self) -> u32 {
        self.balance_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainService for FakeChain {
    async fn balance(&self, _address: &str, _network: Network) -> Result<u64, BalanceQueryError> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_balance.load(Ordering::SeqCst) {
            return Err(BalanceQueryError::Unreachable("fake outage".to_string()));
        }
        Ok(self.current_balance())
    }

    async fn address_transactions(
        &self,
        _address: &str,
        _network: Network,
    ) -> Result<Vec<ObservedTransaction>, BalanceQueryError> {
        Ok(self.transactions.lock().unwrap().clone())
    }
}

/// A transfer the fake broadcaster accepted
#[derive(Debug, Clone)]
pub struct SentOrder {
    pub from: String,
    pub to: String,
    pub amount_sats: u64,
}

/// Broadcaster that fails a set number of times, then empties the chain balance
pub struct FakeBroadcaster {
    chain: Arc<FakeChain>,
    failures_left: AtomicU32,
    sent: Mutex<Vec<SentOrder>>,
}

impl FakeBroadcaster {
    pub fn new(chain: Arc<FakeChain>) -> Arc<Self> {
        Self::failing(chain, 0)
    }

    pub fn failing(chain: Arc<FakeChain>, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            chain,
            failures_left: AtomicU32::new(failures),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<SentOrder> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Broadcaster for FakeBroadcaster {
    async fn send_all(&self, order: &TransferOrder<'_>) -> Result<String, TransferError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransferError::Broadcast("fake rejection".to_string()));
        }

        let mut sent = self.sent.lock().unwrap();
        sent.push(SentOrder {
            from: order.from.to_string(),
            to: order.to.to_string(),
            amount_sats: order.amount_sats,
        });
        self.chain.set_balance(0);
        Ok(format!("{:064x}", sent.len()))
    }
}

/// Feed driven by the test through [`FakeFeed::push`]
#[derive(Default)]
pub struct FakeFeed {
    fail_connect: AtomicBool,
    sender: Mutex<Option<mpsc::Sender<FeedEvent>>>,
    address: Mutex<Option<String>>,
    connects: AtomicU32,
    teardowns: AtomicU32,
}

impl FakeFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Feed whose connect fails until `set_fail_connect(false)`
    pub fn failing() -> Arc<Self> {
        let feed = Self::default();
        feed.fail_connect.store(true, Ordering::SeqCst);
        Arc::new(feed)
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Deliver a transaction; false if nobody is listening
    pub async fn push(&self, tx: ObservedTransaction) -> bool {
        self.send(FeedEvent::Transaction(tx)).await
    }

    pub async fn push_failure(&self, reason: &str) -> bool {
        self.send(FeedEvent::Failure(reason.to_string())).await
    }

    async fn send(&self, event: FeedEvent) -> bool {
        let sender = self.sender.lock().unwrap().clone();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    pub fn listened_address(&self) -> Option<String> {
        self.address.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn teardown_count(&self) -> u32 {
        self.teardowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionFeed for FakeFeed {
    async fn connect(&self, _network: Network) -> Result<(), ConnectionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ConnectionError::Connect("fake feed offline".to_string()));
        }
        Ok(())
    }

    async fn listen(&self, address: &str) -> Result<mpsc::Receiver<FeedEvent>, ConnectionError> {
        let (sender, receiver) = mpsc::channel(16);
        *self.sender.lock().unwrap() = Some(sender);
        *self.address.lock().unwrap() = Some(address.to_string());
        Ok(receiver)
    }

    async fn teardown(&self, _address: &str) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        self.sender.lock().unwrap().take();
    }
}

/// Feed handler that records what it receives
#[derive(Default)]
pub struct RecordingHandler {
    transactions: Mutex<Vec<ObservedTransaction>>,
    failures: Mutex<Vec<String>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transactions(&self) -> Vec<ObservedTransaction> {
        self.transactions.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().unwrap().clone()
    }

    /// Wait until at least `count` transactions arrived
    pub async fn wait_for_transactions(&self, count: usize) {
        wait_until(|| self.transactions.lock().unwrap().len() >= count).await;
    }
}

#[async_trait]
impl FeedHandler for RecordingHandler {
    async fn on_transaction(&self, tx: ObservedTransaction) {
        self.transactions.lock().unwrap().push(tx);
    }

    async fn on_failure(&self, reason: String) {
        self.failures.lock().unwrap().push(reason);
    }
}

/// Poll `condition` until it holds; panics after a few seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}
