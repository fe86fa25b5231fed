//! Chain Services
//!
//! Interfaces to the blockchain services a payment depends on: the
//! authoritative balance/transaction query and the transaction broadcaster.
//! `crate::esplora` provides HTTP implementations of both.

use async_trait::async_trait;
use thiserror::Error;

use super::forwarder::TransferError;
use super::provisioner::ReceiverKeys;
use super::types::ObservedTransaction;
use crate::config::Network;

/// Balance or transaction query failed
#[derive(Debug, Clone, Error)]
pub enum BalanceQueryError {
    #[error("balance service unreachable: {0}")]
    Unreachable(String),

    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

/// Authoritative view of an address on chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainService: Send + Sync {
    /// Current balance at `address` in satoshis, including unconfirmed funds
    async fn balance(&self, address: &str, network: Network) -> Result<u64, BalanceQueryError>;

    /// Transactions paying into `address`, with their current depth
    async fn address_transactions(
        &self,
        address: &str,
        network: Network,
    ) -> Result<Vec<ObservedTransaction>, BalanceQueryError>;
}

/// A send-all transfer out of the receiver address
pub struct TransferOrder<'a> {
    pub from: &'a str,
    pub to: &'a str,
    pub keys: &'a ReceiverKeys,
    pub amount_sats: u64,
    pub network: Network,
}

/// Signs and submits transfers
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Send the whole balance described by `order`; returns the txid
    async fn send_all(&self, order: &TransferOrder<'_>) -> Result<String, TransferError>;
}
