//! Payout Forwarder
//!
//! Moves the confirmed balance from the receiver address to the main wallet.
//!
//! # Flow:
//! 1. Validate the destination against the payment's network
//! 2. Re-query the authoritative balance at the receiver
//! 3. Zero balance: nothing to do (a previous attempt already went through)
//! 4. Otherwise hand a send-all order to the broadcaster
//!
//! Every attempt re-queries the balance, so retrying after a failure (or
//! after an attempt whose outcome is unknown) never double-spends.

use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use super::chain::{BalanceQueryError, Broadcaster, ChainService, TransferOrder};
use super::provisioner::{parse_address, ReceiverKeys};
use crate::config::Network;

/// Forwarding errors. Funds stay at the receiver in every case.
#[derive(Debug, Clone, Error)]
pub enum TransferError {
    #[error("balance query failed: {0}")]
    BalanceQuery(#[from] BalanceQueryError),

    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    #[error("amount {amount} sats does not cover fee of {fee} sats")]
    BelowDust { amount: u64, fee: u64 },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("broadcast failed: {0}")]
    Broadcast(String),

    #[error("no key material for the receiver address")]
    NoKeyMaterial,
}

/// Result of a forwarding attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferResult {
    Sent { txid: String, amount_sats: u64 },
    /// Receiver balance was already zero
    NothingToForward,
}

/// Sends the receiver balance to a destination wallet
#[derive(Clone)]
pub struct PayoutForwarder {
    chain: Arc<dyn ChainService>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl PayoutForwarder {
    pub fn new(chain: Arc<dyn ChainService>, broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self { chain, broadcaster }
    }

    /// Forward everything at `receiver` to `destination`
    pub async fn forward(
        &self,
        receiver: &str,
        keys: &ReceiverKeys,
        destination: &str,
        network: Network,
    ) -> Result<TransferResult, TransferError> {
        parse_address(destination, network)
            .map_err(|e| TransferError::InvalidDestination(e.to_string()))?;

        let balance = self.chain.balance(receiver, network).await?;
        if balance == 0 {
            info!(target: "paywatch::forward", %receiver, "receiver balance is zero, nothing to forward");
            return Ok(TransferResult::NothingToForward);
        }

        let order = TransferOrder {
            from: receiver,
            to: destination,
            keys,
            amount_sats: balance,
            network,
        };

        match self.broadcaster.send_all(&order).await {
            Ok(txid) => {
                info!(
                    target: "paywatch::forward",
                    %receiver,
                    %destination,
                    %txid,
                    amount_sats = balance,
                    "balance forwarded"
                );
                Ok(TransferResult::Sent {
                    txid,
                    amount_sats: balance,
                })
            }
            Err(e) => {
                warn!(target: "paywatch::forward", %receiver, %destination, error = %e, "forwarding failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::chain::MockChainService;
    use crate::payment::provisioner::AddressProvisioner;
    use crate::payment::testing::{FakeBroadcaster, FakeChain};

    const DESTINATION: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";

    fn keys() -> ReceiverKeys {
        AddressProvisioner::new().provision(Network::Testnet).unwrap()
    }

    #[tokio::test]
    async fn test_forwards_full_balance() {
        let chain = FakeChain::with_balance(110_000);
        let broadcaster = FakeBroadcaster::new(chain.clone());
        let forwarder = PayoutForwarder::new(chain.clone(), broadcaster.clone());
        let keys = keys();

        let result = forwarder
            .forward(keys.address(), &keys, DESTINATION, Network::Testnet)
            .await
            .unwrap();

        assert!(matches!(result, TransferResult::Sent { amount_sats: 110_000, .. }));
        assert_eq!(chain.current_balance(), 0);

        let sent = broadcaster.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].from, keys.address());
        assert_eq!(sent[0].to, DESTINATION);
        assert_eq!(sent[0].amount_sats, 110_000);
    }

    #[tokio::test]
    async fn test_zero_balance_is_nothing_to_forward() {
        let chain = FakeChain::with_balance(0);
        let broadcaster = FakeBroadcaster::new(chain.clone());
        let forwarder = PayoutForwarder::new(chain, broadcaster.clone());
        let keys = keys();

        let result = forwarder
            .forward(keys.address(), &keys, DESTINATION, Network::Testnet)
            .await
            .unwrap();

        assert_eq!(result, TransferResult::NothingToForward);
        assert!(broadcaster.sent().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_failure_keeps_funds() {
        let chain = FakeChain::with_balance(50_000);
        let broadcaster = FakeBroadcaster::failing(chain.clone(), 1);
        let forwarder = PayoutForwarder::new(chain.clone(), broadcaster.clone());
        let keys = keys();

        let first = forwarder
            .forward(keys.address(), &keys, DESTINATION, Network::Testnet)
            .await;
        assert!(matches!(first, Err(TransferError::Broadcast(_))));
        assert_eq!(chain.current_balance(), 50_000);

        // A retry re-queries and succeeds
        let second = forwarder
            .forward(keys.address(), &keys, DESTINATION, Network::Testnet)
            .await
            .unwrap();
        assert!(matches!(second, TransferResult::Sent { amount_sats: 50_000, .. }));
        assert_eq!(chain.current_balance(), 0);
    }

    #[tokio::test]
    async fn test_balance_error_propagates() {
        let mut chain = MockChainService::new();
        chain
            .expect_balance()
            .times(1)
            .returning(|_, _| Err(BalanceQueryError::Unreachable("down".to_string())));
        let chain = Arc::new(chain);
        let broadcaster = FakeBroadcaster::new(FakeChain::with_balance(0));
        let forwarder = PayoutForwarder::new(chain, broadcaster.clone());
        let keys = keys();

        let result = forwarder
            .forward(keys.address(), &keys, DESTINATION, Network::Testnet)
            .await;
        assert!(matches!(result, Err(TransferError::BalanceQuery(_))));
        assert!(broadcaster.sent().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_destination_on_wrong_network() {
        let mut chain = MockChainService::new();
        chain.expect_balance().never();
        let broadcaster = FakeBroadcaster::new(FakeChain::with_balance(0));
        let forwarder = PayoutForwarder::new(Arc::new(chain), broadcaster);
        let keys = keys();

        let result = forwarder
            .forward(keys.address(), &keys, DESTINATION, Network::Mainnet)
            .await;
        assert!(matches!(result, Err(TransferError::InvalidDestination(_))));
    }
}
