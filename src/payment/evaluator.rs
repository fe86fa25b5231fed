//! Confirmation Evaluator
//!
//! Decides whether a payment is complete. Two independent checks must agree:
//!
//! 1. **Local total**: transactions in the ledger that are at least
//!    `min_confirmations` deep add up to the expected amount.
//! 2. **Authoritative balance**: the chain service reports at least the
//!    expected amount sitting at the receiver address.
//!
//! Feed transactions can be parsed optimistically; the queried balance is
//! what forwarding will actually spend. A failed balance query is never an
//! error here, only a reason to stay pending until the next poll.

use std::sync::Arc;
use tracing::{debug, warn};

use super::chain::ChainService;
use super::ledger::TransactionLedger;
use super::types::PaymentTerms;

/// Outcome of one evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    Complete(CompletionSummary),
    Pending(PendingReason),
}

impl Evaluation {
    pub fn is_complete(&self) -> bool {
        matches!(self, Evaluation::Complete(_))
    }
}

/// Figures behind a completed evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionSummary {
    /// Ledger total counted toward completion
    pub counted_sats: u64,
    /// Queried balance at the receiver
    pub balance_sats: u64,
    /// Shallowest depth among counted transactions
    pub confirmations: u32,
    /// Senders of recorded transactions
    pub from: Vec<String>,
}

/// Why a payment is not complete yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingReason {
    /// Not enough sufficiently-deep transactions in the ledger
    Underpaid { counted: u64, expected: u64 },
    /// Ledger agrees but the balance does not
    BalanceShort { balance: u64, expected: u64 },
    /// Balance query failed; retried on the next poll
    BalanceUnavailable(String),
}

/// Evaluates payments against the chain's balance view
#[derive(Clone)]
pub struct ConfirmationEvaluator {
    chain: Arc<dyn ChainService>,
}

impl ConfirmationEvaluator {
    pub fn new(chain: Arc<dyn ChainService>) -> Self {
        Self { chain }
    }

    /// Evaluate `terms` against a ledger snapshot
    pub async fn evaluate(&self, terms: &PaymentTerms, ledger: &TransactionLedger) -> Evaluation {
        let counted = ledger.confirmed_total(terms.min_confirmations);
        let locally_complete = counted >= terms.expected_sats;

        debug!(
            target: "paywatch::payment",
            receiver = %terms.receiver,
            counted,
            total = ledger.total(),
            expected = terms.expected_sats,
            min_confirmations = terms.min_confirmations,
            "local total evaluated"
        );

        let balance = match self.chain.balance(&terms.receiver, terms.network).await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(
                    target: "paywatch::payment",
                    receiver = %terms.receiver,
                    error = %e,
                    "balance query failed, staying pending"
                );
                return Evaluation::Pending(PendingReason::BalanceUnavailable(e.to_string()));
            }
        };

        debug!(target: "paywatch::payment", receiver = %terms.receiver, balance, "balance queried");

        if !locally_complete {
            return Evaluation::Pending(PendingReason::Underpaid {
                counted,
                expected: terms.expected_sats,
            });
        }

        if balance < terms.expected_sats {
            return Evaluation::Pending(PendingReason::BalanceShort {
                balance,
                expected: terms.expected_sats,
            });
        }

        Evaluation::Complete(CompletionSummary {
            counted_sats: counted,
            balance_sats: balance,
            confirmations: ledger.min_depth(terms.min_confirmations).unwrap_or(0),
            from: ledger.senders(),
        })
    }
}
