//! Transaction Ledger
//!
//! Deduplicates observed transactions by txid and keeps the running total.
//! The same transaction may arrive from the live feed and from
//! reconciliation, possibly several times; only its first delivery counts.

use std::collections::HashMap;

use super::types::ObservedTransaction;

/// Result of recording a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    /// Total received after this record
    pub total: u64,
    /// False when the txid was already known
    pub newly_recorded: bool,
}

/// Transactions received at one address, keyed by txid
#[derive(Debug, Clone, Default)]
pub struct TransactionLedger {
    transactions: HashMap<String, ObservedTransaction>,
    /// First-seen order, for reporting
    order: Vec<String>,
    total: u64,
}

impl TransactionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transaction.
    ///
    /// A replayed txid never changes the amount or the total. It may only
    /// advance the stored confirmation depth.
    pub fn record(&mut self, tx: ObservedTransaction) -> RecordOutcome {
        if let Some(existing) = self.transactions.get_mut(&tx.txid) {
            if let Some(depth) = tx.confirmations {
                existing.confirmations = Some(depth.max(existing.depth()));
            }
            if existing.sender.is_none() {
                existing.sender = tx.sender;
            }

            return RecordOutcome {
                total: self.total,
                newly_recorded: false,
            };
        }

        self.total = self.total.saturating_add(tx.amount_sats);
        self.order.push(tx.txid.clone());
        self.transactions.insert(tx.txid.clone(), tx);

        RecordOutcome {
            total: self.total,
            newly_recorded: true,
        }
    }

    /// Sum of all distinct recorded transactions
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Sum of transactions at least `min_confirmations` deep
    pub fn confirmed_total(&self, min_confirmations: u32) -> u64 {
        self.transactions
            .values()
            .filter(|tx| tx.depth() >= min_confirmations)
            .map(|tx| tx.amount_sats)
            .fold(0u64, |acc, amount| acc.saturating_add(amount))
    }

    /// Shallowest depth among transactions meeting `min_confirmations`
    pub fn min_depth(&self, min_confirmations: u32) -> Option<u32> {
        self.transactions
            .values()
            .map(|tx| tx.depth())
            .filter(|depth| *depth >= min_confirmations)
            .min()
    }

    /// Distinct sender addresses, in first-seen order
    pub fn senders(&self) -> Vec<String> {
        let mut senders: Vec<String> = Vec::new();
        for txid in &self.order {
            if let Some(sender) = self.transactions.get(txid).and_then(|tx| tx.sender.as_ref()) {
                if !senders.contains(sender) {
                    senders.push(sender.clone());
                }
            }
        }
        senders
    }

    pub fn get(&self, txid: &str) -> Option<&ObservedTransaction> {
        self.transactions.get(txid)
    }

    pub fn contains(&self, txid: &str) -> bool {
        self.transactions.contains_key(txid)
    }

    /// Recorded transactions in first-seen order
    pub fn transactions(&self) -> impl Iterator<Item = &ObservedTransaction> {
        self.order.iter().filter_map(|txid| self.transactions.get(txid))
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates_distinct_transactions() {
        let mut ledger = TransactionLedger::new();

        let first = ledger.record(ObservedTransaction::new("tx1", 60_000));
        assert_eq!(first, RecordOutcome { total: 60_000, newly_recorded: true });

        let second = ledger.record(ObservedTransaction::new("tx2", 50_000));
        assert_eq!(second.total, 110_000);
        assert!(second.newly_recorded);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_replay_never_double_counts() {
        let mut ledger = TransactionLedger::new();
        ledger.record(ObservedTransaction::new("tx1", 10_000));

        for _ in 0..5 {
            let outcome = ledger.record(ObservedTransaction::new("tx1", 10_000));
            assert!(!outcome.newly_recorded);
            assert_eq!(outcome.total, 10_000);
        }

        // Even a replay claiming a different amount is ignored
        ledger.record(ObservedTransaction::new("tx1", 99_999));
        assert_eq!(ledger.total(), 10_000);
        assert_eq!(ledger.get("tx1").unwrap().amount_sats, 10_000);
    }

    #[test]
    fn test_replay_advances_depth_only() {
        let mut ledger = TransactionLedger::new();
        ledger.record(ObservedTransaction::new("tx1", 10_000));
        assert_eq!(ledger.confirmed_total(1), 0);

        ledger.record(ObservedTransaction::new("tx1", 10_000).with_confirmations(3));
        assert_eq!(ledger.get("tx1").unwrap().depth(), 3);
        assert_eq!(ledger.confirmed_total(3), 10_000);

        // Depth never goes backwards
        ledger.record(ObservedTransaction::new("tx1", 10_000).with_confirmations(1));
        assert_eq!(ledger.get("tx1").unwrap().depth(), 3);
        assert_eq!(ledger.total(), 10_000);
    }

    #[test]
    fn test_confirmed_total_gates_on_depth() {
        let mut ledger = TransactionLedger::new();
        ledger.record(ObservedTransaction::new("deep", 70_000).with_confirmations(6));
        ledger.record(ObservedTransaction::new("shallow", 30_000).with_confirmations(2));
        ledger.record(ObservedTransaction::new("unknown", 5_000));

        assert_eq!(ledger.total(), 105_000);
        assert_eq!(ledger.confirmed_total(0), 105_000);
        assert_eq!(ledger.confirmed_total(2), 100_000);
        assert_eq!(ledger.confirmed_total(6), 70_000);
        assert_eq!(ledger.confirmed_total(7), 0);

        assert_eq!(ledger.min_depth(2), Some(2));
        assert_eq!(ledger.min_depth(7), None);
    }

    #[test]
    fn test_senders_in_first_seen_order() {
        let mut ledger = TransactionLedger::new();
        ledger.record(ObservedTransaction::new("a", 1).with_sender("tb1qalice"));
        ledger.record(ObservedTransaction::new("b", 1).with_sender("tb1qbob"));
        ledger.record(ObservedTransaction::new("c", 1).with_sender("tb1qalice"));
        ledger.record(ObservedTransaction::new("d", 1));

        assert_eq!(ledger.senders(), vec!["tb1qalice".to_string(), "tb1qbob".to_string()]);
        let ids: Vec<&str> = ledger.transactions().map(|tx| tx.txid.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }
}
