//! Esplora API Client
//!
//! HTTP implementations of the payment collaborators:
//! - [`EsploraClient`] answers balance and address-history queries
//!   ([`ChainService`]) and signs and broadcasts send-all transfers out of a
//!   P2WPKH receiver ([`Broadcaster`])
//! - [`EsploraFeed`] turns address polling into a live transaction feed
//!   ([`TransactionFeed`])

use async_trait::async_trait;
use bitcoin::{
    absolute::LockTime,
    hashes::Hash,
    secp256k1::{Message, Secp256k1},
    sighash::SighashCache,
    transaction::Version,
    Amount, CompressedPublicKey, EcdsaSighashType, OutPoint, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Txid, Witness,
};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Network;
use crate::payment::{
    parse_address, BalanceQueryError, Broadcaster, ChainService, ConnectionError, FeedEvent,
    ObservedTransaction, ReceiverKeys, TransactionFeed, TransferError, TransferOrder,
};

/// Esplora API endpoints
pub const MAINNET_URL: &str = "https://blockstream.info/api";
pub const TESTNET_URL: &str = "https://blockstream.info/testnet/api";

/// Outputs below this are not relayed
const DUST_LIMIT_SATS: u64 = 546;

/// Esplora error types
#[derive(Debug, thiserror::Error)]
pub enum EsploraError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("address not found: {0}")]
    AddressNotFound(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("broadcast failed: {0}")]
    BroadcastFailed(String),
}

impl From<EsploraError> for BalanceQueryError {
    fn from(e: EsploraError) -> Self {
        match e {
            EsploraError::Http(e) => BalanceQueryError::Unreachable(e.to_string()),
            other => BalanceQueryError::InvalidResponse(other.to_string()),
        }
    }
}

/// Spendable output at an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    /// None while unconfirmed
    pub block_height: Option<u64>,
}

/// Esplora HTTP client
#[derive(Debug, Clone)]
pub struct EsploraClient {
    client: Client,
    base_url: String,
    /// Forwarding fee rate (sat/vB)
    fee_rate: u64,
}

impl EsploraClient {
    /// Create a new client with custom URL
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            fee_rate: Network::Testnet.default_fee_rate(),
        }
    }

    /// Client for the network's default endpoint and fee rate
    pub fn for_network(network: Network) -> Self {
        Self::new(network.default_esplora_url()).with_fee_rate(network.default_fee_rate())
    }

    pub fn with_fee_rate(mut self, fee_rate: u64) -> Self {
        self.fee_rate = fee_rate.max(1);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn fee_rate(&self) -> u64 {
        self.fee_rate
    }

    /// Get current blockchain tip height
    pub async fn get_tip_height(&self) -> Result<u64, EsploraError> {
        let url = format!("{}/blocks/tip/height", self.base_url);
        let resp = self.client.get(&url).send().await?;

        resp.text()
            .await?
            .trim()
            .parse()
            .map_err(|e| EsploraError::ParseError(format!("invalid height: {}", e)))
    }

    /// Get funding statistics for an address
    pub async fn get_address_info(&self, address: &str) -> Result<EsploraAddressInfo, EsploraError> {
        let url = format!("{}/address/{}", self.base_url, address);
        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            return Err(EsploraError::AddressNotFound(address.to_string()));
        }

        Ok(resp.json().await?)
    }

    /// Get unspent outputs at an address, including unconfirmed ones
    pub async fn get_utxos(&self, address: &str) -> Result<Vec<Utxo>, EsploraError> {
        let url = format!("{}/address/{}/utxo", self.base_url, address);
        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            return Err(EsploraError::AddressNotFound(address.to_string()));
        }

        let raw: Vec<EsploraUtxo> = resp.json().await?;
        Ok(raw
            .into_iter()
            .map(|u| Utxo {
                txid: u.txid,
                vout: u.vout,
                value: u.value,
                block_height: u.status.block_height,
            })
            .collect())
    }

    /// Get recent transactions touching an address (mempool first)
    pub async fn get_address_txs(&self, address: &str) -> Result<Vec<EsploraTx>, EsploraError> {
        let url = format!("{}/address/{}/txs", self.base_url, address);
        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            return Err(EsploraError::AddressNotFound(address.to_string()));
        }

        Ok(resp.json().await?)
    }

    /// Transactions paying into `address`, with their depth
    pub async fn incoming_transactions(
        &self,
        address: &str,
    ) -> Result<Vec<ObservedTransaction>, EsploraError> {
        let txs = self.get_address_txs(address).await?;
        let tip = self.get_tip_height().await?;

        Ok(txs
            .iter()
            .filter_map(|tx| incoming_transaction(tx, address, tip))
            .collect())
    }

    /// Broadcast a raw transaction
    pub async fn broadcast_tx(&self, tx_hex: &str) -> Result<String, EsploraError> {
        let url = format!("{}/tx", self.base_url);
        let resp = self.client.post(&url).body(tx_hex.to_string()).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(EsploraError::BroadcastFailed(error_text));
        }

        Ok(resp.text().await?.trim().to_string())
    }
}

#[async_trait]
impl ChainService for EsploraClient {
    async fn balance(&self, address: &str, _network: Network) -> Result<u64, BalanceQueryError> {
        let info = self.get_address_info(address).await?;
        Ok(info.balance())
    }

    async fn address_transactions(
        &self,
        address: &str,
        _network: Network,
    ) -> Result<Vec<ObservedTransaction>, BalanceQueryError> {
        Ok(self.incoming_transactions(address).await?)
    }
}

#[async_trait]
impl Broadcaster for EsploraClient {
    async fn send_all(&self, order: &TransferOrder<'_>) -> Result<String, TransferError> {
        let utxos = self
            .get_utxos(order.from)
            .await
            .map_err(BalanceQueryError::from)?;

        let total: u64 = utxos.iter().map(|u| u.value).sum();
        if total != order.amount_sats {
            debug!(
                target: "paywatch::forward",
                queried = order.amount_sats,
                spendable = total,
                "balance moved since query, spending current outputs"
            );
        }

        let signed = build_send_all(&utxos, order.keys, order.to, order.network, self.fee_rate)?;

        info!(
            target: "paywatch::forward",
            from = %order.from,
            to = %order.to,
            inputs = utxos.len(),
            amount_sats = signed.amount_sats,
            fee_sats = signed.fee_sats,
            "broadcasting send-all transaction"
        );

        self.broadcast_tx(&signed.tx_hex)
            .await
            .map_err(|e| TransferError::Broadcast(e.to_string()))
    }
}

/// Signed transfer ready for broadcast
#[derive(Debug, Clone)]
pub struct SignedTransfer {
    pub tx_hex: String,
    pub txid: String,
    /// Amount reaching the destination
    pub amount_sats: u64,
    pub fee_sats: u64,
}

/// Virtual size of a P2WPKH spend with one P2WPKH/P2TR-sized output
pub fn estimate_vsize(inputs: usize) -> u64 {
    // 10.5 overhead + 68 per input + 31 output, rounded up
    (21 + 136 * inputs as u64 + 62).div_ceil(2)
}

/// Build and sign a transaction spending every UTXO to `destination`
pub fn build_send_all(
    utxos: &[Utxo],
    keys: &ReceiverKeys,
    destination: &str,
    network: Network,
    fee_rate: u64,
) -> Result<SignedTransfer, TransferError> {
    let to_address = parse_address(destination, network)
        .map_err(|e| TransferError::InvalidDestination(e.to_string()))?;

    if utxos.is_empty() {
        return Err(TransferError::Broadcast("no spendable outputs".to_string()));
    }

    let total: u64 = utxos.iter().map(|u| u.value).sum();
    let fee = estimate_vsize(utxos.len()) * fee_rate;
    let send_amount = total.saturating_sub(fee);
    if send_amount < DUST_LIMIT_SATS {
        return Err(TransferError::BelowDust { amount: total, fee });
    }

    let inputs = utxos
        .iter()
        .map(|utxo| {
            let txid = Txid::from_str(&utxo.txid)
                .map_err(|e| TransferError::Signing(format!("invalid txid {}: {}", utxo.txid, e)))?;
            Ok(TxIn {
                previous_output: OutPoint {
                    txid,
                    vout: utxo.vout,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
        })
        .collect::<Result<Vec<_>, TransferError>>()?;

    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs,
        output: vec![TxOut {
            value: Amount::from_sat(send_amount),
            script_pubkey: to_address.script_pubkey(),
        }],
    };

    sign_p2wpkh_inputs(&mut tx, utxos, keys)?;

    Ok(SignedTransfer {
        tx_hex: bitcoin::consensus::encode::serialize_hex(&tx),
        txid: tx.compute_txid().to_string(),
        amount_sats: send_amount,
        fee_sats: fee,
    })
}

/// Sign every input as a P2WPKH spend of `keys`
fn sign_p2wpkh_inputs(
    tx: &mut Transaction,
    utxos: &[Utxo],
    keys: &ReceiverKeys,
) -> Result<(), TransferError> {
    let secp = Secp256k1::new();
    let secret_key = keys
        .secret_key()
        .map_err(|e| TransferError::Signing(format!("invalid secret key: {}", e)))?;
    let public_key = keys
        .public_key()
        .map_err(|e| TransferError::Signing(format!("invalid public key: {}", e)))?;

    let script_pubkey = ScriptBuf::new_p2wpkh(&CompressedPublicKey(public_key).wpubkey_hash());

    let mut witnesses = Vec::with_capacity(utxos.len());
    {
        let mut cache = SighashCache::new(&*tx);
        for (index, utxo) in utxos.iter().enumerate() {
            let sighash = cache
                .p2wpkh_signature_hash(
                    index,
                    &script_pubkey,
                    Amount::from_sat(utxo.value),
                    EcdsaSighashType::All,
                )
                .map_err(|e| TransferError::Signing(format!("sighash failed: {}", e)))?;

            let msg = Message::from_digest(sighash.to_byte_array());
            let signature = bitcoin::ecdsa::Signature {
                signature: secp.sign_ecdsa(&msg, &secret_key),
                sighash_type: EcdsaSighashType::All,
            };
            witnesses.push(Witness::p2wpkh(&signature, &public_key));
        }
    }

    for (input, witness) in tx.input.iter_mut().zip(witnesses) {
        input.witness = witness;
    }

    Ok(())
}

/// Convert an Esplora transaction to what it paid into `address`.
/// `None` if nothing was paid to the address.
pub fn incoming_transaction(tx: &EsploraTx, address: &str, tip_height: u64) -> Option<ObservedTransaction> {
    let amount: u64 = tx
        .vout
        .iter()
        .filter(|out| out.scriptpubkey_address.as_deref() == Some(address))
        .map(|out| out.value)
        .sum();

    if amount == 0 {
        return None;
    }

    let confirmations = match tx.status.block_height {
        Some(height) if tx.status.confirmed => {
            tip_height.saturating_sub(height).saturating_add(1) as u32
        }
        _ => 0,
    };

    let mut observed = ObservedTransaction::new(tx.txid.clone(), amount).with_confirmations(confirmations);
    if let Some(sender) = tx
        .vin
        .iter()
        .filter_map(|input| input.prevout.as_ref())
        .find_map(|prevout| prevout.scriptpubkey_address.clone())
    {
        observed = observed.with_sender(sender);
    }

    Some(observed)
}

/// Live feed backed by periodic address polling
pub struct EsploraFeed {
    client: EsploraClient,
    interval: Duration,
    watches: Mutex<HashMap<String, CancellationToken>>,
}

impl EsploraFeed {
    pub fn new(client: EsploraClient, interval: Duration) -> Self {
        Self {
            client,
            interval: interval.max(Duration::from_secs(1)),
            watches: Mutex::new(HashMap::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[async_trait]
impl TransactionFeed for EsploraFeed {
    async fn connect(&self, network: Network) -> Result<(), ConnectionError> {
        let height = self
            .client
            .get_tip_height()
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;

        info!(target: "paywatch::feed", %network, url = %self.client.base_url(), height, "connected to esplora");
        Ok(())
    }

    async fn listen(&self, address: &str) -> Result<mpsc::Receiver<FeedEvent>, ConnectionError> {
        let (sender, receiver) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let previous = self
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.to_string(), cancel.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let client = self.client.clone();
        let period = self.interval;
        let address = address.to_string();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // txid -> last reported depth
            let mut reported: HashMap<String, u32> = HashMap::new();

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let events: Vec<FeedEvent> = match client.incoming_transactions(&address).await {
                    Ok(transactions) => transactions
                        .into_iter()
                        .filter(|tx| {
                            let depth = tx.depth();
                            match reported.insert(tx.txid.clone(), depth) {
                                Some(previous) => depth > previous,
                                None => true,
                            }
                        })
                        .map(FeedEvent::Transaction)
                        .collect(),
                    Err(e) => {
                        warn!(target: "paywatch::feed", %address, error = %e, "feed poll failed");
                        vec![FeedEvent::Failure(e.to_string())]
                    }
                };

                for event in events {
                    if sender.send(event).await.is_err() {
                        return;
                    }
                }
            }

            debug!(target: "paywatch::feed", %address, "esplora poller stopped");
        });

        Ok(receiver)
    }

    async fn teardown(&self, address: &str) {
        let watch = self
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
        if let Some(cancel) = watch {
            cancel.cancel();
        }
    }
}

// =============================================================================
// Esplora API Response Types
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EsploraAddressInfo {
    #[serde(default)]
    pub chain_stats: AddressStats,
    #[serde(default)]
    pub mempool_stats: AddressStats,
}

impl EsploraAddressInfo {
    /// Confirmed plus unconfirmed balance
    pub fn balance(&self) -> u64 {
        let funded = self
            .chain_stats
            .funded_txo_sum
            .saturating_add(self.mempool_stats.funded_txo_sum);
        let spent = self
            .chain_stats
            .spent_txo_sum
            .saturating_add(self.mempool_stats.spent_txo_sum);
        funded.saturating_sub(spent)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddressStats {
    #[serde(default)]
    pub funded_txo_sum: u64,
    #[serde(default)]
    pub spent_txo_sum: u64,
    #[serde(default)]
    pub tx_count: u32,
}

#[derive(Debug, Deserialize)]
pub struct EsploraUtxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    pub status: EsploraTxStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EsploraTxStatus {
    pub confirmed: bool,
    pub block_height: Option<u64>,
    pub block_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EsploraTx {
    pub txid: String,
    #[serde(default)]
    pub vin: Vec<EsploraTxInput>,
    #[serde(default)]
    pub vout: Vec<EsploraTxOutput>,
    pub status: EsploraTxStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EsploraTxInput {
    pub txid: String,
    pub vout: u32,
    pub prevout: Option<EsploraTxOutput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EsploraTxOutput {
    pub scriptpubkey_address: Option<String>,
    pub value: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::AddressProvisioner;

    const DESTINATION: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";

    fn sample_tx(receiver: &str) -> EsploraTx {
        serde_json::from_value(serde_json::json!({
            "txid": "aa".repeat(32),
            "vin": [{
                "txid": "bb".repeat(32),
                "vout": 0,
                "prevout": { "scriptpubkey_address": "tb1qsender", "value": 80_000 }
            }],
            "vout": [
                { "scriptpubkey_address": receiver, "value": 60_000 },
                { "scriptpubkey_address": "tb1qchange", "value": 19_000 }
            ],
            "status": { "confirmed": true, "block_height": 100, "block_hash": null }
        }))
        .unwrap()
    }

    fn utxo(value: u64, vout: u32) -> Utxo {
        Utxo {
            txid: "cc".repeat(32),
            vout,
            value,
            block_height: Some(100),
        }
    }

    #[test]
    fn test_client_urls() {
        assert_eq!(EsploraClient::for_network(Network::Mainnet).base_url(), MAINNET_URL);
        assert_eq!(EsploraClient::for_network(Network::Testnet).base_url(), TESTNET_URL);
        assert_eq!(EsploraClient::new("http://localhost:3000/").base_url(), "http://localhost:3000");
        assert_eq!(EsploraClient::for_network(Network::Mainnet).fee_rate(), 10);
    }

    #[test]
    fn test_balance_includes_mempool() {
        let info: EsploraAddressInfo = serde_json::from_value(serde_json::json!({
            "chain_stats": { "funded_txo_sum": 100_000, "spent_txo_sum": 40_000, "tx_count": 2 },
            "mempool_stats": { "funded_txo_sum": 5_000, "spent_txo_sum": 0, "tx_count": 1 }
        }))
        .unwrap();
        assert_eq!(info.balance(), 65_000);
    }

    #[test]
    fn test_incoming_transaction() {
        let tx = sample_tx("tb1qreceiver");

        let observed = incoming_transaction(&tx, "tb1qreceiver", 105).unwrap();
        assert_eq!(observed.amount_sats, 60_000);
        assert_eq!(observed.confirmations, Some(6));
        assert_eq!(observed.sender.as_deref(), Some("tb1qsender"));

        // Paid nothing to this address
        assert!(incoming_transaction(&tx, "tb1qsomeoneelse", 105).is_none());
    }

    #[test]
    fn test_unconfirmed_has_zero_depth() {
        let mut tx = sample_tx("tb1qreceiver");
        tx.status = EsploraTxStatus {
            confirmed: false,
            block_height: None,
            block_hash: None,
        };
        let observed = incoming_transaction(&tx, "tb1qreceiver", 105).unwrap();
        assert_eq!(observed.depth(), 0);
    }

    #[test]
    fn test_vsize_estimate() {
        assert_eq!(estimate_vsize(1), 110);
        assert_eq!(estimate_vsize(2), 178);
    }

    #[test]
    fn test_build_send_all() {
        let keys = AddressProvisioner::new().provision(Network::Testnet).unwrap();
        let utxos = vec![utxo(60_000, 0), utxo(50_000, 1)];

        let signed = build_send_all(&utxos, &keys, DESTINATION, Network::Testnet, 2).unwrap();
        assert_eq!(signed.fee_sats, 178 * 2);
        assert_eq!(signed.amount_sats, 110_000 - 356);
        assert_eq!(signed.txid.len(), 64);

        let tx: Transaction =
            bitcoin::consensus::encode::deserialize(&hex::decode(&signed.tx_hex).unwrap()).unwrap();
        assert_eq!(tx.input.len(), 2);
        assert_eq!(tx.output.len(), 1);
        // Signature + pubkey in every witness
        assert!(tx.input.iter().all(|input| input.witness.len() == 2));
    }

    #[test]
    fn test_send_all_rejects_dust() {
        let keys = AddressProvisioner::new().provision(Network::Testnet).unwrap();
        let result = build_send_all(&[utxo(600, 0)], &keys, DESTINATION, Network::Testnet, 2);
        assert!(matches!(result, Err(TransferError::BelowDust { amount: 600, .. })));
    }

    #[test]
    fn test_send_all_requires_outputs() {
        let keys = AddressProvisioner::new().provision(Network::Testnet).unwrap();
        assert!(build_send_all(&[], &keys, DESTINATION, Network::Testnet, 2).is_err());
        assert!(matches!(
            build_send_all(&[utxo(10_000, 0)], &keys, DESTINATION, Network::Mainnet, 2),
            Err(TransferError::InvalidDestination(_))
        ));
    }

    #[tokio::test]
    #[ignore = "requires network access"]
    async fn test_get_tip_height() {
        let client = EsploraClient::for_network(Network::Testnet);
        let height = client.get_tip_height().await;
        assert!(height.unwrap() > 0);
    }
}
