//! Address Provisioner
//!
//! Generates a fresh receiving keypair and P2WPKH address for a payment, or
//! validates a caller-supplied address. Supplied addresses carry no key
//! material, so funds sent to them cannot be forwarded.
//!
//! Secret material lives in [`ReceiverKeys`], which zeroizes itself on drop.

use bitcoin::{Address, CompressedPublicKey};
use rand::rngs::OsRng;
use rand::RngCore;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::Network;

/// Draws before giving up on getting a valid secp256k1 scalar
const MAX_KEYGEN_ATTEMPTS: usize = 8;

/// Key generation errors
#[derive(Debug, Clone, Error)]
pub enum KeyGenerationError {
    #[error("randomness source unavailable: {0}")]
    RandomnessUnavailable(String),

    #[error("no valid secret key after {0} attempts")]
    Exhausted(usize),
}

/// Address validation errors
#[derive(Debug, Clone, Error)]
#[error("invalid address {address}: {reason}")]
pub struct AddressError {
    pub address: String,
    pub reason: String,
}

/// Source of secret randomness for key generation
pub trait RandomSource: Send + Sync {
    fn fill(&self, buf: &mut [u8]) -> Result<(), KeyGenerationError>;
}

/// Operating system CSPRNG
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill(&self, buf: &mut [u8]) -> Result<(), KeyGenerationError> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|e| KeyGenerationError::RandomnessUnavailable(e.to_string()))
    }
}

/// Receiver keypair; the secret is wiped when this is dropped
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ReceiverKeys {
    secret: [u8; 32],
    #[zeroize(skip)]
    public_key: [u8; 33],
    #[zeroize(skip)]
    address: String,
}

impl ReceiverKeys {
    /// Receiving address derived from the public key
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Compressed public key (hex)
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key)
    }

    pub fn public_key(&self) -> Result<PublicKey, secp256k1::Error> {
        PublicKey::from_slice(&self.public_key)
    }

    pub fn secret_key(&self) -> Result<SecretKey, secp256k1::Error> {
        SecretKey::from_slice(&self.secret)
    }
}

impl std::fmt::Debug for ReceiverKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverKeys")
            .field("address", &self.address)
            .field("public_key", &self.public_key_hex())
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Generates receiving addresses
pub struct AddressProvisioner {
    random: Arc<dyn RandomSource>,
    secp: Secp256k1<secp256k1::All>,
}

impl Default for AddressProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressProvisioner {
    /// Provisioner backed by the OS random source
    pub fn new() -> Self {
        Self::with_random(Arc::new(OsRandom))
    }

    /// Provisioner with a custom random source
    pub fn with_random(random: Arc<dyn RandomSource>) -> Self {
        Self {
            random,
            secp: Secp256k1::new(),
        }
    }

    /// Generate a new keypair and its P2WPKH address on `network`
    pub fn provision(&self, network: Network) -> Result<ReceiverKeys, KeyGenerationError> {
        let mut seed = Zeroizing::new([0u8; 32]);

        for _ in 0..MAX_KEYGEN_ATTEMPTS {
            self.random.fill(seed.as_mut())?;

            // Zero or >= curve order; draw again
            let Ok(secret_key) = SecretKey::from_slice(seed.as_ref()) else {
                continue;
            };

            let public_key = PublicKey::from_secret_key(&self.secp, &secret_key);
            let address =
                Address::p2wpkh(&CompressedPublicKey(public_key), network.bitcoin_network());

            return Ok(ReceiverKeys {
                secret: secret_key.secret_bytes(),
                public_key: public_key.serialize(),
                address: address.to_string(),
            });
        }

        Err(KeyGenerationError::Exhausted(MAX_KEYGEN_ATTEMPTS))
    }

    /// Accept a caller-supplied receiver address. No keys are generated.
    pub fn accept(address: &str, network: Network) -> Result<String, AddressError> {
        parse_address(address, network).map(|a| a.to_string())
    }
}

/// Parse `address` and require it to belong to `network`
pub fn parse_address(address: &str, network: Network) -> Result<Address, AddressError> {
    let invalid = |reason: String| AddressError {
        address: address.to_string(),
        reason,
    };

    Address::from_str(address.trim())
        .map_err(|e| invalid(e.to_string()))?
        .require_network(network.bitcoin_network())
        .map_err(|e| invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Repeats a fixed byte
    struct FixedRandom(u8);

    impl RandomSource for FixedRandom {
        fn fill(&self, buf: &mut [u8]) -> Result<(), KeyGenerationError> {
            buf.fill(self.0);
            Ok(())
        }
    }

    struct BrokenRandom;

    impl RandomSource for BrokenRandom {
        fn fill(&self, _buf: &mut [u8]) -> Result<(), KeyGenerationError> {
            Err(KeyGenerationError::RandomnessUnavailable("no entropy".to_string()))
        }
    }

    #[test]
    fn test_provision_testnet_address() {
        let keys = AddressProvisioner::new().provision(Network::Testnet).unwrap();
        assert!(keys.address().starts_with("tb1q"));
        assert_eq!(keys.public_key_hex().len(), 66);
        assert!(parse_address(keys.address(), Network::Testnet).is_ok());
    }

    #[test]
    fn test_provision_mainnet_address() {
        let keys = AddressProvisioner::new().provision(Network::Mainnet).unwrap();
        assert!(keys.address().starts_with("bc1q"));
    }

    #[test]
    fn test_fresh_keys_each_time() {
        let provisioner = AddressProvisioner::new();
        let a = provisioner.provision(Network::Testnet).unwrap();
        let b = provisioner.provision(Network::Testnet).unwrap();
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn test_keys_match_address() {
        let provisioner = AddressProvisioner::with_random(Arc::new(FixedRandom(0x11)));
        let keys = provisioner.provision(Network::Testnet).unwrap();

        let secp = Secp256k1::new();
        let derived = PublicKey::from_secret_key(&secp, &keys.secret_key().unwrap());
        assert_eq!(derived, keys.public_key().unwrap());

        // Deterministic for a deterministic source
        let again = provisioner.provision(Network::Testnet).unwrap();
        assert_eq!(keys.address(), again.address());
    }

    #[test]
    fn test_broken_randomness_is_fatal() {
        let provisioner = AddressProvisioner::with_random(Arc::new(BrokenRandom));
        let result = provisioner.provision(Network::Testnet);
        assert!(matches!(result, Err(KeyGenerationError::RandomnessUnavailable(_))));
    }

    #[test]
    fn test_invalid_scalar_exhausts() {
        // All-zero bytes are never a valid secret key
        let provisioner = AddressProvisioner::with_random(Arc::new(FixedRandom(0)));
        let result = provisioner.provision(Network::Testnet);
        assert!(matches!(result, Err(KeyGenerationError::Exhausted(_))));
    }

    #[test]
    fn test_accept_address() {
        let addr = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";
        assert_eq!(AddressProvisioner::accept(addr, Network::Testnet).unwrap(), addr);

        // Wrong network
        assert!(AddressProvisioner::accept(addr, Network::Mainnet).is_err());
        // Garbage
        assert!(AddressProvisioner::accept("not-an-address", Network::Testnet).is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let keys = AddressProvisioner::with_random(Arc::new(FixedRandom(0x22)))
            .provision(Network::Testnet)
            .unwrap();
        let printed = format!("{:?}", keys);
        assert!(printed.contains("<redacted>"));
        assert!(!printed.contains(&"22".repeat(32)));
    }
}
