//! BIP-39 seed management
//!
//! Mnemonic generation and seed derivation for the primary party. Seed bytes
//! are wrapped in `Zeroizing` so they are wiped when dropped.

use bip39::{Language, Mnemonic};
use bitcoin::bip32::Xpriv;
use bitcoin::NetworkKind;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum SeedError {
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("Master key derivation failed: {0}")]
    MasterKey(String),
}

/// Generate a new BIP-39 mnemonic (24 words)
pub fn generate_mnemonic() -> Result<Mnemonic, SeedError> {
    Mnemonic::generate_in(Language::English, 24)
        .map_err(|e| SeedError::InvalidMnemonic(e.to_string()))
}

/// Parse a mnemonic from words
pub fn parse_mnemonic(words: &str) -> Result<Mnemonic, SeedError> {
    Mnemonic::parse_in(Language::English, words)
        .map_err(|e| SeedError::InvalidMnemonic(e.to_string()))
}

/// Derive seed bytes from mnemonic (with optional passphrase)
pub fn derive_seed(mnemonic: &Mnemonic, passphrase: &str) -> Zeroizing<[u8; 64]> {
    Zeroizing::new(mnemonic.to_seed(passphrase))
}

/// Build the master extended private key for a network from a seed
pub fn master_key(
    seed: &Zeroizing<[u8; 64]>,
    network: impl Into<NetworkKind>,
) -> Result<Xpriv, SeedError> {
    Xpriv::new_master(network, seed.as_ref()).map_err(|e| SeedError::MasterKey(e.to_string()))
}
