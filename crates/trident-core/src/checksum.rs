//! Wallet checksum
//!
//! The checksum is the legacy P2PKH address of the primary party's master
//! public key. It fingerprints the key material behind a wallet identity and
//! is verified on every unlock, so a passphrase typo or a swapped backup can
//! never produce signatures with the wrong key.

use bitcoin::bip32::Xpub;
use bitcoin::{Address, NetworkKind, PublicKey};

/// Compute the checksum for a primary master public key.
pub fn wallet_checksum(master: &Xpub, network: impl Into<NetworkKind>) -> String {
    let pubkey = PublicKey::new(master.public_key);
    Address::p2pkh(pubkey, network).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed::{derive_seed, master_key, parse_mnemonic};
    use bitcoin::secp256k1::Secp256k1;

    #[test]
    fn test_checksum_is_stable() {
        let secp = Secp256k1::new();
        let mnemonic = parse_mnemonic(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
        )
        .unwrap();
        let seed = derive_seed(&mnemonic, "");
        let master = master_key(&seed, NetworkKind::Test).unwrap();
        let xpub = Xpub::from_priv(&secp, &master);

        let a = wallet_checksum(&xpub, NetworkKind::Test);
        let b = wallet_checksum(&xpub, NetworkKind::Test);
        assert_eq!(a, b);
    }

    #[test]
    fn test_checksum_detects_different_keys() {
        let secp = Secp256k1::new();
        let m1 = parse_mnemonic(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
        )
        .unwrap();
        let m2 = parse_mnemonic("zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo wrong").unwrap();

        let x1 = Xpub::from_priv(&secp, &master_key(&derive_seed(&m1, ""), NetworkKind::Test).unwrap());
        let x2 = Xpub::from_priv(&secp, &master_key(&derive_seed(&m2, ""), NetworkKind::Test).unwrap());

        assert_ne!(
            wallet_checksum(&x1, NetworkKind::Test),
            wallet_checksum(&x2, NetworkKind::Test)
        );
    }
}
