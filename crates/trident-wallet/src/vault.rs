//! Key vault
//!
//! A two-state machine guarding the primary party's private key. The key is
//! held only while `Unlocked`; every signing access goes through
//! [`KeyVault::with_unlocked`] so private material's lifetime stays bounded
//! and auditable. The wallet checksum is verified on every unlock, so a
//! passphrase typo can never put the wrong key behind the vault.

use bitcoin::bip32::Xpriv;
use bitcoin::secp256k1::{Secp256k1, Signing};
use bitcoin::Network;
use thiserror::Error;

use trident_core::{derive_seed, master_key, parse_mnemonic, wallet_checksum, SeedError};

#[derive(Error, Debug)]
pub enum UnlockError {
    #[error("Checksum mismatch: key material does not belong to this wallet")]
    ChecksumMismatch,

    #[error(transparent)]
    Seed(#[from] SeedError),
}

#[derive(Error, Debug)]
#[error("Wallet is locked")]
pub struct WalletLockedError;

/// How the primary private key is supplied on unlock.
pub enum UnlockSecret {
    /// The raw master extended private key.
    PrivateKey(Xpriv),
    /// Regenerate the key from mnemonic and passphrase.
    Passphrase { mnemonic: String, passphrase: String },
}

enum State {
    Locked,
    Unlocked { master: Xpriv },
}

pub struct KeyVault {
    state: State,
    network: Network,
    checksum: String,
}

impl KeyVault {
    /// A new vault starts `Locked`.
    pub fn new(network: Network, checksum: String) -> Self {
        Self {
            state: State::Locked,
            network,
            checksum,
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self.state, State::Locked)
    }

    /// Unlock with the given secret.
    ///
    /// The checksum recomputed from the derived key must match the wallet's
    /// stored checksum; on mismatch the vault stays `Locked`.
    pub fn unlock<C: Signing>(
        &mut self,
        secp: &Secp256k1<C>,
        secret: UnlockSecret,
    ) -> Result<(), UnlockError> {
        let master = match secret {
            UnlockSecret::PrivateKey(xpriv) => xpriv,
            UnlockSecret::Passphrase {
                mnemonic,
                passphrase,
            } => {
                let mnemonic = parse_mnemonic(&mnemonic)?;
                // Seed bytes are Zeroizing; wiped as soon as this scope ends
                let seed = derive_seed(&mnemonic, &passphrase);
                master_key(&seed, self.network)?
            }
        };

        let xpub = bitcoin::bip32::Xpub::from_priv(secp, &master);
        if wallet_checksum(&xpub, self.network) != self.checksum {
            return Err(UnlockError::ChecksumMismatch);
        }

        self.state = State::Unlocked { master };
        Ok(())
    }

    /// Lock the vault. Always succeeds; the private key is dropped on the
    /// spot, not deferred.
    pub fn lock(&mut self) {
        self.state = State::Locked;
    }

    /// Run `f` with the primary master key, failing if the vault is locked.
    pub fn with_unlocked<T>(&self, f: impl FnOnce(&Xpriv) -> T) -> Result<T, WalletLockedError> {
        match &self.state {
            State::Unlocked { master } => Ok(f(master)),
            State::Locked => Err(WalletLockedError),
        }
    }
}
