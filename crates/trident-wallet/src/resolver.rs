//! Per-party key resolution
//!
//! Resolves a wallet-relative path to the three parties' derived keys. The
//! key-index is carried by the path's leading hardened step, so resolving an
//! old address automatically uses the cosigner key set that was active when
//! the address was created.

use std::collections::HashMap;
use std::sync::Mutex;

use bitcoin::bip32::Xpub;
use bitcoin::secp256k1::{All, Secp256k1};
use thiserror::Error;

use trident_core::{DerivationError, KeyNode, PathError, WalletPath};

use crate::wallet::Wallet;

/// One of the three signing parties of a wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Party {
    Primary,
    Backup,
    Cosigner(u32),
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("No key registered for key index {0}")]
    UnknownKeyIndex(u32),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Derivation(#[from] DerivationError),
}

/// The three parties' public keys derived at one path.
#[derive(Debug, Clone)]
pub struct ResolvedKeys {
    /// Cosigner key set the path selects (its leading hardened step)
    pub key_index: u32,
    pub primary: KeyNode,
    pub backup: KeyNode,
    pub cosigner: KeyNode,
}

/// Derivation cache key: (wallet identity, path, key-index). Keying by all
/// three avoids cross-wallet and cross-key-index collisions.
type CacheKey = (String, WalletPath, u32);

pub struct PathResolver {
    secp: Secp256k1<All>,
    cache: Mutex<HashMap<CacheKey, ResolvedKeys>>,
}

impl Default for PathResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PathResolver {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }

    /// Derive primary, backup and cosigner keys at `path`.
    ///
    /// The cache is an optimization only; a miss re-derives and the result is
    /// bit-identical every time.
    pub fn resolve(&self, wallet: &Wallet, path: &WalletPath) -> Result<ResolvedKeys, ResolveError> {
        let key_index = path.key_index()?;
        let cache_key = (wallet.identifier().to_string(), path.clone(), key_index);

        if let Some(hit) = self.cache.lock().expect("resolver cache poisoned").get(&cache_key) {
            return Ok(hit.clone());
        }

        let resolved = ResolvedKeys {
            key_index,
            primary: self.derive_account(wallet.primary_key(key_index), key_index, path)?,
            backup: self.derive_backup(wallet.backup_key(), path)?,
            cosigner: self.derive_account(wallet.cosigner_key(key_index), key_index, path)?,
        };

        self.cache
            .lock()
            .expect("resolver cache poisoned")
            .insert(cache_key, resolved.clone());
        Ok(resolved)
    }

    /// Primary and cosigner keys are account-level (already at
    /// `m/<key_index>'`); only the path remainder is derived, publicly.
    fn derive_account(
        &self,
        account: Option<&Xpub>,
        key_index: u32,
        path: &WalletPath,
    ) -> Result<KeyNode, ResolveError> {
        let account = account.ok_or(ResolveError::UnknownKeyIndex(key_index))?;
        let node = KeyNode::from_xpub(*account);
        Ok(node.derive(&self.secp, &path.remainder())?)
    }

    /// The backup party holds a master public key only, so it derives along
    /// the fully-unhardened shadow of the path.
    fn derive_backup(&self, master: &Xpub, path: &WalletPath) -> Result<KeyNode, ResolveError> {
        let node = KeyNode::from_xpub(*master);
        Ok(node.derive(&self.secp, &path.unhardened().to_derivation_path())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::testkit;

    #[test]
    fn test_resolution_is_deterministic() {
        let fixture = testkit::fixture();
        let resolver = PathResolver::new();
        let path = WalletPath::address(fixture.wallet.key_index(), 0, 0).unwrap();

        let a = resolver.resolve(&fixture.wallet, &path).unwrap();
        let b = resolver.resolve(&fixture.wallet, &path).unwrap();
        assert_eq!(a.primary.public_key(), b.primary.public_key());
        assert_eq!(a.backup.public_key(), b.backup.public_key());
        assert_eq!(a.cosigner.public_key(), b.cosigner.public_key());

        // A fresh resolver (cold cache) re-derives bit-identical keys
        let cold = PathResolver::new();
        let c = cold.resolve(&fixture.wallet, &path).unwrap();
        assert_eq!(a.primary.public_key(), c.primary.public_key());
        assert_eq!(a.cosigner.public_key(), c.cosigner.public_key());
    }

    #[test]
    fn test_parties_derive_distinct_keys() {
        let fixture = testkit::fixture();
        let resolver = PathResolver::new();
        let path = WalletPath::address(fixture.wallet.key_index(), 0, 1).unwrap();

        let keys = resolver.resolve(&fixture.wallet, &path).unwrap();
        assert_ne!(keys.primary.public_key(), keys.backup.public_key());
        assert_ne!(keys.primary.public_key(), keys.cosigner.public_key());
        assert_ne!(keys.backup.public_key(), keys.cosigner.public_key());
    }

    #[test]
    fn test_unknown_key_index_rejected() {
        let fixture = testkit::fixture();
        let resolver = PathResolver::new();
        let path = WalletPath::address(42, 0, 0).unwrap();

        let err = resolver.resolve(&fixture.wallet, &path).unwrap_err();
        assert!(matches!(err, ResolveError::UnknownKeyIndex(42)));
    }

    #[test]
    fn test_backup_matches_private_derivation() {
        // Deriving the backup master privately along the unhardened path must
        // agree with the public-only derivation the resolver performs.
        let fixture = testkit::fixture();
        let resolver = PathResolver::new();
        let path = WalletPath::address(fixture.wallet.key_index(), 0, 3).unwrap();

        let keys = resolver.resolve(&fixture.wallet, &path).unwrap();

        let secp = Secp256k1::new();
        let backup_node = KeyNode::from_xpriv(&secp, fixture.backup_master);
        let expected = backup_node
            .derive(&secp, &path.unhardened().to_derivation_path())
            .unwrap();
        assert_eq!(keys.backup.public_key(), expected.public_key());
    }
}
