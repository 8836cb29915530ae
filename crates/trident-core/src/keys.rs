//! HD key material
//!
//! `KeyNode` wraps an extended key pair: the public component is always
//! present, the private one only when the owner of the key loaded it.
//! Derivation is pure; deriving twice at the same path yields identical keys.

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::secp256k1::{Secp256k1, Signing, Verification};
use bitcoin::{NetworkKind, PrivateKey, PublicKey};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DerivationError {
    #[error("Hardened derivation requires the private key")]
    PrivateKeyRequired,

    #[error("BIP32 derivation failed: {0}")]
    Bip32(#[from] bitcoin::bip32::Error),
}

/// An HD key node: extended public key plus, optionally, the matching
/// extended private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNode {
    xpub: Xpub,
    xpriv: Option<Xpriv>,
}

impl KeyNode {
    /// Wrap a public-only node. Hardened derivation from it will fail.
    pub fn from_xpub(xpub: Xpub) -> Self {
        Self { xpub, xpriv: None }
    }

    /// Wrap a private node; the public component is computed from it.
    pub fn from_xpriv<C: Signing>(secp: &Secp256k1<C>, xpriv: Xpriv) -> Self {
        Self {
            xpub: Xpub::from_priv(secp, &xpriv),
            xpriv: Some(xpriv),
        }
    }

    /// Derive a child node at `path`.
    ///
    /// A hardened step anywhere in the path requires the private component;
    /// without it this fails with [`DerivationError::PrivateKeyRequired`].
    pub fn derive<C: Signing + Verification>(
        &self,
        secp: &Secp256k1<C>,
        path: &DerivationPath,
    ) -> Result<KeyNode, DerivationError> {
        let needs_private = path
            .into_iter()
            .any(|c| matches!(c, ChildNumber::Hardened { .. }));

        match &self.xpriv {
            Some(xpriv) => {
                let child = xpriv.derive_priv(secp, path)?;
                Ok(KeyNode::from_xpriv(secp, child))
            }
            None if needs_private => Err(DerivationError::PrivateKeyRequired),
            None => {
                let child = self.xpub.derive_pub(secp, path)?;
                Ok(KeyNode::from_xpub(child))
            }
        }
    }

    /// The compressed public key at this node.
    pub fn public_key(&self) -> PublicKey {
        PublicKey::new(self.xpub.public_key)
    }

    /// The private key at this node, if the private component is held.
    pub fn private_key(&self) -> Option<PrivateKey> {
        self.xpriv.as_ref().map(|x| x.to_priv())
    }

    pub fn xpub(&self) -> &Xpub {
        &self.xpub
    }

    pub fn xpriv(&self) -> Option<&Xpriv> {
        self.xpriv.as_ref()
    }

    pub fn is_private(&self) -> bool {
        self.xpriv.is_some()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.xpub.fingerprint()
    }

    pub fn network(&self) -> NetworkKind {
        self.xpub.network
    }
}
