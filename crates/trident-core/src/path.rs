//! Wallet-relative derivation paths
//!
//! A `WalletPath` is the account-relative form `M/<key_index>'/<chain>/<address>`.
//! The leading hardened step selects the cosigner key set in use when the
//! address was created; everything after it is derivable from public keys.

use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{ChildNumber, DerivationPath};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PathError {
    #[error("Invalid path: {0}")]
    Invalid(String),

    #[error("Path must start with a hardened key index")]
    MissingKeyIndex,

    #[error("Index out of range: {0}")]
    IndexOutOfRange(u32),
}

/// An ordered sequence of derivation steps relative to the account root.
///
/// Equality, ordering and hashing are structural, so a `WalletPath` can key
/// derivation caches directly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalletPath(Vec<ChildNumber>);

impl WalletPath {
    /// Build the standard three-step path `M/<key_index>'/<chain>/<address>`.
    pub fn address(key_index: u32, chain: u32, address_index: u32) -> Result<Self, PathError> {
        Ok(Self(vec![
            ChildNumber::from_hardened_idx(key_index)
                .map_err(|_| PathError::IndexOutOfRange(key_index))?,
            ChildNumber::from_normal_idx(chain).map_err(|_| PathError::IndexOutOfRange(chain))?,
            ChildNumber::from_normal_idx(address_index)
                .map_err(|_| PathError::IndexOutOfRange(address_index))?,
        ]))
    }

    /// The key index encoded in the leading hardened step.
    pub fn key_index(&self) -> Result<u32, PathError> {
        match self.0.first() {
            Some(ChildNumber::Hardened { index }) => Ok(*index),
            _ => Err(PathError::MissingKeyIndex),
        }
    }

    /// Chain number (second step), if present and non-hardened.
    pub fn chain(&self) -> Option<u32> {
        match self.0.get(1) {
            Some(ChildNumber::Normal { index }) => Some(*index),
            _ => None,
        }
    }

    /// Address index (third step), if present and non-hardened.
    pub fn address_index(&self) -> Option<u32> {
        match self.0.get(2) {
            Some(ChildNumber::Normal { index }) => Some(*index),
            _ => None,
        }
    }

    /// The same path with every hardened step replaced by its normal
    /// counterpart. The backup party holds only a master public key, so it
    /// derives along this shadow of the path.
    pub fn unhardened(&self) -> Self {
        Self(
            self.0
                .iter()
                .map(|c| match c {
                    ChildNumber::Hardened { index } => ChildNumber::Normal { index: *index },
                    normal => *normal,
                })
                .collect(),
        )
    }

    /// Steps after the leading key-index step. Account-level keys (already
    /// derived at `m/<key_index>'`) derive the remainder publicly.
    pub fn remainder(&self) -> DerivationPath {
        DerivationPath::from(self.0[1..].to_vec())
    }

    /// The full path as a `bitcoin` derivation path.
    pub fn to_derivation_path(&self) -> DerivationPath {
        DerivationPath::from(self.0.clone())
    }

    pub fn steps(&self) -> &[ChildNumber] {
        &self.0
    }
}

impl fmt::Display for WalletPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M")?;
        for child in &self.0 {
            write!(f, "/{}", child)?;
        }
        Ok(())
    }
}

impl FromStr for WalletPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match parts.next() {
            Some("M") | Some("m") => {}
            _ => return Err(PathError::Invalid(s.to_string())),
        }
        let children = parts
            .map(|p| ChildNumber::from_str(p).map_err(|e| PathError::Invalid(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        if children.is_empty() {
            return Err(PathError::Invalid(s.to_string()));
        }
        Ok(Self(children))
    }
}

impl Serialize for WalletPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for WalletPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
