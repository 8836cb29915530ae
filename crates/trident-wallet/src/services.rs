//! Collaborator seams
//!
//! The engine talks to the outside world only through these traits: cosigner
//! key distribution, UTXO listing and locking, the address index, the fee
//! oracle, the co-signing service and the broadcast sink. Transport, auth and
//! pagination live behind the implementations, never in the core.

use bitcoin::bip32::Xpub;
use bitcoin::{Address, Amount, OutPoint, ScriptBuf, Transaction, Txid};
use thiserror::Error;

use trident_core::WalletPath;

use crate::selector::FeeStrategy;

/// A collaborator failed out-of-band (transport, backend, rejection). The
/// engine propagates these unmodified.
#[derive(Error, Debug)]
#[error("Service error: {0}")]
pub struct ServiceError(pub String);

impl ServiceError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// An unspent output as reported by the listing service.
#[derive(Debug, Clone)]
pub struct Utxo {
    /// The outpoint (txid:vout)
    pub outpoint: OutPoint,
    /// Value in satoshis
    pub value: Amount,
    /// The wallet address holding this output
    pub address: Address,
    /// Confirmation count (0 if unconfirmed)
    pub confirmations: u32,
    /// Soft reservation held by an in-flight build
    pub locked: bool,
}

/// Filter for [`UtxoListing::list`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UtxoFilter {
    pub min_confirmations: u32,
    pub include_locked: bool,
}

/// Per-input signing context handed to the co-signing service.
#[derive(Debug, Clone)]
pub struct SignableInput {
    /// Input index in the transaction
    pub index: usize,
    /// Redeem script the input spends against
    pub redeem_script: ScriptBuf,
    /// Wallet path of the spent output's address
    pub path: WalletPath,
    /// Cosigner key set active when the address was created
    pub key_index: u32,
}

/// Source of co-signing public keys, indexed by key-index.
pub trait CosignerKeyProvider {
    /// Account-level extended public key for `key_index` (public-only).
    fn public_key(&self, key_index: u32) -> Result<Xpub, ServiceError>;
}

/// UTXO listing and advisory locking.
///
/// `try_lock` must be atomic relative to the backing store: either every
/// requested outpoint gets locked or none does. That is what prevents two
/// concurrent builds (possibly in different processes) from selecting the
/// same coin.
pub trait UtxoListing {
    fn list(&self, wallet_id: &str, filter: &UtxoFilter) -> Result<Vec<Utxo>, ServiceError>;

    /// Check-and-lock in one step. Returns false if any outpoint is already
    /// locked; in that case nothing was locked.
    fn try_lock(&self, outpoints: &[OutPoint]) -> Result<bool, ServiceError>;

    /// Release previously acquired locks.
    fn unlock(&self, outpoints: &[OutPoint]) -> Result<(), ServiceError>;

    /// Turn locks into permanent spends after a successful broadcast.
    fn mark_spent(&self, outpoints: &[OutPoint]) -> Result<(), ServiceError>;
}

/// Address-to-path bookkeeping. The key-index recorded here at creation time
/// is authoritative for rebuilding an address's redeem script later, even
/// after the wallet has upgraded to a newer key-index.
pub trait AddressIndex {
    fn record(
        &self,
        wallet_id: &str,
        path: &WalletPath,
        key_index: u32,
        address: &Address,
    ) -> Result<(), ServiceError>;

    fn lookup(&self, address: &Address) -> Result<Option<(WalletPath, u32)>, ServiceError>;

    /// Next unused external path for the wallet under `key_index`.
    fn next_path(&self, wallet_id: &str, key_index: u32) -> Result<WalletPath, ServiceError>;
}

/// Fee-rate oracle, satoshis per kilobyte keyed by strategy.
pub trait FeeOracle {
    fn rate(&self, strategy: FeeStrategy) -> Result<Amount, ServiceError>;
}

/// Co-signing service: returns one ECDSA signature per signable input, in
/// input order.
pub trait Cosigner {
    fn cosign(
        &self,
        tx: &Transaction,
        inputs: &[SignableInput],
    ) -> Result<Vec<bitcoin::ecdsa::Signature>, ServiceError>;
}

/// Broadcast sink with optional independent fee verification.
pub trait Broadcaster {
    fn send(&self, tx: &Transaction) -> Result<Txid, ServiceError>;

    /// Whether the given fee looks sane for this transaction.
    fn check_fee(&self, tx: &Transaction, fee: Amount) -> Result<bool, ServiceError>;
}

/// The full set of seams the engine needs, borrowed together.
pub struct Services<'a> {
    pub cosigner_keys: &'a dyn CosignerKeyProvider,
    pub utxos: &'a dyn UtxoListing,
    pub addresses: &'a dyn AddressIndex,
    pub fees: &'a dyn FeeOracle,
    pub cosigner: &'a dyn Cosigner,
    pub broadcaster: &'a dyn Broadcaster,
}
