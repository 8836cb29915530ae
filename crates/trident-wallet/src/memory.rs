//! In-memory collaborators
//!
//! Reference implementations of the collaborator seams backed by process
//! memory. They carry the real semantics (atomic locking, recorded
//! key-indexes, actual cosigner signatures) so the engine can be exercised
//! end to end without a backend.

use std::collections::HashMap;
use std::sync::Mutex;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv, Xpub};
use bitcoin::secp256k1::{All, Secp256k1, Signing};
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{Address, Amount, OutPoint, Transaction, Txid};

use trident_core::WalletPath;

use crate::assembler::input_sighash;
use crate::selector::FeeStrategy;
use crate::services::{
    AddressIndex, Broadcaster, Cosigner, CosignerKeyProvider, FeeOracle, ServiceError,
    SignableInput, Utxo, UtxoFilter, UtxoListing,
};

/// Key provider holding pre-derived account xpubs per key-index.
pub struct MemoryCosignerKeys {
    keys: HashMap<u32, Xpub>,
}

impl MemoryCosignerKeys {
    pub fn new(keys: HashMap<u32, Xpub>) -> Self {
        Self { keys }
    }

    /// Derive account xpubs at `m/<index>'` for each index from a master key.
    ///
    /// Panics if an index is outside the hardened range.
    pub fn from_master<C: Signing>(secp: &Secp256k1<C>, master: &Xpriv, indexes: &[u32]) -> Self {
        let mut keys = HashMap::new();
        for &index in indexes {
            let child = ChildNumber::from_hardened_idx(index)
                .expect("key index within hardened range");
            let path = DerivationPath::from(vec![child]);
            let account = master
                .derive_priv(secp, &path)
                .expect("statistically unreachable");
            keys.insert(index, Xpub::from_priv(secp, &account));
        }
        Self { keys }
    }
}

impl CosignerKeyProvider for MemoryCosignerKeys {
    fn public_key(&self, key_index: u32) -> Result<Xpub, ServiceError> {
        self.keys
            .get(&key_index)
            .copied()
            .ok_or_else(|| ServiceError::new(format!("no cosigner key for index {}", key_index)))
    }
}

#[derive(Default)]
struct ListingState {
    utxos: Vec<(String, Utxo)>,
}

/// UTXO store with advisory locks. `try_lock` is atomic under the inner
/// mutex, matching the contract a real backend provides transactionally.
#[derive(Default)]
pub struct MemoryUtxoListing {
    state: Mutex<ListingState>,
}

impl MemoryUtxoListing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, wallet_id: &str, utxo: Utxo) {
        self.state
            .lock()
            .expect("listing state poisoned")
            .utxos
            .push((wallet_id.to_string(), utxo));
    }
}

impl UtxoListing for MemoryUtxoListing {
    fn list(&self, wallet_id: &str, filter: &UtxoFilter) -> Result<Vec<Utxo>, ServiceError> {
        let state = self.state.lock().expect("listing state poisoned");
        Ok(state
            .utxos
            .iter()
            .filter(|(id, u)| {
                id == wallet_id
                    && u.confirmations >= filter.min_confirmations
                    && (filter.include_locked || !u.locked)
            })
            .map(|(_, u)| u.clone())
            .collect())
    }

    fn try_lock(&self, outpoints: &[OutPoint]) -> Result<bool, ServiceError> {
        let mut state = self.state.lock().expect("listing state poisoned");
        for outpoint in outpoints {
            match state.utxos.iter().find(|(_, u)| u.outpoint == *outpoint) {
                Some((_, u)) if !u.locked => {}
                _ => return Ok(false),
            }
        }
        for (_, u) in state.utxos.iter_mut() {
            if outpoints.contains(&u.outpoint) {
                u.locked = true;
            }
        }
        Ok(true)
    }

    fn unlock(&self, outpoints: &[OutPoint]) -> Result<(), ServiceError> {
        let mut state = self.state.lock().expect("listing state poisoned");
        for (_, u) in state.utxos.iter_mut() {
            if outpoints.contains(&u.outpoint) {
                u.locked = false;
            }
        }
        Ok(())
    }

    fn mark_spent(&self, outpoints: &[OutPoint]) -> Result<(), ServiceError> {
        let mut state = self.state.lock().expect("listing state poisoned");
        state.utxos.retain(|(_, u)| !outpoints.contains(&u.outpoint));
        Ok(())
    }
}

#[derive(Default)]
struct IndexState {
    by_address: HashMap<String, (WalletPath, u32)>,
    counters: HashMap<String, u32>,
}

/// Address bookkeeping with a per-wallet issuance counter. The key-index
/// stored at `record` time is what `lookup` returns ever after.
#[derive(Default)]
pub struct MemoryAddressIndex {
    state: Mutex<IndexState>,
}

impl MemoryAddressIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AddressIndex for MemoryAddressIndex {
    fn record(
        &self,
        _wallet_id: &str,
        path: &WalletPath,
        key_index: u32,
        address: &Address,
    ) -> Result<(), ServiceError> {
        let mut state = self.state.lock().expect("index state poisoned");
        state
            .by_address
            .insert(address.to_string(), (path.clone(), key_index));
        Ok(())
    }

    fn lookup(&self, address: &Address) -> Result<Option<(WalletPath, u32)>, ServiceError> {
        let state = self.state.lock().expect("index state poisoned");
        Ok(state.by_address.get(&address.to_string()).cloned())
    }

    fn next_path(&self, wallet_id: &str, key_index: u32) -> Result<WalletPath, ServiceError> {
        let mut state = self.state.lock().expect("index state poisoned");
        let counter = state.counters.entry(wallet_id.to_string()).or_insert(0);
        let index = *counter;
        *counter += 1;
        WalletPath::address(key_index, 0, index)
            .map_err(|e| ServiceError::new(e.to_string()))
    }
}

/// Fee oracle with one fixed rate per strategy, sat/kB.
pub struct FixedFeeOracle {
    base_fee: Amount,
    optimal: Amount,
    low_priority: Amount,
}

impl FixedFeeOracle {
    pub fn new(base_fee: Amount, optimal: Amount, low_priority: Amount) -> Self {
        Self {
            base_fee,
            optimal,
            low_priority,
        }
    }

    /// The same rate for every strategy.
    pub fn flat(rate: Amount) -> Self {
        Self::new(rate, rate, rate)
    }
}

impl FeeOracle for FixedFeeOracle {
    fn rate(&self, strategy: FeeStrategy) -> Result<Amount, ServiceError> {
        Ok(match strategy {
            FeeStrategy::BaseFee => self.base_fee,
            FeeStrategy::Optimal => self.optimal,
            FeeStrategy::LowPriority => self.low_priority,
        })
    }
}

/// Co-signing party holding its own master private key. Signs each input by
/// deriving along the full wallet-relative path, exactly as a hosted
/// co-signing service would.
pub struct MemoryCosigner {
    master: Xpriv,
    secp: Secp256k1<All>,
}

impl MemoryCosigner {
    pub fn new(master: Xpriv) -> Self {
        Self {
            master,
            secp: Secp256k1::new(),
        }
    }
}

impl Cosigner for MemoryCosigner {
    fn cosign(
        &self,
        tx: &Transaction,
        inputs: &[SignableInput],
    ) -> Result<Vec<bitcoin::ecdsa::Signature>, ServiceError> {
        let mut sigs = Vec::with_capacity(inputs.len());
        for input in inputs {
            let node = self
                .master
                .derive_priv(&self.secp, &input.path.to_derivation_path())
                .map_err(|e| ServiceError::new(e.to_string()))?;
            let msg = input_sighash(tx, input.index, &input.redeem_script)
                .map_err(ServiceError::new)?;
            sigs.push(bitcoin::ecdsa::Signature {
                signature: self.secp.sign_ecdsa(&msg, &node.private_key),
                sighash_type: EcdsaSighashType::All,
            });
        }
        Ok(sigs)
    }
}

/// Broadcast sink that records transactions instead of relaying them.
pub struct MemoryBroadcaster {
    sent: Mutex<Vec<Transaction>>,
    fee_verdict: bool,
}

impl Default for MemoryBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroadcaster {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fee_verdict: true,
        }
    }

    /// A broadcaster whose fee verification always says no.
    pub fn rejecting_fees() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fee_verdict: false,
        }
    }

    pub fn sent(&self) -> Vec<Transaction> {
        self.sent.lock().expect("broadcaster state poisoned").clone()
    }
}

impl Broadcaster for MemoryBroadcaster {
    fn send(&self, tx: &Transaction) -> Result<Txid, ServiceError> {
        self.sent
            .lock()
            .expect("broadcaster state poisoned")
            .push(tx.clone());
        Ok(tx.compute_txid())
    }

    fn check_fee(&self, _tx: &Transaction, _fee: Amount) -> Result<bool, ServiceError> {
        Ok(self.fee_verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn outpoint(n: u8) -> OutPoint {
        OutPoint::from_str(&format!("{:064x}:0", n as u128)).unwrap()
    }

    fn coin(n: u8, value: u64, confirmations: u32) -> Utxo {
        Utxo {
            outpoint: outpoint(n),
            value: Amount::from_sat(value),
            address: Address::p2sh(&bitcoin::ScriptBuf::new(), bitcoin::Network::Testnet).unwrap(),
            confirmations,
            locked: false,
        }
    }

    #[test]
    fn test_listing_filters_by_wallet_and_confirmations() {
        let listing = MemoryUtxoListing::new();
        listing.add("a", coin(1, 1_000, 0));
        listing.add("a", coin(2, 2_000, 3));
        listing.add("b", coin(3, 3_000, 3));

        let confirmed = listing
            .list(
                "a",
                &UtxoFilter {
                    min_confirmations: 1,
                    include_locked: false,
                },
            )
            .unwrap();
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].outpoint, outpoint(2));

        let all = listing.list("a", &UtxoFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_try_lock_is_all_or_nothing() {
        let listing = MemoryUtxoListing::new();
        listing.add("a", coin(1, 1_000, 1));
        listing.add("a", coin(2, 2_000, 1));

        assert!(listing.try_lock(&[outpoint(1)]).unwrap());
        // One of the two is already held, so neither gets locked
        assert!(!listing.try_lock(&[outpoint(1), outpoint(2)]).unwrap());
        let remaining = listing
            .list(
                "a",
                &UtxoFilter {
                    min_confirmations: 0,
                    include_locked: false,
                },
            )
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].outpoint, outpoint(2));

        listing.unlock(&[outpoint(1)]).unwrap();
        assert!(listing.try_lock(&[outpoint(1), outpoint(2)]).unwrap());
    }

    #[test]
    fn test_mark_spent_removes_coins() {
        let listing = MemoryUtxoListing::new();
        listing.add("a", coin(1, 1_000, 1));
        listing.mark_spent(&[outpoint(1)]).unwrap();
        assert!(listing.list("a", &UtxoFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_address_index_issues_increasing_paths() {
        let index = MemoryAddressIndex::new();
        let first = index.next_path("w", 9999).unwrap();
        let second = index.next_path("w", 9999).unwrap();
        assert_eq!(first.to_string(), "M/9999'/0/0");
        assert_eq!(second.to_string(), "M/9999'/0/1");

        // Counters are per wallet
        let other = index.next_path("x", 9999).unwrap();
        assert_eq!(other.to_string(), "M/9999'/0/0");
    }

    #[test]
    fn test_address_index_records_creation_key_index() {
        let index = MemoryAddressIndex::new();
        let address =
            Address::p2sh(&bitcoin::ScriptBuf::new(), bitcoin::Network::Testnet).unwrap();
        let path = WalletPath::address(9999, 0, 7).unwrap();
        index.record("w", &path, 9999, &address).unwrap();

        let (found_path, found_index) = index.lookup(&address).unwrap().unwrap();
        assert_eq!(found_path, path);
        assert_eq!(found_index, 9999);
    }

    #[test]
    fn test_fee_oracle_per_strategy() {
        let oracle = FixedFeeOracle::new(
            Amount::from_sat(10_000),
            Amount::from_sat(20_000),
            Amount::from_sat(5_000),
        );
        assert_eq!(oracle.rate(FeeStrategy::BaseFee).unwrap(), Amount::from_sat(10_000));
        assert_eq!(oracle.rate(FeeStrategy::Optimal).unwrap(), Amount::from_sat(20_000));
        assert_eq!(
            oracle.rate(FeeStrategy::LowPriority).unwrap(),
            Amount::from_sat(5_000)
        );
    }
}
