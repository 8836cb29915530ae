//! Wallet model and payment orchestration
//!
//! A `Wallet` is the long-lived registered identity: the three parties'
//! public keys, the active key-index and the checksum. Key material and
//! redeem scripts are derived from it on demand; `pay` drives the full
//! select → build → sign → send pipeline, releasing UTXO reservations on
//! every failure path.

use std::collections::BTreeMap;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpub};
use bitcoin::secp256k1::{Secp256k1, Signing};
use bitcoin::{Address, Amount, Network, OutPoint, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use trident_core::{wallet_checksum, DerivationError, PathError, WalletPath};

use crate::assembler::{self, BuildError, PayOptions, SignError};
use crate::resolver::{PathResolver, ResolveError};
use crate::script::{build_redeem_script, ScriptBuildError};
use crate::selector::SelectError;
use crate::services::{
    AddressIndex, CosignerKeyProvider, ServiceError, Services, UtxoFilter, UtxoListing,
};
use crate::vault::{KeyVault, UnlockError, WalletLockedError};

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Insufficient funds: short {shortfall} sat")]
    InsufficientFunds { shortfall: u64 },

    #[error("Wallet is locked")]
    Locked,

    #[error("Another build holds one of the selected outputs")]
    LockConflict,

    #[error("Fee rejected by broadcast verification")]
    FeeMismatch,

    #[error("No key registered for key index {0}")]
    UnknownKeyIndex(u32),

    #[error("Address not known to this wallet: {0}")]
    UnknownAddress(String),

    #[error(transparent)]
    Unlock(#[from] UnlockError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Derivation(#[from] DerivationError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Script(#[from] ScriptBuildError),

    #[error(transparent)]
    Build(BuildError),

    #[error(transparent)]
    Sign(SignError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl From<WalletLockedError> for WalletError {
    fn from(_: WalletLockedError) -> Self {
        WalletError::Locked
    }
}

impl From<SelectError> for WalletError {
    fn from(e: SelectError) -> Self {
        match e {
            SelectError::InsufficientFunds { shortfall } => {
                WalletError::InsufficientFunds { shortfall }
            }
            SelectError::LockConflict => WalletError::LockConflict,
            SelectError::Service(s) => WalletError::Service(s),
        }
    }
}

impl From<BuildError> for WalletError {
    fn from(e: BuildError) -> Self {
        match e {
            BuildError::Select(s) => s.into(),
            BuildError::Service(s) => WalletError::Service(s),
            BuildError::UnknownAddress(a) => WalletError::UnknownAddress(a),
            other => WalletError::Build(other),
        }
    }
}

impl From<SignError> for WalletError {
    fn from(e: SignError) -> Self {
        match e {
            SignError::Locked(_) => WalletError::Locked,
            SignError::Service(s) => WalletError::Service(s),
            other => WalletError::Sign(other),
        }
    }
}

/// A registered multisig wallet identity.
///
/// Immutable except for `upgrade_key_index`, which adds a new cosigner key
/// set; addresses issued under older key-indexes keep resolving through the
/// index recorded at their creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    identifier: String,
    network: Network,
    key_index: u32,
    checksum: String,
    /// Primary account xpubs (`m/<key_index>'`) by key-index
    primary_keys: BTreeMap<u32, Xpub>,
    /// Backup master xpub (`M`)
    backup_key: Xpub,
    /// Cosigner account xpubs by key-index
    cosigner_keys: BTreeMap<u32, Xpub>,
}

impl Wallet {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identifier: impl Into<String>,
        network: Network,
        key_index: u32,
        checksum: impl Into<String>,
        primary_keys: BTreeMap<u32, Xpub>,
        backup_key: Xpub,
        cosigner_keys: BTreeMap<u32, Xpub>,
    ) -> Result<Self, WalletError> {
        if !primary_keys.contains_key(&key_index) || !cosigner_keys.contains_key(&key_index) {
            return Err(WalletError::UnknownKeyIndex(key_index));
        }
        Ok(Self {
            identifier: identifier.into(),
            network,
            key_index,
            checksum: checksum.into(),
            primary_keys,
            backup_key,
            cosigner_keys,
        })
    }

    /// Set up a wallet from the primary master key: derives the account xpub
    /// at `m/<key_index>'`, computes the checksum and fetches the cosigner
    /// key for the index.
    pub fn setup<C: Signing>(
        secp: &Secp256k1<C>,
        identifier: impl Into<String>,
        primary_master: &bitcoin::bip32::Xpriv,
        backup_key: Xpub,
        cosigner_keys: &dyn CosignerKeyProvider,
        key_index: u32,
        network: Network,
    ) -> Result<Self, WalletError> {
        let account_path = DerivationPath::from(vec![
            ChildNumber::from_hardened_idx(key_index).map_err(|_| PathError::IndexOutOfRange(key_index))?,
        ]);
        let account = primary_master
            .derive_priv(secp, &account_path)
            .map_err(DerivationError::from)?;
        let master_xpub = Xpub::from_priv(secp, primary_master);
        let checksum = wallet_checksum(&master_xpub, network);

        let mut primary = BTreeMap::new();
        primary.insert(key_index, Xpub::from_priv(secp, &account));
        let mut cosigner = BTreeMap::new();
        cosigner.insert(key_index, cosigner_keys.public_key(key_index)?);

        Wallet::new(identifier, network, key_index, checksum, primary, backup_key, cosigner)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn key_index(&self) -> u32 {
        self.key_index
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn primary_key(&self, key_index: u32) -> Option<&Xpub> {
        self.primary_keys.get(&key_index)
    }

    pub fn backup_key(&self) -> &Xpub {
        &self.backup_key
    }

    pub fn cosigner_key(&self, key_index: u32) -> Option<&Xpub> {
        self.cosigner_keys.get(&key_index)
    }

    /// Address at a wallet-relative path. Pure function of the wallet
    /// identity, the path and the key-index encoded in it.
    pub fn address_by_path(
        &self,
        resolver: &PathResolver,
        path: &WalletPath,
    ) -> Result<Address, WalletError> {
        Ok(self.redeem_script_by_path(resolver, path)?.1)
    }

    /// Redeem script and address at a wallet-relative path.
    pub fn redeem_script_by_path(
        &self,
        resolver: &PathResolver,
        path: &WalletPath,
    ) -> Result<(ScriptBuf, Address), WalletError> {
        let keys = resolver.resolve(self, path)?;
        Ok(build_redeem_script(&keys, self.network)?)
    }

    /// Path and key-index recorded for an address at creation time.
    pub fn path_for_address(
        &self,
        addresses: &dyn AddressIndex,
        address: &Address,
    ) -> Result<(WalletPath, u32), WalletError> {
        addresses
            .lookup(address)?
            .ok_or_else(|| WalletError::UnknownAddress(address.to_string()))
    }

    /// Issue a fresh address under the current key-index and record it.
    pub fn new_address_pair(
        &self,
        resolver: &PathResolver,
        addresses: &dyn AddressIndex,
    ) -> Result<(WalletPath, Address), WalletError> {
        let path = addresses.next_path(&self.identifier, self.key_index)?;
        let (_, address) = self.redeem_script_by_path(resolver, &path)?;
        addresses.record(&self.identifier, &path, self.key_index, &address)?;
        Ok((path, address))
    }

    pub fn new_address(
        &self,
        resolver: &PathResolver,
        addresses: &dyn AddressIndex,
    ) -> Result<Address, WalletError> {
        Ok(self.new_address_pair(resolver, addresses)?.1)
    }

    /// (confirmed, unconfirmed) balance in satoshis, locked coins included.
    pub fn balance(&self, utxos: &dyn UtxoListing) -> Result<(Amount, Amount), WalletError> {
        let filter = UtxoFilter {
            min_confirmations: 0,
            include_locked: true,
        };
        let mut confirmed = Amount::ZERO;
        let mut unconfirmed = Amount::ZERO;
        for utxo in utxos.list(&self.identifier, &filter)? {
            if utxo.confirmations > 0 {
                confirmed += utxo.value;
            } else {
                unconfirmed += utxo.value;
            }
        }
        Ok((confirmed, unconfirmed))
    }

    /// Move the wallet to a new cosigner key set.
    ///
    /// Requires the vault unlocked: the new account key is re-derived from
    /// the primary master key. Addresses issued under previous indexes are
    /// unaffected; their recorded key-index keeps resolving the old script.
    pub fn upgrade_key_index<C: Signing>(
        &mut self,
        secp: &Secp256k1<C>,
        vault: &KeyVault,
        cosigner_keys: &dyn CosignerKeyProvider,
        new_index: u32,
    ) -> Result<(), WalletError> {
        let account_path = DerivationPath::from(vec![
            ChildNumber::from_hardened_idx(new_index).map_err(|_| PathError::IndexOutOfRange(new_index))?,
        ]);
        let account_xpub = vault.with_unlocked(|master| {
            master
                .derive_priv(secp, &account_path)
                .map(|acct| Xpub::from_priv(secp, &acct))
                .map_err(DerivationError::from)
        })??;

        let cosigner = cosigner_keys.public_key(new_index)?;
        self.primary_keys.insert(new_index, account_xpub);
        self.cosigner_keys.insert(new_index, cosigner);
        self.key_index = new_index;
        log::info!(
            "wallet {} upgraded to key index {}",
            self.identifier,
            new_index
        );
        Ok(())
    }

    /// Create, sign and send a transaction. UTXO reservations taken during
    /// coin selection are released on every failure path; after a successful
    /// broadcast they become permanent spends.
    pub fn pay(
        &self,
        resolver: &PathResolver,
        vault: &KeyVault,
        services: &Services<'_>,
        outputs: &[(Address, Amount)],
        opts: &PayOptions,
    ) -> Result<Txid, WalletError> {
        let unsigned = assembler::build(self, resolver, services, outputs, opts)?;
        let outpoints: Vec<OutPoint> = unsigned.inputs.iter().map(|i| i.utxo.outpoint).collect();

        let result = assembler::sign(resolver, vault, services, &unsigned)
            .map_err(WalletError::from)
            .and_then(|signed| {
                assembler::send(services, &signed, unsigned.fee, opts.api_check_fee)
                    .map_err(WalletError::from)
            });

        match result {
            Ok(txid) => {
                services.utxos.mark_spent(&outpoints)?;
                Ok(txid)
            }
            Err(e) => {
                if let Err(unlock_err) = services.utxos.unlock(&outpoints) {
                    log::warn!("failed to release UTXO locks after error: {}", unlock_err);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
pub mod testkit {
    //! Shared wallet fixture: three parties with known mnemonics on testnet.

    use super::*;
    use bitcoin::bip32::Xpriv;
    use bitcoin::NetworkKind;
    use trident_core::{derive_seed, master_key, parse_mnemonic};

    pub const PRIMARY_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    pub const BACKUP_MNEMONIC: &str = "zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo wrong";
    pub const COSIGNER_MNEMONIC: &str =
        "legal winner thank year wave sausage worth useful legal winner thank yellow";

    pub const KEY_INDEX: u32 = 9999;

    pub struct Fixture {
        pub wallet: Wallet,
        pub primary_master: Xpriv,
        pub backup_master: Xpriv,
        pub cosigner_master: Xpriv,
    }

    pub fn master_from(mnemonic: &str) -> Xpriv {
        let mnemonic = parse_mnemonic(mnemonic).unwrap();
        let seed = derive_seed(&mnemonic, "");
        master_key(&seed, NetworkKind::Test).unwrap()
    }

    pub fn account_xpub(secp: &Secp256k1<bitcoin::secp256k1::All>, master: &Xpriv, key_index: u32) -> Xpub {
        let path = DerivationPath::from(vec![ChildNumber::from_hardened_idx(key_index).unwrap()]);
        Xpub::from_priv(secp, &master.derive_priv(secp, &path).unwrap())
    }

    pub fn fixture() -> Fixture {
        let secp = Secp256k1::new();
        let primary_master = master_from(PRIMARY_MNEMONIC);
        let backup_master = master_from(BACKUP_MNEMONIC);
        let cosigner_master = master_from(COSIGNER_MNEMONIC);

        let master_xpub = Xpub::from_priv(&secp, &primary_master);
        let checksum = wallet_checksum(&master_xpub, Network::Testnet);

        let mut primary = BTreeMap::new();
        primary.insert(KEY_INDEX, account_xpub(&secp, &primary_master, KEY_INDEX));
        let mut cosigner = BTreeMap::new();
        cosigner.insert(KEY_INDEX, account_xpub(&secp, &cosigner_master, KEY_INDEX));

        let wallet = Wallet::new(
            "unittest",
            Network::Testnet,
            KEY_INDEX,
            checksum,
            primary,
            Xpub::from_priv(&secp, &backup_master),
            cosigner,
        )
        .unwrap();

        Fixture {
            wallet,
            primary_master,
            backup_master,
            cosigner_master,
        }
    }
}
