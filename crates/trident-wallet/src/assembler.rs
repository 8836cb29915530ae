//! Transaction assembly
//!
//! Builds the unsigned transaction from a coin selection, attaches each
//! input's redeem script (re-derived through the key-index recorded for the
//! spent address), collects the primary and cosigner signatures and hands
//! the result to the broadcast sink.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::OP_PUSHBYTES_0;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Script, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use rand::Rng;
use thiserror::Error;

use trident_core::{DerivationError, WalletPath};

use crate::resolver::{PathResolver, ResolveError};
use crate::script::{build_redeem_script, ScriptBuildError};
use crate::selector::{estimate_fee, estimate_size, CoinSelector, FeeStrategy, SelectError};
use crate::services::{ServiceError, Services, SignableInput, Utxo};
use crate::vault::{KeyVault, WalletLockedError};
use crate::wallet::Wallet;

/// A forced fee that strays beyond this fraction of the computed fee still
/// wins, but the discrepancy is surfaced at warn level. 1/4 = 25%.
const FORCE_FEE_WARN_DIVISOR: u64 = 4;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Transaction has no outputs")]
    NoOutputs,

    #[error("Address not known to this wallet: {0}")]
    UnknownAddress(String),

    #[error("Recorded path does not reproduce the script for {0}")]
    ScriptMismatch(String),

    #[error(transparent)]
    Select(#[from] SelectError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Script(#[from] ScriptBuildError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

#[derive(Error, Debug)]
pub enum SignError {
    #[error(transparent)]
    Locked(#[from] WalletLockedError),

    #[error(transparent)]
    Derivation(#[from] DerivationError),

    #[error("Sighash computation failed: {0}")]
    Sighash(String),

    #[error("Script encoding failed: {0}")]
    Encode(String),

    #[error("Cosigner returned {got} signatures for {want} inputs")]
    CosignerCount { got: usize, want: usize },

    #[error(transparent)]
    Service(#[from] ServiceError),
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("Fee rejected by broadcast verification")]
    FeeMismatch,

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl From<SendError> for crate::wallet::WalletError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::FeeMismatch => crate::wallet::WalletError::FeeMismatch,
            SendError::Service(s) => crate::wallet::WalletError::Service(s),
        }
    }
}

/// Options for building and sending a payment.
#[derive(Debug, Clone)]
pub struct PayOptions {
    /// Change destination; a fresh wallet address is issued when unset.
    pub change_address: Option<Address>,
    pub fee_strategy: FeeStrategy,
    /// Fixed fee overriding estimation. The override always wins; large
    /// disagreement with the computed fee is logged, not swallowed.
    pub force_fee: Option<Amount>,
    pub allow_zero_conf: bool,
    /// Shuffle the change output's position for privacy.
    pub randomize_change: bool,
    /// Ask the broadcaster to independently verify the fee before accepting.
    pub api_check_fee: bool,
}

impl Default for PayOptions {
    fn default() -> Self {
        Self {
            change_address: None,
            fee_strategy: FeeStrategy::Optimal,
            force_fee: None,
            allow_zero_conf: false,
            randomize_change: true,
            api_check_fee: true,
        }
    }
}

/// One spendable input with everything needed to sign it.
#[derive(Debug, Clone)]
pub struct TxInput {
    pub utxo: Utxo,
    pub path: WalletPath,
    pub key_index: u32,
    pub redeem_script: bitcoin::ScriptBuf,
}

/// An assembled, not yet signed transaction.
#[derive(Debug, Clone)]
pub struct UnsignedTx {
    pub tx: Transaction,
    pub inputs: Vec<TxInput>,
    pub fee: Amount,
    pub change: Amount,
}

impl UnsignedTx {
    pub fn signable_inputs(&self) -> Vec<SignableInput> {
        self.inputs
            .iter()
            .enumerate()
            .map(|(index, input)| SignableInput {
                index,
                redeem_script: input.redeem_script.clone(),
                path: input.path.clone(),
                key_index: input.key_index,
            })
            .collect()
    }
}

/// Build an unsigned transaction paying `outputs`.
///
/// Selects coins (locking them as a reservation), re-derives each spent
/// output's redeem script via its recorded key-index, and appends a change
/// output when the leftover is above dust. On any failure after selection
/// the reservation is released before returning.
pub fn build(
    wallet: &Wallet,
    resolver: &PathResolver,
    services: &Services<'_>,
    outputs: &[(Address, Amount)],
    opts: &PayOptions,
) -> Result<UnsignedTx, BuildError> {
    if outputs.is_empty() {
        return Err(BuildError::NoOutputs);
    }
    let target: Amount = outputs.iter().map(|(_, v)| *v).sum();

    let selector = CoinSelector::new(services.utxos, services.fees);
    let selection = selector.select(
        wallet.identifier(),
        target,
        outputs.len(),
        opts.fee_strategy,
        opts.allow_zero_conf,
        opts.force_fee,
    )?;
    let outpoints = selection.outpoints();

    let assembled = assemble(wallet, resolver, services, outputs, opts, &selection);
    match assembled {
        Ok(unsigned) => Ok(unsigned),
        Err(e) => {
            if let Err(unlock_err) = services.utxos.unlock(&outpoints) {
                log::warn!("failed to release UTXO locks after build error: {}", unlock_err);
            }
            Err(e)
        }
    }
}

fn assemble(
    wallet: &Wallet,
    resolver: &PathResolver,
    services: &Services<'_>,
    outputs: &[(Address, Amount)],
    opts: &PayOptions,
    selection: &crate::selector::Selection,
) -> Result<UnsignedTx, BuildError> {
    if let Some(forced) = opts.force_fee {
        warn_on_fee_disagreement(services, opts, selection, outputs.len(), forced)?;
    }

    let mut inputs = Vec::with_capacity(selection.utxos.len());
    for utxo in &selection.utxos {
        let (path, key_index) = services
            .addresses
            .lookup(&utxo.address)?
            .ok_or_else(|| BuildError::UnknownAddress(utxo.address.to_string()))?;
        let keys = resolver.resolve(wallet, &path)?;
        let (redeem_script, derived_address) = build_redeem_script(&keys, wallet.network())?;
        if derived_address != utxo.address {
            return Err(BuildError::ScriptMismatch(utxo.address.to_string()));
        }
        inputs.push(TxInput {
            utxo: utxo.clone(),
            path,
            key_index,
            redeem_script,
        });
    }

    let mut tx_outputs: Vec<TxOut> = outputs
        .iter()
        .map(|(address, value)| TxOut {
            value: *value,
            script_pubkey: address.script_pubkey(),
        })
        .collect();

    if selection.change > Amount::ZERO {
        let change_address = match &opts.change_address {
            Some(address) => address.clone(),
            None => issue_change_address(wallet, resolver, services)?,
        };
        let change_output = TxOut {
            value: selection.change,
            script_pubkey: change_address.script_pubkey(),
        };
        if opts.randomize_change {
            let position = rand::thread_rng().gen_range(0..=tx_outputs.len());
            tx_outputs.insert(position, change_output);
        } else {
            tx_outputs.push(change_output);
        }
    }

    let tx = Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|input| TxIn {
                previous_output: input.utxo.outpoint,
                script_sig: bitcoin::ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: tx_outputs,
    };

    Ok(UnsignedTx {
        tx,
        inputs,
        fee: selection.fee,
        change: selection.change,
    })
}

/// Issue and record a fresh change address under the current key-index.
fn issue_change_address(
    wallet: &Wallet,
    resolver: &PathResolver,
    services: &Services<'_>,
) -> Result<Address, BuildError> {
    let path = services
        .addresses
        .next_path(wallet.identifier(), wallet.key_index())?;
    let keys = resolver.resolve(wallet, &path)?;
    let (_, address) = build_redeem_script(&keys, wallet.network())?;
    services
        .addresses
        .record(wallet.identifier(), &path, wallet.key_index(), &address)?;
    Ok(address)
}

fn warn_on_fee_disagreement(
    services: &Services<'_>,
    opts: &PayOptions,
    selection: &crate::selector::Selection,
    n_outputs: usize,
    forced: Amount,
) -> Result<(), BuildError> {
    let rate = services.fees.rate(opts.fee_strategy)?;
    let with_change = if selection.change > Amount::ZERO { 1 } else { 0 };
    let computed = estimate_fee(
        estimate_size(selection.utxos.len(), n_outputs + with_change),
        rate,
    );
    let diff = forced.to_sat().abs_diff(computed.to_sat());
    if diff * FORCE_FEE_WARN_DIVISOR > computed.to_sat() {
        log::warn!(
            "forced fee {} sat disagrees with computed fee {} sat; proceeding with the override",
            forced.to_sat(),
            computed.to_sat()
        );
    }
    Ok(())
}

/// Legacy sighash for one input, against its redeem script.
pub fn input_sighash(
    tx: &Transaction,
    index: usize,
    redeem_script: &Script,
) -> Result<bitcoin::secp256k1::Message, String> {
    let cache = SighashCache::new(tx);
    let sighash = cache
        .legacy_signature_hash(index, redeem_script, EcdsaSighashType::All.to_u32())
        .map_err(|e| e.to_string())?;
    Ok(bitcoin::secp256k1::Message::from_digest(
        sighash.to_byte_array(),
    ))
}

/// Sign an assembled transaction.
///
/// The primary signature comes from the vault (fails with
/// [`WalletLockedError`] while locked); the cosigner signature comes from the
/// co-signing collaborator. Signature slots follow the redeem script's key
/// order: primary first, cosigner second.
pub fn sign(
    resolver: &PathResolver,
    vault: &KeyVault,
    services: &Services<'_>,
    unsigned: &UnsignedTx,
) -> Result<Transaction, SignError> {
    let secp = resolver.secp();
    let signable = unsigned.signable_inputs();

    let primary_sigs = vault.with_unlocked(|master| {
        let mut sigs = Vec::with_capacity(unsigned.inputs.len());
        for (index, input) in unsigned.inputs.iter().enumerate() {
            let node = master
                .derive_priv(secp, &input.path.to_derivation_path())
                .map_err(DerivationError::from)?;
            let msg = input_sighash(&unsigned.tx, index, &input.redeem_script)
                .map_err(SignError::Sighash)?;
            let sig = secp.sign_ecdsa(&msg, &node.private_key);
            sigs.push(bitcoin::ecdsa::Signature {
                signature: sig,
                sighash_type: EcdsaSighashType::All,
            });
        }
        Ok::<_, SignError>(sigs)
    })??;

    let cosigner_sigs = services.cosigner.cosign(&unsigned.tx, &signable)?;
    if cosigner_sigs.len() != unsigned.inputs.len() {
        return Err(SignError::CosignerCount {
            got: cosigner_sigs.len(),
            want: unsigned.inputs.len(),
        });
    }

    let mut signed = unsigned.tx.clone();
    for (index, input) in unsigned.inputs.iter().enumerate() {
        signed.input[index].script_sig = finalize_script_sig(
            &primary_sigs[index],
            &cosigner_sigs[index],
            &input.redeem_script,
        )?;
    }
    Ok(signed)
}

/// `OP_0 <sig_primary> <sig_cosigner> <redeem_script>`
///
/// The leading OP_0 absorbs the historical CHECKMULTISIG off-by-one.
fn finalize_script_sig(
    primary: &bitcoin::ecdsa::Signature,
    cosigner: &bitcoin::ecdsa::Signature,
    redeem_script: &Script,
) -> Result<bitcoin::ScriptBuf, SignError> {
    let primary_bytes =
        PushBytesBuf::try_from(primary.to_vec()).map_err(|e| SignError::Encode(e.to_string()))?;
    let cosigner_bytes =
        PushBytesBuf::try_from(cosigner.to_vec()).map_err(|e| SignError::Encode(e.to_string()))?;
    let script_bytes = PushBytesBuf::try_from(redeem_script.to_bytes())
        .map_err(|e| SignError::Encode(e.to_string()))?;

    Ok(Builder::new()
        .push_opcode(OP_PUSHBYTES_0)
        .push_slice(primary_bytes)
        .push_slice(cosigner_bytes)
        .push_slice(script_bytes)
        .into_script())
}

/// Broadcast a signed transaction.
///
/// With `api_check_fee` the broadcaster first verifies the fee
/// independently; a negative verdict aborts without broadcasting.
pub fn send(
    services: &Services<'_>,
    tx: &Transaction,
    fee: Amount,
    api_check_fee: bool,
) -> Result<Txid, SendError> {
    if api_check_fee && !services.broadcaster.check_fee(tx, fee)? {
        return Err(SendError::FeeMismatch);
    }
    let txid = services.broadcaster.send(tx)?;
    log::info!("broadcast {}", txid);
    Ok(txid)
}
