//! Redeem script construction
//!
//! Builds the 2-of-3 multisig redeem script and its P2SH address. Key order
//! is fixed by party — primary, backup, cosigner — never by numeric key
//! value, so the same three keys always produce the same script and the
//! signature slots are unambiguous.

use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::Builder;
use bitcoin::{Address, Network, PublicKey, ScriptBuf};
use thiserror::Error;

use crate::resolver::{Party, ResolvedKeys};

#[derive(Error, Debug)]
pub enum ScriptBuildError {
    #[error("Uncompressed public key for {0:?}")]
    UncompressedKey(Party),

    #[error("Address construction failed: {0}")]
    Address(String),
}

/// Build the redeem script and P2SH address for keys resolved at one path.
pub fn build_redeem_script(
    keys: &ResolvedKeys,
    network: Network,
) -> Result<(ScriptBuf, Address), ScriptBuildError> {
    let ordered = [
        (Party::Primary, keys.primary.public_key()),
        (Party::Backup, keys.backup.public_key()),
        (Party::Cosigner(keys.key_index), keys.cosigner.public_key()),
    ];
    for (party, key) in &ordered {
        if !key.compressed {
            return Err(ScriptBuildError::UncompressedKey(*party));
        }
    }

    let script = multisig_script(2, &[ordered[0].1, ordered[1].1, ordered[2].1]);
    let address =
        Address::p2sh(&script, network).map_err(|e| ScriptBuildError::Address(e.to_string()))?;
    Ok((script, address))
}

/// `<m> <key...> <n> OP_CHECKMULTISIG`
fn multisig_script(required: i64, keys: &[PublicKey]) -> ScriptBuf {
    let mut builder = Builder::new().push_int(required);
    for key in keys {
        builder = builder.push_key(key);
    }
    builder
        .push_int(keys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}
