//! Trident Wallet
//!
//! Client-side engine for a 2-of-3 multisignature Bitcoin wallet. Three
//! parties hold keys: the primary (the user, key behind a [`vault::KeyVault`]),
//! a backup (master public key only, private key kept offline) and a
//! co-signing service. Every address is a P2SH multisig of the three keys
//! derived at the same wallet-relative path.
//!
//! The engine is transport-agnostic: everything external (UTXO listing, the
//! address index, fee rates, co-signing, broadcast) is reached through the
//! traits in [`services`]. The [`memory`] module provides in-process
//! implementations for testing and embedding.
//!
//! A payment runs select → build → sign → send:
//!
//! ```text
//! CoinSelector   picks UTXOs largest-first, fee fixed-point, locks them
//! assembler      attaches redeem scripts via each address's recorded
//!                key-index, adds change, collects both signatures
//! Broadcaster    optional independent fee check, then relay
//! ```

pub mod assembler;
pub mod memory;
pub mod resolver;
pub mod script;
pub mod selector;
pub mod services;
pub mod vault;
pub mod wallet;

pub use assembler::{PayOptions, UnsignedTx};
pub use resolver::{Party, PathResolver, ResolvedKeys};
pub use script::build_redeem_script;
pub use selector::{CoinSelector, FeeStrategy, Selection, DUST_THRESHOLD};
pub use services::{Services, Utxo, UtxoFilter};
pub use vault::{KeyVault, UnlockSecret};
pub use wallet::{Wallet, WalletError};
