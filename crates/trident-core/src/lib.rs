//! Trident Core
//!
//! Key material and derivation-path types shared by the wallet engine.
//!
//! # Derivation scheme
//!
//! Wallet paths are relative to the account root and always start with a
//! hardened key-index step: `M/<key_index>'/<chain>/<address>`. Each of the
//! three parties (primary, backup, cosigner) derives its own key at the same
//! relative path; the backup party only ever publishes a master public key
//! and derives along the unhardened shadow of the path.

pub mod checksum;
pub mod keys;
pub mod path;
pub mod seed;

pub use checksum::wallet_checksum;
pub use keys::{DerivationError, KeyNode};
pub use path::{PathError, WalletPath};
pub use seed::{derive_seed, generate_mnemonic, master_key, parse_mnemonic, SeedError};
