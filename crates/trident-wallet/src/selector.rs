//! Coin selection
//!
//! Largest-first accumulation with a fee fixed-point: the fee depends on the
//! transaction size, the size depends on the input count, so the estimate is
//! recomputed as inputs are added until the selection is sufficient or the
//! candidate set runs out.

use std::fmt;
use std::str::FromStr;

use bitcoin::{Amount, OutPoint};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::{FeeOracle, ServiceError, Utxo, UtxoFilter, UtxoListing};

/// Outputs below this value are uneconomical; sub-dust change folds into the
/// fee instead of creating an output.
pub const DUST_THRESHOLD: Amount = Amount::from_sat(546);

/// Version, locktime, counts. Legacy transaction framing.
const TX_OVERHEAD_SIZE: usize = 10;
/// A P2SH or P2PKH output.
const OUTPUT_SIZE: usize = 34;
/// A 2-of-3 P2SH input: outpoint, two signatures, the redeem script.
const MULTISIG_INPUT_SIZE: usize = 297;

/// Fee-rate strategy resolved through the fee oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeStrategy {
    BaseFee,
    Optimal,
    LowPriority,
}

impl fmt::Display for FeeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FeeStrategy::BaseFee => "base_fee",
            FeeStrategy::Optimal => "optimal",
            FeeStrategy::LowPriority => "low_priority",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for FeeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base_fee" => Ok(FeeStrategy::BaseFee),
            "optimal" => Ok(FeeStrategy::Optimal),
            "low_priority" => Ok(FeeStrategy::LowPriority),
            other => Err(format!("unknown fee strategy: {}", other)),
        }
    }
}

#[derive(Error, Debug)]
pub enum SelectError {
    #[error("Insufficient funds: short {shortfall} sat")]
    InsufficientFunds { shortfall: u64 },

    #[error("Another build holds one of the selected outputs")]
    LockConflict,

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// A successful selection. Conservation holds exactly:
/// sum of selected values = target + change + fee.
#[derive(Debug, Clone)]
pub struct Selection {
    pub utxos: Vec<Utxo>,
    pub fee: Amount,
    pub change: Amount,
}

impl Selection {
    pub fn total(&self) -> Amount {
        self.utxos.iter().map(|u| u.value).sum()
    }

    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.utxos.iter().map(|u| u.outpoint).collect()
    }
}

/// Estimated serialized size for a 2-of-3 P2SH spend.
pub fn estimate_size(inputs: usize, outputs: usize) -> usize {
    TX_OVERHEAD_SIZE + inputs * MULTISIG_INPUT_SIZE + outputs * OUTPUT_SIZE
}

/// Fee for `size` bytes at `rate` sat/kB, rounded up.
pub fn estimate_fee(size: usize, rate: Amount) -> Amount {
    Amount::from_sat((size as u64 * rate.to_sat() + 999) / 1000)
}

pub struct CoinSelector<'a> {
    listing: &'a dyn UtxoListing,
    fees: &'a dyn FeeOracle,
}

impl<'a> CoinSelector<'a> {
    pub fn new(listing: &'a dyn UtxoListing, fees: &'a dyn FeeOracle) -> Self {
        Self { listing, fees }
    }

    /// Select UTXOs covering `target` plus fees for a transaction paying
    /// `n_outputs` outputs (a change output is assumed until proven dust).
    ///
    /// The first pass only considers confirmed coins. If that comes up short
    /// and the caller allowed zero-conf, one relaxed retry includes
    /// unconfirmed coins; the fee strategy is never silently lowered.
    ///
    /// On success the selected outpoints are locked atomically through the
    /// listing service; the caller releases them on abort.
    pub fn select(
        &self,
        wallet_id: &str,
        target: Amount,
        n_outputs: usize,
        strategy: FeeStrategy,
        allow_zero_conf: bool,
        force_fee: Option<Amount>,
    ) -> Result<Selection, SelectError> {
        match self.select_pass(wallet_id, target, n_outputs, strategy, 1, force_fee) {
            Err(SelectError::InsufficientFunds { .. }) if allow_zero_conf => {
                log::debug!("confirmed coins insufficient, retrying with zero-conf");
                self.select_pass(wallet_id, target, n_outputs, strategy, 0, force_fee)
            }
            other => other,
        }
    }

    fn select_pass(
        &self,
        wallet_id: &str,
        target: Amount,
        n_outputs: usize,
        strategy: FeeStrategy,
        min_confirmations: u32,
        force_fee: Option<Amount>,
    ) -> Result<Selection, SelectError> {
        let filter = UtxoFilter {
            min_confirmations,
            include_locked: false,
        };
        let mut candidates = self.listing.list(wallet_id, &filter)?;
        candidates.sort_by(|a, b| b.value.cmp(&a.value));

        let rate = match force_fee {
            Some(_) => Amount::ZERO,
            None => self.fees.rate(strategy)?,
        };
        // One slot reserved for change; dropping a dust change output later
        // only ever overestimates the fee by one output.
        let outputs_with_change = n_outputs + 1;
        let fee_for = |inputs: usize| {
            force_fee
                .unwrap_or_else(|| estimate_fee(estimate_size(inputs, outputs_with_change), rate))
        };

        let mut selected: Vec<Utxo> = Vec::new();
        let mut total = Amount::ZERO;
        let mut fee = fee_for(1);

        for utxo in candidates {
            total += utxo.value;
            selected.push(utxo);
            fee = fee_for(selected.len());
            if total >= target + fee {
                break;
            }
        }

        if total < target + fee {
            let shortfall = (target + fee - total).to_sat();
            return Err(SelectError::InsufficientFunds { shortfall });
        }

        let mut change = total - target - fee;
        if change < DUST_THRESHOLD {
            fee += change;
            change = Amount::ZERO;
        }

        let outpoints: Vec<OutPoint> = selected.iter().map(|u| u.outpoint).collect();
        if !self.listing.try_lock(&outpoints)? {
            return Err(SelectError::LockConflict);
        }

        Ok(Selection {
            utxos: selected,
            fee,
            change,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FixedFeeOracle, MemoryUtxoListing};
    use bitcoin::{Address, Network};
    use std::str::FromStr;

    fn test_address() -> Address {
        Address::p2sh(&bitcoin::ScriptBuf::new(), Network::Testnet).unwrap()
    }

    fn outpoint(n: u8) -> OutPoint {
        let txid = format!("{:064x}", n as u128);
        OutPoint::from_str(&format!("{}:0", txid)).unwrap()
    }

    fn listing_with(values_and_confs: &[(u64, u32)]) -> MemoryUtxoListing {
        let listing = MemoryUtxoListing::new();
        for (i, (value, confs)) in values_and_confs.iter().enumerate() {
            listing.add(
                "w1",
                Utxo {
                    outpoint: outpoint(i as u8 + 1),
                    value: Amount::from_sat(*value),
                    address: test_address(),
                    confirmations: *confs,
                    locked: false,
                },
            );
        }
        listing
    }

    fn oracle() -> FixedFeeOracle {
        FixedFeeOracle::flat(Amount::from_sat(10_000))
    }

    #[test]
    fn test_forced_fee_simple_selection() {
        let listing = listing_with(&[(100_000, 6)]);
        let fees = oracle();
        let selector = CoinSelector::new(&listing, &fees);

        let sel = selector
            .select(
                "w1",
                Amount::from_sat(50_000),
                1,
                FeeStrategy::BaseFee,
                false,
                Some(Amount::from_sat(1_000)),
            )
            .unwrap();

        assert_eq!(sel.utxos.len(), 1);
        assert_eq!(sel.fee, Amount::from_sat(1_000));
        assert_eq!(sel.change, Amount::from_sat(49_000));
    }

    #[test]
    fn test_insufficient_funds_shortfall() {
        let listing = listing_with(&[(100_000, 6)]);
        let fees = oracle();
        let selector = CoinSelector::new(&listing, &fees);

        let err = selector
            .select(
                "w1",
                Amount::from_sat(150_000),
                1,
                FeeStrategy::BaseFee,
                false,
                Some(Amount::from_sat(1_000)),
            )
            .unwrap_err();

        match err {
            SelectError::InsufficientFunds { shortfall } => assert_eq!(shortfall, 51_000),
            other => panic!("expected InsufficientFunds, got {:?}", other),
        }
    }

    #[test]
    fn test_conservation() {
        let listing = listing_with(&[(60_000, 3), (50_000, 2), (40_000, 1)]);
        let fees = oracle();
        let selector = CoinSelector::new(&listing, &fees);

        let target = Amount::from_sat(90_000);
        let sel = selector
            .select("w1", target, 1, FeeStrategy::Optimal, false, None)
            .unwrap();

        assert_eq!(sel.total(), target + sel.change + sel.fee);
    }

    #[test]
    fn test_largest_first_order() {
        let listing = listing_with(&[(10_000, 5), (80_000, 5), (30_000, 5)]);
        let fees = oracle();
        let selector = CoinSelector::new(&listing, &fees);

        let sel = selector
            .select(
                "w1",
                Amount::from_sat(20_000),
                1,
                FeeStrategy::Optimal,
                false,
                Some(Amount::from_sat(500)),
            )
            .unwrap();

        assert_eq!(sel.utxos.len(), 1);
        assert_eq!(sel.utxos[0].value, Amount::from_sat(80_000));
    }

    #[test]
    fn test_zero_conf_excluded_unless_allowed() {
        let listing = listing_with(&[(100_000, 0)]);
        let fees = oracle();
        let selector = CoinSelector::new(&listing, &fees);

        let err = selector
            .select(
                "w1",
                Amount::from_sat(50_000),
                1,
                FeeStrategy::Optimal,
                false,
                Some(Amount::from_sat(1_000)),
            )
            .unwrap_err();
        assert!(matches!(err, SelectError::InsufficientFunds { .. }));

        let sel = selector
            .select(
                "w1",
                Amount::from_sat(50_000),
                1,
                FeeStrategy::Optimal,
                true,
                Some(Amount::from_sat(1_000)),
            )
            .unwrap();
        assert_eq!(sel.utxos.len(), 1);
    }

    #[test]
    fn test_dust_change_folds_into_fee() {
        let listing = listing_with(&[(50_200, 4)]);
        let fees = oracle();
        let selector = CoinSelector::new(&listing, &fees);

        // 50_200 - 50_000 - 100 leaves 100 sat of change, below dust
        let sel = selector
            .select(
                "w1",
                Amount::from_sat(50_000),
                1,
                FeeStrategy::Optimal,
                false,
                Some(Amount::from_sat(100)),
            )
            .unwrap();

        assert_eq!(sel.change, Amount::ZERO);
        assert_eq!(sel.fee, Amount::from_sat(200));
        assert_eq!(sel.total(), Amount::from_sat(50_000) + sel.fee);
    }

    #[test]
    fn test_selection_locks_utxos() {
        let listing = listing_with(&[(100_000, 6)]);
        let fees = oracle();
        let selector = CoinSelector::new(&listing, &fees);

        let sel = selector
            .select(
                "w1",
                Amount::from_sat(50_000),
                1,
                FeeStrategy::Optimal,
                false,
                Some(Amount::from_sat(1_000)),
            )
            .unwrap();

        // The same coin cannot be selected again while locked
        let err = selector
            .select(
                "w1",
                Amount::from_sat(10_000),
                1,
                FeeStrategy::Optimal,
                false,
                Some(Amount::from_sat(1_000)),
            )
            .unwrap_err();
        assert!(matches!(err, SelectError::InsufficientFunds { .. }));

        listing.unlock(&sel.outpoints()).unwrap();
        assert!(selector
            .select(
                "w1",
                Amount::from_sat(10_000),
                1,
                FeeStrategy::Optimal,
                false,
                Some(Amount::from_sat(1_000)),
            )
            .is_ok());
    }

    #[test]
    fn test_fee_grows_with_inputs() {
        // Many small coins: the fixed-point must account for each added input
        let listing = listing_with(&[(30_000, 2), (30_000, 2), (30_000, 2), (30_000, 2)]);
        let fees = FixedFeeOracle::flat(Amount::from_sat(10_000));
        let selector = CoinSelector::new(&listing, &fees);

        let sel = selector
            .select("w1", Amount::from_sat(70_000), 1, FeeStrategy::Optimal, false, None)
            .unwrap();

        // 3 inputs needed: two cover 60k < 70k + fee
        assert_eq!(sel.utxos.len(), 3);
        let expected_fee = estimate_fee(estimate_size(3, 2), Amount::from_sat(10_000));
        assert_eq!(sel.fee, expected_fee);
        assert_eq!(sel.total(), Amount::from_sat(70_000) + sel.change + sel.fee);
    }

    #[test]
    fn test_strategy_string_roundtrip() {
        for s in [
            FeeStrategy::BaseFee,
            FeeStrategy::Optimal,
            FeeStrategy::LowPriority,
        ] {
            assert_eq!(s.to_string().parse::<FeeStrategy>().unwrap(), s);
        }
        assert!("fastest".parse::<FeeStrategy>().is_err());
    }
}
