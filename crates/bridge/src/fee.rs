//! CCTP transfer fee quotes.
//!
//! Iris publishes the minimum fee per finality threshold in basis points.
//! The fee actually passed as `maxFee` to `depositForBurn` is
//! `max(amount * bps / 10_000, floor_fee)`.

use std::sync::Arc;

use alloy::primitives::U256;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::SpeedTier;

const BPS_DENOMINATOR: u64 = 10_000;

/// 0.1 USDC in base units.
pub const DEFAULT_FLOOR_FEE: u64 = 100_000;

/// 5 USDC in base units.
pub const DEFAULT_FALLBACK_FEE: u64 = 5_000_000;

#[derive(Debug, thiserror::Error)]
pub enum FeeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("fee endpoint returned HTTP {status}")]
    UnexpectedStatus { status: u16 },
    #[error("malformed fee response: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("no fee entry for finality threshold {finality_threshold}")]
    ThresholdNotQuoted { finality_threshold: u32 },
    #[error("fee calculation overflow")]
    FeeCalculationOverflow,
}

/// Fee rate published for one finality threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeRate {
    pub minimum_fee_bps: u64,
    pub finality_threshold: u32,
}

/// Fee quote for one transfer amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeQuote {
    pub minimum_fee_bps: u64,
    pub finality_threshold: u32,
    pub computed_fee: U256,
    pub floor_fee: U256,
}

impl FeeQuote {
    /// Quote for `amount` at `rate`, never below `floor_fee`.
    pub fn from_rate(amount: U256, rate: FeeRate, floor_fee: U256) -> Result<Self, FeeError> {
        let computed_fee = amount
            .checked_mul(U256::from(rate.minimum_fee_bps))
            .ok_or(FeeError::FeeCalculationOverflow)?
            / U256::from(BPS_DENOMINATOR);

        Ok(Self {
            minimum_fee_bps: rate.minimum_fee_bps,
            finality_threshold: rate.finality_threshold,
            computed_fee,
            floor_fee,
        })
    }

    /// `maxFee` to burn with.
    pub fn effective_fee(&self) -> U256 {
        self.computed_fee.max(self.floor_fee)
    }

    /// Whether `amount` leaves something to mint after the fee.
    pub fn covers(&self, amount: U256) -> bool {
        amount > self.effective_fee()
    }
}

/// Floor and fallback fees applied around oracle quotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeePolicy {
    pub floor_fee: U256,
    pub fallback_fee: U256,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            floor_fee: U256::from(DEFAULT_FLOOR_FEE),
            fallback_fee: U256::from(DEFAULT_FALLBACK_FEE),
        }
    }
}

impl FeePolicy {
    /// Quote used when the oracle cannot be reached.
    pub fn fallback_quote(&self, speed: SpeedTier) -> FeeQuote {
        FeeQuote {
            minimum_fee_bps: 0,
            finality_threshold: speed.finality_threshold(),
            computed_fee: self.fallback_fee,
            floor_fee: self.floor_fee,
        }
    }
}

/// Source of CCTP fee rates.
#[async_trait]
pub trait FeeOracle: Send + Sync + 'static {
    /// Fee rate for transfers between two CCTP domains at `speed`.
    async fn fee_rate(
        &self,
        source_domain: u32,
        destination_domain: u32,
        speed: SpeedTier,
    ) -> Result<FeeRate, FeeError>;

    /// Fee quote for `amount`.
    ///
    /// Fails when the oracle is unreachable or answers with unusable data;
    /// callers substitute [`FeePolicy::fallback_quote`] rather than abort.
    async fn quote_fee(
        &self,
        source_domain: u32,
        destination_domain: u32,
        amount: U256,
        speed: SpeedTier,
        policy: &FeePolicy,
    ) -> Result<FeeQuote, FeeError> {
        let rate = self
            .fee_rate(source_domain, destination_domain, speed)
            .await?;
        let quote = FeeQuote::from_rate(amount, rate, policy.floor_fee)?;

        info!(
            source_domain,
            destination_domain,
            bps = rate.minimum_fee_bps,
            computed_fee = %quote.computed_fee,
            effective_fee = %quote.effective_fee(),
            "Quoted CCTP fee"
        );

        Ok(quote)
    }

    /// [`quote_fee`](FeeOracle::quote_fee), falling back to the policy's
    /// fallback quote on failure.
    async fn quote_fee_or_fallback(
        &self,
        source_domain: u32,
        destination_domain: u32,
        amount: U256,
        speed: SpeedTier,
        policy: &FeePolicy,
    ) -> (FeeQuote, Option<FeeError>) {
        match self
            .quote_fee(source_domain, destination_domain, amount, speed, policy)
            .await
        {
            Ok(quote) => (quote, None),
            Err(error) => {
                warn!(%error, fallback_fee = %policy.fallback_fee, "Fee quote unavailable");
                (policy.fallback_quote(speed), Some(error))
            }
        }
    }
}

#[async_trait]
impl<T: FeeOracle + ?Sized> FeeOracle for Arc<T> {
    async fn fee_rate(
        &self,
        source_domain: u32,
        destination_domain: u32,
        speed: SpeedTier,
    ) -> Result<FeeRate, FeeError> {
        (**self)
            .fee_rate(source_domain, destination_domain, speed)
            .await
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::mock::MockFeeOracle;

    fn usdc(whole: u64) -> U256 {
        U256::from(whole * 1_000_000)
    }

    #[test]
    fn ten_usdc_at_one_bps_hits_the_floor() {
        let quote = FeeQuote::from_rate(
            usdc(10),
            FeeRate {
                minimum_fee_bps: 1,
                finality_threshold: 1000,
            },
            U256::from(DEFAULT_FLOOR_FEE),
        )
        .unwrap();

        assert_eq!(quote.computed_fee, U256::from(1_000));
        assert_eq!(quote.effective_fee(), U256::from(100_000));
        assert!(quote.covers(usdc(10)));
    }

    #[test]
    fn large_amounts_pay_the_proportional_fee() {
        let quote = FeeQuote::from_rate(
            usdc(5_000),
            FeeRate {
                minimum_fee_bps: 1,
                finality_threshold: 1000,
            },
            U256::from(DEFAULT_FLOOR_FEE),
        )
        .unwrap();

        assert_eq!(quote.effective_fee(), U256::from(500_000));
    }

    #[test]
    fn amount_equal_to_fee_is_not_covered() {
        let quote = FeePolicy::default().fallback_quote(SpeedTier::Standard);

        assert_eq!(quote.effective_fee(), usdc(5));
        assert!(!quote.covers(usdc(5)));
        assert!(quote.covers(usdc(5) + U256::from(1)));
    }

    #[test]
    fn overflow_is_reported() {
        let error = FeeQuote::from_rate(
            U256::MAX,
            FeeRate {
                minimum_fee_bps: 2,
                finality_threshold: 1000,
            },
            U256::ZERO,
        )
        .unwrap_err();

        assert!(matches!(error, FeeError::FeeCalculationOverflow));
    }

    #[tokio::test]
    async fn unavailable_oracle_falls_back() {
        let oracle = MockFeeOracle::failing();

        let (quote, error) = oracle
            .quote_fee_or_fallback(6, 0, usdc(100), SpeedTier::Fast, &FeePolicy::default())
            .await;

        assert!(error.is_some());
        assert_eq!(quote.minimum_fee_bps, 0);
        assert_eq!(quote.effective_fee(), usdc(5));
        assert_eq!(quote.finality_threshold, 1000);
    }

    proptest! {
        #[test]
        fn effective_fee_never_below_floor_or_computed(
            amount in 0u64..u64::MAX,
            bps in 0u64..10_000,
            floor in 0u64..10_000_000,
        ) {
            let quote = FeeQuote::from_rate(
                U256::from(amount),
                FeeRate { minimum_fee_bps: bps, finality_threshold: 2000 },
                U256::from(floor),
            ).unwrap();

            prop_assert!(quote.effective_fee() >= U256::from(floor));
            prop_assert!(quote.effective_fee() >= quote.computed_fee);
            prop_assert!(quote.computed_fee <= U256::from(amount));
        }
    }
}
