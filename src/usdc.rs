//! Human-readable USDC amounts.
//!
//! USDC has 6 decimals on every supported chain; on-chain amounts are
//! base units (`1 USDC = 1_000_000`).

use std::fmt::Display;
use std::str::FromStr;

use alloy::primitives::U256;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;

const USDC_DECIMALS: u32 = 6;

/// A USDC amount in whole-token units (e.g. `10.5`).
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Usdc(pub Decimal);

impl FromStr for Usdc {
    type Err = rust_decimal::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(value.trim()).map(Self)
    }
}

impl Display for Usdc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UsdcConversionError {
    #[error("USDC amount cannot be negative: {0}")]
    NegativeValue(Decimal),
    #[error("USDC amount {0} has more than 6 decimal places")]
    TooPrecise(Decimal),
    #[error("USDC amount {0} does not fit in base units")]
    Overflow(Decimal),
}

impl Usdc {
    /// Converts to base units, rejecting sub-micro precision.
    pub fn to_base_units(self) -> Result<U256, UsdcConversionError> {
        if self.0.is_sign_negative() && !self.0.is_zero() {
            return Err(UsdcConversionError::NegativeValue(self.0));
        }

        let scaled = self
            .0
            .checked_mul(Decimal::from(10u64.pow(USDC_DECIMALS)))
            .ok_or(UsdcConversionError::Overflow(self.0))?;

        if scaled.fract() != Decimal::ZERO {
            return Err(UsdcConversionError::TooPrecise(self.0));
        }

        scaled
            .to_u128()
            .map(U256::from)
            .ok_or(UsdcConversionError::Overflow(self.0))
    }

    /// Whole-token amount of `base_units`, or `None` past `Decimal` range.
    pub fn from_base_units(base_units: U256) -> Option<Self> {
        let units = i128::try_from(u128::try_from(base_units).ok()?).ok()?;
        Decimal::try_from_i128_with_scale(units, USDC_DECIMALS)
            .ok()
            .map(Self)
    }
}

/// `"12.5 USDC"` for base units, falling back to the raw integer.
pub fn format_usdc(base_units: U256) -> String {
    Usdc::from_base_units(base_units).map_or_else(
        || format!("{base_units} base units"),
        |amount| format!("{amount} USDC"),
    )
}
