//! Circle CCTP v2 building blocks for cross-chain USDC transfers.
//!
//! The CCTP flow has three steps:
//!
//! 1. **Burn**: `TokenMessengerV2.depositForBurn()` on the source chain
//! 2. **Attest**: Circle's Iris service signs the burn message
//! 3. **Mint**: `MessageTransmitterV2.receiveMessage()` on the destination chain
//!
//! This crate does not submit transactions itself. It provides the
//! calldata for steps 1 and 3 ([`cctp`]), the Iris fee oracle
//! ([`fee::FeeOracle`], implemented by [`iris::IrisClient`]) and the
//! cancellable attestation poller ([`attestation::AttestationPoller`]).
//! Submission is left to a `godshand_evm::SponsoredExecutor`.

use alloy::primitives::Bytes;

pub mod attestation;
pub mod cctp;
pub mod fee;
pub mod iris;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use attestation::{
    AttestationApi, AttestationError, AttestationLookup, AttestationPoller, CancelHandle,
    Cancellation, cancellation,
};
pub use fee::{FeeError, FeeOracle, FeePolicy, FeeQuote, FeeRate};
pub use iris::IrisClient;

/// Finality threshold requesting a fast (soft-finality) transfer.
pub const FAST_FINALITY_THRESHOLD: u32 = 1000;

/// Finality threshold requesting a standard (hard-finality) transfer.
pub const STANDARD_FINALITY_THRESHOLD: u32 = 2000;

/// Transfer speed tier, mapped to a CCTP finality threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpeedTier {
    Fast,
    Standard,
}

impl SpeedTier {
    pub const fn finality_threshold(self) -> u32 {
        match self {
            Self::Fast => FAST_FINALITY_THRESHOLD,
            Self::Standard => STANDARD_FINALITY_THRESHOLD,
        }
    }
}

impl std::fmt::Display for SpeedTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Standard => write!(f, "standard"),
        }
    }
}

/// Attested CCTP message, ready for `receiveMessage`.
///
/// Carries the message bytes as returned by Iris, which (unlike the
/// `MessageSent` event emitted by the burn) hold the real nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationMessage {
    pub message: Bytes,
    pub attestation: Bytes,
    pub status: String,
}
