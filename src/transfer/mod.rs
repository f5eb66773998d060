//! Cross-chain USDC transfer state machine.
//!
//! A transfer moves through
//! `Idle -> Approving -> Burning -> WaitingAttestation -> Minting -> Completed`,
//! or `Idle -> Approving -> Completed` when source and destination are the
//! same chain. Any step can end in `Error`. Progress is published as
//! [`TransferProgress`] snapshots on a `watch` channel.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::Duration;

use alloy::primitives::{Address, TxHash, U256};
use chrono::{DateTime, Local};
use godshand_bridge::{AttestationError, FeeError, FeePolicy, SpeedTier};
use godshand_evm::{ChainError, OperationHandle, SponsorshipError};

use crate::chain::ChainKey;

mod identity;
mod orchestrator;
mod retry;

pub use identity::SigningIdentity;
pub use orchestrator::TransferOrchestrator;
pub use retry::{LinearBackoff, LinearRetry};

/// 10 000 USDC in base units.
const DEFAULT_APPROVAL_CAP: u64 = 10_000_000_000;

/// What the caller asks for; resolved into a [`TransferRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOrder {
    pub source_chain: ChainKey,
    /// Base units (6 decimals).
    pub amount: U256,
    pub speed: SpeedTier,
    /// Defaults to the sender for cross-chain transfers.
    pub destination_address: Option<Address>,
}

/// Accepted transfer; immutable for the rest of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub source_chain: ChainKey,
    pub destination_chain: ChainKey,
    pub amount: U256,
    pub speed: SpeedTier,
    pub destination_address: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferState {
    #[default]
    Idle,
    Approving,
    Burning,
    WaitingAttestation,
    Minting,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransactionRole {
    Approval,
    Burn,
    Mint,
    /// Same-chain `transfer` replacing the burn and mint.
    DirectTransfer,
}

impl Display for TransactionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approval => write!(f, "Approval"),
            Self::Burn => write!(f, "Burn"),
            Self::Mint => write!(f, "Mint"),
            Self::DirectTransfer => write!(f, "Transfer"),
        }
    }
}

/// Transaction hashes by role, filled as the transfer progresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionRecord(BTreeMap<TransactionRole, TxHash>);

impl TransactionRecord {
    pub fn get(&self, role: TransactionRole) -> Option<TxHash> {
        self.0.get(&role).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TransactionRole, TxHash)> + '_ {
        self.0.iter().map(|(role, tx)| (*role, *tx))
    }

    fn insert(&mut self, role: TransactionRole, tx_hash: TxHash) {
        self.0.insert(role, tx_hash);
    }
}

/// Timestamped progress line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub at: DateTime<Local>,
    pub message: String,
}

impl LogLine {
    fn now(message: impl Into<String>) -> Self {
        Self {
            at: Local::now(),
            message: message.into(),
        }
    }
}

impl Display for LogLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.at.format("%H:%M:%S"), self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    UnknownChain,
    InvalidRequest,
    QuoteUnavailable,
    InsufficientAmount,
    StaleAuthorization,
    PermitSigningFailed,
    InclusionTimeout,
    ExecutionReverted,
    ApprovalNotVisible,
    AttestationFailed,
    Cancelled,
    MintFailed,
    Chain,
}

/// Why and where a transfer stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub kind: FailureKind,
    /// State the transfer was in when it failed.
    pub step: TransferState,
    pub message: String,
    /// Set once a burn was included; its funds can still be minted.
    pub burn_tx: Option<TxHash>,
    /// Burn operation accepted by the bundler whose inclusion was never
    /// confirmed. Its receipt decides whether funds left the source chain.
    pub burn_operation: Option<OperationHandle>,
}

/// Snapshot published after every change.
#[derive(Debug, Clone, Default)]
pub struct TransferProgress {
    pub state: TransferState,
    pub request: Option<TransferRequest>,
    pub logs: Vec<LogLine>,
    pub transactions: TransactionRecord,
    pub failure: Option<TransferFailure>,
    /// Submitted burn, kept until the mint lands.
    pub burn_operation: Option<OperationHandle>,
    run: u64,
    claimed: bool,
}

impl TransferProgress {
    /// A burn was broadcast but nothing was minted yet.
    pub fn funds_in_flight(&self) -> bool {
        let burned = self.transactions.get(TransactionRole::Burn).is_some()
            || self.burn_operation.is_some();

        burned && self.transactions.get(TransactionRole::Mint).is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPolicy {
    /// Allowance granted to the token messenger when approval is needed.
    pub approval_cap: U256,
    pub fees: FeePolicy,
    pub inclusion_timeout: Duration,
    pub attestation_poll_interval: Duration,
    /// `None` polls until completion or cancellation.
    pub attestation_max_attempts: Option<usize>,
    pub mint_retry: LinearRetry,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            approval_cap: U256::from(DEFAULT_APPROVAL_CAP),
            fees: FeePolicy::default(),
            inclusion_timeout: Duration::from_secs(180),
            attestation_poll_interval: godshand_bridge::attestation::DEFAULT_POLL_INTERVAL,
            attestation_max_attempts: None,
            mint_retry: LinearRetry::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("unknown chain {0}")]
    UnknownChain(ChainKey),
    #[error("invalid transfer request: {0}")]
    InvalidRequest(String),
    #[error("fee quote unavailable: {0}")]
    QuoteUnavailable(#[source] FeeError),
    #[error("insufficient amount: {amount} base units does not cover the {fee} base unit fee")]
    InsufficientAmount { amount: U256, fee: U256 },
    #[error(
        "stale delegation authorization for {account}: signed for nonce {authorized}, \
         current nonce is {current}"
    )]
    StaleAuthorization {
        account: Address,
        authorized: u64,
        current: u64,
    },
    #[error("permit signature recovers to {recovered:?} instead of {owner}")]
    PermitSigningFailed {
        owner: Address,
        recovered: Option<Address>,
    },
    #[error("user operation {handle} was not included within {timeout:?}")]
    InclusionTimeout {
        handle: OperationHandle,
        timeout: Duration,
    },
    #[error("execution reverted in transaction {tx_hash}")]
    ExecutionReverted { tx_hash: TxHash },
    #[error("approval confirmed but allowance is {allowance}, need {required}")]
    ApprovalNotVisible { allowance: U256, required: U256 },
    #[error("attestation failed: {0}")]
    AttestationFailed(#[source] AttestationError),
    #[error("cancelled while waiting for attestation")]
    Cancelled,
    #[error("mint failed after {attempts} attempts: {source}")]
    MintFailed {
        attempts: usize,
        source: Box<TransferError>,
    },
    #[error("signer error: {0}")]
    Signer(#[from] alloy::signers::Error),
    #[error(transparent)]
    Chain(ChainError),
}

impl TransferError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::UnknownChain(_) => FailureKind::UnknownChain,
            Self::InvalidRequest(_) => FailureKind::InvalidRequest,
            Self::QuoteUnavailable(_) => FailureKind::QuoteUnavailable,
            Self::InsufficientAmount { .. } => FailureKind::InsufficientAmount,
            Self::StaleAuthorization { .. } => FailureKind::StaleAuthorization,
            Self::PermitSigningFailed { .. } => FailureKind::PermitSigningFailed,
            Self::InclusionTimeout { .. } => FailureKind::InclusionTimeout,
            Self::ExecutionReverted { .. } => FailureKind::ExecutionReverted,
            Self::ApprovalNotVisible { .. } => FailureKind::ApprovalNotVisible,
            Self::AttestationFailed(_) => FailureKind::AttestationFailed,
            Self::Cancelled => FailureKind::Cancelled,
            Self::MintFailed { .. } => FailureKind::MintFailed,
            Self::Signer(_) | Self::Chain(_) => FailureKind::Chain,
        }
    }

    /// Reverted executions and transport failures; see
    /// [`ChainError::is_transient`].
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ExecutionReverted { .. } => true,
            Self::Chain(error) => error.is_transient(),
            _ => false,
        }
    }
}

impl From<ChainError> for TransferError {
    fn from(error: ChainError) -> Self {
        match error {
            ChainError::StaleAuthorization {
                account,
                authorized,
                current,
            } => Self::StaleAuthorization {
                account,
                authorized,
                current,
            },
            ChainError::InclusionTimeout { handle, timeout } => {
                Self::InclusionTimeout { handle, timeout }
            }
            ChainError::ExecutionReverted { tx_hash, .. } => Self::ExecutionReverted { tx_hash },
            other => Self::Chain(other),
        }
    }
}

impl From<SponsorshipError> for TransferError {
    fn from(error: SponsorshipError) -> Self {
        match error {
            SponsorshipError::Chain(error) => error.into(),
            SponsorshipError::Signer(error) => Self::Signer(error),
            SponsorshipError::PermitSigningFailed { owner, recovered } => {
                Self::PermitSigningFailed { owner, recovered }
            }
        }
    }
}

impl From<AttestationError> for TransferError {
    fn from(error: AttestationError) -> Self {
        match error {
            AttestationError::Cancelled => Self::Cancelled,
            other => Self::AttestationFailed(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverted_execution_is_transient_but_timeouts_are_not() {
        let reverted: TransferError = ChainError::ExecutionReverted {
            handle: OperationHandle {
                user_op_hash: Default::default(),
                sender: Address::ZERO,
            },
            tx_hash: TxHash::repeat_byte(1),
        }
        .into();
        let timeout: TransferError = ChainError::InclusionTimeout {
            handle: OperationHandle {
                user_op_hash: Default::default(),
                sender: Address::ZERO,
            },
            timeout: Duration::from_secs(180),
        }
        .into();

        assert!(reverted.is_transient());
        assert_eq!(reverted.kind(), FailureKind::ExecutionReverted);
        assert!(!timeout.is_transient());
        assert_eq!(timeout.kind(), FailureKind::InclusionTimeout);
    }

    #[test]
    fn cancelled_attestation_maps_to_cancelled() {
        let error: TransferError = AttestationError::Cancelled.into();

        assert_eq!(error.kind(), FailureKind::Cancelled);
    }

    #[test]
    fn unavailable_quote_has_its_own_kind() {
        let error = TransferError::QuoteUnavailable(FeeError::UnexpectedStatus { status: 503 });

        assert_eq!(error.kind(), FailureKind::QuoteUnavailable);
        assert!(!error.is_transient());
    }

    #[test]
    fn direct_transfer_renders_as_transfer() {
        assert_eq!(TransactionRole::DirectTransfer.to_string(), "Transfer");
        assert_eq!(TransactionRole::Burn.to_string(), "Burn");
    }

    #[test]
    fn submitted_burn_counts_as_funds_in_flight() {
        let mut progress = TransferProgress {
            burn_operation: Some(OperationHandle {
                user_op_hash: Default::default(),
                sender: Address::ZERO,
            }),
            ..TransferProgress::default()
        };
        assert!(progress.funds_in_flight());

        progress
            .transactions
            .insert(TransactionRole::Mint, TxHash::repeat_byte(2));
        assert!(!progress.funds_in_flight());
    }

    #[test]
    fn log_lines_render_with_clock_prefix() {
        let line = LogLine::now("Burning USDC...");
        let rendered = line.to_string();

        assert!(rendered.starts_with('['));
        assert!(rendered.ends_with("] Burning USDC..."));
        assert_eq!(rendered.len(), "[00:00:00] Burning USDC...".len());
    }
}
