//! EVM chain access and gas-sponsored execution.
//!
//! This crate provides two traits for interacting with EVM chains:
//!
//! - [`Evm`]: read-only chain access (chain id, account nonce and the
//!   ERC-20 / EIP-2612 reads the transfer flow depends on).
//!
//! - [`SponsoredExecutor`]: extends `Evm` with ERC-4337 submission of
//!   calls executed by an EIP-7702 delegated account, with gas paid in
//!   USDC through a paymaster. [`bundler::BundlerExecutor`] talks to a
//!   bundler JSON-RPC endpoint; [`mock::MockChain`] (behind the `mock`
//!   feature) scripts outcomes for tests.
//!
//! The [`sponsorship`] module produces the per-operation proofs (delegation
//! authorization and paymaster permit) that an executor consumes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use alloy::eips::eip7702::SignedAuthorization;
use alloy::primitives::{Address, B256, Bytes, TxHash, U256};
use alloy::sol_types::SolCall;
use alloy::transports::{RpcError, TransportErrorKind};
use async_trait::async_trait;
use tracing::warn;

pub mod bundler;
pub mod erc20;
pub mod rpc;
pub mod sponsorship;
pub mod user_operation;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use sponsorship::{
    OwnerSigner, PaymasterData, PermitSignature, SmartAccount, SmartAccountIdentity,
    SponsorshipConfig, SponsorshipError, authorize_delegation, derive_smart_account,
    paymaster_data, sign_gas_permit,
};

/// Errors that can occur during chain reads and sponsored execution.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("transport error: {0}")]
    Transport(#[from] RpcError<TransportErrorKind>),
    #[error("contract error: {0}")]
    Contract(#[from] alloy::contract::Error),
    #[error("signer error: {0}")]
    Signer(#[from] alloy::signers::Error),
    #[error(
        "stale delegation authorization: signed for nonce {authorized}, \
         account {account} is at nonce {current}"
    )]
    StaleAuthorization {
        account: Address,
        authorized: u64,
        current: u64,
    },
    #[error("user operation {handle} was not included within {timeout:?}")]
    InclusionTimeout {
        handle: OperationHandle,
        timeout: Duration,
    },
    #[error("user operation {handle} reverted in transaction {tx_hash}")]
    ExecutionReverted {
        handle: OperationHandle,
        tx_hash: TxHash,
    },
    #[error("connected to chain {actual}, expected chain {expected}")]
    ChainIdMismatch { expected: u64, actual: u64 },
    #[error("no calls to execute")]
    EmptyBatch,
}

impl ChainError {
    /// Whether submitting the same calls again with fresh proofs can succeed.
    ///
    /// Reverted executions and transport-level failures are transient;
    /// JSON-RPC error responses, signing failures and stale proofs are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ExecutionReverted { .. } => true,
            Self::Transport(err) | Self::Contract(alloy::contract::Error::TransportError(err)) => {
                matches!(err, RpcError::Transport(_) | RpcError::NullResp)
            }
            _ => false,
        }
    }
}

/// A single contract call executed by the delegated account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

impl Call {
    /// ABI-encodes `call` against the contract at `to`, sending no value.
    pub fn contract<C: SolCall>(to: Address, call: &C) -> Self {
        Self {
            to,
            value: U256::ZERO,
            data: call.abi_encode().into(),
        }
    }
}

/// Handle returned by the bundler for a submitted user operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationHandle {
    pub user_op_hash: B256,
    pub sender: Address,
}

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_op_hash)
    }
}

/// On-chain inclusion of a user operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inclusion {
    pub transaction_hash: TxHash,
    pub success: bool,
}

/// Read-only chain access.
#[async_trait]
pub trait Evm: Send + Sync + 'static {
    /// EIP-155 chain id of the connected chain.
    fn chain_id(&self) -> u64;

    /// Current transaction nonce of `account`.
    async fn transaction_count(&self, account: Address) -> Result<u64, ChainError>;

    async fn read_balance(&self, token: Address, owner: Address) -> Result<U256, ChainError>;

    async fn read_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, ChainError>;

    /// EIP-712 domain `name` and `version` of an EIP-2612 token.
    async fn permit_domain(&self, token: Address) -> Result<PermitDomain, ChainError>;

    /// EIP-2612 `nonces(owner)` of `token`.
    async fn permit_nonce(&self, token: Address, owner: Address) -> Result<U256, ChainError>;
}

/// Token metadata entering the EIP-712 domain of a permit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermitDomain {
    pub name: String,
    pub version: String,
}

/// Gas-sponsored execution on a chain.
///
/// Extends [`Evm`] with submission of calls on behalf of a delegated smart
/// account. Submission returns as soon as the bundler accepts the
/// operation; [`await_inclusion`](SponsoredExecutor::await_inclusion)
/// waits for it to land on-chain.
#[async_trait]
pub trait SponsoredExecutor: Evm {
    /// Submits `calls` as one user operation executed by `account`.
    ///
    /// Fails with [`ChainError::StaleAuthorization`] when the authorization
    /// nonce differs from the account's current transaction nonce.
    async fn submit_sponsored_call(
        &self,
        account: &SmartAccount,
        calls: Vec<Call>,
        authorization: SignedAuthorization,
        paymaster: PaymasterData,
    ) -> Result<OperationHandle, ChainError>;

    /// Single lookup of the operation's receipt; `None` while pending.
    async fn operation_receipt(
        &self,
        handle: &OperationHandle,
    ) -> Result<Option<Inclusion>, ChainError>;

    /// Interval between receipt lookups in [`await_inclusion`](SponsoredExecutor::await_inclusion).
    fn receipt_poll_interval(&self) -> Duration {
        Duration::from_secs(2)
    }

    /// Waits until the operation is included, bounded by `timeout`.
    ///
    /// Transient lookup errors are retried until the deadline. Fails with
    /// [`ChainError::InclusionTimeout`] when the deadline passes and
    /// [`ChainError::ExecutionReverted`] when the operation landed but its
    /// execution failed.
    async fn await_inclusion(
        &self,
        handle: &OperationHandle,
        timeout: Duration,
    ) -> Result<Inclusion, ChainError> {
        let interval = self.receipt_poll_interval();

        // The operation is already broadcast, so transient lookup errors
        // must not end the wait before the deadline.
        let lookup = async {
            loop {
                match self.operation_receipt(handle).await {
                    Ok(Some(inclusion)) => return Ok::<_, ChainError>(inclusion),
                    Ok(None) => {}
                    Err(error) if error.is_transient() => {
                        warn!(%handle, %error, "Receipt lookup failed, retrying");
                    }
                    Err(error) => return Err(error),
                }
                tokio::time::sleep(interval).await;
            }
        };

        let inclusion = tokio::time::timeout(timeout, lookup)
            .await
            .map_err(|_| ChainError::InclusionTimeout {
                handle: *handle,
                timeout,
            })??;

        if !inclusion.success {
            return Err(ChainError::ExecutionReverted {
                handle: *handle,
                tx_hash: inclusion.transaction_hash,
            });
        }

        Ok(inclusion)
    }
}

#[async_trait]
impl<T: Evm + ?Sized> Evm for Arc<T> {
    fn chain_id(&self) -> u64 {
        (**self).chain_id()
    }

    async fn transaction_count(&self, account: Address) -> Result<u64, ChainError> {
        (**self).transaction_count(account).await
    }

    async fn read_balance(&self, token: Address, owner: Address) -> Result<U256, ChainError> {
        (**self).read_balance(token, owner).await
    }

    async fn read_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, ChainError> {
        (**self).read_allowance(token, owner, spender).await
    }

    async fn permit_domain(&self, token: Address) -> Result<PermitDomain, ChainError> {
        (**self).permit_domain(token).await
    }

    async fn permit_nonce(&self, token: Address, owner: Address) -> Result<U256, ChainError> {
        (**self).permit_nonce(token, owner).await
    }
}

#[async_trait]
impl<T: SponsoredExecutor + ?Sized> SponsoredExecutor for Arc<T> {
    async fn submit_sponsored_call(
        &self,
        account: &SmartAccount,
        calls: Vec<Call>,
        authorization: SignedAuthorization,
        paymaster: PaymasterData,
    ) -> Result<OperationHandle, ChainError> {
        (**self)
            .submit_sponsored_call(account, calls, authorization, paymaster)
            .await
    }

    async fn operation_receipt(
        &self,
        handle: &OperationHandle,
    ) -> Result<Option<Inclusion>, ChainError> {
        (**self).operation_receipt(handle).await
    }

    fn receipt_poll_interval(&self) -> Duration {
        (**self).receipt_poll_interval()
    }

    async fn await_inclusion(
        &self,
        handle: &OperationHandle,
        timeout: Duration,
    ) -> Result<Inclusion, ChainError> {
        (**self).await_inclusion(handle, timeout).await
    }
}
