//! Gas-sponsored USDC transfers over Circle CCTP v2.
//!
//! Burns USDC on a source chain, waits for Circle's attestation and mints
//! on a fixed settlement chain. Every on-chain step runs as an ERC-4337
//! user operation from the sender's EIP-7702 delegated account, with gas
//! paid in USDC through a permit-based paymaster.

pub mod chain;
pub mod cli;
pub mod config;
pub mod transfer;
pub mod usdc;

pub use chain::{ChainEntry, ChainKey, ChainProfile, ChainRegistry};
pub use config::{ConfigError, Ctx, LogLevel, setup_tracing};
pub use transfer::{
    FailureKind, TransactionRole, TransferError, TransferFailure, TransferOrchestrator,
    TransferOrder, TransferPolicy, TransferProgress, TransferState,
};
