//! Chains the orchestrator can move USDC between.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::Address;
use godshand_evm::{SponsoredExecutor, SponsorshipConfig};
use serde::Deserialize;

use crate::transfer::TransferError;

/// Configuration key of a chain, e.g. `base_sepolia`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(transparent)]
pub struct ChainKey(String);

impl ChainKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ChainKey {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self(value.to_string()))
    }
}

impl Display for ChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Static per-chain parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainProfile {
    pub key: ChainKey,
    pub chain_id: u64,
    /// CCTP domain, distinct from the EVM chain id.
    pub domain: u32,
    pub usdc: Address,
    pub token_messenger: Address,
    pub message_transmitter: Address,
    pub sponsorship: SponsorshipConfig,
}

/// A configured chain and the client submitting sponsored calls to it.
#[derive(Clone)]
pub struct ChainEntry {
    pub profile: ChainProfile,
    pub executor: Arc<dyn SponsoredExecutor>,
}

impl std::fmt::Debug for ChainEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainEntry")
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

/// Chain table plus the settlement chain every transfer mints on.
#[derive(Debug, Clone)]
pub struct ChainRegistry {
    chains: HashMap<ChainKey, ChainEntry>,
    settlement: ChainKey,
}

impl ChainRegistry {
    pub fn new(settlement: ChainKey) -> Self {
        Self {
            chains: HashMap::new(),
            settlement,
        }
    }

    #[must_use]
    pub fn with_chain(mut self, profile: ChainProfile, executor: Arc<dyn SponsoredExecutor>) -> Self {
        self.chains
            .insert(profile.key.clone(), ChainEntry { profile, executor });
        self
    }

    pub fn get(&self, key: &ChainKey) -> Result<&ChainEntry, TransferError> {
        self.chains
            .get(key)
            .ok_or_else(|| TransferError::UnknownChain(key.clone()))
    }

    pub fn settlement(&self) -> &ChainKey {
        &self.settlement
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::address;
    use godshand_evm::mock::MockChain;

    use super::*;
    use crate::transfer::TransferError;

    fn profile(key: &str, chain_id: u64, domain: u32) -> ChainProfile {
        ChainProfile {
            key: ChainKey::new(key),
            chain_id,
            domain,
            usdc: address!("0x036CbD53842c5426634e7929541eC2318f3dCF7e"),
            token_messenger: address!("0x8FE6B999Dc680CcFDD5Bf7EB0974218be2542DAA"),
            message_transmitter: address!("0xE737e5cEBEEBa77EFE34D4aa090756590b1CE275"),
            sponsorship: SponsorshipConfig::default(),
        }
    }

    #[test]
    fn unknown_chain_is_rejected() {
        let registry = ChainRegistry::new(ChainKey::new("base_sepolia")).with_chain(
            profile("base_sepolia", 84532, 6),
            Arc::new(MockChain::new(84532)),
        );

        assert_eq!(registry.get(&ChainKey::new("base_sepolia")).unwrap().profile.domain, 6);
        assert!(matches!(
            registry.get(&ChainKey::new("solana")),
            Err(TransferError::UnknownChain(key)) if key.as_str() == "solana"
        ));
    }
}
