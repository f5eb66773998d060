//! [`Evm`] reads over a plain JSON-RPC provider.

use alloy::primitives::{Address, U256};
use alloy::providers::Provider;
use async_trait::async_trait;
use tracing::debug;

use crate::erc20::IERC20Permit;
use crate::{ChainError, Evm, PermitDomain};

/// Chain reads against a JSON-RPC endpoint.
///
/// The chain id is read once on connect so that the configured chain and
/// the endpoint can be checked against each other before anything is
/// signed for it.
#[derive(Debug, Clone)]
pub struct RpcEvm<P> {
    provider: P,
    chain_id: u64,
}

impl<P: Provider + Clone> RpcEvm<P> {
    /// Connects to `provider` and verifies it serves `expected_chain_id`.
    pub async fn connect(provider: P, expected_chain_id: u64) -> Result<Self, ChainError> {
        let chain_id = provider.get_chain_id().await?;

        if chain_id != expected_chain_id {
            return Err(ChainError::ChainIdMismatch {
                expected: expected_chain_id,
                actual: chain_id,
            });
        }

        debug!(chain_id, "Connected to chain RPC");
        Ok(Self { provider, chain_id })
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }
}

#[async_trait]
impl<P> Evm for RpcEvm<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn transaction_count(&self, account: Address) -> Result<u64, ChainError> {
        Ok(self.provider.get_transaction_count(account).await?)
    }

    async fn read_balance(&self, token: Address, owner: Address) -> Result<U256, ChainError> {
        let token = IERC20Permit::new(token, &self.provider);
        Ok(token.balanceOf(owner).call().await?)
    }

    async fn read_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, ChainError> {
        let token = IERC20Permit::new(token, &self.provider);
        Ok(token.allowance(owner, spender).call().await?)
    }

    async fn permit_domain(&self, token: Address) -> Result<PermitDomain, ChainError> {
        let token = IERC20Permit::new(token, &self.provider);
        let name = token.name().call().await?;
        let version = token.version().call().await?;

        Ok(PermitDomain { name, version })
    }

    async fn permit_nonce(&self, token: Address, owner: Address) -> Result<U256, ChainError> {
        let token = IERC20Permit::new(token, &self.provider);
        Ok(token.nonces(owner).call().await?)
    }
}
