//! [`SponsoredExecutor`] backed by an ERC-4337 bundler.
//!
//! Chain reads go to the regular RPC endpoint through [`RpcEvm`]; user
//! operations go to the bundler endpoint as raw JSON-RPC requests, since
//! the `eth_*UserOperation*` and `pimlico_*` methods are not part of the
//! standard provider API.

use std::time::Duration;

use alloy::eips::eip7702::SignedAuthorization;
use alloy::primitives::aliases::U192;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{Provider, RootProvider};
use async_trait::async_trait;
use tracing::{debug, info, instrument};
use url::Url;

use crate::rpc::RpcEvm;
use crate::user_operation::{
    GasEstimate, GasPriceTiers, IEntryPoint, UserOperation, UserOperationReceipt, encode_calls,
};
use crate::{
    Call, ChainError, Evm, Inclusion, OperationHandle, PaymasterData, PermitDomain, SmartAccount,
    SponsoredExecutor,
};

const NO_PARAMS: [(); 0] = [];

/// Chain execution client submitting sponsored calls through a bundler.
#[derive(Debug, Clone)]
pub struct BundlerExecutor<P> {
    chain: RpcEvm<P>,
    bundler: RootProvider,
    entry_point: Address,
    receipt_poll_interval: Duration,
}

impl<P: Provider + Clone> BundlerExecutor<P> {
    pub fn new(chain: RpcEvm<P>, bundler_url: Url, entry_point: Address) -> Self {
        Self {
            chain,
            bundler: RootProvider::new_http(bundler_url),
            entry_point,
            receipt_poll_interval: Duration::from_secs(2),
        }
    }

    #[must_use]
    pub fn with_receipt_poll_interval(mut self, interval: Duration) -> Self {
        self.receipt_poll_interval = interval;
        self
    }

    async fn gas_price(&self) -> Result<GasPriceTiers, ChainError> {
        Ok(self
            .bundler
            .raw_request("pimlico_getUserOperationGasPrice".into(), NO_PARAMS)
            .await?)
    }

    async fn estimate_gas(&self, op: &UserOperation) -> Result<GasEstimate, ChainError> {
        Ok(self
            .bundler
            .raw_request(
                "eth_estimateUserOperationGas".into(),
                (op.clone(), self.entry_point),
            )
            .await?)
    }

    async fn send(&self, op: &UserOperation) -> Result<B256, ChainError> {
        Ok(self
            .bundler
            .raw_request("eth_sendUserOperation".into(), (op.clone(), self.entry_point))
            .await?)
    }
}

#[async_trait]
impl<P> Evm for BundlerExecutor<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    fn chain_id(&self) -> u64 {
        self.chain.chain_id()
    }

    async fn transaction_count(&self, account: Address) -> Result<u64, ChainError> {
        self.chain.transaction_count(account).await
    }

    async fn read_balance(&self, token: Address, owner: Address) -> Result<U256, ChainError> {
        self.chain.read_balance(token, owner).await
    }

    async fn read_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, ChainError> {
        self.chain.read_allowance(token, owner, spender).await
    }

    async fn permit_domain(&self, token: Address) -> Result<PermitDomain, ChainError> {
        self.chain.permit_domain(token).await
    }

    async fn permit_nonce(&self, token: Address, owner: Address) -> Result<U256, ChainError> {
        self.chain.permit_nonce(token, owner).await
    }
}

#[async_trait]
impl<P> SponsoredExecutor for BundlerExecutor<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    #[instrument(skip_all, fields(sender = %account.address(), calls = calls.len()))]
    async fn submit_sponsored_call(
        &self,
        account: &SmartAccount,
        calls: Vec<Call>,
        authorization: SignedAuthorization,
        paymaster: PaymasterData,
    ) -> Result<OperationHandle, ChainError> {
        let sender = account.address();
        let current = self.chain.transaction_count(sender).await?;

        if authorization.nonce() != current {
            return Err(ChainError::StaleAuthorization {
                account: sender,
                authorized: authorization.nonce(),
                current,
            });
        }

        let call_data = encode_calls(&calls)?;
        let nonce = IEntryPoint::new(self.entry_point, self.chain.provider())
            .getNonce(sender, U192::ZERO)
            .call()
            .await?;

        let mut op = UserOperation::delegated(sender, nonce, call_data, authorization, &paymaster);

        let prices = self.gas_price().await?;
        op.max_fee_per_gas = prices.standard.max_fee_per_gas;
        op.max_priority_fee_per_gas = prices.standard.max_priority_fee_per_gas;

        let estimate = self.estimate_gas(&op).await?;
        op.apply_gas_estimate(&estimate);
        debug!(?estimate, "Estimated user operation gas");

        let hash = op.signing_hash(self.entry_point, self.chain.chain_id());
        op.signature = account.sign_hash(&hash).await?.as_bytes().into();

        let user_op_hash = self.send(&op).await?;
        info!(%user_op_hash, "User operation submitted");

        Ok(OperationHandle {
            user_op_hash,
            sender,
        })
    }

    async fn operation_receipt(
        &self,
        handle: &OperationHandle,
    ) -> Result<Option<Inclusion>, ChainError> {
        let receipt: Option<UserOperationReceipt> = self
            .bundler
            .raw_request(
                "eth_getUserOperationReceipt".into(),
                (handle.user_op_hash,),
            )
            .await?;

        Ok(receipt.map(|receipt| Inclusion {
            transaction_hash: receipt.receipt.transaction_hash,
            success: receipt.success,
        }))
    }

    fn receipt_poll_interval(&self) -> Duration {
        self.receipt_poll_interval
    }
}
