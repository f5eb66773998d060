//! ERC-4337 v0.8 user operations for EIP-7702 delegated accounts.
//!
//! [`UserOperation`] is the unpacked JSON-RPC form bundlers accept.
//! The EntryPoint signs over the packed form, where gas limits and fees
//! are paired into `bytes32` words and the paymaster fields are
//! concatenated into `paymasterAndData`.

use alloy::eips::eip7702::SignedAuthorization;
use alloy::primitives::{Address, B256, Bytes, U256, address, bytes};
use alloy::sol;
use alloy::sol_types::{Eip712Domain, SolCall, SolStruct};
use serde::{Deserialize, Serialize};

use crate::{Call, ChainError, PaymasterData};

sol! {
    #[sol(rpc)]
    interface IEntryPoint {
        function getNonce(address sender, uint192 key) external view returns (uint256 nonce);
    }

    #[derive(Debug)]
    interface ISimple7702Account {
        struct Call {
            address target;
            uint256 value;
            bytes data;
        }

        function execute(address target, uint256 value, bytes calldata data) external;
        function executeBatch(Call[] calldata calls) external;
    }

    #[derive(Debug)]
    struct PackedUserOperation {
        address sender;
        uint256 nonce;
        bytes initCode;
        bytes callData;
        bytes32 accountGasLimits;
        uint256 preVerificationGas;
        bytes32 gasFees;
        bytes paymasterAndData;
    }
}

/// Factory marker telling the EntryPoint the sender is EIP-7702 delegated.
pub const EIP7702_FACTORY_MARKER: Address = address!("0x7702000000000000000000000000000000000000");

/// Placeholder ECDSA signature used while estimating gas.
pub const DUMMY_SIGNATURE: Bytes = bytes!(
    "fffffffffffffffffffffffffffffff0000000000000000000000000000000007aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa1c"
);

/// Encodes `calls` as delegated-account calldata.
///
/// A single call uses `execute`; several use `executeBatch`.
pub fn encode_calls(calls: &[Call]) -> Result<Bytes, ChainError> {
    match calls {
        [] => Err(ChainError::EmptyBatch),
        [call] => Ok(ISimple7702Account::executeCall {
            target: call.to,
            value: call.value,
            data: call.data.clone(),
        }
        .abi_encode()
        .into()),
        calls => Ok(ISimple7702Account::executeBatchCall {
            calls: calls
                .iter()
                .map(|call| ISimple7702Account::Call {
                    target: call.to,
                    value: call.value,
                    data: call.data.clone(),
                })
                .collect(),
        }
        .abi_encode()
        .into()),
    }
}

/// Packs two 128-bit quantities into one word, `high` first.
pub fn pack_u128_pair(high: U256, low: U256) -> B256 {
    let mut word = [0u8; 32];
    word[..16].copy_from_slice(&high.saturating_to::<u128>().to_be_bytes());
    word[16..].copy_from_slice(&low.saturating_to::<u128>().to_be_bytes());
    B256::from(word)
}

/// User operation in the bundler JSON-RPC shape (EntryPoint v0.8).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub factory: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub factory_data: Option<Bytes>,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paymaster: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paymaster_verification_gas_limit: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paymaster_post_op_gas_limit: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paymaster_data: Option<Bytes>,
    pub signature: Bytes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eip7702_auth: Option<SignedAuthorization>,
}

impl UserOperation {
    /// Unsigned operation for a delegated sender with zeroed gas fields.
    pub fn delegated(
        sender: Address,
        nonce: U256,
        call_data: Bytes,
        authorization: SignedAuthorization,
        paymaster: &PaymasterData,
    ) -> Self {
        Self {
            sender,
            nonce,
            factory: Some(EIP7702_FACTORY_MARKER),
            factory_data: Some(Bytes::new()),
            call_data,
            call_gas_limit: U256::ZERO,
            verification_gas_limit: U256::ZERO,
            pre_verification_gas: U256::ZERO,
            max_fee_per_gas: U256::ZERO,
            max_priority_fee_per_gas: U256::ZERO,
            paymaster: Some(paymaster.paymaster),
            paymaster_verification_gas_limit: Some(U256::from(paymaster.verification_gas_limit)),
            paymaster_post_op_gas_limit: Some(U256::from(paymaster.post_op_gas_limit)),
            paymaster_data: Some(paymaster.data.clone()),
            signature: DUMMY_SIGNATURE,
            eip7702_auth: Some(authorization),
        }
    }

    /// `paymaster || verificationGas(16) || postOpGas(16) || data`, or empty.
    pub fn paymaster_and_data(&self) -> Bytes {
        let Some(paymaster) = self.paymaster else {
            return Bytes::new();
        };

        let gas = pack_u128_pair(
            self.paymaster_verification_gas_limit.unwrap_or_default(),
            self.paymaster_post_op_gas_limit.unwrap_or_default(),
        );
        let data = self.paymaster_data.clone().unwrap_or_default();

        let mut packed = Vec::with_capacity(20 + 32 + data.len());
        packed.extend_from_slice(paymaster.as_slice());
        packed.extend_from_slice(gas.as_slice());
        packed.extend_from_slice(&data);
        packed.into()
    }

    /// Init code as hashed by the EntryPoint.
    ///
    /// For a delegated sender the marker factory is replaced by the
    /// delegate address from the authorization.
    fn hashed_init_code(&self) -> Bytes {
        let Some(factory) = self.factory else {
            return Bytes::new();
        };
        let factory_data = self.factory_data.clone().unwrap_or_default();

        let head = match (&self.eip7702_auth, factory == EIP7702_FACTORY_MARKER) {
            (Some(authorization), true) => *authorization.address(),
            _ => factory,
        };

        let mut init_code = Vec::with_capacity(20 + factory_data.len());
        init_code.extend_from_slice(head.as_slice());
        init_code.extend_from_slice(&factory_data);
        init_code.into()
    }

    pub fn packed(&self) -> PackedUserOperation {
        PackedUserOperation {
            sender: self.sender,
            nonce: self.nonce,
            initCode: self.hashed_init_code(),
            callData: self.call_data.clone(),
            accountGasLimits: pack_u128_pair(self.verification_gas_limit, self.call_gas_limit),
            preVerificationGas: self.pre_verification_gas,
            gasFees: pack_u128_pair(self.max_priority_fee_per_gas, self.max_fee_per_gas),
            paymasterAndData: self.paymaster_and_data(),
        }
    }

    /// EIP-712 hash the account owner signs.
    pub fn signing_hash(&self, entry_point: Address, chain_id: u64) -> B256 {
        let domain = Eip712Domain {
            name: Some("ERC4337".into()),
            version: Some("1".into()),
            chain_id: Some(U256::from(chain_id)),
            verifying_contract: Some(entry_point),
            salt: None,
        };

        self.packed().eip712_signing_hash(&domain)
    }

    pub fn apply_gas_estimate(&mut self, estimate: &GasEstimate) {
        self.call_gas_limit = estimate.call_gas_limit;
        self.verification_gas_limit = estimate.verification_gas_limit;
        self.pre_verification_gas = estimate.pre_verification_gas;

        if self.paymaster.is_some() {
            if let Some(limit) = estimate.paymaster_verification_gas_limit {
                self.paymaster_verification_gas_limit =
                    Some(limit.max(self.paymaster_verification_gas_limit.unwrap_or_default()));
            }
            if let Some(limit) = estimate.paymaster_post_op_gas_limit {
                self.paymaster_post_op_gas_limit =
                    Some(limit.max(self.paymaster_post_op_gas_limit.unwrap_or_default()));
            }
        }
    }
}

/// `eth_estimateUserOperationGas` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasEstimate {
    pub pre_verification_gas: U256,
    pub verification_gas_limit: U256,
    pub call_gas_limit: U256,
    #[serde(default)]
    pub paymaster_verification_gas_limit: Option<U256>,
    #[serde(default)]
    pub paymaster_post_op_gas_limit: Option<U256>,
}

/// One tier of `pimlico_getUserOperationGasPrice`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasPrice {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasPriceTiers {
    pub slow: GasPrice,
    pub standard: GasPrice,
    pub fast: GasPrice,
}

/// `eth_getUserOperationReceipt` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationReceipt {
    pub user_op_hash: B256,
    pub success: bool,
    pub receipt: ReceiptTransaction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptTransaction {
    pub transaction_hash: B256,
}
