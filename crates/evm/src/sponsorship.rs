//! Gas sponsorship proofs for EIP-7702 delegated accounts.
//!
//! A sponsored operation carries two signatures from the account owner:
//!
//! - an EIP-7702 authorization delegating the owner EOA to the
//!   smart-account implementation, bound to the owner's current
//!   transaction nonce;
//! - an EIP-2612 permit letting the paymaster pull USDC from the owner to
//!   cover gas.
//!
//! Both are produced fresh for every operation and never cached: the
//! authorization nonce advances with every included delegation and the
//! permit nonce with every consumed permit.

use alloy::eips::eip7702::{Authorization, SignedAuthorization};
use alloy::primitives::{Address, B256, Bytes, Signature, U256, address};
use std::sync::Arc;

use alloy::signers::Signer;
use alloy::sol_types::{Eip712Domain, SolStruct};
use tracing::{debug, instrument};

use crate::erc20::Permit;
use crate::{ChainError, Evm};

/// Circle Paymaster v0.8 deployment, shared across supported chains.
pub const CIRCLE_PAYMASTER: Address = address!("0x3BA9A96eE3eFf3A69E2B18886AcF52027EFF8966");

/// ERC-4337 EntryPoint v0.8.
pub const ENTRY_POINT_V08: Address = address!("0x4337084D9E255Ff0702461CF8895CE9E3b5Ff108");

/// Simple7702Account implementation the owner EOA delegates to.
pub const SIMPLE_7702_ACCOUNT: Address = address!("0xe6Cae83BdE06E4c305530e199D7217f42808555B");

/// Paymaster data mode byte selecting permit-based payment.
const PERMIT_MODE: u8 = 0;

/// 10 USDC in base units.
const DEFAULT_PERMIT_AMOUNT: u64 = 10_000_000;

#[derive(Debug, thiserror::Error)]
pub enum SponsorshipError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("signer error: {0}")]
    Signer(#[from] alloy::signers::Error),
    #[error("permit signature recovers to {recovered:?}, expected owner {owner}")]
    PermitSigningFailed {
        owner: Address,
        recovered: Option<Address>,
    },
}

/// Per-chain sponsorship parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SponsorshipConfig {
    pub paymaster: Address,
    /// USDC the paymaster may pull per operation.
    pub permit_amount: U256,
    pub paymaster_verification_gas_limit: u64,
    pub paymaster_post_op_gas_limit: u64,
    pub entry_point: Address,
    pub delegate: Address,
}

impl Default for SponsorshipConfig {
    fn default() -> Self {
        Self {
            paymaster: CIRCLE_PAYMASTER,
            permit_amount: U256::from(DEFAULT_PERMIT_AMOUNT),
            paymaster_verification_gas_limit: 200_000,
            paymaster_post_op_gas_limit: 15_000,
            entry_point: ENTRY_POINT_V08,
            delegate: SIMPLE_7702_ACCOUNT,
        }
    }
}

/// Owner key of a smart account, shared between the operations it signs.
pub type OwnerSigner = Arc<dyn Signer + Send + Sync>;

/// Addresses identifying a delegated smart account.
///
/// Under EIP-7702 the executing account is the owner EOA itself;
/// `delegated_account_address` is the implementation it delegates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmartAccountIdentity {
    pub owner_address: Address,
    pub delegated_account_address: Address,
}

/// Owner key bound to a chain, ready to sign proofs for one operation.
#[derive(Clone)]
pub struct SmartAccount {
    signer: OwnerSigner,
    identity: SmartAccountIdentity,
    chain_id: u64,
}

impl std::fmt::Debug for SmartAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartAccount")
            .field("identity", &self.identity)
            .field("chain_id", &self.chain_id)
            .finish_non_exhaustive()
    }
}

impl SmartAccount {
    /// Address that executes the operation (the owner EOA).
    pub fn address(&self) -> Address {
        self.identity.owner_address
    }

    pub fn identity(&self) -> SmartAccountIdentity {
        self.identity
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Signs a 32-byte digest with the owner key.
    pub async fn sign_hash(&self, hash: &B256) -> Result<Signature, alloy::signers::Error> {
        self.signer.sign_hash(hash).await
    }
}

/// Derives the smart account controlled by `signer` on `chain`.
///
/// Deterministic per key and chain; the only network read is the owner's
/// current transaction nonce.
#[instrument(skip_all, fields(owner = %signer.address(), chain_id = chain.chain_id()))]
pub async fn derive_smart_account<E: Evm + ?Sized>(
    signer: &OwnerSigner,
    chain: &E,
    config: &SponsorshipConfig,
) -> Result<SmartAccount, SponsorshipError> {
    let owner_address = signer.address();
    let nonce = chain.transaction_count(owner_address).await?;

    debug!(nonce, delegate = %config.delegate, "Derived smart account");

    Ok(SmartAccount {
        signer: Arc::clone(signer),
        identity: SmartAccountIdentity {
            owner_address,
            delegated_account_address: config.delegate,
        },
        chain_id: chain.chain_id(),
    })
}

/// Signs an EIP-7702 authorization delegating the owner to its
/// smart-account implementation.
///
/// The nonce is re-read from the chain on every call so that each
/// submitted operation carries an authorization for the current nonce.
#[instrument(skip_all, fields(owner = %account.address()))]
pub async fn authorize_delegation<E: Evm + ?Sized>(
    account: &SmartAccount,
    chain: &E,
) -> Result<SignedAuthorization, SponsorshipError> {
    let nonce = chain.transaction_count(account.address()).await?;

    let authorization = Authorization {
        chain_id: U256::from(account.chain_id),
        address: account.identity.delegated_account_address,
        nonce,
    };

    let signature = account.sign_hash(&authorization.signature_hash()).await?;
    debug!(nonce, "Signed delegation authorization");

    Ok(authorization.into_signed(signature))
}

/// EIP-2612 permit signed by the account owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermitSignature {
    pub signature: Signature,
    pub nonce: U256,
    pub deadline: U256,
}

/// Signs a permit letting `spender` pull `amount` of `token` from the owner.
///
/// The signature is recovered against the signing hash before it is
/// returned; a mismatch aborts with [`SponsorshipError::PermitSigningFailed`].
#[instrument(skip_all, fields(owner = %account.address(), %token, %spender, %amount))]
pub async fn sign_gas_permit<E: Evm + ?Sized>(
    account: &SmartAccount,
    chain: &E,
    token: Address,
    spender: Address,
    amount: U256,
) -> Result<PermitSignature, SponsorshipError> {
    let owner = account.address();
    let domain_info = chain.permit_domain(token).await?;
    let nonce = chain.permit_nonce(token, owner).await?;

    let domain = Eip712Domain {
        name: Some(domain_info.name.into()),
        version: Some(domain_info.version.into()),
        chain_id: Some(U256::from(account.chain_id)),
        verifying_contract: Some(token),
        salt: None,
    };

    let permit = Permit {
        owner,
        spender,
        value: amount,
        nonce,
        deadline: U256::MAX,
    };

    let hash = permit.eip712_signing_hash(&domain);
    let signature = account.sign_hash(&hash).await?;

    let recovered = signature.recover_address_from_prehash(&hash).ok();
    if recovered != Some(owner) {
        return Err(SponsorshipError::PermitSigningFailed { owner, recovered });
    }

    Ok(PermitSignature {
        signature,
        nonce,
        deadline: U256::MAX,
    })
}

/// Paymaster fields of a user operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymasterData {
    pub paymaster: Address,
    pub data: Bytes,
    pub verification_gas_limit: u64,
    pub post_op_gas_limit: u64,
}

/// Packs `[mode][token][permit amount][permit signature]`.
pub fn encode_paymaster_data(token: Address, permit_amount: U256, signature: &Signature) -> Bytes {
    let mut data = Vec::with_capacity(1 + 20 + 32 + 65);
    data.push(PERMIT_MODE);
    data.extend_from_slice(token.as_slice());
    data.extend_from_slice(&permit_amount.to_be_bytes::<32>());
    data.extend_from_slice(&signature.as_bytes());
    data.into()
}

/// Signs a fresh gas permit for the configured paymaster and packs it.
pub async fn paymaster_data<E: Evm + ?Sized>(
    account: &SmartAccount,
    chain: &E,
    token: Address,
    config: &SponsorshipConfig,
) -> Result<PaymasterData, SponsorshipError> {
    let permit =
        sign_gas_permit(account, chain, token, config.paymaster, config.permit_amount).await?;

    Ok(PaymasterData {
        paymaster: config.paymaster,
        data: encode_paymaster_data(token, config.permit_amount, &permit.signature),
        verification_gas_limit: config.paymaster_verification_gas_limit,
        post_op_gas_limit: config.paymaster_post_op_gas_limit,
    })
}
