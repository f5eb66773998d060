//! In-memory chain for testing sponsored execution flows.
//!
//! [`MockChain`] keeps ERC-20 balances and allowances in memory, applies
//! `approve`/`transfer` calls from included operations, and lets tests
//! script the outcome of each submission.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use alloy::eips::eip7702::SignedAuthorization;
use alloy::primitives::{Address, B256, ChainId, Signature, TxHash, U256, keccak256};
use alloy::signers::Signer;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolCall;
use alloy::transports::TransportErrorKind;
use async_trait::async_trait;

use crate::erc20::IERC20Permit;
use crate::{
    Call, ChainError, Evm, Inclusion, OperationHandle, PaymasterData, PermitDomain, SmartAccount,
    SponsoredExecutor,
};

/// Scripted result of the next submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOutcome {
    /// Included and executed successfully.
    Included,
    /// Included but execution reverted.
    Reverted,
    /// Accepted by the bundler but never included.
    NeverIncluded,
    /// Submission fails with a transport error.
    TransportFailure,
}

/// Operation accepted by [`MockChain`].
#[derive(Debug, Clone)]
pub struct SubmittedOperation {
    pub sender: Address,
    pub calls: Vec<Call>,
    pub authorization_nonce: u64,
    pub paymaster: PaymasterData,
    pub outcome: MockOutcome,
    pub transaction_hash: Option<TxHash>,
}

pub struct MockChain {
    chain_id: u64,
    transaction_count: AtomicU64,
    permit_nonce: AtomicU64,
    balances: Mutex<HashMap<(Address, Address), U256>>,
    allowances: Mutex<HashMap<(Address, Address, Address), U256>>,
    outcomes: Mutex<VecDeque<MockOutcome>>,
    submissions: Mutex<Vec<SubmittedOperation>>,
    receipts: Mutex<HashMap<B256, Inclusion>>,
    submit_attempts: AtomicUsize,
    approvals_visible: AtomicBool,
    failing_receipt_lookups: AtomicUsize,
    nonce_race: AtomicBool,
}

impl MockChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            transaction_count: AtomicU64::new(0),
            permit_nonce: AtomicU64::new(0),
            balances: Mutex::new(HashMap::new()),
            allowances: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(VecDeque::new()),
            submissions: Mutex::new(Vec::new()),
            receipts: Mutex::new(HashMap::new()),
            submit_attempts: AtomicUsize::new(0),
            approvals_visible: AtomicBool::new(true),
            failing_receipt_lookups: AtomicUsize::new(0),
            nonce_race: AtomicBool::new(false),
        }
    }

    pub fn set_transaction_count(&self, nonce: u64) {
        self.transaction_count.store(nonce, Ordering::SeqCst);
    }

    pub fn set_balance(&self, token: Address, owner: Address, amount: U256) {
        self.balances
            .lock()
            .unwrap()
            .insert((token, owner), amount);
    }

    pub fn set_allowance(&self, token: Address, owner: Address, spender: Address, amount: U256) {
        self.allowances
            .lock()
            .unwrap()
            .insert((token, owner, spender), amount);
    }

    /// Included `approve` calls no longer update the allowance.
    pub fn hide_approvals(&self) {
        self.approvals_visible.store(false, Ordering::SeqCst);
    }

    /// The next `count` receipt lookups fail with a transport error.
    pub fn fail_receipt_lookups(&self, count: usize) {
        self.failing_receipt_lookups.store(count, Ordering::SeqCst);
    }

    /// Another transaction from the sender lands right before the next
    /// submission, invalidating its authorization.
    pub fn advance_nonce_before_next_submit(&self) {
        self.nonce_race.store(true, Ordering::SeqCst);
    }

    /// Queues outcomes for the next submissions; unscripted ones succeed.
    pub fn script(&self, outcomes: impl IntoIterator<Item = MockOutcome>) {
        self.outcomes.lock().unwrap().extend(outcomes);
    }

    pub fn submissions(&self) -> Vec<SubmittedOperation> {
        self.submissions.lock().unwrap().clone()
    }

    /// Submission attempts, including ones that failed before acceptance.
    pub fn submit_attempts(&self) -> usize {
        self.submit_attempts.load(Ordering::SeqCst)
    }

    fn apply(&self, sender: Address, call: &Call) {
        if let Ok(approve) = IERC20Permit::approveCall::abi_decode(&call.data) {
            if self.approvals_visible.load(Ordering::SeqCst) {
                self.set_allowance(call.to, sender, approve.spender, approve.amount);
            }
        } else if let Ok(transfer) = IERC20Permit::transferCall::abi_decode(&call.data) {
            let mut balances = self.balances.lock().unwrap();
            let from = balances.entry((call.to, sender)).or_default();
            *from = from.saturating_sub(transfer.amount);
            let to = balances.entry((call.to, transfer.to)).or_default();
            *to = to.saturating_add(transfer.amount);
        }
    }
}

#[async_trait]
impl Evm for MockChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn transaction_count(&self, _account: Address) -> Result<u64, ChainError> {
        Ok(self.transaction_count.load(Ordering::SeqCst))
    }

    async fn read_balance(&self, token: Address, owner: Address) -> Result<U256, ChainError> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&(token, owner))
            .copied()
            .unwrap_or_default())
    }

    async fn read_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, ChainError> {
        Ok(self
            .allowances
            .lock()
            .unwrap()
            .get(&(token, owner, spender))
            .copied()
            .unwrap_or_default())
    }

    async fn permit_domain(&self, _token: Address) -> Result<PermitDomain, ChainError> {
        Ok(PermitDomain {
            name: "USDC".to_string(),
            version: "2".to_string(),
        })
    }

    async fn permit_nonce(&self, _token: Address, _owner: Address) -> Result<U256, ChainError> {
        Ok(U256::from(self.permit_nonce.load(Ordering::SeqCst)))
    }
}

#[async_trait]
impl SponsoredExecutor for MockChain {
    async fn submit_sponsored_call(
        &self,
        account: &SmartAccount,
        calls: Vec<Call>,
        authorization: SignedAuthorization,
        paymaster: PaymasterData,
    ) -> Result<OperationHandle, ChainError> {
        let attempt = self.submit_attempts.fetch_add(1, Ordering::SeqCst);
        let sender = account.address();
        if self.nonce_race.swap(false, Ordering::SeqCst) {
            self.transaction_count.fetch_add(1, Ordering::SeqCst);
        }
        let current = self.transaction_count.load(Ordering::SeqCst);

        if authorization.nonce() != current {
            return Err(ChainError::StaleAuthorization {
                account: sender,
                authorized: authorization.nonce(),
                current,
            });
        }

        if calls.is_empty() {
            return Err(ChainError::EmptyBatch);
        }

        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(MockOutcome::Included);

        if outcome == MockOutcome::TransportFailure {
            return Err(ChainError::Transport(TransportErrorKind::backend_gone()));
        }

        let user_op_hash = keccak256((attempt as u64).to_be_bytes());
        let transaction_hash = match outcome {
            MockOutcome::Included | MockOutcome::Reverted => Some(keccak256(user_op_hash)),
            MockOutcome::NeverIncluded | MockOutcome::TransportFailure => None,
        };

        if let Some(transaction_hash) = transaction_hash {
            // The delegation is processed even when execution reverts.
            self.transaction_count.fetch_add(1, Ordering::SeqCst);
            self.permit_nonce.fetch_add(1, Ordering::SeqCst);

            let success = outcome == MockOutcome::Included;
            if success {
                for call in &calls {
                    self.apply(sender, call);
                }
            }

            self.receipts.lock().unwrap().insert(
                user_op_hash,
                Inclusion {
                    transaction_hash,
                    success,
                },
            );
        }

        self.submissions.lock().unwrap().push(SubmittedOperation {
            sender,
            calls,
            authorization_nonce: authorization.nonce(),
            paymaster,
            outcome,
            transaction_hash,
        });

        Ok(OperationHandle {
            user_op_hash,
            sender,
        })
    }

    async fn operation_receipt(
        &self,
        handle: &OperationHandle,
    ) -> Result<Option<Inclusion>, ChainError> {
        let failing = self
            .failing_receipt_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if failing.is_ok() {
            return Err(ChainError::Transport(TransportErrorKind::backend_gone()));
        }

        Ok(self
            .receipts
            .lock()
            .unwrap()
            .get(&handle.user_op_hash)
            .copied())
    }
}

/// Signer claiming one address while signing with another key.
#[derive(Debug, Clone)]
pub struct ImpersonatingSigner {
    claimed: Address,
    key: PrivateKeySigner,
}

impl ImpersonatingSigner {
    pub fn new(claimed: Address, key: PrivateKeySigner) -> Self {
        Self { claimed, key }
    }
}

#[async_trait]
impl Signer for ImpersonatingSigner {
    async fn sign_hash(&self, hash: &B256) -> alloy::signers::Result<Signature> {
        self.key.sign_hash(hash).await
    }

    fn address(&self) -> Address {
        self.claimed
    }

    fn chain_id(&self) -> Option<ChainId> {
        self.key.chain_id()
    }

    fn set_chain_id(&mut self, chain_id: Option<ChainId>) {
        self.key.set_chain_id(chain_id);
    }
}
