use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use alloy::primitives::{TxHash, U256};
use backon::Retryable;
use godshand_bridge::cctp::{
    DepositForBurn, deposit_for_burn, extract_nonce_from_message, receive_message,
};
use godshand_bridge::{
    AttestationApi, AttestationMessage, AttestationPoller, Cancellation, FeeOracle, FeeQuote,
};
use godshand_evm::erc20::IERC20Permit;
use godshand_evm::{
    Call, Evm, OperationHandle, SponsoredExecutor, authorize_delegation, derive_smart_account,
    paymaster_data,
};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::{
    LogLine, SigningIdentity, TransactionRole, TransferError, TransferFailure, TransferOrder,
    TransferPolicy, TransferProgress, TransferRequest, TransferState,
};
use crate::chain::{ChainEntry, ChainKey, ChainRegistry};
use crate::usdc::format_usdc;

/// Drives one USDC transfer at a time and publishes its progress.
///
/// Each run starts from `Idle`; once it reaches `Completed` or `Error`
/// the orchestrator must be [`reset`](Self::reset) before the next one.
/// `execute` and `recover` never return errors: failures end the run in
/// `Error` with a [`TransferFailure`] on the published snapshot.
pub struct TransferOrchestrator {
    chains: Arc<ChainRegistry>,
    fee_oracle: Arc<dyn FeeOracle>,
    attestations: AttestationPoller<Arc<dyn AttestationApi>>,
    sender: SigningIdentity,
    gas_payer: SigningIdentity,
    policy: TransferPolicy,
    progress: watch::Sender<TransferProgress>,
}

impl TransferOrchestrator {
    /// `sender` owns the burned funds; `gas_payer` submits mints on the
    /// settlement chain.
    pub fn new(
        chains: Arc<ChainRegistry>,
        fee_oracle: Arc<dyn FeeOracle>,
        attestation_api: Arc<dyn AttestationApi>,
        sender: SigningIdentity,
        gas_payer: SigningIdentity,
        policy: TransferPolicy,
    ) -> Self {
        let attestations = AttestationPoller::new(
            attestation_api,
            policy.attestation_poll_interval,
            policy.attestation_max_attempts,
        );
        let (progress, _) = watch::channel(TransferProgress::default());

        Self {
            chains,
            fee_oracle,
            attestations,
            sender,
            gas_payer,
            policy,
            progress,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TransferProgress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> TransferProgress {
        self.progress.borrow().clone()
    }

    pub fn sender(&self) -> &SigningIdentity {
        &self.sender
    }

    pub fn chains(&self) -> &ChainRegistry {
        &self.chains
    }

    /// Returns to `Idle`, dropping logs, transactions and failure.
    ///
    /// A run still in flight keeps executing but no longer publishes.
    pub fn reset(&self) {
        self.progress.send_modify(|progress| {
            *progress = TransferProgress {
                run: progress.run.wrapping_add(1),
                ..TransferProgress::default()
            };
        });
        debug!("Transfer progress reset");
    }

    /// Runs a transfer from `order.source_chain` to the settlement chain.
    #[instrument(
        skip_all,
        fields(source = %order.source_chain, amount = %order.amount, speed = %order.speed)
    )]
    pub async fn execute(&self, order: TransferOrder, cancel: &Cancellation) -> TransferProgress {
        let Some(run) = self.claim() else {
            warn!("Orchestrator is not idle, reset it before starting another transfer");
            return self.progress();
        };

        if let Err(error) = self.run_transfer(run, order, cancel).await {
            self.fail(run, &error);
        }

        self.progress()
    }

    /// Mints an already burned transfer on the settlement chain.
    #[instrument(skip_all, fields(source = %source_chain, %burn_tx))]
    pub async fn recover(
        &self,
        source_chain: ChainKey,
        burn_tx: TxHash,
        cancel: &Cancellation,
    ) -> TransferProgress {
        let Some(run) = self.claim() else {
            warn!("Orchestrator is not idle, reset it before recovering a transfer");
            return self.progress();
        };

        if let Err(error) = self.run_recovery(run, &source_chain, burn_tx, cancel).await {
            self.fail(run, &error);
        }

        self.progress()
    }

    async fn run_transfer(
        &self,
        run: u64,
        order: TransferOrder,
        cancel: &Cancellation,
    ) -> Result<(), TransferError> {
        let request = self.accept(order)?;
        let source = self.chains.get(&request.source_chain)?;
        let destination = self.chains.get(&request.destination_chain)?;

        self.publish(run, |progress| progress.request = Some(request.clone()));
        self.transition(run, TransferState::Approving, "Approving USDC transfer...");

        if request.source_chain == request.destination_chain {
            return self.transfer_directly(run, source, &request).await;
        }

        let quote = self.quote(run, source, destination, &request).await?;
        self.approve(run, source, request.amount).await?;

        self.transition(run, TransferState::Burning, "Burning USDC...");
        let burn_tx = self
            .burn(run, source, destination, &request, &quote)
            .await?;
        self.record(run, TransactionRole::Burn, burn_tx);

        self.settle(run, source, destination, burn_tx, cancel).await
    }

    async fn run_recovery(
        &self,
        run: u64,
        source_chain: &ChainKey,
        burn_tx: TxHash,
        cancel: &Cancellation,
    ) -> Result<(), TransferError> {
        let source = self.chains.get(source_chain)?;
        let destination = self.chains.get(self.chains.settlement())?;

        if source.profile.key == destination.profile.key {
            return Err(TransferError::InvalidRequest(format!(
                "{source_chain} is the settlement chain, nothing was burned"
            )));
        }

        self.log(run, format!("Recovering burn {burn_tx} from {source_chain}"));
        self.record(run, TransactionRole::Burn, burn_tx);

        self.settle(run, source, destination, burn_tx, cancel).await
    }

    fn accept(&self, order: TransferOrder) -> Result<TransferRequest, TransferError> {
        if order.amount.is_zero() {
            return Err(TransferError::InvalidRequest(
                "amount must be greater than zero".to_string(),
            ));
        }

        self.chains.get(&order.source_chain)?;
        let destination_chain = self.chains.settlement().clone();
        let same_chain = order.source_chain == destination_chain;

        let destination_address = match order.destination_address {
            Some(address) => address,
            None if same_chain => {
                return Err(TransferError::InvalidRequest(format!(
                    "{destination_chain} is the settlement chain, a destination address is required"
                )));
            }
            None => self.sender.address(),
        };

        Ok(TransferRequest {
            source_chain: order.source_chain,
            destination_chain,
            amount: order.amount,
            speed: order.speed,
            destination_address,
        })
    }

    async fn quote(
        &self,
        run: u64,
        source: &ChainEntry,
        destination: &ChainEntry,
        request: &TransferRequest,
    ) -> Result<FeeQuote, TransferError> {
        let (quote, unavailable) = self
            .fee_oracle
            .quote_fee_or_fallback(
                source.profile.domain,
                destination.profile.domain,
                request.amount,
                request.speed,
                &self.policy.fees,
            )
            .await;

        let fee = quote.effective_fee();

        match unavailable {
            Some(error) => {
                let error = TransferError::QuoteUnavailable(error);
                self.log(
                    run,
                    format!("{error}. Using fallback maxFee: {}", format_usdc(fee)),
                );
            }
            None => self.log(
                run,
                format!(
                    "Fee: {} ({} bps, finality threshold {})",
                    format_usdc(fee),
                    quote.minimum_fee_bps,
                    quote.finality_threshold
                ),
            ),
        }

        if !quote.covers(request.amount) {
            self.log(
                run,
                format!(
                    "Insufficient amount. Need more than {} for fees",
                    format_usdc(fee)
                ),
            );
            return Err(TransferError::InsufficientAmount {
                amount: request.amount,
                fee,
            });
        }

        Ok(quote)
    }

    async fn approve(
        &self,
        run: u64,
        source: &ChainEntry,
        amount: U256,
    ) -> Result<(), TransferError> {
        let profile = &source.profile;
        let owner = self.sender.address();

        let allowance = source
            .executor
            .read_allowance(profile.usdc, owner, profile.token_messenger)
            .await?;

        if allowance >= amount {
            self.log(
                run,
                format!("Existing allowance of {} covers the transfer", format_usdc(allowance)),
            );
            return Ok(());
        }

        let approve = Call::contract(
            profile.usdc,
            &IERC20Permit::approveCall {
                spender: profile.token_messenger,
                amount: self.policy.approval_cap.max(amount),
            },
        );

        let approval_tx = self
            .run_sponsored(run, source, &self.sender, TransactionRole::Approval, vec![approve])
            .await?;
        self.record(run, TransactionRole::Approval, approval_tx);

        let allowance = source
            .executor
            .read_allowance(profile.usdc, owner, profile.token_messenger)
            .await?;

        if allowance < amount {
            return Err(TransferError::ApprovalNotVisible {
                allowance,
                required: amount,
            });
        }

        Ok(())
    }

    async fn burn(
        &self,
        run: u64,
        source: &ChainEntry,
        destination: &ChainEntry,
        request: &TransferRequest,
        quote: &FeeQuote,
    ) -> Result<TxHash, TransferError> {
        let call = deposit_for_burn(&DepositForBurn {
            token_messenger: source.profile.token_messenger,
            burn_token: source.profile.usdc,
            amount: request.amount,
            destination_domain: destination.profile.domain,
            recipient: request.destination_address,
            max_fee: quote.effective_fee(),
            min_finality_threshold: quote.finality_threshold,
        });

        let burned = self
            .run_sponsored(run, source, &self.sender, TransactionRole::Burn, vec![call])
            .await;

        if let Err(TransferError::ExecutionReverted { .. }) = &burned {
            // A reverted burn leaves the funds on the source chain.
            self.publish(run, |progress| progress.burn_operation = None);
        }

        burned
    }

    async fn transfer_directly(
        &self,
        run: u64,
        chain: &ChainEntry,
        request: &TransferRequest,
    ) -> Result<(), TransferError> {
        let call = Call::contract(
            chain.profile.usdc,
            &IERC20Permit::transferCall {
                to: request.destination_address,
                amount: request.amount,
            },
        );

        let transfer_tx = self
            .run_sponsored(run, chain, &self.sender, TransactionRole::DirectTransfer, vec![call])
            .await?;
        self.record(run, TransactionRole::DirectTransfer, transfer_tx);
        self.transition(run, TransferState::Completed, "Transfer completed");

        Ok(())
    }

    /// Attestation and mint of a broadcast burn.
    async fn settle(
        &self,
        run: u64,
        source: &ChainEntry,
        destination: &ChainEntry,
        burn_tx: TxHash,
        cancel: &Cancellation,
    ) -> Result<(), TransferError> {
        self.transition(
            run,
            TransferState::WaitingAttestation,
            "Retrieving attestation...",
        );

        let attested = self
            .attestations
            .poll_for_attestation(source.profile.domain, burn_tx, cancel, |error, delay| {
                self.log(
                    run,
                    format!("{error}, checking again in {}s", delay.as_secs()),
                );
            })
            .await?;

        match extract_nonce_from_message(&attested.message) {
            Ok(nonce) => self.log(run, format!("Attestation received, nonce {nonce}")),
            Err(error) => {
                warn!(%error, "Attested message carries no nonce");
                self.log(run, "Attestation received");
            }
        }

        self.transition(run, TransferState::Minting, "Minting USDC...");
        let mint_tx = self.mint(run, destination, &attested).await?;
        self.record(run, TransactionRole::Mint, mint_tx);

        self.transition(run, TransferState::Completed, "Transfer completed");
        Ok(())
    }

    async fn mint(
        &self,
        run: u64,
        destination: &ChainEntry,
        attested: &AttestationMessage,
    ) -> Result<TxHash, TransferError> {
        let max_retries = self.policy.mint_retry.max_retries;
        let attempts = AtomicUsize::new(0);
        let attempts_ref = &attempts;
        let mut retries = 0usize;

        let submit = move || async move {
            attempts_ref.fetch_add(1, Ordering::SeqCst);
            let call = receive_message(destination.profile.message_transmitter, attested);
            self.run_sponsored(run, destination, &self.gas_payer, TransactionRole::Mint, vec![call])
                .await
        };

        submit
            .retry(self.policy.mint_retry)
            .when(TransferError::is_transient)
            .notify(|error, delay| {
                retries += 1;
                warn!(%error, ?delay, retry = retries, "Mint failed, retrying");
                self.log(run, format!("Retry {retries}/{max_retries}..."));
            })
            .await
            .map_err(|error| TransferError::MintFailed {
                attempts: attempts.load(Ordering::SeqCst),
                source: Box::new(error),
            })
    }

    /// Submits `calls` as one sponsored operation signed by `identity` and
    /// waits for inclusion.
    ///
    /// The identity stays locked from authorization signing until the
    /// operation lands so its nonce cannot move underneath the
    /// authorization.
    #[instrument(
        skip_all,
        fields(chain = %chain.profile.key, signer = %identity.address(), %role)
    )]
    async fn run_sponsored(
        &self,
        run: u64,
        chain: &ChainEntry,
        identity: &SigningIdentity,
        role: TransactionRole,
        calls: Vec<Call>,
    ) -> Result<TxHash, TransferError> {
        let _nonce_window = identity.lock().await;
        let executor = &*chain.executor;
        let sponsorship = &chain.profile.sponsorship;

        let account = derive_smart_account(identity.signer(), executor, sponsorship).await?;
        let authorization = authorize_delegation(&account, executor).await?;
        let paymaster = paymaster_data(&account, executor, chain.profile.usdc, sponsorship).await?;

        let handle = executor
            .submit_sponsored_call(&account, calls, authorization, paymaster)
            .await?;
        self.submitted(run, role, handle);

        let inclusion = executor
            .await_inclusion(&handle, self.policy.inclusion_timeout)
            .await?;
        info!(tx_hash = %inclusion.transaction_hash, "Sponsored operation included");

        Ok(inclusion.transaction_hash)
    }

    /// Marks the orchestrator busy; `None` unless idle.
    fn claim(&self) -> Option<u64> {
        let mut claimed = None;

        self.progress.send_if_modified(|progress| {
            if progress.claimed || progress.state != TransferState::Idle {
                return false;
            }

            progress.claimed = true;
            claimed = Some(progress.run);
            true
        });

        claimed
    }

    /// Applies `update` unless the run was reset in the meantime.
    fn publish(&self, run: u64, update: impl FnOnce(&mut TransferProgress)) {
        self.progress.send_if_modified(|progress| {
            if progress.run != run {
                return false;
            }

            update(progress);
            true
        });
    }

    fn log(&self, run: u64, message: impl Into<String>) {
        let line = LogLine::now(message);
        info!("{}", line.message);
        self.publish(run, |progress| progress.logs.push(line));
    }

    fn transition(&self, run: u64, state: TransferState, message: &str) {
        let line = LogLine::now(message);
        info!(?state, "{message}");
        self.publish(run, |progress| {
            progress.state = state;
            progress.logs.push(line);
        });
    }

    /// Keeps the handle of a submitted burn so a failure before its
    /// inclusion is confirmed still points at it.
    fn submitted(&self, run: u64, role: TransactionRole, handle: OperationHandle) {
        debug!(%role, %handle, "Sponsored operation submitted");
        if role != TransactionRole::Burn {
            return;
        }

        let line = LogLine::now(format!("Burn operation {handle} submitted"));
        self.publish(run, |progress| {
            progress.burn_operation = Some(handle);
            progress.logs.push(line);
        });
    }

    fn record(&self, run: u64, role: TransactionRole, tx_hash: TxHash) {
        let line = LogLine::now(format!("{role} transaction: {tx_hash}"));
        info!(%role, %tx_hash, "Transaction recorded");
        self.publish(run, |progress| {
            progress.transactions.insert(role, tx_hash);
            progress.logs.push(line);
        });
    }

    fn fail(&self, run: u64, failure: &TransferError) {
        error!(error = %failure, kind = ?failure.kind(), "Transfer failed");
        let message = failure.to_string();
        let kind = failure.kind();

        self.publish(run, |progress| {
            let in_flight = progress.funds_in_flight();
            let burn_tx = in_flight
                .then(|| progress.transactions.get(TransactionRole::Burn))
                .flatten();
            let burn_operation = (in_flight && burn_tx.is_none())
                .then_some(progress.burn_operation)
                .flatten();

            progress.failure = Some(TransferFailure {
                kind,
                step: progress.state,
                message: message.clone(),
                burn_tx,
                burn_operation,
            });
            progress.state = TransferState::Error;
            progress.logs.push(LogLine::now(format!("Error: {message}")));

            if let Some(burn_tx) = burn_tx {
                progress.logs.push(LogLine::now(format!(
                    "Burn {burn_tx} is in flight, mint it with `recover --burn-tx {burn_tx}`"
                )));
            } else if let Some(handle) = burn_operation {
                progress.logs.push(LogLine::now(format!(
                    "Burn operation {handle} may still land, check its receipt before \
                     transferring again"
                )));
            }
        });
    }
}
