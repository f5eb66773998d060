//! Transfer, recovery and balance commands.

use std::future::Future;
use std::io::Write;

use alloy::primitives::{Address, TxHash};
use godshand_bridge::{CancelHandle, SpeedTier, cancellation};
use godshand_evm::Evm;
use tokio::sync::watch;
use tracing::info;

use crate::chain::{ChainEntry, ChainKey};
use crate::config::Ctx;
use crate::transfer::{TransferOrder, TransferProgress, TransferState};
use crate::usdc::{Usdc, format_usdc};

pub(super) async fn transfer_command<W: Write>(
    stdout: &mut W,
    ctx: &Ctx,
    from: ChainKey,
    amount: Usdc,
    speed: SpeedTier,
    to: Option<Address>,
) -> anyhow::Result<()> {
    let amount = amount.to_base_units()?;

    writeln!(
        stdout,
        "Transfer: {from} -> {}, Amount: {}, Speed: {speed}",
        ctx.settlement_chain,
        format_usdc(amount)
    )?;
    writeln!(stdout, "   Sender: {}", ctx.sender.address())?;
    if let Some(to) = to {
        writeln!(stdout, "   Recipient: {to}")?;
    }

    let orchestrator = ctx.orchestrator().await?;
    let (handle, cancel) = cancellation();

    let order = TransferOrder {
        source_chain: from,
        amount,
        speed,
        destination_address: to,
    };

    let progress = follow_progress(
        stdout,
        orchestrator.subscribe(),
        orchestrator.execute(order, &cancel),
        &handle,
    )
    .await?;

    finish(stdout, &progress)
}

pub(super) async fn recover_command<W: Write>(
    stdout: &mut W,
    ctx: &Ctx,
    source_chain: ChainKey,
    burn_tx: TxHash,
) -> anyhow::Result<()> {
    writeln!(stdout, "Recovering CCTP transfer")?;
    writeln!(stdout, "   Burn tx: {burn_tx}")?;
    writeln!(stdout, "   Source chain: {source_chain}")?;
    writeln!(stdout, "   Destination chain: {}", ctx.settlement_chain)?;

    let orchestrator = ctx.orchestrator().await?;
    let (handle, cancel) = cancellation();

    let progress = follow_progress(
        stdout,
        orchestrator.subscribe(),
        orchestrator.recover(source_chain, burn_tx, &cancel),
        &handle,
    )
    .await?;

    finish(stdout, &progress)
}

pub(super) async fn balance_command<W: Write>(
    stdout: &mut W,
    chain: &ChainEntry,
    owner: Address,
) -> anyhow::Result<()> {
    let profile = &chain.profile;
    let balance = chain.executor.read_balance(profile.usdc, owner).await?;
    let allowance = chain
        .executor
        .read_allowance(profile.usdc, owner, profile.token_messenger)
        .await?;

    writeln!(stdout, "Chain: {} (domain {})", profile.key, profile.domain)?;
    writeln!(stdout, "   Owner: {owner}")?;
    writeln!(stdout, "   USDC balance: {}", format_usdc(balance))?;
    writeln!(stdout, "   TokenMessenger allowance: {}", format_usdc(allowance))?;

    Ok(())
}

/// Prints log lines as the run publishes them, until `run` resolves.
///
/// The first Ctrl-C cancels the run through `cancel`; the run then ends
/// on its own once the cancellation is observed.
async fn follow_progress<W, F>(
    stdout: &mut W,
    mut updates: watch::Receiver<TransferProgress>,
    run: F,
    cancel: &CancelHandle,
) -> anyhow::Result<TransferProgress>
where
    W: Write,
    F: Future<Output = TransferProgress>,
{
    tokio::pin!(run);
    let mut printed = 0;
    let mut interrupted = false;

    let progress = loop {
        tokio::select! {
            progress = &mut run => break progress,
            Ok(()) = updates.changed() => {
                let snapshot = updates.borrow_and_update().clone();
                printed = print_new_lines(stdout, &snapshot, printed)?;
            }
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal?;
                interrupted = true;
                info!("Interrupt received, cancelling transfer");
                writeln!(stdout, "Interrupted, cancelling...")?;
                cancel.cancel();
            }
        }
    };

    print_new_lines(stdout, &progress, printed)?;
    Ok(progress)
}

fn print_new_lines<W: Write>(
    stdout: &mut W,
    progress: &TransferProgress,
    printed: usize,
) -> std::io::Result<usize> {
    // A reset starts a fresh log.
    let start = if printed > progress.logs.len() { 0 } else { printed };

    for line in &progress.logs[start..] {
        writeln!(stdout, "{line}")?;
    }

    Ok(progress.logs.len())
}

fn finish<W: Write>(stdout: &mut W, progress: &TransferProgress) -> anyhow::Result<()> {
    if !progress.transactions.is_empty() {
        writeln!(stdout, "\nTransactions:")?;
        for (role, tx_hash) in progress.transactions.iter() {
            writeln!(stdout, "   {role}: {tx_hash}")?;
        }
    }

    match (&progress.state, &progress.failure) {
        (TransferState::Completed, _) => {
            writeln!(stdout, "Transfer complete!")?;
            Ok(())
        }
        (_, Some(failure)) => {
            let source_chain = progress
                .request
                .as_ref()
                .map_or_else(|| "<chain>".to_string(), |request| request.source_chain.to_string());

            if let Some(burn_tx) = failure.burn_tx {
                writeln!(
                    stdout,
                    "Funds are in flight. Resume with: recover --source-chain {source_chain} --burn-tx {burn_tx}"
                )?;
            } else if let Some(handle) = failure.burn_operation {
                writeln!(
                    stdout,
                    "Burn operation {handle} was submitted but not confirmed. If its receipt \
                     shows an inclusion, resume with: recover --source-chain {source_chain} \
                     --burn-tx <tx>"
                )?;
            }
            anyhow::bail!("transfer failed while {:?}: {}", failure.step, failure.message)
        }
        (state, None) => anyhow::bail!("transfer stopped in state {state:?}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use alloy::primitives::{B256, U256, address};
    use alloy::signers::local::PrivateKeySigner;
    use godshand_bridge::mock::{MockFeeOracle, ScriptedAttestationApi};
    use godshand_bridge::{AttestationLookup, AttestationMessage, Cancellation};
    use godshand_evm::SponsorshipConfig;
    use godshand_evm::mock::{MockChain, MockOutcome};

    use super::*;
    use crate::chain::{ChainProfile, ChainRegistry};
    use crate::transfer::{SigningIdentity, TransferOrchestrator, TransferPolicy};

    const USDC: Address = address!("0x036CbD53842c5426634e7929541eC2318f3dCF7e");
    const TOKEN_MESSENGER: Address = address!("0x8FE6B999Dc680CcFDD5Bf7EB0974218be2542DAA");

    fn profile(key: &str, chain_id: u64, domain: u32) -> ChainProfile {
        ChainProfile {
            key: ChainKey::new(key),
            chain_id,
            domain,
            usdc: USDC,
            token_messenger: TOKEN_MESSENGER,
            message_transmitter: address!("0xE737e5cEBEEBa77EFE34D4aa090756590b1CE275"),
            sponsorship: SponsorshipConfig::default(),
        }
    }

    fn signer(byte: u8) -> SigningIdentity {
        SigningIdentity::new(PrivateKeySigner::from_bytes(&B256::repeat_byte(byte)).unwrap())
    }

    fn orchestrator(attestations: ScriptedAttestationApi) -> TransferOrchestrator {
        orchestrator_with_source(attestations, MockChain::new(11_155_111))
    }

    fn orchestrator_with_source(
        attestations: ScriptedAttestationApi,
        source: MockChain,
    ) -> TransferOrchestrator {
        let chains = ChainRegistry::new(ChainKey::new("base_sepolia"))
            .with_chain(profile("sepolia", 11_155_111, 0), Arc::new(source))
            .with_chain(profile("base_sepolia", 84_532, 6), Arc::new(MockChain::new(84_532)));

        TransferOrchestrator::new(
            Arc::new(chains),
            Arc::new(MockFeeOracle::with_bps(1)),
            Arc::new(attestations),
            signer(0x11),
            signer(0x22),
            TransferPolicy::default(),
        )
    }

    fn complete() -> AttestationLookup {
        AttestationLookup::Complete(AttestationMessage {
            message: vec![0u8; 64].into(),
            attestation: vec![1u8; 65].into(),
            status: "complete".to_string(),
        })
    }

    fn order(amount: U256) -> TransferOrder {
        TransferOrder {
            source_chain: ChainKey::new("sepolia"),
            amount,
            speed: SpeedTier::Standard,
            destination_address: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn follow_progress_prints_every_log_line_once() {
        let orchestrator = orchestrator(ScriptedAttestationApi::new([
            AttestationLookup::NotFound,
            complete(),
        ]));
        let (handle, _cancel) = cancellation();
        let mut stdout = Vec::new();

        let progress = follow_progress(
            &mut stdout,
            orchestrator.subscribe(),
            orchestrator.execute(order(U256::from(10_000_000u64)), &Cancellation::never()),
            &handle,
        )
        .await
        .unwrap();

        let output = String::from_utf8(stdout).unwrap();
        assert_eq!(progress.state, TransferState::Completed);
        assert_eq!(output.lines().count(), progress.logs.len());
        assert_eq!(output.matches("Burning USDC...").count(), 1);
        assert!(output.contains("Minting USDC..."));
        assert!(output.lines().last().unwrap().ends_with("Transfer completed"));
    }

    #[tokio::test(start_paused = true)]
    async fn finish_reports_failure_with_recovery_hint() {
        let orchestrator = orchestrator(ScriptedAttestationApi::repeating(
            AttestationLookup::Failed {
                status: "failed".to_string(),
            },
        ));

        let progress = orchestrator
            .execute(order(U256::from(10_000_000u64)), &Cancellation::never())
            .await;
        let mut stdout = Vec::new();

        let error = finish(&mut stdout, &progress).unwrap_err();

        let output = String::from_utf8(stdout).unwrap();
        assert!(output.contains("Burn: 0x"));
        assert!(output.contains("Funds are in flight"));
        assert!(output.contains("recover --source-chain sepolia --burn-tx 0x"));
        assert!(error.to_string().contains("WaitingAttestation"));
    }

    #[tokio::test(start_paused = true)]
    async fn finish_points_at_unconfirmed_burn_operation() {
        let source = MockChain::new(11_155_111);
        source.script([MockOutcome::Included, MockOutcome::NeverIncluded]);
        let orchestrator =
            orchestrator_with_source(ScriptedAttestationApi::repeating(complete()), source);

        let progress = orchestrator
            .execute(order(U256::from(10_000_000u64)), &Cancellation::never())
            .await;
        let handle = progress.failure.as_ref().unwrap().burn_operation.unwrap();
        let mut stdout = Vec::new();

        let error = finish(&mut stdout, &progress).unwrap_err();

        let output = String::from_utf8(stdout).unwrap();
        assert!(output.contains(&format!("Burn operation {handle} was submitted but not confirmed")));
        assert!(!output.contains("Funds are in flight"));
        assert!(error.to_string().contains("Burning"));
    }

    #[tokio::test(start_paused = true)]
    async fn finish_lists_transactions_of_completed_transfer() {
        let orchestrator = orchestrator(ScriptedAttestationApi::repeating(complete()));

        let progress = orchestrator
            .execute(order(U256::from(10_000_000u64)), &Cancellation::never())
            .await;
        let mut stdout = Vec::new();

        finish(&mut stdout, &progress).unwrap();

        let output = String::from_utf8(stdout).unwrap();
        assert!(output.contains("Approval: 0x"));
        assert!(output.contains("Burn: 0x"));
        assert!(output.contains("Mint: 0x"));
        assert!(output.ends_with("Transfer complete!\n"));
    }

    #[tokio::test]
    async fn balance_command_formats_usdc() {
        let chain = Arc::new(MockChain::new(84_532));
        let owner = address!("0x00000000000000000000000000000000000000aa");
        chain.set_balance(USDC, owner, U256::from(12_500_000u64));
        chain.set_allowance(USDC, owner, TOKEN_MESSENGER, U256::from(100_000u64));

        let entry = ChainEntry {
            profile: profile("base_sepolia", 84_532, 6),
            executor: chain,
        };
        let mut stdout = Vec::new();

        balance_command(&mut stdout, &entry, owner).await.unwrap();

        let output = String::from_utf8(stdout).unwrap();
        assert!(output.contains("Chain: base_sepolia (domain 6)"));
        assert!(output.contains("USDC balance: 12.5 USDC"));
        assert!(output.contains("TokenMessenger allowance: 0.1 USDC"));
    }
}
