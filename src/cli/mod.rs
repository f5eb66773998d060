//! CLI commands for sponsored USDC transfers, recovery and balance checks.

mod transfer;

use std::io::Write;

use alloy::primitives::{Address, TxHash};
use clap::{Parser, Subcommand, ValueEnum};
use godshand_bridge::SpeedTier;

use crate::chain::ChainKey;
use crate::config::{Ctx, Env};
use crate::usdc::Usdc;

/// CCTP finality tier requested for the burn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransferSpeed {
    /// Soft finality, higher fee
    Fast,
    /// Hard finality, lowest fee
    Standard,
}

impl From<TransferSpeed> for SpeedTier {
    fn from(speed: TransferSpeed) -> Self {
        match speed {
            TransferSpeed::Fast => Self::Fast,
            TransferSpeed::Standard => Self::Standard,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "godshand")]
#[command(about = "Gas-sponsored USDC transfers over Circle CCTP v2")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Transfer USDC from a chain to the settlement chain.
    ///
    /// Burns on the source chain, waits for Circle's attestation and mints
    /// on the settlement chain. Gas is paid in USDC on both sides. When the
    /// source is the settlement chain itself, a plain sponsored transfer is
    /// sent instead.
    Transfer {
        /// Chain to send from (a key under [chains] in the config)
        #[arg(long = "from")]
        from: ChainKey,
        /// Amount of USDC to send (e.g. 10.5)
        #[arg(short = 'a', long = "amount")]
        amount: Usdc,
        /// Finality tier of the burn
        #[arg(long = "speed", value_enum, default_value_t = TransferSpeed::Standard)]
        speed: TransferSpeed,
        /// Recipient on the settlement chain (defaults to the sender)
        #[arg(long = "to")]
        to: Option<Address>,
    },

    /// Mint an already burned transfer on the settlement chain.
    ///
    /// Use this when a burn succeeded but the mint did not complete, for
    /// example after a cancelled run or exhausted mint retries.
    Recover {
        /// Chain where the burn occurred
        #[arg(long = "source-chain")]
        source_chain: ChainKey,
        /// Transaction hash of the burn
        #[arg(long = "burn-tx")]
        burn_tx: TxHash,
    },

    /// Show the sender's USDC balance and token messenger allowance.
    Balance {
        /// Chain to query
        #[arg(long = "chain")]
        chain: ChainKey,
    },

    /// List configured chains.
    Chains,
}

/// Config and secrets paths plus the subcommand.
#[derive(Debug, Parser)]
#[command(name = "godshand")]
#[command(about = "Gas-sponsored USDC transfers over Circle CCTP v2")]
#[command(version)]
pub struct CliEnv {
    #[clap(flatten)]
    env: Env,
    #[command(subcommand)]
    pub command: Commands,
}

impl CliEnv {
    /// Parse CLI arguments, load config from file, and return with subcommand.
    pub fn parse_and_convert() -> anyhow::Result<(Ctx, Commands)> {
        Self::parse().load()
    }

    pub(crate) fn load(self) -> anyhow::Result<(Ctx, Commands)> {
        let ctx = Ctx::load_files(&self.env.config, &self.env.secrets)?;
        Ok((ctx, self.command))
    }
}

pub async fn run_command(ctx: Ctx, command: Commands) -> anyhow::Result<()> {
    run_command_with_writers(ctx, command, &mut std::io::stdout()).await
}

async fn run_command_with_writers<W: Write>(
    ctx: Ctx,
    command: Commands,
    stdout: &mut W,
) -> anyhow::Result<()> {
    match command {
        Commands::Transfer {
            from,
            amount,
            speed,
            to,
        } => transfer::transfer_command(stdout, &ctx, from, amount, speed.into(), to).await,
        Commands::Recover {
            source_chain,
            burn_tx,
        } => transfer::recover_command(stdout, &ctx, source_chain, burn_tx).await,
        Commands::Balance { chain } => {
            let entry = ctx.connect_chain(&chain).await?;
            transfer::balance_command(stdout, &entry, ctx.sender.address()).await
        }
        Commands::Chains => chains_command(stdout, &ctx),
    }
}

fn chains_command<W: Write>(stdout: &mut W, ctx: &Ctx) -> anyhow::Result<()> {
    for key in ctx.chain_keys() {
        let marker = if *key == ctx.settlement_chain {
            " (settlement)"
        } else {
            ""
        };
        writeln!(stdout, "{key}{marker}")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn example_ctx() -> Ctx {
        Ctx::from_toml(
            include_str!("../../example.toml"),
            include_str!("../../example.secrets.toml"),
        )
        .unwrap()
    }

    #[test]
    fn transfer_command_parses_with_defaults() {
        let cli = CliEnv::try_parse_from([
            "godshand",
            "--config",
            "config.toml",
            "--secrets",
            "secrets.toml",
            "transfer",
            "--from",
            "sepolia",
            "--amount",
            "10.5",
        ])
        .unwrap();

        let Commands::Transfer {
            from,
            amount,
            speed,
            to,
        } = cli.command
        else {
            panic!("expected transfer, got {:?}", cli.command);
        };

        assert_eq!(from, ChainKey::new("sepolia"));
        assert_eq!(amount, Usdc(dec!(10.5)));
        assert_eq!(speed, TransferSpeed::Standard);
        assert_eq!(to, None);
    }

    #[test]
    fn transfer_speed_maps_to_tier() {
        let cli = Cli::try_parse_from([
            "godshand",
            "transfer",
            "--from",
            "sepolia",
            "--amount",
            "1",
            "--speed",
            "fast",
        ])
        .unwrap();

        let Commands::Transfer { speed, .. } = cli.command else {
            panic!("expected transfer");
        };
        assert_eq!(SpeedTier::from(speed), SpeedTier::Fast);
    }

    #[test]
    fn recover_requires_burn_tx() {
        let error = Cli::try_parse_from(["godshand", "recover", "--source-chain", "sepolia"])
            .unwrap_err();

        assert!(
            error.to_string().contains("--burn-tx"),
            "Expected error about --burn-tx, got: {error}"
        );
    }

    #[test]
    fn cli_env_rejects_missing_config_flag() {
        let error = CliEnv::try_parse_from(["godshand", "--secrets", "s.toml", "chains"])
            .unwrap_err();

        assert!(
            error.to_string().contains("--config"),
            "Expected error about --config, got: {error}"
        );
    }

    #[test]
    fn chains_command_marks_settlement_chain() {
        let mut stdout = Vec::new();

        chains_command(&mut stdout, &example_ctx()).unwrap();

        let output = String::from_utf8(stdout).unwrap();
        assert!(output.contains("base_sepolia (settlement)\n"));
        assert!(output.contains("sepolia\n"));
        assert_eq!(output.lines().count(), 4);
    }
}
