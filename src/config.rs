use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use alloy::providers::RootProvider;
use alloy::signers::local::PrivateKeySigner;
use clap::Parser;
use godshand_bridge::{FeePolicy, IrisClient};
use godshand_evm::bundler::BundlerExecutor;
use godshand_evm::rpc::RpcEvm;
use godshand_evm::{ChainError, SponsorshipConfig};
use serde::Deserialize;
use tracing::{Level, info};
use url::Url;

use crate::chain::{ChainEntry, ChainKey, ChainProfile, ChainRegistry};
use crate::transfer::{LinearRetry, SigningIdentity, TransferOrchestrator, TransferPolicy};
use crate::usdc::{Usdc, UsdcConversionError};

#[derive(Parser, Debug)]
pub struct Env {
    /// Path to plaintext TOML configuration file
    #[clap(long)]
    pub config: PathBuf,
    /// Path to TOML secrets file holding the signing keys
    #[clap(long)]
    pub secrets: PathBuf,
}

/// Non-secret settings deserialized from the plaintext config TOML.
#[derive(Deserialize)]
struct Config {
    log_level: Option<LogLevel>,
    iris_api_url: Url,
    settlement_chain: ChainKey,
    sponsorship: Option<SponsorshipSettings>,
    transfer: Option<TransferSettings>,
    chains: BTreeMap<ChainKey, ChainConfig>,
}

/// `[chains.<key>]` entry.
#[derive(Deserialize)]
struct ChainConfig {
    chain_id: u64,
    domain: u32,
    rpc_url: Url,
    bundler_url: Url,
    usdc: Address,
    token_messenger: Address,
    message_transmitter: Address,
}

/// `[sponsorship]` overrides; omitted fields keep Circle's paymaster
/// defaults.
#[derive(Deserialize, Default)]
struct SponsorshipSettings {
    paymaster: Option<Address>,
    permit_amount: Option<Usdc>,
    paymaster_verification_gas_limit: Option<u64>,
    paymaster_post_op_gas_limit: Option<u64>,
    entry_point: Option<Address>,
    delegate: Option<Address>,
}

/// `[transfer]` policy overrides. Amounts are in USDC, durations in
/// seconds.
#[derive(Deserialize, Default)]
struct TransferSettings {
    approval_cap: Option<Usdc>,
    floor_fee: Option<Usdc>,
    fallback_fee: Option<Usdc>,
    inclusion_timeout_secs: Option<u64>,
    receipt_poll_interval_secs: Option<u64>,
    attestation_poll_interval_secs: Option<u64>,
    attestation_max_attempts: Option<usize>,
    mint_retries: Option<usize>,
    mint_backoff_step_secs: Option<u64>,
}

/// Secret credentials deserialized from the secrets TOML.
#[derive(Deserialize)]
struct Secrets {
    sender_private_key: Option<B256>,
    gas_payer_private_key: Option<B256>,
}

/// A configured chain before it is connected.
#[derive(Debug, Clone)]
pub(crate) struct ChainCtx {
    pub(crate) profile: ChainProfile,
    pub(crate) rpc_url: Url,
    pub(crate) bundler_url: Url,
}

/// Runtime context assembled from config and secrets.
#[derive(Debug, Clone)]
pub struct Ctx {
    pub log_level: LogLevel,
    pub iris_api_url: Url,
    pub settlement_chain: ChainKey,
    pub(crate) chains: BTreeMap<ChainKey, ChainCtx>,
    pub policy: TransferPolicy,
    pub(crate) receipt_poll_interval: Duration,
    pub sender: SigningIdentity,
    pub gas_payer: SigningIdentity,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        (&log_level).into()
    }
}

impl From<&LogLevel> for Level {
    fn from(log_level: &LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML")]
    Toml(#[from] toml::de::Error),
    #[error("settlement chain {0} is not configured under [chains]")]
    UnknownSettlementChain(ChainKey),
    #[error("chain {0} is not configured")]
    UnknownChain(ChainKey),
    #[error("{0} missing from secrets")]
    MissingSecret(&'static str),
    #[error("invalid private key in {field}")]
    InvalidKey {
        field: &'static str,
        #[source]
        source: alloy::signers::k256::ecdsa::Error,
    },
    #[error("gas payer key must differ from the sender key")]
    GasPayerIsSender,
    #[error("invalid USDC amount for {field}")]
    InvalidAmount {
        field: &'static str,
        #[source]
        source: UsdcConversionError,
    },
    #[error("{field} must be at least one second")]
    ZeroInterval { field: &'static str },
    #[error("failed to connect to chain {chain}")]
    Connect {
        chain: ChainKey,
        #[source]
        source: ChainError,
    },
    #[error("failed to build Iris client")]
    Iris(#[source] reqwest::Error),
}

impl Ctx {
    pub fn load_files(config: &Path, secrets: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(config)?;
        let secrets_str = std::fs::read_to_string(secrets)?;
        Self::from_toml(&config_str, &secrets_str)
    }

    pub fn from_toml(config_toml: &str, secrets_toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(config_toml)?;
        let secrets: Secrets = toml::from_str(secrets_toml)?;

        if !config.chains.contains_key(&config.settlement_chain) {
            return Err(ConfigError::UnknownSettlementChain(config.settlement_chain));
        }

        let sender = signing_identity("sender_private_key", secrets.sender_private_key)?;
        let gas_payer = signing_identity("gas_payer_private_key", secrets.gas_payer_private_key)?;

        if sender.address() == gas_payer.address() {
            return Err(ConfigError::GasPayerIsSender);
        }

        let sponsorship = assemble_sponsorship(config.sponsorship.unwrap_or_default())?;
        let transfer = config.transfer.unwrap_or_default();
        let receipt_poll_interval = poll_interval(
            "transfer.receipt_poll_interval_secs",
            transfer.receipt_poll_interval_secs,
            Duration::from_secs(2),
        )?;
        let policy = assemble_policy(transfer)?;

        let chains = config
            .chains
            .into_iter()
            .map(|(key, chain)| {
                let ctx = ChainCtx {
                    profile: ChainProfile {
                        key: key.clone(),
                        chain_id: chain.chain_id,
                        domain: chain.domain,
                        usdc: chain.usdc,
                        token_messenger: chain.token_messenger,
                        message_transmitter: chain.message_transmitter,
                        sponsorship: sponsorship.clone(),
                    },
                    rpc_url: chain.rpc_url,
                    bundler_url: chain.bundler_url,
                };
                (key, ctx)
            })
            .collect();

        Ok(Self {
            log_level: config.log_level.unwrap_or(LogLevel::Info),
            iris_api_url: config.iris_api_url,
            settlement_chain: config.settlement_chain,
            chains,
            policy,
            receipt_poll_interval,
            sender,
            gas_payer,
        })
    }

    pub fn chain_keys(&self) -> impl Iterator<Item = &ChainKey> {
        self.chains.keys()
    }

    /// Connects to one configured chain, checking its RPC chain id.
    pub async fn connect_chain(&self, key: &ChainKey) -> Result<ChainEntry, ConfigError> {
        let chain = self
            .chains
            .get(key)
            .ok_or_else(|| ConfigError::UnknownChain(key.clone()))?;

        let provider: RootProvider = RootProvider::new_http(chain.rpc_url.clone());
        let evm = RpcEvm::connect(provider, chain.profile.chain_id)
            .await
            .map_err(|source| ConfigError::Connect {
                chain: key.clone(),
                source,
            })?;

        let executor = BundlerExecutor::new(
            evm,
            chain.bundler_url.clone(),
            chain.profile.sponsorship.entry_point,
        )
        .with_receipt_poll_interval(self.receipt_poll_interval);

        info!(chain = %key, chain_id = chain.profile.chain_id, "Connected chain");

        Ok(ChainEntry {
            profile: chain.profile.clone(),
            executor: Arc::new(executor),
        })
    }

    pub async fn connect_chains(&self) -> Result<ChainRegistry, ConfigError> {
        let mut registry = ChainRegistry::new(self.settlement_chain.clone());

        for key in self.chains.keys() {
            let entry = self.connect_chain(key).await?;
            registry = registry.with_chain(entry.profile, entry.executor);
        }

        Ok(registry)
    }

    /// Connects every chain and wires an orchestrator against Iris.
    pub async fn orchestrator(&self) -> Result<TransferOrchestrator, ConfigError> {
        let chains = self.connect_chains().await?;
        let iris = Arc::new(IrisClient::new(self.iris_api_url.clone()).map_err(ConfigError::Iris)?);

        Ok(TransferOrchestrator::new(
            Arc::new(chains),
            iris.clone(),
            iris,
            self.sender.clone(),
            self.gas_payer.clone(),
            self.policy,
        ))
    }
}

fn signing_identity(
    field: &'static str,
    key: Option<B256>,
) -> Result<SigningIdentity, ConfigError> {
    let key = key.ok_or(ConfigError::MissingSecret(field))?;
    let signer = PrivateKeySigner::from_bytes(&key)
        .map_err(|source| ConfigError::InvalidKey { field, source })?;

    Ok(SigningIdentity::new(signer))
}

fn base_units(
    field: &'static str,
    value: Option<Usdc>,
    default: U256,
) -> Result<U256, ConfigError> {
    value.map_or(Ok(default), |amount| {
        amount
            .to_base_units()
            .map_err(|source| ConfigError::InvalidAmount { field, source })
    })
}

fn assemble_sponsorship(settings: SponsorshipSettings) -> Result<SponsorshipConfig, ConfigError> {
    let defaults = SponsorshipConfig::default();

    Ok(SponsorshipConfig {
        paymaster: settings.paymaster.unwrap_or(defaults.paymaster),
        permit_amount: base_units(
            "sponsorship.permit_amount",
            settings.permit_amount,
            defaults.permit_amount,
        )?,
        paymaster_verification_gas_limit: settings
            .paymaster_verification_gas_limit
            .unwrap_or(defaults.paymaster_verification_gas_limit),
        paymaster_post_op_gas_limit: settings
            .paymaster_post_op_gas_limit
            .unwrap_or(defaults.paymaster_post_op_gas_limit),
        entry_point: settings.entry_point.unwrap_or(defaults.entry_point),
        delegate: settings.delegate.unwrap_or(defaults.delegate),
    })
}

/// Poll intervals must be non-zero; `None` keeps `default`.
fn poll_interval(
    field: &'static str,
    value: Option<u64>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::ZeroInterval { field }),
        Some(secs) => Ok(Duration::from_secs(secs)),
        None => Ok(default),
    }
}

fn assemble_policy(settings: TransferSettings) -> Result<TransferPolicy, ConfigError> {
    let defaults = TransferPolicy::default();
    let secs = |value: Option<u64>, default: Duration| value.map_or(default, Duration::from_secs);

    Ok(TransferPolicy {
        approval_cap: base_units(
            "transfer.approval_cap",
            settings.approval_cap,
            defaults.approval_cap,
        )?,
        fees: FeePolicy {
            floor_fee: base_units(
                "transfer.floor_fee",
                settings.floor_fee,
                defaults.fees.floor_fee,
            )?,
            fallback_fee: base_units(
                "transfer.fallback_fee",
                settings.fallback_fee,
                defaults.fees.fallback_fee,
            )?,
        },
        inclusion_timeout: secs(settings.inclusion_timeout_secs, defaults.inclusion_timeout),
        attestation_poll_interval: poll_interval(
            "transfer.attestation_poll_interval_secs",
            settings.attestation_poll_interval_secs,
            defaults.attestation_poll_interval,
        )?,
        attestation_max_attempts: settings
            .attestation_max_attempts
            .or(defaults.attestation_max_attempts),
        mint_retry: LinearRetry {
            max_retries: settings
                .mint_retries
                .unwrap_or(defaults.mint_retry.max_retries),
            step: secs(settings.mint_backoff_step_secs, defaults.mint_retry.step),
        },
    })
}

pub fn setup_tracing(log_level: &LogLevel) {
    let level: Level = log_level.into();
    let default_filter = format!("godshand={level},godshand_bridge={level},godshand_evm={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use alloy::primitives::address;

    use super::*;

    fn example_toml() -> &'static str {
        include_str!("../example.toml")
    }

    fn example_secrets() -> &'static str {
        include_str!("../example.secrets.toml")
    }

    fn minimal_toml() -> &'static str {
        r#"
            iris_api_url = "https://iris-api-sandbox.circle.com"
            settlement_chain = "base_sepolia"

            [chains.base_sepolia]
            chain_id = 84532
            domain = 6
            rpc_url = "https://sepolia.base.org"
            bundler_url = "https://bundler.example.com/base-sepolia"
            usdc = "0x036CbD53842c5426634e7929541eC2318f3dCF7e"
            token_messenger = "0x8FE6B999Dc680CcFDD5Bf7EB0974218be2542DAA"
            message_transmitter = "0xE737e5cEBEEBa77EFE34D4aa090756590b1CE275"
        "#
    }

    #[test]
    fn test_log_level_from_conversion() {
        let level: Level = LogLevel::Trace.into();
        assert_eq!(Level::TRACE, level);

        let level: Level = LogLevel::Warn.into();
        assert_eq!(Level::WARN, level);

        let log_level = LogLevel::Debug;
        let level: Level = (&log_level).into();
        assert_eq!(level, Level::DEBUG);
    }

    #[test]
    fn example_config_loads() {
        let ctx = Ctx::from_toml(example_toml(), example_secrets()).unwrap();

        assert_eq!(ctx.settlement_chain, ChainKey::new("base_sepolia"));
        assert_eq!(ctx.chains.len(), 4);

        let sepolia = &ctx.chains[&ChainKey::new("sepolia")];
        assert_eq!(sepolia.profile.domain, 0);
        assert_eq!(sepolia.profile.chain_id, 11_155_111);
        assert_eq!(
            sepolia.profile.usdc,
            address!("0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238")
        );

        assert_ne!(ctx.sender.address(), ctx.gas_payer.address());
        assert_eq!(ctx.iris_api_url.as_str(), "https://iris-api-sandbox.circle.com/");
    }

    #[test]
    fn defaults_applied_when_optional_sections_omitted() {
        let ctx = Ctx::from_toml(minimal_toml(), example_secrets()).unwrap();

        assert!(matches!(ctx.log_level, LogLevel::Info));
        assert_eq!(ctx.policy, TransferPolicy::default());
        assert_eq!(ctx.receipt_poll_interval, Duration::from_secs(2));
        assert_eq!(
            ctx.chains[&ChainKey::new("base_sepolia")].profile.sponsorship,
            SponsorshipConfig::default()
        );
    }

    #[test]
    fn transfer_overrides_are_applied() {
        let config = format!(
            r#"
            {}

            [transfer]
            approval_cap = "500"
            floor_fee = "0.25"
            fallback_fee = "2.5"
            inclusion_timeout_secs = 60
            attestation_poll_interval_secs = 5
            attestation_max_attempts = 120
            mint_retries = 5
            mint_backoff_step_secs = 1
            "#,
            minimal_toml()
        );

        let policy = Ctx::from_toml(&config, example_secrets()).unwrap().policy;

        assert_eq!(policy.approval_cap, U256::from(500_000_000u64));
        assert_eq!(policy.fees.floor_fee, U256::from(250_000u64));
        assert_eq!(policy.fees.fallback_fee, U256::from(2_500_000u64));
        assert_eq!(policy.inclusion_timeout, Duration::from_secs(60));
        assert_eq!(policy.attestation_poll_interval, Duration::from_secs(5));
        assert_eq!(policy.attestation_max_attempts, Some(120));
        assert_eq!(
            policy.mint_retry,
            LinearRetry {
                max_retries: 5,
                step: Duration::from_secs(1)
            }
        );
    }

    #[test]
    fn sponsorship_overrides_are_applied() {
        let config = format!(
            r#"
            {}

            [sponsorship]
            permit_amount = "2"
            paymaster_verification_gas_limit = 250000
            "#,
            minimal_toml()
        );

        let ctx = Ctx::from_toml(&config, example_secrets()).unwrap();
        let sponsorship = &ctx.chains[&ChainKey::new("base_sepolia")].profile.sponsorship;

        assert_eq!(sponsorship.permit_amount, U256::from(2_000_000u64));
        assert_eq!(sponsorship.paymaster_verification_gas_limit, 250_000);
        assert_eq!(
            sponsorship.paymaster_post_op_gas_limit,
            SponsorshipConfig::default().paymaster_post_op_gas_limit
        );
    }

    #[test]
    fn unknown_settlement_chain_is_rejected() {
        let config = minimal_toml().replace(
            "settlement_chain = \"base_sepolia\"",
            "settlement_chain = \"polygon_amoy\"",
        );

        let error = Ctx::from_toml(&config, example_secrets()).unwrap_err();

        assert!(
            matches!(error, ConfigError::UnknownSettlementChain(ref key) if key.as_str() == "polygon_amoy"),
            "{error:?}"
        );
    }

    #[test]
    fn missing_gas_payer_key_is_rejected() {
        let secrets = r#"
            sender_private_key = "0x0000000000000000000000000000000000000000000000000000000000000001"
        "#;

        let error = Ctx::from_toml(minimal_toml(), secrets).unwrap_err();

        assert!(matches!(error, ConfigError::MissingSecret("gas_payer_private_key")));
    }

    #[test]
    fn gas_payer_must_differ_from_sender() {
        let secrets = r#"
            sender_private_key = "0x0000000000000000000000000000000000000000000000000000000000000001"
            gas_payer_private_key = "0x0000000000000000000000000000000000000000000000000000000000000001"
        "#;

        let error = Ctx::from_toml(minimal_toml(), secrets).unwrap_err();

        assert!(matches!(error, ConfigError::GasPayerIsSender));
    }

    #[test]
    fn zero_private_key_is_rejected() {
        let secrets = r#"
            sender_private_key = "0x0000000000000000000000000000000000000000000000000000000000000000"
            gas_payer_private_key = "0x0000000000000000000000000000000000000000000000000000000000000002"
        "#;

        let error = Ctx::from_toml(minimal_toml(), secrets).unwrap_err();

        assert!(matches!(
            error,
            ConfigError::InvalidKey {
                field: "sender_private_key",
                ..
            }
        ));
    }

    #[test]
    fn sub_micro_fee_is_rejected() {
        let config = format!(
            r#"
            {}

            [transfer]
            floor_fee = "0.0000001"
            "#,
            minimal_toml()
        );

        let error = Ctx::from_toml(&config, example_secrets()).unwrap_err();

        assert!(matches!(
            error,
            ConfigError::InvalidAmount {
                field: "transfer.floor_fee",
                source: UsdcConversionError::TooPrecise(_)
            }
        ));
    }

    #[test]
    fn zero_poll_intervals_are_rejected() {
        for field in [
            "attestation_poll_interval_secs",
            "receipt_poll_interval_secs",
        ] {
            let config = format!(
                r#"
                {}

                [transfer]
                {field} = 0
                "#,
                minimal_toml()
            );

            let error = Ctx::from_toml(&config, example_secrets()).unwrap_err();

            assert!(
                matches!(
                    error,
                    ConfigError::ZeroInterval { field: rejected }
                        if rejected == format!("transfer.{field}")
                ),
                "{error:?}"
            );
        }
    }

    #[tokio::test]
    async fn connecting_unknown_chain_fails_without_network() {
        let ctx = Ctx::from_toml(minimal_toml(), example_secrets()).unwrap();

        let error = ctx.connect_chain(&ChainKey::new("sepolia")).await.unwrap_err();

        assert!(matches!(error, ConfigError::UnknownChain(ref key) if key.as_str() == "sepolia"));
    }
}
