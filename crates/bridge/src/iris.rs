//! HTTP client for Circle's Iris API (fees and attestations).

use std::time::Duration;

use alloy::primitives::{Bytes, TxHash};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::attestation::{AttestationApi, AttestationError, AttestationLookup};
use crate::fee::{FeeError, FeeOracle, FeeRate};
use crate::{AttestationMessage, SpeedTier};

/// Circle's sandbox (testnet) Iris deployment.
pub const IRIS_SANDBOX_URL: &str = "https://iris-api-sandbox.circle.com";

const COMPLETE_STATUS: &str = "complete";

/// Fee entry from `/v2/burn/USDC/fees/{source}/{dest}`, one per finality
/// threshold level.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct FeeEntry {
    finality_threshold: u32,
    /// Basis points; fractional values are rounded down.
    minimum_fee: serde_json::Number,
}

impl FeeEntry {
    fn minimum_fee_bps(&self) -> u64 {
        self.minimum_fee.as_u64().unwrap_or_else(|| {
            self.minimum_fee
                .as_f64()
                .filter(|bps| bps.is_finite() && *bps >= 0.0)
                .map_or(0, |bps| bps.floor() as u64)
        })
    }
}

/// The fee endpoint answers with an array of entries; older deployments
/// answered with a single entry, bare or under `data`.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum FeeResponse {
    Entries(Vec<FeeEntry>),
    Wrapped { data: FeeEntry },
    Single(FeeEntry),
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct MessageEntry {
    attestation: Option<String>,
    message: Option<String>,
    status: String,
}

#[derive(Deserialize, Debug)]
struct MessagesResponse {
    #[serde(default)]
    messages: Vec<MessageEntry>,
}

/// Iris API client.
#[derive(Debug, Clone)]
pub struct IrisClient {
    http_client: reqwest::Client,
    base_url: Url,
}

impl IrisClient {
    pub fn new(base_url: Url) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http_client,
            base_url,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.as_str().trim_end_matches('/'))
    }
}

#[async_trait]
impl FeeOracle for IrisClient {
    async fn fee_rate(
        &self,
        source_domain: u32,
        destination_domain: u32,
        speed: SpeedTier,
    ) -> Result<FeeRate, FeeError> {
        let url = self.endpoint(&format!(
            "/v2/burn/USDC/fees/{source_domain}/{destination_domain}"
        ));
        let response = self.http_client.get(&url).send().await?;

        if !response.status().is_success() {
            warn!(url, status = response.status().as_u16(), "Fee endpoint failed");
            return Err(FeeError::UnexpectedStatus {
                status: response.status().as_u16(),
            });
        }

        let body = response.bytes().await?;
        let finality_threshold = speed.finality_threshold();

        let entry = match serde_json::from_slice::<FeeResponse>(&body)? {
            FeeResponse::Entries(entries) => entries
                .into_iter()
                .find(|entry| entry.finality_threshold == finality_threshold)
                .ok_or(FeeError::ThresholdNotQuoted { finality_threshold })?,
            FeeResponse::Wrapped { data: entry } | FeeResponse::Single(entry) => entry,
        };

        debug!(
            source_domain,
            destination_domain,
            finality_threshold = entry.finality_threshold,
            bps = %entry.minimum_fee,
            "Retrieved CCTP fee rate"
        );

        Ok(FeeRate {
            minimum_fee_bps: entry.minimum_fee_bps(),
            finality_threshold: entry.finality_threshold,
        })
    }
}

#[async_trait]
impl AttestationApi for IrisClient {
    async fn fetch_attestation(
        &self,
        source_domain: u32,
        burn_tx: TxHash,
    ) -> Result<AttestationLookup, AttestationError> {
        let url = self.endpoint(&format!(
            "/v2/messages/{source_domain}?transactionHash={burn_tx}"
        ));
        let response = self.http_client.get(&url).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(AttestationLookup::NotFound),
            status if !status.is_success() => {
                return Err(AttestationError::UnexpectedStatus {
                    status: status.as_u16(),
                });
            }
            _ => {}
        }

        let body = response.bytes().await?;
        let parsed: MessagesResponse = serde_json::from_slice(&body)?;

        let Some(entry) = parsed.messages.into_iter().next() else {
            return Ok(AttestationLookup::NotFound);
        };

        if entry.status == COMPLETE_STATUS {
            let attestation = entry.attestation.ok_or(AttestationError::MissingField {
                field: "attestation",
            })?;
            let message = entry
                .message
                .ok_or(AttestationError::MissingField { field: "message" })?;

            return Ok(AttestationLookup::Complete(AttestationMessage {
                message: Bytes::from(alloy::hex::decode(message)?),
                attestation: Bytes::from(alloy::hex::decode(attestation)?),
                status: entry.status,
            }));
        }

        if entry.status.starts_with("pending") {
            return Ok(AttestationLookup::Pending {
                status: entry.status,
            });
        }

        Ok(AttestationLookup::Failed {
            status: entry.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    fn client(server: &MockServer) -> IrisClient {
        IrisClient::new(server.base_url().parse().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn fee_rate_picks_entry_for_speed_tier() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v2/burn/USDC/fees/6/0");
            then.status(200).json_body(json!([
                {"finalityThreshold": 1000, "minimumFee": 1},
                {"finalityThreshold": 2000, "minimumFee": 0}
            ]));
        });

        let iris = client(&server);

        let fast = iris.fee_rate(6, 0, SpeedTier::Fast).await.unwrap();
        let standard = iris.fee_rate(6, 0, SpeedTier::Standard).await.unwrap();

        assert_eq!(
            fast,
            FeeRate {
                minimum_fee_bps: 1,
                finality_threshold: 1000
            }
        );
        assert_eq!(standard.minimum_fee_bps, 0);
        assert_eq!(standard.finality_threshold, 2000);
    }

    #[tokio::test]
    async fn fee_rate_accepts_wrapped_single_entry() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v2/burn/USDC/fees/3/0");
            then.status(200).json_body(json!({
                "data": {"finalityThreshold": 1000, "minimumFee": 1.5}
            }));
        });

        let rate = client(&server)
            .fee_rate(3, 0, SpeedTier::Fast)
            .await
            .unwrap();

        assert_eq!(rate.minimum_fee_bps, 1);
    }

    #[tokio::test]
    async fn fee_rate_fails_on_server_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path_contains("/v2/burn/USDC/fees");
            then.status(500);
        });

        let error = client(&server)
            .fee_rate(6, 0, SpeedTier::Fast)
            .await
            .unwrap_err();

        assert!(matches!(error, FeeError::UnexpectedStatus { status: 500 }));
    }

    #[tokio::test]
    async fn fee_rate_fails_on_malformed_body() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path_contains("/v2/burn/USDC/fees");
            then.status(200).body("not json");
        });

        let error = client(&server)
            .fee_rate(6, 0, SpeedTier::Fast)
            .await
            .unwrap_err();

        assert!(matches!(error, FeeError::Malformed(_)));
    }

    #[tokio::test]
    async fn not_indexed_burn_reads_as_not_found() {
        let server = MockServer::start();
        let burn_tx = TxHash::repeat_byte(0xab);
        server.mock(|when, then| {
            when.method(GET)
                .path("/v2/messages/6")
                .query_param("transactionHash", burn_tx.to_string());
            then.status(404);
        });

        let lookup = client(&server).fetch_attestation(6, burn_tx).await.unwrap();

        assert_eq!(lookup, AttestationLookup::NotFound);
    }

    #[tokio::test]
    async fn empty_message_list_reads_as_not_found() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v2/messages/0");
            then.status(200).json_body(json!({"messages": []}));
        });

        let lookup = client(&server)
            .fetch_attestation(0, TxHash::ZERO)
            .await
            .unwrap();

        assert_eq!(lookup, AttestationLookup::NotFound);
    }

    #[tokio::test]
    async fn complete_attestation_is_decoded() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v2/messages/6");
            then.status(200).json_body(json!({
                "messages": [{
                    "status": "complete",
                    "message": "0x0102",
                    "attestation": "0xaabb"
                }]
            }));
        });

        let lookup = client(&server)
            .fetch_attestation(6, TxHash::ZERO)
            .await
            .unwrap();

        assert_eq!(
            lookup,
            AttestationLookup::Complete(AttestationMessage {
                message: Bytes::from(vec![1, 2]),
                attestation: Bytes::from(vec![0xaa, 0xbb]),
                status: "complete".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn pending_and_unknown_statuses_are_distinguished() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v2/messages/1");
            then.status(200).json_body(json!({
                "messages": [{"status": "pending_confirmations"}]
            }));
        });
        server.mock(|when, then| {
            when.method(GET).path("/v2/messages/2");
            then.status(200).json_body(json!({
                "messages": [{"status": "failed"}]
            }));
        });

        let iris = client(&server);

        assert!(matches!(
            iris.fetch_attestation(1, TxHash::ZERO).await.unwrap(),
            AttestationLookup::Pending { .. }
        ));
        assert!(matches!(
            iris.fetch_attestation(2, TxHash::ZERO).await.unwrap(),
            AttestationLookup::Failed { ref status } if status == "failed"
        ));
    }

    #[tokio::test]
    async fn complete_without_attestation_is_rejected() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v2/messages/6");
            then.status(200).json_body(json!({
                "messages": [{"status": "complete", "message": "0x01"}]
            }));
        });

        let error = client(&server)
            .fetch_attestation(6, TxHash::ZERO)
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            AttestationError::MissingField {
                field: "attestation"
            }
        ));
    }
}
