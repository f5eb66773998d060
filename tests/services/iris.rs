//! Mock Circle Iris API.
//!
//! Serves the two endpoints a transfer calls: the fee schedule and the
//! attestation lookup for a burn.

use alloy::primitives::{B256, Bytes};
use httpmock::Mock;
use httpmock::prelude::*;
use serde_json::json;
use url::Url;

pub struct IrisMock {
    server: MockServer,
}

impl IrisMock {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start_async().await,
        }
    }

    pub fn url(&self) -> Url {
        self.server.base_url().parse().unwrap()
    }

    /// Fee schedule quoting `fast_bps` for fast and nothing for standard
    /// transfers between any two domains.
    pub fn mock_fees(&self, fast_bps: u64) -> Mock<'_> {
        self.server.mock(|when, then| {
            when.method(GET).path_contains("/v2/burn/USDC/fees/");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!([
                    {"finalityThreshold": 1000, "minimumFee": fast_bps},
                    {"finalityThreshold": 2000, "minimumFee": 0}
                ]));
        })
    }

    pub fn mock_fees_unavailable(&self) -> Mock<'_> {
        self.server.mock(|when, then| {
            when.method(GET).path_contains("/v2/burn/USDC/fees/");
            then.status(503);
        })
    }

    /// Completed attestation for any burn on `source_domain`.
    pub fn mock_attestation_complete(&self, source_domain: u32, nonce: B256) -> Mock<'_> {
        let message = attested_message(nonce);

        self.server.mock(|when, then| {
            when.method(GET)
                .path(format!("/v2/messages/{source_domain}"))
                .query_param_exists("transactionHash");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "messages": [{
                        "status": "complete",
                        "message": message.to_string(),
                        "attestation": Bytes::from(vec![0xab; 65]).to_string()
                    }]
                }));
        })
    }

    pub fn mock_attestation_status(&self, source_domain: u32, status: &str) -> Mock<'_> {
        self.server.mock(|when, then| {
            when.method(GET)
                .path(format!("/v2/messages/{source_domain}"))
                .query_param_exists("transactionHash");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({"messages": [{"status": status}]}));
        })
    }

    pub fn mock_attestation_not_found(&self, source_domain: u32) -> Mock<'_> {
        self.server.mock(|when, then| {
            when.method(GET).path(format!("/v2/messages/{source_domain}"));
            then.status(404);
        })
    }
}

/// CCTP v2 message with `nonce` at bytes 12..44.
pub fn attested_message(nonce: B256) -> Bytes {
    let mut message = vec![0u8; 12];
    message.extend_from_slice(nonce.as_slice());
    message.extend_from_slice(&[0xee; 32]);
    Bytes::from(message)
}
