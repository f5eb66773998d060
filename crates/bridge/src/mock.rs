//! Scripted fee oracle and attestation service for tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use alloy::primitives::TxHash;
use async_trait::async_trait;

use crate::SpeedTier;
use crate::attestation::{AttestationApi, AttestationError, AttestationLookup};
use crate::fee::{FeeError, FeeOracle, FeeRate};

/// Fee oracle answering with a fixed rate, or always failing.
#[derive(Debug)]
pub struct MockFeeOracle {
    minimum_fee_bps: Option<u64>,
    calls: AtomicUsize,
}

impl MockFeeOracle {
    pub fn with_bps(minimum_fee_bps: u64) -> Self {
        Self {
            minimum_fee_bps: Some(minimum_fee_bps),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            minimum_fee_bps: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeeOracle for MockFeeOracle {
    async fn fee_rate(
        &self,
        _source_domain: u32,
        _destination_domain: u32,
        speed: SpeedTier,
    ) -> Result<FeeRate, FeeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let minimum_fee_bps = self
            .minimum_fee_bps
            .ok_or(FeeError::UnexpectedStatus { status: 503 })?;

        Ok(FeeRate {
            minimum_fee_bps,
            finality_threshold: speed.finality_threshold(),
        })
    }
}

/// Attestation service replaying scripted lookups in order.
///
/// Once the script is exhausted the last lookup repeats.
#[derive(Debug)]
pub struct ScriptedAttestationApi {
    script: Mutex<VecDeque<AttestationLookup>>,
    last: Mutex<Option<AttestationLookup>>,
    calls: AtomicUsize,
    requested: Mutex<Vec<(u32, TxHash)>>,
}

impl ScriptedAttestationApi {
    pub fn new(script: impl IntoIterator<Item = AttestationLookup>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(lookup: AttestationLookup) -> Self {
        Self::new([lookup])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `(source_domain, burn_tx)` of every lookup, in order.
    pub fn requested(&self) -> Vec<(u32, TxHash)> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl AttestationApi for ScriptedAttestationApi {
    async fn fetch_attestation(
        &self,
        source_domain: u32,
        burn_tx: TxHash,
    ) -> Result<AttestationLookup, AttestationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested
            .lock()
            .unwrap()
            .push((source_domain, burn_tx));

        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();

        match next {
            Some(lookup) => {
                *last = Some(lookup.clone());
                Ok(lookup)
            }
            None => Ok(last.clone().unwrap_or(AttestationLookup::NotFound)),
        }
    }
}
