//! Attestation polling with a fixed interval and cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use alloy::primitives::TxHash;
use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::AttestationMessage;

/// Polling cadence used when none is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum AttestationError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid hex encoding: {0}")]
    HexDecode(#[from] alloy::hex::FromHexError),
    #[error("Failed to parse attestation response: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("Attestation service returned HTTP {status}")]
    UnexpectedStatus { status: u16 },
    #[error("Attestation not yet indexed")]
    NotYetAvailable,
    #[error("Attestation pending: {status}")]
    Pending { status: String },
    #[error("Attestation failed with status {status}")]
    Rejected { status: String },
    #[error("Attestation response missing required field: {field}")]
    MissingField { field: &'static str },
    #[error("No attestation after {attempts} attempts: {last}")]
    Exhausted {
        attempts: usize,
        last: Box<AttestationError>,
    },
    #[error("Attestation polling cancelled")]
    Cancelled,
}

impl AttestationError {
    /// Whether the poller should wait and ask again.
    ///
    /// Not-yet-indexed and pending responses retry, as do transport errors
    /// and server-side (5xx) failures. Terminal statuses, client errors and
    /// malformed payloads fail immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotYetAvailable | Self::Pending { .. } => true,
            Self::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Self::UnexpectedStatus { status } => *status >= 500,
            _ => false,
        }
    }
}

/// Outcome of a single attestation lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttestationLookup {
    /// The service has not indexed the burn yet (HTTP 404 or no messages).
    NotFound,
    /// The burn is indexed but not yet attested.
    Pending { status: String },
    Complete(AttestationMessage),
    /// Any other status; the attestation will not arrive.
    Failed { status: String },
}

/// Single-shot access to the attestation service.
#[async_trait]
pub trait AttestationApi: Send + Sync + 'static {
    async fn fetch_attestation(
        &self,
        source_domain: u32,
        burn_tx: TxHash,
    ) -> Result<AttestationLookup, AttestationError>;
}

#[async_trait]
impl<T: AttestationApi + ?Sized> AttestationApi for Arc<T> {
    async fn fetch_attestation(
        &self,
        source_domain: u32,
        burn_tx: TxHash,
    ) -> Result<AttestationLookup, AttestationError> {
        (**self).fetch_attestation(source_domain, burn_tx).await
    }
}

/// Creates a linked cancellation handle and signal.
pub fn cancellation() -> (CancelHandle, Cancellation) {
    let (sender, receiver) = watch::channel(false);
    (CancelHandle { sender }, Cancellation { receiver })
}

/// Requests cancellation of the waits observing the paired [`Cancellation`].
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

/// Cancellation signal observed by long waits.
#[derive(Debug, Clone)]
pub struct Cancellation {
    receiver: watch::Receiver<bool>,
}

impl Cancellation {
    /// Signal that is never raised.
    pub fn never() -> Self {
        cancellation().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once cancellation is requested.
    ///
    /// Never resolves if the handle is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Polls an [`AttestationApi`] until the attestation completes.
#[derive(Debug, Clone)]
pub struct AttestationPoller<A> {
    api: A,
    interval: Duration,
    max_attempts: Option<usize>,
}

impl<A: AttestationApi> AttestationPoller<A> {
    /// `max_attempts = None` polls until completion, failure or cancellation.
    pub fn new(api: A, interval: Duration, max_attempts: Option<usize>) -> Self {
        Self {
            api,
            interval,
            max_attempts,
        }
    }

    /// Waits for the attestation of `burn_tx`.
    ///
    /// Not-yet-available and pending lookups wait `interval` and retry;
    /// `on_retry` is called once per retry with the reason and the delay.
    /// A terminal status fails at once. Cancellation aborts the wait with
    /// [`AttestationError::Cancelled`].
    #[instrument(skip(self, cancel, on_retry), fields(interval = ?self.interval))]
    pub async fn poll_for_attestation<F>(
        &self,
        source_domain: u32,
        burn_tx: TxHash,
        cancel: &Cancellation,
        mut on_retry: F,
    ) -> Result<AttestationMessage, AttestationError>
    where
        F: FnMut(&AttestationError, Duration) + Send,
    {
        let backoff = match self.max_attempts {
            Some(max_attempts) => ConstantBuilder::default()
                .with_delay(self.interval)
                .with_max_times(max_attempts.saturating_sub(1)),
            None => ConstantBuilder::default()
                .with_delay(self.interval)
                .without_max_times(),
        };

        let attempts = AtomicUsize::new(0);
        let api = &self.api;
        let attempts_ref = &attempts;

        let fetch = move || async move {
            attempts_ref.fetch_add(1, Ordering::SeqCst);

            match api.fetch_attestation(source_domain, burn_tx).await? {
                AttestationLookup::Complete(message) => Ok(message),
                AttestationLookup::NotFound => Err(AttestationError::NotYetAvailable),
                AttestationLookup::Pending { status } => Err(AttestationError::Pending { status }),
                AttestationLookup::Failed { status } => Err(AttestationError::Rejected { status }),
            }
        };

        let polling = fetch
            .retry(backoff)
            .when(AttestationError::is_retryable)
            .notify(|err, delay| {
                match err {
                    AttestationError::Pending { status } => {
                        info!(%status, ?delay, "Attestation pending, retrying");
                    }
                    AttestationError::NotYetAvailable => {
                        debug!(?delay, "Attestation not yet indexed, retrying");
                    }
                    err => warn!(%err, ?delay, "Attestation lookup failed, retrying"),
                }
                on_retry(err, delay);
            });

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!(%burn_tx, "Attestation polling cancelled");
                return Err(AttestationError::Cancelled);
            }
            result = polling => result,
        };

        result.map_err(|err| {
            if err.is_retryable() {
                AttestationError::Exhausted {
                    attempts: attempts.load(Ordering::SeqCst),
                    last: Box::new(err),
                }
            } else {
                err
            }
        })
    }
}
