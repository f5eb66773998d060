use std::sync::Arc;

use alloy::primitives::Address;
use alloy::signers::Signer;
use godshand_evm::OwnerSigner;
use tokio::sync::{Mutex, MutexGuard};

/// Signing key plus the lock serializing its nonce windows.
///
/// The lock is held from authorization signing until inclusion, so two
/// operations signed by the same key never race for the same
/// transaction nonce. Clones share the lock.
#[derive(Clone)]
pub struct SigningIdentity {
    signer: OwnerSigner,
    nonce_window: Arc<Mutex<()>>,
}

impl SigningIdentity {
    pub fn new(signer: impl Signer + Send + Sync + 'static) -> Self {
        Self {
            signer: Arc::new(signer),
            nonce_window: Arc::new(Mutex::new(())),
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn signer(&self) -> &OwnerSigner {
        &self.signer
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, ()> {
        self.nonce_window.lock().await
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}
