//! # Endpoint
//!
//! The engine's entry point. Message processing is logically serialized per
//! tenant: handlers read prior state, decide acceptance, and write new state
//! under a per-tenant lock, so competing writers cannot interleave between
//! decision and commit.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, LazyLock, Mutex, Weak};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::Authorization;
use crate::provider::Provider;
use crate::{Descriptor, Result, schema};

// Per-tenant locks, lazily created and weakly held so idle tenants are
// reclaimed.
static TENANT_LOCKS: LazyLock<Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn tenant_lock(owner: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = TENANT_LOCKS.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    locks.retain(|_, lock| lock.strong_count() > 0);

    if let Some(lock) = locks.get(owner).and_then(Weak::upgrade) {
        return lock;
    }
    let lock = Arc::new(tokio::sync::Mutex::new(()));
    locks.insert(owner.to_string(), Arc::downgrade(&lock));
    lock
}

/// Handle incoming messages.
///
/// # Errors
///
/// Returns the handler's error when the message is malformed (400), fails
/// authentication or authorization (401), references missing state (400/404),
/// loses a convergence race (409), or a store operation fails (500).
pub async fn handle<T>(
    owner: &str, message: impl Message<Reply = T>, provider: &impl Provider,
) -> Result<Reply<T>> {
    let lock = tenant_lock(owner);
    let _guard = lock.lock().await;

    let descriptor = message.descriptor();
    debug!(
        interface = %descriptor.interface, method = %descriptor.method,
        "handling message"
    );

    message.validate()?;
    message.handle(owner, provider).await
}

/// Methods common to all messages.
pub trait Message: Serialize + Clone + Debug + Send + Sync {
    /// The message's inner reply type.
    type Reply;

    /// Compute the CID of the message.
    ///
    /// # Errors
    ///
    /// Returns an error when the message cannot be serialized.
    fn cid(&self) -> Result<String>;

    /// Returns the component of the message descriptor common to all
    /// messages.
    fn descriptor(&self) -> &Descriptor;

    /// Returns the message's authorization, if set.
    fn authorization(&self) -> Option<&Authorization>;

    /// Handle the message.
    fn handle(
        self, owner: &str, provider: &impl Provider,
    ) -> impl Future<Output = Result<Reply<Self::Reply>>> + Send;

    /// Validate the message structure. Message-specific validation is done in
    /// the message handler.
    ///
    /// # Errors
    ///
    /// Returns a 400 error when a structurally required field is missing.
    fn validate(&self) -> Result<()> {
        schema::validate(self)
    }
}

/// Reply used by all endpoints.
#[derive(Debug, Default, Deserialize, Serialize)]
#[allow(clippy::module_name_repetitions)]
pub struct Reply<T> {
    /// Status message to accompany the reply.
    pub status: Status,

    /// Endpoint-specific reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(flatten)]
    pub body: Option<T>,
}

/// Reply status.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Status code.
    pub code: u16,

    /// Status detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
