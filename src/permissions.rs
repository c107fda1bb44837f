//! # Permissions
//!
//! The `Permissions` interface: the grant/revoke lifecycle. A grant is
//! identified by its message CID; a revoke cites that CID. Competing revokes
//! for the same grant converge on the one with the earliest
//! `(messageTimestamp, CID)`.

mod grant;
mod revoke;

pub use self::grant::{Grant, GrantBuilder, GrantDescriptor, GrantReply, Scope};
pub use self::revoke::{Revoke, RevokeBuilder, RevokeDescriptor, RevokeReply};
use crate::provider::MessageStore;
use crate::{Result, unexpected};

/// Fetch the grant identified by `grant_id` (the grant's message CID).
///
/// # Errors
///
/// Returns a 400 error when no such grant is stored: the reference is under
/// the caller's control, so a dangling one is treated as malformed.
pub(crate) async fn fetch_grant(
    owner: &str, grant_id: &str, store: &impl MessageStore,
) -> Result<Grant> {
    let Some(entry) = store.get(owner, grant_id).await? else {
        return Err(unexpected!("Could not find PermissionsGrant with CID {grant_id}"));
    };
    let Some(grant) = entry.as_grant() else {
        return Err(unexpected!("Could not find PermissionsGrant with CID {grant_id}"));
    };
    Ok(grant.clone())
}
