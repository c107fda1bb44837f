//! # Revoke
//!
//! `PermissionsRevoke` messages deactivate a grant. For any grant, stored
//! revokes converge to exactly one: the revoke with the earliest
//! `(messageTimestamp, CID)`. A retroactively earlier revoke supersedes a
//! stored later one, which is deleted from the message store and purged from
//! the event log so that replaying the log yields the same final state.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat::Micros, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::permissions;
use crate::provider::{EventLog, MessageStore, Provider, Signer};
use crate::store::{Entry, EntryType, Query};
use crate::{
    Descriptor, Interface, Method, Result, cid, conflict, unauthorized, unexpected,
};

/// Process a `Revoke` message.
///
/// # Errors
///
/// Returns a 400 error when the cited grant does not exist or the revoke
/// predates it, 401 when the author may not revoke the grant, and 409 when an
/// earlier-ordered revoke is already stored.
pub(crate) async fn handle(
    owner: &str, revoke: Revoke, provider: &impl Provider,
) -> Result<Reply<RevokeReply>> {
    revoke.authorization.verify(&revoke.descriptor, provider).await?;

    // the revoke must cite a stored grant
    let grant_id = revoke.descriptor.permissions_grant_id.clone();
    let grant = permissions::fetch_grant(owner, &grant_id, provider).await?;

    // a revoke cannot predate the grant it revokes
    if revoke.descriptor.base.message_timestamp < grant.descriptor.base.message_timestamp {
        return Err(unexpected!(
            "PermissionsRevoke has earlier date than associated PermissionsGrant"
        ));
    }

    // only the tenant the grant was issued for may revoke it
    if revoke.authorization.author()? != grant.descriptor.granted_for {
        return Err(unauthorized!("message failed authorization: unauthorized revoke"));
    }

    // convergence: the earliest (timestamp, CID) revoke wins
    let incoming_cid = revoke.cid()?;
    let incoming_key = (revoke.descriptor.base.message_timestamp, incoming_cid.clone());

    let query = Query::new()
        .add("interface", Interface::Permissions.to_string())
        .add("method", Method::Revoke.to_string())
        .add("permissionsGrantId", &grant_id);
    let existing = MessageStore::query(provider, owner, &query).await?;

    for entry in &existing {
        let key = entry.order_key()?;
        if key.1 == incoming_cid {
            // replay of the stored revoke
            return Ok(accepted());
        }
        if key < incoming_key {
            return Err(conflict!("an earlier revocation of the grant exists"));
        }
    }

    // the incoming revoke wins: store it, then purge the superseded losers so
    // replaying the event log converges on the same state
    let entry = Entry::new(EntryType::Revoke(revoke))?;
    MessageStore::put(provider, owner, &entry).await?;
    EventLog::append(provider, owner, &incoming_cid).await?;

    let mut superseded = Vec::new();
    for entry in &existing {
        let message_cid = entry.cid()?;
        MessageStore::delete(provider, owner, &message_cid).await?;
        superseded.push(message_cid);
    }
    if !superseded.is_empty() {
        debug!(grant = %grant_id, count = superseded.len(), "purging superseded revokes");
        EventLog::delete(provider, owner, &superseded).await?;
    }

    Ok(accepted())
}

fn accepted() -> Reply<RevokeReply> {
    Reply {
        status: Status {
            code: StatusCode::ACCEPTED.as_u16(),
            detail: None,
        },
        body: None,
    }
}

/// Permissions Revoke payload.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Revoke {
    /// The Revoke descriptor.
    pub descriptor: RevokeDescriptor,

    /// The message authorization.
    pub authorization: Authorization,
}

impl Message for Revoke {
    type Reply = RevokeReply;

    fn cid(&self) -> Result<String> {
        cid::compute(self)
    }

    fn descriptor(&self) -> &Descriptor {
        &self.descriptor.base
    }

    fn authorization(&self) -> Option<&Authorization> {
        Some(&self.authorization)
    }

    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>> {
        handle(owner, self, provider).await
    }
}

impl Revoke {
    pub(crate) fn indexes(&self) -> Result<HashMap<String, String>> {
        Ok(HashMap::from([
            ("interface".to_string(), Interface::Permissions.to_string()),
            ("method".to_string(), Method::Revoke.to_string()),
            (
                "permissionsGrantId".to_string(),
                self.descriptor.permissions_grant_id.clone(),
            ),
            ("author".to_string(), self.authorization.author()?),
            (
                "messageTimestamp".to_string(),
                self.descriptor.base.message_timestamp.to_rfc3339_opts(Micros, true),
            ),
            ("archived".to_string(), "false".to_string()),
        ]))
    }
}

/// Permissions Revoke reply. The body is empty: acceptance is conveyed by
/// the status.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RevokeReply {}

/// Revoke descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The CID of the grant being revoked.
    pub permissions_grant_id: String,
}

/// Options to use when creating a permission revocation.
#[derive(Clone, Debug, Default)]
pub struct RevokeBuilder {
    message_timestamp: Option<DateTime<Utc>>,
    permissions_grant_id: Option<String>,
}

impl RevokeBuilder {
    /// Returns a new [`RevokeBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_timestamp: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Specify the CID of the grant being revoked.
    #[must_use]
    pub fn permissions_grant_id(mut self, permissions_grant_id: impl Into<String>) -> Self {
        self.permissions_grant_id = Some(permissions_grant_id.into());
        self
    }

    /// Override the message timestamp.
    #[must_use]
    pub const fn message_timestamp(mut self, message_timestamp: DateTime<Utc>) -> Self {
        self.message_timestamp = Some(message_timestamp);
        self
    }

    /// Build the Revoke message.
    ///
    /// # Errors
    ///
    /// Returns an error when no grant ID is set or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Revoke> {
        let permissions_grant_id = self
            .permissions_grant_id
            .ok_or_else(|| unexpected!("`permissions_grant_id` not set"))?;

        let descriptor = RevokeDescriptor {
            base: Descriptor {
                interface: Interface::Permissions,
                method: Method::Revoke,
                message_timestamp: self.message_timestamp.unwrap_or_else(Utc::now),
            },
            permissions_grant_id,
        };

        let authorization = AuthorizationBuilder::new()
            .descriptor_cid(cid::compute(&descriptor)?)
            .build(signer)
            .await?;

        Ok(Revoke {
            descriptor,
            authorization,
        })
    }
}
