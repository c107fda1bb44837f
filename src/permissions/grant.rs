//! # Grant
//!
//! `PermissionsGrant` messages delegate a scoped capability from the tenant
//! (`grantedBy`) to another principal (`grantedTo`) within the tenant's data
//! space (`grantedFor`).

use std::collections::HashMap;

use chrono::{DateTime, Days, SecondsFormat::Micros, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::auth::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::provider::{EventLog, MessageStore, Provider, Signer};
use crate::store::{Entry, EntryType, Query};
use crate::{
    Descriptor, Interface, Method, Result, cid, unauthorized, unexpected,
};

/// Process a `Grant` message.
///
/// # Errors
///
/// Returns a 401 error when the message is not signed by `grantedBy` and a
/// 400 error when the grant is not issued for the tenant.
pub(crate) async fn handle(
    owner: &str, grant: Grant, provider: &impl Provider,
) -> Result<Reply<GrantReply>> {
    grant.authorization.verify(&grant.descriptor, provider).await?;

    let author = grant.authorization.author()?;
    if author != owner {
        return Err(unauthorized!("grants may only be issued by the tenant"));
    }
    if author != grant.descriptor.granted_by {
        return Err(unauthorized!("PermissionsGrant must be signed by the grantor"));
    }
    if grant.descriptor.granted_for != owner {
        return Err(unexpected!("PermissionsGrant must be granted for the tenant"));
    }
    if grant.descriptor.date_expires <= grant.descriptor.base.message_timestamp {
        return Err(unexpected!("PermissionsGrant expiry precedes its timestamp"));
    }

    let entry = Entry::new(EntryType::Grant(grant))?;
    MessageStore::put(provider, owner, &entry).await?;
    EventLog::append(provider, owner, &entry.cid()?).await?;

    Ok(Reply {
        status: Status {
            code: StatusCode::ACCEPTED.as_u16(),
            detail: None,
        },
        body: None,
    })
}

/// Permissions Grant payload.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    /// The Grant descriptor.
    pub descriptor: GrantDescriptor,

    /// The message authorization.
    pub authorization: Authorization,
}

impl Message for Grant {
    type Reply = GrantReply;

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

impl Grant {
    /// Verify the grant authorizes `grantee` to send a message with the
    /// provided descriptor at the message's timestamp: scope, validity
    /// window, and revocation state are all checked.
    ///
    /// # Errors
    ///
    /// Returns a 401 error when any check fails.
    pub(crate) async fn verify_active(
        &self, owner: &str, grantee: &str, descriptor: &Descriptor, protocol: Option<&str>,
        store: &impl MessageStore,
    ) -> Result<()> {
        if self.descriptor.granted_to != grantee {
            return Err(unauthorized!("grant not granted to {grantee}"));
        }
        if self.descriptor.granted_for != owner {
            return Err(unauthorized!("grant not granted for the tenant"));
        }

        // scope
        if self.descriptor.scope.interface != descriptor.interface {
            return Err(unauthorized!("message interface is outside the grant scope"));
        }
        if self.descriptor.scope.method != descriptor.method {
            return Err(unauthorized!("message method is outside the grant scope"));
        }
        if let Some(scope_protocol) = &self.descriptor.scope.protocol {
            if protocol != Some(scope_protocol.as_str()) {
                return Err(unauthorized!("message protocol is outside the grant scope"));
            }
        }

        // validity window
        let timestamp = descriptor.message_timestamp;
        if timestamp < self.descriptor.base.message_timestamp {
            return Err(unauthorized!("grant is not yet active"));
        }
        if timestamp >= self.descriptor.date_expires {
            return Err(unauthorized!("grant has expired"));
        }

        // revocation: the winning revoke deactivates the grant from its
        // timestamp onward
        let query = Query::new()
            .add("interface", Interface::Permissions.to_string())
            .add("method", Method::Revoke.to_string())
            .add("permissionsGrantId", cid::compute(self)?);
        let revokes = store.query(owner, &query).await?;
        for entry in revokes {
            if entry.descriptor().message_timestamp <= timestamp {
                return Err(unauthorized!("grant has been revoked"));
            }
        }

        Ok(())
    }

    pub(crate) fn indexes(&self) -> Result<HashMap<String, String>> {
        Ok(HashMap::from([
            ("interface".to_string(), Interface::Permissions.to_string()),
            ("method".to_string(), Method::Grant.to_string()),
            ("author".to_string(), self.authorization.author()?),
            ("grantedBy".to_string(), self.descriptor.granted_by.clone()),
            ("grantedTo".to_string(), self.descriptor.granted_to.clone()),
            ("grantedFor".to_string(), self.descriptor.granted_for.clone()),
            (
                "messageTimestamp".to_string(),
                self.descriptor.base.message_timestamp.to_rfc3339_opts(Micros, true),
            ),
            ("archived".to_string(), "false".to_string()),
        ]))
    }
}

/// Permissions Grant reply. The body is empty: acceptance is conveyed by the
/// status.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GrantReply {}

/// Grant descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The DID the capability is granted to.
    pub granted_to: String,

    /// The DID issuing the grant.
    pub granted_by: String,

    /// The DID of the tenant the grant applies within.
    pub granted_for: String,

    /// When the grant ceases to be active.
    #[serde(with = "crate::utils::timestamp")]
    pub date_expires: DateTime<Utc>,

    /// The scope of the granted capability.
    pub scope: Scope,

    /// Optional grant description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Scope of a permission grant.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    /// The interface the grant applies to.
    pub interface: Interface,

    /// The method the grant applies to.
    pub method: Method,

    /// When set, the grant is constrained to records of this protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Options to use when creating a permission grant.
#[derive(Clone, Debug, Default)]
pub struct GrantBuilder {
    message_timestamp: Option<DateTime<Utc>>,
    granted_to: Option<String>,
    granted_for: Option<String>,
    date_expires: Option<DateTime<Utc>>,
    scope: Option<Scope>,
    description: Option<String>,
}

impl GrantBuilder {
    /// Returns a new [`GrantBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_timestamp: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Specify the DID the capability is granted to.
    #[must_use]
    pub fn granted_to(mut self, granted_to: impl Into<String>) -> Self {
        self.granted_to = Some(granted_to.into());
        self
    }

    /// Specify the tenant the grant applies within. Defaults to the grantor.
    #[must_use]
    pub fn granted_for(mut self, granted_for: impl Into<String>) -> Self {
        self.granted_for = Some(granted_for.into());
        self
    }

    /// Override the message timestamp.
    #[must_use]
    pub const fn message_timestamp(mut self, message_timestamp: DateTime<Utc>) -> Self {
        self.message_timestamp = Some(message_timestamp);
        self
    }

    /// Specify when the grant expires. Defaults to 100 days from issuance.
    #[must_use]
    pub const fn date_expires(mut self, date_expires: DateTime<Utc>) -> Self {
        self.date_expires = Some(date_expires);
        self
    }

    /// Specify the scope of the granted capability.
    #[must_use]
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Describe the grant.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Build the Grant message. The grantor is the signer.
    ///
    /// # Errors
    ///
    /// Returns an error when a required property is unset or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Grant> {
        let granted_to = self.granted_to.ok_or_else(|| unexpected!("`granted_to` not set"))?;
        let scope = self.scope.ok_or_else(|| unexpected!("`scope` not set"))?;

        let granted_by = crate::auth::signer_did(signer)?;
        let message_timestamp = self.message_timestamp.unwrap_or_else(Utc::now);

        let descriptor = GrantDescriptor {
            base: Descriptor {
                interface: Interface::Permissions,
                method: Method::Grant,
                message_timestamp,
            },
            granted_to,
            granted_for: self.granted_for.unwrap_or_else(|| granted_by.clone()),
            granted_by,
            date_expires: self
                .date_expires
                .unwrap_or_else(|| message_timestamp + Days::new(100)),
            scope,
            description: self.description,
        };

        let authorization = AuthorizationBuilder::new()
            .descriptor_cid(cid::compute(&descriptor)?)
            .build(signer)
            .await?;

        Ok(Grant {
            descriptor,
            authorization,
        })
    }
}
