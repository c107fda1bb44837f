//! # Records Read
//!
//! `Read` is a message type used to read a record in the web node. The read
//! returns the newest accepted `Write` for the targeted record, subject to
//! authorization.

use base64ct::{Base64UrlUnpadded, Encoding};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::auth::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::permissions;
use crate::provider::{DataStore, MessageStore, Provider, Signer};
use crate::records::{RecordsFilter, Write, protocol};
use crate::store::RecordsQueryBuilder;
use crate::{
    Descriptor, Error, Interface, Method, Result, cid, unauthorized,
};

/// Process a `Read` message.
///
/// # Errors
///
/// Returns a 404 error when no record matches (or the record is deleted) and
/// a 401 error when the requester may not read the record.
pub(crate) async fn handle(
    owner: &str, read: Read, provider: &impl Provider,
) -> Result<Reply<ReadReply>> {
    if let Some(authzn) = &read.authorization {
        authzn.verify(&read.descriptor, provider).await?;
    }

    // the newest active write for the record
    let record_id = &read.descriptor.record_id;
    let query = RecordsQueryBuilder::new()
        .add_filter(RecordsFilter::new().record_id(record_id))
        .build();
    let entries = MessageStore::query(provider, owner, &query).await?;

    let mut newest: Option<Write> = None;
    for entry in &entries {
        if let Some(write) = entry.as_write() {
            let replace = match &newest {
                Some(current) => entry.order_key()?
                    > (current.descriptor.base.message_timestamp, current.cid()?),
                None => true,
            };
            if replace {
                newest = Some(write.clone());
            }
        }
    }
    let Some(mut write) = newest else {
        return Err(Error::NotFound("no matching record found".to_string()));
    };

    read.authorize(owner, &write, provider).await?;

    // record data: inline when small enough, otherwise in the data store
    let data = if let Some(encoded) = &write.encoded_data {
        Some(Base64UrlUnpadded::decode_vec(encoded)?)
    } else {
        DataStore::get(provider, owner, record_id, &write.descriptor.data_cid).await?
    };
    write.encoded_data = None;

    // attach the initial write when the returned write is not it
    let initial_write = if write.is_initial(owner)? {
        None
    } else {
        let mut initial = protocol::initial_entry(owner, record_id, provider)
            .await?
            .ok_or_else(|| Error::Unexpected("initial write not found".to_string()))?;
        initial.encoded_data = None;
        Some(initial)
    };

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(ReadReply {
            entry: ReadReplyEntry {
                records_write: Some(write),
                initial_write,
                data,
            },
        }),
    })
}

/// Records read message payload.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Read {
    /// The Read descriptor.
    pub descriptor: ReadDescriptor,

    /// Message authorization. Absent for anonymous reads of published
    /// records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
}

impl Message for Read {
    type Reply = ReadReply;

    fn cid(&self) -> Result<String> {
        cid::compute(self)
    }

    fn descriptor(&self) -> &Descriptor {
        &self.descriptor.base
    }

    fn authorization(&self) -> Option<&Authorization> {
        self.authorization.as_ref()
    }

    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>> {
        handle(owner, self, provider).await
    }
}

impl Read {
    // Verify the fetched record can be safely returned to the requester.
    async fn authorize(&self, owner: &str, write: &Write, provider: &impl Provider) -> Result<()> {
        // published records are readable by anyone
        if write.descriptor.published.unwrap_or_default() {
            return Ok(());
        }

        let Some(authzn) = &self.authorization else {
            return Err(unauthorized!("read of an unpublished record requires authorization"));
        };
        let author = authzn.author()?;

        // the tenant, the record author, and the record recipient can read
        if author == owner {
            return Ok(());
        }
        if author == write.authorization.author()? {
            return Ok(());
        }
        if write.descriptor.recipient.as_deref() == Some(author.as_str()) {
            return Ok(());
        }

        // a grant-holder can read
        if let Some(grant_id) = authzn.payload()?.permission_grant_id {
            let grant = permissions::fetch_grant(owner, &grant_id, provider).await?;
            return grant
                .verify_active(
                    owner,
                    &author,
                    &self.descriptor.base,
                    write.descriptor.protocol.as_deref(),
                    provider,
                )
                .await;
        }

        // otherwise the record's protocol decides
        if write.descriptor.protocol.is_some() {
            return protocol::permit_read(owner, &author, write, provider).await;
        }

        Err(unauthorized!("read cannot be authorized"))
    }
}

/// Read reply.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReply {
    /// The read reply entry.
    pub entry: ReadReplyEntry,
}

/// Read reply entry.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReplyEntry {
    /// The latest `RecordsWrite` message of the record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_write: Option<Write>,

    /// The initial write of the record, when the returned write is not
    /// itself the initial write.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_write: Option<Write>,

    /// The record data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

/// Read descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The ID of the record to read.
    pub record_id: String,
}

/// Options to use when creating a read message.
#[derive(Clone, Debug, Default)]
pub struct ReadBuilder {
    message_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    record_id: Option<String>,
    permission_grant_id: Option<String>,
    authorize: Option<bool>,
}

impl ReadBuilder {
    /// Returns a new [`ReadBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_timestamp: Some(chrono::Utc::now()),
            ..Self::default()
        }
    }

    /// Specify the record to read.
    #[must_use]
    pub fn record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    /// Specify the CID of a `PermissionsGrant` invoked to authorize the read.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Specify whether to sign the read. Unsigned reads are anonymous.
    #[must_use]
    pub const fn authorize(mut self, authorize: bool) -> Self {
        self.authorize = Some(authorize);
        self
    }

    /// Build the Read message.
    ///
    /// # Errors
    ///
    /// Returns an error when no record ID is set or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Read> {
        let record_id = self.record_id.ok_or_else(|| {
            crate::unexpected!("`record_id` not set")
        })?;

        let descriptor = ReadDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Read,
                message_timestamp: self.message_timestamp.unwrap_or_else(chrono::Utc::now),
            },
            record_id,
        };

        let authorization = if self.authorize.unwrap_or(true) {
            let mut builder =
                AuthorizationBuilder::new().descriptor_cid(cid::compute(&descriptor)?);
            if let Some(id) = self.permission_grant_id {
                builder = builder.permission_grant_id(id);
            }
            Some(builder.build(signer).await?)
        } else {
            None
        };

        Ok(Read {
            descriptor,
            authorization,
        })
    }
}
