//! # Records Write
//!
//! `Write` messages create or update records. A record's identity is derived
//! deterministically from its initial write; the record's current state is
//! the newest accepted write by `(messageTimestamp, CID)` order. Competing
//! writes converge: the loser is silently discarded, leaving stored state
//! unchanged.

use std::collections::HashMap;

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, SecondsFormat::Micros, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::auth::{self, Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::permissions;
use crate::provider::{DataStore, EventLog, MessageStore, Provider, Signer};
use crate::records::{RecordsFilter, protocol};
use crate::store::{Entry, EntryType, RecordsQueryBuilder};
use crate::{Descriptor, Error, Interface, Method, Result, cid, unauthorized, unexpected};

/// Process a `Write` message.
///
/// # Errors
///
/// Returns a 400 error when the write is malformed or references missing
/// state, 401 when authentication or authorization fails, and 409 when an
/// initial write already exists for the record with a different CID.
pub(crate) async fn handle(
    owner: &str, write: Write, provider: &impl Provider,
) -> Result<Reply<WriteReply>> {
    write.authorization.verify(&write.descriptor, provider).await?;
    write.verify_integrity(owner)?;

    // protocol records must conform to their protocol definition regardless
    // of who authored them
    if write.descriptor.protocol.is_some() {
        protocol::verify_integrity(owner, &write, provider).await?;
    }

    write.authorize(owner, provider).await?;

    // fetch all stored messages for the record
    let query = RecordsQueryBuilder::new()
        .method(None)
        .add_filter(RecordsFilter::new().record_id(&write.record_id))
        .include_archived(true)
        .build();
    let existing = MessageStore::query(provider, owner, &query).await?;

    if existing.iter().any(|entry| entry.descriptor().method == Method::Delete) {
        return Err(unexpected!("record has been deleted"));
    }

    let initial = initial_write(&existing, owner)?;

    // convergence: the newest (timestamp, CID) message wins
    let incoming_cid = write.cid()?;
    let incoming_key = (write.descriptor.base.message_timestamp, incoming_cid.clone());

    let mut latest_key = None;
    for entry in &existing {
        let key = entry.order_key()?;
        if latest_key.as_ref().is_none_or(|latest| &key > latest) {
            latest_key = Some(key);
        }
    }
    if let Some(latest_key) = latest_key {
        if incoming_key <= latest_key {
            // the loser is silently discarded: the caller cannot distinguish
            // the outcome from a store, and the event log is not mutated
            trace!(record_id = %write.record_id, "write superseded by stored state");
            return Ok(accepted());
        }
    }

    if write.is_initial(owner)? {
        if let Some(initial) = &initial {
            if initial.cid()? != incoming_cid {
                return Err(Error::Conflict(
                    "an initial write already exists for the record".to_string(),
                ));
            }
        }
    } else {
        // an update extends an existing record and must come from its author
        let Some(initial) = &initial else {
            return Err(unexpected!("initial write not found for record"));
        };
        if write.authorization.author()? != initial.authorization.author()? {
            return Err(unauthorized!("update author does not match the initial write author"));
        }
        write.verify_immutable(initial)?;
    }

    // persist the record data
    if let Some(encoded) = &write.encoded_data {
        let data = Base64UrlUnpadded::decode_vec(encoded)?;
        DataStore::put(provider, owner, &write.record_id, &write.descriptor.data_cid, &data)
            .await?;
    }

    // store the message and log the event
    let entry = Entry::new(EntryType::Write(write.clone()))?;
    MessageStore::put(provider, owner, &entry).await?;
    EventLog::append(provider, owner, &incoming_cid).await?;

    // supersede prior state. The initial write is retained (archived) because
    // record identity, ancestry, and author checks depend on it; other
    // superseded writes are deleted. Event-log entries for superseded writes
    // are retained.
    for entry in &existing {
        let Some(prior) = entry.as_write() else {
            continue;
        };
        let message_cid = entry.cid()?;
        if message_cid == incoming_cid {
            continue;
        }
        if prior.is_initial(owner)? {
            let mut archived = Entry::new(EntryType::Write(prior.clone()))?;
            archived.indexes.insert("archived".to_string(), "true".to_string());
            MessageStore::put(provider, owner, &archived).await?;
        } else {
            MessageStore::delete(provider, owner, &message_cid).await?;
        }
    }

    Ok(accepted())
}

fn accepted() -> Reply<WriteReply> {
    Reply {
        status: Status {
            code: StatusCode::ACCEPTED.as_u16(),
            detail: Some("Accepted".to_string()),
        },
        body: None,
    }
}

/// Find the initial write among the stored entries for a record.
pub(crate) fn initial_write(entries: &[Entry], owner: &str) -> Result<Option<Write>> {
    for entry in entries {
        if let Some(write) = entry.as_write() {
            if write.is_initial(owner)? {
                return Ok(Some(write.clone()));
            }
        }
    }
    Ok(None)
}

/// Records write message payload.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Write {
    /// The record's identity: equal to the entry ID of the initial write.
    pub record_id: String,

    /// For protocol records, the record ID of the root ancestor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// The Write descriptor.
    pub descriptor: WriteDescriptor,

    /// The message authorization.
    pub authorization: Authorization,

    /// The base64url-encoded record data, carried in the message when small
    /// enough.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded_data: Option<String>,
}

impl Message for Write {
    type Reply = WriteReply;

    fn cid(&self) -> Result<String> {
        // the message CID is stable whether or not data is attached
        let mut write = self.clone();
        write.encoded_data = None;
        cid::compute(&write)
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

impl Write {
    /// Whether this message is the record's initial write: its `recordId`
    /// equals the entry ID derived from its descriptor and the tenant.
    ///
    /// # Errors
    ///
    /// Returns an error when the descriptor cannot be serialized.
    pub fn is_initial(&self, owner: &str) -> Result<bool> {
        Ok(self.record_id == entry_id(&self.descriptor, owner)?)
    }

    // Structural checks tying the message to its record identity.
    fn verify_integrity(&self, owner: &str) -> Result<()> {
        let payload = self.authorization.payload()?;
        if payload.record_id.as_deref() != Some(self.record_id.as_str()) {
            return Err(unexpected!("signed payload does not commit to the record ID"));
        }
        if payload.context_id != self.context_id {
            return Err(unexpected!("signed payload does not commit to the context ID"));
        }

        if self.descriptor.protocol.is_some() && self.context_id.is_none() {
            return Err(unexpected!("protocol record is missing a context ID"));
        }

        if self.is_initial(owner)? {
            if self.descriptor.base.message_timestamp != self.descriptor.date_created {
                return Err(unexpected!(
                    "initial write timestamp must match the record creation date"
                ));
            }

            if let Some(protocol_path) = &self.descriptor.protocol_path {
                let is_root = !protocol_path.contains('/');
                if is_root && self.context_id.as_deref() != Some(self.record_id.as_str()) {
                    return Err(unexpected!(
                        "context ID of a protocol root must equal its record ID"
                    ));
                }
                if !is_root && self.descriptor.parent_id.is_none() {
                    return Err(unexpected!("nested protocol record is missing a parent ID"));
                }
            }
        }

        Ok(())
    }

    // Immutable descriptor properties must match the record's initial write.
    fn verify_immutable(&self, initial: &Self) -> Result<()> {
        let descriptor = &self.descriptor;
        let initial_descriptor = &initial.descriptor;

        if descriptor.recipient != initial_descriptor.recipient
            || descriptor.protocol != initial_descriptor.protocol
            || descriptor.protocol_path != initial_descriptor.protocol_path
            || descriptor.schema != initial_descriptor.schema
            || descriptor.parent_id != initial_descriptor.parent_id
            || descriptor.date_created != initial_descriptor.date_created
            || self.context_id != initial.context_id
        {
            return Err(unexpected!("immutable properties do not match the initial write"));
        }

        Ok(())
    }

    // Check the message author has sufficient privileges: the tenant, a
    // grant-holder, or an actor authorized by the record's protocol.
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        let author = self.authorization.author()?;
        if author == owner {
            return Ok(());
        }

        if let Some(grant_id) = self.authorization.payload()?.permission_grant_id {
            let grant = permissions::fetch_grant(owner, &grant_id, provider).await?;
            return grant
                .verify_active(
                    owner,
                    &author,
                    &self.descriptor.base,
                    self.descriptor.protocol.as_deref(),
                    provider,
                )
                .await;
        }

        if self.descriptor.protocol.is_some() {
            return protocol::permit_write(owner, self, provider).await;
        }

        Err(unauthorized!("{author} is not authorized to write to the record"))
    }

    pub(crate) fn indexes(&self) -> Result<HashMap<String, String>> {
        let mut indexes = HashMap::from([
            ("interface".to_string(), Interface::Records.to_string()),
            ("method".to_string(), Method::Write.to_string()),
            ("recordId".to_string(), self.record_id.clone()),
            ("author".to_string(), self.authorization.author()?),
            ("dataFormat".to_string(), self.descriptor.data_format.clone()),
            (
                "dateCreated".to_string(),
                self.descriptor.date_created.to_rfc3339_opts(Micros, true),
            ),
            (
                "messageTimestamp".to_string(),
                self.descriptor.base.message_timestamp.to_rfc3339_opts(Micros, true),
            ),
            (
                "published".to_string(),
                self.descriptor.published.unwrap_or_default().to_string(),
            ),
            ("archived".to_string(), "false".to_string()),
        ]);

        if let Some(context_id) = &self.context_id {
            indexes.insert("contextId".to_string(), context_id.clone());
        }
        if let Some(parent_id) = &self.descriptor.parent_id {
            indexes.insert("parentId".to_string(), parent_id.clone());
        }
        if let Some(protocol) = &self.descriptor.protocol {
            indexes.insert("protocol".to_string(), protocol.clone());
        }
        if let Some(protocol_path) = &self.descriptor.protocol_path {
            indexes.insert("protocolPath".to_string(), protocol_path.clone());
        }
        if let Some(schema) = &self.descriptor.schema {
            indexes.insert("schema".to_string(), schema.clone());
        }
        if let Some(recipient) = &self.descriptor.recipient {
            indexes.insert("recipient".to_string(), recipient.clone());
        }

        Ok(indexes)
    }
}

/// Records write reply. The body is empty: acceptance is conveyed by the
/// status.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct WriteReply {}

/// Write descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WriteDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The DID the record is addressed to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,

    /// The URI of the protocol the record belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// The record's path within the protocol: `/`-delimited record-definition
    /// names from the protocol root to the record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_path: Option<String>,

    /// The record's schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// The record ID of the record's parent in the protocol tree.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// The CID of the record data.
    pub data_cid: String,

    /// The size of the record data in bytes.
    pub data_size: usize,

    /// The MIME type of the record data.
    pub data_format: String,

    /// When the record was created. Immutable across updates.
    #[serde(with = "crate::utils::timestamp")]
    pub date_created: DateTime<Utc>,

    /// Whether the record is published (readable without authorization).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<bool>,
}

/// Deterministically derive a record's identity from its initial-write
/// descriptor and the tenant DID. The derivation excludes `recordId` itself,
/// sidestepping the circularity of a record identified by its own content.
///
/// # Errors
///
/// Returns an error when the descriptor cannot be serialized.
pub fn entry_id(descriptor: &WriteDescriptor, owner: &str) -> Result<String> {
    #[derive(Serialize)]
    struct EntryId<'a> {
        #[serde(flatten)]
        descriptor: &'a WriteDescriptor,
        tenant: &'a str,
    }
    cid::compute(&EntryId {
        descriptor,
        tenant: owner,
    })
}

/// Record data supplied to the builder.
#[derive(Clone, Debug, Default)]
pub enum Data {
    /// Data as a byte buffer.
    Bytes(Vec<u8>),

    /// No data.
    #[default]
    Empty,
}

impl From<Vec<u8>> for Data {
    fn from(data: Vec<u8>) -> Self {
        Self::Bytes(data)
    }
}

/// The protocol associated with a record under construction.
#[derive(Clone, Debug, Default)]
pub struct WriteProtocol {
    /// The protocol URI.
    pub protocol: String,

    /// The record's protocol path.
    pub protocol_path: String,
}

/// Options to use when creating or updating a record.
#[derive(Clone, Debug, Default)]
pub struct WriteBuilder {
    message_timestamp: Option<DateTime<Utc>>,
    recipient: Option<String>,
    protocol: Option<WriteProtocol>,
    parent_id: Option<String>,
    parent_context_id: Option<String>,
    schema: Option<String>,
    data_format: Option<String>,
    published: Option<bool>,
    data: Option<Data>,
    owner: Option<String>,
    permission_grant_id: Option<String>,
    existing: Option<Write>,
}

impl WriteBuilder {
    /// Returns a new [`WriteBuilder`] for a record's initial write.
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_timestamp: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Returns a [`WriteBuilder`] for an update to an existing record.
    /// Immutable properties are carried over from the provided write.
    #[must_use]
    pub fn from(existing: Write) -> Self {
        Self {
            message_timestamp: Some(Utc::now()),
            existing: Some(existing),
            ..Self::default()
        }
    }

    /// Specify the record data.
    #[must_use]
    pub fn data(mut self, data: Data) -> Self {
        self.data = Some(data);
        self
    }

    /// Specify the DID the record is addressed to.
    #[must_use]
    pub fn recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    /// Specify the protocol and protocol path for the record.
    #[must_use]
    pub fn protocol(mut self, protocol: WriteProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Specify the record's parent in the protocol tree. The new record
    /// inherits the parent's context.
    #[must_use]
    pub fn parent(mut self, parent: &Write) -> Self {
        self.parent_id = Some(parent.record_id.clone());
        self.parent_context_id = parent.context_id.clone();
        self
    }

    /// Specify the record's schema.
    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Specify the MIME type of the record data. Defaults to
    /// `application/json`.
    #[must_use]
    pub fn data_format(mut self, data_format: impl Into<String>) -> Self {
        self.data_format = Some(data_format.into());
        self
    }

    /// Specify whether the record is published.
    #[must_use]
    pub const fn published(mut self, published: bool) -> Self {
        self.published = Some(published);
        self
    }

    /// Override the message timestamp.
    #[must_use]
    pub const fn message_timestamp(mut self, message_timestamp: DateTime<Utc>) -> Self {
        self.message_timestamp = Some(message_timestamp);
        self
    }

    /// Specify the tenant whose data space the record targets. The record's
    /// identity is derived from this DID. Defaults to the author.
    #[must_use]
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Specify the CID of a `PermissionsGrant` invoked to authorize the
    /// write.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Build the Write message.
    ///
    /// # Errors
    ///
    /// Returns an error when the builder state is inconsistent or signing
    /// fails.
    #[allow(clippy::too_many_lines)]
    pub async fn build(self, signer: &impl Signer) -> Result<Write> {
        let message_timestamp = self.message_timestamp.unwrap_or_else(Utc::now);

        // record data
        let (encoded_data, data_cid, data_size) = match &self.data {
            Some(Data::Bytes(data)) => (
                Some(Base64UrlUnpadded::encode_string(data)),
                cid::compute_bytes(data)?,
                data.len(),
            ),
            Some(Data::Empty) | None => {
                if let Some(existing) = &self.existing {
                    (
                        existing.encoded_data.clone(),
                        existing.descriptor.data_cid.clone(),
                        existing.descriptor.data_size,
                    )
                } else {
                    (None, cid::compute_bytes(&[])?, 0)
                }
            }
        };

        let (descriptor, record_id, context_id) = if let Some(existing) = self.existing {
            // update: carry the record identity and immutable properties over
            let descriptor = WriteDescriptor {
                base: Descriptor {
                    interface: Interface::Records,
                    method: Method::Write,
                    message_timestamp,
                },
                recipient: existing.descriptor.recipient.clone(),
                protocol: existing.descriptor.protocol.clone(),
                protocol_path: existing.descriptor.protocol_path.clone(),
                schema: existing.descriptor.schema.clone(),
                parent_id: existing.descriptor.parent_id.clone(),
                data_cid,
                data_size,
                data_format: self
                    .data_format
                    .unwrap_or_else(|| existing.descriptor.data_format.clone()),
                date_created: existing.descriptor.date_created,
                published: self.published.or(existing.descriptor.published),
            };
            (descriptor, existing.record_id, existing.context_id)
        } else {
            // initial write: derive the record identity
            let descriptor = WriteDescriptor {
                base: Descriptor {
                    interface: Interface::Records,
                    method: Method::Write,
                    message_timestamp,
                },
                recipient: self.recipient,
                protocol: self.protocol.as_ref().map(|p| p.protocol.clone()),
                protocol_path: self.protocol.as_ref().map(|p| p.protocol_path.clone()),
                schema: self.schema,
                parent_id: self.parent_id,
                data_cid,
                data_size,
                data_format: self.data_format.unwrap_or_else(|| "application/json".to_string()),
                date_created: message_timestamp,
                published: self.published,
            };

            let owner = match self.owner {
                Some(owner) => owner,
                None => auth::signer_did(signer)?,
            };
            let record_id = entry_id(&descriptor, &owner)?;

            // protocol roots are their own context; children inherit the root
            let context_id = if descriptor.protocol.is_some() {
                if descriptor.parent_id.is_some() {
                    let Some(parent_context) = self.parent_context_id else {
                        return Err(unexpected!("nested record has no parent context"));
                    };
                    Some(parent_context)
                } else {
                    Some(record_id.clone())
                }
            } else {
                None
            };

            (descriptor, record_id, context_id)
        };

        let mut builder = AuthorizationBuilder::new()
            .descriptor_cid(cid::compute(&descriptor)?)
            .record_id(&record_id);
        if let Some(context_id) = &context_id {
            builder = builder.context_id(context_id);
        }
        if let Some(id) = self.permission_grant_id {
            builder = builder.permission_grant_id(id);
        }
        let authorization = builder.build(signer).await?;

        Ok(Write {
            record_id,
            context_id,
            descriptor,
            authorization,
            encoded_data,
        })
    }
}
