//! # Records Delete
//!
//! `Delete` messages mark a record as deleted. The record is not erased: a
//! `Delete` message is stored as the record's terminal state, superseded
//! non-initial writes are removed, the initial write is retained (archived),
//! and the record data is removed from the data store.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat::Micros, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::auth::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::provider::{DataStore, EventLog, MessageStore, Provider, Signer};
use crate::records::{RecordsFilter, write};
use crate::store::{Entry, EntryType, RecordsQueryBuilder};
use crate::{
    Descriptor, Error, Interface, Method, Result, cid, conflict, unauthorized, unexpected,
};

/// Process a `Delete` message.
///
/// # Errors
///
/// Returns a 404 error when the record does not exist or is already deleted,
/// 401 when the author may not delete the record, and 409 when newer record
/// state exists.
pub(crate) async fn handle(
    owner: &str, delete: Delete, provider: &impl Provider,
) -> Result<Reply<DeleteReply>> {
    delete.authorization.verify(&delete.descriptor, provider).await?;

    // fetch all stored messages for the record
    let record_id = delete.descriptor.record_id.clone();
    let query = RecordsQueryBuilder::new()
        .method(None)
        .add_filter(RecordsFilter::new().record_id(&record_id))
        .include_archived(true)
        .build();
    let existing = MessageStore::query(provider, owner, &query).await?;
    if existing.is_empty() {
        return Err(Error::NotFound("no matching record found".to_string()));
    }

    let mut latest: Option<&Entry> = None;
    for entry in &existing {
        let replace = match latest {
            Some(current) => entry.order_key()? > current.order_key()?,
            None => true,
        };
        if replace {
            latest = Some(entry);
        }
    }
    let Some(latest) = latest else {
        return Err(Error::NotFound("no matching record found".to_string()));
    };
    if latest.descriptor().method == Method::Delete {
        return Err(Error::NotFound("record is already deleted".to_string()));
    }

    // only the tenant or the record's author may delete it
    let author = delete.authorization.author()?;
    let Some(initial) = write::initial_write(&existing, owner)? else {
        return Err(unexpected!("initial write not found for record"));
    };
    if author != owner && author != initial.authorization.author()? {
        return Err(unauthorized!("{author} is not authorized to delete the record"));
    }

    // the delete must be newer than the record's current state
    let incoming_cid = delete.cid()?;
    let incoming_key = (delete.descriptor.base.message_timestamp, incoming_cid.clone());
    if incoming_key <= latest.order_key()? {
        return Err(conflict!("newer record state exists"));
    }

    let data_cid = latest.as_write().map(|write| write.descriptor.data_cid.clone());

    // store the delete and log the event
    let entry = Entry::new(EntryType::Delete(delete))?;
    MessageStore::put(provider, owner, &entry).await?;
    EventLog::append(provider, owner, &incoming_cid).await?;

    // supersede prior writes: retain the initial write (archived), delete the
    // rest, and remove the record data
    for entry in &existing {
        let Some(prior) = entry.as_write() else {
            continue;
        };
        if prior.is_initial(owner)? {
            let mut archived = Entry::new(EntryType::Write(prior.clone()))?;
            archived.indexes.insert("archived".to_string(), "true".to_string());
            MessageStore::put(provider, owner, &archived).await?;
        } else {
            MessageStore::delete(provider, owner, &entry.cid()?).await?;
        }
    }
    if let Some(data_cid) = data_cid {
        DataStore::delete(provider, owner, &record_id, &data_cid).await?;
    }

    Ok(Reply {
        status: Status {
            code: StatusCode::ACCEPTED.as_u16(),
            detail: None,
        },
        body: None,
    })
}

/// Records delete message payload.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delete {
    /// The Delete descriptor.
    pub descriptor: DeleteDescriptor,

    /// The message authorization.
    pub authorization: Authorization,
}

impl Message for Delete {
    type Reply = DeleteReply;

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

impl Delete {
    pub(crate) fn indexes(&self) -> Result<HashMap<String, String>> {
        Ok(HashMap::from([
            ("interface".to_string(), Interface::Records.to_string()),
            ("method".to_string(), Method::Delete.to_string()),
            ("recordId".to_string(), self.descriptor.record_id.clone()),
            ("author".to_string(), self.authorization.author()?),
            (
                "messageTimestamp".to_string(),
                self.descriptor.base.message_timestamp.to_rfc3339_opts(Micros, true),
            ),
            ("archived".to_string(), "false".to_string()),
        ]))
    }
}

/// Records delete reply. The body is empty: acceptance is conveyed by the
/// status.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DeleteReply {}

/// Delete descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The ID of the record to delete.
    pub record_id: String,
}

/// Options to use when creating a delete message.
#[derive(Clone, Debug, Default)]
pub struct DeleteBuilder {
    message_timestamp: Option<DateTime<Utc>>,
    record_id: Option<String>,
}

impl DeleteBuilder {
    /// Returns a new [`DeleteBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_timestamp: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Specify the record to delete.
    #[must_use]
    pub fn record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    /// Override the message timestamp.
    #[must_use]
    pub const fn message_timestamp(mut self, message_timestamp: DateTime<Utc>) -> Self {
        self.message_timestamp = Some(message_timestamp);
        self
    }

    /// Build the Delete message.
    ///
    /// # Errors
    ///
    /// Returns an error when no record ID is set or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Delete> {
        let record_id = self.record_id.ok_or_else(|| unexpected!("`record_id` not set"))?;

        let descriptor = DeleteDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Delete,
                message_timestamp: self.message_timestamp.unwrap_or_else(Utc::now),
            },
            record_id,
        };

        let authorization = AuthorizationBuilder::new()
            .descriptor_cid(cid::compute(&descriptor)?)
            .build(signer)
            .await?;

        Ok(Delete {
            descriptor,
            authorization,
        })
    }
}
