//! # Records Query
//!
//! `Query` messages fetch the set of current `Write` messages matching a
//! filter. Requesters other than the tenant see only published records and
//! records they authored or received.

use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::auth::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::provider::{MessageStore, Provider, Signer};
use crate::records::{RecordsFilter, Write, protocol};
use crate::store::{Cursor, RecordsQueryBuilder};
use crate::{Descriptor, Interface, Method, Result, cid};

/// Process a `Query` message.
///
/// # Errors
///
/// Returns a 401 error when the query's authorization fails verification.
pub(crate) async fn handle(
    owner: &str, query: Query, provider: &impl Provider,
) -> Result<Reply<QueryReply>> {
    let requester = if let Some(authzn) = &query.authorization {
        authzn.verify(&query.descriptor, provider).await?;
        Some(authzn.author()?)
    } else {
        None
    };

    let store_query =
        RecordsQueryBuilder::new().add_filter(query.descriptor.filter.clone()).build();
    let entries = MessageStore::query(provider, owner, &store_query).await?;

    // sort newest first by (timestamp, CID)
    let mut writes = Vec::new();
    for entry in &entries {
        if let Some(write) = entry.as_write() {
            writes.push((entry.order_key()?, write.clone()));
        }
    }
    writes.sort_by(|(a, _), (b, _)| b.cmp(a));

    let mut reply_entries = Vec::new();
    for (_, write) in writes {
        if !visible_to(owner, requester.as_deref(), &write)? {
            continue;
        }

        // attach the initial write when the returned write is not it
        let initial_write = if write.is_initial(owner)? {
            None
        } else {
            let mut initial = protocol::initial_entry(owner, &write.record_id, provider)
                .await?
                .ok_or_else(|| crate::unexpected!("initial write not found"))?;
            initial.encoded_data = None;
            Some(initial)
        };

        reply_entries.push(QueryReplyEntry {
            write,
            initial_write,
        });
    }

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(QueryReply {
            entries: Some(reply_entries),
            cursor: None,
        }),
    })
}

// The tenant sees everything; other requesters see published records and
// records they authored or received.
fn visible_to(owner: &str, requester: Option<&str>, write: &Write) -> Result<bool> {
    if write.descriptor.published.unwrap_or_default() {
        return Ok(true);
    }
    let Some(requester) = requester else {
        return Ok(false);
    };
    if requester == owner {
        return Ok(true);
    }
    if write.authorization.author()? == requester {
        return Ok(true);
    }
    Ok(write.descriptor.recipient.as_deref() == Some(requester))
}

/// Records query message payload.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    /// The Query descriptor.
    pub descriptor: QueryDescriptor,

    /// Message authorization. Absent for anonymous queries over published
    /// records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
}

impl Message for Query {
    type Reply = QueryReply;

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

/// Query reply.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryReply {
    /// The matching records, newest first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<QueryReplyEntry>>,

    /// Pagination cursor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// Query reply entry.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryReplyEntry {
    /// The record's current `RecordsWrite` message.
    pub write: Write,

    /// The initial write of the record, when the returned write is not
    /// itself the initial write.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_write: Option<Write>,
}

/// Query descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The filter for the query.
    pub filter: RecordsFilter,
}

/// Options to use when creating a query message.
#[derive(Clone, Debug, Default)]
pub struct QueryBuilder {
    message_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    filter: RecordsFilter,
    authorize: Option<bool>,
}

impl QueryBuilder {
    /// Returns a new [`QueryBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_timestamp: Some(chrono::Utc::now()),
            ..Self::default()
        }
    }

    /// Specify the query filter.
    #[must_use]
    pub fn filter(mut self, filter: RecordsFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Specify whether to sign the query. Unsigned queries are anonymous.
    #[must_use]
    pub const fn authorize(mut self, authorize: bool) -> Self {
        self.authorize = Some(authorize);
        self
    }

    /// Build the Query message.
    ///
    /// # Errors
    ///
    /// Returns an error when signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Query> {
        let descriptor = QueryDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Query,
                message_timestamp: self.message_timestamp.unwrap_or_else(chrono::Utc::now),
            },
            filter: self.filter,
        };

        let authorization = if self.authorize.unwrap_or(true) {
            Some(
                AuthorizationBuilder::new()
                    .descriptor_cid(cid::compute(&descriptor)?)
                    .build(signer)
                    .await?,
            )
        } else {
            None
        };

        Ok(Query {
            descriptor,
            authorization,
        })
    }
}
