//! # Store
//!
//! Shared types for the injected stores: the storable message entry, the
//! index terms it is stored under, and the query model handlers use to fetch
//! prior state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::endpoint::Message;
use crate::permissions::{Grant, Revoke};
use crate::protocols::Configure;
use crate::records::{Delete, RecordsFilter, Write};
use crate::{Descriptor, Interface, Method, Result};

/// A message and the index terms it is stored under.
#[derive(Clone, Debug)]
pub struct Entry {
    /// The stored message.
    pub message: EntryType,

    /// Index terms: index name to value.
    pub indexes: HashMap<String, String>,
}

impl Entry {
    /// Create an entry, deriving its index terms from the message.
    ///
    /// # Errors
    ///
    /// Returns an error when the message cannot be serialized.
    pub fn new(message: impl Into<EntryType>) -> Result<Self> {
        let message = message.into();
        let indexes = message.indexes()?;
        Ok(Self { message, indexes })
    }

    /// Compute the CID of the stored message.
    ///
    /// # Errors
    ///
    /// Returns an error when the message cannot be serialized.
    pub fn cid(&self) -> Result<String> {
        self.message.cid()
    }

    /// The base descriptor of the stored message.
    #[must_use]
    pub const fn descriptor(&self) -> &Descriptor {
        self.message.descriptor()
    }

    /// The `(message_timestamp, message_cid)` pair used as the total order
    /// over competing messages.
    ///
    /// # Errors
    ///
    /// Returns an error when the message CID cannot be computed.
    pub fn order_key(&self) -> Result<(DateTime<Utc>, String)> {
        Ok((self.descriptor().message_timestamp, self.cid()?))
    }

    /// The entry as a `RecordsWrite`, if it is one.
    #[must_use]
    pub const fn as_write(&self) -> Option<&Write> {
        match &self.message {
            EntryType::Write(write) => Some(write),
            _ => None,
        }
    }

    /// The entry as a `RecordsDelete`, if it is one.
    #[must_use]
    pub const fn as_delete(&self) -> Option<&Delete> {
        match &self.message {
            EntryType::Delete(delete) => Some(delete),
            _ => None,
        }
    }

    /// The entry as a `ProtocolsConfigure`, if it is one.
    #[must_use]
    pub const fn as_configure(&self) -> Option<&Configure> {
        match &self.message {
            EntryType::Configure(configure) => Some(configure),
            _ => None,
        }
    }

    /// The entry as a `PermissionsGrant`, if it is one.
    #[must_use]
    pub const fn as_grant(&self) -> Option<&Grant> {
        match &self.message {
            EntryType::Grant(grant) => Some(grant),
            _ => None,
        }
    }

    /// The entry as a `PermissionsRevoke`, if it is one.
    #[must_use]
    pub const fn as_revoke(&self) -> Option<&Revoke> {
        match &self.message {
            EntryType::Revoke(revoke) => Some(revoke),
            _ => None,
        }
    }
}

/// The set of storable messages: the closed enumeration behind
/// `(interface, method)` dispatch.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
#[allow(missing_docs)]
pub enum EntryType {
    Write(Write),
    Delete(Delete),
    Configure(Configure),
    Grant(Grant),
    Revoke(Revoke),
}

impl EntryType {
    /// Compute the CID of the message.
    ///
    /// # Errors
    ///
    /// Returns an error when the message cannot be serialized.
    pub fn cid(&self) -> Result<String> {
        match self {
            // a write's CID is stable whether or not data is attached
            Self::Write(write) => Message::cid(write),
            Self::Delete(delete) => crate::cid::compute(delete),
            Self::Configure(configure) => crate::cid::compute(configure),
            Self::Grant(grant) => crate::cid::compute(grant),
            Self::Revoke(revoke) => crate::cid::compute(revoke),
        }
    }

    /// The message's base descriptor.
    #[must_use]
    pub const fn descriptor(&self) -> &Descriptor {
        match self {
            Self::Write(write) => &write.descriptor.base,
            Self::Delete(delete) => &delete.descriptor.base,
            Self::Configure(configure) => &configure.descriptor.base,
            Self::Grant(grant) => &grant.descriptor.base,
            Self::Revoke(revoke) => &revoke.descriptor.base,
        }
    }

    fn indexes(&self) -> Result<HashMap<String, String>> {
        match self {
            Self::Write(write) => write.indexes(),
            Self::Delete(delete) => delete.indexes(),
            Self::Configure(configure) => configure.indexes(),
            Self::Grant(grant) => grant.indexes(),
            Self::Revoke(revoke) => revoke.indexes(),
        }
    }
}

impl From<Write> for EntryType {
    fn from(write: Write) -> Self {
        Self::Write(write)
    }
}

impl From<Delete> for EntryType {
    fn from(delete: Delete) -> Self {
        Self::Delete(delete)
    }
}

impl From<Configure> for EntryType {
    fn from(configure: Configure) -> Self {
        Self::Configure(configure)
    }
}

impl From<Grant> for EntryType {
    fn from(grant: Grant) -> Self {
        Self::Grant(grant)
    }
}

impl From<Revoke> for EntryType {
    fn from(revoke: Revoke) -> Self {
        Self::Revoke(revoke)
    }
}

/// Filter value for a single index term.
#[derive(Clone, Debug)]
pub enum FilterVal {
    /// Match entries whose index equals the value.
    Equal(String),

    /// Match entries whose index equals one of the values.
    OneOf(Vec<String>),
}

/// A store query: index conditions, all of which must match.
#[derive(Clone, Debug, Default)]
pub struct Query {
    /// The index conditions, ANDed together.
    pub conditions: Vec<(String, FilterVal)>,
}

impl Query {
    /// Returns a new, empty [`Query`] matching every entry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality condition.
    #[must_use]
    pub fn add(mut self, index: impl Into<String>, value: impl Into<String>) -> Self {
        self.conditions.push((index.into(), FilterVal::Equal(value.into())));
        self
    }

    /// Add a set-membership condition.
    #[must_use]
    pub fn add_one_of(mut self, index: impl Into<String>, values: Vec<String>) -> Self {
        self.conditions.push((index.into(), FilterVal::OneOf(values)));
        self
    }

    /// Check the provided index terms satisfy every condition. Store
    /// implementations with no native index support may match entries with
    /// this.
    #[must_use]
    pub fn is_match(&self, indexes: &HashMap<String, String>) -> bool {
        for (index, filter) in &self.conditions {
            let Some(value) = indexes.get(index) else {
                return false;
            };
            match filter {
                FilterVal::Equal(expected) => {
                    if value != expected {
                        return false;
                    }
                }
                FilterVal::OneOf(expected) => {
                    if !expected.contains(value) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

/// Builds a [`Query`] for `RecordsWrite` (and optionally other records)
/// messages.
#[derive(Clone, Debug)]
pub struct RecordsQueryBuilder {
    filter: RecordsFilter,
    method: Option<Method>,
    include_archived: bool,
}

impl Default for RecordsQueryBuilder {
    fn default() -> Self {
        Self {
            filter: RecordsFilter::default(),
            method: Some(Method::Write),
            include_archived: false,
        }
    }
}

impl RecordsQueryBuilder {
    /// Returns a new [`RecordsQueryBuilder`] matching current (unarchived)
    /// `RecordsWrite` messages.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a records filter to the query.
    #[must_use]
    pub fn add_filter(mut self, filter: RecordsFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Restrict the query to the specified method. `None` matches all
    /// records methods.
    #[must_use]
    pub const fn method(mut self, method: Option<Method>) -> Self {
        self.method = method;
        self
    }

    /// Include superseded initial writes in results.
    #[must_use]
    pub const fn include_archived(mut self, include_archived: bool) -> Self {
        self.include_archived = include_archived;
        self
    }

    /// Build the store query.
    #[must_use]
    pub fn build(self) -> Query {
        let mut query = Query::new().add("interface", Interface::Records.to_string());
        if let Some(method) = self.method {
            query = query.add("method", method.to_string());
        }
        if !self.include_archived {
            query = query.add("archived", "false");
        }

        let filter = self.filter;
        if let Some(record_id) = filter.record_id {
            query = query.add("recordId", record_id);
        }
        if let Some(parent_id) = filter.parent_id {
            query = query.add("parentId", parent_id);
        }
        if let Some(context_id) = filter.context_id {
            query = query.add("contextId", context_id);
        }
        if let Some(protocol) = filter.protocol {
            query = query.add("protocol", protocol);
        }
        if let Some(protocol_path) = filter.protocol_path {
            query = query.add("protocolPath", protocol_path);
        }
        if let Some(schema) = filter.schema {
            query = query.add("schema", schema);
        }
        if let Some(data_format) = filter.data_format {
            query = query.add("dataFormat", data_format);
        }
        if let Some(recipient) = filter.recipient {
            query = query.add_one_of("recipient", recipient.to_vec());
        }
        if let Some(author) = filter.author {
            query = query.add_one_of("author", author.to_vec());
        }
        if let Some(published) = filter.published {
            query = query.add("published", published.to_string());
        }

        query
    }
}

/// Builds a [`Query`] for `ProtocolsConfigure` messages.
#[derive(Clone, Debug, Default)]
pub struct ProtocolsQueryBuilder {
    protocol: Option<String>,
}

impl ProtocolsQueryBuilder {
    /// Returns a new [`ProtocolsQueryBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the query to the specified protocol URI.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Build the store query.
    #[must_use]
    pub fn build(self) -> Query {
        let mut query = Query::new()
            .add("interface", Interface::Protocols.to_string())
            .add("method", Method::Configure.to_string());
        if let Some(protocol) = self.protocol {
            query = query.add("protocol", protocol);
        }
        query
    }
}

/// Pagination cursor: the CID of the last message returned.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    /// The message CID to resume from.
    pub message_cid: String,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn query_matching() {
        let indexes = HashMap::from([
            ("interface".to_string(), "Records".to_string()),
            ("method".to_string(), "Write".to_string()),
            ("recordId".to_string(), "bafy1".to_string()),
        ]);

        let query = Query::new().add("interface", "Records").add("recordId", "bafy1");
        assert!(query.is_match(&indexes));

        let query = Query::new().add("recordId", "bafy2");
        assert!(!query.is_match(&indexes));

        // a condition on a missing index never matches
        let query = Query::new().add("protocol", "https://example.com/p");
        assert!(!query.is_match(&indexes));

        let query = Query::new()
            .add_one_of("method", vec!["Write".to_string(), "Delete".to_string()]);
        assert!(query.is_match(&indexes));
    }
}
