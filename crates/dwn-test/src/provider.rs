//! # Provider
//!
//! An in-memory implementation of the `Provider` traits for testing: message
//! store, data store, and event log backed by maps, with DID resolution and
//! keyrings served from the deterministic keystore.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dwn_core::provider::{
    Cursor, DataStore, DidResolver, Document, Entry, EventLog, KeyStore, Keyring, MessageStore,
    Provider, Query,
};
use tokio::sync::RwLock;

use crate::key_store;

type MessageMap = HashMap<String, HashMap<String, Entry>>;
type DataMap = HashMap<(String, String, String), Vec<u8>>;
type EventMap = HashMap<String, Vec<String>>;

/// In-memory provider implementation.
#[derive(Clone, Default)]
pub struct ProviderImpl {
    messages: Arc<RwLock<MessageMap>>,
    data: Arc<RwLock<DataMap>>,
    events: Arc<RwLock<EventMap>>,
}

impl Provider for ProviderImpl {}

impl ProviderImpl {
    /// Returns a new, empty [`ProviderImpl`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for ProviderImpl {
    async fn put(&self, owner: &str, entry: &Entry) -> Result<()> {
        let message_cid = entry.cid()?;
        let mut messages = self.messages.write().await;
        messages.entry(owner.to_string()).or_default().insert(message_cid, entry.clone());
        Ok(())
    }

    async fn query(&self, owner: &str, query: &Query) -> Result<Vec<Entry>> {
        let messages = self.messages.read().await;
        let Some(tenant) = messages.get(owner) else {
            return Ok(vec![]);
        };
        Ok(tenant.values().filter(|entry| query.is_match(&entry.indexes)).cloned().collect())
    }

    async fn get(&self, owner: &str, message_cid: &str) -> Result<Option<Entry>> {
        let messages = self.messages.read().await;
        Ok(messages.get(owner).and_then(|tenant| tenant.get(message_cid)).cloned())
    }

    async fn delete(&self, owner: &str, message_cid: &str) -> Result<()> {
        let mut messages = self.messages.write().await;
        if let Some(tenant) = messages.get_mut(owner) {
            tenant.remove(message_cid);
        }
        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        self.messages.write().await.clear();
        Ok(())
    }
}

#[async_trait]
impl DataStore for ProviderImpl {
    async fn put(&self, owner: &str, record_id: &str, data_cid: &str, data: &[u8]) -> Result<()> {
        let mut store = self.data.write().await;
        store.insert(
            (owner.to_string(), record_id.to_string(), data_cid.to_string()),
            data.to_vec(),
        );
        Ok(())
    }

    async fn get(
        &self, owner: &str, record_id: &str, data_cid: &str,
    ) -> Result<Option<Vec<u8>>> {
        let store = self.data.read().await;
        Ok(store
            .get(&(owner.to_string(), record_id.to_string(), data_cid.to_string()))
            .cloned())
    }

    async fn delete(&self, owner: &str, record_id: &str, data_cid: &str) -> Result<()> {
        let mut store = self.data.write().await;
        store.remove(&(owner.to_string(), record_id.to_string(), data_cid.to_string()));
        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        self.data.write().await.clear();
        Ok(())
    }
}

#[async_trait]
impl EventLog for ProviderImpl {
    async fn append(&self, owner: &str, message_cid: &str) -> Result<()> {
        let mut events = self.events.write().await;
        events.entry(owner.to_string()).or_default().push(message_cid.to_string());
        Ok(())
    }

    async fn events(
        &self, owner: &str, cursor: Option<Cursor>,
    ) -> Result<(Vec<String>, Option<Cursor>)> {
        let events = self.events.read().await;
        let log = events.get(owner).cloned().unwrap_or_default();

        let start = match cursor {
            Some(cursor) => log
                .iter()
                .position(|cid| cid == &cursor.message_cid)
                .map_or(0, |position| position + 1),
            None => 0,
        };
        let events = log[start..].to_vec();
        let cursor = events.last().map(|cid| Cursor {
            message_cid: cid.clone(),
        });

        Ok((events, cursor))
    }

    async fn delete(&self, owner: &str, message_cids: &[String]) -> Result<()> {
        let mut events = self.events.write().await;
        if let Some(log) = events.get_mut(owner) {
            log.retain(|cid| !message_cids.contains(cid));
        }
        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        self.events.write().await.clear();
        Ok(())
    }
}

#[async_trait]
impl DidResolver for ProviderImpl {
    async fn resolve(&self, did: &str) -> Result<Document> {
        Ok(key_store::did_document(did))
    }
}

impl KeyStore for ProviderImpl {
    fn keyring(&self, controller: &str) -> Result<impl Keyring> {
        Ok(key_store::keyring(controller))
    }
}
