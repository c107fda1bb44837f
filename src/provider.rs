//! # Provider
//!
//! Traits the host implements to supply storage, DID resolution, and signing.
//! All store queries are namespaced by `owner` — the tenant DID whose data
//! space is addressed.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use crate::store::{Cursor, Entry, Query};

/// Provider trait aggregating the collaborators needed to process messages.
pub trait Provider:
    MessageStore + DataStore + EventLog + DidResolver + KeyStore + Clone
{
}

/// The `MessageStore` trait is used by implementers to provide message
/// storage capability.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Store a message in the underlying store. Idempotent by message CID.
    async fn put(&self, owner: &str, entry: &Entry) -> Result<()>;

    /// Queries the underlying store for matches to the provided index
    /// conditions. Results are returned in unspecified order; callers sort.
    async fn query(&self, owner: &str, query: &Query) -> Result<Vec<Entry>>;

    /// Fetches a single message by CID from the underlying store, returning
    /// `None` if no message was found.
    async fn get(&self, owner: &str, message_cid: &str) -> Result<Option<Entry>>;

    /// Delete the message associated with the specified CID. Idempotent.
    async fn delete(&self, owner: &str, message_cid: &str) -> Result<()>;

    /// Purge all messages from the store.
    async fn purge(&self) -> Result<()>;
}

/// The `DataStore` trait is used by implementers to provide data storage
/// capability. Blobs are keyed by `(owner, record_id, data_cid)`.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Store a data blob in the underlying store.
    async fn put(&self, owner: &str, record_id: &str, data_cid: &str, data: &[u8]) -> Result<()>;

    /// Fetches a single blob from the underlying store, returning `None` if
    /// no match was found.
    async fn get(&self, owner: &str, record_id: &str, data_cid: &str)
    -> Result<Option<Vec<u8>>>;

    /// Delete the blob associated with the specified key.
    async fn delete(&self, owner: &str, record_id: &str, data_cid: &str) -> Result<()>;

    /// Purge all blobs from the store.
    async fn purge(&self) -> Result<()>;
}

/// The `EventLog` trait is used by implementers to provide a per-tenant,
/// append-only sequence of message CIDs with surgical deletion.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Adds a message CID to the owner's event log.
    async fn append(&self, owner: &str, message_cid: &str) -> Result<()>;

    /// Retrieves all of the owner's events that occurred after the cursor
    /// provided. If no cursor is provided, all events for the owner will be
    /// returned.
    ///
    /// The cursor is a message CID.
    async fn events(
        &self, owner: &str, cursor: Option<Cursor>,
    ) -> Result<(Vec<String>, Option<Cursor>)>;

    /// Deletes events for the specified message CIDs.
    async fn delete(&self, owner: &str, message_cids: &[String]) -> Result<()>;

    /// Purge all events from the log.
    async fn purge(&self) -> Result<()>;
}

/// The `DidResolver` trait is used to proxy the resolution of a DID to a DID
/// document containing the verification methods needed to check a message
/// signature's `kid`.
#[async_trait]
pub trait DidResolver: Send + Sync {
    /// Resolve the DID to the corresponding DID document.
    async fn resolve(&self, did: &str) -> Result<Document>;
}

/// The `KeyStore` trait is used to provide the signing keys needed by message
/// builders.
pub trait KeyStore: Send + Sync {
    /// Returns the keyring for the specified controller.
    ///
    /// # Errors
    ///
    /// Returns an error if no keyring exists for the controller.
    fn keyring(&self, controller: &str) -> Result<impl Keyring>;
}

/// The `Keyring` trait provides the signing capability used when constructing
/// messages.
pub trait Keyring: Signer + Send + Sync {}

/// Digital signing function used to sign message payloads.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign the provided message bytestring.
    async fn try_sign(&self, msg: &[u8]) -> Result<Vec<u8>>;

    /// The verification method (JWS `kid`) the signature can be verified
    /// against.
    fn verification_method(&self) -> String;

    /// The signing algorithm.
    fn algorithm(&self) -> String {
        "EdDSA".to_string()
    }
}

/// A DID document: the subset needed to verify message signatures.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// The DID the document describes.
    pub id: String,

    /// Verification methods the subject may authenticate with.
    pub verification_method: Vec<VerificationMethod>,
}

/// A public key registered in a DID document.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    /// The verification method identifier (`did#fragment`).
    pub id: String,

    /// The DID controlling the key.
    pub controller: String,

    /// The verification method type.
    #[serde(rename = "type")]
    pub method_type: String,

    /// The public key, as a JWK.
    pub public_key_jwk: PublicKeyJwk,
}

/// A public key in JWK form.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyJwk {
    /// Key type.
    pub kty: String,

    /// Curve.
    pub crv: String,

    /// Base64url-encoded public key material.
    pub x: String,
}
