//! # Decentralized Web Node (DWN)
//!
//! A message-processing engine for Decentralized Web Nodes: ingests signed,
//! content-addressed messages from identified principals (DIDs), authenticates
//! and authorizes them against protocol-defined rules, reconciles them against
//! prior tenant state deterministically, and persists the resulting
//! transitions to injected stores.
//!
//! The engine's entry point is [`endpoint::handle`]. Storage, DID resolution,
//! and signing are supplied by the host through the [`provider::Provider`]
//! traits.

pub mod auth;
pub mod cid;
pub mod endpoint;
mod error;
pub mod permissions;
pub mod protocols;
pub mod provider;
pub mod records;
mod schema;
pub mod store;
mod utils;

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

pub use crate::error::Error;

/// Result type for `DWN` handlers.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The component of a message descriptor common to all messages.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// The associated web node interface.
    pub interface: Interface,

    /// The interface method.
    pub method: Method,

    /// The timestamp of the message, used to order competing messages for the
    /// same state. Ties are broken by comparing message CIDs.
    #[serde(with = "crate::utils::timestamp")]
    pub message_timestamp: DateTime<Utc>,
}

impl Default for Descriptor {
    fn default() -> Self {
        Self {
            interface: Interface::default(),
            method: Method::default(),
            message_timestamp: DateTime::<Utc>::MIN_UTC,
        }
    }
}

/// Web node interfaces.
#[derive(Clone, Debug, Default, Display, Deserialize, Serialize, PartialEq, Eq)]
pub enum Interface {
    /// Records interface.
    #[default]
    Records,

    /// Protocols interface.
    Protocols,

    /// Permissions interface.
    Permissions,
}

/// Interface methods.
#[derive(Clone, Debug, Default, Display, Deserialize, Serialize, PartialEq, Eq)]
pub enum Method {
    /// Write method.
    #[default]
    Write,

    /// Read method.
    Read,

    /// Query method.
    Query,

    /// Delete method.
    Delete,

    /// Configure method.
    Configure,

    /// Grant method.
    Grant,

    /// Revoke method.
    Revoke,
}

/// `OneOrMany` allows serde to serialize/deserialize a single object or a set
/// of objects.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    /// A single object.
    One(T),

    /// A set of objects.
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    /// Convert the quota to a vector.
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            Self::One(value) => vec![value.clone()],
            Self::Many(values) => values.clone(),
        }
    }
}

impl<T: Default> Default for OneOrMany<T> {
    fn default() -> Self {
        Self::One(T::default())
    }
}
