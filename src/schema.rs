//! # Schema
//!
//! Structural validation common to all messages, keyed by the message's
//! `(interface, method)` pair. Message-specific (cross-state) validation is
//! done in the message handler.

use serde_json::Value;

use crate::endpoint::Message;
use crate::{Interface, Method, Result, unexpected};

/// Validates the structure of the given message against the required fields
/// for its `(interface, method)` pair.
///
/// # Errors
///
/// Returns a 400 error when a required field is missing or the pair is not
/// recognized.
pub fn validate(message: &impl Message) -> Result<()> {
    let descriptor = message.descriptor();
    let value = serde_json::to_value(message)?;

    let required: &[&str] = match (&descriptor.interface, &descriptor.method) {
        (Interface::Records, Method::Write) => &[
            "/recordId",
            "/descriptor/dataCid",
            "/descriptor/dataSize",
            "/descriptor/dataFormat",
            "/descriptor/dateCreated",
            "/authorization",
        ],
        (Interface::Records, Method::Read) => &["/descriptor/recordId"],
        (Interface::Records, Method::Query) => &["/descriptor/filter"],
        (Interface::Records, Method::Delete) => &["/descriptor/recordId", "/authorization"],
        (Interface::Protocols, Method::Configure) => {
            &["/descriptor/definition/protocol", "/authorization"]
        }
        (Interface::Permissions, Method::Grant) => &[
            "/descriptor/grantedBy",
            "/descriptor/grantedTo",
            "/descriptor/grantedFor",
            "/descriptor/scope",
            "/descriptor/dateExpires",
            "/authorization",
        ],
        (Interface::Permissions, Method::Revoke) => {
            &["/descriptor/permissionsGrantId", "/authorization"]
        }
        (interface, method) => {
            return Err(unexpected!("unsupported message {interface}{method}"));
        }
    };

    for pointer in required {
        if value.pointer(pointer).is_none_or(Value::is_null) {
            return Err(unexpected!(
                "validation failed for {}{}: missing {pointer}",
                descriptor.interface,
                descriptor.method
            ));
        }
    }

    // protocol fields travel together
    let protocol = value.pointer("/descriptor/protocol");
    let protocol_path = value.pointer("/descriptor/protocolPath");
    if protocol.is_some() != protocol_path.is_some() {
        return Err(unexpected!("`protocol` and `protocolPath` must be set together"));
    }

    Ok(())
}
