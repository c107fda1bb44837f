//! # Configure
//!
//! `ProtocolsConfigure` messages install a protocol definition: the tree of
//! record types, their parent/child relationships, and the rules governing
//! who may read and write them. The newest configuration for a protocol URI
//! wins; superseded configurations are deleted and their events purged.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use derive_more::Display;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::provider::{EventLog, MessageStore, Provider, Signer};
use crate::store::{Entry, EntryType, ProtocolsQueryBuilder};
use crate::{
    Descriptor, Interface, Method, Result, cid, conflict, permissions, unauthorized, unexpected,
    utils,
};

/// Maximum nesting depth of a protocol's rule-set tree.
const MAX_DEPTH: usize = 10;

/// Maximum number of rule-set nodes in a protocol definition.
const MAX_NODES: usize = 100;

/// Process a `Configure` message.
///
/// # Errors
///
/// Returns a 400 error when the definition is malformed, 401 when the author
/// is not authorized to configure protocols for the tenant, and 409 when a
/// newer configuration already exists.
pub(crate) async fn handle(
    owner: &str, configure: Configure, provider: &impl Provider,
) -> Result<Reply<ConfigureReply>> {
    configure.authorization.verify(&configure.descriptor, provider).await?;
    configure.authorize(owner, provider).await?;
    verify_structure(&configure.descriptor.definition)?;

    // fetch existing configurations for the protocol
    let protocol = utils::clean_url(&configure.descriptor.definition.protocol)?;
    let query = ProtocolsQueryBuilder::new().protocol(&protocol).build();
    let existing = MessageStore::query(provider, owner, &query).await?;

    // the newest configuration, by (timestamp, CID), wins
    let incoming_cid = configure.cid()?;
    let incoming_key = (configure.descriptor.base.message_timestamp, incoming_cid.clone());

    for entry in &existing {
        if entry.order_key()? >= incoming_key {
            if entry.cid()? == incoming_cid {
                // replay of the stored configuration
                return Ok(accepted());
            }
            return Err(conflict!("a newer protocol configuration exists"));
        }
    }

    let entry = Entry::new(EntryType::Configure(configure))?;
    MessageStore::put(provider, owner, &entry).await?;
    EventLog::append(provider, owner, &incoming_cid).await?;

    // delete superseded configurations and purge their events
    let mut superseded = Vec::new();
    for entry in &existing {
        let message_cid = entry.cid()?;
        MessageStore::delete(provider, owner, &message_cid).await?;
        superseded.push(message_cid);
    }
    if !superseded.is_empty() {
        debug!(protocol = %protocol, count = superseded.len(), "purging superseded configurations");
        EventLog::delete(provider, owner, &superseded).await?;
    }

    Ok(accepted())
}

fn accepted() -> Reply<ConfigureReply> {
    Reply {
        status: Status {
            code: StatusCode::ACCEPTED.as_u16(),
            detail: None,
        },
        body: None,
    }
}

/// Protocols Configure payload.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Configure {
    /// The Configure descriptor.
    pub descriptor: ConfigureDescriptor,

    /// The message authorization.
    pub authorization: Authorization,
}

impl Message for Configure {
    type Reply = ConfigureReply;

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

impl Configure {
    /// Check the message has sufficient privileges: the author must be the
    /// tenant or hold a grant scoped to configuring this protocol.
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        let author = self.authorization.author()?;
        if author == owner {
            return Ok(());
        }

        let Some(grant_id) = self.authorization.payload()?.permission_grant_id else {
            return Err(unauthorized!("{author} is not authorized to configure protocols"));
        };
        let grant = permissions::fetch_grant(owner, &grant_id, provider).await?;
        grant.verify_active(
            owner,
            &author,
            &self.descriptor.base,
            Some(self.descriptor.definition.protocol.as_str()),
            provider,
        )
        .await
    }

    pub(crate) fn indexes(&self) -> Result<std::collections::HashMap<String, String>> {
        Ok(std::collections::HashMap::from([
            ("interface".to_string(), Interface::Protocols.to_string()),
            ("method".to_string(), Method::Configure.to_string()),
            ("protocol".to_string(), self.descriptor.definition.protocol.clone()),
            ("author".to_string(), self.authorization.author()?),
            (
                "messageTimestamp".to_string(),
                self.descriptor
                    .base
                    .message_timestamp
                    .to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            ),
            ("archived".to_string(), "false".to_string()),
        ]))
    }
}

/// Messages Configure reply. The body is empty: acceptance is conveyed by
/// the status.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ConfigureReply {}

/// Configure descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The protocol definition.
    pub definition: Definition,
}

/// Protocol definition.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Definition {
    /// The protocol URI.
    pub protocol: String,

    /// Whether the definition may be returned to unauthorized queriers.
    pub published: bool,

    /// The record definitions usable within the protocol, keyed by name.
    pub types: BTreeMap<String, ProtocolType>,

    /// The rule-set tree: access rules per protocol path.
    pub structure: BTreeMap<String, RuleSet>,
}

/// A record definition: constraints on records claiming its name.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolType {
    /// Records of this type must carry this exact schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Records of this type must use one of these data formats.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_formats: Option<Vec<String>>,
}

/// One node of the rule-set tree.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RuleSet {
    /// The access rules for records at this protocol path. When unset, only
    /// the tenant may act.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$allow")]
    pub allow: Option<Vec<ActionRule>>,

    /// Child rule sets, keyed by record-definition name.
    #[serde(flatten)]
    pub records: BTreeMap<String, RuleSet>,
}

/// Grants an actor a set of actions on records at a protocol path, e.g.:
///
/// ```json
/// { "who": "anyone", "can": ["write"] }
/// ```
///
/// or, granting the author of the `email` ancestor the ability to read:
///
/// ```json
/// { "who": "author", "of": "email", "can": ["read"] }
/// ```
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRule {
    /// The actor granted the actions.
    pub who: Actor,

    /// The protocol path of the ancestor whose author/recipient is the
    /// expected requester. Must be unset when `who` is `anyone`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub of: Option<String>,

    /// The actions granted.
    pub can: Vec<Action>,
}

/// Actor types.
#[derive(Clone, Debug, Default, Display, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Actor {
    /// Anyone can perform the action.
    #[default]
    Anyone,

    /// The author of the referenced ancestor.
    Author,

    /// The recipient of the referenced ancestor.
    Recipient,
}

/// Rule actions.
#[derive(Clone, Debug, Default, Display, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    /// Read records at the path.
    #[default]
    Read,

    /// Write records at the path.
    Write,
}

/// Validates a protocol definition's rule-set tree: every node must name a
/// declared type, rules must be well-formed, and depth and node-count limits
/// are enforced here — at ingestion — rather than at query time.
fn verify_structure(definition: &Definition) -> Result<()> {
    let mut nodes = 0usize;
    let mut stack: Vec<(String, &RuleSet)> = definition
        .structure
        .iter()
        .map(|(name, rule_set)| (name.clone(), rule_set))
        .collect();

    while let Some((path, rule_set)) = stack.pop() {
        nodes += 1;
        if nodes > MAX_NODES {
            return Err(unexpected!("protocol definition exceeds {MAX_NODES} rule-set nodes"));
        }
        if path.split('/').count() > MAX_DEPTH {
            return Err(unexpected!("record nesting depth exceeded {MAX_DEPTH} levels"));
        }

        let Some(type_name) = path.split('/').next_back() else {
            return Err(unexpected!("missing type name"));
        };
        if !definition.types.contains_key(type_name) {
            return Err(unexpected!("rule set {type_name} is not declared as an allowed type"));
        }

        verify_rules(&path, rule_set)?;

        for (name, child) in &rule_set.records {
            stack.push((format!("{path}/{name}"), child));
        }
    }

    Ok(())
}

fn verify_rules(path: &str, rule_set: &RuleSet) -> Result<()> {
    let Some(rules) = &rule_set.allow else {
        return Ok(());
    };

    for (i, rule) in rules.iter().enumerate() {
        if rule.can.is_empty() {
            return Err(unexpected!("action rule at '{path}' grants no actions"));
        }

        match (&rule.who, &rule.of) {
            (Actor::Anyone, Some(_)) => {
                return Err(unexpected!("`of` must not be set when `who` is \"anyone\" at '{path}'"));
            }
            (Actor::Author, None) => {
                return Err(unexpected!("`of` must be set when `who` is \"author\" at '{path}'"));
            }
            (_, Some(of)) => {
                // `of` must reference a proper ancestor of this path
                if !path.starts_with(&format!("{of}/")) {
                    return Err(unexpected!(
                        "rule `of` path '{of}' is not an ancestor of '{path}'"
                    ));
                }
            }
            _ => {}
        }

        // no two rules for the same actor and ancestor
        for other in &rules[i + 1..] {
            if rule.who == other.who && rule.of == other.of {
                return Err(unexpected!(
                    "more than one action rule for actor {} at '{path}'",
                    rule.who
                ));
            }
        }
    }

    Ok(())
}

/// Options to use when creating a protocol configuration.
#[derive(Clone, Debug, Default)]
pub struct ConfigureBuilder {
    message_timestamp: Option<DateTime<Utc>>,
    definition: Option<Definition>,
    permission_grant_id: Option<String>,
}

impl ConfigureBuilder {
    /// Returns a new [`ConfigureBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_timestamp: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Specify the protocol definition.
    #[must_use]
    pub fn definition(mut self, definition: Definition) -> Self {
        self.definition = Some(definition);
        self
    }

    /// Override the message timestamp.
    #[must_use]
    pub const fn message_timestamp(mut self, message_timestamp: DateTime<Utc>) -> Self {
        self.message_timestamp = Some(message_timestamp);
        self
    }

    /// Specify a permission grant ID invoked to authorize the configuration.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Build the Configure message.
    ///
    /// # Errors
    ///
    /// Returns an error when no definition is set, the definition is
    /// malformed, or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Configure> {
        let mut definition = self.definition.ok_or_else(|| unexpected!("definition not set"))?;

        // normalize definition URIs
        definition.protocol = utils::clean_url(&definition.protocol)?;
        for t in definition.types.values_mut() {
            if let Some(schema) = &t.schema {
                t.schema = Some(utils::clean_url(schema)?);
            }
        }
        verify_structure(&definition)?;

        let descriptor = ConfigureDescriptor {
            base: Descriptor {
                interface: Interface::Protocols,
                method: Method::Configure,
                message_timestamp: self.message_timestamp.unwrap_or_else(Utc::now),
            },
            definition,
        };

        let mut builder = AuthorizationBuilder::new().descriptor_cid(cid::compute(&descriptor)?);
        if let Some(id) = self.permission_grant_id {
            builder = builder.permission_grant_id(id);
        }
        let authorization = builder.build(signer).await?;

        Ok(Configure {
            descriptor,
            authorization,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> Definition {
        let types = BTreeMap::from([
            ("email".to_string(), ProtocolType::default()),
            ("reply".to_string(), ProtocolType::default()),
        ]);
        let structure = BTreeMap::from([(
            "email".to_string(),
            RuleSet {
                allow: Some(vec![ActionRule {
                    who: Actor::Anyone,
                    of: None,
                    can: vec![Action::Write],
                }]),
                records: BTreeMap::from([(
                    "reply".to_string(),
                    RuleSet {
                        allow: Some(vec![ActionRule {
                            who: Actor::Recipient,
                            of: Some("email".to_string()),
                            can: vec![Action::Write, Action::Read],
                        }]),
                        records: BTreeMap::new(),
                    },
                )]),
            },
        )]);

        Definition {
            protocol: "https://example.com/email".to_string(),
            published: true,
            types,
            structure,
        }
    }

    #[test]
    fn valid_structure() {
        assert!(verify_structure(&definition()).is_ok());
    }

    #[test]
    fn undeclared_type() {
        let mut definition = definition();
        definition.types.remove("reply");
        assert!(verify_structure(&definition).is_err());
    }

    #[test]
    fn anyone_with_of() {
        let mut definition = definition();
        let rule_set = definition.structure.get_mut("email").unwrap();
        rule_set.allow = Some(vec![ActionRule {
            who: Actor::Anyone,
            of: Some("email".to_string()),
            can: vec![Action::Write],
        }]);
        assert!(verify_structure(&definition).is_err());
    }

    #[test]
    fn author_without_of() {
        let mut definition = definition();
        let rule_set = definition.structure.get_mut("email").unwrap();
        rule_set.allow = Some(vec![ActionRule {
            who: Actor::Author,
            of: None,
            can: vec![Action::Write],
        }]);
        assert!(verify_structure(&definition).is_err());
    }

    #[test]
    fn of_must_be_ancestor() {
        let mut definition = definition();
        let rule_set =
            definition.structure.get_mut("email").unwrap().records.get_mut("reply").unwrap();
        rule_set.allow = Some(vec![ActionRule {
            who: Actor::Author,
            of: Some("reply".to_string()),
            can: vec![Action::Write],
        }]);
        assert!(verify_structure(&definition).is_err());
    }
}
