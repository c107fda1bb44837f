//! # Protocol Authorization
//!
//! Evaluates a records message against the protocol definition governing the
//! record: the declared protocol path must match the record's actual ancestor
//! chain, the record must satisfy its type constraints, and the requester
//! must be granted the required action by a rule in the rule set at the
//! record's path.

use std::collections::BTreeMap;

use crate::protocols::{Action, Actor, Definition, RuleSet};
use crate::provider::MessageStore;
use crate::records::{self, RecordsFilter, Write};
use crate::store::{ProtocolsQueryBuilder, RecordsQueryBuilder};
use crate::{Result, unauthorized, unexpected};

/// Verify the structure of a protocol record write against its protocol
/// definition: declared path, type constraints, and context binding. These
/// checks apply to every protocol write, whoever authored it.
///
/// # Errors
///
/// Returns a 400 error when the definition is missing, the declared path does
/// not match the record's ancestry, or a type constraint is violated.
pub(crate) async fn verify_integrity(
    owner: &str, write: &Write, store: &impl MessageStore,
) -> Result<()> {
    let Some(protocol_uri) = &write.descriptor.protocol else {
        return Err(unexpected!("missing protocol"));
    };
    let definition = fetch_definition(owner, protocol_uri, store).await?;

    let Some(protocol_path) = &write.descriptor.protocol_path else {
        return Err(unexpected!("missing protocol path"));
    };
    let Some(type_name) = protocol_path.split('/').next_back() else {
        return Err(unexpected!("missing type name"));
    };

    // the terminal path segment must name a declared record definition
    let Some(protocol_type) = definition.types.get(type_name) else {
        return Err(unexpected!("record type {type_name} not allowed in protocol"));
    };
    if protocol_type.schema.is_some() && protocol_type.schema != write.descriptor.schema {
        return Err(unexpected!("invalid schema for type {type_name}"));
    }
    if let Some(data_formats) = &protocol_type.data_formats {
        if !data_formats.contains(&write.descriptor.data_format) {
            return Err(unexpected!("invalid data format for type {type_name}"));
        }
    }

    // a rule set must exist at the declared path
    if rule_set(protocol_path, &definition.structure).is_none() {
        return Err(unexpected!("no rule set defined for protocol path {protocol_path}"));
    }

    // the declared path must extend the parent's actual path
    match &write.descriptor.parent_id {
        None => {
            if protocol_path != type_name {
                return Err(unexpected!("invalid protocol path for parentless record"));
            }
        }
        Some(parent_id) => {
            let chain = record_chain(owner, parent_id, store).await?;
            let Some(parent) = chain.last() else {
                return Err(unexpected!("unable to find parent record {parent_id}"));
            };
            if parent.descriptor.protocol != write.descriptor.protocol {
                return Err(unexpected!("parent record belongs to a different protocol"));
            }
            let Some(parent_path) = &parent.descriptor.protocol_path else {
                return Err(unexpected!("parent record is missing a protocol path"));
            };
            if format!("{parent_path}/{type_name}") != *protocol_path {
                return Err(unexpected!("invalid `protocol_path`"));
            }

            // the context binds the record to its root ancestor
            let Some(root) = chain.first() else {
                return Err(unexpected!("empty record chain"));
            };
            if write.context_id.as_deref() != Some(root.record_id.as_str()) {
                return Err(unexpected!("invalid `context_id`"));
            }
        }
    }

    Ok(())
}

/// Protocol-based authorization for `Write` messages: the author must be
/// granted the `write` action by the rule set at the record's path.
///
/// # Errors
///
/// Returns a 401 error when no rule grants the action and a 400 error when
/// required state (ancestors, definition, rule set) is missing.
pub(crate) async fn permit_write(
    owner: &str, write: &Write, store: &impl MessageStore,
) -> Result<()> {
    let author = write.authorization.author()?;

    let Some(protocol_uri) = &write.descriptor.protocol else {
        return Err(unexpected!("missing protocol"));
    };
    let definition = fetch_definition(owner, protocol_uri, store).await?;

    let Some(protocol_path) = &write.descriptor.protocol_path else {
        return Err(unexpected!("missing protocol path"));
    };
    let Some(rule_set) = rule_set(protocol_path, &definition.structure) else {
        return Err(unexpected!("no rule set defined for protocol path {protocol_path}"));
    };

    // ancestor chain: for updates, from the record itself; for new records,
    // from the parent
    let chain = if initial_entry(owner, &write.record_id, store).await?.is_some() {
        record_chain(owner, &write.record_id, store).await?
    } else if let Some(parent_id) = &write.descriptor.parent_id {
        record_chain(owner, parent_id, store).await?
    } else {
        vec![]
    };

    evaluate_actions(owner, &Action::Write, &author, &rule_set, &chain, write)?;

    // updates must come from the record's original author
    if !write.is_initial(owner)? {
        let Some(initial) = initial_entry(owner, &write.record_id, store).await? else {
            return Err(unexpected!("initial write not found for record"));
        };
        if author != initial.authorization.author()? {
            return Err(unauthorized!("update author does not match the initial write author"));
        }
    }

    Ok(())
}

/// Protocol-based authorization for reads: the requester must be granted the
/// `read` action by the rule set at the target record's path.
///
/// # Errors
///
/// Returns a 401 error when no rule grants the action and a 400 error when
/// required state is missing.
pub(crate) async fn permit_read(
    owner: &str, requester: &str, write: &Write, store: &impl MessageStore,
) -> Result<()> {
    let Some(protocol_uri) = &write.descriptor.protocol else {
        return Err(unexpected!("missing protocol"));
    };
    let definition = fetch_definition(owner, protocol_uri, store).await?;

    let Some(protocol_path) = &write.descriptor.protocol_path else {
        return Err(unexpected!("missing protocol path"));
    };
    let Some(rule_set) = rule_set(protocol_path, &definition.structure) else {
        return Err(unexpected!("no rule set defined for protocol path {protocol_path}"));
    };

    // the chain includes the target record itself
    let chain = record_chain(owner, &write.record_id, store).await?;

    evaluate_actions(owner, &Action::Read, requester, &rule_set, &chain, write)
}

// Evaluates the rule set's allow rules for the requester. Access is the union
// of the actions granted by every matching rule, not the most specific rule.
fn evaluate_actions(
    owner: &str, required: &Action, requester: &str, rule_set: &RuleSet, chain: &[Write],
    subject: &Write,
) -> Result<()> {
    // with no allow rules, only the tenant may act
    let Some(rules) = &rule_set.allow else {
        if requester == owner {
            return Ok(());
        }
        return Err(unauthorized!(
            "no allow rule defined for protocol path; {requester} is unauthorized"
        ));
    };

    let mut allowed = Vec::new();
    for rule in rules {
        let matched = match &rule.who {
            Actor::Anyone => true,
            Actor::Author => {
                if let Some(ancestor) = find_ancestor(chain, rule.of.as_deref()) {
                    ancestor.authorization.author()? == requester
                } else {
                    false
                }
            }
            Actor::Recipient => {
                if rule.of.is_some() {
                    find_ancestor(chain, rule.of.as_deref())
                        .is_some_and(|a| a.descriptor.recipient.as_deref() == Some(requester))
                } else {
                    subject.descriptor.recipient.as_deref() == Some(requester)
                }
            }
        };
        if matched {
            allowed.extend_from_slice(&rule.can);
        }
    }

    if allowed.contains(required) {
        Ok(())
    } else {
        Err(unauthorized!("{required} action not allowed for {requester}"))
    }
}

// Finds the ancestor at the rule's protocol path.
fn find_ancestor<'a>(chain: &'a [Write], of: Option<&str>) -> Option<&'a Write> {
    chain.iter().find(|write| write.descriptor.protocol_path.as_deref() == of)
}

// Looks up the rule set at the protocol path, iterating over path segments.
fn rule_set(protocol_path: &str, structure: &BTreeMap<String, RuleSet>) -> Option<RuleSet> {
    let mut current = structure;
    let mut found = None;
    for segment in protocol_path.split('/') {
        let node = current.get(segment)?;
        current = &node.records;
        found = Some(node);
    }
    found.cloned()
}

// Fetches the newest protocol definition configured for the protocol URI.
async fn fetch_definition(
    owner: &str, protocol_uri: &str, store: &impl MessageStore,
) -> Result<Definition> {
    let query = ProtocolsQueryBuilder::new().protocol(protocol_uri).build();
    let entries = store.query(owner, &query).await?;

    let mut newest = None;
    for entry in entries {
        let key = entry.order_key()?;
        if newest.as_ref().is_none_or(|(newest_key, _)| &key > newest_key) {
            newest = Some((key, entry));
        }
    }
    let Some((_, entry)) = newest else {
        return Err(unexpected!("unable to find protocol definition for {protocol_uri}"));
    };
    let Some(configure) = entry.as_configure() else {
        return Err(unexpected!("unexpected message type"));
    };

    Ok(configure.descriptor.definition.clone())
}

/// Fetch the initial write of the specified record, if the record exists.
///
/// # Errors
///
/// Returns an error when the store query fails.
pub(crate) async fn initial_entry(
    owner: &str, record_id: &str, store: &impl MessageStore,
) -> Result<Option<Write>> {
    let query = RecordsQueryBuilder::new()
        .add_filter(RecordsFilter::new().record_id(record_id))
        .include_archived(true)
        .build();
    let entries = store.query(owner, &query).await?;
    records::write::initial_write(&entries, owner)
}

// Constructs the chain of existing records from the root of the record tree
// to the record specified, walking `parent_id` links through initial writes.
// Returned root-first.
async fn record_chain(
    owner: &str, record_id: &str, store: &impl MessageStore,
) -> Result<Vec<Write>> {
    let mut chain = vec![];
    let mut current_id = Some(record_id.to_owned());

    while let Some(record_id) = &current_id {
        let Some(initial) = initial_entry(owner, record_id, store).await? else {
            return Err(unexpected!(
                "no parent found with ID {record_id} when constructing record chain"
            ));
        };
        current_id.clone_from(&initial.descriptor.parent_id);
        chain.push(initial);
    }

    // root record first
    chain.reverse();
    Ok(chain)
}
