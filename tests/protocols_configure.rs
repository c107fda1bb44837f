//! Protocols Configure

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use dwn_core::endpoint::{self, Message};
use dwn_core::protocols::{
    Action, ActionRule, Actor, ConfigureBuilder, Definition, ProtocolType, RuleSet,
};
use dwn_core::provider::EventLog;
use dwn_core::Error;
use dwn_test::key_store::{self, ALICE_DID, BOB_DID};
use dwn_test::provider::ProviderImpl;
use http::StatusCode;

const PROTOCOL: &str = "https://example.com/chat";

fn definition() -> Definition {
    Definition {
        protocol: PROTOCOL.to_string(),
        published: true,
        types: BTreeMap::from([("message".to_string(), ProtocolType::default())]),
        structure: BTreeMap::from([(
            "message".to_string(),
            RuleSet {
                allow: Some(vec![ActionRule {
                    who: Actor::Anyone,
                    of: None,
                    can: vec![Action::Write],
                }]),
                records: BTreeMap::new(),
            },
        )]),
    }
}

// Should install a protocol configuration.
#[tokio::test]
async fn configure_protocol() {
    let provider = ProviderImpl::new();
    let alice_keyring = key_store::keyring(ALICE_DID);

    let configure = ConfigureBuilder::new()
        .definition(definition())
        .build(&alice_keyring)
        .await
        .expect("should create configure");
    let reply = endpoint::handle(ALICE_DID, configure, &provider).await.expect("should configure");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);
}

// A newer configuration replaces an older one; the older one's event is
// purged. An incoming older configuration is rejected.
#[tokio::test]
async fn newest_configuration_wins() {
    let provider = ProviderImpl::new();
    let alice_keyring = key_store::keyring(ALICE_DID);

    let timestamp = Utc::now();
    let older = ConfigureBuilder::new()
        .definition(definition())
        .message_timestamp(timestamp)
        .build(&alice_keyring)
        .await
        .expect("should create configure");
    let newer = ConfigureBuilder::new()
        .definition(definition())
        .message_timestamp(timestamp + Duration::seconds(1))
        .build(&alice_keyring)
        .await
        .expect("should create configure");

    let reply =
        endpoint::handle(ALICE_DID, older.clone(), &provider).await.expect("should configure");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);
    let reply =
        endpoint::handle(ALICE_DID, newer.clone(), &provider).await.expect("should configure");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // the older configuration's event was purged
    let (events, _) = EventLog::events(&provider, ALICE_DID, None).await.expect("should fetch");
    assert_eq!(events, vec![newer.cid().expect("should compute cid")]);

    // resubmitting the older configuration is a conflict
    let Err(Error::Conflict(_)) = endpoint::handle(ALICE_DID, older, &provider).await else {
        panic!("should be Conflict");
    };
}

// Only the tenant (or a grant-holder) may configure protocols.
#[tokio::test]
async fn unauthorized_configure() {
    let provider = ProviderImpl::new();
    let bob_keyring = key_store::keyring(BOB_DID);

    let configure = ConfigureBuilder::new()
        .definition(definition())
        .build(&bob_keyring)
        .await
        .expect("should create configure");

    let Err(Error::Unauthorized(_)) = endpoint::handle(ALICE_DID, configure, &provider).await
    else {
        panic!("should be Unauthorized");
    };
}

// Malformed definitions are rejected at ingestion.
#[tokio::test]
async fn malformed_definition() {
    let alice_keyring = key_store::keyring(ALICE_DID);

    // a rule set whose name is not a declared type
    let mut bad = definition();
    bad.structure.insert("unknown".to_string(), RuleSet::default());
    let result = ConfigureBuilder::new().definition(bad).build(&alice_keyring).await;
    assert!(result.is_err());

    // an `author` rule without `of`
    let mut bad = definition();
    bad.structure.get_mut("message").unwrap().allow = Some(vec![ActionRule {
        who: Actor::Author,
        of: None,
        can: vec![Action::Write],
    }]);
    let result = ConfigureBuilder::new().definition(bad).build(&alice_keyring).await;
    assert!(result.is_err());

    // nesting beyond the depth limit
    let mut bad = definition();
    let mut node = RuleSet::default();
    for _ in 0..12 {
        node = RuleSet {
            allow: None,
            records: BTreeMap::from([("message".to_string(), node)]),
        };
    }
    bad.structure.insert("message".to_string(), node);
    let result = ConfigureBuilder::new().definition(bad).build(&alice_keyring).await;
    assert!(result.is_err());
}
