//! Records Write

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{Duration, Utc};
use dwn_core::endpoint::{self, Message};
use dwn_core::permissions::{GrantBuilder, RevokeBuilder, Scope};
use dwn_core::records::{Data, ReadBuilder, WriteBuilder};
use dwn_core::{Error, Interface, Method};
use dwn_test::key_store::{self, ALICE_DID, BOB_DID};
use dwn_test::provider::ProviderImpl;
use http::StatusCode;
use rand::RngCore;

// Should be able to create a record and update it with a later timestamp.
#[tokio::test]
async fn update_record() {
    let provider = ProviderImpl::new();
    let alice_keyring = key_store::keyring(ALICE_DID);

    // --------------------------------------------------
    // Write a record.
    // --------------------------------------------------
    let data = b"a new write record";
    let initial = WriteBuilder::new()
        .data(Data::from(data.to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply =
        endpoint::handle(ALICE_DID, initial.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Verify the record was created.
    // --------------------------------------------------
    let read = ReadBuilder::new()
        .record_id(&initial.record_id)
        .build(&alice_keyring)
        .await
        .expect("should create read");
    let reply = endpoint::handle(ALICE_DID, read, &provider).await.expect("should read");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    assert_eq!(body.entry.data, Some(data.to_vec()));

    // --------------------------------------------------
    // Update the existing record.
    // --------------------------------------------------
    let data = b"updated write record";
    let update = WriteBuilder::from(initial.clone())
        .data(Data::from(data.to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(ALICE_DID, update.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Verify the update overwrote the original.
    // --------------------------------------------------
    let read = ReadBuilder::new()
        .record_id(&update.record_id)
        .build(&alice_keyring)
        .await
        .expect("should create read");
    let reply = endpoint::handle(ALICE_DID, read, &provider).await.expect("should read");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    assert_eq!(body.entry.data, Some(data.to_vec()));

    let write = body.entry.records_write.expect("should have write");
    assert_eq!(write.cid().unwrap(), update.cid().unwrap());

    // the initial write accompanies the update
    let initial_write = body.entry.initial_write.expect("should have initial write");
    assert_eq!(initial_write.cid().unwrap(), initial.cid().unwrap());
}

// An older write for the same record is silently discarded: accepted with
// 202 but leaving stored state unchanged.
#[tokio::test]
async fn older_write_discarded() {
    let provider = ProviderImpl::new();
    let alice_keyring = key_store::keyring(ALICE_DID);

    let initial = WriteBuilder::new()
        .data(Data::from(b"original".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply =
        endpoint::handle(ALICE_DID, initial.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let update = WriteBuilder::from(initial.clone())
        .data(Data::from(b"updated".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(ALICE_DID, update.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // resubmit the initial write: the caller cannot distinguish the discard
    // from a store
    let reply = endpoint::handle(ALICE_DID, initial, &provider).await.expect("should reply");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // stored state is unchanged
    let read = ReadBuilder::new()
        .record_id(&update.record_id)
        .build(&alice_keyring)
        .await
        .expect("should create read");
    let reply = endpoint::handle(ALICE_DID, read, &provider).await.expect("should read");
    let body = reply.body.expect("should have body");
    assert_eq!(body.entry.data, Some(b"updated".to_vec()));
}

// With identical timestamps, the update with the larger message CID wins.
#[tokio::test]
async fn same_timestamp_tiebreak() {
    let provider = ProviderImpl::new();
    let alice_keyring = key_store::keyring(ALICE_DID);
    let alice_alt_keyring = key_store::alt_keyring(ALICE_DID);

    let initial = WriteBuilder::new()
        .data(Data::from(b"original".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply =
        endpoint::handle(ALICE_DID, initial.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // two updates with the same timestamp and data, signed with different
    // keys so their CIDs differ
    let timestamp = initial.descriptor.base.message_timestamp + Duration::seconds(1);
    let update_a = WriteBuilder::from(initial.clone())
        .data(Data::from(b"update a".to_vec()))
        .message_timestamp(timestamp)
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let update_b = WriteBuilder::from(initial.clone())
        .data(Data::from(b"update a".to_vec()))
        .message_timestamp(timestamp)
        .build(&alice_alt_keyring)
        .await
        .expect("should create write");

    let (smaller, larger) = if update_a.cid().unwrap() < update_b.cid().unwrap() {
        (update_a, update_b)
    } else {
        (update_b, update_a)
    };

    let reply =
        endpoint::handle(ALICE_DID, smaller.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // the larger CID supersedes the smaller
    let reply = endpoint::handle(ALICE_DID, larger.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // resubmitting the smaller leaves the larger in place
    let reply = endpoint::handle(ALICE_DID, smaller, &provider).await.expect("should reply");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let read = ReadBuilder::new()
        .record_id(&initial.record_id)
        .build(&alice_keyring)
        .await
        .expect("should create read");
    let reply = endpoint::handle(ALICE_DID, read, &provider).await.expect("should read");
    let body = reply.body.expect("should have body");
    let write = body.entry.records_write.expect("should have write");
    assert_eq!(write.cid().unwrap(), larger.cid().unwrap());
}

// A different initial write for an existing record is rejected.
#[tokio::test]
async fn initial_write_collision() {
    let provider = ProviderImpl::new();
    let alice_keyring = key_store::keyring(ALICE_DID);
    let alice_alt_keyring = key_store::alt_keyring(ALICE_DID);

    // identical descriptors signed with different keys: same record identity,
    // different message CIDs
    let timestamp = Utc::now();
    let write_a = WriteBuilder::new()
        .data(Data::from(b"contested".to_vec()))
        .message_timestamp(timestamp)
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let write_b = WriteBuilder::new()
        .data(Data::from(b"contested".to_vec()))
        .message_timestamp(timestamp)
        .build(&alice_alt_keyring)
        .await
        .expect("should create write");

    assert_eq!(write_a.record_id, write_b.record_id);
    assert_ne!(write_a.cid().unwrap(), write_b.cid().unwrap());

    let (smaller, larger) = if write_a.cid().unwrap() < write_b.cid().unwrap() {
        (write_a, write_b)
    } else {
        (write_b, write_a)
    };

    let reply = endpoint::handle(ALICE_DID, smaller, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let Err(Error::Conflict(_)) = endpoint::handle(ALICE_DID, larger, &provider).await else {
        panic!("should be Conflict");
    };
}

// Only the initial write's author may update the record.
#[tokio::test]
async fn update_author_mismatch() {
    let provider = ProviderImpl::new();
    let alice_keyring = key_store::keyring(ALICE_DID);
    let bob_keyring = key_store::keyring(BOB_DID);

    let initial = WriteBuilder::new()
        .data(Data::from(b"alice's record".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply =
        endpoint::handle(ALICE_DID, initial.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // Bob attempts to update Alice's record
    let update = WriteBuilder::from(initial)
        .data(Data::from(b"bob's update".to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");

    let Err(Error::Unauthorized(_)) = endpoint::handle(ALICE_DID, update, &provider).await else {
        panic!("should be Unauthorized");
    };
}

// A non-tenant author can write with an active grant, and loses the
// capability once the grant is revoked.
#[tokio::test]
async fn grant_authorized_write() {
    let provider = ProviderImpl::new();
    let alice_keyring = key_store::keyring(ALICE_DID);
    let bob_keyring = key_store::keyring(BOB_DID);

    // --------------------------------------------------
    // Alice grants Bob the ability to write records.
    // --------------------------------------------------
    let grant = GrantBuilder::new()
        .granted_to(BOB_DID)
        .scope(Scope {
            interface: Interface::Records,
            method: Method::Write,
            protocol: None,
        })
        .build(&alice_keyring)
        .await
        .expect("should create grant");
    let reply = endpoint::handle(ALICE_DID, grant.clone(), &provider).await.expect("should grant");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let grant_id = grant.cid().expect("should compute cid");

    // --------------------------------------------------
    // Bob writes to Alice's web node, invoking the grant.
    // --------------------------------------------------
    let write = WriteBuilder::new()
        .data(Data::from(b"bob's record".to_vec()))
        .owner(ALICE_DID)
        .permission_grant_id(&grant_id)
        .build(&bob_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(ALICE_DID, write, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Alice revokes the grant; Bob's next write is rejected.
    // --------------------------------------------------
    let revoke = RevokeBuilder::new()
        .permissions_grant_id(&grant_id)
        .build(&alice_keyring)
        .await
        .expect("should create revoke");
    let reply = endpoint::handle(ALICE_DID, revoke, &provider).await.expect("should revoke");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let write = WriteBuilder::new()
        .data(Data::from(b"bob again".to_vec()))
        .owner(ALICE_DID)
        .permission_grant_id(&grant_id)
        .build(&bob_keyring)
        .await
        .expect("should create write");

    let Err(Error::Unauthorized(detail)) = endpoint::handle(ALICE_DID, write, &provider).await
    else {
        panic!("should be Unauthorized");
    };
    assert!(detail.contains("revoked"));
}

// A write outside the grant's scope is rejected.
#[tokio::test]
async fn grant_scope_mismatch() {
    let provider = ProviderImpl::new();
    let alice_keyring = key_store::keyring(ALICE_DID);
    let bob_keyring = key_store::keyring(BOB_DID);

    // the grant only covers reads
    let grant = GrantBuilder::new()
        .granted_to(BOB_DID)
        .scope(Scope {
            interface: Interface::Records,
            method: Method::Read,
            protocol: None,
        })
        .build(&alice_keyring)
        .await
        .expect("should create grant");
    let reply = endpoint::handle(ALICE_DID, grant.clone(), &provider).await.expect("should grant");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let write = WriteBuilder::new()
        .data(Data::from(b"bob's record".to_vec()))
        .owner(ALICE_DID)
        .permission_grant_id(grant.cid().expect("should compute cid"))
        .build(&bob_keyring)
        .await
        .expect("should create write");

    let Err(Error::Unauthorized(_)) = endpoint::handle(ALICE_DID, write, &provider).await else {
        panic!("should be Unauthorized");
    };
}

// A tampered message fails signature verification.
#[tokio::test]
async fn tampered_write() {
    let provider = ProviderImpl::new();
    let alice_keyring = key_store::keyring(ALICE_DID);

    let mut write = WriteBuilder::new()
        .data(Data::from(b"original".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");

    // modify the descriptor after signing
    write.descriptor.data_size = 1024;
    write.descriptor.data_cid =
        dwn_core::cid::compute_bytes(b"tampered").expect("should compute cid");

    let Err(Error::BadRequest(_)) = endpoint::handle(ALICE_DID, write, &provider).await else {
        panic!("should be BadRequest");
    };
}

// Record data round-trips through base64url encoding.
#[tokio::test]
async fn encoded_data_round_trip() {
    let provider = ProviderImpl::new();
    let alice_keyring = key_store::keyring(ALICE_DID);

    let mut data = [0u8; 128];
    rand::thread_rng().fill_bytes(&mut data);

    let write = WriteBuilder::new()
        .data(Data::from(data.to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    assert_eq!(write.encoded_data, Some(Base64UrlUnpadded::encode_string(&data)));
    assert_eq!(write.descriptor.data_size, data.len());

    let reply = endpoint::handle(ALICE_DID, write.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let read = ReadBuilder::new()
        .record_id(&write.record_id)
        .build(&alice_keyring)
        .await
        .expect("should create read");
    let reply = endpoint::handle(ALICE_DID, read, &provider).await.expect("should read");
    let body = reply.body.expect("should have body");
    assert_eq!(body.entry.data, Some(data.to_vec()));
}
