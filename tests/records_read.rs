//! Records Read

use dwn_core::endpoint;
use dwn_core::records::{Data, ReadBuilder, WriteBuilder};
use dwn_core::Error;
use dwn_test::key_store::{self, ALICE_DID, BOB_DID, CAROL_DID};
use dwn_test::provider::ProviderImpl;
use http::StatusCode;

// Should return the record to its author and recipient, but not to others.
#[tokio::test]
async fn unpublished_record_visibility() {
    let provider = ProviderImpl::new();
    let alice_keyring = key_store::keyring(ALICE_DID);
    let bob_keyring = key_store::keyring(BOB_DID);
    let carol_keyring = key_store::keyring(CAROL_DID);

    // --------------------------------------------------
    // Alice writes a record addressed to Bob.
    // --------------------------------------------------
    let write = WriteBuilder::new()
        .data(Data::from(b"for bob's eyes".to_vec()))
        .recipient(BOB_DID)
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(ALICE_DID, write.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // The tenant, author, and recipient can read.
    // --------------------------------------------------
    for keyring in [&alice_keyring, &bob_keyring] {
        let read = ReadBuilder::new()
            .record_id(&write.record_id)
            .build(keyring)
            .await
            .expect("should create read");
        let reply = endpoint::handle(ALICE_DID, read, &provider).await.expect("should read");
        assert_eq!(reply.status.code, StatusCode::OK);

        let body = reply.body.expect("should have body");
        assert_eq!(body.entry.data, Some(b"for bob's eyes".to_vec()));
    }

    // --------------------------------------------------
    // Carol cannot.
    // --------------------------------------------------
    let read = ReadBuilder::new()
        .record_id(&write.record_id)
        .build(&carol_keyring)
        .await
        .expect("should create read");
    let Err(Error::Unauthorized(_)) = endpoint::handle(ALICE_DID, read, &provider).await else {
        panic!("should be Unauthorized");
    };
}

// Published records are readable anonymously.
#[tokio::test]
async fn published_record_anonymous_read() {
    let provider = ProviderImpl::new();
    let alice_keyring = key_store::keyring(ALICE_DID);

    let write = WriteBuilder::new()
        .data(Data::from(b"public record".to_vec()))
        .published(true)
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(ALICE_DID, write.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // unsigned read
    let read = ReadBuilder::new()
        .record_id(&write.record_id)
        .authorize(false)
        .build(&alice_keyring)
        .await
        .expect("should create read");
    assert!(read.authorization.is_none());

    let reply = endpoint::handle(ALICE_DID, read, &provider).await.expect("should read");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    assert_eq!(body.entry.data, Some(b"public record".to_vec()));
}

// An anonymous read of an unpublished record is rejected.
#[tokio::test]
async fn anonymous_read_unpublished() {
    let provider = ProviderImpl::new();
    let alice_keyring = key_store::keyring(ALICE_DID);

    let write = WriteBuilder::new()
        .data(Data::from(b"private record".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(ALICE_DID, write.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let read = ReadBuilder::new()
        .record_id(&write.record_id)
        .authorize(false)
        .build(&alice_keyring)
        .await
        .expect("should create read");

    let Err(Error::Unauthorized(_)) = endpoint::handle(ALICE_DID, read, &provider).await else {
        panic!("should be Unauthorized");
    };
}

// Reading a record that does not exist returns 404.
#[tokio::test]
async fn record_not_found() {
    let provider = ProviderImpl::new();
    let alice_keyring = key_store::keyring(ALICE_DID);

    let read = ReadBuilder::new()
        .record_id("bafyreib2fkn5b6rflyzb6vuviojauu6q2wwvyzkvpfsgcsjrjrnie3l5zu")
        .build(&alice_keyring)
        .await
        .expect("should create read");

    let Err(Error::NotFound(_)) = endpoint::handle(ALICE_DID, read, &provider).await else {
        panic!("should be NotFound");
    };
}
