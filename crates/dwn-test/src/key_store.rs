//! # Key Store
//!
//! Deterministic ed25519 keys for well-known test identities. Each DID's
//! signing keys are derived from the DID string, so signatures are
//! reproducible across test runs. Every DID carries two verification methods
//! (`#key-0` and `#key-1`) so tests can produce distinct, equally valid
//! signatures over the same message.

use anyhow::Result;
use async_trait::async_trait;
use base64ct::{Base64UrlUnpadded, Encoding};
use dwn_core::provider::{Document, Keyring, PublicKeyJwk, Signer, VerificationMethod};
use ed25519_dalek::{Signer as _, SigningKey};
use sha2::{Digest, Sha256};

/// Alice's DID.
pub const ALICE_DID: &str = "did:example:alice";

/// Bob's DID.
pub const BOB_DID: &str = "did:example:bob";

/// Carol's DID.
pub const CAROL_DID: &str = "did:example:carol";

const FRAGMENTS: [&str; 2] = ["key-0", "key-1"];

/// Returns the primary keyring for the specified DID.
#[must_use]
pub fn keyring(did: &str) -> KeyringImpl {
    KeyringImpl {
        did: did.to_string(),
        fragment: FRAGMENTS[0].to_string(),
        key: signing_key(did, FRAGMENTS[0]),
    }
}

/// Returns a keyring for the specified DID's secondary verification method.
#[must_use]
pub fn alt_keyring(did: &str) -> KeyringImpl {
    KeyringImpl {
        did: did.to_string(),
        fragment: FRAGMENTS[1].to_string(),
        key: signing_key(did, FRAGMENTS[1]),
    }
}

/// Returns the DID document for the specified DID.
#[must_use]
pub fn did_document(did: &str) -> Document {
    let verification_method = FRAGMENTS
        .iter()
        .map(|fragment| {
            let key = signing_key(did, fragment);
            let x = Base64UrlUnpadded::encode_string(key.verifying_key().as_bytes());
            VerificationMethod {
                id: format!("{did}#{fragment}"),
                controller: did.to_string(),
                method_type: "JsonWebKey2020".to_string(),
                public_key_jwk: PublicKeyJwk {
                    kty: "OKP".to_string(),
                    crv: "Ed25519".to_string(),
                    x,
                },
            }
        })
        .collect();

    Document {
        id: did.to_string(),
        verification_method,
    }
}

fn signing_key(did: &str, fragment: &str) -> SigningKey {
    let seed: [u8; 32] = Sha256::digest(format!("{did}#{fragment}").as_bytes()).into();
    SigningKey::from_bytes(&seed)
}

/// A keyring holding one ed25519 signing key.
pub struct KeyringImpl {
    did: String,
    fragment: String,
    key: SigningKey,
}

impl Keyring for KeyringImpl {}

#[async_trait]
impl Signer for KeyringImpl {
    async fn try_sign(&self, msg: &[u8]) -> Result<Vec<u8>> {
        Ok(self.key.sign(msg).to_bytes().to_vec())
    }

    fn verification_method(&self) -> String {
        format!("{}#{}", self.did, self.fragment)
    }
}
