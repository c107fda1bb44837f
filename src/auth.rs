//! # Authorization
//!
//! Every mutating message carries an `authorization` block: a detached-payload
//! JWS whose payload commits to the message descriptor (and, for records, to
//! the record and context identifiers). Verification resolves each signature's
//! `kid` through the injected DID resolver.

use base64ct::{Base64UrlUnpadded, Encoding};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::provider::{DidResolver, Signer};
use crate::{Result, cid, unauthorized, unexpected};

/// Message authorization.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    /// The signature of the message signer.
    pub signature: Jws,
}

/// A JWS with a detached, base64url-encoded payload and one or more
/// signatures.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Jws {
    /// The base64url-encoded JSON payload.
    pub payload: String,

    /// The signatures over the payload.
    pub signatures: Vec<JwsSignature>,
}

/// One signature entry of a JWS.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct JwsSignature {
    /// The base64url-encoded protected header.
    pub protected: String,

    /// The base64url-encoded signature.
    pub signature: String,
}

/// JWS protected header.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Protected {
    /// The signing algorithm.
    pub alg: String,

    /// The verification method used to verify the signature.
    pub kid: String,
}

/// The payload signed by the message author. The `descriptor_cid` binds the
/// signature to the message content; the optional fields bind records
/// messages to their record identity.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignaturePayload {
    /// The CID of the message descriptor.
    pub descriptor_cid: String,

    /// The record ID for records messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,

    /// The context ID for protocol records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// The CID of the `PermissionsGrant` invoked to authorize the message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_grant_id: Option<String>,
}

impl Jws {
    /// Create a JWS over the provided payload.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload cannot be serialized or signing
    /// fails.
    pub async fn create<T: Serialize>(payload: &T, signer: &impl Signer) -> Result<Self> {
        let payload = Base64UrlUnpadded::encode_string(&serde_json::to_vec(payload)?);

        let protected = Protected {
            alg: signer.algorithm(),
            kid: signer.verification_method(),
        };
        let protected = Base64UrlUnpadded::encode_string(&serde_json::to_vec(&protected)?);

        let sign_input = format!("{protected}.{payload}");
        let signature = signer.try_sign(sign_input.as_bytes()).await?;

        Ok(Self {
            payload,
            signatures: vec![JwsSignature {
                protected,
                signature: Base64UrlUnpadded::encode_string(&signature),
            }],
        })
    }
}

impl Authorization {
    /// The DID of the message author: the signer of the first (and, here,
    /// only) signature.
    ///
    /// # Errors
    ///
    /// Returns an error when the authorization has no signature or the `kid`
    /// is not a DID URL.
    pub fn author(&self) -> Result<String> {
        let Some(signature) = self.signature.signatures.first() else {
            return Err(unexpected!("missing JWS signature"));
        };
        let protected = decode_protected(&signature.protected)?;
        let Some((did, _)) = protected.kid.split_once('#') else {
            return Err(unexpected!("invalid signature `kid` {}", protected.kid));
        };
        Ok(did.to_string())
    }

    /// The decoded signature payload.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload is not valid base64url-encoded JSON.
    pub fn payload(&self) -> Result<SignaturePayload> {
        let bytes = Base64UrlUnpadded::decode_vec(&self.signature.payload)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Authenticate the message: verify every signature against the signer's
    /// DID document and check the signed payload commits to the provided
    /// descriptor.
    ///
    /// # Errors
    ///
    /// Returns a 401 error when a signature is invalid, the DID cannot be
    /// resolved, or the `kid` has no matching verification method; a 400
    /// error when the payload does not commit to the descriptor.
    pub async fn verify<T: Serialize>(
        &self, descriptor: &T, resolver: &impl DidResolver,
    ) -> Result<()> {
        if self.signature.signatures.is_empty() {
            return Err(unauthorized!("missing JWS signature"));
        }

        for signature in &self.signature.signatures {
            let protected = decode_protected(&signature.protected)?;
            if protected.alg != "EdDSA" {
                return Err(unauthorized!("unsupported signing algorithm {}", protected.alg));
            }

            let Some((did, _)) = protected.kid.split_once('#') else {
                return Err(unauthorized!("invalid signature `kid` {}", protected.kid));
            };
            let document = resolver
                .resolve(did)
                .await
                .map_err(|e| unauthorized!("unable to resolve DID {did}: {e}"))?;
            let Some(method) =
                document.verification_method.iter().find(|vm| vm.id == protected.kid)
            else {
                return Err(unauthorized!("no verification method for `kid` {}", protected.kid));
            };

            let key = Base64UrlUnpadded::decode_vec(&method.public_key_jwk.x)
                .map_err(|_| unauthorized!("invalid public key encoding"))?;
            let key: [u8; 32] =
                key.try_into().map_err(|_| unauthorized!("invalid public key length"))?;
            let verifying_key = VerifyingKey::from_bytes(&key)
                .map_err(|_| unauthorized!("invalid public key"))?;

            let sig = Base64UrlUnpadded::decode_vec(&signature.signature)
                .map_err(|_| unauthorized!("invalid signature encoding"))?;
            let sig = Signature::from_slice(&sig)
                .map_err(|_| unauthorized!("invalid signature length"))?;

            let sign_input = format!("{}.{}", signature.protected, self.signature.payload);
            verifying_key
                .verify(sign_input.as_bytes(), &sig)
                .map_err(|_| unauthorized!("invalid signature"))?;
        }

        // the signed payload must commit to this descriptor
        if self.payload()?.descriptor_cid != cid::compute(descriptor)? {
            return Err(unexpected!("signed payload does not match message descriptor"));
        }

        Ok(())
    }
}

/// Builds an [`Authorization`] for a message under construction.
#[derive(Clone, Debug, Default)]
pub struct AuthorizationBuilder {
    descriptor_cid: Option<String>,
    record_id: Option<String>,
    context_id: Option<String>,
    permission_grant_id: Option<String>,
}

impl AuthorizationBuilder {
    /// Returns a new [`AuthorizationBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the CID of the descriptor being signed.
    #[must_use]
    pub fn descriptor_cid(mut self, descriptor_cid: impl Into<String>) -> Self {
        self.descriptor_cid = Some(descriptor_cid.into());
        self
    }

    /// Set the record ID the signature commits to.
    #[must_use]
    pub fn record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    /// Set the context ID the signature commits to.
    #[must_use]
    pub fn context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Set the CID of the `PermissionsGrant` invoked to authorize the
    /// message.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Build the [`Authorization`], signing the payload with the provided
    /// signer.
    ///
    /// # Errors
    ///
    /// Returns an error when no descriptor CID has been set or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Authorization> {
        let descriptor_cid =
            self.descriptor_cid.ok_or_else(|| unexpected!("descriptor CID not set"))?;

        let payload = SignaturePayload {
            descriptor_cid,
            record_id: self.record_id,
            context_id: self.context_id,
            permission_grant_id: self.permission_grant_id,
        };

        Ok(Authorization {
            signature: Jws::create(&payload, signer).await?,
        })
    }
}

fn decode_protected(protected: &str) -> Result<Protected> {
    let bytes = Base64UrlUnpadded::decode_vec(protected)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// The DID controlling the signer, derived from its verification method.
pub(crate) fn signer_did(signer: &impl Signer) -> Result<String> {
    let kid = signer.verification_method();
    let Some((did, _)) = kid.split_once('#') else {
        return Err(unexpected!("invalid verification method {kid}"));
    };
    Ok(did.to_string())
}
