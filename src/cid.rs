//! # CID (Content Identifier)
//!
//! Messages are identified by the CID of their canonical encoding: the
//! message is converted to a JSON value (whose maps order keys
//! lexicographically), encoded as deterministic DAG-CBOR, and hashed with
//! SHA-256. CIDs are v1, `dag-cbor` multicodec, base32 lower-case text form.

use multihash_codetable::{Code, MultihashDigest};
use serde::Serialize;

use crate::{Error, Result};

const DAG_CBOR: u64 = 0x71;
const RAW: u64 = 0x55;

/// Compute the CID of the provided payload.
///
/// # Errors
///
/// Returns an error when the payload cannot be serialized.
pub fn compute<T: Serialize>(payload: &T) -> Result<String> {
    // canonical form: sorted map keys, definite lengths
    let value = serde_json::to_value(payload)?;
    let buf = serde_ipld_dagcbor::to_vec(&value)
        .map_err(|e| Error::Unexpected(format!("issue encoding CBOR: {e}")))?;

    let hash = Code::Sha2_256.digest(&buf);
    let cid = cid::Cid::new_v1(DAG_CBOR, hash);

    Ok(cid.to_string())
}

/// Compute the CID of an opaque data payload.
///
/// # Errors
///
/// This function is infallible but returns `Result` for symmetry with
/// [`compute`] at call sites.
pub fn compute_bytes(payload: &[u8]) -> Result<String> {
    let hash = Code::Sha2_256.digest(payload);
    let cid = cid::Cid::new_v1(RAW, hash);
    Ok(cid.to_string())
}

#[cfg(test)]
mod tests {
    use serde::Serialize;

    use super::*;

    #[derive(Serialize)]
    struct TestPayload {
        name: String,
        count: u64,
    }

    #[test]
    fn deterministic() {
        let payload = TestPayload {
            name: "test".to_string(),
            count: 7,
        };
        assert_eq!(compute(&payload).unwrap(), compute(&payload).unwrap());
    }

    #[test]
    fn distinct_payloads_distinct_cids() {
        let one = TestPayload {
            name: "one".to_string(),
            count: 1,
        };
        let two = TestPayload {
            name: "two".to_string(),
            count: 2,
        };
        assert_ne!(compute(&one).unwrap(), compute(&two).unwrap());
    }

    #[test]
    fn text_form() {
        let payload = TestPayload {
            name: "test".to_string(),
            count: 7,
        };
        let cid = compute(&payload).unwrap();

        // CIDv1, base32 lower
        assert!(cid.starts_with('b'));
        assert_eq!(cid, cid.to_lowercase());
    }

    #[test]
    fn field_order_is_canonical() {
        // structs with the same fields declared in different order hash
        // identically once canonicalized
        #[derive(Serialize)]
        struct Forward {
            a: u32,
            b: u32,
        }
        #[derive(Serialize)]
        struct Reverse {
            b: u32,
            a: u32,
        }

        let forward = compute(&Forward { a: 1, b: 2 }).unwrap();
        let reverse = compute(&Reverse { b: 2, a: 1 }).unwrap();
        assert_eq!(forward, reverse);
    }
}
