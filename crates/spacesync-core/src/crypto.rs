//! Identity derivations for spacesync
//!
//! All identifiers are BLAKE3 digests with domain separation prefixes.
//! This module provides the normative implementations.

use crate::canonical::canonical_bytes;
use crate::error::{Error, Result};
use crate::types::*;
use blake3::Hasher;

// =============================================================================
// DOMAIN SEPARATION PREFIXES
// =============================================================================

/// Domain prefix for SpaceId derivation
pub const DOMAIN_SPACE: &[u8] = b"space";
/// Domain prefix for ObjectId derivation
pub const DOMAIN_OBJECT: &[u8] = b"object";
/// Domain prefix for ChangeId derivation
pub const DOMAIN_CHANGE: &[u8] = b"change";
/// Domain prefix for per-element digests inside range hashes
pub const DOMAIN_ELEMENT: &[u8] = b"element";
/// Domain prefix for space-push credential signatures
pub const DOMAIN_CREDENTIAL: &[u8] = b"space-credential";

// =============================================================================
// CHANGE IDENTITY
// =============================================================================

/// Derive a ChangeId from an encoded change payload.
///
/// `ChangeId = BLAKE3("change" || payload)`
pub fn derive_change_id(payload: &[u8]) -> ChangeId {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_CHANGE);
    hasher.update(payload);
    ChangeId(*hasher.finalize().as_bytes())
}

/// Verify that a RawChange's id matches its payload.
pub fn verify_change_id(change: &RawChange) -> Result<()> {
    let computed = derive_change_id(&change.payload);
    if computed != change.id {
        return Err(Error::HashMismatch {
            computed: hex::encode(computed.0),
            transmitted: hex::encode(change.id.0),
        });
    }
    Ok(())
}

/// Encode a structured change and derive its content id.
///
/// The payload is `canonical_bytes(body)`; the signature is carried over
/// unchanged. Encoding failure leaves nothing behind for the caller to
/// store, so a failed call never mutates storage.
pub fn raw_change_from_signed(change: &SignedChange) -> Result<RawChange> {
    let payload = canonical_bytes(&change.body)?;
    let id = derive_change_id(&payload);
    Ok(RawChange {
        id,
        payload,
        signature: change.signature.clone(),
    })
}

// =============================================================================
// OBJECT IDENTITY
// =============================================================================

/// Derive an ObjectId from its immutable header.
///
/// `ObjectId = BLAKE3("object" || canonical_bytes(header))`
pub fn derive_object_id(header: &ObjectHeader) -> Result<ObjectId> {
    let bytes = canonical_bytes(header)?;
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_OBJECT);
    hasher.update(&bytes);
    Ok(ObjectId(*hasher.finalize().as_bytes()))
}

// =============================================================================
// SPACE IDENTITY
// =============================================================================

/// Derive a SpaceId from the encoded space header.
///
/// `SpaceId = BLAKE3("space" || header payload)`
pub fn derive_space_id(raw: &RawSpaceHeader) -> SpaceId {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_SPACE);
    hasher.update(&raw.payload);
    SpaceId(*hasher.finalize().as_bytes())
}

/// Verify that a pushed space header carries its own derived id.
pub fn verify_space_id(header: &SpaceHeaderWithId) -> Result<()> {
    let computed = derive_space_id(&header.raw);
    if computed != header.id {
        return Err(Error::HashMismatch {
            computed: hex::encode(computed.0),
            transmitted: hex::encode(header.id.0),
        });
    }
    Ok(())
}

/// Compute the bytes a credential provider signs for a bootstrap push.
///
/// `sign_bytes = "space-credential" || space_id || header payload`
pub fn credential_sign_bytes(header: &SpaceHeaderWithId) -> Vec<u8> {
    let mut bytes =
        Vec::with_capacity(DOMAIN_CREDENTIAL.len() + 32 + header.raw.payload.len());
    bytes.extend_from_slice(DOMAIN_CREDENTIAL);
    bytes.extend_from_slice(&header.id.0);
    bytes.extend_from_slice(&header.raw.payload);
    bytes
}

// =============================================================================
// ELEMENT DIGESTS
// =============================================================================

/// Per-element digest folded into range hashes.
///
/// `BLAKE3("element" || id || head)` — both sides of a diff must agree on
/// this derivation for range comparison to be meaningful.
pub fn element_hash(element: &Element) -> Bytes32 {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_ELEMENT);
    hasher.update(&element.id.0);
    hasher.update(element.head.as_bytes());
    *hasher.finalize().as_bytes()
}
