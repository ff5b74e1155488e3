//! Core protocol types for spacesync
//!
//! All types here are designed for deterministic serialization via postcard.
//! Field order matters for canonical encoding.

use serde::{Deserialize, Serialize};

/// 32-byte fixed-size array used for hashes and identifiers.
pub type Bytes32 = [u8; 32];

// =============================================================================
// IDENTITY TYPES (newtypes for type safety)
// =============================================================================

/// Space identifier: BLAKE3("space" || space header payload)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SpaceId(pub Bytes32);

/// Object identifier: BLAKE3("object" || canonical_bytes(ObjectHeader))
///
/// Ordered so the reconciliation engine can keep elements sorted and
/// express contiguous id ranges.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub Bytes32);

/// Change identifier: BLAKE3("change" || change payload)
///
/// Content-derived: two changes sharing an id are byte-identical.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChangeId(pub Bytes32);

impl ObjectId {
    /// Smallest possible id (range lower bound).
    pub const MIN: ObjectId = ObjectId([0x00; 32]);
    /// Largest possible id (range upper bound).
    pub const MAX: ObjectId = ObjectId([0xff; 32]);
}

macro_rules! impl_hex_display {
    ($($t:ty),*) => {$(
        impl std::fmt::Display for $t {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", hex::encode(&self.0[..8]))
            }
        }
    )*};
}

impl_hex_display!(SpaceId, ObjectId, ChangeId);

// =============================================================================
// OBJECTS AND CHANGES
// =============================================================================

/// Role of an object within its space.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectKind {
    Document = 0,
    Acl = 1,
    Settings = 2,
}

/// Immutable object metadata, fixed at creation.
/// The object id is the hash of this header and is never recomputed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ObjectHeader {
    pub space: SpaceId,
    pub first_change: ChangeId,
    pub kind: ObjectKind,
}

/// Signed, content-addressed change as stored and transmitted.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RawChange {
    pub id: ChangeId,
    pub payload: Vec<u8>,
    /// Ed25519 signature over the payload, by the author key inside it
    pub signature: Vec<u8>,
}

/// Structured change content (hashed to produce ChangeId).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChangeBody {
    pub object: ObjectId,
    /// Causal parents; order is the author's merge order, not canonical
    pub prev_ids: Vec<ChangeId>,
    /// Author's ed25519 public key
    pub author: Bytes32,
    pub timestamp_ms: u64,
    pub data: Vec<u8>,
}

/// Structured change plus its author signature, before encoding.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SignedChange {
    pub body: ChangeBody,
    /// Signature over canonical_bytes(body)
    pub signature: Vec<u8>,
}

// =============================================================================
// RECONCILIATION ELEMENTS
// =============================================================================

/// One tracked object's reconciliation fingerprint.
///
/// `head` is the object's current frontier collapsed to an opaque string:
/// the hex encodings of the head change ids concatenated in the order the
/// caller supplied them. The order is NOT canonicalized; replicas that
/// reach the same head set through different merge orders may briefly see
/// each other as changed until retrieval converges the orders.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Element {
    pub id: ObjectId,
    pub head: String,
}

/// Collapse a frontier to the element head string, preserving caller order.
pub fn concat_heads(heads: &[ChangeId]) -> String {
    let mut out = String::with_capacity(heads.len() * 64);
    for h in heads {
        out.push_str(&hex::encode(h.0));
    }
    out
}

// =============================================================================
// DIFF PROTOCOL
// =============================================================================

/// Reconciliation scheme version, negotiated before diffing.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum DiffType {
    /// Legacy full-set exchange (not served by this implementation)
    FullSet = 0,
    /// Recursive range-hash comparison
    RangeHash = 1,
}

/// One contiguous id range to evaluate, inclusive on both bounds.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffRange {
    pub from: ObjectId,
    pub to: ObjectId,
    /// Maximum number of elements the responder may inline
    pub limit: u32,
}

/// Evaluation of one range: always the hash and count; the elements
/// themselves only when count <= the requested limit.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RangeResult {
    pub hash: Bytes32,
    pub count: u32,
    pub elements: Vec<Element>,
}

// =============================================================================
// SPACE IDENTITY AND BOOTSTRAP
// =============================================================================

/// Space header content (hashed to produce SpaceId).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SpaceHeader {
    /// Space owner's ed25519 public key
    pub owner: Bytes32,
    pub timestamp_ms: u64,
    /// Random seed making the id unique per created space
    pub seed: Bytes32,
}

/// Encoded header plus the owner's signature over it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RawSpaceHeader {
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Raw header paired with its derived id, as stored and pushed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SpaceHeaderWithId {
    pub id: SpaceId,
    pub raw: RawSpaceHeader,
}

/// Space-identifying material sent to a peer that has never seen the space.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SpacePushPayload {
    pub header: SpaceHeaderWithId,
    pub acl_root_id: ObjectId,
    pub settings_root_id: ObjectId,
}

/// Bootstrap push request, sent to exactly one peer per bootstrap event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SpacePushRequest {
    pub payload: SpacePushPayload,
    /// Receiver-verifiable credential for the header
    pub credential: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_heads_preserves_order() {
        let h1 = ChangeId([1; 32]);
        let h2 = ChangeId([2; 32]);

        let forward = concat_heads(&[h1, h2]);
        let backward = concat_heads(&[h2, h1]);

        assert_eq!(forward.len(), 128);
        assert_ne!(forward, backward);
        assert!(forward.starts_with(&hex::encode([1u8; 32])));
    }

    #[test]
    fn test_concat_heads_empty() {
        assert_eq!(concat_heads(&[]), "");
    }

    #[test]
    fn test_object_id_ordering() {
        let low = ObjectId([0; 32]);
        let high = ObjectId([255; 32]);
        assert!(low < high);
        assert_eq!(ObjectId::MIN, low);
        assert_eq!(ObjectId::MAX, high);
    }
}
