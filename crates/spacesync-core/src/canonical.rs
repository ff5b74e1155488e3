//! Canonical encoding for spacesync
//!
//! All hashed and signed objects use postcard serialization:
//! - No maps/hashmaps in hashed structures
//! - Field order is Rust struct field order
//! - Repeated causal ids keep their author-supplied order

use crate::error::{Error, Result};
use serde::Serialize;

/// Serialize a value to canonical bytes using postcard.
///
/// This is the normative encoding for all hashing and signing operations.
/// Implementations in other languages MUST produce identical bytes.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    #[test]
    fn test_canonical_bytes_deterministic() {
        let header = ObjectHeader {
            space: SpaceId([7; 32]),
            first_change: ChangeId([9; 32]),
            kind: ObjectKind::Document,
        };

        let bytes1 = canonical_bytes(&header).unwrap();
        let bytes2 = canonical_bytes(&header).unwrap();
        assert_eq!(bytes1, bytes2);
    }

    #[test]
    fn test_prev_id_order_is_significant() {
        let a = ChangeId([1; 32]);
        let b = ChangeId([2; 32]);
        let body = |prev: Vec<ChangeId>| ChangeBody {
            object: ObjectId([3; 32]),
            prev_ids: prev,
            author: [4; 32],
            timestamp_ms: 1,
            data: vec![],
        };

        let ab = canonical_bytes(&body(vec![a, b])).unwrap();
        let ba = canonical_bytes(&body(vec![b, a])).unwrap();
        assert_ne!(ab, ba);
    }
}
