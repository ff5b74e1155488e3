//! Range-hash set reconciliation
//!
//! The engine tracks one [`Element`] per object and answers range
//! evaluations: the digest and count of every element inside an id range,
//! plus the elements themselves when the range is small enough to inline.
//! Diffing against a remote walks the id space top-down, descending only
//! into ranges whose digests disagree, so matching subsets cost one hash
//! comparison instead of a full exchange.

use async_trait::async_trait;
use parking_lot::RwLock;
use spacesync_core::crypto::element_hash;
use spacesync_core::types::*;
use spacesync_net::handshake::ChannelError;
use std::collections::BTreeMap;
use thiserror::Error;

/// Default number of subranges a mismatched range is divided into
const DIVIDE_FACTOR: u128 = 16;
/// Default element count under which a range is answered inline
const COMPARE_THRESHOLD: u32 = 16;

/// Remote diff failure classification
#[derive(Debug, Error)]
pub enum DiffError {
    /// Remote has no knowledge of the space at all. Distinct from an
    /// empty-but-known space, which diffs normally.
    #[error("remote has no knowledge of the space")]
    SpaceMissing,
    /// Remote marks the space as tombstoned
    #[error("remote marks the space as deleted")]
    SpaceDeleted,
    /// Unclassified remote condition
    #[error("unexpected remote condition: {0}")]
    Unexpected(String),
    /// Transport failure
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// The remote side of a reconciliation round.
#[async_trait]
pub trait RemoteDiff: Send + Sync {
    /// Which reconciliation scheme the remote serves.
    async fn diff_type(&self) -> Result<DiffType, DiffError>;

    /// Evaluate ranges against the remote element set.
    async fn ranges(&self, ranges: &[DiffRange]) -> Result<Vec<RangeResult>, DiffError>;
}

struct DiffState {
    elements: BTreeMap<ObjectId, Element>,
    hash: Bytes32,
}

/// Per-space element set with range hashing.
pub struct Diff {
    divide_factor: u128,
    compare_threshold: u32,
    state: RwLock<DiffState>,
}

impl Default for Diff {
    fn default() -> Self {
        Self::new()
    }
}

impl Diff {
    pub fn new() -> Self {
        Self::with_params(DIVIDE_FACTOR, COMPARE_THRESHOLD)
    }

    pub fn with_params(divide_factor: u128, compare_threshold: u32) -> Self {
        Self {
            divide_factor: divide_factor.max(2),
            compare_threshold,
            state: RwLock::new(DiffState {
                elements: BTreeMap::new(),
                hash: empty_hash(),
            }),
        }
    }

    /// Upsert an element and recompute the aggregate hash.
    pub fn set(&self, element: Element) {
        let mut state = self.state.write();
        state.elements.insert(element.id, element);
        state.hash = aggregate_hash(&state.elements);
    }

    /// Drop an element and recompute the aggregate hash.
    pub fn remove(&self, id: &ObjectId) {
        let mut state = self.state.write();
        if state.elements.remove(id).is_some() {
            state.hash = aggregate_hash(&state.elements);
        }
    }

    /// Aggregate digest over the entire tracked set. Persisted externally
    /// as the space-level fingerprint.
    pub fn hash(&self) -> Bytes32 {
        self.state.read().hash
    }

    pub fn len(&self) -> usize {
        self.state.read().elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().elements.is_empty()
    }

    /// The scheme this engine implements.
    pub fn diff_type(&self) -> DiffType {
        DiffType::RangeHash
    }

    /// Evaluate ranges against the local element set.
    pub fn ranges(&self, ranges: &[DiffRange]) -> Vec<RangeResult> {
        let state = self.state.read();
        ranges
            .iter()
            .map(|range| {
                let mut hasher = blake3::Hasher::new();
                let mut count = 0u32;
                for element in state.elements.range(range.from..=range.to).map(|(_, e)| e) {
                    hasher.update(&element_hash(element));
                    count += 1;
                }
                let elements = if count <= range.limit {
                    state
                        .elements
                        .range(range.from..=range.to)
                        .map(|(_, e)| e.clone())
                        .collect()
                } else {
                    Vec::new()
                };
                RangeResult {
                    hash: *hasher.finalize().as_bytes(),
                    count,
                    elements,
                }
            })
            .collect()
    }

    /// Compare the local set against a remote one.
    ///
    /// Returns `(new, changed, removed)`: ids only the remote has, ids
    /// both have with differing digests, and ids only the local set has.
    /// Every queued range is evaluated in one batched round trip; local
    /// state is read fresh per round, never mutated here.
    pub async fn diff(
        &self,
        remote: &dyn RemoteDiff,
    ) -> Result<(Vec<ObjectId>, Vec<ObjectId>, Vec<ObjectId>), DiffError> {
        let mut new_ids = Vec::new();
        let mut changed_ids = Vec::new();
        let mut removed_ids = Vec::new();

        let mut queue = vec![DiffRange {
            from: ObjectId::MIN,
            to: ObjectId::MAX,
            limit: self.compare_threshold,
        }];

        while !queue.is_empty() {
            let local_results = self.ranges(&queue);
            let remote_results = remote.ranges(&queue).await?;
            if remote_results.len() != queue.len() {
                return Err(DiffError::Unexpected(format!(
                    "remote answered {} ranges for {} requested",
                    remote_results.len(),
                    queue.len()
                )));
            }

            let mut next = Vec::new();
            for ((range, local), remote) in queue
                .iter()
                .zip(local_results.iter())
                .zip(remote_results.iter())
            {
                if local.hash == remote.hash {
                    continue;
                }

                let both_inline = local.count <= range.limit && remote.count <= range.limit;
                if both_inline {
                    compare_elements(
                        &local.elements,
                        &remote.elements,
                        &mut new_ids,
                        &mut changed_ids,
                        &mut removed_ids,
                    );
                } else if let Some(subranges) = split_range(range, self.divide_factor) {
                    next.extend(subranges);
                } else {
                    // Range narrower than the split granularity: force both
                    // sides to inline on the next round
                    let forced = local.count.max(remote.count);
                    if forced <= range.limit {
                        return Err(DiffError::Unexpected(
                            "remote withheld elements under the agreed limit".into(),
                        ));
                    }
                    next.push(DiffRange {
                        from: range.from,
                        to: range.to,
                        limit: forced,
                    });
                }
            }
            queue = next;
        }

        Ok((new_ids, changed_ids, removed_ids))
    }
}

// Local loopback, used by tests and the self-compare fast path.
#[async_trait]
impl RemoteDiff for Diff {
    async fn diff_type(&self) -> Result<DiffType, DiffError> {
        Ok(self.diff_type())
    }

    async fn ranges(&self, ranges: &[DiffRange]) -> Result<Vec<RangeResult>, DiffError> {
        Ok(Diff::ranges(self, ranges))
    }
}

fn empty_hash() -> Bytes32 {
    *blake3::Hasher::new().finalize().as_bytes()
}

fn aggregate_hash(elements: &BTreeMap<ObjectId, Element>) -> Bytes32 {
    let mut hasher = blake3::Hasher::new();
    for element in elements.values() {
        hasher.update(&element_hash(element));
    }
    *hasher.finalize().as_bytes()
}

/// Classify two sorted inline element lists.
fn compare_elements(
    local: &[Element],
    remote: &[Element],
    new_ids: &mut Vec<ObjectId>,
    changed_ids: &mut Vec<ObjectId>,
    removed_ids: &mut Vec<ObjectId>,
) {
    let mut li = local.iter().peekable();
    let mut ri = remote.iter().peekable();

    loop {
        match (li.peek(), ri.peek()) {
            (Some(l), Some(r)) => {
                if l.id == r.id {
                    if l.head != r.head {
                        changed_ids.push(l.id);
                    }
                    li.next();
                    ri.next();
                } else if l.id < r.id {
                    removed_ids.push(l.id);
                    li.next();
                } else {
                    new_ids.push(r.id);
                    ri.next();
                }
            }
            (Some(l), None) => {
                removed_ids.push(l.id);
                li.next();
            }
            (None, Some(r)) => {
                new_ids.push(r.id);
                ri.next();
            }
            (None, None) => break,
        }
    }
}

fn id_prefix(id: &ObjectId) -> u128 {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&id.0[..16]);
    u128::from_be_bytes(bytes)
}

fn id_from_prefix(prefix: u128, fill: u8) -> ObjectId {
    let mut bytes = [fill; 32];
    bytes[..16].copy_from_slice(&prefix.to_be_bytes());
    ObjectId(bytes)
}

/// Divide a range into contiguous subranges on 128-bit prefix boundaries.
/// Returns None when the range spans a single prefix and cannot split.
fn split_range(range: &DiffRange, divide_factor: u128) -> Option<Vec<DiffRange>> {
    let lo = id_prefix(&range.from);
    let hi = id_prefix(&range.to);
    let width = hi.checked_sub(lo)?;
    if width == 0 {
        return None;
    }

    let step = width / divide_factor + 1;
    let mut subranges = Vec::new();
    let mut cursor = lo;
    loop {
        let end = cursor.saturating_add(step - 1).min(hi);
        let from = if cursor == lo {
            range.from
        } else {
            id_from_prefix(cursor, 0x00)
        };
        let to = if end == hi {
            range.to
        } else {
            id_from_prefix(end, 0xff)
        };
        subranges.push(DiffRange {
            from,
            to,
            limit: range.limit,
        });
        if end == hi {
            break;
        }
        cursor = end + 1;
    }
    Some(subranges)
}
