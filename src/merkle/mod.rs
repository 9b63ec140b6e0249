//! Incremental per-poll Merkle trees.
//!
//! Canonical construction (frozen; external verifiers depend on it):
//! - Leaf pre-image: `pollId|optionId|nullifierHex|bucket_ts` joined with
//!   a single `|` (0x7C), `bucket_ts` in ISO 8601 UTC with millisecond
//!   precision, UTF-8 encoded. The leaf value is the registry's leaf hash
//!   of that pre-image (SHA-256 under `hmac`, Poseidon under `poseidon`).
//! - Internal node: SHA-256 over the raw 64-byte concatenation of the two
//!   child hashes.
//! - A level with an odd node count duplicates its last node.
//! - The empty tree's root is SHA-256("EMPTY_TREE"); a one-leaf tree's
//!   root is the SHA-256 of that single leaf.
//!
//! The full tree is not persisted: the vote log is the source of truth
//! and trees are hydrated from it on demand. The stored `current_root` is
//! a hot-path optimization and a tamper witness.

#[cfg(test)]
mod proptests;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::crypto::registry::CryptoRegistry;
use crate::crypto::{sha256, Hash256};
use crate::model::format_bucket_ts;
use crate::store::{Database, StoreError};

/// Tag hashed to produce the zero-leaf root.
const EMPTY_TREE_TAG: &[u8] = b"EMPTY_TREE";

/// Single-byte delimiter joining leaf pre-image fields.
pub const LEAF_DELIMITER: char = '|';

#[derive(Debug, Error)]
pub enum MerkleError {
    #[error("Merkle store error: {0}")]
    Store(#[from] StoreError),

    #[error("Poll tree not hydrated: {0}")]
    NotHydrated(String),
}

/// Root of the empty tree.
pub fn empty_root() -> Hash256 {
    sha256(EMPTY_TREE_TAG)
}

/// Canonical leaf pre-image string.
pub fn leaf_preimage(
    poll_id: &str,
    option_id: &str,
    nullifier: &str,
    bucket_ts: DateTime<Utc>,
) -> String {
    format!(
        "{poll_id}{LEAF_DELIMITER}{option_id}{LEAF_DELIMITER}{nullifier}{LEAF_DELIMITER}{}",
        format_bucket_ts(bucket_ts)
    )
}

fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left);
    data[32..].copy_from_slice(right);
    sha256(&data)
}

/// One step of an inclusion proof: the sibling hash and which side it
/// sits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofStep {
    pub sibling: Hash256,
    /// True when the sibling is the left child at this level.
    pub sibling_on_left: bool,
}

/// Deterministic root over an ordered leaf slice. Pure; used by audits.
pub fn build(leaves: &[Hash256]) -> Hash256 {
    match leaves.len() {
        0 => empty_root(),
        1 => sha256(&leaves[0]),
        _ => {
            let mut level = leaves.to_vec();
            while level.len() > 1 {
                let mut next = Vec::with_capacity(level.len().div_ceil(2));
                for pair in level.chunks(2) {
                    let right = pair.get(1).unwrap_or(&pair[0]);
                    next.push(hash_pair(&pair[0], right));
                }
                level = next;
            }
            level[0]
        }
    }
}

/// Sibling path from `leaves[index]` to the root. A one-leaf tree has an
/// empty path. Duplicated odd nodes appear as explicit self-siblings.
pub fn proof(leaves: &[Hash256], index: usize) -> Option<Vec<ProofStep>> {
    if index >= leaves.len() {
        return None;
    }
    let mut path = Vec::new();
    let mut level = leaves.to_vec();
    let mut idx = index;
    while level.len() > 1 {
        let sibling_idx = idx ^ 1;
        let sibling = if sibling_idx < level.len() {
            level[sibling_idx]
        } else {
            level[idx]
        };
        path.push(ProofStep {
            sibling,
            sibling_on_left: idx % 2 == 1,
        });

        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]);
            next.push(hash_pair(&pair[0], right));
        }
        level = next;
        idx /= 2;
    }
    Some(path)
}

/// Fold a leaf through a sibling path and compare against the expected
/// root. An empty path is the one-leaf case: the root is SHA-256(leaf).
pub fn verify(leaf: &Hash256, path: &[ProofStep], expected_root: &Hash256) -> bool {
    if path.is_empty() {
        return &sha256(leaf) == expected_root;
    }
    let mut current = *leaf;
    for step in path {
        current = if step.sibling_on_left {
            hash_pair(&step.sibling, &current)
        } else {
            hash_pair(&current, &step.sibling)
        };
    }
    &current == expected_root
}

/// Append-only tree keeping every level in memory; appends touch only the
/// right edge, so each one costs O(log n) hashes.
#[derive(Debug, Clone, Default)]
pub struct IncrementalTree {
    levels: Vec<Vec<Hash256>>,
}

impl IncrementalTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_leaves(leaves: &[Hash256]) -> Self {
        let mut tree = Self::new();
        for leaf in leaves {
            tree.append(*leaf);
        }
        tree
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, |leaves| leaves.len())
    }

    pub fn root(&self) -> Hash256 {
        match self.leaf_count() {
            0 => empty_root(),
            1 => sha256(&self.levels[0][0]),
            _ => self.levels.last().expect("levels nonempty")[0],
        }
    }

    /// Append a leaf and return the new root and the leaf's index.
    pub fn append(&mut self, leaf: Hash256) -> (Hash256, usize) {
        if self.levels.is_empty() {
            self.levels.push(Vec::new());
        }
        self.levels[0].push(leaf);
        let index = self.levels[0].len() - 1;

        let mut level = 0;
        while self.levels[level].len() > 1 {
            let child_len = self.levels[level].len();
            let parent_len = child_len.div_ceil(2);
            if self.levels.len() == level + 1 {
                self.levels.push(Vec::new());
            }

            // Only the rightmost parent changes on an append.
            let last = parent_len - 1;
            let li = 2 * last;
            let ri = li + 1;
            let left = self.levels[level][li];
            let right = if ri < child_len {
                self.levels[level][ri]
            } else {
                left
            };
            let parent = hash_pair(&left, &right);

            if self.levels[level + 1].len() == parent_len {
                self.levels[level + 1][last] = parent;
            } else {
                self.levels[level + 1].push(parent);
            }
            level += 1;
        }

        (self.root(), index)
    }
}

/// Per-poll incremental trees, hydrated on demand from the vote log.
///
/// The vote path serializes per poll, hydrates before opening its
/// transaction, appends inside it, and evicts the cached tree if the
/// transaction aborts so the next access re-reads the committed truth.
pub struct MerkleService {
    db: Database,
    registry: Arc<CryptoRegistry>,
    trees: Mutex<HashMap<String, IncrementalTree>>,
}

impl MerkleService {
    pub fn new(db: Database, registry: Arc<CryptoRegistry>) -> Self {
        Self {
            db,
            registry,
            trees: Mutex::new(HashMap::new()),
        }
    }

    /// Compute the leaf hash for one vote through the active registry.
    pub fn leaf_hash(
        &self,
        poll_id: &str,
        option_id: &str,
        nullifier: &str,
        bucket_ts: DateTime<Utc>,
    ) -> Hash256 {
        let preimage = leaf_preimage(poll_id, option_id, nullifier, bucket_ts);
        self.registry.hasher().leaf_hash(preimage.as_bytes())
    }

    /// Load the poll's tree from the committed vote log unless cached.
    /// Must be called before the vote transaction opens.
    pub async fn ensure_hydrated(&self, poll_id: &str) -> Result<(), MerkleError> {
        {
            let trees = self.trees.lock().await;
            if trees.contains_key(poll_id) {
                return Ok(());
            }
        }
        let rows = self.db.list_vote_leaves(poll_id).await?;
        let leaves: Vec<Hash256> = rows
            .iter()
            .map(|(option_id, nullifier, bucket_ts)| {
                self.leaf_hash(poll_id, option_id, nullifier, *bucket_ts)
            })
            .collect();
        let tree = IncrementalTree::from_leaves(&leaves);
        self.trees.lock().await.insert(poll_id.to_string(), tree);
        Ok(())
    }

    /// Append a leaf to a hydrated tree; returns (root hex, leaf index).
    pub async fn append(&self, poll_id: &str, leaf: Hash256) -> Result<(String, i64), MerkleError> {
        let mut trees = self.trees.lock().await;
        let tree = trees
            .get_mut(poll_id)
            .ok_or_else(|| MerkleError::NotHydrated(poll_id.to_string()))?;
        let (root, index) = tree.append(leaf);
        Ok((hex::encode(root), index as i64))
    }

    /// Current root of a hydrated or freshly hydrated tree.
    pub async fn current_root(&self, poll_id: &str) -> Result<(String, i64), MerkleError> {
        self.ensure_hydrated(poll_id).await?;
        let trees = self.trees.lock().await;
        let tree = trees
            .get(poll_id)
            .ok_or_else(|| MerkleError::NotHydrated(poll_id.to_string()))?;
        Ok((hex::encode(tree.root()), tree.leaf_count() as i64))
    }

    /// Drop the cached tree so the next access re-hydrates. Called when a
    /// vote transaction aborts after a tentative append.
    pub async fn evict(&self, poll_id: &str) {
        self.trees.lock().await.remove(poll_id);
    }

    /// Recompute the root from the committed vote log and compare it with
    /// the stored `poll_roots` row. The §8 tamper check for auditors.
    pub async fn verify_poll_root(&self, poll_id: &str) -> Result<bool, MerkleError> {
        let rows = self.db.list_vote_leaves(poll_id).await?;
        let leaves: Vec<Hash256> = rows
            .iter()
            .map(|(option_id, nullifier, bucket_ts)| {
                self.leaf_hash(poll_id, option_id, nullifier, *bucket_ts)
            })
            .collect();
        let recomputed = hex::encode(build(&leaves));

        match self.db.get_poll_root(poll_id).await? {
            Some((stored_root, stored_count)) => {
                Ok(stored_root == recomputed && stored_count == leaves.len() as i64)
            }
            None => Ok(leaves.is_empty()),
        }
    }
}
