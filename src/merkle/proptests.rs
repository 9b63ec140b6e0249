//! Property-based tests for the Merkle construction.
//!
//! Laws:
//! - Inclusion: every leaf's proof verifies against the built root
//! - Agreement: incremental appends and the pure build produce the same
//!   root for every prefix
//! - Soundness: a tampered leaf or foreign root fails verification

use proptest::prelude::*;

use super::{build, proof, verify, IncrementalTree};
use crate::crypto::Hash256;

fn arb_leaves(max: usize) -> impl Strategy<Value = Vec<Hash256>> {
    prop::collection::vec(prop::array::uniform32(any::<u8>()), 1..max)
}

proptest! {
    #[test]
    fn prop_every_proof_verifies(leaves in arb_leaves(40)) {
        let root = build(&leaves);
        for (i, leaf) in leaves.iter().enumerate() {
            let path = proof(&leaves, i).expect("index in range");
            prop_assert!(verify(leaf, &path, &root), "proof failed at index {}", i);
        }
    }

    #[test]
    fn prop_incremental_agrees_with_build(leaves in arb_leaves(40)) {
        let mut tree = IncrementalTree::new();
        for (i, leaf) in leaves.iter().enumerate() {
            let (root, index) = tree.append(*leaf);
            prop_assert_eq!(index, i);
            prop_assert_eq!(root, build(&leaves[..=i]));
        }
        prop_assert_eq!(tree.leaf_count(), leaves.len());
    }

    #[test]
    fn prop_tampered_leaf_fails(
        leaves in arb_leaves(40),
        index in any::<prop::sample::Index>(),
        tamper in prop::array::uniform32(any::<u8>()),
    ) {
        let i = index.index(leaves.len());
        prop_assume!(tamper != leaves[i]);

        let root = build(&leaves);
        let path = proof(&leaves, i).expect("index in range");
        prop_assert!(!verify(&tamper, &path, &root));
    }

    #[test]
    fn prop_roots_change_with_appends(leaves in arb_leaves(40)) {
        // Appending a distinct leaf must move the root.
        let mut tree = IncrementalTree::new();
        let mut previous = tree.root();
        for leaf in &leaves {
            let (root, _) = tree.append(*leaf);
            prop_assert_ne!(root, previous);
            previous = root;
        }
    }
}
