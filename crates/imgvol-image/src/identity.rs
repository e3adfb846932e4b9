//! Layer chain identifiers.
//!
//! A chain ID names a stack of layers rather than a single layer:
//!
//! ```text
//! chain(L0)        = diff(L0)
//! chain(L0 .. Ln)  = sha256(chain(L0 .. Ln-1) + " " + diff(Ln))
//! ```
//!
//! Two images that share a base share the chain IDs of that base, which is
//! what lets the snapshotter reuse unpacked layers between them.

use imgvol_common::Digest;
use sha2::{Digest as _, Sha256};

/// Chain ID of the full, ordered list of diff IDs.
///
/// Returns `None` for an empty list.
#[must_use]
pub fn chain_id(diff_ids: &[Digest]) -> Option<Digest> {
    chain_ids(diff_ids).pop()
}

/// Chain IDs of every prefix of `diff_ids`, bottom layer first.
#[must_use]
pub fn chain_ids(diff_ids: &[Digest]) -> Vec<Digest> {
    let mut chain: Vec<Digest> = Vec::with_capacity(diff_ids.len());
    for diff in diff_ids {
        let next = match chain.last() {
            None => diff.clone(),
            Some(parent) => {
                let hash = Sha256::digest(format!("{parent} {diff}").as_bytes());
                Digest::from_sha256_bytes(&hash)
            }
        };
        chain.push(next);
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn diff(byte: u8) -> Digest {
        Digest::from_sha256_bytes(&[byte; 32])
    }

    #[test]
    fn empty_has_no_chain() {
        assert_eq!(chain_id(&[]), None);
        assert!(chain_ids(&[]).is_empty());
    }

    #[test]
    fn single_layer_is_its_own_chain() {
        assert_eq!(chain_id(&[diff(1)]), Some(diff(1)));
    }

    #[test]
    fn two_layers() {
        let (a, b) = (diff(1), diff(2));
        let expected = Digest::from_sha256_bytes(&Sha256::digest(format!("{a} {b}").as_bytes()));
        assert_eq!(chain_id(&[a.clone(), b.clone()]), Some(expected.clone()));
        assert_eq!(chain_ids(&[a.clone(), b]), vec![a, expected]);
    }

    #[test]
    fn order_matters() {
        assert_ne!(chain_id(&[diff(1), diff(2)]), chain_id(&[diff(2), diff(1)]));
    }

    proptest! {
        #[test]
        fn prefixes_share_chain_ids(bytes in proptest::collection::vec(any::<u8>(), 1..8)) {
            let diffs: Vec<Digest> = bytes.iter().copied().map(diff).collect();
            let all = chain_ids(&diffs);
            prop_assert_eq!(all.len(), diffs.len());
            for n in 1..=diffs.len() {
                let id = chain_id(&diffs[..n]);
                prop_assert_eq!(id.as_ref(), Some(&all[n - 1]));
            }
        }
    }
}
