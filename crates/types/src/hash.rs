//! Blake3 digests for blocks, transactions and merkle trees.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const LEN: usize = 32;

/// Root of a block that carries no transactions.
const EMPTY_ROOT_PREIMAGE: &[u8] = b"EMPTY";

/// 32-byte Blake3 digest.
///
/// Ordered bytewise so it can key a `BTreeMap`. Displays as lowercase hex;
/// `Debug` shortens it to the first and last four bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hash([u8; LEN]);

impl Hash {
    /// Previous hash of the genesis block.
    pub const ZERO: Self = Self([0; LEN]);

    /// Digest of one byte string.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        blake3::hash(bytes).into()
    }

    /// Digest of the concatenation of `parts`, without copying them.
    pub fn from_parts(parts: &[&[u8]]) -> Self {
        parts
            .iter()
            .fold(blake3::Hasher::new(), |mut hasher, part| {
                hasher.update(part);
                hasher
            })
            .finalize()
            .into()
    }

    pub fn from_hex(text: &str) -> Result<Self, HexError> {
        text.parse()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Parent node of two merkle siblings.
    fn join(left: &Hash, right: &Hash) -> Hash {
        Hash::from_parts(&[&left.0, &right.0])
    }
}

impl From<blake3::Hash> for Hash {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl FromStr for Hash {
    type Err = HexError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; LEN];
        if text.len() != LEN * 2 {
            return Err(HexError::InvalidLength {
                expected: LEN * 2,
                actual: text.len(),
            });
        }
        hex::decode_to_slice(text, &mut bytes).map_err(|_| HexError::InvalidHex)?;
        Ok(Self(bytes))
    }
}

/// Merkle root over transaction hashes in block order.
///
/// Each level hashes adjacent pairs; a level of odd length pairs its last
/// hash with itself. `[H0, H1, H2]` becomes `[H(H0‖H1), H(H2‖H2)]`, then
/// the root. An empty list yields `hash("EMPTY")`.
pub fn merkle_root(hashes: &[Hash]) -> Hash {
    let Some(first) = hashes.first() else {
        return Hash::from_bytes(EMPTY_ROOT_PREIMAGE);
    };
    if hashes.len() == 1 {
        return *first;
    }

    let mut level = next_level(hashes);
    while level.len() > 1 {
        level = next_level(&level);
    }
    level[0]
}

fn next_level(level: &[Hash]) -> Vec<Hash> {
    level
        .chunks(2)
        .map(|pair| Hash::join(&pair[0], pair.last().unwrap_or(&pair[0])))
        .collect()
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Hash({}..{})",
            hex::encode(&self.0[..4]),
            hex::encode(&self.0[LEN - 4..])
        )
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HexError {
    #[error("hash hex must be {expected} characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("hash hex contains a non-hex character")]
    InvalidHex,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parts_hash_like_concatenation() {
        assert_eq!(
            Hash::from_parts(&[b"led", b"ger"]),
            Hash::from_bytes(b"ledger")
        );
        assert_ne!(Hash::from_bytes(b"ledger"), Hash::from_bytes(b"regdel"));
    }

    #[test]
    fn test_parse_display() {
        let hash = Hash::from_bytes(b"block 7");
        let text = hash.to_string();
        assert_eq!(text.len(), 64);
        assert_eq!(text.parse::<Hash>().unwrap(), hash);
        assert_eq!(Hash::from_hex(&text).unwrap(), hash);
        assert!(format!("{hash:?}").starts_with("Hash("));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(
            "abcd".parse::<Hash>(),
            Err(HexError::InvalidLength {
                expected: 64,
                actual: 4
            })
        );
        assert_eq!(Hash::from_hex(&"zz".repeat(32)), Err(HexError::InvalidHex));
        assert!(Hash::ZERO.is_zero());
    }

    #[test]
    fn test_empty_and_single_roots() {
        let empty = merkle_root(&[]);
        assert_eq!(empty, Hash::from_bytes(b"EMPTY"));
        assert!(!empty.is_zero());

        let only = Hash::from_bytes(b"tx-1");
        assert_eq!(merkle_root(&[only]), only);
    }

    #[test]
    fn test_odd_level_pairs_last_with_itself() {
        let [a, b, c] = [b"a", b"b", b"c"].map(|s| Hash::from_bytes(s));
        let expected = Hash::join(&Hash::join(&a, &b), &Hash::join(&c, &c));
        assert_eq!(merkle_root(&[a, b, c]), expected);
        assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
    }
}
