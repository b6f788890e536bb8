//! # cairn-hash
//!
//! BLAKE3 piece hashing for the cairn repository index.
//!
//! A *piece* is a power-of-two multiple of the BLAKE3 chunk length (1024
//! bytes) used as the verification granularity for published files. Files
//! larger than one piece get a per-piece chaining value in addition to the
//! whole-file root, so peers can verify pieces independently and still
//! arrive at the same root.
//!
//! The subtree arithmetic goes through `blake3::hazmat`, which is the
//! supported way to extract non-root chaining values and compress them
//! upward.

use blake3::hazmat::{merge_subtrees_non_root, merge_subtrees_root, HasherExt, Mode};

/// BLAKE3 leaf chunk length in bytes.
pub const CHUNK_LEN: usize = 1024;

/// BLAKE3 hash type (32 bytes).
pub type Blake3Hash = [u8; 32];

/// 32-byte output of a non-root subtree compression.
pub type ChainingValue = blake3::hazmat::ChainingValue;

/// BLAKE3 of the empty input.
pub const EMPTY_HASH: Blake3Hash = [
    0xaf, 0x13, 0x49, 0xb9, 0xf5, 0xf9, 0xa1, 0xa6, 0xa0, 0x40, 0x4d, 0xee, 0x36, 0xdc, 0xc9,
    0x49, 0x9b, 0xcb, 0x25, 0xc9, 0xad, 0xc1, 0x12, 0xb7, 0xcc, 0x9a, 0x93, 0xca, 0xe4, 0x1f,
    0x32, 0x62,
];

/// Output of hashing one contiguous piece of input.
///
/// The same computation yields either the whole-file root (valid only for
/// the call that covered the entire input, at chunk offset 0) or the
/// subtree chaining value (valid at interior tree positions).
pub struct PieceHash {
    hasher: blake3::Hasher,
    whole_input: bool,
}

impl PieceHash {
    /// The 32-byte root hash. Valid only when the piece covered the whole
    /// input starting at chunk 0.
    pub fn root(&self) -> Blake3Hash {
        debug_assert!(self.whole_input, "root() on an interior piece");
        *self.hasher.finalize().as_bytes()
    }

    /// The 32-byte chaining value of this subtree.
    pub fn chaining_value(&self) -> ChainingValue {
        self.hasher.finalize_non_root()
    }
}

/// Hash one piece of input beginning at the given chunk index.
///
/// `bytes` must either be at most [`CHUNK_LEN`] long or a power-of-two
/// multiple of it; the final piece of a file may be shorter. `chunk_start`
/// must be a multiple of the piece's own chunk count so the subtree lines
/// up with the BLAKE3 tree.
pub fn hash_piece(chunk_start: u64, bytes: &[u8]) -> PieceHash {
    let mut hasher = blake3::Hasher::new();
    if chunk_start != 0 {
        hasher.set_input_offset(chunk_start * CHUNK_LEN as u64);
    }
    hasher.update(bytes);
    PieceHash {
        hasher,
        whole_input: chunk_start == 0,
    }
}

/// A parent node produced by merging piece chaining values.
pub struct ParentNode {
    left: ChainingValue,
    right: ChainingValue,
}

impl ParentNode {
    /// Finish as the root of the whole tree.
    pub fn root(&self) -> Blake3Hash {
        *merge_subtrees_root(&self.left, &self.right, Mode::Hash).as_bytes()
    }

    /// Finish as an interior chaining value.
    pub fn chaining_value(&self) -> ChainingValue {
        merge_subtrees_non_root(&self.left, &self.right, Mode::Hash)
    }
}

/// Compress piece chaining values upward into the single top parent node.
///
/// The reduction merges pairs left to right; an odd node on the right edge
/// is carried up unchanged. For equal power-of-two-sized pieces (with a
/// possibly shorter final piece) this reproduces the BLAKE3 tree shape.
/// Requires at least two chaining values.
pub fn merge_pieces(cvs: &[ChainingValue]) -> ParentNode {
    debug_assert!(cvs.len() >= 2, "merge_pieces needs at least two subtrees");
    let mut level: Vec<ChainingValue> = cvs.to_vec();
    while level.len() > 2 {
        level = level
            .chunks(2)
            .map(|pair| {
                if pair.len() == 2 {
                    merge_subtrees_non_root(&pair[0], &pair[1], Mode::Hash)
                } else {
                    pair[0]
                }
            })
            .collect();
    }
    ParentNode {
        left: level[0],
        right: level[1],
    }
}

/// Hash a complete file image, producing the root hash and, when the data
/// spans more than one piece, the chaining value of every piece.
///
/// `piece_size` must be a power of two and at least [`CHUNK_LEN`].
pub fn hash_file_pieces(data: &[u8], piece_size: usize) -> (Blake3Hash, Vec<ChainingValue>) {
    debug_assert!(piece_size >= CHUNK_LEN && piece_size.is_power_of_two());
    if data.len() <= piece_size {
        return (hash_piece(0, data).root(), Vec::new());
    }
    let chunks_per_piece = (piece_size / CHUNK_LEN) as u64;
    let cvs: Vec<ChainingValue> = data
        .chunks(piece_size)
        .enumerate()
        .map(|(i, piece)| hash_piece(i as u64 * chunks_per_piece, piece).chaining_value())
        .collect();
    let root = merge_pieces(&cvs).root();
    (root, cvs)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reference input from the BLAKE3 test vectors: byte i is i mod 251.
    fn test_input(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    // Input sizes straddling every chunk and parent-node boundary the tree
    // hashing cares about.
    const SIZES: &[usize] = &[
        0, 1, 1023, 1024, 1025, 2048, 2049, 3072, 3073, 4096, 4097, 5120, 5121, 6144, 6145,
        7168, 7169, 8192, 8193, 16384, 31744, 102400,
    ];

    #[test]
    fn empty_hash_constant() {
        assert_eq!(*blake3::hash(b"").as_bytes(), EMPTY_HASH);
        assert_eq!(hash_piece(0, b"").root(), EMPTY_HASH);
        assert_eq!(
            hex::encode(EMPTY_HASH),
            "af1349b9f5f9a1a6a0404dee36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        );
    }

    #[test]
    fn single_pass_root_matches_reference() {
        for &len in SIZES {
            let input = test_input(len);
            assert_eq!(
                hash_piece(0, &input).root(),
                *blake3::hash(&input).as_bytes(),
                "len {len}"
            );
        }
    }

    #[test]
    fn chunkwise_merge_matches_single_pass() {
        for &len in SIZES {
            if len <= CHUNK_LEN {
                continue;
            }
            let input = test_input(len);
            let cvs: Vec<ChainingValue> = input
                .chunks(CHUNK_LEN)
                .enumerate()
                .map(|(i, chunk)| hash_piece(i as u64, chunk).chaining_value())
                .collect();
            assert_eq!(
                merge_pieces(&cvs).root(),
                *blake3::hash(&input).as_bytes(),
                "len {len}"
            );
        }
    }

    #[test]
    fn piece_pipeline_matches_reference_for_all_piece_sizes() {
        for &piece_size in &[1024usize, 2048, 4096, 8192] {
            for &len in SIZES {
                let input = test_input(len);
                let (root, cvs) = hash_file_pieces(&input, piece_size);
                assert_eq!(root, *blake3::hash(&input).as_bytes(), "len {len} piece {piece_size}");
                if len <= piece_size {
                    assert!(cvs.is_empty(), "len {len} piece {piece_size}");
                } else {
                    assert_eq!(cvs.len(), len.div_ceil(piece_size), "len {len} piece {piece_size}");
                }
            }
        }
    }

    #[test]
    fn merged_chaining_value_composes_upward() {
        // Merging the two halves' parent CVs must equal hashing the halves
        // as larger pieces directly.
        let input = test_input(8192);
        let quarter_cvs: Vec<ChainingValue> = input
            .chunks(2048)
            .enumerate()
            .map(|(i, piece)| hash_piece(i as u64 * 2, piece).chaining_value())
            .collect();
        let left = merge_pieces(&quarter_cvs[..2]).chaining_value();
        let right = merge_pieces(&quarter_cvs[2..]).chaining_value();
        assert_eq!(
            merge_pieces(&[left, right]).root(),
            *blake3::hash(&input).as_bytes()
        );
        let half_cvs: Vec<ChainingValue> = input
            .chunks(4096)
            .enumerate()
            .map(|(i, piece)| hash_piece(i as u64 * 4, piece).chaining_value())
            .collect();
        assert_eq!(half_cvs, vec![left, right]);
    }

    #[test]
    fn odd_piece_counts_carry_the_right_edge() {
        // 3, 5 and 7 pieces exercise the carry in every round.
        for pieces in [3usize, 5, 7] {
            let len = pieces * CHUNK_LEN - 100;
            let input = test_input(len);
            let (root, cvs) = hash_file_pieces(&input, CHUNK_LEN);
            assert_eq!(cvs.len(), pieces);
            assert_eq!(root, *blake3::hash(&input).as_bytes(), "{pieces} pieces");
        }
    }
}
