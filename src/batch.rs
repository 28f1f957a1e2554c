//! Micro-batch descriptor consumed by slot allocation
//!
//! A micro-batch is one kernel launch worth of work: `n_seqs` sequence
//! groups of `n_seq_tokens` tokens each, flattened so that token `k` of the
//! batch is token `k % n_seq_tokens` of group `k / n_seq_tokens`. Each group
//! carries the (possibly several) sequence ids its tokens belong to.

use anyhow::{bail, Result};

use crate::cell::{Pos, SeqId};

/// A unit of work for the slot allocators.
#[derive(Debug, Clone)]
pub struct MicroBatch {
    /// Tokens per sequence group
    pub n_seq_tokens: usize,
    /// All groups carry the same number of new tokens. Required by the
    /// recurrent discipline.
    pub equal_seqs: bool,
    /// Position of every token, `n_tokens` entries in group order
    pub pos: Vec<Pos>,
    /// Ragged per-group sequence-id lists, `n_seqs` entries
    pub seq_ids: Vec<Vec<SeqId>>,
}

impl MicroBatch {
    /// Build a batch from flattened positions and per-group id lists.
    pub fn new(
        pos: Vec<Pos>,
        seq_ids: Vec<Vec<SeqId>>,
        n_seq_tokens: usize,
        equal_seqs: bool,
    ) -> Result<Self> {
        if pos.is_empty() {
            bail!("micro-batch has no tokens");
        }
        if n_seq_tokens == 0 {
            bail!("micro-batch has zero tokens per sequence group");
        }
        if pos.len() != seq_ids.len() * n_seq_tokens {
            bail!(
                "micro-batch shape mismatch: {} positions for {} groups of {} tokens",
                pos.len(),
                seq_ids.len(),
                n_seq_tokens
            );
        }
        if seq_ids.iter().any(Vec::is_empty) {
            bail!("every sequence group needs at least one sequence id");
        }
        Ok(Self {
            n_seq_tokens,
            equal_seqs,
            pos,
            seq_ids,
        })
    }

    /// Convenience constructor: one group holding all tokens of a single
    /// sequence.
    pub fn single_seq(seq_id: SeqId, pos: Vec<Pos>) -> Result<Self> {
        let n_seq_tokens = pos.len();
        Self::new(pos, vec![vec![seq_id]], n_seq_tokens, true)
    }

    /// Total token count.
    pub fn n_tokens(&self) -> usize {
        self.pos.len()
    }

    /// Number of sequence groups.
    pub fn n_seqs(&self) -> usize {
        self.seq_ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_seq() {
        let batch = MicroBatch::single_seq(0, vec![0, 1, 2]).unwrap();
        assert_eq!(batch.n_tokens(), 3);
        assert_eq!(batch.n_seqs(), 1);
        assert_eq!(batch.n_seq_tokens, 3);
        assert!(batch.equal_seqs);
        assert_eq!(batch.seq_ids[0], vec![0]);
    }

    #[test]
    fn test_shape_validation() {
        // 3 positions cannot make 2 groups of 2 tokens
        assert!(MicroBatch::new(vec![0, 1, 2], vec![vec![0], vec![1]], 2, true).is_err());
        assert!(MicroBatch::new(vec![], vec![], 1, true).is_err());
        assert!(MicroBatch::new(vec![0], vec![vec![0]], 0, true).is_err());
        // empty id list in a group
        assert!(MicroBatch::new(vec![0, 1], vec![vec![0], vec![]], 1, true).is_err());
    }

    #[test]
    fn test_multi_group_shape() {
        let batch = MicroBatch::new(
            vec![5, 6, 5, 6],
            vec![vec![0], vec![1, 2]],
            2,
            true,
        )
        .unwrap();
        assert_eq!(batch.n_tokens(), 4);
        assert_eq!(batch.n_seqs(), 2);
    }
}
