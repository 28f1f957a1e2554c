//! Read-only cache snapshot for UIs and metrics
//!
//! The view flattens per-cell state into plain buffers a frontend can render
//! without touching cache internals: the effective position of every cell
//! (base position plus any pending shift) and up to `n_seq_max` sequence ids
//! per cell, padded with `-1`. Aggregates cover occupancy and the longest
//! run of empty cells, which is what a scheduler looks at before requesting
//! a defrag.
//!
//! Updating never mutates the cache. If the recomputed occupancy disagrees
//! with the cache's own counter the mismatch is logged and the snapshot is
//! still produced.

use tracing::error;

use crate::cache::KvCache;
use crate::cell::{Pos, SeqId};

/// Snapshot of a single cell.
#[derive(Debug, Clone, Copy, Default)]
pub struct ViewCell {
    /// Effective position: base position plus pending shift
    pub pos: Pos,
}

/// Read-only projection of the cache state.
#[derive(Debug)]
pub struct CacheView {
    /// Cells covered by the snapshot buffers
    pub n_cells: usize,
    /// Sequence ids recorded per cell
    pub n_seq_max: usize,
    /// Total (cell, sequence) memberships
    pub token_count: usize,
    /// Occupied cells counted during the update
    pub used_cells: usize,
    /// Length of the longest run of empty cells
    pub max_contiguous: usize,
    /// Start of that run, if any
    pub max_contiguous_idx: Option<usize>,
    /// One entry per cell
    pub cells: Vec<ViewCell>,
    /// `n_seq_max` ids per cell, `-1` padded
    pub cells_sequences: Vec<SeqId>,
}

impl CacheView {
    /// An empty view; buffers are sized lazily on the first update.
    pub fn new(n_seq_max: usize) -> Self {
        Self {
            n_cells: 0,
            n_seq_max,
            token_count: 0,
            used_cells: 0,
            max_contiguous: 0,
            max_contiguous_idx: None,
            cells: Vec::new(),
            cells_sequences: Vec::new(),
        }
    }

    /// Refresh the snapshot from `cache`, growing buffers when the pool is
    /// larger than the last update saw.
    pub fn update(&mut self, cache: &KvCache) {
        if self.n_cells < cache.size() || self.cells.is_empty() {
            self.n_cells = cache.size();
            self.cells.resize(self.n_cells, ViewCell::default());
            self.cells_sequences.resize(self.n_cells * self.n_seq_max, -1);
        }

        let kv_cells = cache.cells();
        let mut used_cells = 0;
        let mut token_count = 0;
        let mut curr_contig_idx: Option<usize> = None;
        let mut max_contig = 0;
        let mut max_contig_idx = None;

        for (i, cell) in kv_cells.iter().enumerate() {
            let seq_ids = cell.seq_ids();
            token_count += seq_ids.len();
            self.cells[i].pos = cell.pos() + cell.delta();

            if seq_ids.is_empty() {
                if curr_contig_idx.is_none() {
                    curr_contig_idx = Some(i);
                }
            } else {
                if let Some(start) = curr_contig_idx {
                    if i - start > max_contig {
                        max_contig = i - start;
                        max_contig_idx = Some(start);
                    }
                }
                curr_contig_idx = None;
                used_cells += 1;
            }

            let row = &mut self.cells_sequences[i * self.n_seq_max..(i + 1) * self.n_seq_max];
            let shown = seq_ids.len().min(self.n_seq_max);
            row[..shown].copy_from_slice(&seq_ids[..shown]);
            for slot in &mut row[shown..] {
                *slot = -1;
            }
        }

        if let Some(start) = curr_contig_idx {
            if kv_cells.len() - start > max_contig {
                max_contig = kv_cells.len() - start;
                max_contig_idx = Some(start);
            }
        }

        self.max_contiguous = max_contig;
        self.max_contiguous_idx = max_contig_idx;
        self.token_count = token_count;
        self.used_cells = used_cells;
        if used_cells != cache.used_cells() {
            error!(
                "used cells mismatch: cache says {} but the view counted {used_cells}",
                cache.used_cells()
            );
        }
    }

    /// Sequence ids recorded for cell `i`, `-1` padded.
    pub fn cell_sequences(&self, i: usize) -> &[SeqId] {
        &self.cells_sequences[i * self.n_seq_max..(i + 1) * self.n_seq_max]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::MicroBatch;
    use crate::config::{ComputeParams, ModelHparams};
    use candle_core::{DType, Device};

    fn cache_with(kv_size: usize) -> KvCache {
        let hp = ModelHparams::uniform(1, 2, 2);
        KvCache::new(
            &hp,
            &ComputeParams::default(),
            DType::F32,
            DType::F32,
            kv_size,
            false,
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn test_view_empty_cache() {
        let cache = cache_with(6);
        let mut view = CacheView::new(2);
        view.update(&cache);

        assert_eq!(view.n_cells, 6);
        assert_eq!(view.token_count, 0);
        assert_eq!(view.used_cells, 0);
        assert_eq!(view.max_contiguous, 6);
        assert_eq!(view.max_contiguous_idx, Some(0));
        assert!(view.cell_sequences(0).iter().all(|&s| s == -1));
    }

    #[test]
    fn test_view_counts_and_padding() {
        let mut cache = cache_with(6);
        let batch = MicroBatch::single_seq(0, vec![0, 1, 2]).unwrap();
        assert!(cache.find_slot(&batch).ok);
        cache.seq_cp(0, 1, 0, 2);

        let mut view = CacheView::new(2);
        view.update(&cache);

        // cells 0 and 1 are shared, cell 2 holds one id
        assert_eq!(view.token_count, 5);
        assert_eq!(view.used_cells, 3);
        assert_eq!(view.cell_sequences(0), &[0, 1]);
        assert_eq!(view.cell_sequences(2), &[0, -1]);
        assert_eq!(view.cells[1].pos, 1);
        // the free tail is the longest empty run
        assert_eq!(view.max_contiguous, 3);
        assert_eq!(view.max_contiguous_idx, Some(3));
    }

    #[test]
    fn test_view_effective_pos_includes_delta() {
        let mut cache = cache_with(4);
        let batch = MicroBatch::single_seq(0, vec![0, 1]).unwrap();
        assert!(cache.find_slot(&batch).ok);
        cache.seq_add(0, 0, -1, 10);

        let mut view = CacheView::new(1);
        view.update(&cache);
        // pos 0 shifted to 10 with delta 10 pending: effective 20
        assert_eq!(view.cells[0].pos, 20);
        assert_eq!(view.cells[1].pos, 21);
    }

    #[test]
    fn test_view_interior_gap() {
        let mut cache = cache_with(8);
        let batch = MicroBatch::single_seq(0, vec![0, 1, 2, 3, 4, 5, 6, 7]).unwrap();
        assert!(cache.find_slot(&batch).ok);
        // free cells 2..5, leaving a 3-wide interior gap
        assert!(cache.seq_rm(0, 2, 5));

        let mut view = CacheView::new(1);
        view.update(&cache);
        assert_eq!(view.used_cells, 5);
        assert_eq!(view.max_contiguous, 3);
        assert_eq!(view.max_contiguous_idx, Some(2));
    }

    #[test]
    fn test_view_truncates_to_n_seq_max() {
        let mut cache = cache_with(4);
        let batch = MicroBatch::single_seq(0, vec![0]).unwrap();
        assert!(cache.find_slot(&batch).ok);
        cache.seq_cp(0, 1, -1, -1);
        cache.seq_cp(0, 2, -1, -1);

        let mut view = CacheView::new(2);
        view.update(&cache);
        assert_eq!(view.token_count, 3);
        assert_eq!(view.cell_sequences(0), &[0, 1]);
    }

    #[test]
    fn test_view_buffers_grow_only() {
        let cache_small = cache_with(2);
        let cache_big = cache_with(5);
        let mut view = CacheView::new(1);

        view.update(&cache_big);
        assert_eq!(view.n_cells, 5);
        view.update(&cache_small);
        // buffers keep the larger capacity
        assert_eq!(view.n_cells, 5);
        assert_eq!(view.cells.len(), 5);
    }
}
