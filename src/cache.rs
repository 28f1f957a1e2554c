//! The KV cache: cell pool, tensor pane and the discipline picked at init
//!
//! All mutation runs to completion before the caller issues the next call;
//! there is no internal locking. Attention kernels read cells in the window
//! `[head, head + n)` and write only into the span returned by the most
//! recent `find_slot`; ordering against kernel completion is the caller's
//! job.

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use tracing::info;

use crate::batch::MicroBatch;
use crate::cell::{Cell, CellPool, Pos, SeqId};
use crate::config::{ComputeParams, ModelHparams};
use crate::discipline::{Discipline, SlotInfo};
use crate::pane::TensorPane;
use crate::recurrent::RecurrentDiscipline;
use crate::transformer::TransformerDiscipline;

/// Bounded pool of KV cells shared by all live sequences.
pub struct KvCache {
    pool: CellPool,
    pane: TensorPane,
    discipline: Box<dyn Discipline>,
    recurrent: bool,
    /// V stored transposed (column-major per cell) for non-flash attention
    v_trans: bool,
    /// Position-shift fixups supported by the attention kernels
    can_shift: bool,
    flash_attn: bool,
}

impl KvCache {
    /// Build a cache of `kv_size` cells with zero-filled per-layer buffers.
    ///
    /// `device` is where layer tensors are placed when `offload` is set;
    /// without it everything stays on the CPU. Fails iff a backing buffer
    /// cannot be allocated or the hyperparameters are inconsistent.
    pub fn new(
        model: &ModelHparams,
        cparams: &ComputeParams,
        type_k: DType,
        type_v: DType,
        kv_size: usize,
        offload: bool,
        device: &Device,
    ) -> Result<Self> {
        if kv_size == 0 {
            bail!("kv_size must be positive");
        }
        model.validate()?;

        let recurrent = model.recurrent;
        let v_trans = !recurrent && !cparams.flash_attn;
        let can_shift = !recurrent && !model.mla;

        info!(
            "kv_size = {kv_size}, offload = {offload}, type_k = {type_k:?}, type_v = {type_v:?}, n_layer = {}, can_shift = {can_shift}",
            model.n_layer
        );

        let pane = TensorPane::new(model, type_k, type_v, kv_size, offload, device)?;

        let discipline: Box<dyn Discipline> = if recurrent {
            Box::new(RecurrentDiscipline)
        } else {
            Box::new(TransformerDiscipline)
        };

        Ok(Self {
            pool: CellPool::new(kv_size),
            pane,
            discipline,
            recurrent,
            v_trans,
            can_shift,
            flash_attn: cparams.flash_attn,
        })
    }

    // --- Slot allocation ---

    /// Reserve cells for a micro-batch and stamp their metadata.
    ///
    /// Transformer: a contiguous run of `n_tokens` cells, reported in the
    /// returned span. Recurrent: one tail cell per sequence group, compacted
    /// into `[head, head + n)`; on failure the tail layout may already have
    /// changed, so a failed call cannot be retried without clearing.
    pub fn find_slot(&mut self, batch: &MicroBatch) -> SlotInfo {
        self.discipline.find_slot(&mut self.pool, batch)
    }

    // --- Per-sequence mutation ---

    /// Remove `seq_id` (all sequences when negative) in `[p0, p1)`.
    /// Fails only for a recurrent partial erase, which is a caller bug.
    pub fn seq_rm(&mut self, seq_id: SeqId, p0: Pos, p1: Pos) -> bool {
        self.discipline.seq_rm(&mut self.pool, seq_id, p0, p1)
    }

    /// Make `dst` share `src`'s cells in `[p0, p1)` (transformer) or its
    /// state cell (recurrent). No tensor data is copied.
    pub fn seq_cp(&mut self, src: SeqId, dst: SeqId, p0: Pos, p1: Pos) {
        self.discipline.seq_cp(&mut self.pool, src, dst, p0, p1);
    }

    /// Drop every sequence except `seq_id`.
    pub fn seq_keep(&mut self, seq_id: SeqId) {
        self.discipline.seq_keep(&mut self.pool, seq_id);
    }

    /// Shift positions of `seq_id` in `[p0, p1)` by `delta`.
    pub fn seq_add(&mut self, seq_id: SeqId, p0: Pos, p1: Pos, delta: Pos) {
        self.discipline.seq_add(&mut self.pool, seq_id, p0, p1, delta);
    }

    /// Integer-divide positions of `seq_id` in `[p0, p1)` by `d`.
    pub fn seq_div(&mut self, seq_id: SeqId, p0: Pos, p1: Pos, d: i32) {
        self.discipline.seq_div(&mut self.pool, seq_id, p0, p1, d);
    }

    /// Highest position held by `seq_id`, floored at 0 when absent.
    pub fn seq_pos_max(&self, seq_id: SeqId) -> Pos {
        self.pool.seq_pos_max(seq_id)
    }

    // --- Lifecycle ---

    /// Request a defragmentation pass from the scheduler. No-op for
    /// recurrent caches.
    pub fn defrag(&mut self) {
        self.discipline.defrag(&mut self.pool);
    }

    /// Reset all cell metadata and zero-fill the backing buffers.
    pub fn clear(&mut self) -> Result<()> {
        self.pool.clear_cells();
        self.pane.clear()
    }

    /// Total number of (cell, sequence) memberships.
    pub fn n_tokens(&self) -> usize {
        self.pool.n_tokens()
    }

    /// Number of occupied cells.
    pub fn used_cells(&self) -> usize {
        self.pool.used
    }

    /// Maximum position over all cells, `-1` when the cache is empty.
    pub fn max_pos(&self) -> Pos {
        self.pool.max_pos()
    }

    /// Index one past the last occupied cell; an upper bound for kernel
    /// windows.
    pub fn cell_max(&self) -> usize {
        self.pool.cell_max()
    }

    /// Total bytes of backing buffer storage.
    pub fn total_size(&self) -> usize {
        self.pane.total_size()
    }

    /// Slot ranges handed to kernels must be padded up to this many cells.
    pub fn get_padding(&self) -> usize {
        // flash-attention kernels avoid runtime boundary checks with
        // coarser padding
        if self.flash_attn {
            256
        } else {
            32
        }
    }

    // --- Advisory flags, polled and cleared by the caller ---

    /// Some cell carries a pending position shift.
    pub fn has_shift(&self) -> bool {
        self.pool.has_shift
    }

    /// Clear the shift flag and every per-cell accumulator. Call after the
    /// attention side has applied the pending rotary rebase.
    pub fn shift_applied(&mut self) {
        self.pool.has_shift = false;
        for cell in &mut self.pool.cells {
            cell.delta = 0;
        }
    }

    /// A defragmentation pass has been requested.
    pub fn do_defrag(&self) -> bool {
        self.pool.do_defrag
    }

    /// Read and clear the defrag request (the scheduler's poll).
    pub fn take_defrag_request(&mut self) -> bool {
        std::mem::take(&mut self.pool.do_defrag)
    }

    // --- Geometry ---

    pub fn size(&self) -> usize {
        self.pool.size
    }

    /// Search hint and start of the active kernel window.
    pub fn head(&self) -> usize {
        self.pool.head
    }

    /// Width of the active window (recurrent discipline).
    pub fn n(&self) -> usize {
        self.pool.n
    }

    pub fn is_recurrent(&self) -> bool {
        self.recurrent
    }

    pub fn v_trans(&self) -> bool {
        self.v_trans
    }

    pub fn can_shift(&self) -> bool {
        self.can_shift
    }

    /// Cell metadata, index-aligned with the pool.
    pub fn cells(&self) -> &[Cell] {
        &self.pool.cells
    }

    /// K buffer of layer `il`, written by kernels at slot offsets.
    pub fn k_cache(&self, il: usize) -> &Tensor {
        self.pane.k(il)
    }

    /// V buffer of layer `il`.
    pub fn v_cache(&self, il: usize) -> &Tensor {
        self.pane.v(il)
    }
}
