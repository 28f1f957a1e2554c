//! Transformer cache discipline: one cell per token
//!
//! Slots are contiguous runs of empty cells found by a linear scan from the
//! `head` hint. Sequence operations sweep the whole pool; sharing a cell
//! between sequences is the fork mechanism, so copies never duplicate data.

use tracing::error;

use crate::batch::MicroBatch;
use crate::cell::{CellPool, Pos, SeqId};
use crate::discipline::{clamp_range, Discipline, SlotInfo};

pub(crate) struct TransformerDiscipline;

impl Discipline for TransformerDiscipline {
    /// Reserve `n_tokens` consecutive empty cells and stamp their metadata.
    ///
    /// The scan starts at the `head` hint and wraps once. On a mismatch at
    /// offset `i` the cursor skips past the occupied cell. `head` is left at
    /// the slot begin; the next search resumes from the same hint.
    fn find_slot(&self, pool: &mut CellPool, batch: &MicroBatch) -> SlotInfo {
        let size = pool.size;
        let n_tokens = batch.n_tokens();
        let n_seqs = batch.n_seqs();
        let n_seq_tokens = batch.n_seq_tokens;

        if n_tokens > size {
            error!("n_tokens = {n_tokens} > size = {size}");
            return SlotInfo::failed();
        }

        let mut n_tested = 0;

        loop {
            if pool.head + n_tokens > size {
                n_tested += size - pool.head;
                pool.head = 0;
                continue;
            }

            let mut found = true;
            for i in 0..n_tokens {
                if pool.cells[pool.head + i].pos >= 0 {
                    found = false;
                    pool.head += i + 1;
                    n_tested += i + 1;
                    break;
                }
            }

            if found {
                break;
            }

            if n_tested >= size {
                return SlotInfo::failed();
            }
        }

        let head = pool.head;
        for s in 0..n_seqs {
            for i in 0..n_seq_tokens {
                let k = s * n_seq_tokens + i;
                let cell = &mut pool.cells[head + k];
                cell.pos = batch.pos[k];
                for &seq_id in &batch.seq_ids[s] {
                    cell.insert_seq_id(seq_id);
                }
            }
        }

        pool.used += n_tokens;

        SlotInfo::span(head, head + n_tokens)
    }

    fn seq_rm(&self, pool: &mut CellPool, seq_id: SeqId, p0: Pos, p1: Pos) -> bool {
        let (p0, p1) = clamp_range(p0, p1);
        let new_head = pool.sweep_remove(seq_id, p0, p1);
        pool.lower_head(new_head);
        true
    }

    /// Insert `dst` into every cell `src` references in range. Cells become
    /// shared; no data moves. The search hint is reset so freed slots before
    /// it are found again.
    fn seq_cp(&self, pool: &mut CellPool, src: SeqId, dst: SeqId, p0: Pos, p1: Pos) {
        if src == dst {
            return;
        }
        let (p0, p1) = clamp_range(p0, p1);

        pool.head = 0;

        for i in 0..pool.size {
            let cell = &mut pool.cells[i];
            if cell.has_seq_id(src) && cell.pos >= p0 && cell.pos < p1 {
                cell.insert_seq_id(dst);
            }
        }
    }

    fn seq_keep(&self, pool: &mut CellPool, seq_id: SeqId) {
        let new_head = pool.sweep_keep(seq_id);
        pool.lower_head(new_head);
    }

    /// Shift positions in range by `delta`, accumulating the pending rotary
    /// rebase in each touched cell. A position pushed below zero evicts the
    /// cell.
    fn seq_add(&self, pool: &mut CellPool, seq_id: SeqId, p0: Pos, p1: Pos, delta: Pos) {
        if delta == 0 {
            return;
        }

        let mut new_head = pool.size;

        let (p0, p1) = clamp_range(p0, p1);
        if p0 == p1 {
            return;
        }

        for i in 0..pool.size {
            let cell = &mut pool.cells[i];
            if cell.has_seq_id(seq_id) && cell.pos >= p0 && cell.pos < p1 {
                pool.has_shift = true;
                cell.pos += delta;
                cell.delta += delta;

                if cell.pos < 0 {
                    if !cell.is_empty() {
                        pool.used -= 1;
                    }
                    cell.pos = -1;
                    cell.seq_ids.clear();
                    if new_head == pool.size {
                        new_head = i;
                    }
                }
            }
        }

        // If we freed up a slot, set head to it so searching can start there.
        // Otherwise the next search starts from the beginning.
        pool.head = if new_head != pool.size { new_head } else { 0 };
    }

    fn seq_div(&self, pool: &mut CellPool, seq_id: SeqId, p0: Pos, p1: Pos, d: i32) {
        if d == 1 {
            return;
        }

        let (p0, p1) = clamp_range(p0, p1);
        if p0 == p1 {
            return;
        }

        for i in 0..pool.size {
            let cell = &mut pool.cells[i];
            if cell.has_seq_id(seq_id) && cell.pos >= p0 && cell.pos < p1 {
                pool.has_shift = true;

                let p_old = cell.pos;
                cell.pos /= d;
                cell.delta += cell.pos - p_old;
            }
        }
    }

    fn defrag(&self, pool: &mut CellPool) {
        pool.do_defrag = true;
    }
}
