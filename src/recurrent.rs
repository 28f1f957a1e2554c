//! Recurrent cache discipline: one tail cell per sequence
//!
//! Mamba/RWKV-style models keep a single rolling state per sequence instead
//! of one cell per token. Cell `i`, indexed by sequence id, records in its
//! `tail` field the pool index of sequence `i`'s current state cell; that
//! cell in turn names `i` in its seq-id set. Slot assignment reuses a
//! sequence's tail when it solely owns it, claims empty cells otherwise
//! (copy-on-write for forked state), and finally swaps the chosen tails into
//! a contiguous window so kernels see one dense range.
//!
//! A state cannot be partially erased: range-limited removals that would
//! split a tail's position are rejected.

use tracing::{error, warn};

use crate::batch::MicroBatch;
use crate::cell::{CellPool, Pos, SeqId};
use crate::discipline::{clamp_range, Discipline, SlotInfo};

pub(crate) struct RecurrentDiscipline;

/// Advance the cursor (wrapping once) to the next empty cell.
fn next_empty_cell(pool: &CellPool, mut cursor: usize) -> usize {
    for _ in 0..pool.size {
        if cursor >= pool.size {
            cursor -= pool.size;
        }
        if pool.cells[cursor].is_empty() {
            break;
        }
        cursor += 1;
    }
    cursor
}

/// Cross-check every tail index against actual cell membership. Disagreement
/// means the cyclic tail references were corrupted by an earlier operation.
#[cfg(debug_assertions)]
fn verify_tails(pool: &CellPool) {
    let mut tails_verif = vec![-1i32; pool.size];
    for (i, cell) in pool.cells.iter().enumerate() {
        for &seq_id in cell.seq_ids() {
            if tails_verif[seq_id as usize] != -1 {
                error!(
                    "duplicate tail for seq_id {seq_id} in cell {i} and {}",
                    tails_verif[seq_id as usize]
                );
            }
            tails_verif[seq_id as usize] = i as i32;
        }
    }
    for i in 0..pool.size {
        if tails_verif[i] != pool.cells[i].tail {
            error!(
                "wrong tail for seq_id {i}, ({} instead of {})",
                pool.cells[i].tail, tails_verif[i]
            );
        }
    }
}

impl Discipline for RecurrentDiscipline {
    /// Assign one tail cell per sequence group and compact the chosen tails
    /// into a contiguous window `[head, head + n)`.
    ///
    /// On failure (`ok == false`) tail reassignments and evictions may have
    /// already happened; the caller cannot retry without clearing.
    fn find_slot(&self, pool: &mut CellPool, batch: &MicroBatch) -> SlotInfo {
        let size = pool.size;
        let n_seqs = batch.n_seqs();
        let n_seq_tokens = batch.n_seq_tokens;

        // can only process batches with an equal number of new tokens in
        // each sequence
        if !batch.equal_seqs {
            error!("recurrent slot assignment requires equal-length sequence groups");
            return SlotInfo::failed();
        }

        let mut min = size as i32 - 1;
        let mut max = 0i32;

        // everything should fit if all seq_ids are smaller than the max
        for group in &batch.seq_ids {
            for (j, &seq_id) in group.iter().enumerate() {
                if seq_id < 0 || seq_id as usize >= size {
                    error!("seq_id={seq_id} >= n_seq_max={size}; use a larger cache");
                    return SlotInfo::failed();
                }
                if j > 0 {
                    // clear cells from seq_ids that become shared; a state
                    // cell is only ever owned through its primary id
                    let tail_id = pool.cells[seq_id as usize].tail;
                    if tail_id >= 0 {
                        pool.cells[tail_id as usize].erase_seq_id(seq_id);
                        pool.cells[seq_id as usize].tail = -1;
                        let cell = &mut pool.cells[tail_id as usize];
                        if cell.is_empty() {
                            cell.pos = -1;
                            cell.src = -1;
                            pool.used -= 1;
                        }
                    }
                }
            }
        }

        #[cfg(debug_assertions)]
        verify_tails(pool);

        // find next empty cell
        let mut cursor = next_empty_cell(pool, pool.head);

        // find usable cell range
        for s in 0..n_seqs {
            let seq_id = batch.seq_ids[s][0];
            let tail_id = pool.cells[seq_id as usize].tail;

            let mut has_cell = false;
            if tail_id >= 0 {
                let cell = &pool.cells[tail_id as usize];
                debug_assert!(cell.has_seq_id(seq_id));
                // does this seq_id "own" the cell?
                if cell.seq_ids().len() == 1 {
                    has_cell = true;
                }
            }
            if !has_cell {
                debug_assert!(pool.cells[cursor].is_empty());
                // copy old tail into the empty cell
                if tail_id >= 0 {
                    let (pos, src) = {
                        let orig = &pool.cells[tail_id as usize];
                        (orig.pos, orig.src)
                    };
                    pool.cells[cursor].pos = pos;
                    pool.cells[cursor].src = src;
                    pool.cells[tail_id as usize].erase_seq_id(seq_id);
                    // overwritten by the stamp below
                    pool.cells[cursor].insert_seq_id(seq_id);
                }
                pool.cells[seq_id as usize].tail = cursor as i32;
                if s + 1 < n_seqs {
                    cursor = next_empty_cell(pool, cursor + 1);
                }
            }

            let tail = pool.cells[seq_id as usize].tail;
            min = min.min(tail);
            max = max.max(tail);
        }

        // gather and re-order
        for s in 0..n_seqs {
            let dst_id = s as i32 + min;
            let src_id = pool.cells[batch.seq_ids[s][0] as usize].tail;
            if dst_id != src_id {
                pool_swap_state(pool, dst_id as usize, src_id as usize);

                // re-point tails (assuming they never overlap)
                let src_seqs = pool.cells[src_id as usize].seq_ids.clone();
                for &q in &src_seqs {
                    pool.cells[q as usize].tail = src_id;
                }
                let dst_seqs = pool.cells[dst_id as usize].seq_ids.clone();
                for &q in &dst_seqs {
                    pool.cells[q as usize].tail = dst_id;
                }
            }
        }

        // update the pos of the used seqs
        for s in 0..n_seqs {
            let last_pos = batch.pos[n_seq_tokens * s + n_seq_tokens - 1];
            let cell_id = (s as i32 + min) as usize;

            let cell = &mut pool.cells[cell_id];
            if cell.pos >= 0 && last_pos != cell.pos + n_seq_tokens as Pos {
                // a mid-batch position jump would need the state cleared,
                // which is not special-cased here
                warn!(
                    "non-consecutive token position {last_pos} after {} for sequence {} with {n_seq_tokens} new tokens",
                    cell.pos, batch.seq_ids[s][0]
                );
            }
            cell.pos = last_pos;
            cell.seq_ids.clear();
            for &seq_id in &batch.seq_ids[s] {
                pool.cells[cell_id].insert_seq_id(seq_id);
                pool.cells[seq_id as usize].tail = cell_id as i32;
            }
        }

        // the active window kernels read is [head, head + n)
        pool.head = min as usize;
        pool.n = (max - min + 1) as usize;
        pool.used = pool.cells.iter().filter(|c| !c.is_empty()).count();

        SlotInfo::found(pool.n >= n_seqs)
    }

    /// Remove a sequence's state. Fails on a partial erase: the range must
    /// either miss the tail's position entirely or cover it.
    fn seq_rm(&self, pool: &mut CellPool, seq_id: SeqId, p0: Pos, p1: Pos) -> bool {
        let (p0, p1) = clamp_range(p0, p1);

        if seq_id >= pool.size as i32 {
            return false;
        }
        if seq_id >= 0 {
            let tail_id = pool.cells[seq_id as usize].tail;
            if tail_id >= 0 {
                let cell_pos = pool.cells[tail_id as usize].pos;
                // partial intersection is invalid
                if (0 < p0 && p0 <= cell_pos) || (0 < p1 && p1 <= cell_pos) {
                    return false;
                }
                // invalidate tails which will be cleared
                if p0 <= cell_pos && cell_pos < p1 {
                    pool.cells[seq_id as usize].tail = -1;
                }
            }
        } else {
            // removing from all sequences: the range must include everything
            // or nothing
            if p0 != p1 && (p0 != 0 || p1 != Pos::MAX) {
                return false;
            }
        }

        let new_head = pool.sweep_remove(seq_id, p0, p1);
        pool.lower_head(new_head);
        true
    }

    /// Point `dst` at `src`'s state cell, evicting whatever `dst` held. The
    /// position range does not apply to whole-state copies.
    fn seq_cp(&self, pool: &mut CellPool, src: SeqId, dst: SeqId, _p0: Pos, _p1: Pos) {
        if src == dst {
            return;
        }
        if src < 0 || dst < 0 || src as usize >= pool.size || dst as usize >= pool.size {
            return;
        }

        let dst_tail = pool.cells[dst as usize].tail;
        if dst_tail >= 0 {
            // clear the destination's old state if it had one
            pool.cells[dst_tail as usize].erase_seq_id(dst);
            pool.cells[dst as usize].tail = -1;
            let cell = &mut pool.cells[dst_tail as usize];
            if cell.is_empty() {
                cell.pos = -1;
                cell.delta = -1;
                cell.src = -1;
                pool.used -= 1;
            }
        }

        let src_tail = pool.cells[src as usize].tail;
        if src_tail >= 0 {
            pool.cells[src_tail as usize].insert_seq_id(dst);
            pool.cells[dst as usize].tail = src_tail;
        }
    }

    fn seq_keep(&self, pool: &mut CellPool, seq_id: SeqId) {
        for i in 0..pool.size {
            if i as i32 != seq_id {
                pool.cells[i].tail = -1;
            }
        }

        let new_head = pool.sweep_keep(seq_id);
        pool.lower_head(new_head);
    }

    /// Only the tail cell's position shifts; recurrent state needs no rotary
    /// rebase, so neither `delta` nor the shift flag is touched.
    fn seq_add(&self, pool: &mut CellPool, seq_id: SeqId, p0: Pos, p1: Pos, delta: Pos) {
        if delta == 0 {
            return;
        }
        let (p0, p1) = clamp_range(p0, p1);
        if p0 == p1 {
            return;
        }

        if seq_id >= 0 && (seq_id as usize) < pool.size {
            let tail_id = pool.cells[seq_id as usize].tail;
            if tail_id >= 0 {
                let cell = &mut pool.cells[tail_id as usize];
                if cell.has_seq_id(seq_id) && p0 <= cell.pos && cell.pos < p1 {
                    cell.pos += delta;
                }
            }
        }
    }

    fn seq_div(&self, pool: &mut CellPool, seq_id: SeqId, p0: Pos, p1: Pos, d: i32) {
        if d == 1 {
            return;
        }
        let (p0, p1) = clamp_range(p0, p1);
        if p0 == p1 {
            return;
        }

        if seq_id >= 0 && (seq_id as usize) < pool.size {
            let tail_id = pool.cells[seq_id as usize].tail;
            if tail_id >= 0 {
                let cell = &mut pool.cells[tail_id as usize];
                if cell.has_seq_id(seq_id) && p0 <= cell.pos && cell.pos < p1 {
                    cell.pos /= d;
                }
            }
        }
    }

    /// Recurrent state cells move with their sequences; there is nothing to
    /// defragment.
    fn defrag(&self, _pool: &mut CellPool) {}
}

/// Swap the state content of two cells: position, source and membership.
/// The `tail` back-references and pending deltas stay put.
fn pool_swap_state(pool: &mut CellPool, a: usize, b: usize) {
    debug_assert_ne!(a, b);
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    let (left, right) = pool.cells.split_at_mut(hi);
    let (ca, cb) = (&mut left[lo], &mut right[0]);
    std::mem::swap(&mut ca.pos, &mut cb.pos);
    std::mem::swap(&mut ca.src, &mut cb.src);
    std::mem::swap(&mut ca.seq_ids, &mut cb.seq_ids);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(pool: &mut CellPool, seq_id: SeqId, pos: Vec<Pos>) -> SlotInfo {
        let batch = MicroBatch::single_seq(seq_id, pos).unwrap();
        RecurrentDiscipline.find_slot(pool, &batch)
    }

    #[test]
    fn test_find_slot_claims_and_compacts_fresh_tail() {
        let mut pool = CellPool::new(4);
        let slot = step(&mut pool, 0, vec![5, 6]);
        assert!(slot.ok);
        assert_eq!(pool.n, 1);
        assert_eq!(pool.used, 1);

        let tail = pool.cells[0].tail;
        assert!(tail >= 0);
        assert_eq!(tail as usize, pool.head);
        let cell = &pool.cells[tail as usize];
        assert_eq!(cell.pos, 6);
        assert_eq!(cell.seq_ids(), &[0]);
    }

    #[test]
    fn test_find_slot_reuses_sole_tail() {
        let mut pool = CellPool::new(4);
        assert!(step(&mut pool, 0, vec![0, 1]).ok);
        let tail_before = pool.cells[0].tail;

        assert!(step(&mut pool, 0, vec![2]).ok);
        assert_eq!(pool.cells[0].tail, tail_before);
        assert_eq!(pool.used, 1);
        assert_eq!(pool.cells[tail_before as usize].pos, 2);
    }

    #[test]
    fn test_find_slot_copy_on_write_after_fork() {
        let mut pool = CellPool::new(4);
        assert!(step(&mut pool, 0, vec![0, 1]).ok);
        RecurrentDiscipline.seq_cp(&mut pool, 0, 1, -1, -1);

        let shared = pool.cells[0].tail;
        assert_eq!(pool.cells[1].tail, shared);
        assert_eq!(pool.cells[shared as usize].seq_ids(), &[0, 1]);
        assert_eq!(pool.used, 1);

        // advancing seq 1 must not clobber seq 0's shared state
        assert!(step(&mut pool, 1, vec![2]).ok);
        let tail0 = pool.cells[0].tail;
        let tail1 = pool.cells[1].tail;
        assert_ne!(tail0, tail1);
        assert_eq!(pool.cells[tail0 as usize].seq_ids(), &[0]);
        assert_eq!(pool.cells[tail0 as usize].pos, 1);
        assert_eq!(pool.cells[tail1 as usize].seq_ids(), &[1]);
        assert_eq!(pool.cells[tail1 as usize].pos, 2);
        assert_eq!(pool.used, 2);
    }

    #[test]
    fn test_find_slot_compacts_multiple_sequences() {
        let mut pool = CellPool::new(8);
        // two independent groups in one batch
        let batch = MicroBatch::new(
            vec![0, 1, 0, 1],
            vec![vec![0], vec![3]],
            2,
            true,
        )
        .unwrap();
        let slot = RecurrentDiscipline.find_slot(&mut pool, &batch);
        assert!(slot.ok);
        assert_eq!(pool.n, 2);
        assert_eq!(pool.used, 2);

        let t0 = pool.cells[0].tail as usize;
        let t3 = pool.cells[3].tail as usize;
        // tails occupy a dense window starting at head
        assert_eq!(t0.min(t3), pool.head);
        assert_eq!(t0.max(t3), pool.head + 1);
        assert_eq!(pool.cells[t0].pos, 1);
        assert_eq!(pool.cells[t3].pos, 1);
    }

    #[test]
    fn test_find_slot_rejects_oversized_seq_id() {
        let mut pool = CellPool::new(2);
        let slot = step(&mut pool, 7, vec![0]);
        assert!(!slot.ok);
        assert_eq!(pool.used, 0);
    }

    #[test]
    fn test_find_slot_rejects_unequal_groups() {
        let mut pool = CellPool::new(2);
        let batch = MicroBatch::new(vec![0], vec![vec![0]], 1, false).unwrap();
        assert!(!RecurrentDiscipline.find_slot(&mut pool, &batch).ok);
    }

    #[test]
    fn test_find_slot_strips_secondary_memberships() {
        let mut pool = CellPool::new(4);
        assert!(step(&mut pool, 1, vec![0]).ok);
        // seq 1 listed as a secondary id of seq 0's group: its old state is
        // dropped before assignment
        let batch = MicroBatch::new(vec![0, 1], vec![vec![0, 1]], 2, true).unwrap();
        assert!(RecurrentDiscipline.find_slot(&mut pool, &batch).ok);

        let tail0 = pool.cells[0].tail;
        assert_eq!(pool.cells[1].tail, tail0);
        assert_eq!(pool.cells[tail0 as usize].seq_ids(), &[0, 1]);
        assert_eq!(pool.used, 1);
    }

    #[test]
    fn test_seq_rm_rejects_partial_erase() {
        let mut pool = CellPool::new(4);
        assert!(step(&mut pool, 0, vec![0, 1, 2]).ok);

        // tail pos is 2; removing [1, 2) would split the state
        assert!(!RecurrentDiscipline.seq_rm(&mut pool, 0, 1, 2));
        assert_eq!(pool.used, 1);

        // covering the whole state is fine
        assert!(RecurrentDiscipline.seq_rm(&mut pool, 0, -1, -1));
        assert_eq!(pool.used, 0);
        assert_eq!(pool.cells[0].tail, -1);
    }

    #[test]
    fn test_seq_rm_all_sequences_requires_full_range() {
        let mut pool = CellPool::new(4);
        assert!(step(&mut pool, 0, vec![0]).ok);

        assert!(!RecurrentDiscipline.seq_rm(&mut pool, -1, 0, 5));
        // empty range is allowed and does nothing
        assert!(RecurrentDiscipline.seq_rm(&mut pool, -1, 3, 3));
        assert_eq!(pool.used, 1);
        // unbounded range clears everything
        assert!(RecurrentDiscipline.seq_rm(&mut pool, -1, -1, -1));
        assert_eq!(pool.used, 0);
    }

    #[test]
    fn test_seq_rm_oversized_seq_id_fails() {
        let mut pool = CellPool::new(2);
        assert!(!RecurrentDiscipline.seq_rm(&mut pool, 9, -1, -1));
    }

    #[test]
    fn test_seq_cp_shares_state_and_evicts_old_dst() {
        let mut pool = CellPool::new(4);
        assert!(step(&mut pool, 0, vec![0]).ok);
        assert!(step(&mut pool, 1, vec![0]).ok);
        assert_eq!(pool.used, 2);

        RecurrentDiscipline.seq_cp(&mut pool, 0, 1, -1, -1);
        // seq 1's old cell was evicted, both ids share seq 0's cell
        assert_eq!(pool.used, 1);
        let tail = pool.cells[0].tail;
        assert_eq!(pool.cells[1].tail, tail);
        assert_eq!(pool.cells[tail as usize].seq_ids(), &[0, 1]);
    }

    #[test]
    fn test_seq_cp_from_stateless_src_only_evicts() {
        let mut pool = CellPool::new(4);
        assert!(step(&mut pool, 1, vec![0]).ok);

        RecurrentDiscipline.seq_cp(&mut pool, 0, 1, -1, -1);
        assert_eq!(pool.used, 0);
        assert_eq!(pool.cells[1].tail, -1);
    }

    #[test]
    fn test_seq_keep_invalidates_other_tails() {
        let mut pool = CellPool::new(4);
        assert!(step(&mut pool, 0, vec![0]).ok);
        assert!(step(&mut pool, 1, vec![0]).ok);

        RecurrentDiscipline.seq_keep(&mut pool, 1);
        assert_eq!(pool.used, 1);
        assert_eq!(pool.cells[0].tail, -1);
        let tail1 = pool.cells[1].tail;
        assert!(tail1 >= 0);
        assert_eq!(pool.cells[tail1 as usize].seq_ids(), &[1]);
    }

    #[test]
    fn test_seq_add_shifts_only_tail_pos() {
        let mut pool = CellPool::new(4);
        assert!(step(&mut pool, 0, vec![0, 1]).ok);
        let tail = pool.cells[0].tail as usize;

        RecurrentDiscipline.seq_add(&mut pool, 0, -1, -1, 4);
        assert_eq!(pool.cells[tail].pos, 5);
        assert_eq!(pool.cells[tail].delta, 0);
        assert!(!pool.has_shift);
    }

    #[test]
    fn test_seq_div_divides_only_tail_pos() {
        let mut pool = CellPool::new(4);
        assert!(step(&mut pool, 0, vec![7, 8]).ok);
        let tail = pool.cells[0].tail as usize;

        RecurrentDiscipline.seq_div(&mut pool, 0, -1, -1, 2);
        assert_eq!(pool.cells[tail].pos, 4);
        assert_eq!(pool.cells[tail].delta, 0);
        assert!(!pool.has_shift);
    }

    #[test]
    fn test_defrag_is_noop() {
        let mut pool = CellPool::new(2);
        RecurrentDiscipline.defrag(&mut pool);
        assert!(!pool.do_defrag);
    }
}
