//! Cell metadata and the fixed-size cell pool
//!
//! A cell is one slot of the cache: it holds the K/V of a single token for
//! transformer models, or the rolling state of a whole sequence for
//! recurrent models. The pool is a flat array of exactly `size` cells plus
//! the aggregate counters the slot allocators maintain.
//!
//! ## Field conventions
//!
//! Positions and sequence ids are `i32` with `-1` as the "none" sentinel,
//! matching the wire types the runtime uses everywhere else. The per-cell
//! sequence-id set is a sorted small-vector: the sets are tiny (a handful of
//! ids after a fork) and a linear structure beats a hash set at that size.

use smallvec::SmallVec;

/// Token position within a sequence. `-1` marks an empty cell.
pub type Pos = i32;

/// Logical sequence identifier. Negative values mean "all sequences" in the
/// sequence operations.
pub type SeqId = i32;

/// Per-slot metadata record.
#[derive(Debug, Clone)]
pub struct Cell {
    pub(crate) pos: Pos,
    /// Accumulated position shift not yet reconciled by the attention side
    pub(crate) delta: Pos,
    /// Recurrent only: pool index this state was copied from
    pub(crate) src: i32,
    /// Recurrent only: cell `i` stores in `tail` the pool index of sequence
    /// `i`'s current state cell
    pub(crate) tail: i32,
    pub(crate) seq_ids: SmallVec<[SeqId; 4]>,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            pos: -1,
            delta: 0,
            src: -1,
            tail: -1,
            seq_ids: SmallVec::new(),
        }
    }
}

impl Cell {
    /// Token position, `-1` when empty.
    pub fn pos(&self) -> Pos {
        self.pos
    }

    /// Pending position shift accumulated since the last reconciliation.
    pub fn delta(&self) -> Pos {
        self.delta
    }

    /// Source cell index recorded by the recurrent copy path, `-1` if none.
    pub fn src(&self) -> i32 {
        self.src
    }

    /// Tail index stored in this cell (meaningful when indexed by seq id).
    pub fn tail(&self) -> i32 {
        self.tail
    }

    /// Sequence ids currently referencing this cell, sorted ascending.
    pub fn seq_ids(&self) -> &[SeqId] {
        &self.seq_ids
    }

    /// A cell is empty iff no sequence references it.
    pub fn is_empty(&self) -> bool {
        self.seq_ids.is_empty()
    }

    /// A cell is occupied iff it has a valid position.
    pub fn is_occupied(&self) -> bool {
        self.pos >= 0
    }

    pub fn has_seq_id(&self, seq_id: SeqId) -> bool {
        self.seq_ids.binary_search(&seq_id).is_ok()
    }

    pub(crate) fn insert_seq_id(&mut self, seq_id: SeqId) {
        if let Err(idx) = self.seq_ids.binary_search(&seq_id) {
            self.seq_ids.insert(idx, seq_id);
        }
    }

    pub(crate) fn erase_seq_id(&mut self, seq_id: SeqId) {
        if let Ok(idx) = self.seq_ids.binary_search(&seq_id) {
            self.seq_ids.remove(idx);
        }
    }
}

/// Flat ordered pool of cells with the aggregate counters shared by both
/// cache disciplines.
#[derive(Debug)]
pub(crate) struct CellPool {
    pub(crate) cells: Vec<Cell>,
    pub(crate) size: usize,
    /// Search hint: first index where an empty cell might exist. A hint, not
    /// a bound; cells below `head` may be empty after shifts.
    pub(crate) head: usize,
    /// Number of occupied cells
    pub(crate) used: usize,
    /// Width of the current active window (recurrent discipline only)
    pub(crate) n: usize,
    /// Any cell carries a non-zero pending delta
    pub(crate) has_shift: bool,
    /// Defragmentation requested; polled and cleared by the scheduler
    pub(crate) do_defrag: bool,
}

impl CellPool {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            cells: vec![Cell::default(); size],
            size,
            head: 0,
            used: 0,
            n: 0,
            has_shift: false,
            do_defrag: false,
        }
    }

    /// Total number of (cell, sequence) memberships.
    pub(crate) fn n_tokens(&self) -> usize {
        self.cells.iter().map(|c| c.seq_ids.len()).sum()
    }

    /// Maximum position over all cells, `-1` when the pool is empty.
    pub(crate) fn max_pos(&self) -> Pos {
        self.cells.iter().map(|c| c.pos).max().unwrap_or(-1)
    }

    /// Index one past the last occupied cell.
    pub(crate) fn cell_max(&self) -> usize {
        for i in (0..self.size).rev() {
            let cell = &self.cells[i];
            if cell.pos >= 0 && !cell.is_empty() {
                return i + 1;
            }
        }
        0
    }

    /// Maximum position among cells referencing `seq_id`. Floors at 0 even
    /// when the sequence is absent; callers rely on that.
    pub(crate) fn seq_pos_max(&self, seq_id: SeqId) -> Pos {
        let mut result = 0;
        for cell in &self.cells {
            if cell.has_seq_id(seq_id) {
                result = result.max(cell.pos);
            }
        }
        result
    }

    /// Remove `seq_id` (all sequences when negative) from every cell whose
    /// position falls in `[p0, p1)`, emptying cells whose last reference
    /// goes away. Returns the lowest freed index, or `size` if none.
    pub(crate) fn sweep_remove(&mut self, seq_id: SeqId, p0: Pos, p1: Pos) -> usize {
        let mut new_head = self.size;

        for i in 0..self.size {
            let cell = &mut self.cells[i];
            if cell.pos >= p0 && cell.pos < p1 {
                if seq_id < 0 {
                    cell.seq_ids.clear();
                } else if cell.has_seq_id(seq_id) {
                    cell.erase_seq_id(seq_id);
                } else {
                    continue;
                }
                if cell.is_empty() {
                    // keep count of the number of used cells
                    if cell.pos >= 0 {
                        self.used -= 1;
                    }
                    cell.pos = -1;
                    cell.src = -1;
                    if new_head == self.size {
                        new_head = i;
                    }
                }
            }
        }

        new_head
    }

    /// Reduce every cell to either exactly `{seq_id}` or empty. Returns the
    /// lowest index not referencing `seq_id`, or `size` if none.
    pub(crate) fn sweep_keep(&mut self, seq_id: SeqId) -> usize {
        let mut new_head = self.size;

        for i in 0..self.size {
            let cell = &mut self.cells[i];
            if cell.has_seq_id(seq_id) {
                cell.seq_ids.clear();
                cell.insert_seq_id(seq_id);
            } else {
                if cell.pos >= 0 {
                    self.used -= 1;
                }
                cell.pos = -1;
                cell.src = -1;
                cell.seq_ids.clear();
                if new_head == self.size {
                    new_head = i;
                }
            }
        }

        new_head
    }

    /// Adopt `new_head` as the search hint when it frees up an earlier slot.
    pub(crate) fn lower_head(&mut self, new_head: usize) {
        if new_head != self.size && new_head < self.head {
            self.head = new_head;
        }
    }

    /// Reset every cell and the dynamic counters. Pending deltas survive
    /// until the attention side reconciles them.
    pub(crate) fn clear_cells(&mut self) {
        for cell in &mut self.cells {
            cell.pos = -1;
            cell.seq_ids.clear();
            cell.src = -1;
            cell.tail = -1;
        }
        self.head = 0;
        self.used = 0;
    }
}
