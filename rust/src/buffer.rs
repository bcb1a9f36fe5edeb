//! Double-buffered index allocation.
//!
//! Every per-node quantity that must survive a rejected proposal (partials,
//! scale factors, transition matrices, eigen systems) gets two physical
//! slots per logical index. Writing into the non-current slot and flipping
//! keeps the checkpointed value intact until the next `store_state`.
//!
//! Logical indices below `min_index` are un-mirrored: they map to themselves
//! and are never flipped (tip buffers, for example).

/// Maps logical buffer indices to physical slots and tracks which of the two
/// mirrored slots is current.
#[derive(Debug, Clone)]
pub struct BufferIndexHelper {
    max_index: usize,
    min_index: usize,
    offset_count: usize,
    base: usize,
    index_offsets: Vec<usize>,
    stored_index_offsets: Vec<usize>,
    flipped: Vec<bool>,
}

impl BufferIndexHelper {
    /// Helper for logical indices `[0, max_index)`, mirroring `[min_index, max_index)`.
    ///
    /// # Panics
    /// If `min_index > max_index`.
    pub fn new(max_index: usize, min_index: usize) -> Self {
        Self::with_base(max_index, min_index, 0)
    }

    /// Like [`new`](Self::new) but mirrored slots start `base` physical slots
    /// further along. Evaluation contexts use this to own disjoint regions
    /// while sharing the un-mirrored slots.
    pub fn with_base(max_index: usize, min_index: usize, base: usize) -> Self {
        assert!(
            min_index <= max_index,
            "un-mirrored range {} exceeds index range {}",
            min_index,
            max_index
        );
        let offset_count = max_index - min_index;
        Self {
            max_index,
            min_index,
            offset_count,
            base,
            index_offsets: vec![0; offset_count],
            stored_index_offsets: vec![0; offset_count],
            flipped: vec![false; offset_count],
        }
    }

    /// Physical slots one region occupies: both mirrors plus the un-mirrored prefix.
    pub fn buffer_count(&self) -> usize {
        2 * self.offset_count + self.min_index
    }

    /// Physical slots taken by one mirrored region (excluding the shared prefix).
    pub fn region_size(&self) -> usize {
        2 * self.offset_count
    }

    pub fn max_index(&self) -> usize {
        self.max_index
    }

    pub fn min_index(&self) -> usize {
        self.min_index
    }

    /// Toggle the current slot of a mirrored index.
    ///
    /// Only the first flip after a store or restore has an effect, so a retry
    /// that flips again overwrites the same scratch slot.
    ///
    /// # Panics
    /// If `index` is un-mirrored or out of range.
    pub fn flip_offset(&mut self, index: usize) {
        let slot = self.mirrored_slot(index);
        if !self.flipped[slot] {
            self.index_offsets[slot] = self.offset_count - self.index_offsets[slot];
            self.flipped[slot] = true;
        }
    }

    /// Move `index` to a writable slot before recomputing it.
    ///
    /// With `flip_buffers` this is a plain flip. Without it the current slot
    /// is reused unless it is still the checkpointed one.
    pub fn prepare_write(&mut self, index: usize, flip_buffers: bool) {
        if flip_buffers || !self.is_safe_update(index) {
            self.flip_offset(index);
        }
    }

    /// Physical slot currently holding `index`.
    ///
    /// # Panics
    /// If `index >= max_index`.
    pub fn offset_index(&self, index: usize) -> usize {
        assert!(
            index < self.max_index,
            "buffer index {} out of range {}",
            index,
            self.max_index
        );
        if index < self.min_index {
            index
        } else {
            self.base + index + self.index_offsets[index - self.min_index]
        }
    }

    /// Whether `index` now points away from its checkpointed slot.
    ///
    /// Un-mirrored indices are never checkpointed and always report `false`.
    pub fn is_safe_update(&self, index: usize) -> bool {
        if index < self.min_index {
            return false;
        }
        let slot = self.mirrored_slot(index);
        self.index_offsets[slot] != self.stored_index_offsets[slot]
    }

    pub fn has_flipped(&self, index: usize) -> bool {
        index >= self.min_index && self.flipped[self.mirrored_slot(index)]
    }

    pub fn store_state(&mut self) {
        self.stored_index_offsets.copy_from_slice(&self.index_offsets);
        self.flipped.iter_mut().for_each(|f| *f = false);
    }

    pub fn restore_state(&mut self) {
        std::mem::swap(&mut self.index_offsets, &mut self.stored_index_offsets);
        self.stored_index_offsets.copy_from_slice(&self.index_offsets);
        self.flipped.iter_mut().for_each(|f| *f = false);
    }

    fn mirrored_slot(&self, index: usize) -> usize {
        assert!(
            index >= self.min_index && index < self.max_index,
            "buffer index {} is not mirrored (mirrored range {}..{})",
            index,
            self.min_index,
            self.max_index
        );
        index - self.min_index
    }
}
