//! Id-keyed heap allocator.
//!
//! Placement is first-fit over an address-ordered free list. Shrinking
//! releases the tail in place; growing extends in place when the following
//! cells are free and otherwise relocates to the first hole that fits. The
//! allocator only hands out address ranges; the machine moves the cells.
//!
//! Every block is owned by the frame that allocated it. An id allocated again
//! from a deeper frame stacks a new block on top of the outer one, so a
//! recursive call gets its own copy; releasing the frame pops it again.

use std::collections::{BTreeMap, HashMap};

use tracing::trace;

use crate::lang::HeapId;
use crate::runtime::runtime_error::{Result, RuntimeError};

/// A reserved heap region: header cell plus element cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub base: usize,
    pub cells: usize,
}

impl Block {
    /// Elements that fit after the header.
    pub fn elements(&self) -> usize {
        self.cells - 1
    }

    fn end(&self) -> usize {
        self.base + self.cells
    }
}

/// Outcome of a resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub old: Block,
    pub new: Block,
}

impl Relocation {
    pub fn moved(&self) -> bool {
        self.old.base != self.new.base
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Owned {
    block: Block,
    /// Frame pointer of the allocating frame.
    owner: usize,
}

#[derive(Debug, Clone)]
pub struct Allocator {
    origin: usize,
    end: usize,
    /// Free holes as (base, len), ordered by base, never adjacent.
    free: Vec<(usize, usize)>,
    /// Live blocks per id, innermost frame last. Never empty.
    live: HashMap<HeapId, Vec<Owned>>,
    by_base: BTreeMap<usize, HeapId>,
}

impl Allocator {
    /// Manage the cells in `origin..end`.
    pub fn new(origin: usize, end: usize) -> Self {
        let free = if end > origin {
            vec![(origin, end - origin)]
        } else {
            Vec::new()
        };

        Self {
            origin,
            end,
            free,
            live: HashMap::new(),
            by_base: BTreeMap::new(),
        }
    }

    pub fn origin(&self) -> usize {
        self.origin
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn live_count(&self) -> usize {
        self.live.values().map(Vec::len).sum()
    }

    pub fn free_cells(&self) -> usize {
        self.free.iter().map(|(_, len)| len).sum()
    }

    /// Reserve `size + 1` cells for allocation `id` on behalf of the frame
    /// at `owner`.
    ///
    /// If `owner` already holds `id`, that block is released first, so a
    /// declaration executed again (in a loop, say) replaces its own block.
    /// Blocks of `id` owned by outer frames stay untouched.
    pub fn alloc(&mut self, id: HeapId, owner: usize, size: usize) -> Result<Block> {
        if self.top(id).is_some_and(|top| top.owner == owner) {
            self.free(id)?;
        }

        let cells = size + 1;
        let base = self.take_first_fit(cells).ok_or(RuntimeError::HeapExhausted {
            id,
            requested: cells,
        })?;
        let block = Block { base, cells };

        self.live.entry(id).or_default().push(Owned { block, owner });
        self.by_base.insert(base, id);
        trace!(id, base, cells, owner, "heap alloc");
        Ok(block)
    }

    /// Resize allocation `id` to hold `size` elements.
    pub fn realloc(&mut self, id: HeapId, size: usize) -> Result<Relocation> {
        let old = self.lookup(id)?;
        let cells = size + 1;

        let new = if cells <= old.cells {
            self.release(old.base + cells, old.cells - cells);
            Block {
                base: old.base,
                cells,
            }
        } else if self.take_at(old.end(), cells - old.cells) {
            Block {
                base: old.base,
                cells,
            }
        } else {
            let base = self.take_first_fit(cells).ok_or(RuntimeError::HeapExhausted {
                id,
                requested: cells,
            })?;
            self.release(old.base, old.cells);
            self.by_base.remove(&old.base);
            self.by_base.insert(base, id);
            Block { base, cells }
        };

        if let Some(top) = self.live.get_mut(&id).and_then(|stack| stack.last_mut()) {
            top.block = new;
        }
        trace!(id, from = old.base, to = new.base, cells, "heap realloc");
        Ok(Relocation { old, new })
    }

    /// Release the innermost block of `id`.
    pub fn free(&mut self, id: HeapId) -> Result<Block> {
        let stack = self
            .live
            .get_mut(&id)
            .ok_or(RuntimeError::UnknownHeapId(id))?;
        let Owned { block, .. } = stack.pop().ok_or(RuntimeError::UnknownHeapId(id))?;
        if stack.is_empty() {
            self.live.remove(&id);
        }
        self.by_base.remove(&block.base);
        self.release(block.base, block.cells);
        trace!(id, base = block.base, "heap free");
        Ok(block)
    }

    /// Release every block allocated by the frame at `owner`.
    pub fn release_frame(&mut self, owner: usize) -> usize {
        let mut dropped = Vec::new();
        self.live.retain(|&id, stack| {
            stack.retain(|entry| {
                let keep = entry.owner != owner;
                if !keep {
                    dropped.push((id, entry.block));
                }
                keep
            });
            !stack.is_empty()
        });

        for &(id, block) in &dropped {
            self.by_base.remove(&block.base);
            self.release(block.base, block.cells);
            trace!(id, base = block.base, owner, "heap release");
        }
        dropped.len()
    }

    /// The innermost live block of `id`.
    pub fn lookup(&self, id: HeapId) -> Result<Block> {
        self.top(id)
            .map(|top| top.block)
            .ok_or(RuntimeError::UnknownHeapId(id))
    }

    /// The live block of `id` whose base is exactly `base`.
    ///
    /// An address left over from a freed block faults, even once its cells
    /// have been handed to another allocation.
    pub fn block_at(&self, id: HeapId, base: usize) -> Result<Block> {
        if self.by_base.get(&base) != Some(&id) {
            return Err(RuntimeError::DanglingAddress(base));
        }
        self.live
            .get(&id)
            .and_then(|stack| stack.iter().find(|entry| entry.block.base == base))
            .map(|entry| entry.block)
            .ok_or(RuntimeError::DanglingAddress(base))
    }

    fn top(&self, id: HeapId) -> Option<Owned> {
        self.live.get(&id).and_then(|stack| stack.last()).copied()
    }

    fn take_first_fit(&mut self, cells: usize) -> Option<usize> {
        let slot = self.free.iter().position(|&(_, len)| len >= cells)?;
        let (base, len) = self.free[slot];
        if len == cells {
            self.free.remove(slot);
        } else {
            self.free[slot] = (base + cells, len - cells);
        }
        Some(base)
    }

    /// Claim exactly `base..base + cells` if it lies inside one free hole.
    fn take_at(&mut self, base: usize, cells: usize) -> bool {
        let Some(slot) = self
            .free
            .iter()
            .position(|&(start, len)| start <= base && base + cells <= start + len)
        else {
            return false;
        };

        let (start, len) = self.free[slot];
        let mut pieces = Vec::with_capacity(2);
        if base > start {
            pieces.push((start, base - start));
        }
        if base + cells < start + len {
            pieces.push((base + cells, start + len - base - cells));
        }
        self.free.splice(slot..slot + 1, pieces);
        true
    }

    fn release(&mut self, base: usize, cells: usize) {
        if cells == 0 {
            return;
        }

        let at = self.free.partition_point(|&(start, _)| start < base);
        self.free.insert(at, (base, cells));

        // merge with the following hole, then with the preceding one
        if at + 1 < self.free.len() && self.free[at].0 + self.free[at].1 == self.free[at + 1].0 {
            self.free[at].1 += self.free[at + 1].1;
            self.free.remove(at + 1);
        }
        if at > 0 && self.free[at - 1].0 + self.free[at - 1].1 == self.free[at].0 {
            self.free[at - 1].1 += self.free[at].1;
            self.free.remove(at);
        }
    }
}
