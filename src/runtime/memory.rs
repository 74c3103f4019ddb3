//! Flat machine memory and its region layout.
//!
//! ```text
//!   0            code_len      stack_origin    heap_origin       capacity
//!   | code ...   | call region | operand stack | heap ...        |
//!                  ^ frames: [ret, saved fp, locals...] grow upward
//! ```

use crate::runtime::runtime_error::{Result, RuntimeError};

/// Region boundaries, fixed when a program is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Layout {
    pub code_len: usize,
    pub call_origin: usize,
    pub stack_origin: usize,
    pub heap_origin: usize,
    pub capacity: usize,
}

impl Layout {
    /// Partition `capacity` cells: code, then `call_cells`, then
    /// `stack_cells`, the heap taking whatever is left.
    pub fn new(
        code_len: usize,
        call_cells: usize,
        stack_cells: usize,
        capacity: usize,
    ) -> Result<Self> {
        let call_origin = code_len;
        let stack_origin = call_origin + call_cells;
        let heap_origin = stack_origin + stack_cells;

        // The outermost frame needs its two-cell return record.
        if call_cells < 2 {
            return Err(RuntimeError::Config(format!(
                "call region of {} cells is too small",
                call_cells
            )));
        }
        if heap_origin > capacity {
            return Err(RuntimeError::Config(format!(
                "{} cells of code, call and stack do not fit in a memory of {} cells",
                heap_origin, capacity
            )));
        }

        Ok(Self {
            code_len,
            call_origin,
            stack_origin,
            heap_origin,
            capacity,
        })
    }

    pub fn heap_cells(&self) -> usize {
        self.capacity - self.heap_origin
    }
}

/// Machine cursors. Every one of them is an absolute cell address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Registers {
    /// Instruction pointer.
    pub ip: usize,
    /// Next free operand stack cell.
    pub sp: usize,
    /// Base of the active frame's locals.
    pub fp: usize,
    /// Next free call region cell, one past the active frame.
    pub cp: usize,
    /// Base of the global (outermost) frame.
    pub gp: usize,
}

/// One contiguous, zero-initialized array of cells.
///
/// All reads and writes go through [`Memory::load`] and [`Memory::store`],
/// which are the only places that check addresses against the capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct Memory {
    cells: Vec<f64>,
}

impl Memory {
    pub fn new(capacity: usize) -> Self {
        Self {
            cells: vec![0.0; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    fn check(&self, address: usize, len: usize) -> Result<()> {
        match address.checked_add(len) {
            Some(end) if end <= self.cells.len() => Ok(()),
            _ => Err(RuntimeError::OutOfBounds {
                address: address.saturating_add(len.saturating_sub(1)),
                limit: self.cells.len(),
            }),
        }
    }

    pub fn load(&self, address: usize) -> Result<f64> {
        self.check(address, 1)?;
        Ok(self.cells[address])
    }

    pub fn store(&mut self, address: usize, value: f64) -> Result<()> {
        self.check(address, 1)?;
        self.cells[address] = value;
        Ok(())
    }

    pub fn slice(&self, address: usize, len: usize) -> Result<&[f64]> {
        self.check(address, len)?;
        Ok(&self.cells[address..address + len])
    }

    pub fn write(&mut self, address: usize, values: &[f64]) -> Result<()> {
        self.check(address, values.len())?;
        self.cells[address..address + values.len()].copy_from_slice(values);
        Ok(())
    }

    pub fn fill(&mut self, address: usize, len: usize, value: f64) -> Result<()> {
        self.check(address, len)?;
        self.cells[address..address + len].fill(value);
        Ok(())
    }

    /// Copy `len` cells from `from` to `to`; the ranges may overlap.
    pub fn copy_within(&mut self, from: usize, to: usize, len: usize) -> Result<()> {
        self.check(from, len)?;
        self.check(to, len)?;
        self.cells.copy_within(from..from + len, to);
        Ok(())
    }
}

/// Convert a cell value used as an address or count.
pub fn to_index(value: f64) -> Result<usize> {
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value <= usize::MAX as f64 {
        Ok(value as usize)
    } else {
        Err(RuntimeError::InvalidAddress(value))
    }
}
