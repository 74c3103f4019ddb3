use tracing::{debug, trace};

use crate::bytecode::image::ProgramImage;
use crate::bytecode::op::Op;
use crate::lang::HeapId;
use crate::runtime::allocator::{Allocator, Block};
use crate::runtime::linker::{LinkTable, MachineView, NativeArg};
use crate::runtime::memory::{Layout, Memory, Registers, to_index};
use crate::runtime::runtime_error::{Result, RuntimeError, Trap};

/// Return address written below the outermost frame. `RET` reaching it ends
/// the program.
pub const SENTINEL_RETURN: f64 = -1.0;

/// Cells of bookkeeping at the base of every frame: return address and the
/// caller's frame pointer.
pub const FRAME_HEADER: usize = 2;

#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Total memory in cells, code included.
    pub capacity: usize,
    /// Cells reserved for call records and frame locals.
    pub call_cells: usize,
    /// Cells reserved for the operand stack.
    pub stack_cells: usize,
    /// Nested calls allowed before faulting.
    pub max_call_depth: usize,
    /// Instruction budget; `None` runs until the program stops.
    pub max_steps: Option<usize>,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            capacity: 1 << 16,
            call_cells: 8192,
            stack_cells: 8192,
            max_call_depth: 1000,
            max_steps: None,
        }
    }
}

/// The virtual CPU. Owns its memory, heap table and link table, so separate
/// instances never share state.
pub struct Vm {
    config: VmConfig,
    memory: Memory,
    layout: Layout,
    regs: Registers,
    allocator: Allocator,
    links: LinkTable,

    /// Set by `GLOB`, consumed by the next load, store or `ALLOC`.
    global_next: bool,
    /// One past the last cell of the global frame, as sized by `ENTER`.
    global_end: usize,
    /// Frame size announced by `FRAME` for the next `CALL`.
    pending_frame: usize,
    /// Operand stack heights recorded by `MARK`.
    marks: Vec<usize>,

    depth: usize,
    steps: usize,
    loaded: bool,
    result: Option<f64>,
}

impl Vm {
    pub fn new(links: LinkTable) -> Self {
        Self::with_config(VmConfig::default(), links)
    }

    pub fn with_config(config: VmConfig, links: LinkTable) -> Self {
        Self {
            config,
            memory: Memory::new(0),
            layout: Layout::default(),
            regs: Registers::default(),
            allocator: Allocator::new(0, 0),
            links,
            global_next: false,
            global_end: 0,
            pending_frame: 0,
            marks: Vec::new(),
            depth: 0,
            steps: 0,
            loaded: false,
            result: None,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn registers(&self) -> Registers {
        self.regs
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn links_mut(&mut self) -> &mut LinkTable {
        &mut self.links
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Live operand stack, bottom first.
    pub fn stack(&self) -> &[f64] {
        let len = self.regs.sp.saturating_sub(self.layout.stack_origin);
        self.memory
            .slice(self.layout.stack_origin, len)
            .unwrap_or(&[])
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Reset every cursor and load `image` at address 0.
    ///
    /// The outermost frame starts empty on top of a sentinel return record;
    /// compiled programs size it with `ENTER`.
    pub fn initialize(&mut self, image: &ProgramImage) -> Result<()> {
        let layout = Layout::new(
            image.len(),
            self.config.call_cells,
            self.config.stack_cells,
            self.config.capacity,
        )?;

        let mut memory = Memory::new(layout.capacity);
        memory.write(0, &image.cells)?;
        memory.store(layout.call_origin, SENTINEL_RETURN)?;
        memory.store(layout.call_origin + 1, 0.0)?;

        let fp = layout.call_origin + FRAME_HEADER;
        self.regs = Registers {
            ip: 0,
            sp: layout.stack_origin,
            fp,
            cp: fp,
            gp: fp,
        };
        self.memory = memory;
        self.layout = layout;
        self.allocator = Allocator::new(layout.heap_origin, layout.capacity);
        self.global_next = false;
        self.global_end = fp;
        self.pending_frame = 0;
        self.marks.clear();
        self.depth = 0;
        self.steps = 0;
        self.loaded = true;
        self.result = None;

        debug!(
            code = layout.code_len,
            call = layout.call_origin,
            stack = layout.stack_origin,
            heap = layout.heap_origin,
            capacity = layout.capacity,
            "program loaded"
        );
        Ok(())
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Run until `HALT` or the outermost `RET`, returning the program result.
    pub fn run(&mut self) -> std::result::Result<f64, Trap> {
        loop {
            let ip = self.regs.ip;
            match self.step() {
                Ok(Some(result)) => return Ok(result),
                Ok(None) => {}
                Err(error) => {
                    debug!(ip, %error, "fault");
                    return Err(Trap { ip, error });
                }
            }
        }
    }

    /// Execute one instruction. Returns the result once the program stops.
    pub fn step(&mut self) -> Result<Option<f64>> {
        if !self.loaded {
            return Err(RuntimeError::NotInitialized);
        }
        if let Some(result) = self.result {
            return Ok(Some(result));
        }

        if let Some(max) = self.config.max_steps {
            if self.steps >= max {
                return Err(RuntimeError::StepLimit(max));
            }
        }
        self.steps += 1;

        let op = self.fetch()?;
        trace!(ip = self.regs.ip, %op, sp = self.regs.sp, "exec");
        self.regs.ip += op.width();

        let finished = self.execute(op)?;
        if let Some(result) = finished {
            debug!(result, steps = self.steps, "program finished");
            self.result = Some(result);
        }
        Ok(finished)
    }

    fn fetch(&self) -> Result<Op> {
        let ip = self.regs.ip;
        let len = self.layout.code_len;
        if ip >= len {
            return Err(RuntimeError::OutOfCode { ip, len });
        }
        let code = self.memory.slice(0, len)?;
        Ok(Op::decode(code, ip)?)
    }

    fn execute(&mut self, op: Op) -> Result<Option<f64>> {
        match op {
            Op::Halt => return Ok(Some(self.pop()?)),

            Op::Push(v) => self.push(v)?,
            Op::Pop => {
                self.pop()?;
            }
            Op::Dup => {
                let a = self.pop()?;
                self.push(a)?;
                self.push(a)?;
            }
            Op::Swap => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b)?;
                self.push(a)?;
            }

            // Arithmetic
            Op::Add => self.binary(|a, b| a + b)?,
            Op::Sub => self.binary(|a, b| a - b)?,
            Op::Mul => self.binary(|a, b| a * b)?,
            Op::Div => self.binary(|a, b| a / b)?,
            Op::Mod => self.binary(|a, b| a % b)?,
            Op::IDiv => {
                let b = self.pop()?.trunc();
                let a = self.pop()?.trunc();
                if b == 0.0 {
                    return Err(RuntimeError::DivisionByZero);
                }
                self.push((a / b).trunc())?;
            }
            Op::Neg => self.unary(|a| -a)?,
            Op::Inc => self.unary(|a| a + 1.0)?,
            Op::Dec => self.unary(|a| a - 1.0)?,

            // Logic and comparison
            Op::Not => self.unary(|a| flag(a == 0.0))?,
            Op::And => self.binary(|a, b| flag(a != 0.0 && b != 0.0))?,
            Op::Or => self.binary(|a, b| flag(a != 0.0 || b != 0.0))?,
            Op::Eq => self.binary(|a, b| flag(a == b))?,
            Op::Ne => self.binary(|a, b| flag(a != b))?,
            Op::Lt => self.binary(|a, b| flag(a < b))?,
            Op::Le => self.binary(|a, b| flag(a <= b))?,
            Op::Gt => self.binary(|a, b| flag(a > b))?,
            Op::Ge => self.binary(|a, b| flag(a >= b))?,

            // Control transfer
            Op::Jmp(target) => self.regs.ip = target,
            Op::Jif(target) => {
                if self.pop()? != 0.0 {
                    self.regs.ip = target;
                }
            }

            // Frame and global addressing
            Op::Lod(address) => {
                let at = self.frame_address(address, 0, 1)?;
                let v = self.memory.load(at)?;
                self.push(v)?;
            }
            Op::Sto(address) => {
                let v = self.pop()?;
                let at = self.frame_address(address, 0, 1)?;
                self.memory.store(at, v)?;
            }
            Op::Ldx(address) => {
                let offset = self.pop_index()?;
                let at = self.frame_address(address, offset, 1)?;
                let v = self.memory.load(at)?;
                self.push(v)?;
            }
            Op::Stx(address) => {
                let v = self.pop()?;
                let offset = self.pop_index()?;
                let at = self.frame_address(address, offset, 1)?;
                self.memory.store(at, v)?;
            }
            Op::Alod(address, span) => {
                let at = self.frame_address(address, 0, span + 1)?;
                for i in (0..=span).rev() {
                    let v = self.memory.load(at + i)?;
                    self.push(v)?;
                }
            }
            Op::Asto(address, span) => {
                let at = self.frame_address(address, 0, span + 1)?;
                for i in 0..=span {
                    let v = self.pop()?;
                    self.memory.store(at + i, v)?;
                }
            }
            Op::Size(address) => {
                let at = self.frame_address(address, 0, 1)?;
                let v = self.memory.load(at)?;
                self.push(v)?;
            }
            Op::Asize(address) => {
                let offset = self.pop_index()?;
                let at = self.frame_address(address, offset, 1)?;
                let v = self.memory.load(at)?;
                self.push(v)?;
            }
            Op::Glob => self.global_next = true,
            Op::Bnd(len) => {
                let index = self.pop()?;
                check_index(index, len)?;
                self.push(index)?;
            }

            // Heap
            Op::Hlod(id) => {
                let index = self.pop()?;
                let base = self.pop_index()?;
                let at = self.heap_element(id, base, index)?;
                let v = self.memory.load(at)?;
                self.push(v)?;
            }
            Op::Hsto(id) => {
                let v = self.pop()?;
                let index = self.pop()?;
                let base = self.pop_index()?;
                let at = self.heap_element(id, base, index)?;
                self.memory.store(at, v)?;
            }
            Op::Halod(id) => {
                let base = self.pop_index()?;
                self.allocator.block_at(id, base)?;
                let count = to_index(self.memory.load(base)?)?;
                for i in (0..=count).rev() {
                    let v = self.memory.load(base + i)?;
                    self.push(v)?;
                }
            }
            Op::Hasto(id) => {
                let base = self.pop_index()?;
                let block = self.allocator.block_at(id, base)?;
                let count = self.pop_index()?;
                if count > block.elements() {
                    return Err(RuntimeError::HeapCapacity {
                        id,
                        count,
                        capacity: block.elements(),
                    });
                }
                self.memory.store(base, count as f64)?;
                for i in 1..=count {
                    let v = self.pop()?;
                    self.memory.store(base + i, v)?;
                }
            }
            Op::Hsize(id) => {
                let block = self.allocator.lookup(id)?;
                let v = self.memory.load(block.base)?;
                self.push(v)?;
            }
            Op::Hasize(id) => {
                let offset = self.pop()?;
                let block = self.allocator.lookup(id)?;
                check_index(offset, block.cells)?;
                let v = self.memory.load(block.base + offset as usize)?;
                self.push(v)?;
            }
            Op::Alloc(id) => {
                let size = self.pop_index()?;
                let owner = if std::mem::take(&mut self.global_next) {
                    self.regs.gp
                } else {
                    self.regs.fp
                };
                let block = self.allocator.alloc(id, owner, size)?;
                self.memory.fill(block.base, block.cells, 0.0)?;
                self.memory.store(block.base, size as f64)?;
                self.push(block.base as f64)?;
            }
            Op::Realloc(id) => {
                let size = self.pop_index()?;
                let block = self.resize(id, size)?;
                self.push(block.base as f64)?;
            }
            Op::Free(id) => {
                self.allocator.free(id)?;
            }

            // Calls
            Op::Frame(size) => self.pending_frame = size,
            Op::Enter(size) => {
                let cp = self.regs.fp + size;
                if cp > self.layout.stack_origin {
                    return Err(RuntimeError::CallStackOverflow { requested: size });
                }
                if cp > self.regs.cp {
                    self.memory.fill(self.regs.cp, cp - self.regs.cp, 0.0)?;
                }
                self.regs.cp = cp;
                if self.regs.fp == self.regs.gp {
                    self.global_end = cp;
                }
            }
            Op::Call(target) => self.call(target)?,
            Op::Ret => {
                let ret = self.memory.load(self.regs.fp - FRAME_HEADER)?;
                if ret < 0.0 {
                    return Ok(Some(self.pop()?));
                }
                let saved_fp = to_index(self.memory.load(self.regs.fp - 1)?)?;
                self.allocator.release_frame(self.regs.fp);
                self.regs.cp = self.regs.fp - FRAME_HEADER;
                self.regs.fp = saved_fp;
                self.regs.ip = to_index(ret)?;
                self.depth = self.depth.saturating_sub(1);
            }

            // Natives
            Op::Mark => self.marks.push(self.regs.sp),
            Op::Sys(id) => self.call_native(id)?,
        }

        Ok(None)
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn call(&mut self, target: usize) -> Result<()> {
        let size = std::mem::take(&mut self.pending_frame);
        if self.depth >= self.config.max_call_depth {
            return Err(RuntimeError::CallDepth(self.config.max_call_depth));
        }
        let record = self.regs.cp;
        let fp = record + FRAME_HEADER;
        if fp + size > self.layout.stack_origin {
            return Err(RuntimeError::CallStackOverflow {
                requested: FRAME_HEADER + size,
            });
        }

        self.memory.store(record, self.regs.ip as f64)?;
        self.memory.store(record + 1, self.regs.fp as f64)?;
        self.memory.fill(fp, size, 0.0)?;

        self.regs.fp = fp;
        self.regs.cp = fp + size;
        self.regs.ip = target;
        self.depth += 1;
        trace!(target, depth = self.depth, frame = size, "call");
        Ok(())
    }

    fn call_native(&mut self, id: usize) -> Result<()> {
        let (signature, format) = match self.links.get(id) {
            Some(native) => (native.signature.clone(), native.format.clone()),
            None => return Err(RuntimeError::NativeNotFound(id)),
        };

        let mut args = Vec::with_capacity(format.len());
        for kind in format.chars().rev() {
            args.push(self.pop_native_arg(kind, &signature)?);
        }
        args.reverse();

        if let Some(mark) = self.marks.pop() {
            if mark != self.regs.sp {
                return Err(RuntimeError::native(
                    &signature,
                    format!(
                        "argument boundary mismatch ({} cells left over)",
                        self.regs.sp as isize - mark as isize
                    ),
                ));
            }
        }

        let results = {
            let view = MachineView {
                memory: &self.memory,
                registers: self.regs,
            };
            let native = self
                .links
                .get_mut(id)
                .ok_or(RuntimeError::NativeNotFound(id))?;
            (native.callback)(&view, &args)?
        };

        trace!(signature = %signature, args = args.len(), results = results.len(), "native call");
        for v in results.into_iter().rev() {
            self.push(v)?;
        }
        Ok(())
    }

    fn pop_native_arg(&mut self, kind: char, signature: &str) -> Result<NativeArg> {
        Ok(match kind {
            'b' => NativeArg::Bool(self.pop()? != 0.0),
            'f' => NativeArg::Float(self.pop()?),
            'i' => NativeArg::Int(self.pop()?.trunc() as i64),
            'c' => NativeArg::Char(self.pop_char(signature)?),
            's' => {
                let count = self.pop_index()?;
                let mut s = String::with_capacity(count);
                for _ in 0..count {
                    s.push(self.pop_char(signature)?);
                }
                NativeArg::Str(s)
            }
            other => {
                return Err(RuntimeError::native(
                    signature,
                    format!("unknown argument format '{}'", other),
                ));
            }
        })
    }

    fn pop_char(&mut self, signature: &str) -> Result<char> {
        let v = self.pop()?;
        char::from_u32(v as u32)
            .filter(|_| v >= 0.0 && v.fract() == 0.0)
            .ok_or_else(|| RuntimeError::native(signature, format!("{} is not a char", v)))
    }

    // =========================================================================
    // Addressing
    // =========================================================================

    /// Absolute address of `address + offset` in the active (or, after
    /// `GLOB`, the global) frame, with `len` cells available from there.
    /// The active frame ends at the call pointer, the global one where
    /// `ENTER` left it.
    fn frame_address(&mut self, address: usize, offset: usize, len: usize) -> Result<usize> {
        let (base, limit) = if std::mem::take(&mut self.global_next) {
            (self.regs.gp, self.global_end)
        } else {
            (self.regs.fp, self.regs.cp)
        };
        let at = base
            .checked_add(address)
            .and_then(|a| a.checked_add(offset))
            .ok_or(RuntimeError::InvalidAddress(address as f64))?;
        let last = at + len.max(1) - 1;
        if last >= limit {
            return Err(RuntimeError::OutOfBounds {
                address: last,
                limit,
            });
        }
        Ok(at)
    }

    fn heap_element(&self, id: HeapId, base: usize, index: f64) -> Result<usize> {
        self.allocator.block_at(id, base)?;
        let count = to_index(self.memory.load(base)?)?;
        check_index(index, count)?;
        Ok(base + 1 + index as usize)
    }

    fn resize(&mut self, id: HeapId, size: usize) -> Result<Block> {
        let reloc = self.allocator.realloc(id, size)?;
        let kept = reloc.old.cells.min(reloc.new.cells);
        if reloc.moved() {
            self.memory
                .copy_within(reloc.old.base, reloc.new.base, kept)?;
        }
        self.memory
            .fill(reloc.new.base + kept, reloc.new.cells - kept, 0.0)?;
        self.memory.store(reloc.new.base, size as f64)?;
        Ok(reloc.new)
    }

    // =========================================================================
    // Operand stack
    // =========================================================================

    fn push(&mut self, value: f64) -> Result<()> {
        if self.regs.sp >= self.layout.heap_origin {
            return Err(RuntimeError::StackOverflow {
                limit: self.layout.heap_origin - self.layout.stack_origin,
            });
        }
        self.memory.store(self.regs.sp, value)?;
        self.regs.sp += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<f64> {
        if self.regs.sp <= self.layout.stack_origin {
            return Err(RuntimeError::StackUnderflow);
        }
        self.regs.sp -= 1;
        self.memory.load(self.regs.sp)
    }

    fn pop_index(&mut self) -> Result<usize> {
        to_index(self.pop()?)
    }

    fn unary(&mut self, f: impl FnOnce(f64) -> f64) -> Result<()> {
        let a = self.pop()?;
        self.push(f(a))
    }

    /// Right operand is popped first.
    fn binary(&mut self, f: impl FnOnce(f64, f64) -> f64) -> Result<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        self.push(f(a, b))
    }
}

fn flag(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

fn check_index(index: f64, len: usize) -> Result<()> {
    if index.is_finite() && index >= 0.0 && index.fract() == 0.0 && (index as usize) < len {
        Ok(())
    } else {
        Err(RuntimeError::IndexOutOfRange { index, len })
    }
}
