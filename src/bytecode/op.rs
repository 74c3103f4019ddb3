use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lang::HeapId;

// =============================================================================
// OPCODE - the closed instruction set
// =============================================================================

/// Opcode values as stored in the program image.
///
/// Every instruction is one opcode cell followed by `arity()` operand cells;
/// the operand count at any offset is decided by the opcode alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpCode {
    Halt = 0,
    Push,
    Pop,
    Dup,
    Swap,

    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Neg,
    Inc,
    Dec,

    Not,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    Jmp,
    Jif,

    Lod,
    Sto,
    Ldx,
    Stx,
    Alod,
    Asto,
    Size,
    Asize,
    Glob,
    Bnd,

    Hlod,
    Hsto,
    Halod,
    Hasto,
    Hsize,
    Hasize,
    Alloc,
    Realloc,
    Free,

    Frame,
    Enter,
    Call,
    Ret,

    Mark,
    Sys,
}

impl OpCode {
    pub const ALL: [OpCode; 50] = [
        OpCode::Halt,
        OpCode::Push,
        OpCode::Pop,
        OpCode::Dup,
        OpCode::Swap,
        OpCode::Add,
        OpCode::Sub,
        OpCode::Mul,
        OpCode::Div,
        OpCode::IDiv,
        OpCode::Mod,
        OpCode::Neg,
        OpCode::Inc,
        OpCode::Dec,
        OpCode::Not,
        OpCode::And,
        OpCode::Or,
        OpCode::Eq,
        OpCode::Ne,
        OpCode::Lt,
        OpCode::Le,
        OpCode::Gt,
        OpCode::Ge,
        OpCode::Jmp,
        OpCode::Jif,
        OpCode::Lod,
        OpCode::Sto,
        OpCode::Ldx,
        OpCode::Stx,
        OpCode::Alod,
        OpCode::Asto,
        OpCode::Size,
        OpCode::Asize,
        OpCode::Glob,
        OpCode::Bnd,
        OpCode::Hlod,
        OpCode::Hsto,
        OpCode::Halod,
        OpCode::Hasto,
        OpCode::Hsize,
        OpCode::Hasize,
        OpCode::Alloc,
        OpCode::Realloc,
        OpCode::Free,
        OpCode::Frame,
        OpCode::Enter,
        OpCode::Call,
        OpCode::Ret,
        OpCode::Mark,
        OpCode::Sys,
    ];

    /// Number of operand cells following the opcode.
    pub fn arity(self) -> usize {
        use OpCode::*;
        match self {
            Alod | Asto => 2,

            Push | Jmp | Jif | Lod | Sto | Ldx | Stx | Size | Asize | Bnd | Hlod | Hsto
            | Halod | Hasto | Hsize | Hasize | Alloc | Realloc | Free | Frame | Enter | Call
            | Sys => 1,

            _ => 0,
        }
    }

    /// Mnemonic used by the textual bytecode form.
    pub fn name(self) -> &'static str {
        use OpCode::*;
        match self {
            Halt => "HALT",
            Push => "PUSH",
            Pop => "POP",
            Dup => "DUP",
            Swap => "SWAP",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Div => "DIV",
            IDiv => "IDIV",
            Mod => "MOD",
            Neg => "NEG",
            Inc => "INC",
            Dec => "DEC",
            Not => "NOT",
            And => "AND",
            Or => "OR",
            Eq => "EQ",
            Ne => "NE",
            Lt => "LT",
            Le => "LE",
            Gt => "GT",
            Ge => "GE",
            Jmp => "JMP",
            Jif => "JIF",
            Lod => "LOD",
            Sto => "STO",
            Ldx => "LDX",
            Stx => "STX",
            Alod => "ALOD",
            Asto => "ASTO",
            Size => "SIZE",
            Asize => "ASIZE",
            Glob => "GLOB",
            Bnd => "BND",
            Hlod => "HLOD",
            Hsto => "HSTO",
            Halod => "HALOD",
            Hasto => "HASTO",
            Hsize => "HSIZE",
            Hasize => "HASIZE",
            Alloc => "ALLOC",
            Realloc => "REALLOC",
            Free => "FREE",
            Frame => "FRAME",
            Enter => "ENTER",
            Call => "CALL",
            Ret => "RET",
            Mark => "MARK",
            Sys => "SYS",
        }
    }

    /// Case-insensitive lookup by mnemonic.
    pub fn from_name(name: &str) -> Option<OpCode> {
        OpCode::ALL
            .iter()
            .copied()
            .find(|op| op.name().eq_ignore_ascii_case(name))
    }

    /// Decode an opcode cell. Only exact integral values name an opcode.
    pub fn from_cell(cell: f64) -> Option<OpCode> {
        if cell.fract() != 0.0 || cell < 0.0 {
            return None;
        }
        OpCode::ALL.get(cell as usize).copied()
    }

    pub fn to_cell(self) -> f64 {
        self as u8 as f64
    }

    /// Whether the single operand of this opcode is a code address.
    pub fn takes_code_address(self) -> bool {
        matches!(self, OpCode::Jmp | OpCode::Jif | OpCode::Call)
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// OP - a decoded instruction
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    /// ( x -- ) stop, `x` is the program result
    Halt,
    Push(f64),
    Pop,
    Dup,
    Swap,

    // arithmetic: right operand is on top
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Neg,
    Inc,
    Dec,

    // logic and comparison, results are 1.0 / 0.0
    Not,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    /// Jump to a code address.
    Jmp(usize),
    /// ( cond -- ) jump when `cond` is nonzero.
    Jif(usize),

    /// ( -- x ) load frame (or global) cell.
    Lod(usize),
    /// ( x -- ) store frame (or global) cell.
    Sto(usize),
    /// ( offset -- x ) load cell at `address + offset`.
    Ldx(usize),
    /// ( offset x -- ) store cell at `address + offset`.
    Stx(usize),
    /// ( -- cells... header ) push `span + 1` cells, header on top.
    Alod(usize, usize),
    /// ( cells... header -- ) inverse of `Alod`.
    Asto(usize, usize),
    /// ( -- n ) count stored in the header at `address`.
    Size(usize),
    /// ( offset -- n ) count stored in the header at `address + offset`.
    Asize(usize),
    /// Next load/store addresses the global frame; a following `ALLOC` is
    /// owned by it.
    Glob,
    /// ( i -- i ) fault unless `0 <= i < n`.
    Bnd(usize),

    /// ( addr i -- x ) faults unless `addr` is the base of a live block of `id`.
    Hlod(HeapId),
    /// ( addr i x -- )
    Hsto(HeapId),
    /// ( addr -- cells... n )
    Halod(HeapId),
    /// ( cells... n addr -- )
    Hasto(HeapId),
    /// ( -- n ) element count of allocation `id`.
    Hsize(HeapId),
    /// ( offset -- n ) cell `offset` past the base of allocation `id`.
    Hasize(HeapId),
    /// ( n -- addr )
    Alloc(HeapId),
    /// ( n -- addr )
    Realloc(HeapId),
    Free(HeapId),

    /// Reserve `n` locals for the next call.
    Frame(usize),
    /// Grow the active frame to `n` locals.
    Enter(usize),
    Call(usize),
    Ret,

    /// Record the native argument-scan boundary.
    Mark,
    /// Invoke native function `id` from the link table.
    Sys(usize),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("invalid opcode {value} at {at}")]
    UnknownOpcode { value: f64, at: usize },

    #[error("{op} at {at} is missing operands")]
    Truncated { op: OpCode, at: usize },

    #[error("{op} expects a non-negative integer operand, got {value}")]
    BadOperand { op: OpCode, value: f64 },
}

impl Op {
    pub fn opcode(&self) -> OpCode {
        match self {
            Op::Halt => OpCode::Halt,
            Op::Push(_) => OpCode::Push,
            Op::Pop => OpCode::Pop,
            Op::Dup => OpCode::Dup,
            Op::Swap => OpCode::Swap,
            Op::Add => OpCode::Add,
            Op::Sub => OpCode::Sub,
            Op::Mul => OpCode::Mul,
            Op::Div => OpCode::Div,
            Op::IDiv => OpCode::IDiv,
            Op::Mod => OpCode::Mod,
            Op::Neg => OpCode::Neg,
            Op::Inc => OpCode::Inc,
            Op::Dec => OpCode::Dec,
            Op::Not => OpCode::Not,
            Op::And => OpCode::And,
            Op::Or => OpCode::Or,
            Op::Eq => OpCode::Eq,
            Op::Ne => OpCode::Ne,
            Op::Lt => OpCode::Lt,
            Op::Le => OpCode::Le,
            Op::Gt => OpCode::Gt,
            Op::Ge => OpCode::Ge,
            Op::Jmp(_) => OpCode::Jmp,
            Op::Jif(_) => OpCode::Jif,
            Op::Lod(_) => OpCode::Lod,
            Op::Sto(_) => OpCode::Sto,
            Op::Ldx(_) => OpCode::Ldx,
            Op::Stx(_) => OpCode::Stx,
            Op::Alod(..) => OpCode::Alod,
            Op::Asto(..) => OpCode::Asto,
            Op::Size(_) => OpCode::Size,
            Op::Asize(_) => OpCode::Asize,
            Op::Glob => OpCode::Glob,
            Op::Bnd(_) => OpCode::Bnd,
            Op::Hlod(_) => OpCode::Hlod,
            Op::Hsto(_) => OpCode::Hsto,
            Op::Halod(_) => OpCode::Halod,
            Op::Hasto(_) => OpCode::Hasto,
            Op::Hsize(_) => OpCode::Hsize,
            Op::Hasize(_) => OpCode::Hasize,
            Op::Alloc(_) => OpCode::Alloc,
            Op::Realloc(_) => OpCode::Realloc,
            Op::Free(_) => OpCode::Free,
            Op::Frame(_) => OpCode::Frame,
            Op::Enter(_) => OpCode::Enter,
            Op::Call(_) => OpCode::Call,
            Op::Ret => OpCode::Ret,
            Op::Mark => OpCode::Mark,
            Op::Sys(_) => OpCode::Sys,
        }
    }

    /// Encoded size in cells.
    pub fn width(&self) -> usize {
        1 + self.opcode().arity()
    }

    /// Operand cells in encoding order.
    pub fn operands(&self) -> Vec<f64> {
        match *self {
            Op::Push(v) => vec![v],

            Op::Jmp(n)
            | Op::Jif(n)
            | Op::Lod(n)
            | Op::Sto(n)
            | Op::Ldx(n)
            | Op::Stx(n)
            | Op::Size(n)
            | Op::Asize(n)
            | Op::Bnd(n)
            | Op::Hlod(n)
            | Op::Hsto(n)
            | Op::Halod(n)
            | Op::Hasto(n)
            | Op::Hsize(n)
            | Op::Hasize(n)
            | Op::Alloc(n)
            | Op::Realloc(n)
            | Op::Free(n)
            | Op::Frame(n)
            | Op::Enter(n)
            | Op::Call(n)
            | Op::Sys(n) => vec![n as f64],

            Op::Alod(a, s) | Op::Asto(a, s) => vec![a as f64, s as f64],

            _ => Vec::new(),
        }
    }

    pub fn encode(&self, out: &mut Vec<f64>) {
        out.push(self.opcode().to_cell());
        out.extend(self.operands());
    }

    /// Rebuild an instruction from its opcode and exactly `arity` operands.
    pub fn from_parts(op: OpCode, operands: &[f64]) -> Result<Op, DecodeError> {
        let int = |i: usize| -> Result<usize, DecodeError> {
            let value = operands.get(i).copied().unwrap_or(f64::NAN);
            if value.is_finite() && value >= 0.0 && value.fract() == 0.0 {
                Ok(value as usize)
            } else {
                Err(DecodeError::BadOperand { op, value })
            }
        };

        Ok(match op {
            OpCode::Halt => Op::Halt,
            OpCode::Push => Op::Push(operands.first().copied().unwrap_or(f64::NAN)),
            OpCode::Pop => Op::Pop,
            OpCode::Dup => Op::Dup,
            OpCode::Swap => Op::Swap,
            OpCode::Add => Op::Add,
            OpCode::Sub => Op::Sub,
            OpCode::Mul => Op::Mul,
            OpCode::Div => Op::Div,
            OpCode::IDiv => Op::IDiv,
            OpCode::Mod => Op::Mod,
            OpCode::Neg => Op::Neg,
            OpCode::Inc => Op::Inc,
            OpCode::Dec => Op::Dec,
            OpCode::Not => Op::Not,
            OpCode::And => Op::And,
            OpCode::Or => Op::Or,
            OpCode::Eq => Op::Eq,
            OpCode::Ne => Op::Ne,
            OpCode::Lt => Op::Lt,
            OpCode::Le => Op::Le,
            OpCode::Gt => Op::Gt,
            OpCode::Ge => Op::Ge,
            OpCode::Jmp => Op::Jmp(int(0)?),
            OpCode::Jif => Op::Jif(int(0)?),
            OpCode::Lod => Op::Lod(int(0)?),
            OpCode::Sto => Op::Sto(int(0)?),
            OpCode::Ldx => Op::Ldx(int(0)?),
            OpCode::Stx => Op::Stx(int(0)?),
            OpCode::Alod => Op::Alod(int(0)?, int(1)?),
            OpCode::Asto => Op::Asto(int(0)?, int(1)?),
            OpCode::Size => Op::Size(int(0)?),
            OpCode::Asize => Op::Asize(int(0)?),
            OpCode::Glob => Op::Glob,
            OpCode::Bnd => Op::Bnd(int(0)?),
            OpCode::Hlod => Op::Hlod(int(0)?),
            OpCode::Hsto => Op::Hsto(int(0)?),
            OpCode::Halod => Op::Halod(int(0)?),
            OpCode::Hasto => Op::Hasto(int(0)?),
            OpCode::Hsize => Op::Hsize(int(0)?),
            OpCode::Hasize => Op::Hasize(int(0)?),
            OpCode::Alloc => Op::Alloc(int(0)?),
            OpCode::Realloc => Op::Realloc(int(0)?),
            OpCode::Free => Op::Free(int(0)?),
            OpCode::Frame => Op::Frame(int(0)?),
            OpCode::Enter => Op::Enter(int(0)?),
            OpCode::Call => Op::Call(int(0)?),
            OpCode::Ret => Op::Ret,
            OpCode::Mark => Op::Mark,
            OpCode::Sys => Op::Sys(int(0)?),
        })
    }

    /// Decode the instruction starting at `at`.
    pub fn decode(cells: &[f64], at: usize) -> Result<Op, DecodeError> {
        let value = cells.get(at).copied().unwrap_or(f64::NAN);
        let op = OpCode::from_cell(value).ok_or(DecodeError::UnknownOpcode { value, at })?;
        let end = at + 1 + op.arity();
        if end > cells.len() {
            return Err(DecodeError::Truncated { op, at });
        }
        Op::from_parts(op, &cells[at + 1..end])
    }

    /// Code address carried by jumps and calls.
    pub fn target(&self) -> Option<usize> {
        match *self {
            Op::Jmp(t) | Op::Jif(t) | Op::Call(t) => Some(t),
            _ => None,
        }
    }

    /// Returns (pops, pushes) for an op, or None if the effect is dynamic.
    pub fn stack_effect(&self) -> Option<(usize, usize)> {
        use Op::*;
        Some(match *self {
            Halt => (1, 0),
            Push(_) => (0, 1),
            Pop => (1, 0),
            Dup => (1, 2),
            Swap => (2, 2),

            Add | Sub | Mul | Div | IDiv | Mod => (2, 1),
            Neg | Inc | Dec | Not => (1, 1),
            And | Or | Eq | Ne | Lt | Le | Gt | Ge => (2, 1),

            Jmp(_) => (0, 0),
            Jif(_) => (1, 0),

            Lod(_) => (0, 1),
            Sto(_) => (1, 0),
            Ldx(_) => (1, 1),
            Stx(_) => (2, 0),
            Alod(_, span) => (0, span + 1),
            Asto(_, span) => (span + 1, 0),
            Size(_) => (0, 1),
            Asize(_) => (1, 1),
            Glob => (0, 0),
            Bnd(_) => (1, 1),

            Hlod(_) => (2, 1),
            Hsto(_) => (3, 0),
            Hsize(_) => (0, 1),
            Hasize(_) => (1, 1),
            Alloc(_) | Realloc(_) => (1, 1),
            Free(_) => (0, 0),

            Frame(_) | Enter(_) | Mark => (0, 0),

            // Depends on run-time lengths or on the callee.
            Halod(_) | Hasto(_) | Call(_) | Ret | Sys(_) => return None,
        })
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.opcode())?;
        for operand in self.operands() {
            write!(f, " {}", operand)?;
        }
        Ok(())
    }
}

/// Encode a sequence of instructions into image cells.
pub fn encode_all(ops: &[Op]) -> Vec<f64> {
    let mut cells = Vec::with_capacity(ops.iter().map(Op::width).sum());
    for op in ops {
        op.encode(&mut cells);
    }
    cells
}

/// Decode a whole code segment, pairing every instruction with its address.
pub fn decode_all(cells: &[f64]) -> Result<Vec<(usize, Op)>, DecodeError> {
    let mut out = Vec::new();
    let mut at = 0;
    while at < cells.len() {
        let op = Op::decode(cells, at)?;
        out.push((at, op));
        at += op.width();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_table_is_dense() {
        for (i, op) in OpCode::ALL.iter().enumerate() {
            assert_eq!(*op as usize, i, "{} out of place", op);
            assert_eq!(OpCode::from_cell(i as f64), Some(*op));
        }
        assert_eq!(OpCode::from_cell(OpCode::ALL.len() as f64), None);
        assert_eq!(OpCode::from_cell(1.5), None);
    }

    #[test]
    fn test_from_name_is_case_insensitive() {
        assert_eq!(OpCode::from_name("push"), Some(OpCode::Push));
        assert_eq!(OpCode::from_name("HaSiZe"), Some(OpCode::Hasize));
        assert_eq!(OpCode::from_name("nope"), None);
    }

    #[test]
    fn test_width_matches_operands() {
        let ops = [
            Op::Halt,
            Op::Push(1.5),
            Op::Jif(7),
            Op::Alod(2, 8),
            Op::Sys(3),
            Op::Hasto(2),
        ];
        for op in ops {
            assert_eq!(op.width(), 1 + op.operands().len(), "{}", op);
        }
    }

    #[test]
    fn test_encode_layout() {
        let cells = encode_all(&[Op::Push(5.0), Op::Push(3.0), Op::Add, Op::Halt]);

        assert_eq!(
            cells,
            vec![
                OpCode::Push.to_cell(),
                5.0,
                OpCode::Push.to_cell(),
                3.0,
                OpCode::Add.to_cell(),
                OpCode::Halt.to_cell(),
            ]
        );
    }

    #[test]
    fn test_decode_all_reports_addresses() {
        let cells = encode_all(&[Op::Push(1.0), Op::Jmp(0), Op::Asto(4, 3), Op::Ret]);
        let decoded = decode_all(&cells).unwrap();

        let addresses: Vec<usize> = decoded.iter().map(|(at, _)| *at).collect();
        assert_eq!(addresses, vec![0, 2, 4, 7]);
        assert_eq!(decoded[2].1, Op::Asto(4, 3));
    }

    #[test]
    fn test_decode_truncated() {
        let cells = vec![OpCode::Alod.to_cell(), 1.0];
        let err = Op::decode(&cells, 0).unwrap_err();

        assert!(matches!(err, DecodeError::Truncated { op: OpCode::Alod, at: 0 }));
    }

    #[test]
    fn test_decode_rejects_fractional_address() {
        let cells = vec![OpCode::Jmp.to_cell(), 2.5];
        let err = Op::decode(&cells, 0).unwrap_err();

        assert!(err.to_string().contains("JMP"));
    }

    #[test]
    fn test_push_keeps_any_value() {
        let cells = vec![OpCode::Push.to_cell(), -0.25];
        assert_eq!(Op::decode(&cells, 0).unwrap(), Op::Push(-0.25));
    }

    #[test]
    fn test_stack_effect_of_array_moves() {
        assert_eq!(Op::Alod(0, 3).stack_effect(), Some((0, 4)));
        assert_eq!(Op::Asto(0, 3).stack_effect(), Some((4, 0)));
        assert_eq!(Op::Call(0).stack_effect(), None);
    }
}
