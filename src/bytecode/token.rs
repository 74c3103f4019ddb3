//! Deferred tokens: instructions whose code address is not known yet.
//!
//! The generator emits jumps and calls before their targets exist. Each
//! enclosing construct resolves the placeholders it owns once its span is
//! known; anything it does not own is passed through untouched so an outer
//! construct (or the final function pass) can pick it up.

use crate::bytecode::op::{Op, OpCode};
use crate::lang::FunctionId;

/// Control-transfer instructions that take a code address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Jmp,
    Jif,
    Call,
}

impl Transfer {
    pub fn opcode(self) -> OpCode {
        match self {
            Transfer::Jmp => OpCode::Jmp,
            Transfer::Jif => OpCode::Jif,
            Transfer::Call => OpCode::Call,
        }
    }

    pub fn to(self, address: usize) -> Op {
        match self {
            Transfer::Jmp => Op::Jmp(address),
            Transfer::Jif => Op::Jif(address),
            Transfer::Call => Op::Call(address),
        }
    }
}

/// What a placeholder is waiting for. Every variant carries a signed offset
/// added to the address once it is known.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// Start of the enclosing construct.
    Start(isize),
    /// Address right after the enclosing construct.
    End(isize),
    /// End of the previous sibling branch chain.
    Last(isize),
    /// Start of the loop labelled `label`.
    LabelStart(String, isize),
    /// End of the loop labelled `label`.
    LabelEnd(String, isize),
    /// Entry point of a function that may not be compiled yet.
    Function(FunctionId, isize),
}

/// Knowledge offered to placeholders by one resolution step.
#[derive(Debug, Clone, Copy)]
pub enum Resolution<'a> {
    /// A construct finished between `start` and `end`.
    Span { start: usize, end: usize },
    /// An `if` chain finished at `end`.
    Last { end: usize },
    /// A loop named `label` finished between `start` and `end`.
    Label {
        label: &'a str,
        start: usize,
        end: usize,
    },
    /// Function `id` has its entry at `entry`.
    Function { id: FunctionId, entry: usize },
}

impl Target {
    /// The concrete address, if `resolution` is the one this target waits for.
    pub fn resolve(&self, resolution: &Resolution<'_>) -> Option<usize> {
        let (base, offset) = match (self, resolution) {
            (Target::Start(offset), Resolution::Span { start, .. }) => (*start, *offset),
            (Target::End(offset), Resolution::Span { end, .. }) => (*end, *offset),
            (Target::Last(offset), Resolution::Last { end }) => (*end, *offset),
            (Target::LabelStart(name, offset), Resolution::Label { label, start, .. })
                if name == label =>
            {
                (*start, *offset)
            }
            (Target::LabelEnd(name, offset), Resolution::Label { label, end, .. })
                if name == label =>
            {
                (*end, *offset)
            }
            (Target::Function(wanted, offset), Resolution::Function { id, entry })
                if wanted == id =>
            {
                (*entry, *offset)
            }
            _ => return None,
        };
        base.checked_add_signed(offset)
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Start(o) => write!(f, "<start{:+}>", o),
            Target::End(o) => write!(f, "<end{:+}>", o),
            Target::Last(o) => write!(f, "<last{:+}>", o),
            Target::LabelStart(l, o) => write!(f, "<@{} start{:+}>", l, o),
            Target::LabelEnd(l, o) => write!(f, "<@{} end{:+}>", l, o),
            Target::Function(id, o) => write!(f, "<fn#{}{:+}>", id, o),
        }
    }
}

/// One emitted instruction, resolved or still waiting for its address.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ready(Op),
    Await { transfer: Transfer, target: Target },
}

impl Token {
    pub fn jump(target: Target) -> Self {
        Token::Await {
            transfer: Transfer::Jmp,
            target,
        }
    }

    pub fn jump_if(target: Target) -> Self {
        Token::Await {
            transfer: Transfer::Jif,
            target,
        }
    }

    pub fn call(id: FunctionId) -> Self {
        Token::Await {
            transfer: Transfer::Call,
            target: Target::Function(id, 0),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Token::Ready(_))
    }

    pub fn ready(&self) -> Option<&Op> {
        match self {
            Token::Ready(op) => Some(op),
            Token::Await { .. } => None,
        }
    }

    /// Encoded width in cells. Placeholders always take one address operand.
    pub fn width(&self) -> usize {
        match self {
            Token::Ready(op) => op.width(),
            Token::Await { transfer, .. } => 1 + transfer.opcode().arity(),
        }
    }

    pub fn resolve(self, resolution: &Resolution<'_>) -> Token {
        match self {
            Token::Await { transfer, target } => match target.resolve(resolution) {
                Some(address) => Token::Ready(transfer.to(address)),
                None => Token::Await { transfer, target },
            },
            ready => ready,
        }
    }
}

impl From<Op> for Token {
    fn from(op: Op) -> Self {
        Token::Ready(op)
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Ready(op) => write!(f, "{}", op),
            Token::Await { transfer, target } => write!(f, "{} {}", transfer.opcode(), target),
        }
    }
}

/// Resolve every token in `tokens` that waits on `resolution`.
pub fn resolve_all(tokens: Vec<Token>, resolution: &Resolution<'_>) -> Vec<Token> {
    tokens.into_iter().map(|t| t.resolve(resolution)).collect()
}

/// Total encoded width of a token list.
pub fn width_of(tokens: &[Token]) -> usize {
    tokens.iter().map(Token::width).sum()
}

/// Collapse a fully resolved stream; hands back the first placeholder left.
pub fn finish(tokens: Vec<Token>) -> Result<Vec<Op>, Token> {
    tokens
        .into_iter()
        .map(|t| match t {
            Token::Ready(op) => Ok(op),
            pending => Err(pending),
        })
        .collect()
}
