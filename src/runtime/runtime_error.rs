use thiserror::Error;

use crate::bytecode::op::DecodeError;
use crate::lang::HeapId;

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Faults raised by the virtual CPU. All of them stop the running program;
/// there is no recovery inside the machine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("memory access out of bounds: address {address} (limit {limit})")]
    OutOfBounds { address: usize, limit: usize },

    #[error("invalid address value {0}")]
    InvalidAddress(f64),

    #[error("instruction pointer {ip} left the code segment (length {len})")]
    OutOfCode { ip: usize, len: usize },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("stack underflow")]
    StackUnderflow,

    #[error("stack overflow (limit {limit} cells)")]
    StackOverflow { limit: usize },

    #[error("call stack overflow: frame of {requested} cells does not fit")]
    CallStackOverflow { requested: usize },

    #[error("call depth limit exceeded ({0}) - possible infinite recursion")]
    CallDepth(usize),

    #[error("integer division by zero")]
    DivisionByZero,

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: f64, len: usize },

    #[error("native function #{0} not found")]
    NativeNotFound(usize),

    #[error("native '{name}': {message}")]
    Native { name: String, message: String },

    #[error("heap exhausted: allocation #{id} needs {requested} cells")]
    HeapExhausted { id: HeapId, requested: usize },

    #[error("heap allocation #{0} does not exist")]
    UnknownHeapId(HeapId),

    #[error("address {0} is not the base of a live heap allocation")]
    DanglingAddress(usize),

    #[error("heap allocation #{id} holds {capacity} elements, cannot store {count}")]
    HeapCapacity {
        id: HeapId,
        count: usize,
        capacity: usize,
    },

    #[error("execution step limit exceeded ({0})")]
    StepLimit(usize),

    #[error("machine configuration error: {0}")]
    Config(String),

    #[error("no program loaded")]
    NotInitialized,
}

impl RuntimeError {
    pub fn native(name: &str, message: impl Into<String>) -> Self {
        RuntimeError::Native {
            name: name.to_string(),
            message: message.into(),
        }
    }
}

/// A fault together with the address of the instruction that raised it.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("runtime error at {ip:04}: {error}")]
pub struct Trap {
    pub ip: usize,
    #[source]
    pub error: RuntimeError,
}
