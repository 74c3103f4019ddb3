//! Native function table.
//!
//! At compile time a signature string (for example `"sqrt(float)"`) maps to
//! a numeric id that ends up in a `SYS` instruction. At run time the same id
//! maps to a callback. Each entry carries a format string that tells the
//! machine how to decode the popped arguments, one character per argument:
//!
//! | char | decoded as                                            |
//! |------|-------------------------------------------------------|
//! | `b`  | bool (nonzero)                                        |
//! | `f`  | float                                                 |
//! | `i`  | int (truncated)                                       |
//! | `c`  | char (unicode scalar)                                 |
//! | `s`  | string: count cell on top, then that many char cells  |

use std::collections::HashMap;
use std::io::Write;

use thiserror::Error;

use crate::runtime::memory::{Memory, Registers};
use crate::runtime::runtime_error::RuntimeError;

/// One decoded native argument.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeArg {
    Bool(bool),
    Float(f64),
    Int(i64),
    Char(char),
    Str(String),
}

impl NativeArg {
    pub fn as_f64(&self) -> f64 {
        match self {
            NativeArg::Bool(b) => *b as u8 as f64,
            NativeArg::Float(f) => *f,
            NativeArg::Int(i) => *i as f64,
            NativeArg::Char(c) => *c as u32 as f64,
            NativeArg::Str(s) => s.chars().count() as f64,
        }
    }
}

impl std::fmt::Display for NativeArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NativeArg::Bool(b) => write!(f, "{}", b),
            NativeArg::Float(n) => write!(f, "{}", n),
            NativeArg::Int(n) => write!(f, "{}", n),
            NativeArg::Char(c) => write!(f, "{}", c),
            NativeArg::Str(s) => write!(f, "{}", s),
        }
    }
}

/// Read-only view of the machine handed to native callbacks.
pub struct MachineView<'a> {
    pub memory: &'a Memory,
    pub registers: Registers,
}

/// Native callback. Returned cells are pushed in reverse, so the first
/// returned value ends up on top of the stack.
pub type NativeCallback =
    Box<dyn FnMut(&MachineView<'_>, &[NativeArg]) -> Result<Vec<f64>, RuntimeError>>;

/// Box a closure as a [`NativeCallback`].
pub fn native<F>(f: F) -> NativeCallback
where
    F: FnMut(&MachineView<'_>, &[NativeArg]) -> Result<Vec<f64>, RuntimeError> + 'static,
{
    Box::new(f)
}

pub struct NativeFn {
    pub signature: String,
    pub format: String,
    pub callback: NativeCallback,
}

impl std::fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFn")
            .field("signature", &self.signature)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("native signature '{0}' is already linked")]
    Duplicate(String),

    #[error("native '{signature}': unknown argument format '{format}'")]
    BadFormat { signature: String, format: char },
}

pub const FORMAT_CHARS: &str = "bfics";

#[derive(Debug, Default)]
pub struct LinkTable {
    ids: HashMap<String, usize>,
    functions: Vec<NativeFn>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table preloaded with the core printing and math functions.
    pub fn with_core() -> Self {
        let mut table = Self::new();
        for (signature, format, callback) in core_functions() {
            // core signatures are distinct and well formed
            if let Err(e) = table.register(signature, format, callback) {
                tracing::error!(error = %e, "core native rejected");
            }
        }
        table
    }

    /// Link `signature` and return its id. Ids are dense, in registration order.
    pub fn register(
        &mut self,
        signature: &str,
        format: &str,
        callback: NativeCallback,
    ) -> Result<usize, LinkError> {
        if self.ids.contains_key(signature) {
            return Err(LinkError::Duplicate(signature.to_string()));
        }
        if let Some(bad) = format.chars().find(|c| !FORMAT_CHARS.contains(*c)) {
            return Err(LinkError::BadFormat {
                signature: signature.to_string(),
                format: bad,
            });
        }

        let id = self.functions.len();
        self.ids.insert(signature.to_string(), id);
        self.functions.push(NativeFn {
            signature: signature.to_string(),
            format: format.to_string(),
            callback,
        });
        tracing::debug!(signature, id, "native linked");
        Ok(id)
    }

    pub fn lookup(&self, signature: &str) -> Option<usize> {
        self.ids.get(signature).copied()
    }

    pub fn get(&self, id: usize) -> Option<&NativeFn> {
        self.functions.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut NativeFn> {
        self.functions.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

fn print_args(args: &[NativeArg]) -> Result<Vec<f64>, RuntimeError> {
    let mut out = std::io::stdout().lock();
    for arg in args {
        write!(out, "{}", arg).map_err(|e| RuntimeError::native("print", e.to_string()))?;
    }
    out.flush()
        .map_err(|e| RuntimeError::native("print", e.to_string()))?;
    Ok(Vec::new())
}

fn float_arg(args: &[NativeArg], i: usize) -> f64 {
    args.get(i).map(NativeArg::as_f64).unwrap_or(f64::NAN)
}

fn core_functions() -> Vec<(&'static str, &'static str, NativeCallback)> {
    vec![
        ("print(int)", "i", native(|_, args| print_args(args))),
        ("print(float)", "f", native(|_, args| print_args(args))),
        ("print(bool)", "b", native(|_, args| print_args(args))),
        ("print(char)", "c", native(|_, args| print_args(args))),
        ("print(string)", "s", native(|_, args| print_args(args))),
        (
            "println()",
            "",
            native(|_, _| print_args(&[NativeArg::Char('\n')])),
        ),
        (
            "sqrt(float)",
            "f",
            native(|_, args| Ok(vec![float_arg(args, 0).sqrt()])),
        ),
        (
            "pow(float,float)",
            "ff",
            native(|_, args| Ok(vec![float_arg(args, 0).powf(float_arg(args, 1))])),
        ),
        (
            "floor(float)",
            "f",
            native(|_, args| Ok(vec![float_arg(args, 0).floor()])),
        ),
    ]
}
