//! # Typed syntax tree
//!
//! The tree handed to the bytecode compiler after parsing, type checking and
//! slot allocation. Every name already carries its frame or global address,
//! every heap declaration its allocation id, and every function its id and
//! frame size.

pub mod node;
pub mod types;

pub use node::{
    BinaryOp, Branch, Expr, Function, FunctionId, HeapId, Place, Program, Stmt, UnaryOp, Var,
};
pub use types::Type;
