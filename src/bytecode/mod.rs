pub mod asm;
pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod image;
pub mod op;
pub mod optimize;
pub mod token;

pub use compile::{Compiler, compile};
pub use compile_error::CompileError;
pub use image::{ImageError, ProgramImage};
pub use op::{Op, OpCode};
pub use token::{Target, Token};
