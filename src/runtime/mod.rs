pub mod allocator;
pub mod linker;
pub mod memory;
pub mod runtime_error;
pub mod vm;

pub use linker::{LinkTable, MachineView, NativeArg};
pub use memory::{Layout, Memory, Registers};
pub use runtime_error::{RuntimeError, Trap};
pub use vm::{Vm, VmConfig};
