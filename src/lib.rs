//! Bytecode back end and stack machine.
//!
//! [`bytecode`] turns a typed, slot-allocated syntax tree ([`lang`]) into a
//! flat image of numeric cells; [`runtime`] loads that image into one
//! segmented memory and executes it.

pub mod bytecode;
pub mod lang;
pub mod runtime;
