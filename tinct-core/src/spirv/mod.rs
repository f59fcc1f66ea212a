//! SPIR-V code generation backend.
//!
//! This module contains the lowering pass from the IR to a SPIR-V binary.

pub mod lowering;

pub use lowering::lower;

#[cfg(test)]
mod tests;
