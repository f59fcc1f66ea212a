//! Lane-vectorized backend.
//!
//! Lowers a program to a branch-free list of lane-wise instructions that a
//! host evaluates over many pixels at once, and bundles a small interpreter
//! for running the result.

mod builder;
mod generator;

pub use builder::{BinaryOp, Builder, Instruction, Program, UnaryOp, Val};
pub use generator::lower;

#[cfg(test)]
mod tests;
