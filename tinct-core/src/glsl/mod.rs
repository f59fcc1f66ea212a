//! GLSL code generation backend.
//!
//! This module contains the lowering pass from the IR to GLSL source.

pub mod lowering;

pub use lowering::{lower, RTFLIP_NAME};

#[cfg(test)]
mod tests;
