//! Metal Shading Language backend.

pub mod lowering;

pub use lowering::lower;

#[cfg(test)]
mod tests;
