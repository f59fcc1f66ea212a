pub mod analysis;
pub mod arena;
pub mod ast;
pub mod builtins;
pub mod constant_folding;
pub mod error;
pub mod glsl;
pub mod inliner;
pub mod ir;
pub mod ir_generator;
pub mod lexer;
pub mod lowering_common;
pub mod memory_layout;
pub mod metal;
pub mod modifiers;
pub mod parser;
pub mod settings;
pub mod spirv;
pub mod symbols;
pub mod types;
pub mod usage;
pub mod visitor;
pub mod vm;

#[cfg(test)]
mod constant_folding_tests;

#[cfg(test)]
mod inliner_tests;

use error::{CompilerError, ErrorReporter, Result};
use inliner::{remove_inline_markers, Inliner};
use ir::Program;
use log::{debug, info};
use settings::{ProgramKind, Settings};
use std::rc::Rc;
use types::Context;

/// Upper bound on inliner passes; each pass can expose new candidates.
const MAX_INLINE_PASSES: usize = 8;

/// Entry point for the compile pipeline.
///
/// Each phase returns the next pipeline state, so a caller can stop after
/// checking, inspect the IR, or pick any backend:
///
/// ```ignore
/// let spirv = Compiler::new(settings).convert(ProgramKind::Fragment, source)?.optimize()?.to_spirv()?;
/// ```
pub struct Compiler {
    settings: Settings,
    context: Rc<Context>,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl Compiler {
    pub fn new(settings: Settings) -> Self {
        Compiler { settings, context: Rc::new(Context::new()) }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Parses and type-checks `source`, producing IR.
    pub fn convert(&self, kind: ProgramKind, source: &str) -> Result<Converted> {
        info!("Converting {} program ({} bytes)", kind, source.len());
        let mut errors = ErrorReporter::new();
        let program =
            ir_generator::IRGenerator::new(self.context.clone(), &self.settings, kind, &mut errors)
                .convert_program(source)?;
        errors.check(CompilerError::SemanticError)?;
        info!("Converted {} elements", program.elements.len());
        Ok(Converted { program })
    }

    /// Converts and optimizes in one step.
    pub fn compile(&self, kind: ProgramKind, source: &str) -> Result<Optimized> {
        self.convert(kind, source)?.optimize()
    }
}

/// A type-checked program that has not been optimized.
pub struct Converted {
    pub program: Program,
}

impl Converted {
    /// Runs the inliner to a fixpoint when `Settings::optimize` is set.
    pub fn optimize(mut self) -> Result<Optimized> {
        if !self.program.settings.optimize {
            debug!("Optimization disabled; skipping inliner");
            return Ok(Optimized { program: self.program });
        }

        let mut inliner = Inliner::new();
        let mut errors = ErrorReporter::new();
        let mut passes = 0;
        while passes < MAX_INLINE_PASSES && inliner.inline_pass(&mut self.program, &mut errors) {
            passes += 1;
        }
        errors.check(CompilerError::SemanticError)?;
        remove_inline_markers(&mut self.program);
        info!("Inliner finished after {} pass(es)", passes);
        Ok(Optimized { program: self.program })
    }

    /// Skips optimization and hands the IR straight to the backends.
    pub fn unoptimized(self) -> Optimized {
        Optimized { program: self.program }
    }
}

/// A program ready for code generation.
pub struct Optimized {
    pub program: Program,
}

impl Optimized {
    pub fn to_glsl(&self) -> Result<String> {
        info!("Generating GLSL");
        glsl::lower(&self.program)
    }

    pub fn to_metal(&self) -> Result<String> {
        info!("Generating Metal");
        metal::lower(&self.program)
    }

    pub fn to_spirv(&self) -> Result<Vec<u32>> {
        info!("Generating SPIR-V");
        let words = spirv::lower(&self.program)?;
        info!("Generated {} words of SPIR-V", words.len());
        Ok(words)
    }

    /// Builds a lane program for the function named `entry`.
    pub fn to_vm(&self, entry: &str) -> Result<vm::Program> {
        info!("Generating VM program for '{}'", entry);
        vm::lower(&self.program, entry)
    }
}
