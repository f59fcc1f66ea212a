use log::debug;
use thiserror::Error;

/// Byte offset into the shader source. `-1` marks compiler-synthesized code.
pub type Offset = i32;

#[derive(Debug, Error)]
pub enum CompilerError {
    #[error("Parse error: {0}")]
    ParseError(String, Option<Offset>),

    #[error("Semantic error: {0}")]
    SemanticError(String, Option<Offset>),

    #[error("Code generation error: {0}")]
    CodegenError(String, Option<Offset>),

    #[error("SPIR-V generation error: {0}")]
    SpirvError(String, Option<Offset>),

    #[error("SPIR-V builder error: {0}")]
    SpirvBuilderError(#[from] rspirv::dr::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CompilerError {
    pub fn offset(&self) -> Option<Offset> {
        match self {
            Self::ParseError(_, offset) => *offset,
            Self::SemanticError(_, offset) => *offset,
            Self::CodegenError(_, offset) => *offset,
            Self::SpirvError(_, offset) => *offset,
            Self::SpirvBuilderError(_) | Self::IoError(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CompilerError>;

// Bail macros without offset

#[macro_export]
macro_rules! bail_parse {
    ($($arg:tt)*) => {
        return Err($crate::error::CompilerError::ParseError(format!($($arg)*), None))
    };
}

#[macro_export]
macro_rules! bail_codegen {
    ($($arg:tt)*) => {
        return Err($crate::error::CompilerError::CodegenError(format!($($arg)*), None))
    };
}

// Bail macros with offset

#[macro_export]
macro_rules! bail_parse_at {
    ($offset:expr, $($arg:tt)*) => {
        return Err($crate::error::CompilerError::ParseError(format!($($arg)*), Some($offset)))
    };
}

#[macro_export]
macro_rules! bail_codegen_at {
    ($offset:expr, $($arg:tt)*) => {
        return Err($crate::error::CompilerError::CodegenError(format!($($arg)*), Some($offset)))
    };
}

/// A single reported problem.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub offset: Offset,
    pub message: String,
}

/// Collects diagnostics for one compile. Phases keep going after an error so
/// that sibling declarations still get checked; callers look at
/// `error_count()` before trusting a phase's output.
#[derive(Debug, Default)]
pub struct ErrorReporter {
    diagnostics: Vec<Diagnostic>,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, offset: Offset, message: impl Into<String>) {
        let message = message.into();
        debug!("error at offset {}: {}", offset, message);
        self.diagnostics.push(Diagnostic { offset, message });
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Converts the collected diagnostics into a single error, if any were reported.
    pub fn check(&self, make: fn(String, Option<Offset>) -> CompilerError) -> Result<()> {
        match self.diagnostics.first() {
            None => Ok(()),
            Some(first) => {
                let message = if self.diagnostics.len() == 1 {
                    first.message.clone()
                } else {
                    format!("{} (and {} more)", first.message, self.diagnostics.len() - 1)
                };
                Err(make(message, Some(first.offset)))
            }
        }
    }

    pub fn clear(&mut self) {
        self.diagnostics.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reporter_accumulates_and_converts() {
        let mut errors = ErrorReporter::new();
        assert!(errors.check(CompilerError::SemanticError).is_ok());
        errors.error(4, "unknown identifier 'x'");
        errors.error(9, "unknown identifier 'y'");
        assert_eq!(errors.error_count(), 2);
        match errors.check(CompilerError::SemanticError) {
            Err(CompilerError::SemanticError(msg, Some(4))) => {
                assert_eq!(msg, "unknown identifier 'x' (and 1 more)")
            }
            other => panic!("Expected semantic error, got {:?}", other),
        }
    }
}
