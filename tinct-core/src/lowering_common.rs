//! Utilities shared between the textual backends (GLSL, Metal).

use crate::builtins::SK_RTADJUST_NAME;
use crate::ir::*;
use crate::visitor::{walk_expression, ProgramVisitor};
use std::collections::HashSet;
use std::ops::ControlFlow;

/// Indentation-aware text sink. Lines are indented lazily on their first
/// write so that callers can finish a line without knowing what comes next.
#[derive(Debug, Default)]
pub struct CodeWriter {
    out: String,
    indent: usize,
    at_line_start: bool,
}

impl CodeWriter {
    pub fn new() -> Self {
        CodeWriter { out: String::new(), indent: 0, at_line_start: true }
    }

    pub fn write(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if self.at_line_start {
            for _ in 0..self.indent {
                self.out.push_str("    ");
            }
        }
        self.out.push_str(text);
        self.at_line_start = false;
    }

    pub fn write_line(&mut self, text: &str) {
        self.write(text);
        self.out.push('\n');
        self.at_line_start = true;
    }

    pub fn finish_line(&mut self) {
        if !self.at_line_start {
            self.write_line("");
        }
    }

    /// Appends already formatted text verbatim.
    pub fn append(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.out.push_str(text);
        self.at_line_start = text.ends_with('\n');
    }

    pub fn indent(&mut self) {
        self.indent += 1;
    }

    pub fn dedent(&mut self) {
        self.indent = self.indent.saturating_sub(1);
    }

    /// Swaps in an empty buffer and returns what was written so far. The
    /// indentation level is kept.
    pub fn take(&mut self) -> String {
        self.at_line_start = true;
        std::mem::take(&mut self.out)
    }

    pub fn into_string(self) -> String {
        self.out
    }
}

/// Helper functions emitted at most once per program, in the order they were
/// first requested.
#[derive(Debug, Default)]
pub struct HelperSet {
    names: HashSet<String>,
    text: String,
}

impl HelperSet {
    /// Appends `text` under `name` unless that name was already added.
    /// Returns true if the helper is new.
    pub fn add(&mut self, name: &str, text: impl FnOnce() -> String) -> bool {
        if !self.names.insert(name.to_string()) {
            return false;
        }
        self.text.push_str(&text());
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// `xyzw` letters for the non-constant part of a swizzle mask. Constant
/// components are only ever trailing.
pub fn swizzle_letters(components: &[i8]) -> String {
    components.iter().filter(|c| **c >= 0).map(|c| ['x', 'y', 'z', 'w'][*c as usize]).collect()
}

/// The trailing `0`/`1` components of a swizzle as literal text.
pub fn swizzle_constants(components: &[i8], float: bool) -> Vec<&'static str> {
    components
        .iter()
        .filter(|c| **c < 0)
        .map(|c| match (*c == SWIZZLE_ONE, float) {
            (true, true) => "1.0",
            (true, false) => "1",
            (false, true) => "0.0",
            (false, false) => "0",
        })
        .collect()
}

/// True if `expression` reads the render-target adjustment uniform.
pub fn contains_rt_adjust(program: &Program, expression: &Expression) -> bool {
    struct Finder<'a> {
        program: &'a Program,
    }
    impl ProgramVisitor for Finder<'_> {
        type Break = ();
        fn visit_expression(&mut self, expression: &Expression) -> ControlFlow<()> {
            match &expression.kind {
                ExpressionKind::VariableReference { variable, .. }
                    if self.program.variable(*variable).name == SK_RTADJUST_NAME =>
                {
                    ControlFlow::Break(())
                }
                ExpressionKind::FieldAccess { base, field_index, .. }
                    if base.ty.fields()[*field_index].name == SK_RTADJUST_NAME =>
                {
                    ControlFlow::Break(())
                }
                _ => walk_expression(self, expression),
            }
        }
    }
    Finder { program }.visit_expression(expression).is_break()
}

/// Globals the program never touches can be left out of textual output,
/// unless they are part of the shader's interface.
pub fn is_unreferenced_global(program: &Program, var: VarId) -> bool {
    let counts = program.usage.get(var);
    program.usage.is_dead(program, var) && counts.write == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_indents_lazily() {
        let mut writer = CodeWriter::new();
        writer.write_line("void main() {");
        writer.indent();
        writer.write("x = ");
        writer.write("1;");
        writer.finish_line();
        writer.finish_line();
        writer.dedent();
        writer.write_line("}");
        assert_eq!(writer.into_string(), "void main() {\n    x = 1;\n}\n");
    }

    #[test]
    fn helpers_are_deduplicated_in_first_use_order() {
        let mut helpers = HelperSet::default();
        assert!(helpers.add("b", || "B\n".to_string()));
        assert!(helpers.add("a", || "A\n".to_string()));
        assert!(!helpers.add("b", || "B again\n".to_string()));
        assert_eq!(helpers.text(), "B\nA\n");
    }

    #[test]
    fn swizzle_masks_split_constants() {
        assert_eq!(swizzle_letters(&[1, 0, SWIZZLE_ZERO, SWIZZLE_ONE]), "yx");
        assert_eq!(swizzle_constants(&[1, 0, SWIZZLE_ZERO, SWIZZLE_ONE], true), vec!["0.0", "1.0"]);
    }
}
