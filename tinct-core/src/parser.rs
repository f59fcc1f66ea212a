//! Recursive-descent parser from tokens to `AstNode` trees.
//!
//! The grammar is C-like, so `T x;` and `a * b;` are told apart by whether
//! the leading identifier names a type. The parser tracks the known type
//! names itself and adds every `struct` it sees.

use crate::ast::{AstKind, AstNode};
use crate::error::{CompilerError, Offset, Result};
use crate::ir::Operator;
use crate::lexer::{Token, TokenKind};
use crate::modifiers::{Layout, Modifiers, Primitive};
use crate::bail_parse_at;
use log::trace;
use std::collections::HashSet;

pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    type_names: HashSet<String>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>, type_names: HashSet<String>) -> Self {
        Parser { tokens, current: 0, type_names }
    }

    /// Type names known after parsing, including declared structs.
    pub fn type_names(&self) -> &HashSet<String> {
        &self.type_names
    }

    pub fn parse(&mut self) -> Result<AstNode> {
        let mut declarations = Vec::new();
        while !self.is_at_end() {
            if let Some(decl) = self.parse_declaration()? {
                declarations.push(decl);
            }
        }
        Ok(AstNode::new(0, AstKind::File, declarations))
    }

    fn parse_declaration(&mut self) -> Result<Option<AstNode>> {
        trace!("parse_declaration: next token = {:?}", self.peek());
        let offset = self.offset();
        match self.peek().clone() {
            TokenKind::Semicolon => {
                self.advance();
                Ok(None)
            }
            TokenKind::Directive(name) => {
                self.advance();
                if name != "extension" {
                    bail_parse_at!(offset, "unsupported directive '#{}'", name);
                }
                let extension = self.expect_identifier()?;
                self.expect(TokenKind::Colon)?;
                self.expect_identifier()?;
                Ok(Some(AstNode::leaf(offset, AstKind::Extension(extension))))
            }
            TokenKind::Section { name, argument, text } => {
                self.advance();
                Ok(Some(AstNode::leaf(offset, AstKind::Section { name, argument, text })))
            }
            TokenKind::Enum => self.parse_enum().map(Some),
            _ => {
                let modifiers = self.parse_modifiers()?;
                if self.check(&TokenKind::Semicolon) {
                    self.advance();
                    return Ok(Some(AstNode::leaf(offset, AstKind::Modifiers(modifiers))));
                }
                if let TokenKind::Identifier(name) = self.peek() {
                    if !self.type_names.contains(name) && self.peek_at(1) == &TokenKind::LeftBrace {
                        return self.parse_interface_block(modifiers).map(Some);
                    }
                }
                let ty = self.parse_type()?;
                if self.check(&TokenKind::Semicolon) {
                    // bare struct declaration
                    self.advance();
                    return Ok(Some(AstNode::new(offset, AstKind::VarDeclarations(modifiers), vec![ty])));
                }
                let name_offset = self.offset();
                let name = self.expect_identifier()?;
                if self.check(&TokenKind::LeftParen) {
                    self.parse_function(offset, modifiers, ty, name).map(Some)
                } else {
                    let decls = self.parse_var_declaration_rest(offset, modifiers, ty, name_offset, name)?;
                    Ok(Some(decls))
                }
            }
        }
    }

    fn parse_enum(&mut self) -> Result<AstNode> {
        trace!("parse_enum: next token = {:?}", self.peek());
        let offset = self.offset();
        self.expect(TokenKind::Enum)?;
        if self.check(&TokenKind::Class) {
            self.advance();
        }
        let name = self.expect_identifier()?;
        self.type_names.insert(name.clone());
        self.expect(TokenKind::LeftBrace)?;
        let mut cases = Vec::new();
        while !self.check(&TokenKind::RightBrace) {
            let case_offset = self.offset();
            let case_name = self.expect_identifier()?;
            let mut children = Vec::new();
            if self.check(&TokenKind::Eq) {
                self.advance();
                children.push(self.parse_assignment_expression()?);
            }
            cases.push(AstNode::new(case_offset, AstKind::EnumCase(case_name), children));
            if !self.check(&TokenKind::Comma) {
                break;
            }
            self.advance();
        }
        self.expect(TokenKind::RightBrace)?;
        self.expect(TokenKind::Semicolon)?;
        Ok(AstNode::new(offset, AstKind::Enum(name), cases))
    }

    fn parse_interface_block(&mut self, modifiers: Modifiers) -> Result<AstNode> {
        trace!("parse_interface_block: next token = {:?}", self.peek());
        let offset = self.offset();
        let type_name = self.expect_identifier()?;
        self.expect(TokenKind::LeftBrace)?;
        let mut children = Vec::new();
        while !self.check(&TokenKind::RightBrace) {
            children.push(self.parse_field_declarations()?);
        }
        self.expect(TokenKind::RightBrace)?;
        let mut instance_name = String::new();
        let mut size_count = 0;
        if let TokenKind::Identifier(name) = self.peek().clone() {
            self.advance();
            instance_name = name;
            while self.check(&TokenKind::LeftBracket) {
                children.push(self.parse_array_size()?);
                size_count += 1;
            }
        }
        self.expect(TokenKind::Semicolon)?;
        Ok(AstNode::new(
            offset,
            AstKind::InterfaceBlock { modifiers, type_name, instance_name, size_count },
            children,
        ))
    }

    /// `modifiers type a, b[2];` inside a struct or interface block.
    fn parse_field_declarations(&mut self) -> Result<AstNode> {
        let offset = self.offset();
        let modifiers = self.parse_modifiers()?;
        let ty = self.parse_type()?;
        let name_offset = self.offset();
        let name = self.expect_identifier()?;
        self.parse_var_declaration_rest(offset, modifiers, ty, name_offset, name)
    }

    fn parse_function(&mut self, offset: Offset, modifiers: Modifiers, ty: AstNode, name: String) -> Result<AstNode> {
        trace!("parse_function {}: next token = {:?}", name, self.peek());
        self.expect(TokenKind::LeftParen)?;
        let mut children = vec![ty];
        let mut parameter_count = 0;
        if self.check(&TokenKind::Identifier("void".into())) && self.peek_at(1) == &TokenKind::RightParen {
            self.advance();
        }
        while !self.check(&TokenKind::RightParen) {
            children.push(self.parse_parameter()?);
            parameter_count += 1;
            if !self.check(&TokenKind::Comma) {
                break;
            }
            self.advance();
        }
        self.expect(TokenKind::RightParen)?;
        if self.check(&TokenKind::Semicolon) {
            self.advance();
        } else {
            children.push(self.parse_block()?);
        }
        Ok(AstNode::new(offset, AstKind::Function { modifiers, name, parameter_count }, children))
    }

    fn parse_parameter(&mut self) -> Result<AstNode> {
        let offset = self.offset();
        let modifiers = self.parse_modifiers()?;
        let ty = self.parse_type()?;
        let name = self.expect_identifier()?;
        let mut children = vec![ty];
        let mut size_count = 0;
        while self.check(&TokenKind::LeftBracket) {
            children.push(self.parse_array_size()?);
            size_count += 1;
        }
        Ok(AstNode::new(offset, AstKind::Parameter { modifiers, name, size_count }, children))
    }

    /// `[N]` or `[]` (which yields a `Null` child).
    fn parse_array_size(&mut self) -> Result<AstNode> {
        let offset = self.offset();
        self.expect(TokenKind::LeftBracket)?;
        if self.check(&TokenKind::RightBracket) {
            self.advance();
            return Ok(AstNode::null(offset));
        }
        let size = self.parse_expression()?;
        self.expect(TokenKind::RightBracket)?;
        Ok(size)
    }

    fn parse_var_declaration_rest(
        &mut self,
        offset: Offset,
        modifiers: Modifiers,
        ty: AstNode,
        mut name_offset: Offset,
        mut name: String,
    ) -> Result<AstNode> {
        let mut children = vec![ty];
        loop {
            let mut decl_children = Vec::new();
            let mut size_count = 0;
            while self.check(&TokenKind::LeftBracket) {
                decl_children.push(self.parse_array_size()?);
                size_count += 1;
            }
            if self.check(&TokenKind::Eq) {
                self.advance();
                decl_children.push(self.parse_assignment_expression()?);
            }
            children.push(AstNode::new(
                name_offset,
                AstKind::VarDeclaration { name, size_count },
                decl_children,
            ));
            if !self.check(&TokenKind::Comma) {
                break;
            }
            self.advance();
            name_offset = self.offset();
            name = self.expect_identifier()?;
        }
        self.expect(TokenKind::Semicolon)?;
        Ok(AstNode::new(offset, AstKind::VarDeclarations(modifiers), children))
    }

    fn parse_type(&mut self) -> Result<AstNode> {
        trace!("parse_type: next token = {:?}", self.peek());
        let offset = self.offset();
        if self.check(&TokenKind::Struct) {
            return self.parse_struct();
        }
        let name = match self.peek().clone() {
            TokenKind::Identifier(name) if self.type_names.contains(&name) => name,
            TokenKind::Identifier(name) => bail_parse_at!(offset, "no type named '{}'", name),
            other => bail_parse_at!(offset, "expected a type, but found {:?}", other),
        };
        self.advance();
        let mut sizes = Vec::new();
        while self.check(&TokenKind::LeftBracket) {
            sizes.push(self.parse_array_size()?);
        }
        let is_nullable = if self.check(&TokenKind::Question) {
            self.advance();
            true
        } else {
            false
        };
        Ok(AstNode::new(offset, AstKind::Type { name, is_structure: false, is_nullable }, sizes))
    }

    fn parse_struct(&mut self) -> Result<AstNode> {
        trace!("parse_struct: next token = {:?}", self.peek());
        let offset = self.offset();
        self.expect(TokenKind::Struct)?;
        let name = self.expect_identifier()?;
        self.expect(TokenKind::LeftBrace)?;
        let mut fields = Vec::new();
        while !self.check(&TokenKind::RightBrace) {
            fields.push(self.parse_field_declarations()?);
        }
        self.expect(TokenKind::RightBrace)?;
        self.type_names.insert(name.clone());
        Ok(AstNode::new(offset, AstKind::Type { name, is_structure: true, is_nullable: false }, fields))
    }

    fn parse_layout(&mut self) -> Result<Layout> {
        let mut layout = Layout::default();
        self.expect(TokenKind::Layout)?;
        self.expect(TokenKind::LeftParen)?;
        while !self.check(&TokenKind::RightParen) {
            let offset = self.offset();
            let key = self.expect_identifier()?;
            match key.as_str() {
                "origin_upper_left" => layout.flags |= Layout::ORIGIN_UPPER_LEFT,
                "override_coverage" => layout.flags |= Layout::OVERRIDE_COVERAGE,
                "push_constant" => layout.flags |= Layout::PUSH_CONSTANT,
                "blend_support_all_equations" => layout.flags |= Layout::BLEND_SUPPORT_ALL_EQUATIONS,
                "std140" => layout.flags |= Layout::STD140,
                "std430" => layout.flags |= Layout::STD430,
                _ => {
                    if let Some(primitive) = Primitive::from_name(&key) {
                        layout.primitive = Some(primitive);
                    } else {
                        self.expect(TokenKind::Eq)?;
                        let value = self.expect_int()?;
                        let slot = match key.as_str() {
                            "location" => &mut layout.location,
                            "offset" => &mut layout.offset,
                            "binding" => &mut layout.binding,
                            "index" => &mut layout.index,
                            "set" => &mut layout.set,
                            "builtin" => &mut layout.builtin,
                            "input_attachment_index" => &mut layout.input_attachment_index,
                            "max_vertices" => &mut layout.max_vertices,
                            "invocations" => &mut layout.invocations,
                            _ => bail_parse_at!(offset, "unsupported layout qualifier '{}'", key),
                        };
                        *slot = value;
                    }
                }
            }
            if !self.check(&TokenKind::Comma) {
                break;
            }
            self.advance();
        }
        self.expect(TokenKind::RightParen)?;
        Ok(layout)
    }

    fn parse_modifiers(&mut self) -> Result<Modifiers> {
        let mut modifiers = Modifiers::default();
        loop {
            let offset = self.offset();
            let flag = match self.peek() {
                TokenKind::Layout => {
                    modifiers.layout = self.parse_layout()?;
                    continue;
                }
                TokenKind::Const => Modifiers::CONST,
                TokenKind::In => Modifiers::IN,
                TokenKind::Out => Modifiers::OUT,
                TokenKind::InOut => Modifiers::IN | Modifiers::OUT,
                TokenKind::Uniform => Modifiers::UNIFORM,
                TokenKind::Flat => Modifiers::FLAT,
                TokenKind::NoPerspective => Modifiers::NO_PERSPECTIVE,
                TokenKind::ReadOnly => Modifiers::READONLY,
                TokenKind::WriteOnly => Modifiers::WRITEONLY,
                TokenKind::Coherent => Modifiers::COHERENT,
                TokenKind::Volatile => Modifiers::VOLATILE,
                TokenKind::Restrict => Modifiers::RESTRICT,
                TokenKind::Buffer => Modifiers::BUFFER,
                TokenKind::HighP => Modifiers::HIGHP,
                TokenKind::MediumP => Modifiers::MEDIUMP,
                TokenKind::LowP => Modifiers::LOWP,
                TokenKind::Inline => Modifiers::INLINE,
                TokenKind::NoInline => Modifiers::NO_INLINE,
                TokenKind::HasSideEffects => Modifiers::HAS_SIDE_EFFECTS,
                _ => return Ok(modifiers),
            };
            if modifiers.flags & flag != 0 {
                bail_parse_at!(offset, "duplicate modifier {:?}", self.peek());
            }
            modifiers.flags |= flag;
            self.advance();
        }
    }

    // Statements

    fn parse_block(&mut self) -> Result<AstNode> {
        trace!("parse_block: next token = {:?}", self.peek());
        let offset = self.offset();
        self.expect(TokenKind::LeftBrace)?;
        let mut statements = Vec::new();
        while !self.check(&TokenKind::RightBrace) {
            if self.is_at_end() {
                bail_parse_at!(offset, "unterminated block");
            }
            statements.push(self.parse_statement()?);
        }
        self.expect(TokenKind::RightBrace)?;
        Ok(AstNode::new(offset, AstKind::Block, statements))
    }

    fn parse_statement(&mut self) -> Result<AstNode> {
        trace!("parse_statement: next token = {:?}", self.peek());
        let offset = self.offset();
        match self.peek() {
            TokenKind::LeftBrace => self.parse_block(),
            TokenKind::Semicolon => {
                self.advance();
                Ok(AstNode::leaf(offset, AstKind::Block))
            }
            TokenKind::If | TokenKind::StaticIf => self.parse_if(),
            TokenKind::For => self.parse_for(),
            TokenKind::While => self.parse_while(),
            TokenKind::Do => self.parse_do(),
            TokenKind::Switch | TokenKind::StaticSwitch => self.parse_switch(),
            TokenKind::Return => {
                self.advance();
                let mut children = Vec::new();
                if !self.check(&TokenKind::Semicolon) {
                    children.push(self.parse_expression()?);
                }
                self.expect(TokenKind::Semicolon)?;
                Ok(AstNode::new(offset, AstKind::Return, children))
            }
            TokenKind::Break => self.simple_statement(AstKind::Break),
            TokenKind::Continue => self.simple_statement(AstKind::Continue),
            TokenKind::Discard => self.simple_statement(AstKind::Discard),
            _ => self.parse_var_declarations_or_expression_statement(),
        }
    }

    fn simple_statement(&mut self, kind: AstKind) -> Result<AstNode> {
        let offset = self.offset();
        self.advance();
        self.expect(TokenKind::Semicolon)?;
        Ok(AstNode::leaf(offset, kind))
    }

    /// True if the tokens ahead start a variable declaration: modifiers, a
    /// struct, or a type name followed by a declarator.
    fn at_declaration(&self) -> bool {
        match self.peek() {
            TokenKind::Layout
            | TokenKind::Const
            | TokenKind::In
            | TokenKind::Out
            | TokenKind::InOut
            | TokenKind::Uniform
            | TokenKind::Flat
            | TokenKind::NoPerspective
            | TokenKind::HighP
            | TokenKind::MediumP
            | TokenKind::LowP
            | TokenKind::Struct => true,
            TokenKind::Identifier(name) if self.type_names.contains(name) => {
                let mut i = 1;
                // skip `[N]` groups after the type name
                while self.peek_at(i) == &TokenKind::LeftBracket {
                    let mut depth = 0;
                    loop {
                        match self.peek_at(i) {
                            TokenKind::LeftBracket => depth += 1,
                            TokenKind::RightBracket => {
                                depth -= 1;
                                if depth == 0 {
                                    i += 1;
                                    break;
                                }
                            }
                            TokenKind::Eof => return false,
                            _ => {}
                        }
                        i += 1;
                    }
                }
                matches!(self.peek_at(i), TokenKind::Identifier(_) | TokenKind::Question)
            }
            _ => false,
        }
    }

    fn parse_var_declarations_or_expression_statement(&mut self) -> Result<AstNode> {
        if self.at_declaration() {
            let offset = self.offset();
            let modifiers = self.parse_modifiers()?;
            let ty = self.parse_type()?;
            if self.check(&TokenKind::Semicolon) {
                self.advance();
                return Ok(AstNode::new(offset, AstKind::VarDeclarations(modifiers), vec![ty]));
            }
            let name_offset = self.offset();
            let name = self.expect_identifier()?;
            return self.parse_var_declaration_rest(offset, modifiers, ty, name_offset, name);
        }
        let expression = self.parse_expression()?;
        self.expect(TokenKind::Semicolon)?;
        Ok(expression)
    }

    fn parse_if(&mut self) -> Result<AstNode> {
        let offset = self.offset();
        let is_static = self.check(&TokenKind::StaticIf);
        self.advance();
        self.expect(TokenKind::LeftParen)?;
        let test = self.parse_expression()?;
        self.expect(TokenKind::RightParen)?;
        let mut children = vec![test, self.parse_statement()?];
        if self.check(&TokenKind::Else) {
            self.advance();
            children.push(self.parse_statement()?);
        }
        Ok(AstNode::new(offset, AstKind::If { is_static }, children))
    }

    fn parse_for(&mut self) -> Result<AstNode> {
        let offset = self.offset();
        self.expect(TokenKind::For)?;
        self.expect(TokenKind::LeftParen)?;
        let initializer = if self.check(&TokenKind::Semicolon) {
            self.advance();
            AstNode::null(self.offset())
        } else {
            // a declaration or expression statement, including its `;`
            self.parse_var_declarations_or_expression_statement()?
        };
        let test = if self.check(&TokenKind::Semicolon) {
            AstNode::null(self.offset())
        } else {
            self.parse_expression()?
        };
        self.expect(TokenKind::Semicolon)?;
        let next = if self.check(&TokenKind::RightParen) {
            AstNode::null(self.offset())
        } else {
            self.parse_expression()?
        };
        self.expect(TokenKind::RightParen)?;
        let body = self.parse_statement()?;
        Ok(AstNode::new(offset, AstKind::For, vec![initializer, test, next, body]))
    }

    fn parse_while(&mut self) -> Result<AstNode> {
        let offset = self.offset();
        self.expect(TokenKind::While)?;
        self.expect(TokenKind::LeftParen)?;
        let test = self.parse_expression()?;
        self.expect(TokenKind::RightParen)?;
        let body = self.parse_statement()?;
        Ok(AstNode::new(offset, AstKind::While, vec![test, body]))
    }

    fn parse_do(&mut self) -> Result<AstNode> {
        let offset = self.offset();
        self.expect(TokenKind::Do)?;
        let body = self.parse_statement()?;
        self.expect(TokenKind::While)?;
        self.expect(TokenKind::LeftParen)?;
        let test = self.parse_expression()?;
        self.expect(TokenKind::RightParen)?;
        self.expect(TokenKind::Semicolon)?;
        Ok(AstNode::new(offset, AstKind::Do, vec![body, test]))
    }

    fn parse_switch(&mut self) -> Result<AstNode> {
        let offset = self.offset();
        let is_static = self.check(&TokenKind::StaticSwitch);
        self.advance();
        self.expect(TokenKind::LeftParen)?;
        let mut children = vec![self.parse_expression()?];
        self.expect(TokenKind::RightParen)?;
        self.expect(TokenKind::LeftBrace)?;
        while !self.check(&TokenKind::RightBrace) {
            let case_offset = self.offset();
            let value = match self.peek() {
                TokenKind::Case => {
                    self.advance();
                    self.parse_expression()?
                }
                TokenKind::Default => {
                    self.advance();
                    AstNode::null(case_offset)
                }
                other => bail_parse_at!(case_offset, "expected 'case' or 'default', but found {:?}", other),
            };
            self.expect(TokenKind::Colon)?;
            let mut case_children = vec![value];
            while !matches!(self.peek(), TokenKind::Case | TokenKind::Default | TokenKind::RightBrace) {
                if self.is_at_end() {
                    bail_parse_at!(case_offset, "unterminated switch");
                }
                case_children.push(self.parse_statement()?);
            }
            children.push(AstNode::new(case_offset, AstKind::SwitchCase, case_children));
        }
        self.expect(TokenKind::RightBrace)?;
        Ok(AstNode::new(offset, AstKind::Switch { is_static }, children))
    }

    // Expressions

    /// Full expression including the comma operator.
    pub fn parse_expression(&mut self) -> Result<AstNode> {
        let mut result = self.parse_assignment_expression()?;
        while self.check(&TokenKind::Comma) {
            let offset = self.offset();
            self.advance();
            let right = self.parse_assignment_expression()?;
            result = AstNode::new(offset, AstKind::Binary(Operator::Comma), vec![result, right]);
        }
        Ok(result)
    }

    fn parse_assignment_expression(&mut self) -> Result<AstNode> {
        trace!("parse_assignment_expression: next token = {:?}", self.peek());
        let left = self.parse_ternary_expression()?;
        let op = match assignment_operator(self.peek()) {
            Some(op) => op,
            None => return Ok(left),
        };
        let offset = self.offset();
        self.advance();
        let right = self.parse_assignment_expression()?;
        Ok(AstNode::new(offset, AstKind::Binary(op), vec![left, right]))
    }

    fn parse_ternary_expression(&mut self) -> Result<AstNode> {
        let test = self.parse_binary_expression(0)?;
        if !self.check(&TokenKind::Question) {
            return Ok(test);
        }
        let offset = self.offset();
        self.advance();
        let if_true = self.parse_expression()?;
        self.expect(TokenKind::Colon)?;
        let if_false = self.parse_assignment_expression()?;
        Ok(AstNode::new(offset, AstKind::Ternary, vec![test, if_true, if_false]))
    }

    /// Precedence climbing over the left-associative binary operators.
    /// `min_level` counts up from the loosest-binding level.
    fn parse_binary_expression(&mut self, min_level: u8) -> Result<AstNode> {
        let mut left = self.parse_unary_expression()?;
        loop {
            let op = match binary_operator(self.peek()) {
                Some(op) => op,
                None => break,
            };
            let level = binding_level(op);
            if level < min_level {
                break;
            }
            let offset = self.offset();
            self.advance();
            let right = self.parse_binary_expression(level + 1)?;
            left = AstNode::new(offset, AstKind::Binary(op), vec![left, right]);
        }
        Ok(left)
    }

    fn parse_unary_expression(&mut self) -> Result<AstNode> {
        let offset = self.offset();
        let op = match self.peek() {
            TokenKind::Plus => Operator::Plus,
            TokenKind::Minus => Operator::Minus,
            TokenKind::LogicalNot => Operator::LogicalNot,
            TokenKind::BitwiseNot => Operator::BitwiseNot,
            TokenKind::PlusPlus => Operator::PlusPlus,
            TokenKind::MinusMinus => Operator::MinusMinus,
            _ => return self.parse_postfix_expression(),
        };
        self.advance();
        let operand = self.parse_unary_expression()?;
        Ok(AstNode::new(offset, AstKind::Prefix(op), vec![operand]))
    }

    fn parse_postfix_expression(&mut self) -> Result<AstNode> {
        let mut result = self.parse_primary_expression()?;
        loop {
            let offset = self.offset();
            match self.peek() {
                TokenKind::LeftParen => {
                    self.advance();
                    let mut children = vec![result];
                    while !self.check(&TokenKind::RightParen) {
                        children.push(self.parse_assignment_expression()?);
                        if !self.check(&TokenKind::Comma) {
                            break;
                        }
                        self.advance();
                    }
                    self.expect(TokenKind::RightParen)?;
                    result = AstNode::new(offset, AstKind::Call, children);
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let mut children = vec![result];
                    if !self.check(&TokenKind::RightBracket) {
                        children.push(self.parse_expression()?);
                    }
                    self.expect(TokenKind::RightBracket)?;
                    result = AstNode::new(offset, AstKind::Index, children);
                }
                TokenKind::Dot | TokenKind::ColonColon => {
                    self.advance();
                    let field = match self.peek().clone() {
                        TokenKind::Identifier(name) => name,
                        other => bail_parse_at!(offset, "expected field name, but found {:?}", other),
                    };
                    self.advance();
                    result = AstNode::new(offset, AstKind::Field(field), vec![result]);
                }
                TokenKind::PlusPlus => {
                    self.advance();
                    result = AstNode::new(offset, AstKind::Postfix(Operator::PlusPlus), vec![result]);
                }
                TokenKind::MinusMinus => {
                    self.advance();
                    result = AstNode::new(offset, AstKind::Postfix(Operator::MinusMinus), vec![result]);
                }
                _ => return Ok(result),
            }
        }
    }

    fn parse_primary_expression(&mut self) -> Result<AstNode> {
        trace!("parse_primary_expression: next token = {:?}", self.peek());
        let offset = self.offset();
        let kind = match self.peek().clone() {
            TokenKind::Identifier(name) => AstKind::Identifier(name),
            TokenKind::IntLiteral(i) => AstKind::Int(i),
            TokenKind::FloatLiteral(f) => AstKind::Float(f),
            TokenKind::True => AstKind::Bool(true),
            TokenKind::False => AstKind::Bool(false),
            TokenKind::NullLiteral => AstKind::NullLiteral,
            TokenKind::LeftParen => {
                self.advance();
                let inner = self.parse_expression()?;
                self.expect(TokenKind::RightParen)?;
                return Ok(inner);
            }
            other => bail_parse_at!(offset, "expected expression, but found {:?}", other),
        };
        self.advance();
        Ok(AstNode::leaf(offset, kind))
    }

    // Token helpers

    fn peek(&self) -> &TokenKind {
        self.peek_at(0)
    }

    fn peek_at(&self, distance: usize) -> &TokenKind {
        let index = (self.current + distance).min(self.tokens.len().saturating_sub(1));
        self.tokens.get(index).map(|t| &t.kind).unwrap_or(&TokenKind::Eof)
    }

    fn offset(&self) -> Offset {
        self.tokens
            .get(self.current)
            .or_else(|| self.tokens.last())
            .map(|t| t.offset)
            .unwrap_or(0)
    }

    fn is_at_end(&self) -> bool {
        self.peek() == &TokenKind::Eof
    }

    fn advance(&mut self) {
        if !self.is_at_end() {
            self.current += 1;
        }
    }

    fn check(&self, token: &TokenKind) -> bool {
        self.peek() == token
    }

    fn expect(&mut self, token: TokenKind) -> Result<()> {
        if self.check(&token) {
            self.advance();
            Ok(())
        } else {
            Err(CompilerError::ParseError(
                format!("expected {:?}, but found {:?}", token, self.peek()),
                Some(self.offset()),
            ))
        }
    }

    fn expect_identifier(&mut self) -> Result<String> {
        match self.peek().clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            other => bail_parse_at!(self.offset(), "expected an identifier, but found {:?}", other),
        }
    }

    fn expect_int(&mut self) -> Result<i32> {
        match self.peek().clone() {
            TokenKind::IntLiteral(i) => {
                self.advance();
                i32::try_from(i)
                    .map_err(|_| CompilerError::ParseError(format!("value {} out of range", i), Some(self.offset())))
            }
            other => bail_parse_at!(self.offset(), "expected an integer, but found {:?}", other),
        }
    }
}

fn assignment_operator(token: &TokenKind) -> Option<Operator> {
    Some(match token {
        TokenKind::Eq => Operator::Eq,
        TokenKind::PlusEq => Operator::PlusEq,
        TokenKind::MinusEq => Operator::MinusEq,
        TokenKind::StarEq => Operator::StarEq,
        TokenKind::SlashEq => Operator::SlashEq,
        TokenKind::PercentEq => Operator::PercentEq,
        TokenKind::ShlEq => Operator::ShlEq,
        TokenKind::ShrEq => Operator::ShrEq,
        TokenKind::BitwiseAndEq => Operator::BitwiseAndEq,
        TokenKind::BitwiseOrEq => Operator::BitwiseOrEq,
        TokenKind::BitwiseXorEq => Operator::BitwiseXorEq,
        TokenKind::LogicalAndEq => Operator::LogicalAndEq,
        TokenKind::LogicalOrEq => Operator::LogicalOrEq,
        TokenKind::LogicalXorEq => Operator::LogicalXorEq,
        _ => return None,
    })
}

fn binary_operator(token: &TokenKind) -> Option<Operator> {
    Some(match token {
        TokenKind::LogicalOr => Operator::LogicalOr,
        TokenKind::LogicalXor => Operator::LogicalXor,
        TokenKind::LogicalAnd => Operator::LogicalAnd,
        TokenKind::BitwiseOr => Operator::BitwiseOr,
        TokenKind::BitwiseXor => Operator::BitwiseXor,
        TokenKind::BitwiseAnd => Operator::BitwiseAnd,
        TokenKind::EqEq => Operator::EqEq,
        TokenKind::Neq => Operator::Neq,
        TokenKind::Lt => Operator::Lt,
        TokenKind::Gt => Operator::Gt,
        TokenKind::LtEq => Operator::LtEq,
        TokenKind::GtEq => Operator::GtEq,
        TokenKind::Shl => Operator::Shl,
        TokenKind::Shr => Operator::Shr,
        TokenKind::Plus => Operator::Plus,
        TokenKind::Minus => Operator::Minus,
        TokenKind::Star => Operator::Star,
        TokenKind::Slash => Operator::Slash,
        TokenKind::Percent => Operator::Percent,
        _ => return None,
    })
}

/// Loosest (`||`) is 0; multiplicative is the tightest binary level.
fn binding_level(op: Operator) -> u8 {
    (crate::ir::Precedence::LogicalOr as u8) - (op.binary_precedence() as u8)
}

#[cfg(test)]
mod tests;
