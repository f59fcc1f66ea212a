use crate::error::{CompilerError, Offset, Result};
use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, tag_no_case, take_until, take_while1},
    character::complete::{alpha1, alphanumeric1, char, digit0, digit1, hex_digit1, multispace1, one_of},
    combinator::{map, opt, recognize, value},
    multi::many0,
    sequence::{pair, preceded, tuple},
    IResult,
};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier(String),
    IntLiteral(i64),
    FloatLiteral(f64),
    True,
    False,
    NullLiteral,

    // Keywords
    If,
    Else,
    For,
    While,
    Do,
    Switch,
    Case,
    Default,
    Break,
    Continue,
    Discard,
    Return,
    In,
    Out,
    InOut,
    Uniform,
    Const,
    Flat,
    NoPerspective,
    ReadOnly,
    WriteOnly,
    Coherent,
    Volatile,
    Restrict,
    Buffer,
    HighP,
    MediumP,
    LowP,
    Inline,
    NoInline,
    HasSideEffects,
    Layout,
    Struct,
    Enum,
    Class,
    /// `@if`
    StaticIf,
    /// `@switch`
    StaticSwitch,
    /// `@name(argument) { text }`
    Section { name: String, argument: String, text: String },
    /// `#name`, e.g. `#extension`
    Directive(String),

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Shl,
    Shr,
    LogicalNot,
    LogicalAnd,
    LogicalOr,
    LogicalXor,
    BitwiseNot,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    Eq,
    EqEq,
    Neq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    PercentEq,
    ShlEq,
    ShrEq,
    BitwiseAndEq,
    BitwiseOrEq,
    BitwiseXorEq,
    LogicalAndEq,
    LogicalOrEq,
    LogicalXorEq,
    PlusPlus,
    MinusMinus,
    Question,
    ColonColon,

    // Delimiters
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    Dot,
    Comma,
    Colon,
    Semicolon,

    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub offset: Offset,
}

fn keyword_or_identifier(word: &str) -> TokenKind {
    match word {
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "null" => TokenKind::NullLiteral,
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "for" => TokenKind::For,
        "while" => TokenKind::While,
        "do" => TokenKind::Do,
        "switch" => TokenKind::Switch,
        "case" => TokenKind::Case,
        "default" => TokenKind::Default,
        "break" => TokenKind::Break,
        "continue" => TokenKind::Continue,
        "discard" => TokenKind::Discard,
        "return" => TokenKind::Return,
        "in" => TokenKind::In,
        "out" => TokenKind::Out,
        "inout" => TokenKind::InOut,
        "uniform" => TokenKind::Uniform,
        "const" => TokenKind::Const,
        "flat" => TokenKind::Flat,
        "noperspective" => TokenKind::NoPerspective,
        "readonly" => TokenKind::ReadOnly,
        "writeonly" => TokenKind::WriteOnly,
        "coherent" => TokenKind::Coherent,
        "volatile" => TokenKind::Volatile,
        "restrict" => TokenKind::Restrict,
        "buffer" => TokenKind::Buffer,
        "highp" => TokenKind::HighP,
        "mediump" => TokenKind::MediumP,
        "lowp" => TokenKind::LowP,
        "inline" => TokenKind::Inline,
        "noinline" => TokenKind::NoInline,
        "sk_has_side_effects" => TokenKind::HasSideEffects,
        "layout" => TokenKind::Layout,
        "struct" => TokenKind::Struct,
        "enum" => TokenKind::Enum,
        "class" => TokenKind::Class,
        _ => TokenKind::Identifier(word.to_string()),
    }
}

fn parse_line_comment(input: &str) -> IResult<&str, &str> {
    recognize(pair(tag("//"), opt(is_not("\n"))))(input)
}

fn parse_block_comment(input: &str) -> IResult<&str, &str> {
    recognize(tuple((tag("/*"), take_until("*/"), tag("*/"))))(input)
}

/// `#version` lines carry nothing the compiler needs.
fn parse_version_line(input: &str) -> IResult<&str, &str> {
    recognize(pair(tag("#version"), opt(is_not("\n"))))(input)
}

fn parse_trivia(input: &str) -> IResult<&str, &str> {
    alt((multispace1, parse_line_comment, parse_block_comment, parse_version_line))(input)
}

fn parse_word(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"), tag("$"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)
}

fn parse_identifier(input: &str) -> IResult<&str, TokenKind> {
    map(parse_word, keyword_or_identifier)(input)
}

fn parse_exponent(input: &str) -> IResult<&str, &str> {
    recognize(tuple((one_of("eE"), opt(one_of("+-")), digit1)))(input)
}

fn parse_float_literal(input: &str) -> IResult<&str, TokenKind> {
    let (rest, text) = alt((
        recognize(tuple((digit1, char('.'), digit0, opt(parse_exponent)))),
        recognize(tuple((char('.'), digit1, opt(parse_exponent)))),
        recognize(pair(digit1, parse_exponent)),
    ))(input)?;
    let (rest, _) = opt(one_of("fF"))(rest)?;
    match text.parse::<f64>() {
        Ok(v) => Ok((rest, TokenKind::FloatLiteral(v))),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Float))),
    }
}

fn parse_int_literal(input: &str) -> IResult<&str, TokenKind> {
    let hex = map(preceded(tag_no_case("0x"), hex_digit1), |s: &str| {
        i64::from_str_radix(s, 16).ok()
    });
    let dec = map(digit1, |s: &str| s.parse::<i64>().ok());
    let (rest, parsed) = alt((hex, dec))(input)?;
    let (rest, _) = opt(one_of("uU"))(rest)?;
    match parsed {
        Some(v) => Ok((rest, TokenKind::IntLiteral(v))),
        None => Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Digit))),
    }
}

fn parse_operator(input: &str) -> IResult<&str, TokenKind> {
    alt((
        alt((
            value(TokenKind::ShlEq, tag("<<=")),
            value(TokenKind::ShrEq, tag(">>=")),
            value(TokenKind::LogicalAndEq, tag("&&=")),
            value(TokenKind::LogicalOrEq, tag("||=")),
            value(TokenKind::LogicalXorEq, tag("^^=")),
            value(TokenKind::PlusPlus, tag("++")),
            value(TokenKind::MinusMinus, tag("--")),
            value(TokenKind::PlusEq, tag("+=")),
            value(TokenKind::MinusEq, tag("-=")),
            value(TokenKind::StarEq, tag("*=")),
            value(TokenKind::SlashEq, tag("/=")),
            value(TokenKind::PercentEq, tag("%=")),
        )),
        alt((
            value(TokenKind::BitwiseAndEq, tag("&=")),
            value(TokenKind::BitwiseOrEq, tag("|=")),
            value(TokenKind::BitwiseXorEq, tag("^=")),
            value(TokenKind::LogicalAnd, tag("&&")),
            value(TokenKind::LogicalOr, tag("||")),
            value(TokenKind::LogicalXor, tag("^^")),
            value(TokenKind::Shl, tag("<<")),
            value(TokenKind::Shr, tag(">>")),
            value(TokenKind::EqEq, tag("==")),
            value(TokenKind::Neq, tag("!=")),
            value(TokenKind::LtEq, tag("<=")),
            value(TokenKind::GtEq, tag(">=")),
            value(TokenKind::ColonColon, tag("::")),
        )),
        alt((
            value(TokenKind::Plus, char('+')),
            value(TokenKind::Minus, char('-')),
            value(TokenKind::Star, char('*')),
            value(TokenKind::Slash, char('/')),
            value(TokenKind::Percent, char('%')),
            value(TokenKind::LogicalNot, char('!')),
            value(TokenKind::BitwiseNot, char('~')),
            value(TokenKind::BitwiseAnd, char('&')),
            value(TokenKind::BitwiseOr, char('|')),
            value(TokenKind::BitwiseXor, char('^')),
            value(TokenKind::Eq, char('=')),
            value(TokenKind::Lt, char('<')),
            value(TokenKind::Gt, char('>')),
            value(TokenKind::Question, char('?')),
        )),
    ))(input)
}

fn parse_delimiter(input: &str) -> IResult<&str, TokenKind> {
    alt((
        value(TokenKind::LeftParen, char('(')),
        value(TokenKind::RightParen, char(')')),
        value(TokenKind::LeftBracket, char('[')),
        value(TokenKind::RightBracket, char(']')),
        value(TokenKind::LeftBrace, char('{')),
        value(TokenKind::RightBrace, char('}')),
        value(TokenKind::Dot, char('.')),
        value(TokenKind::Comma, char(',')),
        value(TokenKind::Colon, char(':')),
        value(TokenKind::Semicolon, char(';')),
    ))(input)
}

fn parse_directive(input: &str) -> IResult<&str, TokenKind> {
    map(preceded(char('#'), parse_word), |s: &str| TokenKind::Directive(s.to_string()))(input)
}

/// `@if`, `@switch`, or a section `@name(argument) { text }` whose body is
/// kept verbatim (balanced braces).
fn parse_at(input: &str) -> IResult<&str, TokenKind> {
    let (rest, name) = preceded(char('@'), parse_word)(input)?;
    match name {
        "if" => return Ok((rest, TokenKind::StaticIf)),
        "switch" => return Ok((rest, TokenKind::StaticSwitch)),
        _ => {}
    }
    let trimmed = rest.trim_start();
    let (rest, argument) = match opt(tuple((char('('), take_while1(|c: char| c != ')'), char(')'))))(trimmed)? {
        (rest, Some((_, arg, _))) => (rest, arg.trim().to_string()),
        (rest, None) => (rest, String::new()),
    };
    let rest = rest.trim_start();
    let (body_start, _) = char('{')(rest)?;
    let mut depth = 1;
    for (i, c) in body_start.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let text = body_start[..i].to_string();
                    return Ok((
                        &body_start[i + 1..],
                        TokenKind::Section { name: name.to_string(), argument, text },
                    ));
                }
            }
            _ => {}
        }
    }
    Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Char)))
}

fn parse_token(input: &str) -> IResult<&str, TokenKind> {
    alt((
        parse_float_literal,
        parse_int_literal,
        parse_identifier,
        parse_at,
        parse_directive,
        parse_operator,
        parse_delimiter,
    ))(input)
}

/// Splits `source` into tokens with byte offsets. The result always ends in `Eof`.
pub fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut remaining = source;
    let mut tokens = Vec::new();
    let offset_of = |rest: &str| (source.len() - rest.len()) as Offset;

    loop {
        while let Ok((rest, _)) = parse_trivia(remaining) {
            remaining = rest;
        }
        if remaining.is_empty() {
            break;
        }
        match parse_token(remaining) {
            Ok((rest, kind)) => {
                tokens.push(Token { kind, offset: offset_of(remaining) });
                remaining = rest;
            }
            Err(_) => {
                let c = remaining.chars().next().unwrap_or(' ');
                return Err(CompilerError::ParseError(
                    format!("unexpected character '{}'", c),
                    Some(offset_of(remaining)),
                ));
            }
        }
    }
    tokens.push(Token { kind: TokenKind::Eof, offset: source.len() as Offset });
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_tokenize_declaration() {
        assert_eq!(
            kinds("uniform float4 color;"),
            vec![
                TokenKind::Uniform,
                TokenKind::Identifier("float4".into()),
                TokenKind::Identifier("color".into()),
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_literals() {
        assert_eq!(
            kinds("1 2.5 .5 1e3 0x1F 3u"),
            vec![
                TokenKind::IntLiteral(1),
                TokenKind::FloatLiteral(2.5),
                TokenKind::FloatLiteral(0.5),
                TokenKind::FloatLiteral(1000.0),
                TokenKind::IntLiteral(31),
                TokenKind::IntLiteral(3),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_operators_longest_match() {
        assert_eq!(
            kinds("a <<= b && c++ ^^ d"),
            vec![
                TokenKind::Identifier("a".into()),
                TokenKind::ShlEq,
                TokenKind::Identifier("b".into()),
                TokenKind::LogicalAnd,
                TokenKind::Identifier("c".into()),
                TokenKind::PlusPlus,
                TokenKind::LogicalXor,
                TokenKind::Identifier("d".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_and_version_are_skipped() {
        let tokens = tokenize("#version 400\n// hi\n/* block */ x").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Identifier("x".into()));
        assert_eq!(tokens[0].offset, 31);
    }

    #[test]
    fn test_sections_keep_raw_text() {
        let tokens = kinds("@header { int x = {1}; } @if");
        assert_eq!(
            tokens[0],
            TokenKind::Section {
                name: "header".into(),
                argument: String::new(),
                text: " int x = {1}; ".into()
            }
        );
        assert_eq!(tokens[1], TokenKind::StaticIf);
    }

    #[test]
    fn test_generic_type_names() {
        assert_eq!(kinds("$genType")[0], TokenKind::Identifier("$genType".into()));
    }

    #[test]
    fn test_bad_character_reports_offset() {
        match tokenize("int x = `;") {
            Err(CompilerError::ParseError(msg, Some(8))) => assert!(msg.contains('`')),
            other => panic!("Expected parse error, got {:?}", other),
        }
    }
}
