// Lexer for typed SSA listings (.ssa).
//
// Uses the `logos` crate for DFA-based lexing. Newlines are significant
// (one statement per line). `#` followed by digits is a block reference;
// any other `#` starts a comment running to the end of the line.
//
// Preconditions: input is valid UTF-8.
// Postconditions: returns all tokens with byte-offset spans, plus any lex errors.
// Failure modes: unrecognized characters produce `LexError`; lexing continues.
// Side effects: none.

use logos::Logos;
use std::fmt;

/// Byte-offset span in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A lexer error with location.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub span: Span,
    pub message: String,
}

/// Result of lexing: tokens plus any errors (non-fatal).
#[derive(Debug)]
pub struct LexResult {
    pub tokens: Vec<(Token, Span)>,
    pub errors: Vec<LexError>,
}

/// SSA listing tokens.
///
/// Type names, storage classes, schedule names and builtin names are lexed
/// as identifiers and validated by the parser. Identifiers carry no value;
/// use the span to retrieve the text.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r]+|#([^0-9\n][^\n]*)?")]
pub enum Token {
    // ── Keywords ──
    #[token("function")]
    Function,
    #[token("end")]
    End,
    #[token("types")]
    Types,
    #[token("block")]
    Block,
    #[token("parallel")]
    Parallel,
    #[token("schedule")]
    Schedule,
    #[token("local_size")]
    LocalSize,
    #[token("strategies")]
    Strategies,
    #[token("local_strategies")]
    LocalStrategies,
    #[token("reduce")]
    Reduce,
    #[token("arg")]
    Arg,
    #[token("builtin")]
    Builtin,
    #[token("comment")]
    Comment,
    #[token("line")]
    Line,
    #[token("call")]
    Call,
    #[token("get")]
    Get,
    #[token("set")]
    Set,
    #[token("simple_get")]
    SimpleGet,
    #[token("simple_set")]
    SimpleSet,
    #[token("get_or_first")]
    GetOrFirst,
    #[token("branch")]
    Branch,
    #[token("then")]
    Then,
    #[token("else")]
    Else,
    #[token("for")]
    For,
    #[token("loop")]
    Loop,
    #[token("iter")]
    Iter,
    #[token("while")]
    While,
    #[token("phi")]
    Phi,
    #[token("pcopy")]
    Pcopy,
    #[token("break")]
    Break,
    #[token("init")]
    Init,

    // ── Symbols ──
    #[token("->")]
    Arrow,
    #[token("<-")]
    LeftArrow,
    #[token(":")]
    Colon,
    #[token("?")]
    Question,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token("=")]
    Equals,

    // ── Literals ──
    /// Block reference (e.g. `#3`).
    #[regex(r"#[0-9]+", parse_block_ref)]
    BlockRef(u32),

    /// Floating-point literal: requires a fraction or an exponent.
    #[regex(r"-?[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", parse_float)]
    #[regex(r"-?[0-9]+[eE][+-]?[0-9]+", parse_float)]
    Float(f64),

    /// Integer literal.
    #[regex(r"-?[0-9]+", parse_int)]
    Int(i64),

    /// String literal with `\"` and `\\` escapes.
    #[regex(r#""([^"\\]|\\.)*""#, parse_string)]
    StringLit(String),

    // ── Identifier ──
    //
    // SSA names may contain `$` (`A$2`, `$t1`). Fixed keyword tokens win over
    // this regex for matches of the same length.
    #[regex(r"[a-zA-Z_$][a-zA-Z0-9_$]*")]
    Ident,

    // ── Structure ──
    /// One or more newlines (statement terminator).
    #[regex(r"\n+")]
    Newline,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Token::Function => "function",
            Token::End => "end",
            Token::Types => "types",
            Token::Block => "block",
            Token::Parallel => "parallel",
            Token::Schedule => "schedule",
            Token::LocalSize => "local_size",
            Token::Strategies => "strategies",
            Token::LocalStrategies => "local_strategies",
            Token::Reduce => "reduce",
            Token::Arg => "arg",
            Token::Builtin => "builtin",
            Token::Comment => "comment",
            Token::Line => "line",
            Token::Call => "call",
            Token::Get => "get",
            Token::Set => "set",
            Token::SimpleGet => "simple_get",
            Token::SimpleSet => "simple_set",
            Token::GetOrFirst => "get_or_first",
            Token::Branch => "branch",
            Token::Then => "then",
            Token::Else => "else",
            Token::For => "for",
            Token::Loop => "loop",
            Token::Iter => "iter",
            Token::While => "while",
            Token::Phi => "phi",
            Token::Pcopy => "pcopy",
            Token::Break => "break",
            Token::Init => "init",
            Token::Arrow => "->",
            Token::LeftArrow => "<-",
            Token::Colon => ":",
            Token::Question => "?",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::Comma => ",",
            Token::Equals => "=",
            Token::BlockRef(n) => return write!(f, "#{n}"),
            Token::Float(v) => return write!(f, "{v:?}"),
            Token::Int(v) => return write!(f, "{v}"),
            Token::StringLit(s) => return write!(f, "\"{s}\""),
            Token::Ident => "<ident>",
            Token::Newline => "<newline>",
        };
        f.write_str(text)
    }
}

// ── Callbacks ──

fn parse_block_ref(lex: &mut logos::Lexer<'_, Token>) -> Option<u32> {
    lex.slice()[1..].parse().ok()
}

fn parse_float(lex: &mut logos::Lexer<'_, Token>) -> Option<f64> {
    lex.slice().parse().ok()
}

fn parse_int(lex: &mut logos::Lexer<'_, Token>) -> Option<i64> {
    lex.slice().parse().ok()
}

fn parse_string(lex: &mut logos::Lexer<'_, Token>) -> Option<String> {
    let slice = lex.slice();
    let inner = &slice[1..slice.len() - 1];
    let mut result = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next()? {
                '"' => result.push('"'),
                '\\' => result.push('\\'),
                _ => return None,
            }
        } else {
            result.push(c);
        }
    }
    Some(result)
}

// ── Public API ──

/// Lex an SSA listing into tokens.
///
/// Lexing is non-fatal: errors are collected and the lexer continues past
/// bad characters.
pub fn lex(source: &str) -> LexResult {
    let lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    for (result, range) in lexer.spanned() {
        let span = Span {
            start: range.start,
            end: range.end,
        };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => errors.push(LexError {
                span,
                message: format!("unexpected character: {:?}", &source[span.start..span.end]),
            }),
        }
    }

    LexResult { tokens, errors }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_ok(source: &str) -> Vec<Token> {
        let result = lex(source);
        assert!(
            result.errors.is_empty(),
            "unexpected lex errors: {:?}",
            result.errors
        );
        result.tokens.into_iter().map(|(t, _)| t).collect()
    }

    fn lex_all(source: &str) -> (Vec<Token>, Vec<LexError>) {
        let result = lex(source);
        let tokens = result.tokens.into_iter().map(|(t, _)| t).collect();
        (tokens, result.errors)
    }

    #[test]
    fn keyword_vs_ident() {
        let tokens = lex_ok("set settings get_or_first getter");
        assert_eq!(
            tokens,
            vec![Token::Set, Token::Ident, Token::GetOrFirst, Token::Ident]
        );
    }

    #[test]
    fn ssa_names_with_dollar() {
        let source = "A$2 = simple_set A$1[i$1] = $t";
        let result = lex(source);
        assert!(result.errors.is_empty());
        let texts: Vec<&str> = result
            .tokens
            .iter()
            .filter(|(t, _)| *t == Token::Ident)
            .map(|(_, s)| &source[s.start..s.end])
            .collect();
        assert_eq!(texts, vec!["A$2", "A$1", "i$1", "$t"]);
    }

    #[test]
    fn block_refs_and_comments() {
        let tokens = lex_ok("for a, b, c loop #1 end #12 # trailing note\n");
        assert_eq!(
            tokens,
            vec![
                Token::For,
                Token::Ident,
                Token::Comma,
                Token::Ident,
                Token::Comma,
                Token::Ident,
                Token::Loop,
                Token::BlockRef(1),
                Token::End,
                Token::BlockRef(12),
                Token::Newline,
            ]
        );
    }

    #[test]
    fn numbers() {
        let tokens = lex_ok("3 -4 2.5 1e3 -0.25");
        assert_eq!(
            tokens,
            vec![
                Token::Int(3),
                Token::Int(-4),
                Token::Float(2.5),
                Token::Float(1000.0),
                Token::Float(-0.25),
            ]
        );
    }

    #[test]
    fn arrows() {
        let tokens = lex_ok("-> <- ->");
        assert_eq!(tokens, vec![Token::Arrow, Token::LeftArrow, Token::Arrow]);
    }

    #[test]
    fn string_escapes() {
        let tokens = lex_ok(r#"comment "say \"hi\"""#);
        assert_eq!(
            tokens,
            vec![Token::Comment, Token::StringLit("say \"hi\"".to_string())]
        );
    }

    #[test]
    fn bad_character_is_reported_and_skipped() {
        let (tokens, errors) = lex_all("x = y @ z");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains('@'));
        assert_eq!(tokens.len(), 4);
    }

    #[test]
    fn newlines_collapse() {
        let tokens = lex_ok("break\n\n\nbreak");
        assert_eq!(tokens, vec![Token::Break, Token::Newline, Token::Break]);
    }
}
