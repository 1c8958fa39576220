//! Hand-rolled tokenizer for GeneScript.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LexError {
    #[error("line {line}: unexpected character '{ch}'")]
    UnexpectedChar { ch: char, line: u32 },
    #[error("line {line}: unterminated string literal")]
    UnterminatedString { line: u32 },
    #[error("line {line}: invalid number literal '{text}'")]
    InvalidNumber { text: String, line: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Number(f64),
    Str(String),

    // Keywords
    Use,
    Const,
    Trait,
    Fn,
    Init,
    Let,
    If,
    Else,
    For,
    In,
    Break,
    Continue,
    Return,
    True,
    False,
    SelfKw,
    Await,

    // Punctuation and operators
    LParen,
    RParen,
    LBrace,
    RBrace,
    Semi,
    Comma,
    Dot,
    DotDot,
    PathSep,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
}

fn keyword(ident: &str) -> Option<TokenKind> {
    Some(match ident {
        "use" => TokenKind::Use,
        "const" => TokenKind::Const,
        "trait" => TokenKind::Trait,
        "fn" => TokenKind::Fn,
        "init" => TokenKind::Init,
        "let" => TokenKind::Let,
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "for" => TokenKind::For,
        "in" => TokenKind::In,
        "break" => TokenKind::Break,
        "continue" => TokenKind::Continue,
        "return" => TokenKind::Return,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "self" => TokenKind::SelfKw,
        "await" => TokenKind::Await,
        _ => return None,
    })
}

/// Consume the next character if it equals `next`.
fn eat(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, next: char) -> bool {
    if chars.peek() == Some(&next) {
        chars.next();
        true
    } else {
        false
    }
}

/// Tokenize a source text. Comments run from `//` or `#` to end of line.
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line: u32 = 1;

    while let Some(&ch) = chars.peek() {
        if ch == '\n' {
            line += 1;
            chars.next();
            continue;
        }
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        if ch == '#' {
            while let Some(&c) = chars.peek() {
                if c == '\n' {
                    break;
                }
                chars.next();
            }
            continue;
        }
        if ch == '/' {
            chars.next();
            match chars.peek() {
                Some('/') => {
                    while let Some(&c) = chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        chars.next();
                    }
                }
                Some('=') => {
                    chars.next();
                    tokens.push(Token { kind: TokenKind::SlashAssign, line });
                }
                _ => tokens.push(Token { kind: TokenKind::Slash, line }),
            }
            continue;
        }
        if ch.is_ascii_alphabetic() || ch == '_' {
            let mut ident = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    ident.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            let kind = keyword(&ident).unwrap_or(TokenKind::Ident(ident));
            tokens.push(Token { kind, line });
            continue;
        }
        if ch.is_ascii_digit() {
            let mut text = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    chars.next();
                } else if c == '.' {
                    // Lookahead so `0..10` lexes as Number DotDot Number.
                    let mut clone = chars.clone();
                    clone.next();
                    if clone.peek() == Some(&'.') {
                        break;
                    }
                    if text.contains('.') {
                        break;
                    }
                    text.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            let value: f64 = text
                .parse()
                .map_err(|_| LexError::InvalidNumber { text: text.clone(), line })?;
            tokens.push(Token { kind: TokenKind::Number(value), line });
            continue;
        }
        if ch == '"' {
            chars.next();
            let mut text = String::new();
            let mut terminated = false;
            for c in chars.by_ref() {
                if c == '"' {
                    terminated = true;
                    break;
                }
                if c == '\n' {
                    break;
                }
                text.push(c);
            }
            if !terminated {
                return Err(LexError::UnterminatedString { line });
            }
            tokens.push(Token { kind: TokenKind::Str(text), line });
            continue;
        }

        chars.next();
        let kind = match ch {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            ';' => TokenKind::Semi,
            ',' => TokenKind::Comma,
            '.' => {
                if eat(&mut chars, '.') {
                    TokenKind::DotDot
                } else {
                    TokenKind::Dot
                }
            }
            ':' => {
                if eat(&mut chars, ':') {
                    TokenKind::PathSep
                } else {
                    return Err(LexError::UnexpectedChar { ch, line });
                }
            }
            '+' => {
                if eat(&mut chars, '=') {
                    TokenKind::PlusAssign
                } else {
                    TokenKind::Plus
                }
            }
            '-' => {
                if eat(&mut chars, '=') {
                    TokenKind::MinusAssign
                } else {
                    TokenKind::Minus
                }
            }
            '*' => {
                if eat(&mut chars, '=') {
                    TokenKind::StarAssign
                } else {
                    TokenKind::Star
                }
            }
            '%' => TokenKind::Percent,
            '!' => {
                if eat(&mut chars, '=') {
                    TokenKind::NotEq
                } else {
                    TokenKind::Bang
                }
            }
            '=' => {
                if eat(&mut chars, '=') {
                    TokenKind::EqEq
                } else {
                    TokenKind::Assign
                }
            }
            '<' => {
                if eat(&mut chars, '=') {
                    TokenKind::Le
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if eat(&mut chars, '=') {
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            '&' => {
                if eat(&mut chars, '&') {
                    TokenKind::AndAnd
                } else {
                    return Err(LexError::UnexpectedChar { ch, line });
                }
            }
            '|' => {
                if eat(&mut chars, '|') {
                    TokenKind::OrOr
                } else {
                    return Err(LexError::UnexpectedChar { ch, line });
                }
            }
            other => return Err(LexError::UnexpectedChar { ch: other, line }),
        };
        tokens.push(Token { kind, line });
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_keywords_idents_and_operators() {
        let tokens = tokenize("trait Foo { fn execute(entity) { entity.energy += 1.5; } }")
            .expect("tokens");
        assert!(matches!(tokens[0].kind, TokenKind::Trait));
        assert!(matches!(tokens[1].kind, TokenKind::Ident(ref s) if s == "Foo"));
        assert!(tokens.iter().any(|t| t.kind == TokenKind::PlusAssign));
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Number(1.5)));
    }

    #[test]
    fn ranges_do_not_eat_the_dots() {
        let tokens = tokenize("for i in 0..10 { }").expect("tokens");
        assert!(tokens.iter().any(|t| t.kind == TokenKind::DotDot));
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Number(0.0)));
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Number(10.0)));
    }

    #[test]
    fn comments_are_skipped_and_lines_tracked() {
        let tokens = tokenize("// comment\nuse math;\n# also comment\nconst A = 1;")
            .expect("tokens");
        assert!(matches!(tokens[0].kind, TokenKind::Use));
        assert_eq!(tokens[0].line, 2);
        let const_tok = tokens.iter().find(|t| t.kind == TokenKind::Const).expect("const");
        assert_eq!(const_tok.line, 4);
    }

    #[test]
    fn rejects_stray_characters() {
        assert!(tokenize("let a = 1 @ 2;").is_err());
        assert!(tokenize("\"unterminated").is_err());
    }
}
