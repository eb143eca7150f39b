// Filter expression lexer
// Tokenizes the AIP-160-dialect query grammar

use crate::errors::{Error, Result};

/// Token kinds produced by the lexer.
///
/// `AND`, `OR` and `NOT` are not keywords at this level; they arrive as
/// [`TokKind::Text`] and the parser decides whether they are operators or
/// plain identifiers (they stay identifiers when adjacent to a `.`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokKind {
    /// Identifier, number, or quoted string.
    Text,
    LParen,
    RParen,
    Dot,
    Comma,
    /// Unary minus (negation); `-5` lexes as a single Text token instead
    /// when it cannot follow another value.
    Minus,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    /// `:` — the has/contains operator.
    Has,
    /// `=~` — regex match.
    Match,
    /// `!~` — regex non-match.
    NotMatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokKind,
    /// Decoded text for `Text` tokens (escape sequences resolved).
    pub text: String,
    /// True when the token was written as a double-quoted string.
    pub quoted: bool,
    /// Byte offset in the source, for diagnostics.
    pub pos: usize,
}

impl Token {
    fn op(kind: TokKind, pos: usize) -> Self {
        Token {
            kind,
            text: String::new(),
            quoted: false,
            pos,
        }
    }

    /// True for unquoted text equal to `word` (exact case).
    pub fn is_word(&self, word: &str) -> bool {
        self.kind == TokKind::Text && !self.quoted && self.text == word
    }
}

/// Whitespace per the grammar: space, tab, form feed, NBSP, CR, LF.
fn is_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\x0C' | '\u{00A0}' | '\r' | '\n')
}

/// Characters that may appear inside an unquoted text token.
fn is_text_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '_' | '#' | '$' | '%' | '&' | '\'' | '*' | '/' | ';' | '?' | '@'
        )
        || c as u32 >= 0xA1
}

/// Tokenize a filter expression.
pub fn lex(src: &str) -> Result<Vec<Token>> {
    let mut toks = Vec::new();
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut i = 0;
    // Whether the previous token was a value; governs `-` lexing.
    let mut prev_text = false;

    while i < chars.len() {
        let (pos, c) = chars[i];
        if is_space(c) {
            i += 1;
            continue;
        }
        // Line comment: `--` to end of line, treated as whitespace.
        if c == '-' && matches!(chars.get(i + 1), Some((_, '-'))) {
            while i < chars.len() && chars[i].1 != '\n' {
                i += 1;
            }
            continue;
        }

        match c {
            '(' => {
                toks.push(Token::op(TokKind::LParen, pos));
                prev_text = false;
                i += 1;
            }
            ')' => {
                toks.push(Token::op(TokKind::RParen, pos));
                // A closed group is a value as far as `-` lexing goes.
                prev_text = true;
                i += 1;
            }
            '.' => {
                toks.push(Token::op(TokKind::Dot, pos));
                prev_text = false;
                i += 1;
            }
            ',' => {
                toks.push(Token::op(TokKind::Comma, pos));
                prev_text = false;
                i += 1;
            }
            '<' | '>' => {
                let eq = matches!(chars.get(i + 1), Some((_, '=')));
                let kind = match (c, eq) {
                    ('<', true) => TokKind::Le,
                    ('<', false) => TokKind::Lt,
                    ('>', true) => TokKind::Ge,
                    (_, false) => TokKind::Gt,
                    _ => unreachable!(),
                };
                toks.push(Token::op(kind, pos));
                prev_text = false;
                i += if eq { 2 } else { 1 };
            }
            '=' => {
                if matches!(chars.get(i + 1), Some((_, '~'))) {
                    toks.push(Token::op(TokKind::Match, pos));
                    i += 2;
                } else {
                    toks.push(Token::op(TokKind::Eq, pos));
                    i += 1;
                }
                prev_text = false;
            }
            '!' => match chars.get(i + 1) {
                Some((_, '=')) => {
                    toks.push(Token::op(TokKind::Ne, pos));
                    prev_text = false;
                    i += 2;
                }
                Some((_, '~')) => {
                    toks.push(Token::op(TokKind::NotMatch, pos));
                    prev_text = false;
                    i += 2;
                }
                _ => {
                    return Err(Error::filter(format!("unexpected '!' at offset {pos}")));
                }
            },
            ':' => {
                toks.push(Token::op(TokKind::Has, pos));
                prev_text = false;
                i += 1;
            }
            '-' => {
                // A leading minus may begin a negative numeric literal,
                // but only when the previous token was not itself text.
                let starts_number = !prev_text
                    && matches!(chars.get(i + 1), Some((_, d)) if d.is_ascii_digit());
                if starts_number {
                    let (tok, next) = lex_text(&chars, i, pos);
                    toks.push(tok);
                    prev_text = true;
                    i = next;
                } else {
                    toks.push(Token::op(TokKind::Minus, pos));
                    prev_text = false;
                    i += 1;
                }
            }
            '"' => {
                let (tok, next) = lex_quoted(src, &chars, i)?;
                toks.push(tok);
                prev_text = true;
                i = next;
            }
            c if is_text_char(c) => {
                let (tok, next) = lex_text(&chars, i, pos);
                toks.push(tok);
                prev_text = true;
                i = next;
            }
            other => {
                return Err(Error::filter(format!(
                    "unexpected character {other:?} at offset {pos}"
                )));
            }
        }
    }
    Ok(toks)
}

fn lex_text(chars: &[(usize, char)], start: usize, pos: usize) -> (Token, usize) {
    let mut i = start;
    let mut text = String::new();
    if chars[i].1 == '-' {
        text.push('-');
        i += 1;
    }
    while i < chars.len() && is_text_char(chars[i].1) {
        text.push(chars[i].1);
        i += 1;
    }
    (
        Token {
            kind: TokKind::Text,
            text,
            quoted: false,
            pos,
        },
        i,
    )
}

fn lex_quoted(src: &str, chars: &[(usize, char)], start: usize) -> Result<(Token, usize)> {
    let pos = chars[start].0;
    let mut i = start + 1;
    let mut text = String::new();
    while i < chars.len() {
        let c = chars[i].1;
        match c {
            '"' => {
                return Ok((
                    Token {
                        kind: TokKind::Text,
                        text,
                        quoted: true,
                        pos,
                    },
                    i + 1,
                ));
            }
            '\\' => {
                let (decoded, consumed) = unescape(chars, i + 1).map_err(|msg| {
                    Error::filter(format!("{msg} at offset {}", chars[i].0))
                })?;
                text.push(decoded);
                i += 1 + consumed;
            }
            _ => {
                text.push(c);
                i += 1;
            }
        }
    }
    let head: String = src[pos..].chars().take(16).collect();
    Err(Error::filter(format!(
        "unterminated string starting at offset {pos}: {head:?}"
    )))
}

/// Decode one escape sequence starting just after the backslash.
/// Returns the decoded character and the number of source chars consumed.
fn unescape(chars: &[(usize, char)], at: usize) -> std::result::Result<(char, usize), String> {
    let c = chars
        .get(at)
        .map(|&(_, c)| c)
        .ok_or_else(|| "dangling escape".to_string())?;
    let simple = match c {
        'a' => Some('\x07'),
        'b' => Some('\x08'),
        'f' => Some('\x0C'),
        'n' => Some('\n'),
        'r' => Some('\r'),
        't' => Some('\t'),
        'v' => Some('\x0B'),
        '"' | '\\' | ',' | ':' | '=' | '<' | '>' | '+' | '~' | '.' | '*' => Some(c),
        _ => None,
    };
    if let Some(decoded) = simple {
        return Ok((decoded, 1));
    }
    match c {
        '0'..='7' => {
            // Octal: up to three digits; the value caps at 0xFF, which
            // bounds a three-digit form's leading digit at 3.
            let mut value = c.to_digit(8).unwrap();
            let mut consumed = 1;
            while consumed < 3 {
                let Some(d) = chars
                    .get(at + consumed)
                    .map(|&(_, c)| c)
                    .filter(|c| ('0'..='7').contains(c))
                else {
                    break;
                };
                let next = value * 8 + d.to_digit(8).unwrap();
                if next > 0xFF {
                    break;
                }
                value = next;
                consumed += 1;
            }
            char::from_u32(value)
                .map(|ch| (ch, consumed))
                .ok_or_else(|| format!("invalid octal escape \\{value:o}"))
        }
        'x' => {
            let hex: String = (1..=2)
                .filter_map(|k| chars.get(at + k).map(|&(_, c)| c))
                .collect();
            if hex.len() != 2 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(format!("invalid hex escape \\x{hex}"));
            }
            let value = u32::from_str_radix(&hex, 16).unwrap();
            char::from_u32(value)
                .map(|ch| (ch, 3))
                .ok_or_else(|| format!("invalid hex escape \\x{hex}"))
        }
        'u' => {
            let hex: String = (1..=4)
                .filter_map(|k| chars.get(at + k).map(|&(_, c)| c))
                .collect();
            if hex.len() != 4 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(format!("invalid unicode escape \\u{hex}"));
            }
            let value = u32::from_str_radix(&hex, 16).unwrap();
            char::from_u32(value)
                .map(|ch| (ch, 5))
                .ok_or_else(|| format!("invalid unicode escape \\u{hex}"))
        }
        other => Err(format!("unknown escape \\{other}")),
    }
}

/// Re-encode text as a double-quoted string literal that lexes back to the
/// same token. Used by the AST printer.
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
