use dx_value::format_number;
use thiserror::Error;

/// Lexed token kinds. Operators carry their surface text so the parser can
/// match on symbols; punctuation gets dedicated variants.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Str(String),
    Bool(bool),
    Ident(String),
    BacktickIdent(String),
    Op(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

impl TokenKind {
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Number(v) => format!("number {}", format_number(*v)),
            Self::Str(v) => format!("string \"{v}\""),
            Self::Bool(v) => format!("boolean '{v}'"),
            Self::Ident(v) | Self::BacktickIdent(v) => format!("identifier '{v}'"),
            Self::Op(v) => format!("operator '{v}'"),
            Self::LParen => "'('".to_owned(),
            Self::RParen => "')'".to_owned(),
            Self::LBracket => "'['".to_owned(),
            Self::RBracket => "']'".to_owned(),
            Self::Comma => "','".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the token's first character in the source string.
    pub offset: usize,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TokenizeError {
    #[error("unrecognized character '{ch}' at offset {offset}\n{snippet}")]
    UnrecognizedChar {
        ch: char,
        offset: usize,
        snippet: String,
    },
    #[error("unterminated string literal starting at offset {offset}\n{snippet}")]
    UnterminatedString { offset: usize, snippet: String },
    #[error("unterminated backtick identifier starting at offset {offset}\n{snippet}")]
    UnterminatedBacktick { offset: usize, snippet: String },
}

/// Multi-character operators are matched before their single-character
/// prefixes; single '&', '|' and '=' still lex (the parser rejects them).
const TWO_CHAR_OPS: [&str; 6] = [">=", "<=", "==", "!=", "&&", "||"];
const ONE_CHAR_OPS: [char; 12] = [
    '+', '-', '*', '/', '%', '^', '>', '<', '=', '!', '&', '|',
];

pub fn tokenize(source: &str) -> Result<Vec<Token>, TokenizeError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        match c {
            '(' => {
                tokens.push(Token { kind: TokenKind::LParen, offset });
                i += 1;
            }
            ')' => {
                tokens.push(Token { kind: TokenKind::RParen, offset });
                i += 1;
            }
            '[' => {
                tokens.push(Token { kind: TokenKind::LBracket, offset });
                i += 1;
            }
            ']' => {
                tokens.push(Token { kind: TokenKind::RBracket, offset });
                i += 1;
            }
            ',' => {
                tokens.push(Token { kind: TokenKind::Comma, offset });
                i += 1;
            }
            '"' => {
                let (token, next) = lex_string(source, &chars, i)?;
                tokens.push(token);
                i = next;
            }
            '`' => {
                let (token, next) = lex_backtick(source, &chars, i)?;
                tokens.push(token);
                i = next;
            }
            // Leading-dot numbers: `.5`. A lone '.' is unrecognized.
            '.' if matches!(chars.get(i + 1), Some((_, d)) if d.is_ascii_digit()) => {
                let (token, next) = lex_number(source, &chars, i)?;
                tokens.push(token);
                i = next;
            }
            _ if c.is_ascii_digit() => {
                let (token, next) = lex_number(source, &chars, i)?;
                tokens.push(token);
                i = next;
            }
            _ if c.is_alphabetic() || c == '_' => {
                let (token, next) = lex_word(&chars, i);
                tokens.push(token);
                i = next;
            }
            _ => {
                let two: Option<&str> = chars.get(i + 1).and_then(|(_, n)| {
                    let candidate: String = [c, *n].iter().collect();
                    TWO_CHAR_OPS
                        .iter()
                        .copied()
                        .find(|op| *op == candidate.as_str())
                });
                if let Some(op) = two {
                    tokens.push(Token {
                        kind: TokenKind::Op(op.to_owned()),
                        offset,
                    });
                    i += 2;
                } else if ONE_CHAR_OPS.contains(&c) {
                    tokens.push(Token {
                        kind: TokenKind::Op(c.to_string()),
                        offset,
                    });
                    i += 1;
                } else {
                    return Err(TokenizeError::UnrecognizedChar {
                        ch: c,
                        offset,
                        snippet: caret_snippet(source, offset),
                    });
                }
            }
        }
    }

    Ok(tokens)
}

/// `\d+(\.\d+)?` plus the leading-dot form. A trailing bare dot is left for
/// the next token (`3.` lexes as `3` then an unrecognized '.').
fn lex_number(
    source: &str,
    chars: &[(usize, char)],
    start: usize,
) -> Result<(Token, usize), TokenizeError> {
    let offset = chars[start].0;
    let mut i = start;
    while i < chars.len() && chars[i].1.is_ascii_digit() {
        i += 1;
    }
    if i < chars.len()
        && chars[i].1 == '.'
        && matches!(chars.get(i + 1), Some((_, d)) if d.is_ascii_digit())
    {
        i += 1;
        while i < chars.len() && chars[i].1.is_ascii_digit() {
            i += 1;
        }
    }
    let end = chars.get(i).map_or(source.len(), |(o, _)| *o);
    let text = &source[offset..end];
    let value = text
        .parse::<f64>()
        .map_err(|_| TokenizeError::UnrecognizedChar {
            ch: chars[start].1,
            offset,
            snippet: caret_snippet(source, offset),
        })?;
    Ok((
        Token {
            kind: TokenKind::Number(value),
            offset,
        },
        i,
    ))
}

/// Double-quoted string with `\"`, `\\`, `\n`, `\t` escapes. An
/// unrecognized escape passes the backslash and following character through
/// literally.
fn lex_string(
    source: &str,
    chars: &[(usize, char)],
    start: usize,
) -> Result<(Token, usize), TokenizeError> {
    let offset = chars[start].0;
    let mut value = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i].1 {
            '"' => {
                return Ok((
                    Token {
                        kind: TokenKind::Str(value),
                        offset,
                    },
                    i + 1,
                ));
            }
            '\\' => match chars.get(i + 1).map(|(_, c)| *c) {
                Some('"') => {
                    value.push('"');
                    i += 2;
                }
                Some('\\') => {
                    value.push('\\');
                    i += 2;
                }
                Some('n') => {
                    value.push('\n');
                    i += 2;
                }
                Some('t') => {
                    value.push('\t');
                    i += 2;
                }
                Some(other) => {
                    value.push('\\');
                    value.push(other);
                    i += 2;
                }
                None => break,
            },
            other => {
                value.push(other);
                i += 1;
            }
        }
    }
    Err(TokenizeError::UnterminatedString {
        offset,
        snippet: caret_snippet(source, offset),
    })
}

/// `` `any text` `` — the identifier is the literal text between backticks,
/// enabling column names with spaces.
fn lex_backtick(
    source: &str,
    chars: &[(usize, char)],
    start: usize,
) -> Result<(Token, usize), TokenizeError> {
    let offset = chars[start].0;
    let mut name = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i].1 == '`' {
            return Ok((
                Token {
                    kind: TokenKind::BacktickIdent(name),
                    offset,
                },
                i + 1,
            ));
        }
        name.push(chars[i].1);
        i += 1;
    }
    Err(TokenizeError::UnterminatedBacktick {
        offset,
        snippet: caret_snippet(source, offset),
    })
}

fn lex_word(chars: &[(usize, char)], start: usize) -> (Token, usize) {
    let offset = chars[start].0;
    let mut word = String::new();
    let mut i = start;
    while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
        word.push(chars[i].1);
        i += 1;
    }
    let kind = match word.as_str() {
        "true" => TokenKind::Bool(true),
        "false" => TokenKind::Bool(false),
        _ => TokenKind::Ident(word),
    };
    (Token { kind, offset }, i)
}

/// Render a window of the source with a `^` pointing at `offset`, for error
/// messages.
#[must_use]
pub fn caret_snippet(source: &str, offset: usize) -> String {
    let clamped = offset.min(source.len());
    let prefix: String = {
        let mut taken: Vec<char> = source[..clamped].chars().rev().take(40).collect();
        taken.reverse();
        taken.into_iter().collect()
    };
    let suffix: String = source[clamped..].chars().take(40).collect();
    let caret_col = prefix.chars().count();
    format!("  {prefix}{suffix}\n  {:caret_col$}^", "")
}
