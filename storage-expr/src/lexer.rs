// SPDX-License-Identifier: GPL-3.0-only

use crate::error::{ExprError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Int(i64),
    UInt(u64),
    Str(String),
    True,
    False,
    Null,
    In,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Question,
    Colon,
    Not,
    Minus,
    Plus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Eof,
}

/// A token and the byte offset it starts at.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub offset: usize,
}

pub fn tokenize(source: &str) -> Result<Vec<Spanned>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut index = 0;

    while index < bytes.len() {
        let c = bytes[index];

        if c.is_ascii_whitespace() {
            index += 1;
            continue;
        }

        let start = index;

        let token = match c {
            b'(' => single(&mut index, Token::LParen),
            b')' => single(&mut index, Token::RParen),
            b'[' => single(&mut index, Token::LBracket),
            b']' => single(&mut index, Token::RBracket),
            b',' => single(&mut index, Token::Comma),
            b'.' => single(&mut index, Token::Dot),
            b'?' => single(&mut index, Token::Question),
            b':' => single(&mut index, Token::Colon),
            b'+' => single(&mut index, Token::Plus),
            b'-' => single(&mut index, Token::Minus),
            b'*' => single(&mut index, Token::Star),
            b'/' => single(&mut index, Token::Slash),
            b'%' => single(&mut index, Token::Percent),
            b'!' => pair(bytes, &mut index, b'=', Token::NotEq, Token::Not),
            b'<' => pair(bytes, &mut index, b'=', Token::Le, Token::Lt),
            b'>' => pair(bytes, &mut index, b'=', Token::Ge, Token::Gt),
            b'=' => {
                if bytes.get(index + 1) == Some(&b'=') {
                    index += 2;
                    Token::EqEq
                } else {
                    return Err(syntax(start, "expected '=='"));
                }
            }
            b'&' => {
                if bytes.get(index + 1) == Some(&b'&') {
                    index += 2;
                    Token::AndAnd
                } else {
                    return Err(syntax(start, "expected '&&'"));
                }
            }
            b'|' => {
                if bytes.get(index + 1) == Some(&b'|') {
                    index += 2;
                    Token::OrOr
                } else {
                    return Err(syntax(start, "expected '||'"));
                }
            }
            b'"' | b'\'' => lex_string(source, &mut index)?,
            b'0'..=b'9' => lex_number(source, &mut index)?,
            c if c == b'_' || c.is_ascii_alphabetic() => {
                while index < bytes.len() && (bytes[index] == b'_' || bytes[index].is_ascii_alphanumeric()) {
                    index += 1;
                }

                match &source[start..index] {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "in" => Token::In,
                    ident => Token::Ident(ident.to_string()),
                }
            }
            other => {
                return Err(syntax(start, &format!("unexpected character '{}'", other as char)));
            }
        };

        tokens.push(Spanned { token, offset: start });
    }

    tokens.push(Spanned {
        token: Token::Eof,
        offset: bytes.len(),
    });

    Ok(tokens)
}

fn single(index: &mut usize, token: Token) -> Token {
    *index += 1;
    token
}

fn pair(bytes: &[u8], index: &mut usize, next: u8, matched: Token, alone: Token) -> Token {
    if bytes.get(*index + 1) == Some(&next) {
        *index += 2;
        matched
    } else {
        *index += 1;
        alone
    }
}

fn syntax(offset: usize, message: &str) -> ExprError {
    ExprError::Syntax {
        offset,
        message: message.to_string(),
    }
}

fn lex_string(source: &str, index: &mut usize) -> Result<Token> {
    let start = *index;
    let mut chars = source[start..].char_indices();
    let Some((_, quote)) = chars.next() else {
        return Err(syntax(start, "unterminated string"));
    };

    let mut value = String::new();

    while let Some((pos, c)) = chars.next() {
        match c {
            '\\' => {
                let Some((_, escaped)) = chars.next() else {
                    break;
                };

                value.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '0' => '\0',
                    '\\' => '\\',
                    '"' => '"',
                    '\'' => '\'',
                    other => {
                        return Err(syntax(start + pos, &format!("invalid escape '\\{other}'")));
                    }
                });
            }
            c if c == quote => {
                *index = start + pos + c.len_utf8();
                return Ok(Token::Str(value));
            }
            c => value.push(c),
        }
    }

    Err(syntax(start, "unterminated string"))
}

fn lex_number(source: &str, index: &mut usize) -> Result<Token> {
    let bytes = source.as_bytes();
    let start = *index;

    let (digits, radix) = if source[start..].starts_with("0x") || source[start..].starts_with("0X") {
        *index += 2;
        let digits_start = *index;
        while *index < bytes.len() && bytes[*index].is_ascii_hexdigit() {
            *index += 1;
        }
        (&source[digits_start..*index], 16)
    } else {
        while *index < bytes.len() && bytes[*index].is_ascii_digit() {
            *index += 1;
        }
        (&source[start..*index], 10)
    };

    if digits.is_empty() {
        return Err(syntax(start, "malformed number"));
    }

    let unsigned = matches!(bytes.get(*index), Some(b'u') | Some(b'U'));
    if unsigned {
        *index += 1;
    }

    if *index < bytes.len() && (bytes[*index].is_ascii_alphanumeric() || bytes[*index] == b'_') {
        return Err(syntax(start, "malformed number"));
    }

    if unsigned {
        u64::from_str_radix(digits, radix)
            .map(Token::UInt)
            .map_err(|_| syntax(start, "integer literal out of range"))
    } else {
        i64::from_str_radix(digits, radix)
            .map(Token::Int)
            .map_err(|_| syntax(start, "integer literal out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|spanned| spanned.token)
            .collect()
    }

    #[test]
    fn tokenizes_locator_expression() {
        assert_eq!(
            kinds(r#"volume.partition_label == "STATE" && volume.size >= 0x100000u"#),
            vec![
                Token::Ident("volume".into()),
                Token::Dot,
                Token::Ident("partition_label".into()),
                Token::EqEq,
                Token::Str("STATE".into()),
                Token::AndAnd,
                Token::Ident("volume".into()),
                Token::Dot,
                Token::Ident("size".into()),
                Token::Ge,
                Token::UInt(0x100000),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn handles_escapes_and_single_quotes() {
        assert_eq!(
            kinds(r#"'it\'s' "a\"b""#),
            vec![Token::Str("it's".into()), Token::Str("a\"b".into()), Token::Eof]
        );
    }

    #[test]
    fn rejects_single_ampersand() {
        assert!(matches!(tokenize("a & b"), Err(ExprError::Syntax { offset: 2, .. })));
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(tokenize("\"abc").is_err());
    }

    #[test]
    fn rejects_trailing_garbage_in_number() {
        assert!(tokenize("12abc").is_err());
    }
}
