use super::ConditionError;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    /// `true`/`false`/`always`/`never`, any case.
    Bool(bool),
    Not,
    And,
    Or,
    LParen,
    RParen,
    Cmp(CmpOp),
}

/// A token plus its byte offset in the source, for error messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub pos: usize,
}

pub fn tokenize(input: &str) -> Result<Vec<Spanned>, ConditionError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let token = match c {
            b'(' => {
                i += 1;
                Token::LParen
            }
            b')' => {
                i += 1;
                Token::RParen
            }
            b'&' | b'|' if bytes.get(i + 1) == Some(&c) => {
                i += 2;
                if c == b'&' {
                    Token::And
                } else {
                    Token::Or
                }
            }
            b'!' if bytes.get(i + 1) != Some(&b'=') => {
                i += 1;
                Token::Not
            }
            b'=' | b'!' | b'<' | b'>' => {
                let next = bytes.get(i + 1).copied();
                let (op, len) = match (c, next) {
                    (b'=', Some(b'=')) => (CmpOp::Eq, 2),
                    (b'!', Some(b'=')) => (CmpOp::Ne, 2),
                    (b'>', Some(b'=')) => (CmpOp::Ge, 2),
                    (b'<', Some(b'=')) => (CmpOp::Le, 2),
                    (b'>', _) => (CmpOp::Gt, 1),
                    (b'<', _) => (CmpOp::Lt, 1),
                    _ => {
                        return Err(ConditionError::UnexpectedChar {
                            ch: c as char,
                            pos: start,
                        })
                    }
                };
                i += len;
                Token::Cmp(op)
            }
            b'"' | b'\'' => {
                let quote = c;
                i += 1;
                let body_start = i;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                if i >= bytes.len() {
                    return Err(ConditionError::UnterminatedString { pos: start });
                }
                let body = input[body_start..i].to_string();
                i += 1;
                Token::Str(body)
            }
            b'0'..=b'9' => {
                let (token, end) = number(input, i)?;
                i = end;
                token
            }
            b'-' if bytes.get(i + 1).is_some_and(|b| b.is_ascii_digit()) => {
                let (token, end) = number(input, i + 1)?;
                i = end;
                match token {
                    Token::Int(n) => Token::Int(-n),
                    Token::Float(f) => Token::Float(-f),
                    other => other,
                }
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while i < bytes.len() && is_ident_byte(bytes[i]) {
                    i += 1;
                }
                keyword_or_ident(&input[start..i])
            }
            other => {
                // Report the full char, not a UTF-8 fragment
                let ch = input[start..].chars().next().unwrap_or(other as char);
                return Err(ConditionError::UnexpectedChar { ch, pos: start });
            }
        };

        tokens.push(Spanned { token, pos: start });
    }

    Ok(tokens)
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.'
}

fn keyword_or_ident(word: &str) -> Token {
    match word.to_ascii_lowercase().as_str() {
        "true" | "always" => Token::Bool(true),
        "false" | "never" => Token::Bool(false),
        "not" => Token::Not,
        "and" => Token::And,
        "or" => Token::Or,
        _ => Token::Ident(word.to_string()),
    }
}

/// Scan an unsigned number starting at `start`; returns the token and end offset.
fn number(input: &str, start: usize) -> Result<(Token, usize), ConditionError> {
    let bytes = input.as_bytes();
    let mut i = start;
    let mut seen_dot = false;
    while i < bytes.len() {
        match bytes[i] {
            b'0'..=b'9' => i += 1,
            b'.' if !seen_dot => {
                seen_dot = true;
                i += 1;
            }
            _ => break,
        }
    }
    // `12abc` is not a number followed by an identifier
    if i < bytes.len() && (bytes[i].is_ascii_alphabetic() || bytes[i] == b'_') {
        return Err(ConditionError::BadNumber {
            text: input[start..].split_whitespace().next().unwrap_or("").to_string(),
            pos: start,
        });
    }
    let text = &input[start..i];
    let bad = || ConditionError::BadNumber {
        text: text.to_string(),
        pos: start,
    };
    if seen_dot {
        text.parse::<f64>().map(|f| (Token::Float(f), i)).map_err(|_| bad())
    } else {
        text.parse::<i64>().map(|n| (Token::Int(n), i)).map_err(|_| bad())
    }
}
