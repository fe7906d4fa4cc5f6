use conclave_core::types::DecisionValue;

use super::lexer::{tokenize, CmpOp, Spanned, Token};
use super::ConditionError;

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(DecisionValue),
    Var(String),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    /// `first op1 second op2 third ...`, evaluated pairwise left to right.
    Compare {
        first: Box<Expr>,
        rest: Vec<(CmpOp, Expr)>,
    },
}

impl Expr {
    /// Every identifier referenced by the expression, in order of appearance.
    pub fn identifiers(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_identifiers(&mut out);
        out
    }

    fn collect_identifiers<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Var(name) => out.push(name),
            Expr::Not(inner) => inner.collect_identifiers(out),
            Expr::And(items) | Expr::Or(items) => {
                for item in items {
                    item.collect_identifiers(out);
                }
            }
            Expr::Compare { first, rest } => {
                first.collect_identifiers(out);
                for (_, operand) in rest {
                    operand.collect_identifiers(out);
                }
            }
        }
    }
}

/// Parse a condition string.
///
/// Precedence, loosest first: `OR`, `AND`, `NOT`, comparisons, primaries.
pub fn parse(input: &str) -> Result<Expr, ConditionError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ConditionError::Empty);
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.len(),
    };
    let expr = parser.parse_or()?;
    if let Some(extra) = parser.peek() {
        return Err(ConditionError::TrailingInput {
            pos: extra.pos,
            found: describe(&extra.token),
        });
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Spanned> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek().is_some_and(|s| &s.token == token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut items = vec![self.parse_and()?];
        while self.eat(&Token::Or) {
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::Or(items)
        })
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut items = vec![self.parse_not()?];
        while self.eat(&Token::And) {
            items.push(self.parse_not()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::And(items)
        })
    }

    fn parse_not(&mut self) -> Result<Expr, ConditionError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ConditionError> {
        let first = self.parse_primary()?;
        let mut rest = Vec::new();
        while let Some(Token::Cmp(op)) = self.peek().map(|s| s.token.clone()) {
            self.pos += 1;
            rest.push((op, self.parse_primary()?));
        }
        Ok(if rest.is_empty() {
            first
        } else {
            Expr::Compare {
                first: Box::new(first),
                rest,
            }
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        let Some(spanned) = self.advance() else {
            return Err(ConditionError::UnexpectedEnd { pos: self.end });
        };
        match spanned.token {
            Token::Ident(name) => Ok(Expr::Var(name)),
            Token::Int(n) => Ok(Expr::Literal(DecisionValue::Int(n))),
            Token::Float(f) => Ok(Expr::Literal(DecisionValue::Float(f))),
            Token::Str(s) => Ok(Expr::Literal(DecisionValue::Str(s))),
            Token::Bool(b) => Ok(Expr::Literal(DecisionValue::Bool(b))),
            Token::LParen => {
                let inner = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    return Err(match self.peek() {
                        Some(s) => ConditionError::Expected {
                            expected: "')'",
                            found: describe(&s.token),
                            pos: s.pos,
                        },
                        None => ConditionError::UnexpectedEnd { pos: self.end },
                    });
                }
                Ok(inner)
            }
            other => Err(ConditionError::Expected {
                expected: "a value, identifier or '('",
                found: describe(&other),
                pos: spanned.pos,
            }),
        }
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Ident(name) => format!("identifier '{}'", name),
        Token::Int(n) => format!("number {}", n),
        Token::Float(f) => format!("number {}", f),
        Token::Str(s) => format!("string '{}'", s),
        Token::Bool(b) => format!("literal {}", b),
        Token::Not => "NOT".into(),
        Token::And => "AND".into(),
        Token::Or => "OR".into(),
        Token::LParen => "'('".into(),
        Token::RParen => "')'".into(),
        Token::Cmp(op) => format!("'{}'", op.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> Expr {
        Expr::Var(name.into())
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let expr = parse("a OR b AND c").unwrap();
        assert_eq!(
            expr,
            Expr::Or(vec![var("a"), Expr::And(vec![var("b"), var("c")])])
        );
    }

    #[test]
    fn test_parentheses_override() {
        let expr = parse("(a OR b) AND c").unwrap();
        assert_eq!(
            expr,
            Expr::And(vec![Expr::Or(vec![var("a"), var("b")]), var("c")])
        );
    }

    #[test]
    fn test_not_binds_tightest() {
        let expr = parse("NOT a AND b").unwrap();
        assert_eq!(
            expr,
            Expr::And(vec![Expr::Not(Box::new(var("a"))), var("b")])
        );
    }

    #[test]
    fn test_chained_comparison() {
        let expr = parse("turn_count < 10 < 20").unwrap();
        assert_eq!(
            expr,
            Expr::Compare {
                first: Box::new(var("turn_count")),
                rest: vec![
                    (CmpOp::Lt, Expr::Literal(DecisionValue::Int(10))),
                    (CmpOp::Lt, Expr::Literal(DecisionValue::Int(20))),
                ],
            }
        );
    }

    #[test]
    fn test_identifiers() {
        let expr = parse("approved AND (score > 7 OR NOT blocked)").unwrap();
        assert_eq!(expr.identifiers(), vec!["approved", "score", "blocked"]);
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(parse(""), Err(ConditionError::Empty)));
        assert!(matches!(
            parse("a AND"),
            Err(ConditionError::UnexpectedEnd { .. })
        ));
        assert!(matches!(
            parse("(a OR b"),
            Err(ConditionError::UnexpectedEnd { .. })
        ));
        assert!(matches!(
            parse("a b"),
            Err(ConditionError::TrailingInput { .. })
        ));
        assert!(matches!(
            parse("== 3"),
            Err(ConditionError::Expected { .. })
        ));
    }
}
