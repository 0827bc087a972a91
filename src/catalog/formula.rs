//! Restricted arithmetic used to scale raw sensor readings
//!
//! A formula is a small expression over the single variable `value`, numeric literals
//! (`40`, `0.1`, `1e-3`), `+ - * /`, unary minus and parentheses. It is parsed once when
//! the catalog loads and evaluated per decoded frame without any interpreter.

use std::fmt;
use std::str::FromStr;

/// Variable name every formula is written against
pub const VALUE_VARIABLE: &str = "value";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormulaError {
    #[error("Unexpected character '{0}' at position {1}")]
    UnexpectedChar(char, usize),

    #[error("Unknown identifier '{0}', only '{VALUE_VARIABLE}' is allowed")]
    UnknownIdentifier(String),

    #[error("Invalid number literal '{0}'")]
    InvalidNumber(String),

    #[error("Unexpected end of formula")]
    UnexpectedEnd,

    #[error("Unexpected token {0} at position {1}")]
    UnexpectedToken(String, usize),

    #[error("Formula does not reference '{VALUE_VARIABLE}'")]
    MissingVariable,

    #[error("Formula produced a non-finite result for input {0}")]
    NonFinite(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Value,
    Plus,
    Minus,
    Star,
    Slash,
    Open,
    Close,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{}", n),
            Token::Value => write!(f, "{}", VALUE_VARIABLE),
            Token::Plus => write!(f, "'+'"),
            Token::Minus => write!(f, "'-'"),
            Token::Star => write!(f, "'*'"),
            Token::Slash => write!(f, "'/'"),
            Token::Open => write!(f, "'('"),
            Token::Close => write!(f, "')'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Value,
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, value: f64) -> f64 {
        match self {
            Expr::Number(n) => *n,
            Expr::Value => value,
            Expr::Neg(inner) => -inner.eval(value),
            Expr::Binary(op, lhs, rhs) => {
                let (l, r) = (lhs.eval(value), rhs.eval(value));
                match op {
                    BinaryOp::Add => l + r,
                    BinaryOp::Sub => l - r,
                    BinaryOp::Mul => l * r,
                    BinaryOp::Div => l / r,
                }
            }
        }
    }

    fn references_value(&self) -> bool {
        match self {
            Expr::Number(_) => false,
            Expr::Value => true,
            Expr::Neg(inner) => inner.references_value(),
            Expr::Binary(_, lhs, rhs) => lhs.references_value() || rhs.references_value(),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, FormulaError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];
        match c {
            c if c.is_whitespace() => pos += 1,
            '+' | '-' | '*' | '/' | '(' | ')' => {
                let token = match c {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '(' => Token::Open,
                    _ => Token::Close,
                };
                tokens.push((token, pos));
                pos += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = pos;
                while pos < chars.len() && (chars[pos].is_ascii_digit() || chars[pos] == '.') {
                    pos += 1;
                }
                pos = exponent_end(&chars, pos);
                let literal: String = chars[start..pos].iter().collect();
                let number = literal
                    .parse::<f64>()
                    .map_err(|_| FormulaError::InvalidNumber(literal.clone()))?;
                tokens.push((Token::Number(number), start));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = pos;
                while pos < chars.len() && (chars[pos].is_ascii_alphanumeric() || chars[pos] == '_')
                {
                    pos += 1;
                }
                let ident: String = chars[start..pos].iter().collect();
                if ident != VALUE_VARIABLE {
                    return Err(FormulaError::UnknownIdentifier(ident));
                }
                tokens.push((Token::Value, start));
            }
            other => return Err(FormulaError::UnexpectedChar(other, pos)),
        }
    }

    Ok(tokens)
}

/// End of an optional `e[+-]digits` suffix starting at `pos`
fn exponent_end(chars: &[char], pos: usize) -> usize {
    if !matches!(chars.get(pos), Some('e' | 'E')) {
        return pos;
    }
    let mut end = pos + 1;
    if matches!(chars.get(end), Some('+' | '-')) {
        end += 1;
    }
    let digits_start = end;
    while chars.get(end).is_some_and(char::is_ascii_digit) {
        end += 1;
    }
    if end == digits_start {
        pos
    } else {
        end
    }
}

/// Recursive descent over `expr := term (('+'|'-') term)*`,
/// `term := unary (('*'|'/') unary)*`, `unary := '-' unary | atom`.
struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).map(|(t, _)| *t)
    }

    fn next(&mut self) -> Option<(Token, usize)> {
        let token = self.tokens.get(self.pos).copied();
        self.pos += 1;
        token
    }

    fn expression(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;
        while let Some(token) = self.peek() {
            let op = match token {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.unary()?;
        while let Some(token) = self.peek() {
            let op = match token {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        if self.peek() == Some(Token::Minus) {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expr, FormulaError> {
        match self.next() {
            Some((Token::Number(n), _)) => Ok(Expr::Number(n)),
            Some((Token::Value, _)) => Ok(Expr::Value),
            Some((Token::Open, _)) => {
                let inner = self.expression()?;
                match self.next() {
                    Some((Token::Close, _)) => Ok(inner),
                    Some((token, at)) => Err(FormulaError::UnexpectedToken(token.to_string(), at)),
                    None => Err(FormulaError::UnexpectedEnd),
                }
            }
            Some((token, at)) => Err(FormulaError::UnexpectedToken(token.to_string(), at)),
            None => Err(FormulaError::UnexpectedEnd),
        }
    }
}

/// Parsed scale formula
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleFormula {
    source: String,
    expr: Expr,
}

impl ScaleFormula {
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expression()?;

        if let Some((token, at)) = parser.next() {
            return Err(FormulaError::UnexpectedToken(token.to_string(), at));
        }
        if !expr.references_value() {
            return Err(FormulaError::MissingVariable);
        }

        Ok(Self {
            source: source.trim().to_string(),
            expr,
        })
    }

    /// Applies the formula to a raw reading
    pub fn apply(&self, raw: f64) -> Result<f64, FormulaError> {
        let result = self.expr.eval(raw);
        if result.is_finite() {
            Ok(result)
        } else {
            Err(FormulaError::NonFinite(raw))
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl FromStr for ScaleFormula {
    type Err = FormulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ScaleFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_raw_value() {
        let formula = ScaleFormula::parse("value * 0.1").unwrap();
        assert_eq!(formula.apply(250.0).unwrap(), 25.0);
    }

    #[test]
    fn respects_precedence_and_parentheses() {
        let formula = ScaleFormula::parse("value - 40 * 2").unwrap();
        assert_eq!(formula.apply(100.0).unwrap(), 20.0);

        let formula = ScaleFormula::parse("(value - 40) * 2").unwrap();
        assert_eq!(formula.apply(100.0).unwrap(), 120.0);

        let formula = ScaleFormula::parse("-value / 4 + 1").unwrap();
        assert_eq!(formula.apply(8.0).unwrap(), -1.0);
    }

    #[test]
    fn literals_accept_exponents() {
        let formula = ScaleFormula::parse("value * 1e-3").unwrap();
        assert_eq!(formula.apply(2500.0).unwrap(), 2.5);

        let formula = ScaleFormula::parse("value*2E+2-1").unwrap();
        assert_eq!(formula.apply(1.0).unwrap(), 199.0);

        assert_eq!(
            ScaleFormula::parse("value * 2e"),
            Err(FormulaError::UnknownIdentifier("e".to_string()))
        );
    }

    #[test]
    fn identity_formula() {
        let formula = ScaleFormula::parse("value").unwrap();
        assert_eq!(formula.apply(42.0).unwrap(), 42.0);
    }

    #[test]
    fn rejects_foreign_identifiers() {
        assert_eq!(
            ScaleFormula::parse("__import__ * value"),
            Err(FormulaError::UnknownIdentifier("__import__".to_string()))
        );
        assert!(matches!(
            ScaleFormula::parse("value ** 2"),
            Err(FormulaError::UnexpectedToken(_, _))
        ));
        assert!(matches!(
            ScaleFormula::parse("value; 1"),
            Err(FormulaError::UnexpectedChar(';', _))
        ));
    }

    #[test]
    fn rejects_formula_without_variable() {
        assert_eq!(ScaleFormula::parse("3 * 4"), Err(FormulaError::MissingVariable));
    }

    #[test]
    fn rejects_unbalanced_input() {
        assert_eq!(ScaleFormula::parse("(value + 1"), Err(FormulaError::UnexpectedEnd));
        assert!(ScaleFormula::parse("value +").is_err());
        assert!(ScaleFormula::parse("").is_err());
    }

    #[test]
    fn division_by_zero_is_reported() {
        let formula = ScaleFormula::parse("100 / value").unwrap();
        assert_eq!(formula.apply(0.0), Err(FormulaError::NonFinite(0.0)));
    }
}
