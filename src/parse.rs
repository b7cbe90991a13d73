//! Definition parser.
//!
//! Turns a variable definition string into an expression tree. The grammar,
//! from loosest to tightest binding:
//!
//! ```text
//! expr   := cmp
//! cmp    := add ( ( '<' | '>' | '<=' | '>=' | '==' ) add )?
//! add    := mul ( ('+' | '-') mul )*
//! mul    := unary ( ('*' | '/') unary )*
//! unary  := ('+' | '-') unary | pow
//! pow    := atom ( '**' unary )?
//! atom   := number | string | var | func | '(' expr ')'
//! var    := NAME ( '[' index ( ',' index )* ']' )?
//! index  := int | int? ':' int? ( ':' int? )?
//! func   := NAME '(' ( arg ( ',' arg )* )? ')'
//! arg    := NAME '=' expr | expr
//! ```
//!
//! Operators applied to numeric literals are folded during parsing, so a
//! definition like `2 + 3*4` parses to the single literal `14`. Unary plus is
//! the identity and leaves no trace in the tree.

use std::fmt;

use crate::index::Selector;

#[derive(Debug, PartialEq)]
pub enum ParseError {
    UnexpectedChar { pos: usize, found: char },
    UnexpectedToken { pos: usize, found: String },
    UnexpectedEnd,
    InvalidNumber { pos: usize, text: String },
    UnterminatedString { pos: usize },
    InvalidKeyword { pos: usize },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::UnexpectedChar { pos, found } => {
                write!(f, "unexpected character '{}' at position {}", found, pos)
            }
            ParseError::UnexpectedToken { pos, found } => {
                write!(f, "unexpected \"{}\" at position {}", found, pos)
            }
            ParseError::UnexpectedEnd => write!(f, "unexpected end of definition"),
            ParseError::InvalidNumber { pos, text } => {
                write!(f, "invalid number \"{}\" at position {}", text, pos)
            }
            ParseError::UnterminatedString { pos } => {
                write!(f, "unterminated string starting at position {}", pos)
            }
            ParseError::InvalidKeyword { pos } => write!(
                f,
                "keyword argument at position {} must be a plain name",
                pos
            ),
        }
    }
}

/// Operator symbols recognized in definitions.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum OpSymbol {
    Neg,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
}

impl OpSymbol {
    pub fn symbol(&self) -> &'static str {
        match self {
            OpSymbol::Neg => "-",
            OpSymbol::Add => "+",
            OpSymbol::Sub => "-",
            OpSymbol::Mul => "*",
            OpSymbol::Div => "/",
            OpSymbol::Pow => "**",
            OpSymbol::Lt => "<",
            OpSymbol::Gt => ">",
            OpSymbol::Le => "<=",
            OpSymbol::Ge => ">=",
            OpSymbol::Eq => "==",
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            OpSymbol::Neg => 1,
            _ => 2,
        }
    }
}

impl fmt::Display for OpSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// A parsed definition expression.
#[derive(Clone, PartialEq, Debug)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Var {
        name: String,
        indices: Vec<Selector>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Op {
        symbol: OpSymbol,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn var<N: Into<String>>(name: N) -> Self {
        Expr::Var {
            name: name.into(),
            indices: Vec::new(),
        }
    }

    /// The numeric value of a literal, if this is one.
    pub fn literal(&self) -> Option<f64> {
        match self {
            Expr::Int(value) => Some(*value as f64),
            Expr::Float(value) => Some(*value),
            _ => None,
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    Assign,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Colon,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Int(value) => value.to_string(),
            Token::Float(value) => value.to_string(),
            Token::Str(text) => format!("'{}'", text),
            Token::Name(name) => name.clone(),
            Token::Plus => String::from("+"),
            Token::Minus => String::from("-"),
            Token::Star => String::from("*"),
            Token::StarStar => String::from("**"),
            Token::Slash => String::from("/"),
            Token::Lt => String::from("<"),
            Token::Gt => String::from(">"),
            Token::Le => String::from("<="),
            Token::Ge => String::from(">="),
            Token::EqEq => String::from("=="),
            Token::Assign => String::from("="),
            Token::LParen => String::from("("),
            Token::RParen => String::from(")"),
            Token::LBracket => String::from("["),
            Token::RBracket => String::from("]"),
            Token::Comma => String::from(","),
            Token::Colon => String::from(":"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ParseError> {
    let mut tokens = Vec::new();
    let chars = input.char_indices().collect::<Vec<_>>();
    let mut at = 0;

    while at < chars.len() {
        let (pos, ch) = chars[at];

        match ch {
            ' ' | '\t' | '\n' | '\r' => at += 1,
            '+' => {
                tokens.push((pos, Token::Plus));
                at += 1;
            }
            '-' => {
                tokens.push((pos, Token::Minus));
                at += 1;
            }
            '*' => {
                if chars.get(at + 1).map(|(_, ch)| *ch) == Some('*') {
                    tokens.push((pos, Token::StarStar));
                    at += 2;
                } else {
                    tokens.push((pos, Token::Star));
                    at += 1;
                }
            }
            '/' => {
                tokens.push((pos, Token::Slash));
                at += 1;
            }
            '<' => {
                if chars.get(at + 1).map(|(_, ch)| *ch) == Some('=') {
                    tokens.push((pos, Token::Le));
                    at += 2;
                } else {
                    tokens.push((pos, Token::Lt));
                    at += 1;
                }
            }
            '>' => {
                if chars.get(at + 1).map(|(_, ch)| *ch) == Some('=') {
                    tokens.push((pos, Token::Ge));
                    at += 2;
                } else {
                    tokens.push((pos, Token::Gt));
                    at += 1;
                }
            }
            '=' => {
                if chars.get(at + 1).map(|(_, ch)| *ch) == Some('=') {
                    tokens.push((pos, Token::EqEq));
                    at += 2;
                } else {
                    tokens.push((pos, Token::Assign));
                    at += 1;
                }
            }
            '(' => {
                tokens.push((pos, Token::LParen));
                at += 1;
            }
            ')' => {
                tokens.push((pos, Token::RParen));
                at += 1;
            }
            '[' => {
                tokens.push((pos, Token::LBracket));
                at += 1;
            }
            ']' => {
                tokens.push((pos, Token::RBracket));
                at += 1;
            }
            ',' => {
                tokens.push((pos, Token::Comma));
                at += 1;
            }
            ':' => {
                tokens.push((pos, Token::Colon));
                at += 1;
            }
            '\'' | '"' => {
                let quote = ch;
                let start = at + 1;
                let mut end = start;
                while end < chars.len() && chars[end].1 != quote {
                    end += 1;
                }
                if end == chars.len() {
                    return Err(ParseError::UnterminatedString { pos });
                }
                let text = chars[start..end].iter().map(|(_, ch)| ch).collect();
                tokens.push((pos, Token::Str(text)));
                at = end + 1;
            }
            _ if ch.is_ascii_digit() => {
                let start = at;
                let mut end = at;
                let mut is_float = false;

                while end < chars.len() && chars[end].1.is_ascii_digit() {
                    end += 1;
                }
                if end < chars.len() && chars[end].1 == '.' {
                    is_float = true;
                    end += 1;
                    while end < chars.len() && chars[end].1.is_ascii_digit() {
                        end += 1;
                    }
                }
                if end < chars.len() && (chars[end].1 == 'e' || chars[end].1 == 'E') {
                    let mut exp_end = end + 1;
                    if exp_end < chars.len() && (chars[exp_end].1 == '+' || chars[exp_end].1 == '-')
                    {
                        exp_end += 1;
                    }
                    if exp_end < chars.len() && chars[exp_end].1.is_ascii_digit() {
                        is_float = true;
                        end = exp_end;
                        while end < chars.len() && chars[end].1.is_ascii_digit() {
                            end += 1;
                        }
                    }
                }

                let text = chars[start..end].iter().map(|(_, ch)| ch).collect::<String>();
                let token = if is_float {
                    match text.parse::<f64>() {
                        Ok(value) => Token::Float(value),
                        Err(_) => return Err(ParseError::InvalidNumber { pos, text }),
                    }
                } else {
                    match text.parse::<i64>() {
                        Ok(value) => Token::Int(value),
                        Err(_) => return Err(ParseError::InvalidNumber { pos, text }),
                    }
                };
                tokens.push((pos, token));
                at = end;
            }
            _ if ch.is_ascii_alphabetic() || ch == '_' => {
                let start = at;
                let mut end = at;
                while end < chars.len()
                    && (chars[end].1.is_ascii_alphanumeric() || chars[end].1 == '_')
                {
                    end += 1;
                }
                let name = chars[start..end].iter().map(|(_, ch)| ch).collect();
                tokens.push((pos, Token::Name(name)));
                at = end;
            }
            found => return Err(ParseError::UnexpectedChar { pos, found }),
        }
    }

    Ok(tokens)
}

/// Parses a definition string into an expression tree.
pub fn parse_definition(input: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, at: 0 };
    let expr = parser.parse_cmp()?;
    parser.expect_end()?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    at: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.at).map(|(_, token)| token)
    }

    fn peek_second(&self) -> Option<&Token> {
        self.tokens.get(self.at + 1).map(|(_, token)| token)
    }

    fn advance(&mut self) -> Result<Token, ParseError> {
        match self.tokens.get(self.at) {
            Some((_, token)) => {
                let token = token.clone();
                self.at += 1;
                Ok(token)
            }
            None => Err(ParseError::UnexpectedEnd),
        }
    }

    fn pos(&self) -> usize {
        self.tokens
            .get(self.at)
            .map(|(pos, _)| *pos)
            .unwrap_or_else(|| {
                self.tokens
                    .last()
                    .map(|(pos, _)| pos + 1)
                    .unwrap_or(0)
            })
    }

    fn unexpected<T>(&self) -> Result<T, ParseError> {
        match self.tokens.get(self.at) {
            Some((pos, token)) => Err(ParseError::UnexpectedToken {
                pos: *pos,
                found: token.describe(),
            }),
            None => Err(ParseError::UnexpectedEnd),
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ParseError> {
        match self.peek() {
            Some(token) if token == expected => {
                self.at += 1;
                Ok(())
            }
            _ => self.unexpected(),
        }
    }

    fn expect_end(&self) -> Result<(), ParseError> {
        if self.at == self.tokens.len() {
            Ok(())
        } else {
            self.unexpected()
        }
    }

    fn parse_cmp(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_add()?;

        let symbol = match self.peek() {
            Some(Token::Lt) => OpSymbol::Lt,
            Some(Token::Gt) => OpSymbol::Gt,
            Some(Token::Le) => OpSymbol::Le,
            Some(Token::Ge) => OpSymbol::Ge,
            Some(Token::EqEq) => OpSymbol::Eq,
            _ => return Ok(left),
        };
        self.at += 1;

        let right = self.parse_add()?;
        Ok(fold_binary(symbol, left, right))
    }

    fn parse_add(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_mul()?;

        loop {
            let symbol = match self.peek() {
                Some(Token::Plus) => OpSymbol::Add,
                Some(Token::Minus) => OpSymbol::Sub,
                _ => return Ok(left),
            };
            self.at += 1;

            let right = self.parse_mul()?;
            left = fold_binary(symbol, left, right);
        }
    }

    fn parse_mul(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;

        loop {
            let symbol = match self.peek() {
                Some(Token::Star) => OpSymbol::Mul,
                Some(Token::Slash) => OpSymbol::Div,
                _ => return Ok(left),
            };
            self.at += 1;

            let right = self.parse_unary()?;
            left = fold_binary(symbol, left, right);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(Token::Plus) => {
                // Unary plus is the identity and is elided.
                self.at += 1;
                self.parse_unary()
            }
            Some(Token::Minus) => {
                self.at += 1;
                let inner = self.parse_unary()?;
                Ok(fold_negate(inner))
            }
            _ => self.parse_pow(),
        }
    }

    fn parse_pow(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_atom()?;

        if self.peek() == Some(&Token::StarStar) {
            self.at += 1;
            let exponent = self.parse_unary()?;
            Ok(fold_binary(OpSymbol::Pow, base, exponent))
        } else {
            Ok(base)
        }
    }

    fn parse_atom(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(Token::Int(_)) | Some(Token::Float(_)) | Some(Token::Str(_)) => {
                match self.advance()? {
                    Token::Int(value) => Ok(Expr::Int(value)),
                    Token::Float(value) => Ok(Expr::Float(value)),
                    Token::Str(text) => Ok(Expr::Str(text)),
                    _ => unreachable!(),
                }
            }
            Some(Token::LParen) => {
                self.at += 1;
                let inner = self.parse_cmp()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Name(_)) => {
                let name = match self.advance()? {
                    Token::Name(name) => name,
                    _ => unreachable!(),
                };

                match self.peek() {
                    Some(Token::LParen) => self.parse_call(name),
                    Some(Token::LBracket) => {
                        self.at += 1;
                        let mut indices = vec![self.parse_index()?];
                        while self.peek() == Some(&Token::Comma) {
                            self.at += 1;
                            indices.push(self.parse_index()?);
                        }
                        self.expect(&Token::RBracket)?;
                        Ok(Expr::Var { name, indices })
                    }
                    _ => Ok(Expr::Var {
                        name,
                        indices: Vec::new(),
                    }),
                }
            }
            _ => self.unexpected(),
        }
    }

    fn parse_call(&mut self, name: String) -> Result<Expr, ParseError> {
        self.expect(&Token::LParen)?;

        let mut args = Vec::new();
        let mut kwargs = Vec::new();

        if self.peek() != Some(&Token::RParen) {
            loop {
                // A name directly followed by `=` is a keyword argument.
                let is_keyword = matches!(self.peek(), Some(Token::Name(_)))
                    && self.peek_second() == Some(&Token::Assign);

                if is_keyword {
                    let key = match self.advance()? {
                        Token::Name(key) => key,
                        _ => unreachable!(),
                    };
                    self.at += 1;
                    kwargs.push((key, self.parse_cmp()?));
                } else {
                    let pos = self.pos();
                    let value = self.parse_cmp()?;
                    if self.peek() == Some(&Token::Assign) {
                        // Something like `f(1 = 2)`.
                        return Err(ParseError::InvalidKeyword { pos });
                    }
                    if !kwargs.is_empty() {
                        return Err(ParseError::UnexpectedToken {
                            pos,
                            found: String::from("positional argument after keyword argument"),
                        });
                    }
                    args.push(value);
                }

                match self.peek() {
                    Some(Token::Comma) => self.at += 1,
                    _ => break,
                }
            }
        }

        self.expect(&Token::RParen)?;
        Ok(Expr::Call { name, args, kwargs })
    }

    fn parse_index(&mut self) -> Result<Selector, ParseError> {
        let start = self.parse_index_int()?;

        if self.peek() != Some(&Token::Colon) {
            return match start {
                Some(index) => Ok(Selector::Int(index)),
                None => self.unexpected(),
            };
        }
        self.at += 1;

        let stop = self.parse_index_int()?;
        let step = if self.peek() == Some(&Token::Colon) {
            self.at += 1;
            self.parse_index_int()?
        } else {
            None
        };

        Ok(Selector::Slice { start, stop, step })
    }

    fn parse_index_int(&mut self) -> Result<Option<i64>, ParseError> {
        let (signed, negate) = match self.peek() {
            Some(Token::Minus) => {
                self.at += 1;
                (true, true)
            }
            Some(Token::Plus) => {
                self.at += 1;
                (true, false)
            }
            _ => (false, false),
        };

        match self.peek() {
            Some(Token::Int(value)) => {
                let value = *value;
                self.at += 1;
                Ok(Some(if negate { -value } else { value }))
            }
            _ if signed => self.unexpected(),
            _ => Ok(None),
        }
    }
}

fn fold_negate(inner: Expr) -> Expr {
    match inner {
        Expr::Int(value) => Expr::Int(-value),
        Expr::Float(value) => Expr::Float(-value),
        inner => Expr::Op {
            symbol: OpSymbol::Neg,
            args: vec![inner],
        },
    }
}

fn fold_binary(symbol: OpSymbol, left: Expr, right: Expr) -> Expr {
    let folded = match (&left, &right) {
        (Expr::Int(a), Expr::Int(b)) => fold_ints(symbol, *a, *b),
        _ => match (left.literal(), right.literal()) {
            (Some(a), Some(b)) => fold_floats(symbol, a, b),
            _ => None,
        },
    };

    folded.unwrap_or(Expr::Op {
        symbol,
        args: vec![left, right],
    })
}

fn fold_ints(symbol: OpSymbol, a: i64, b: i64) -> Option<Expr> {
    match symbol {
        OpSymbol::Add => a.checked_add(b).map(Expr::Int),
        OpSymbol::Sub => a.checked_sub(b).map(Expr::Int),
        OpSymbol::Mul => a.checked_mul(b).map(Expr::Int),
        // Division is true division; an integer quotient would change the
        // value of definitions like `1/2`.
        OpSymbol::Div => fold_floats(symbol, a as f64, b as f64),
        OpSymbol::Pow => {
            if b >= 0 && b <= u32::MAX as i64 {
                a.checked_pow(b as u32).map(Expr::Int)
            } else {
                fold_floats(symbol, a as f64, b as f64)
            }
        }
        _ => fold_floats(symbol, a as f64, b as f64),
    }
}

fn fold_floats(symbol: OpSymbol, a: f64, b: f64) -> Option<Expr> {
    let value = match symbol {
        OpSymbol::Add => a + b,
        OpSymbol::Sub => a - b,
        OpSymbol::Mul => a * b,
        OpSymbol::Div => a / b,
        OpSymbol::Pow => a.powf(b),
        OpSymbol::Lt => return Some(Expr::Int((a < b) as i64)),
        OpSymbol::Gt => return Some(Expr::Int((a > b) as i64)),
        OpSymbol::Le => return Some(Expr::Int((a <= b) as i64)),
        OpSymbol::Ge => return Some(Expr::Int((a >= b) as i64)),
        OpSymbol::Eq => return Some(Expr::Int((a == b) as i64)),
        OpSymbol::Neg => return None,
    };
    Some(Expr::Float(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Expr {
        parse_definition(input).unwrap()
    }

    #[test]
    fn integer() {
        assert_eq!(parse("143"), Expr::Int(143));
        assert_eq!(parse("+143"), Expr::Int(143));
        assert_eq!(parse("-143"), Expr::Int(-143));
    }

    #[test]
    fn float() {
        assert_eq!(parse("12.34"), Expr::Float(12.34));
        assert_eq!(parse("1e3"), Expr::Float(1000.0));
        assert_eq!(parse("2.5e-1"), Expr::Float(0.25));
    }

    #[test]
    fn variable_names() {
        assert_eq!(parse("x"), Expr::var("x"));
        assert_eq!(parse("time"), Expr::var("time"));
        assert_eq!(parse("+x"), Expr::var("x"));
        assert_eq!(
            parse("-x"),
            Expr::Op {
                symbol: OpSymbol::Neg,
                args: vec![Expr::var("x")],
            }
        );
    }

    #[test]
    fn variable_indices() {
        assert_eq!(
            parse("x[2]"),
            Expr::Var {
                name: String::from("x"),
                indices: vec![Selector::Int(2)],
            }
        );
        assert_eq!(
            parse("x[-2]"),
            Expr::Var {
                name: String::from("x"),
                indices: vec![Selector::Int(-2)],
            }
        );
        assert_eq!(
            parse("xyz[ 2 , -3 ,4]"),
            Expr::Var {
                name: String::from("xyz"),
                indices: vec![Selector::Int(2), Selector::Int(-3), Selector::Int(4)],
            }
        );
    }

    #[test]
    fn variable_slices() {
        assert_eq!(
            parse("x[2:-3:4]"),
            Expr::Var {
                name: String::from("x"),
                indices: vec![Selector::Slice {
                    start: Some(2),
                    stop: Some(-3),
                    step: Some(4),
                }],
            }
        );
        assert_eq!(
            parse("x[2:-3:4, 7]"),
            Expr::Var {
                name: String::from("x"),
                indices: vec![
                    Selector::Slice {
                        start: Some(2),
                        stop: Some(-3),
                        step: Some(4),
                    },
                    Selector::Int(7),
                ],
            }
        );
        assert_eq!(
            parse("x[:-3:4]"),
            Expr::Var {
                name: String::from("x"),
                indices: vec![Selector::Slice {
                    start: None,
                    stop: Some(-3),
                    step: Some(4),
                }],
            }
        );
        assert_eq!(
            parse("x[1::4]"),
            Expr::Var {
                name: String::from("x"),
                indices: vec![Selector::Slice {
                    start: Some(1),
                    stop: None,
                    step: Some(4),
                }],
            }
        );
        assert_eq!(
            parse("x[1:4]"),
            Expr::Var {
                name: String::from("x"),
                indices: vec![Selector::Slice {
                    start: Some(1),
                    stop: Some(4),
                    step: None,
                }],
            }
        );
    }

    #[test]
    fn function_calls() {
        assert_eq!(
            parse("f()"),
            Expr::Call {
                name: String::from("f"),
                args: vec![],
                kwargs: vec![],
            }
        );
        assert_eq!(
            parse("f(1)"),
            Expr::Call {
                name: String::from("f"),
                args: vec![Expr::Int(1)],
                kwargs: vec![],
            }
        );
        assert_eq!(
            parse("f(\"1\")"),
            Expr::Call {
                name: String::from("f"),
                args: vec![Expr::Str(String::from("1"))],
                kwargs: vec![],
            }
        );
        assert_eq!(parse("f('1')"), parse("f(\"1\")"));
    }

    #[test]
    fn function_keyword_arguments() {
        assert_eq!(
            parse("f(x=4)"),
            Expr::Call {
                name: String::from("f"),
                args: vec![],
                kwargs: vec![(String::from("x"), Expr::Int(4))],
            }
        );
        assert_eq!(
            parse("f(1, a = 4)"),
            Expr::Call {
                name: String::from("f"),
                args: vec![Expr::Int(1)],
                kwargs: vec![(String::from("a"), Expr::Int(4))],
            }
        );
        assert_eq!(
            parse("f(1, 2, a = 4, b=-8)"),
            Expr::Call {
                name: String::from("f"),
                args: vec![Expr::Int(1), Expr::Int(2)],
                kwargs: vec![
                    (String::from("a"), Expr::Int(4)),
                    (String::from("b"), Expr::Int(-8)),
                ],
            }
        );
    }

    #[test]
    fn negated_function_call() {
        assert_eq!(
            parse("-f()"),
            Expr::Op {
                symbol: OpSymbol::Neg,
                args: vec![Expr::Call {
                    name: String::from("f"),
                    args: vec![],
                    kwargs: vec![],
                }],
            }
        );
    }

    #[test]
    fn constant_folding() {
        assert_eq!(parse("1 + 3.5"), Expr::Float(4.5));
        assert_eq!(parse("1 - 3.5"), Expr::Float(-2.5));
        assert_eq!(parse("2 * 3.5"), Expr::Float(7.0));
        assert_eq!(parse("2 / 3.5"), Expr::Float(4.0 / 7.0));
        assert_eq!(parse("2 ** 3.5"), Expr::Float(2f64.powf(3.5)));
        assert_eq!(parse("2 + 3*4"), Expr::Int(14));
    }

    #[test]
    fn folded_comparisons() {
        assert_eq!(parse("2 < 3"), Expr::Int(1));
        assert_eq!(parse("5 > 3"), Expr::Int(1));
        assert_eq!(parse("3 <= 3"), Expr::Int(1));
        assert_eq!(parse("3 >= 3"), Expr::Int(1));
        assert_eq!(parse("3 == 3"), Expr::Int(1));
        assert_eq!(parse("4 == 3"), Expr::Int(0));
    }

    #[test]
    fn comparison_with_variable() {
        assert_eq!(
            parse("x[2,3] > 4.0"),
            Expr::Op {
                symbol: OpSymbol::Gt,
                args: vec![
                    Expr::Var {
                        name: String::from("x"),
                        indices: vec![Selector::Int(2), Selector::Int(3)],
                    },
                    Expr::Float(4.0),
                ],
            }
        );
    }

    #[test]
    fn precedence_chain() {
        assert_eq!(
            parse("6 + -5.0/2 ** 3 - 2*3/2.0 + -(2**2) + (2*2)**3"),
            Expr::Float(6.0 - 5.0 / 8.0 - 3.0 - 4.0 + 64.0)
        );
    }

    #[test]
    fn partial_folding_keeps_structure() {
        // `1 + x` cannot fold, but the operator tree is right.
        assert_eq!(
            parse("1 + x"),
            Expr::Op {
                symbol: OpSymbol::Add,
                args: vec![Expr::Int(1), Expr::var("x")],
            }
        );
    }

    #[test]
    fn grouping() {
        assert_eq!(
            parse("2*(f(1,2, c=4) - x[2:3])"),
            Expr::Op {
                symbol: OpSymbol::Mul,
                args: vec![
                    Expr::Int(2),
                    Expr::Op {
                        symbol: OpSymbol::Sub,
                        args: vec![
                            Expr::Call {
                                name: String::from("f"),
                                args: vec![Expr::Int(1), Expr::Int(2)],
                                kwargs: vec![(String::from("c"), Expr::Int(4))],
                            },
                            Expr::Var {
                                name: String::from("x"),
                                indices: vec![Selector::slice(2, 3)],
                            },
                        ],
                    },
                ],
            }
        );
    }

    #[test]
    fn long_sum_of_scaled_variables() {
        // The shape of chains like a*60/68 + b*120/136 + c*180/204.
        let parsed = parse("MEG_ISOP*60/68+MEG_MTERP*120/136+MEG_BCARY*180/204");
        let scaled = |name: &str, num: i64, den: i64| Expr::Op {
            symbol: OpSymbol::Div,
            args: vec![
                Expr::Op {
                    symbol: OpSymbol::Mul,
                    args: vec![Expr::var(name), Expr::Int(num)],
                },
                Expr::Int(den),
            ],
        };
        assert_eq!(
            parsed,
            Expr::Op {
                symbol: OpSymbol::Add,
                args: vec![
                    Expr::Op {
                        symbol: OpSymbol::Add,
                        args: vec![
                            scaled("MEG_ISOP", 60, 68),
                            scaled("MEG_MTERP", 120, 136),
                        ],
                    },
                    scaled("MEG_BCARY", 180, 204),
                ],
            }
        );
    }

    #[test]
    fn pow_binds_tighter_than_unary() {
        // -2**2 is -(2**2).
        assert_eq!(parse("-2 ** 2"), Expr::Int(-4));
        // 2**-3 parses the unary through the right side.
        assert_eq!(parse("2 ** -3"), Expr::Float(2f64.powi(-3)));
    }

    #[test]
    fn errors() {
        assert!(matches!(
            parse_definition("x +"),
            Err(ParseError::UnexpectedEnd)
        ));
        assert!(matches!(
            parse_definition("f(1"),
            Err(ParseError::UnexpectedEnd)
        ));
        assert!(matches!(
            parse_definition("x[1"),
            Err(ParseError::UnexpectedEnd)
        ));
        assert!(matches!(
            parse_definition("1 2"),
            Err(ParseError::UnexpectedToken { .. })
        ));
        assert!(matches!(
            parse_definition("x $ y"),
            Err(ParseError::UnexpectedChar { .. })
        ));
        assert!(matches!(
            parse_definition("'abc"),
            Err(ParseError::UnterminatedString { .. })
        ));
        assert!(matches!(
            parse_definition("f(1=2)"),
            Err(ParseError::InvalidKeyword { .. })
        ));
    }
}
