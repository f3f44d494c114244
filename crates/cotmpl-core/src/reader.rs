use crate::compiler::{BinOp, Expr, PathSeg, Stmt, Target, UnOp, binary, unary};
use crate::value::Value;
use std::iter::Peekable;
use std::rc::Rc;
use std::str::Chars;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReaderError {
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unbalanced parenthesis")]
    UnbalancedParenthesis,
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("unexpected token {0}")]
    UnexpectedToken(String),
    #[error("unexpected end of input")]
    UnexpectedEnd,
}

/// Parse exactly one expression; trailing tokens are an error.
pub fn read_expr(input: &str) -> Result<Expr, ReaderError> {
    let mut parser = Parser::new(input);
    let expr = parser.parse_expr()?;
    if let Some(t) = parser.tokens.next_token()? {
        return Err(ReaderError::UnexpectedToken(t.describe()));
    }
    Ok(expr)
}

/// Parse a statement block. Block openers (`if x {`) and closers (`}`) may
/// be split across several blocks of one template.
pub fn read_block(input: &str) -> Result<Vec<Stmt>, ReaderError> {
    let mut parser = Parser::new(input);
    let mut out = Vec::new();
    while let Some(t) = parser.tokens.peek_token()? {
        if t == Token::Semi {
            parser.tokens.next_token()?;
            continue;
        }
        out.push(parser.parse_stmt()?);
    }
    Ok(out)
}

struct Parser<'a> {
    tokens: Tokenizer<'a>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            tokens: Tokenizer::new(input),
        }
    }

    fn next(&mut self) -> Result<Token, ReaderError> {
        self.tokens.next_token()?.ok_or(ReaderError::UnexpectedEnd)
    }

    fn expect(&mut self, want: Token) -> Result<(), ReaderError> {
        let got = self.next()?;
        if got == want {
            Ok(())
        } else {
            Err(ReaderError::UnexpectedToken(got.describe()))
        }
    }

    fn eat(&mut self, want: &Token) -> Result<bool, ReaderError> {
        if self.tokens.peek_token()?.as_ref() == Some(want) {
            self.tokens.next_token()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn peek_ident(&mut self, word: &str) -> Result<bool, ReaderError> {
        Ok(matches!(self.tokens.peek_token()?, Some(Token::Ident(ref s)) if s == word))
    }

    fn ident(&mut self) -> Result<Rc<str>, ReaderError> {
        match self.next()? {
            Token::Ident(s) => Ok(Rc::from(s.as_str())),
            other => Err(ReaderError::UnexpectedToken(other.describe())),
        }
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ReaderError> {
        let stmt = match self.tokens.peek_token()? {
            Some(Token::RBrace) => {
                self.next()?;
                if self.peek_ident("else")? {
                    self.next()?;
                    if self.peek_ident("if")? {
                        self.next()?;
                        let cond = self.parse_expr()?;
                        self.expect(Token::LBrace)?;
                        Stmt::ElseIf(cond)
                    } else {
                        self.expect(Token::LBrace)?;
                        Stmt::Else
                    }
                } else {
                    Stmt::End
                }
            }
            Some(Token::Ident(word)) if matches!(word.as_str(), "let" | "const" | "var") => {
                self.next()?;
                let name = self.ident()?;
                let value = if self.eat(&Token::Assign)? {
                    self.parse_expr()?
                } else {
                    Expr::Literal(Value::Null)
                };
                Stmt::Let(name, value)
            }
            Some(Token::Ident(word)) if word == "if" => {
                self.next()?;
                let cond = self.parse_expr()?;
                self.expect(Token::LBrace)?;
                Stmt::If(cond)
            }
            Some(Token::Ident(word)) if word == "for" => {
                self.next()?;
                let item = self.ident()?;
                let index = if self.eat(&Token::Comma)? {
                    Some(self.ident()?)
                } else {
                    None
                };
                if !self.peek_ident("in")? {
                    let got = self.next()?;
                    return Err(ReaderError::UnexpectedToken(got.describe()));
                }
                self.next()?;
                let iter = self.parse_expr()?;
                self.expect(Token::LBrace)?;
                Stmt::For { item, index, iter }
            }
            _ => {
                let expr = self.parse_expr()?;
                if self.eat(&Token::Assign)? {
                    let target = to_target(expr)?;
                    Stmt::Assign(target, self.parse_expr()?)
                } else {
                    Stmt::Expr(expr)
                }
            }
        };
        self.eat(&Token::Semi)?;
        Ok(stmt)
    }

    fn parse_expr(&mut self) -> Result<Expr, ReaderError> {
        let cond = self.parse_binary(1)?;
        if self.eat(&Token::Question)? {
            let then = self.parse_expr()?;
            self.expect(Token::Colon)?;
            let otherwise = self.parse_expr()?;
            return Ok(Expr::If(
                Box::new(cond),
                Box::new(then),
                Box::new(otherwise),
            ));
        }
        Ok(cond)
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, ReaderError> {
        let mut left = self.parse_unary()?;
        loop {
            let Some(Token::Op(op)) = self.tokens.peek_token()? else {
                break;
            };
            let Some((bin, prec)) = binary_op(op) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.next()?;
            let right = self.parse_binary(prec + 1)?;
            left = binary(bin, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ReaderError> {
        match self.tokens.peek_token()? {
            Some(Token::Op("!")) => {
                self.next()?;
                Ok(unary(UnOp::Not, self.parse_unary()?))
            }
            Some(Token::Op("-")) => {
                self.next()?;
                Ok(unary(UnOp::Neg, self.parse_unary()?))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ReaderError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot)? {
                let key = self.ident()?;
                expr = Expr::Member(Box::new(expr), key);
            } else if self.eat(&Token::LBracket)? {
                let key = self.parse_expr()?;
                self.expect(Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(key));
            } else if self.eat(&Token::LParen)? {
                let args = self.parse_list(Token::RParen)?;
                expr = Expr::Call(Box::new(expr), args);
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_list(&mut self, close: Token) -> Result<Vec<Expr>, ReaderError> {
        let mut items = Vec::new();
        loop {
            if self.eat(&close)? {
                return Ok(items);
            }
            items.push(self.parse_expr()?);
            if self.eat(&Token::Comma)? {
                continue;
            }
            return match self.tokens.next_token()? {
                Some(t) if t == close => Ok(items),
                Some(_) | None if close == Token::RParen => Err(ReaderError::UnbalancedParenthesis),
                Some(t) => Err(ReaderError::UnexpectedToken(t.describe())),
                None => Err(ReaderError::UnexpectedEnd),
            };
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ReaderError> {
        match self.next()? {
            Token::Int(n) => Ok(Expr::Literal(Value::Int(n))),
            Token::Float(f) => Ok(Expr::Literal(Value::Float(f))),
            Token::String(s) => Ok(Expr::Literal(Value::from(s))),
            Token::Ident(s) => Ok(match s.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" | "undefined" => Expr::Literal(Value::Null),
                _ => Expr::Var(Rc::from(s.as_str())),
            }),
            Token::LParen => {
                let inner = self.parse_expr()?;
                match self.tokens.next_token()? {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ReaderError::UnbalancedParenthesis),
                }
            }
            Token::LBracket => Ok(Expr::Array(self.parse_list(Token::RBracket)?)),
            Token::LBrace => self.parse_object(),
            other => Err(ReaderError::UnexpectedToken(other.describe())),
        }
    }

    fn parse_object(&mut self) -> Result<Expr, ReaderError> {
        let mut fields = Vec::new();
        loop {
            let key: Rc<str> = match self.next()? {
                Token::RBrace => return Ok(Expr::Object(fields)),
                Token::Ident(s) | Token::String(s) => Rc::from(s.as_str()),
                Token::Int(n) => Rc::from(n.to_string().as_str()),
                other => return Err(ReaderError::UnexpectedToken(other.describe())),
            };
            let value = if self.eat(&Token::Colon)? {
                self.parse_expr()?
            } else {
                // `{ name }` shorthand
                Expr::Var(key.clone())
            };
            fields.push((key, value));
            if !self.eat(&Token::Comma)? {
                self.expect(Token::RBrace)?;
                return Ok(Expr::Object(fields));
            }
        }
    }
}

fn binary_op(op: &str) -> Option<(BinOp, u8)> {
    Some(match op {
        "||" => (BinOp::Or, 1),
        "&&" => (BinOp::And, 2),
        "==" | "===" => (BinOp::Eq, 3),
        "!=" | "!==" => (BinOp::Neq, 3),
        "<" => (BinOp::Lt, 4),
        ">" => (BinOp::Gt, 4),
        "<=" => (BinOp::Lte, 4),
        ">=" => (BinOp::Gte, 4),
        "+" => (BinOp::Add, 5),
        "-" => (BinOp::Sub, 5),
        "*" => (BinOp::Mul, 6),
        "/" => (BinOp::Div, 6),
        "%" => (BinOp::Mod, 6),
        _ => return None,
    })
}

fn to_target(expr: Expr) -> Result<Target, ReaderError> {
    let mut path = Vec::new();
    let mut current = expr;
    loop {
        match current {
            Expr::Var(root) => {
                path.reverse();
                return Ok(Target { root, path });
            }
            Expr::Member(obj, key) => {
                path.push(PathSeg::Key(key));
                current = *obj;
            }
            Expr::Index(obj, key) => {
                path.push(PathSeg::Index(*key));
                current = *obj;
            }
            _ => return Err(ReaderError::UnexpectedToken("'=' after non-assignable expression".into())),
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
enum Token {
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Semi,
    Dot,
    Question,
    Assign,
    Op(&'static str),
    String(String),
    Int(i64),
    Float(f64),
    Ident(String),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::LParen => "'('".into(),
            Token::RParen => "')'".into(),
            Token::LBrace => "'{'".into(),
            Token::RBrace => "'}'".into(),
            Token::LBracket => "'['".into(),
            Token::RBracket => "']'".into(),
            Token::Comma => "','".into(),
            Token::Colon => "':'".into(),
            Token::Semi => "';'".into(),
            Token::Dot => "'.'".into(),
            Token::Question => "'?'".into(),
            Token::Assign => "'='".into(),
            Token::Op(op) => format!("'{op}'"),
            Token::String(s) => format!("string {s:?}"),
            Token::Int(n) => format!("number {n}"),
            Token::Float(f) => format!("number {f}"),
            Token::Ident(s) => format!("'{s}'"),
        }
    }
}

struct Tokenizer<'a> {
    chars: Peekable<Chars<'a>>,
    peeked: Option<Token>,
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
            peeked: None,
        }
    }

    fn peek_token(&mut self) -> Result<Option<Token>, ReaderError> {
        if self.peeked.is_none() {
            self.peeked = self.next_token_inner()?;
        }
        Ok(self.peeked.clone())
    }

    fn next_token(&mut self) -> Result<Option<Token>, ReaderError> {
        if let Some(t) = self.peeked.take() {
            return Ok(Some(t));
        }
        self.next_token_inner()
    }

    fn follows(&mut self, c: char) -> bool {
        if self.chars.peek() == Some(&c) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            while let Some(&c) = self.chars.peek() {
                if c.is_whitespace() {
                    self.chars.next();
                    continue;
                }
                break;
            }
            // `//` line comments; a lone `/` is division.
            let mut ahead = self.chars.clone();
            if ahead.next() == Some('/') && ahead.next() == Some('/') {
                for c in self.chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
                continue;
            }
            break;
        }
    }

    fn next_token_inner(&mut self) -> Result<Option<Token>, ReaderError> {
        self.skip_trivia();

        let c = match self.chars.next() {
            Some(c) => c,
            None => return Ok(None),
        };

        let token = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            ',' => Token::Comma,
            ':' => Token::Colon,
            ';' => Token::Semi,
            '.' => Token::Dot,
            '?' => Token::Question,
            '+' => Token::Op("+"),
            '-' => Token::Op("-"),
            '*' => Token::Op("*"),
            '/' => Token::Op("/"),
            '%' => Token::Op("%"),
            '=' => {
                if self.follows('=') {
                    if self.follows('=') {
                        Token::Op("===")
                    } else {
                        Token::Op("==")
                    }
                } else {
                    Token::Assign
                }
            }
            '!' => {
                if self.follows('=') {
                    if self.follows('=') {
                        Token::Op("!==")
                    } else {
                        Token::Op("!=")
                    }
                } else {
                    Token::Op("!")
                }
            }
            '<' => {
                if self.follows('=') {
                    Token::Op("<=")
                } else {
                    Token::Op("<")
                }
            }
            '>' => {
                if self.follows('=') {
                    Token::Op(">=")
                } else {
                    Token::Op(">")
                }
            }
            '&' if self.follows('&') => Token::Op("&&"),
            '|' if self.follows('|') => Token::Op("||"),
            '\'' | '"' | '`' => Token::String(self.read_string(c)?),
            _ if c.is_ascii_digit() => self.read_number(c)?,
            _ if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut s = c.to_string();
                while let Some(&nc) = self.chars.peek() {
                    if nc.is_alphanumeric() || nc == '_' || nc == '$' {
                        s.push(nc);
                        self.chars.next();
                    } else {
                        break;
                    }
                }
                Token::Ident(s)
            }
            other => return Err(ReaderError::UnexpectedChar(other)),
        };
        Ok(Some(token))
    }

    fn read_string(&mut self, quote: char) -> Result<String, ReaderError> {
        let mut s = String::new();
        let mut escaped = false;
        for nc in self.chars.by_ref() {
            if escaped {
                s.push(match nc {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => other,
                });
                escaped = false;
            } else if nc == '\\' {
                escaped = true;
            } else if nc == quote {
                return Ok(s);
            } else {
                s.push(nc);
            }
        }
        Err(ReaderError::UnterminatedString)
    }

    fn read_number(&mut self, first: char) -> Result<Token, ReaderError> {
        let mut s = first.to_string();
        let mut is_float = false;
        while let Some(&nc) = self.chars.peek() {
            if nc.is_ascii_digit() {
                s.push(nc);
                self.chars.next();
            } else if nc == '.' && !is_float {
                // `1.5` is a float, `items.0.name` style access is not supported on literals
                let mut ahead = self.chars.clone();
                ahead.next();
                if ahead.peek().is_some_and(|d| d.is_ascii_digit()) {
                    is_float = true;
                    s.push(nc);
                    self.chars.next();
                } else {
                    break;
                }
            } else {
                break;
            }
        }
        if is_float {
            s.parse::<f64>()
                .map(Token::Float)
                .map_err(|_| ReaderError::InvalidNumber(s))
        } else {
            s.parse::<i64>()
                .map(Token::Int)
                .map_err(|_| ReaderError::InvalidNumber(s))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence() {
        let e = read_expr("a + b * c").expect("read");
        match e {
            Expr::Add(_, rhs) => assert!(matches!(*rhs, Expr::Mul(_, _))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_member_index_call_chain() {
        let e = read_expr("data.items[0].name.toUpperCase()").expect("read");
        assert!(matches!(e, Expr::Call(_, ref args) if args.is_empty()));
    }

    #[test]
    fn test_object_literal_with_shorthand() {
        let e = read_expr("{ a: 1, 'b': x, c }").expect("read");
        match e {
            Expr::Object(fields) => {
                let keys: Vec<&str> = fields.iter().map(|(k, _)| k.as_ref()).collect();
                assert_eq!(keys, vec!["a", "b", "c"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_ternary() {
        let e = read_expr("ok ? 'yes' : 'no'").expect("read");
        assert!(matches!(e, Expr::If(_, _, _)));
    }

    #[test]
    fn test_block_statements() {
        let stmts = read_block("let n = 1; for item, i in data.items { n = n + 1 }").expect("read");
        assert_eq!(stmts.len(), 4);
        assert!(matches!(stmts[0], Stmt::Let(ref n, _) if n.as_ref() == "n"));
        assert!(matches!(stmts[1], Stmt::For { ref index, .. } if index.is_some()));
        assert!(matches!(stmts[2], Stmt::Assign(_, _)));
        assert!(matches!(stmts[3], Stmt::End));
    }

    #[test]
    fn test_else_chain() {
        let stmts = read_block("} else if x > 1 { y } else { }").expect("read");
        assert!(matches!(stmts[0], Stmt::ElseIf(_)));
        assert!(matches!(stmts[1], Stmt::Expr(Expr::Var(_))));
        assert!(matches!(stmts[2], Stmt::Else));
        assert!(matches!(stmts[3], Stmt::End));
    }

    #[test]
    fn test_status_assignment_target() {
        let stmts = read_block("status.count = 3").expect("read");
        match &stmts[0] {
            Stmt::Assign(target, _) => {
                assert_eq!(target.root.as_ref(), "status");
                assert_eq!(target.path.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_errors() {
        assert_eq!(read_expr("'abc").unwrap_err(), ReaderError::UnterminatedString);
        assert_eq!(read_expr("(1 + 2").unwrap_err(), ReaderError::UnbalancedParenthesis);
        assert_eq!(read_expr("1 +").unwrap_err(), ReaderError::UnexpectedEnd);
        assert_eq!(read_expr("a # b").unwrap_err(), ReaderError::UnexpectedChar('#'));
    }

    #[test]
    fn test_line_comments_skipped() {
        let stmts = read_block("// note\nlet a = 4 / 2").expect("read");
        assert_eq!(stmts.len(), 1);
    }
}
