//! Typed AST for embedded template code.
//!
//! The reader builds these nodes through [`binary`] and [`unary`], which fold
//! literal operands so that `"a" + "b"` or `2 * 3` never reach the evaluator.

use crate::reader::{self, ReaderError};
use crate::value::Value;
use std::rc::Rc;

/// Compiled expression. Every operator is a direct enum variant.
#[derive(Debug, Clone)]
pub enum Expr {
    // === Literals ===
    Literal(Value),
    Array(Vec<Expr>),
    Object(Vec<(Rc<str>, Expr)>),

    // === Access ===
    /// Bare identifier; resolved against locals, then globals.
    Var(Rc<str>),
    Member(Box<Expr>, Rc<str>),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),

    // === Arithmetic ===
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Mod(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),

    // === Comparison ===
    Eq(Box<Expr>, Box<Expr>),
    Neq(Box<Expr>, Box<Expr>),
    Gt(Box<Expr>, Box<Expr>),
    Lt(Box<Expr>, Box<Expr>),
    Gte(Box<Expr>, Box<Expr>),
    Lte(Box<Expr>, Box<Expr>),

    // === Logic ===
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    If(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
}

/// One step of an assignment target below its root name.
#[derive(Debug, Clone)]
pub enum PathSeg {
    Key(Rc<str>),
    Index(Expr),
}

#[derive(Debug, Clone)]
pub struct Target {
    pub root: Rc<str>,
    pub path: Vec<PathSeg>,
}

/// Statement of a code block. Block openers and closers are flat; the
/// program linker pairs them up.
#[derive(Debug, Clone)]
pub enum Stmt {
    Let(Rc<str>, Expr),
    Assign(Target, Expr),
    Expr(Expr),
    If(Expr),
    ElseIf(Expr),
    Else,
    For {
        item: Rc<str>,
        index: Option<Rc<str>>,
        iter: Expr,
    },
    End,
}

/// Compile a single expression (`##=`, `##-`, attribute payloads).
pub fn compile_expr(src: &str) -> Result<Expr, ReaderError> {
    reader::read_expr(src)
}

/// Compile a statement block (`##`).
pub fn compile_block(src: &str) -> Result<Vec<Stmt>, ReaderError> {
    reader::read_block(src)
}

pub fn binary(op: BinOp, l: Expr, r: Expr) -> Expr {
    if let (Expr::Literal(a), Expr::Literal(b)) = (&l, &r) {
        if let Some(v) = fold_binary(op, a, b) {
            return Expr::Literal(v);
        }
    }
    let (l, r) = (Box::new(l), Box::new(r));
    match op {
        BinOp::Add => Expr::Add(l, r),
        BinOp::Sub => Expr::Sub(l, r),
        BinOp::Mul => Expr::Mul(l, r),
        BinOp::Div => Expr::Div(l, r),
        BinOp::Mod => Expr::Mod(l, r),
        BinOp::Eq => Expr::Eq(l, r),
        BinOp::Neq => Expr::Neq(l, r),
        BinOp::Gt => Expr::Gt(l, r),
        BinOp::Lt => Expr::Lt(l, r),
        BinOp::Gte => Expr::Gte(l, r),
        BinOp::Lte => Expr::Lte(l, r),
        BinOp::And => Expr::And(l, r),
        BinOp::Or => Expr::Or(l, r),
    }
}

pub fn unary(op: UnOp, e: Expr) -> Expr {
    match (op, e) {
        (UnOp::Not, Expr::Literal(v)) => Expr::Literal(Value::Bool(!v.is_truthy())),
        (UnOp::Neg, Expr::Literal(Value::Int(n))) => Expr::Literal(
            n.checked_neg()
                .map(Value::Int)
                .unwrap_or(Value::Float(-(n as f64))),
        ),
        (UnOp::Neg, Expr::Literal(Value::Float(f))) => Expr::Literal(Value::Float(-f)),
        (UnOp::Not, e) => Expr::Not(Box::new(e)),
        (UnOp::Neg, e) => Expr::Neg(Box::new(e)),
    }
}

/// Only arithmetic and string concatenation fold; comparisons are cheap and
/// stay in the tree so listings show what was written.
fn fold_binary(op: BinOp, a: &Value, b: &Value) -> Option<Value> {
    match (op, a, b) {
        (BinOp::Add, Value::Str(x), Value::Str(y)) => Some(Value::from(format!("{x}{y}"))),
        (BinOp::Add, Value::Int(x), Value::Int(y)) => x.checked_add(*y).map(Value::Int),
        (BinOp::Sub, Value::Int(x), Value::Int(y)) => x.checked_sub(*y).map(Value::Int),
        (BinOp::Mul, Value::Int(x), Value::Int(y)) => x.checked_mul(*y).map(Value::Int),
        (BinOp::Mod, Value::Int(x), Value::Int(y)) => x.checked_rem(*y).map(Value::Int),
        (
            BinOp::Add | BinOp::Sub | BinOp::Mul,
            Value::Int(_) | Value::Float(_),
            Value::Int(_) | Value::Float(_),
        ) => {
            let (x, y) = (a.as_f64()?, b.as_f64()?);
            Some(Value::Float(match op {
                BinOp::Add => x + y,
                BinOp::Sub => x - y,
                _ => x * y,
            }))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folds_integer_arithmetic() {
        let e = compile_expr("2 * 3 + 1").expect("compile");
        assert!(matches!(e, Expr::Literal(Value::Int(7))));
    }

    #[test]
    fn test_overflowing_folds_fall_back() {
        let neg = unary(UnOp::Neg, Expr::Literal(Value::Int(i64::MIN)));
        assert!(matches!(neg, Expr::Literal(Value::Float(f)) if f == -(i64::MIN as f64)));
        let rem = binary(
            BinOp::Mod,
            Expr::Literal(Value::Int(i64::MIN)),
            Expr::Literal(Value::Int(-1)),
        );
        assert!(matches!(rem, Expr::Mod(_, _)));
    }

    #[test]
    fn test_folds_string_concat() {
        let e = compile_expr("'a' + \"b\"").expect("compile");
        assert!(matches!(e, Expr::Literal(Value::Str(ref s)) if s.as_ref() == "ab"));
    }

    #[test]
    fn test_keeps_variable_operands() {
        let e = compile_expr("x + 1").expect("compile");
        assert!(matches!(e, Expr::Add(_, _)));
    }

    #[test]
    fn test_division_is_not_folded() {
        let e = compile_expr("1 / 0").expect("compile");
        assert!(matches!(e, Expr::Div(_, _)));
    }
}
