//! Evaluator for compiled [`Expr`](crate::compiler::Expr) trees.
//!
//! Names resolve innermost local frame first, then render globals (`data`,
//! `component`, `i18n`, ...), then the shared `status` map. Calls to a bare
//! name that resolves to nothing fall through to the operator registry.

use crate::compiler::{Expr, PathSeg, Stmt, Target};
use crate::runtime::{EvalError, EvalResult, Operators};
use crate::value::{ObjectMap, SharedMap, Value};
use std::collections::BTreeMap;
use std::rc::Rc;

pub const STATUS: &str = "status";

/// Variable environment for one render or one deferred action.
#[derive(Debug)]
pub struct Env {
    globals: BTreeMap<Rc<str>, Value>,
    status: Option<SharedMap>,
    frames: Vec<Vec<(Rc<str>, Value)>>,
}

impl Env {
    pub fn new() -> Self {
        Self {
            globals: BTreeMap::new(),
            status: None,
            frames: vec![Vec::new()],
        }
    }

    pub fn with_status(mut self, status: SharedMap) -> Self {
        self.status = Some(status);
        self
    }

    pub fn set_global(&mut self, name: impl Into<Rc<str>>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn push_frame(&mut self) {
        self.frames.push(Vec::new());
    }

    pub fn pop_frame(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    /// Declare in the innermost frame, shadowing outer bindings.
    pub fn define(&mut self, name: Rc<str>, value: Value) {
        if let Some(frame) = self.frames.last_mut() {
            if let Some(slot) = frame.iter_mut().find(|(n, _)| *n == name) {
                slot.1 = value;
            } else {
                frame.push((name, value));
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        for frame in self.frames.iter().rev() {
            if let Some((_, v)) = frame.iter().rev().find(|(n, _)| **n == *name) {
                return Some(v.clone());
            }
        }
        if let Some(v) = self.globals.get(name) {
            return Some(v.clone());
        }
        if name == STATUS {
            if let Some(status) = &self.status {
                return Some(Value::Object(Rc::new(status.borrow().clone())));
            }
        }
        None
    }

    /// Every visible local, outermost first. Captured by deferred actions
    /// declared inside loops.
    pub fn locals(&self) -> Vec<(Rc<str>, Value)> {
        let mut out: Vec<(Rc<str>, Value)> = Vec::new();
        for frame in &self.frames {
            for (name, value) in frame {
                if let Some(slot) = out.iter_mut().find(|(n, _)| n == name) {
                    slot.1 = value.clone();
                } else {
                    out.push((name.clone(), value.clone()));
                }
            }
        }
        out
    }

    fn assign(&mut self, target: &Target, path: &[Rc<str>], value: Value) -> Result<(), EvalError> {
        let root = &target.root;
        for frame in self.frames.iter_mut().rev() {
            if let Some(slot) = frame.iter_mut().rev().find(|(n, _)| n == root) {
                return slot.1.set_member_path(path, value);
            }
        }
        if root.as_ref() == STATUS && !self.globals.contains_key(STATUS) {
            let Some(status) = &self.status else {
                return Err(EvalError::new("status is not available here"));
            };
            let Some((first, rest)) = path.split_first() else {
                return Err(EvalError::new("cannot replace status; assign its members"));
            };
            let mut map = status.borrow_mut();
            let slot = map.entry(first.clone()).or_insert(Value::Null);
            return slot.set_member_path(rest, value);
        }
        if let Some(slot) = self.globals.get_mut(root) {
            return slot.set_member_path(path, value);
        }
        let mut fresh = Value::Null;
        fresh.set_member_path(path, value)?;
        self.define(root.clone(), fresh);
        Ok(())
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

/// Execute a non-control statement. `if`/`for` pairing belongs to the
/// program linker.
pub fn exec_stmt(stmt: &Stmt, env: &mut Env, operators: &Operators) -> Result<(), EvalError> {
    match stmt {
        Stmt::Let(name, expr) => {
            let v = eval_expr(expr, env, operators)?;
            env.define(name.clone(), v);
        }
        Stmt::Assign(target, expr) => {
            let v = eval_expr(expr, env, operators)?;
            let mut path = Vec::with_capacity(target.path.len());
            for seg in &target.path {
                path.push(match seg {
                    PathSeg::Key(k) => k.clone(),
                    PathSeg::Index(e) => {
                        Rc::from(eval_expr(e, env, operators)?.display_string().as_str())
                    }
                });
            }
            env.assign(target, &path, v)?;
        }
        Stmt::Expr(expr) => {
            eval_expr(expr, env, operators)?;
        }
        other => {
            return Err(EvalError::new(format!(
                "block statement {other:?} outside a template program"
            )));
        }
    }
    Ok(())
}

/// Evaluate a compiled expression.
pub fn eval_expr(expr: &Expr, env: &mut Env, operators: &Operators) -> EvalResult {
    match expr {
        // === Literals ===
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_expr(item, env, operators)?);
            }
            Ok(Value::from(out))
        }
        Expr::Object(fields) => {
            let mut map = ObjectMap::new();
            for (k, e) in fields {
                map.insert(k.clone(), eval_expr(e, env, operators)?);
            }
            Ok(Value::Object(Rc::new(map)))
        }

        // === Access ===
        Expr::Var(name) => Ok(env.lookup(name).unwrap_or(Value::Null)),
        Expr::Member(obj, key) => Ok(eval_expr(obj, env, operators)?.get(key)),
        Expr::Index(obj, key) => {
            let base = eval_expr(obj, env, operators)?;
            let key = eval_expr(key, env, operators)?;
            Ok(base.index(&key))
        }
        Expr::Call(callee, args) => eval_call(callee, args, env, operators),

        // === Arithmetic ===
        Expr::Add(a, b) => {
            let av = eval_expr(a, env, operators)?;
            let bv = eval_expr(b, env, operators)?;
            add_values(av, bv)
        }
        Expr::Sub(a, b) => {
            let av = eval_expr(a, env, operators)?;
            let bv = eval_expr(b, env, operators)?;
            match (&av, &bv) {
                (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_sub(*y))),
                _ => Ok(Value::Float(number(&av, "-")? - number(&bv, "-")?)),
            }
        }
        Expr::Mul(a, b) => {
            let av = eval_expr(a, env, operators)?;
            let bv = eval_expr(b, env, operators)?;
            match (&av, &bv) {
                (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_mul(*y))),
                _ => Ok(Value::Float(number(&av, "*")? * number(&bv, "*")?)),
            }
        }
        Expr::Div(a, b) => {
            let av = eval_expr(a, env, operators)?;
            let bv = eval_expr(b, env, operators)?;
            let denom = number(&bv, "/")?;
            if denom == 0.0 {
                return Err(EvalError::new("division by zero"));
            }
            // Exact integer division stays integral
            if let (Value::Int(x), Value::Int(y)) = (&av, &bv) {
                if x.checked_rem(*y) == Some(0) {
                    if let Some(q) = x.checked_div(*y) {
                        return Ok(Value::Int(q));
                    }
                }
            }
            Ok(Value::Float(number(&av, "/")? / denom))
        }
        Expr::Mod(a, b) => {
            let av = eval_expr(a, env, operators)?;
            let bv = eval_expr(b, env, operators)?;
            match (&av, &bv) {
                // i64::MIN % -1 overflows; the result is 0 either way
                (Value::Int(x), Value::Int(y)) if *y != 0 => Ok(Value::Int(x.checked_rem(*y).unwrap_or(0))),
                _ => {
                    let denom = number(&bv, "%")?;
                    if denom == 0.0 {
                        return Err(EvalError::new("mod by zero"));
                    }
                    Ok(Value::Float(number(&av, "%")? % denom))
                }
            }
        }
        Expr::Neg(a) => match eval_expr(a, env, operators)? {
            Value::Int(n) => Ok(n
                .checked_neg()
                .map(Value::Int)
                .unwrap_or(Value::Float(-(n as f64)))),
            other => Ok(Value::Float(-number(&other, "-")?)),
        },

        // === Comparison ===
        Expr::Eq(a, b) => {
            let av = eval_expr(a, env, operators)?;
            let bv = eval_expr(b, env, operators)?;
            Ok(Value::Bool(av == bv))
        }
        Expr::Neq(a, b) => {
            let av = eval_expr(a, env, operators)?;
            let bv = eval_expr(b, env, operators)?;
            Ok(Value::Bool(av != bv))
        }
        Expr::Gt(a, b) => compare(a, b, env, operators, |o| o.is_gt()),
        Expr::Lt(a, b) => compare(a, b, env, operators, |o| o.is_lt()),
        Expr::Gte(a, b) => compare(a, b, env, operators, |o| o.is_ge()),
        Expr::Lte(a, b) => compare(a, b, env, operators, |o| o.is_le()),

        // === Logic ===
        Expr::And(a, b) => {
            let av = eval_expr(a, env, operators)?;
            if !av.is_truthy() {
                return Ok(av);
            }
            eval_expr(b, env, operators)
        }
        Expr::Or(a, b) => {
            let av = eval_expr(a, env, operators)?;
            if av.is_truthy() {
                return Ok(av);
            }
            eval_expr(b, env, operators)
        }
        Expr::Not(a) => Ok(Value::Bool(!eval_expr(a, env, operators)?.is_truthy())),
        Expr::If(cond, then, otherwise) => {
            if eval_expr(cond, env, operators)?.is_truthy() {
                eval_expr(then, env, operators)
            } else {
                eval_expr(otherwise, env, operators)
            }
        }
    }
}

fn compare(
    a: &Expr,
    b: &Expr,
    env: &mut Env,
    operators: &Operators,
    pick: fn(std::cmp::Ordering) -> bool,
) -> EvalResult {
    let av = eval_expr(a, env, operators)?;
    let bv = eval_expr(b, env, operators)?;
    Ok(Value::Bool(av.cmp_numeric_or_string(&bv).is_some_and(pick)))
}

fn number(v: &Value, op: &str) -> Result<f64, EvalError> {
    match v {
        Value::Int(n) => Ok(*n as f64),
        Value::Float(f) => Ok(*f),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Null => Ok(0.0),
        other => Err(EvalError::new(format!(
            "operator '{op}' expects numbers, got {}",
            other.type_name()
        ))),
    }
}

fn add_values(a: Value, b: Value) -> EvalResult {
    match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_add(*y))),
        (Value::Str(_), _) | (_, Value::Str(_)) => {
            Ok(Value::from(format!("{}{}", a.display_string(), b.display_string())))
        }
        (Value::Array(x), Value::Array(y)) => {
            let mut out = x.as_ref().clone();
            out.extend(y.iter().cloned());
            Ok(Value::from(out))
        }
        _ => Ok(Value::Float(number(&a, "+")? + number(&b, "+")?)),
    }
}

/// Method-call sugar on strings and arrays, mapped onto operators with the
/// receiver as first argument.
fn method_operator(name: &str) -> Option<&'static str> {
    Some(match name {
        "toUpperCase" => "upper",
        "toLowerCase" => "lower",
        "trim" => "trim",
        "includes" => "contains",
        "join" => "join",
        "map" => "map",
        "filter" => "filter",
        "concat" => "concat",
        "toString" => "to_string",
        _ => return None,
    })
}

fn eval_call(callee: &Expr, args: &[Expr], env: &mut Env, operators: &Operators) -> EvalResult {
    let mut arg_vals = Vec::with_capacity(args.len());
    match callee {
        Expr::Var(name) => {
            for a in args {
                arg_vals.push(eval_expr(a, env, operators)?);
            }
            match env.lookup(name) {
                Some(Value::Func(f)) => f.call(&arg_vals),
                Some(other) => Err(EvalError::new(format!(
                    "{name} is not a function ({})",
                    other.type_name()
                ))),
                None => operators.call(name, &arg_vals),
            }
        }
        Expr::Member(obj, key) => {
            let recv = eval_expr(obj, env, operators)?;
            for a in args {
                arg_vals.push(eval_expr(a, env, operators)?);
            }
            match recv.get(key) {
                Value::Func(f) => f.call(&arg_vals),
                _ => {
                    let Some(op) = method_operator(key) else {
                        return Err(EvalError::new(format!("{key} is not a function")));
                    };
                    let mut full = Vec::with_capacity(arg_vals.len() + 1);
                    full.push(recv);
                    full.extend(arg_vals);
                    operators.call(op, &full)
                }
            }
        }
        other => {
            let f = eval_expr(other, env, operators)?;
            for a in args {
                arg_vals.push(eval_expr(a, env, operators)?);
            }
            match f {
                Value::Func(f) => f.call(&arg_vals),
                v => Err(EvalError::new(format!("{} is not a function", v.type_name()))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile_block, compile_expr};
    use serde_json::json;
    use std::cell::RefCell;

    fn eval(src: &str, env: &mut Env) -> Value {
        let ops = Operators::new();
        eval_expr(&compile_expr(src).expect("compile"), env, &ops).expect("eval")
    }

    #[test]
    fn test_data_lookup_and_length() {
        let mut env = Env::new();
        env.set_global("data", Value::from(json!({"items": [1, 2, 3], "name": "Ann"})));
        assert_eq!(eval("data.items.length", &mut env), Value::Int(3));
        assert_eq!(eval("data.name.length", &mut env), Value::Int(3));
        assert_eq!(eval("data.missing.deeper", &mut env), Value::Null);
    }

    #[test]
    fn test_string_concat_and_methods() {
        let mut env = Env::new();
        env.set_global("data", Value::from(json!({"name": "ann"})));
        assert_eq!(
            eval("'Hi ' + data.name.toUpperCase() + '!'", &mut env),
            Value::from("Hi ANN!")
        );
    }

    #[test]
    fn test_locals_shadow_globals() {
        let mut env = Env::new();
        env.set_global("x", Value::Int(1));
        env.push_frame();
        env.define(Rc::from("x"), Value::Int(2));
        assert_eq!(eval("x", &mut env), Value::Int(2));
        env.pop_frame();
        assert_eq!(eval("x", &mut env), Value::Int(1));
    }

    #[test]
    fn test_status_assignment_writes_shared_map() {
        let status = Rc::new(RefCell::new(ObjectMap::new()));
        let mut env = Env::new().with_status(status.clone());
        let ops = Operators::new();
        for stmt in compile_block("status.count = 2; status.count = status.count + 1").expect("compile") {
            exec_stmt(&stmt, &mut env, &ops).expect("exec");
        }
        assert_eq!(status.borrow().get("count"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_host_function_call() {
        let mut env = Env::new();
        env.set_global(
            "data",
            Value::object([(
                "greet",
                Value::function("greet", |args| {
                    Ok(Value::from(format!("hello {}", args[0].display_string())))
                }),
            )]),
        );
        assert_eq!(eval("data.greet('bo')", &mut env), Value::from("hello bo"));
    }

    #[test]
    fn test_calling_non_function_fails() {
        let mut env = Env::new();
        env.set_global("x", Value::Int(1));
        let ops = Operators::new();
        let err = eval_expr(&compile_expr("x()").expect("compile"), &mut env, &ops)
            .expect_err("should fail");
        assert!(err.message.contains("not a function"));
    }

    #[test]
    fn test_integer_overflow_edges_do_not_panic() {
        let mut env = Env::new();
        env.set_global("data", Value::object([("a", Value::Int(i64::MIN))]));
        assert_eq!(eval("data.a / -1", &mut env), Value::Float(-(i64::MIN as f64)));
        assert_eq!(eval("data.a % -1", &mut env), Value::Int(0));
        assert_eq!(eval("-data.a", &mut env), Value::Float(-(i64::MIN as f64)));
        assert_eq!(eval("data.a / 2", &mut env), Value::Int(i64::MIN / 2));
    }

    #[test]
    fn test_logic_returns_operands() {
        let mut env = Env::new();
        assert_eq!(eval("null || 'fallback'", &mut env), Value::from("fallback"));
        assert_eq!(eval("0 && 'never'", &mut env), Value::Int(0));
    }
}
