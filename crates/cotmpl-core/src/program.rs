//! Template programs.
//!
//! A template compiles to a flat list of [`Instr`]. Code blocks may open an
//! `if`/`for` in one fragment and close it several fragments later, so block
//! structure is only known once the whole list exists. [`link_program`]
//! pairs openers with closers and produces the nested [`Op`] tree that
//! [`execute_program`] walks to produce markup.
//!
//! Deferred work (event bindings, element refs, `###` actions, ...) is not
//! run here. A [`Instr::Lazy`] evaluates its arguments, hands them to a
//! [`LazySink`] and writes the `slot.record` key the sink returns, so the
//! post-processing pass can find the owning element.

use crate::compiler::{Expr, Stmt};
use crate::runtime::{EvalError, Operators, escape_html};
use crate::value::Value;
use crate::vm::{Env, eval_expr, exec_stmt};
use std::fmt::Write;
use std::rc::Rc;

#[derive(Debug, Clone)]
pub enum Instr {
    /// Literal markup.
    Text(Rc<str>),
    /// Evaluate and write, optionally escaped.
    Emit { expr: Expr, escape: bool },
    /// One statement of a code block.
    Stmt(Stmt),
    /// Record a deferred action and, when `emit_marker` is set, write its
    /// `slot.record` key.
    Lazy {
        rule: Rc<str>,
        slot: usize,
        args: Vec<Expr>,
        capture_locals: bool,
        emit_marker: bool,
    },
}

#[derive(Debug, Clone)]
pub enum Op {
    Text(Rc<str>),
    Emit {
        expr: Expr,
        escape: bool,
    },
    Exec(Stmt),
    If {
        branches: Vec<(Expr, Vec<Op>)>,
        otherwise: Option<Vec<Op>>,
    },
    For {
        item: Rc<str>,
        index: Option<Rc<str>>,
        iter: Expr,
        body: Vec<Op>,
    },
    Lazy {
        rule: Rc<str>,
        slot: usize,
        args: Vec<Expr>,
        capture_locals: bool,
        emit_marker: bool,
    },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProgramError {
    #[error("'}}' without an open block")]
    UnexpectedEnd,
    #[error("'else' without a matching 'if'")]
    UnexpectedElse,
    #[error("unclosed '{0}' block")]
    UnclosedBlock(&'static str),
}

/// Values handed to a deferred action at render time.
#[derive(Debug, Clone, Default)]
pub struct LazyCapture {
    pub values: Vec<Value>,
    pub locals: Vec<(Rc<str>, Value)>,
}

/// Receives deferred actions while a program runs.
pub trait LazySink {
    /// Store a capture for `rule`'s `slot` and return its record index.
    fn record(&mut self, rule: &str, slot: usize, capture: LazyCapture) -> Result<usize, EvalError>;
}

/// Sink that discards captures. Used for programs known to have no lazy
/// instructions, and for dry runs from the CLI.
pub struct NullSink;

impl LazySink for NullSink {
    fn record(&mut self, _rule: &str, _slot: usize, _capture: LazyCapture) -> Result<usize, EvalError> {
        Ok(0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    ops: Vec<Op>,
    instr_count: usize,
}

impl Program {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn instr_count(&self) -> usize {
        self.instr_count
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Indented, human-readable listing of the op tree.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        list_ops(&self.ops, 0, &mut out);
        out
    }
}

enum PendingKind {
    Root,
    If {
        done: Vec<(Expr, Vec<Op>)>,
        // None once the `else` arm is open
        cond: Option<Expr>,
    },
    For {
        item: Rc<str>,
        index: Option<Rc<str>>,
        iter: Expr,
    },
}

struct Pending {
    kind: PendingKind,
    body: Vec<Op>,
}

pub fn link_program(instrs: Vec<Instr>) -> Result<Program, ProgramError> {
    let instr_count = instrs.len();
    let mut stack = vec![Pending {
        kind: PendingKind::Root,
        body: Vec::new(),
    }];

    for instr in instrs {
        let op = match instr {
            Instr::Text(t) => Op::Text(t),
            Instr::Emit { expr, escape } => Op::Emit { expr, escape },
            Instr::Lazy {
                rule,
                slot,
                args,
                capture_locals,
                emit_marker,
            } => Op::Lazy {
                rule,
                slot,
                args,
                capture_locals,
                emit_marker,
            },
            Instr::Stmt(Stmt::If(cond)) => {
                stack.push(Pending {
                    kind: PendingKind::If {
                        done: Vec::new(),
                        cond: Some(cond),
                    },
                    body: Vec::new(),
                });
                continue;
            }
            Instr::Stmt(Stmt::For { item, index, iter }) => {
                stack.push(Pending {
                    kind: PendingKind::For { item, index, iter },
                    body: Vec::new(),
                });
                continue;
            }
            Instr::Stmt(Stmt::ElseIf(next)) => {
                let top = stack.last_mut().ok_or(ProgramError::UnexpectedElse)?;
                match &mut top.kind {
                    PendingKind::If { done, cond } => {
                        let prev = cond.take().ok_or(ProgramError::UnexpectedElse)?;
                        done.push((prev, std::mem::take(&mut top.body)));
                        *cond = Some(next);
                    }
                    _ => return Err(ProgramError::UnexpectedElse),
                }
                continue;
            }
            Instr::Stmt(Stmt::Else) => {
                let top = stack.last_mut().ok_or(ProgramError::UnexpectedElse)?;
                match &mut top.kind {
                    PendingKind::If { done, cond } => {
                        let prev = cond.take().ok_or(ProgramError::UnexpectedElse)?;
                        done.push((prev, std::mem::take(&mut top.body)));
                    }
                    _ => return Err(ProgramError::UnexpectedElse),
                }
                continue;
            }
            Instr::Stmt(Stmt::End) => {
                if stack.len() == 1 {
                    return Err(ProgramError::UnexpectedEnd);
                }
                let Some(closed) = stack.pop() else {
                    return Err(ProgramError::UnexpectedEnd);
                };
                match closed.kind {
                    PendingKind::Root => return Err(ProgramError::UnexpectedEnd),
                    PendingKind::If { mut done, cond } => match cond {
                        Some(c) => {
                            done.push((c, closed.body));
                            Op::If {
                                branches: done,
                                otherwise: None,
                            }
                        }
                        None => Op::If {
                            branches: done,
                            otherwise: Some(closed.body),
                        },
                    },
                    PendingKind::For { item, index, iter } => Op::For {
                        item,
                        index,
                        iter,
                        body: closed.body,
                    },
                }
            }
            Instr::Stmt(stmt) => Op::Exec(stmt),
        };
        if let Some(top) = stack.last_mut() {
            top.body.push(op);
        }
    }

    if stack.len() > 1 {
        let what = match stack.last().map(|p| &p.kind) {
            Some(PendingKind::For { .. }) => "for",
            _ => "if",
        };
        return Err(ProgramError::UnclosedBlock(what));
    }
    let ops = stack.pop().map(|p| p.body).unwrap_or_default();
    Ok(Program { ops, instr_count })
}

/// Run a linked program and return the produced markup.
pub fn execute_program(
    program: &Program,
    env: &mut Env,
    operators: &Operators,
    sink: &mut dyn LazySink,
) -> Result<String, EvalError> {
    let mut out = String::new();
    exec_ops(&program.ops, env, operators, sink, &mut out)?;
    Ok(out)
}

fn exec_ops(
    ops: &[Op],
    env: &mut Env,
    operators: &Operators,
    sink: &mut dyn LazySink,
    out: &mut String,
) -> Result<(), EvalError> {
    for op in ops {
        match op {
            Op::Text(t) => out.push_str(t),
            Op::Emit { expr, escape } => {
                let v = eval_expr(expr, env, operators)?;
                let text = v.display_string();
                if *escape {
                    out.push_str(&escape_html(&text));
                } else {
                    out.push_str(&text);
                }
            }
            Op::Exec(stmt) => exec_stmt(stmt, env, operators)?,
            Op::If {
                branches,
                otherwise,
            } => {
                let mut taken = None;
                for (cond, body) in branches {
                    if eval_expr(cond, env, operators)?.is_truthy() {
                        taken = Some(body);
                        break;
                    }
                }
                if let Some(body) = taken.or(otherwise.as_ref()) {
                    env.push_frame();
                    let res = exec_ops(body, env, operators, sink, out);
                    env.pop_frame();
                    res?;
                }
            }
            Op::For {
                item,
                index,
                iter,
                body,
            } => {
                let source = eval_expr(iter, env, operators)?;
                let entries: Vec<(Value, Value)> = match &source {
                    Value::Array(items) => items
                        .iter()
                        .enumerate()
                        .map(|(i, v)| (v.clone(), Value::Int(i as i64)))
                        .collect(),
                    Value::Object(obj) => obj
                        .iter()
                        .map(|(k, v)| (v.clone(), Value::Str(k.clone())))
                        .collect(),
                    Value::Null => Vec::new(),
                    other => {
                        return Err(EvalError::new(format!(
                            "cannot iterate over {}",
                            other.type_name()
                        )));
                    }
                };
                for (value, key) in entries {
                    env.push_frame();
                    env.define(item.clone(), value);
                    if let Some(index) = index {
                        env.define(index.clone(), key);
                    }
                    let res = exec_ops(body, env, operators, sink, out);
                    env.pop_frame();
                    res?;
                }
            }
            Op::Lazy {
                rule,
                slot,
                args,
                capture_locals,
                emit_marker,
            } => {
                let mut values = Vec::with_capacity(args.len());
                for a in args {
                    values.push(eval_expr(a, env, operators)?);
                }
                let locals = if *capture_locals {
                    env.locals()
                } else {
                    Vec::new()
                };
                let record = sink.record(rule, *slot, LazyCapture { values, locals })?;
                if *emit_marker {
                    let _ = write!(out, "{slot}.{record}");
                }
            }
        }
    }
    Ok(())
}

fn list_ops(ops: &[Op], depth: usize, out: &mut String) {
    let pad = "  ".repeat(depth);
    for op in ops {
        match op {
            Op::Text(t) => {
                let _ = writeln!(out, "{pad}text {:?}", t.as_ref());
            }
            Op::Emit { expr, escape } => {
                let kind = if *escape { "emit-escaped" } else { "emit" };
                let _ = writeln!(out, "{pad}{kind} {expr:?}");
            }
            Op::Exec(stmt) => {
                let _ = writeln!(out, "{pad}exec {stmt:?}");
            }
            Op::If {
                branches,
                otherwise,
            } => {
                for (i, (cond, body)) in branches.iter().enumerate() {
                    let head = if i == 0 { "if" } else { "else if" };
                    let _ = writeln!(out, "{pad}{head} {cond:?}");
                    list_ops(body, depth + 1, out);
                }
                if let Some(body) = otherwise {
                    let _ = writeln!(out, "{pad}else");
                    list_ops(body, depth + 1, out);
                }
            }
            Op::For {
                item,
                index,
                iter,
                body,
            } => {
                match index {
                    Some(idx) => {
                        let _ = writeln!(out, "{pad}for {item}, {idx} in {iter:?}");
                    }
                    None => {
                        let _ = writeln!(out, "{pad}for {item} in {iter:?}");
                    }
                }
                list_ops(body, depth + 1, out);
            }
            Op::Lazy {
                rule, slot, args, ..
            } => {
                let _ = writeln!(out, "{pad}lazy {rule}#{slot} ({} args)", args.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile_block, compile_expr};
    use serde_json::json;

    fn text(s: &str) -> Instr {
        Instr::Text(Rc::from(s))
    }

    fn emit(src: &str, escape: bool) -> Instr {
        Instr::Emit {
            expr: compile_expr(src).expect("compile"),
            escape,
        }
    }

    fn code(src: &str) -> Vec<Instr> {
        compile_block(src)
            .expect("compile")
            .into_iter()
            .map(Instr::Stmt)
            .collect()
    }

    fn run(instrs: Vec<Instr>, data: serde_json::Value) -> String {
        let program = link_program(instrs).expect("link");
        let mut env = Env::new();
        env.set_global("data", Value::from(data));
        execute_program(&program, &mut env, &Operators::new(), &mut NullSink).expect("run")
    }

    #[test]
    fn test_blocks_span_fragments() {
        let mut instrs = vec![text("<ul>")];
        instrs.extend(code("for item, i in data.items {"));
        instrs.push(text("<li>"));
        instrs.push(emit("i + ':' + item", false));
        instrs.push(text("</li>"));
        instrs.extend(code("}"));
        instrs.push(text("</ul>"));
        let out = run(instrs, json!({"items": ["a", "b"]}));
        assert_eq!(out, "<ul><li>0:a</li><li>1:b</li></ul>");
    }

    #[test]
    fn test_if_else_chain() {
        let build = || {
            let mut instrs = code("if data.n > 1 {");
            instrs.push(text("big"));
            instrs.extend(code("} else if data.n == 1 {"));
            instrs.push(text("one"));
            instrs.extend(code("} else {"));
            instrs.push(text("none"));
            instrs.extend(code("}"));
            instrs
        };
        assert_eq!(run(build(), json!({"n": 5})), "big");
        assert_eq!(run(build(), json!({"n": 1})), "one");
        assert_eq!(run(build(), json!({"n": 0})), "none");
    }

    #[test]
    fn test_escape_flag() {
        let out = run(vec![emit("data.html", true)], json!({"html": "<b>"}));
        assert_eq!(out, "&lt;b&gt;");
    }

    #[test]
    fn test_unbalanced_blocks_rejected() {
        assert_eq!(
            link_program(code("}")).unwrap_err(),
            ProgramError::UnexpectedEnd
        );
        assert_eq!(
            link_program(code("for x in data {")).unwrap_err(),
            ProgramError::UnclosedBlock("for")
        );
        assert_eq!(
            link_program(code("for x in data { } else {")).unwrap_err(),
            ProgramError::UnexpectedElse
        );
    }

    struct Recorder(Vec<(String, usize, LazyCapture)>);

    impl LazySink for Recorder {
        fn record(&mut self, rule: &str, slot: usize, capture: LazyCapture) -> Result<usize, EvalError> {
            self.0.push((rule.to_string(), slot, capture));
            Ok(self.0.len() - 1)
        }
    }

    #[test]
    fn test_lazy_records_per_iteration() {
        let mut instrs = code("for item in data.items {");
        instrs.push(Instr::Lazy {
            rule: Rc::from("event"),
            slot: 3,
            args: vec![compile_expr("item").expect("compile")],
            capture_locals: true,
            emit_marker: true,
        });
        instrs.push(text(";"));
        instrs.extend(code("}"));
        let program = link_program(instrs).expect("link");
        let mut env = Env::new();
        env.set_global("data", Value::from(json!({"items": [10, 20]})));
        let mut sink = Recorder(Vec::new());
        let out = execute_program(&program, &mut env, &Operators::new(), &mut sink).expect("run");
        assert_eq!(out, "3.0;3.1;");
        assert_eq!(sink.0.len(), 2);
        assert_eq!(sink.0[1].2.values, vec![Value::Int(20)]);
        assert_eq!(sink.0[1].2.locals[0].1, Value::Int(20));
    }

    #[test]
    fn test_listing_shows_structure() {
        let mut instrs = code("if data.ok {");
        instrs.push(text("yes"));
        instrs.extend(code("}"));
        let listing = link_program(instrs).expect("link").listing();
        assert!(listing.starts_with("if "));
        assert!(listing.contains("  text \"yes\""));
    }
}
