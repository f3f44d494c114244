//! cotmpl core crate.
//!
//! Language layer for the code embedded in templates:
//!
//! - `value`: the runtime value model, including host callbacks and opaque
//!   host objects supplied by the embedding layer.
//! - `reader` + `compiler`: infix expression/statement reader producing a
//!   typed AST with literal folding.
//! - `vm`: expression evaluator and variable environment.
//! - `runtime`: operator registry and built-in operators.
//! - `program`: flat instruction list, block linking and the interpreter
//!   that produces markup.
//!
//! Nothing here knows about element trees or components; that lives in
//! `cotmpl-web`.

pub mod compiler;
pub mod engine;
pub mod program;
pub mod reader;
pub mod runtime;
pub mod value;
pub mod vm;

pub use compiler::{Expr, Stmt, compile_block, compile_expr};
pub use engine::Engine;
pub use program::{
    Instr, LazyCapture, LazySink, NullSink, Program, ProgramError, execute_program, link_program,
};
pub use reader::ReaderError;
pub use runtime::{Context, EvalError, EvalResult, Operator, Operators, escape_html};
pub use value::{Function, HostObject, ObjectMap, SharedMap, Value};
pub use vm::Env;
