use crate::compiler::{Expr, compile_expr};
use crate::program::{Instr, LazySink, Program, ProgramError, execute_program, link_program};
use crate::reader::ReaderError;
use crate::runtime::{EvalError, EvalResult, Operator, Operators};
use crate::value::Value;
use crate::vm::{Env, eval_expr};

/// Execution surface for template code.
///
/// Operator registration is instance-local, so two template engines in one
/// process can carry different host functions.
#[derive(Default, Clone)]
pub struct Engine {
    operators: Operators,
}

impl Engine {
    /// Create an engine with the built-in operators preloaded.
    pub fn new() -> Self {
        Self {
            operators: Operators::new(),
        }
    }

    /// Register or replace an operator.
    pub fn register(&mut self, name: impl Into<String>, operator: Operator) -> Option<Operator> {
        self.operators.register(name, operator)
    }

    pub fn compile_expr(&self, src: &str) -> Result<Expr, ReaderError> {
        compile_expr(src)
    }

    pub fn link(&self, instrs: Vec<Instr>) -> Result<Program, ProgramError> {
        link_program(instrs)
    }

    pub fn eval(&self, expr: &Expr, env: &mut Env) -> EvalResult {
        eval_expr(expr, env, &self.operators)
    }

    /// Compile and evaluate one expression against `data`.
    pub fn eval_str(&self, src: &str, data: Value) -> EvalResult {
        let expr = compile_expr(src).map_err(|e| EvalError::new(e.to_string()))?;
        let mut env = Env::new();
        env.set_global("data", data);
        self.eval(&expr, &mut env)
    }

    pub fn run(&self, program: &Program, env: &mut Env, sink: &mut dyn LazySink) -> Result<String, EvalError> {
        execute_program(program, env, &self.operators, sink)
    }

    /// Access the operator registry (read-only).
    pub fn operators(&self) -> &Operators {
        &self.operators
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Context;
    use serde_json::json;

    fn op_shout(args: &[Value], _ctx: &mut Context) -> EvalResult {
        Ok(Value::from(format!("{}!", args[0].display_string())))
    }

    #[test]
    fn test_registered_operator_is_instance_local() {
        let mut engine = Engine::new();
        engine.register("shout", op_shout);
        assert_eq!(
            engine.eval_str("shout(data.word)", Value::from(json!({"word": "hey"}))).expect("eval"),
            Value::from("hey!")
        );
        assert!(Engine::new().eval_str("shout('x')", Value::Null).is_err());
    }
}
