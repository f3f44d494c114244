use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::rc::Rc;

pub type EvalResult = Result<Value, EvalError>;

/// Runtime failure inside template code or a host callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

pub struct Context<'a> {
    pub operators: &'a Operators,
}

/// Operators receive already-evaluated arguments.
pub type Operator = fn(args: &[Value], ctx: &mut Context) -> EvalResult;

/// Named functions reachable from template code by bare call (`upper(x)`).
///
/// Local variables and globals shadow operators of the same name.
#[derive(Clone)]
pub struct Operators {
    ops: HashMap<String, Operator>,
}

impl Operators {
    pub fn new() -> Self {
        let mut ops: HashMap<String, Operator> = HashMap::new();
        ops.insert("len".into(), op_len as Operator);
        ops.insert("upper".into(), op_upper as Operator);
        ops.insert("lower".into(), op_lower as Operator);
        ops.insert("trim".into(), op_trim as Operator);
        ops.insert("concat".into(), op_concat as Operator);
        ops.insert("contains".into(), op_contains as Operator);
        ops.insert("format".into(), op_format as Operator);
        ops.insert("to_int".into(), op_to_int as Operator);
        ops.insert("to_float".into(), op_to_float as Operator);
        ops.insert("to_string".into(), op_to_string as Operator);
        ops.insert("keys".into(), op_keys as Operator);
        ops.insert("values".into(), op_values as Operator);
        ops.insert("join".into(), op_join as Operator);
        ops.insert("push".into(), op_push as Operator);
        ops.insert("get".into(), op_get as Operator);
        ops.insert("merge".into(), op_merge as Operator);
        ops.insert("json".into(), op_json as Operator);
        ops.insert("range".into(), op_range as Operator);
        ops.insert("map".into(), op_map as Operator);
        ops.insert("filter".into(), op_filter as Operator);
        ops.insert("escape".into(), op_escape as Operator);
        ops.insert("log".into(), op_log as Operator);
        Self { ops }
    }

    pub fn get(&self, name: &str) -> Option<Operator> {
        self.ops.get(name).copied()
    }

    pub fn register(&mut self, name: impl Into<String>, operator: Operator) -> Option<Operator> {
        self.ops.insert(name.into(), operator)
    }

    pub fn call(&self, name: &str, args: &[Value]) -> EvalResult {
        let op = self
            .get(name)
            .ok_or_else(|| EvalError::new(format!("{name} is not a function")))?;
        let mut ctx = Context { operators: self };
        op(args, &mut ctx)
    }
}

impl Default for Operators {
    fn default() -> Self {
        Self::new()
    }
}

/// Markup escaping applied by `##-`.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn arg(args: &[Value], idx: usize) -> Value {
    args.get(idx).cloned().unwrap_or(Value::Null)
}

fn op_len(args: &[Value], _ctx: &mut Context) -> EvalResult {
    Ok(match arg(args, 0) {
        Value::Str(s) => Value::Int(s.chars().count() as i64),
        Value::Array(a) => Value::Int(a.len() as i64),
        Value::Object(o) => Value::Int(o.len() as i64),
        _ => Value::Int(0),
    })
}

fn op_upper(args: &[Value], _ctx: &mut Context) -> EvalResult {
    Ok(Value::from(arg(args, 0).display_string().to_uppercase()))
}

fn op_lower(args: &[Value], _ctx: &mut Context) -> EvalResult {
    Ok(Value::from(arg(args, 0).display_string().to_lowercase()))
}

fn op_trim(args: &[Value], _ctx: &mut Context) -> EvalResult {
    Ok(Value::string(arg(args, 0).display_string().trim()))
}

fn op_concat(args: &[Value], _ctx: &mut Context) -> EvalResult {
    let mut out = String::new();
    for v in args {
        out.push_str(&v.display_string());
    }
    Ok(Value::from(out))
}

fn op_contains(args: &[Value], _ctx: &mut Context) -> EvalResult {
    let needle = arg(args, 1);
    Ok(Value::Bool(match arg(args, 0) {
        Value::Str(s) => s.contains(needle.display_string().as_str()),
        Value::Array(items) => items.iter().any(|v| *v == needle),
        Value::Object(obj) => obj.contains_key(needle.display_string().as_str()),
        _ => false,
    }))
}

/// `format("Hi {}, {}", a, b)` fills `{}` holes left to right.
fn op_format(args: &[Value], _ctx: &mut Context) -> EvalResult {
    let tpl = arg(args, 0).display_string();
    let mut out = String::with_capacity(tpl.len());
    let mut rest = tpl.as_str();
    let mut idx = 1;
    while let Some(pos) = rest.find("{}") {
        out.push_str(&rest[..pos]);
        out.push_str(&arg(args, idx).display_string());
        idx += 1;
        rest = &rest[pos + 2..];
    }
    out.push_str(rest);
    Ok(Value::from(out))
}

fn op_to_int(args: &[Value], _ctx: &mut Context) -> EvalResult {
    Ok(arg(args, 0).as_i64().map(Value::Int).unwrap_or(Value::Null))
}

fn op_to_float(args: &[Value], _ctx: &mut Context) -> EvalResult {
    Ok(arg(args, 0).as_f64().map(Value::Float).unwrap_or(Value::Null))
}

fn op_to_string(args: &[Value], _ctx: &mut Context) -> EvalResult {
    Ok(Value::from(arg(args, 0).display_string()))
}

fn op_keys(args: &[Value], _ctx: &mut Context) -> EvalResult {
    Ok(match arg(args, 0) {
        Value::Object(obj) => Value::array(obj.keys().map(|k| Value::Str(k.clone()))),
        Value::Array(items) => Value::array((0..items.len() as i64).map(Value::Int)),
        _ => Value::array([]),
    })
}

fn op_values(args: &[Value], _ctx: &mut Context) -> EvalResult {
    Ok(match arg(args, 0) {
        Value::Object(obj) => Value::array(obj.values().cloned()),
        v @ Value::Array(_) => v,
        _ => Value::array([]),
    })
}

fn op_join(args: &[Value], _ctx: &mut Context) -> EvalResult {
    let sep = match arg(args, 1) {
        Value::Null => ",".to_string(),
        v => v.display_string(),
    };
    let items = arg(args, 0);
    let parts: Vec<String> = items
        .as_array()
        .unwrap_or(&[])
        .iter()
        .map(Value::display_string)
        .collect();
    Ok(Value::from(parts.join(&sep)))
}

/// Returns a new array; template values are never mutated in place.
fn op_push(args: &[Value], _ctx: &mut Context) -> EvalResult {
    let mut items = match arg(args, 0) {
        Value::Array(a) => a.as_ref().clone(),
        Value::Null => Vec::new(),
        other => {
            return Err(EvalError::new(format!(
                "push expects an array, got {}",
                other.type_name()
            )));
        }
    };
    items.extend(args.iter().skip(1).cloned());
    Ok(Value::Array(Rc::new(items)))
}

fn op_get(args: &[Value], _ctx: &mut Context) -> EvalResult {
    let base = arg(args, 0);
    let path = arg(args, 1).display_string();
    let found = base.get_path(&path);
    if found.is_null() {
        Ok(arg(args, 2))
    } else {
        Ok(found)
    }
}

fn op_merge(args: &[Value], _ctx: &mut Context) -> EvalResult {
    let mut acc = Value::object::<&str>([]);
    for v in args {
        acc = acc.merged(v);
    }
    Ok(acc)
}

fn op_json(args: &[Value], _ctx: &mut Context) -> EvalResult {
    let v: serde_json::Value = (&arg(args, 0)).into();
    Ok(Value::from(v.to_string()))
}

/// Longest array `range` will build.
const MAX_RANGE_LEN: i64 = 1_000_000;

/// `range(n)` or `range(start, end)`.
fn op_range(args: &[Value], _ctx: &mut Context) -> EvalResult {
    let (start, end) = match (arg(args, 0).as_i64(), arg(args, 1).as_i64()) {
        (Some(end), None) => (0, end),
        (Some(start), Some(end)) => (start, end),
        _ => return Err(EvalError::new("range expects integer bounds")),
    };
    let len = end.saturating_sub(start).max(0);
    if len > MAX_RANGE_LEN {
        return Err(EvalError::new(format!(
            "range of {len} items exceeds the limit of {MAX_RANGE_LEN}"
        )));
    }
    Ok(Value::array((start..end.max(start)).map(Value::Int)))
}

fn op_map(args: &[Value], _ctx: &mut Context) -> EvalResult {
    let items = arg(args, 0);
    let f = arg(args, 1);
    let f = f
        .as_function()
        .ok_or_else(|| EvalError::new("map expects a function as second argument"))?;
    let mut out = Vec::new();
    for (i, item) in items.as_array().unwrap_or(&[]).iter().enumerate() {
        out.push(f.call(&[item.clone(), Value::Int(i as i64)])?);
    }
    Ok(Value::from(out))
}

fn op_filter(args: &[Value], _ctx: &mut Context) -> EvalResult {
    let items = arg(args, 0);
    let f = arg(args, 1);
    let f = f
        .as_function()
        .ok_or_else(|| EvalError::new("filter expects a function as second argument"))?;
    let mut out = Vec::new();
    for (i, item) in items.as_array().unwrap_or(&[]).iter().enumerate() {
        if f.call(&[item.clone(), Value::Int(i as i64)])?.is_truthy() {
            out.push(item.clone());
        }
    }
    Ok(Value::from(out))
}

fn op_escape(args: &[Value], _ctx: &mut Context) -> EvalResult {
    Ok(Value::from(escape_html(&arg(args, 0).display_string())))
}

fn op_log(args: &[Value], _ctx: &mut Context) -> EvalResult {
    let line = args
        .iter()
        .map(Value::display_string)
        .collect::<Vec<_>>()
        .join(" ");
    tracing::info!(target: "cotmpl::log", "{line}");
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_fills_holes_in_order() {
        let ops = Operators::new();
        let out = ops
            .call("format", &[Value::from("{} of {}"), Value::Int(1), Value::Int(3)])
            .expect("format");
        assert_eq!(out, Value::from("1 of 3"));
    }

    #[test]
    fn test_push_returns_new_array() {
        let ops = Operators::new();
        let base = Value::from(json!([1]));
        let out = ops.call("push", &[base.clone(), Value::Int(2)]).expect("push");
        assert_eq!(out, Value::from(json!([1, 2])));
        assert_eq!(base, Value::from(json!([1])));
    }

    #[test]
    fn test_map_calls_host_function() {
        let ops = Operators::new();
        let double = Value::function("double", |args| {
            Ok(Value::Int(args[0].as_i64().unwrap_or(0) * 2))
        });
        let out = ops
            .call("map", &[Value::from(json!([1, 2])), double])
            .expect("map");
        assert_eq!(out, Value::from(json!([2, 4])));
    }

    #[test]
    fn test_unknown_operator_is_error() {
        let ops = Operators::new();
        let err = ops.call("nope", &[]).expect_err("should fail");
        assert_eq!(err.message, "nope is not a function");
    }

    #[test]
    fn test_range_is_bounded() {
        let ops = Operators::new();
        let out = ops.call("range", &[Value::Int(2), Value::Int(5)]).expect("range");
        assert_eq!(out, Value::from(json!([2, 3, 4])));
        assert_eq!(ops.call("range", &[Value::Int(5), Value::Int(1)]).expect("empty"), Value::from(json!([])));
        let err = ops
            .call("range", &[Value::Int(0), Value::Int(i64::MAX)])
            .expect_err("too long");
        assert!(err.message.contains("exceeds the limit"));
        assert!(ops.call("range", &[Value::Int(i64::MIN), Value::Int(i64::MAX)]).is_err());
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<b>&\"'"), "&lt;b&gt;&amp;&quot;&#39;");
    }
}
