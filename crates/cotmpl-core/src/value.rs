use crate::runtime::EvalError;
use serde_json::{Map, Number};
use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

pub type ObjectMap = BTreeMap<Rc<str>, Value>;

/// Mutable map shared between renders of one component (`status`).
pub type SharedMap = Rc<RefCell<ObjectMap>>;

type NativeFn = dyn Fn(&[Value]) -> Result<Value, EvalError>;

/// Host callback callable from template code and from event listeners.
#[derive(Clone)]
pub struct Function {
    name: Rc<str>,
    call: Rc<NativeFn>,
}

impl Function {
    pub fn new(
        name: impl Into<Rc<str>>,
        f: impl Fn(&[Value]) -> Result<Value, EvalError> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            call: Rc::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: &[Value]) -> Result<Value, EvalError> {
        (self.call)(args)
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Rc::ptr_eq(&self.call, &other.call)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({})", self.name)
    }
}

/// Object owned by the embedding layer (tree nodes, component handles).
///
/// The core never inspects hosts beyond member reads; the web layer
/// downcasts through [`HostObject::as_any`].
pub trait HostObject: fmt::Debug {
    fn type_name(&self) -> &'static str;

    fn get(&self, _key: &str) -> Value {
        Value::Null
    }

    fn display_string(&self) -> String {
        format!("[{}]", self.type_name())
    }

    /// Identity comparison across distinct handles to the same host object.
    fn host_eq(&self, _other: &dyn HostObject) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;
}

/// Runtime value of the template language.
///
/// `Int` and `Float` are inline; strings and collections are `Rc`-shared
/// so cloning a `data` tree per render stays cheap.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Array(Rc<Vec<Value>>),
    Object(Rc<ObjectMap>),
    Func(Function),
    Host(Rc<dyn HostObject>),
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Self {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn array(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Array(Rc::new(items.into_iter().collect()))
    }

    /// Build an object from `(key, value)` pairs.
    pub fn object<K: AsRef<str>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(Rc::new(
            pairs
                .into_iter()
                .map(|(k, v)| (Rc::from(k.as_ref()), v))
                .collect(),
        ))
    }

    pub fn function(
        name: impl Into<Rc<str>>,
        f: impl Fn(&[Value]) -> Result<Value, EvalError> + 'static,
    ) -> Self {
        Value::Func(Function::new(name, f))
    }

    pub fn host<T: HostObject + 'static>(host: T) -> Self {
        Value::Host(Rc::new(host))
    }

    #[inline]
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0 && !f.is_nan(),
            Value::Str(s) => !s.is_empty(),
            // Collections, callbacks and host objects are always truthy.
            Value::Array(_) | Value::Object(_) | Value::Func(_) | Value::Host(_) => true,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Func(_) => "function",
            Value::Host(h) => h.type_name(),
        }
    }

    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(f) => Some(*f as i64),
            Value::Bool(b) => Some(if *b { 1 } else { 0 }),
            Value::Str(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Str(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_ref()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a.as_slice()),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectMap> {
        match self {
            Value::Object(o) => Some(o.as_ref()),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Func(f) => Some(f),
            _ => None,
        }
    }

    /// Downcast a host value to its concrete embedding type.
    pub fn downcast_host<T: 'static>(&self) -> Option<&T> {
        match self {
            Value::Host(h) => h.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Member read with template semantics: object keys, array indices,
    /// `length`, and host members. Missing members are `Null`.
    pub fn get(&self, key: &str) -> Value {
        match self {
            Value::Object(obj) => obj.get(key).cloned().unwrap_or(Value::Null),
            Value::Array(arr) => {
                if key == "length" {
                    return Value::Int(arr.len() as i64);
                }
                key.parse::<usize>()
                    .ok()
                    .and_then(|i| arr.get(i).cloned())
                    .unwrap_or(Value::Null)
            }
            Value::Str(s) if key == "length" => Value::Int(s.chars().count() as i64),
            Value::Host(h) => h.get(key),
            _ => Value::Null,
        }
    }

    /// Dotted path read (`"a.b.0"`).
    pub fn get_path(&self, path: &str) -> Value {
        if path.is_empty() {
            return self.clone();
        }
        let mut current = self.clone();
        for part in path.split('.') {
            current = current.get(part);
            if current.is_null() {
                break;
            }
        }
        current
    }

    /// Index read where the key is itself a value (`a[b]`).
    pub fn index(&self, key: &Value) -> Value {
        match (self, key) {
            (Value::Array(arr), Value::Int(n)) if *n >= 0 => {
                arr.get(*n as usize).cloned().unwrap_or(Value::Null)
            }
            (Value::Array(arr), Value::Float(f)) if *f >= 0.0 => {
                arr.get(*f as usize).cloned().unwrap_or(Value::Null)
            }
            (_, Value::Str(s)) => self.get(s),
            (_, other) => self.get(&other.display_string()),
        }
    }

    /// Copy-on-write write of a nested member. Intermediate objects are
    /// created on demand; writing through a non-object is an error.
    pub fn set_member_path(&mut self, path: &[Rc<str>], value: Value) -> Result<(), EvalError> {
        let Some((first, rest)) = path.split_first() else {
            *self = value;
            return Ok(());
        };
        if self.is_null() {
            *self = Value::Object(Rc::new(ObjectMap::new()));
        }
        match self {
            Value::Object(obj) => {
                let map = Rc::make_mut(obj);
                let slot = map.entry(first.clone()).or_insert(Value::Null);
                slot.set_member_path(rest, value)
            }
            Value::Array(arr) => {
                let idx = first
                    .parse::<usize>()
                    .map_err(|_| EvalError::new(format!("invalid array index '{first}'")))?;
                let items = Rc::make_mut(arr);
                if idx >= items.len() {
                    items.resize(idx + 1, Value::Null);
                }
                items[idx].set_member_path(rest, value)
            }
            other => Err(EvalError::new(format!(
                "cannot set member '{first}' on {}",
                other.type_name()
            ))),
        }
    }

    /// Shallow merge of `other` over `self`. Non-object operands yield `other`.
    pub fn merged(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Object(base), Value::Object(over)) => {
                let mut map = base.as_ref().clone();
                for (k, v) in over.iter() {
                    map.insert(k.clone(), v.clone());
                }
                Value::Object(Rc::new(map))
            }
            (_, Value::Null) => self.clone(),
            _ => other.clone(),
        }
    }

    pub fn cmp_numeric_or_string(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => Some(self.display_string().cmp(&other.display_string())),
            },
        }
    }

    pub fn display_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => format_f64(*f),
            Value::Str(s) => s.to_string(),
            Value::Array(items) => items
                .iter()
                .map(Value::display_string)
                .collect::<Vec<_>>()
                .join(","),
            Value::Object(_) => {
                let v: serde_json::Value = self.into();
                v.to_string()
            }
            Value::Func(f) => format!("[function {}]", f.name()),
            Value::Host(h) => h.display_string(),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{}", format_f64(*x)),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Array(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Object(obj) => f
                .debug_map()
                .entries(obj.iter().map(|(k, v)| (k.as_ref(), v)))
                .finish(),
            Value::Func(func) => write!(f, "{func:?}"),
            Value::Host(h) => write!(f, "{h:?}"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) => (*a as f64) == *b,
            (Value::Float(a), Value::Int(b)) => *a == (*b as f64),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Func(a), Value::Func(b)) => a.ptr_eq(b),
            (Value::Host(a), Value::Host(b)) => Rc::ptr_eq(a, b) || a.host_eq(b.as_ref()),
            _ => false,
        }
    }
}

pub(crate) fn format_f64(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e15 {
        format!("{:.0}", f)
    } else {
        f.to_string()
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::Null
                }
            }
            serde_json::Value::String(s) => Value::Str(Rc::from(s.as_str())),
            serde_json::Value::Array(arr) => {
                Value::Array(Rc::new(arr.into_iter().map(Value::from).collect()))
            }
            serde_json::Value::Object(obj) => Value::Object(Rc::new(
                obj.into_iter()
                    .map(|(k, v)| (Rc::from(k.as_str()), Value::from(v)))
                    .collect(),
            )),
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::Number(Number::from(*n)),
            Value::Float(f) => Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.to_string()),
            Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(serde_json::Value::from).collect())
            }
            Value::Object(obj) => {
                let map: Map<String, serde_json::Value> = obj
                    .iter()
                    .map(|(k, v)| (k.to_string(), serde_json::Value::from(v)))
                    .collect();
                serde_json::Value::Object(map)
            }
            Value::Func(_) | Value::Host(_) => serde_json::Value::String(v.display_string()),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        (&v).into()
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Rc::from(s.as_str()))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Function> for Value {
    fn from(f: Function) -> Self {
        Value::Func(f)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_conversion_keeps_shape() {
        let v = Value::from(json!({"name": "Ann", "tags": ["a", "b"], "n": 2}));
        assert_eq!(v.get("name"), Value::string("Ann"));
        assert_eq!(v.get_path("tags.1"), Value::string("b"));
        assert_eq!(v.get("tags").get("length"), Value::Int(2));
        let back: serde_json::Value = v.into();
        assert_eq!(back, json!({"name": "Ann", "tags": ["a", "b"], "n": 2}));
    }

    #[test]
    fn set_member_path_is_copy_on_write() {
        let original = Value::from(json!({"a": {"b": 1}}));
        let mut copy = original.clone();
        copy.set_member_path(&[Rc::from("a"), Rc::from("c")], Value::Int(2))
            .expect("set");
        assert_eq!(original.get_path("a.c"), Value::Null);
        assert_eq!(copy.get_path("a.c"), Value::Int(2));
        assert_eq!(copy.get_path("a.b"), Value::Int(1));
    }

    #[test]
    fn merged_overrides_top_level_keys() {
        let base = Value::from(json!({"x": 1, "y": 1}));
        let over = Value::from(json!({"y": 2}));
        assert_eq!(base.merged(&over), Value::from(json!({"x": 1, "y": 2})));
    }

    #[test]
    fn functions_compare_by_identity() {
        let f = Function::new("f", |_| Ok(Value::Null));
        let g = Function::new("f", |_| Ok(Value::Null));
        assert_eq!(Value::Func(f.clone()), Value::Func(f));
        assert_ne!(
            Value::Func(g),
            Value::Func(Function::new("f", |_| Ok(Value::Null)))
        );
    }
}
