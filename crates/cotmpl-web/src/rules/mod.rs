//! Rule registry.
//!
//! A [`TemplateRule`] names one DSL construct: a pattern recognised at
//! compile time, an `exec` turning each match into instructions, and an
//! optional `lazy_exec` that wires behaviour onto the rendered tree. Rule
//! order matters twice: it is the alternative order of the combined matcher
//! and the order deferred actions run in after every render.

mod builtin;
mod deferred;

use crate::component::Component;
use crate::dom::NodeRef;
use crate::engine::Engine;
use crate::error::{ErrorPolicy, TemplateError};
use crate::lazy::{LazyScope, LazySlot, parse_marker};
use cotmpl_core::{Env, EvalError, Expr, Instr, NullSink, Program, Value, compile_block};
use std::fmt;
use std::rc::Rc;
use tracing::{debug, warn};

pub use deferred::apply_props;

pub type ExecFn = Rc<dyn Fn(&mut CompileContext<'_>, &RuleMatch<'_>) -> Result<Vec<Instr>, TemplateError>>;
pub type LazyExecFn = Rc<dyn Fn(&mut LazyContext<'_>) -> Result<(), TemplateError>>;

#[derive(Clone)]
pub struct TemplateRule {
    pub name: Rc<str>,
    pub pattern: Option<String>,
    pub exec: Option<ExecFn>,
    pub lazy_exec: Option<LazyExecFn>,
}

impl TemplateRule {
    pub fn new(name: impl Into<Rc<str>>) -> Self {
        Self {
            name: name.into(),
            pattern: None,
            exec: None,
            lazy_exec: None,
        }
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn exec(
        mut self,
        f: impl Fn(&mut CompileContext<'_>, &RuleMatch<'_>) -> Result<Vec<Instr>, TemplateError> + 'static,
    ) -> Self {
        self.exec = Some(Rc::new(f));
        self
    }

    pub fn lazy_exec(mut self, f: impl Fn(&mut LazyContext<'_>) -> Result<(), TemplateError> + 'static) -> Self {
        self.lazy_exec = Some(Rc::new(f));
        self
    }

    /// Whether the rule takes part in matching.
    pub fn is_matching(&self) -> bool {
        self.pattern.is_some() && self.exec.is_some()
    }
}

impl fmt::Debug for TemplateRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateRule")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .field("exec", &self.exec.is_some())
            .field("lazy_exec", &self.lazy_exec.is_some())
            .finish()
    }
}

/// Ordered rule list.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<TemplateRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<TemplateRule>) -> Self {
        Self { rules }
    }

    /// The built-in DSL. Raw `## code ##` is last so every more specific
    /// `##x` token wins.
    pub fn builtin() -> Self {
        Self::new(vec![
            builtin::comment(),
            builtin::compile_time(),
            builtin::interpolate(),
            builtin::escape(),
            builtin::style(),
            deferred::insert(),
            deferred::props(),
            deferred::named_element(),
            deferred::element_ref(),
            deferred::load(),
            deferred::event(),
            deferred::deferred_code(),
            builtin::raw(),
        ])
    }

    /// Overrides replace same-named rules in place; new names are appended.
    pub fn merged(&self, overrides: &[TemplateRule]) -> Self {
        let mut rules = self.rules.clone();
        for rule in overrides {
            match rules.iter_mut().find(|r| r.name == rule.name) {
                Some(slot) => *slot = rule.clone(),
                None => rules.push(rule.clone()),
            }
        }
        Self { rules }
    }

    pub fn get(&self, name: &str) -> Option<&TemplateRule> {
        self.rules.iter().find(|r| r.name.as_ref() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TemplateRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// One match of a rule, with the rule's own capture groups numbered from 1.
#[derive(Debug, Clone)]
pub struct RuleMatch<'t> {
    pub text: &'t str,
    pub(crate) groups: Vec<Option<&'t str>>,
}

impl<'t> RuleMatch<'t> {
    pub fn new(text: &'t str, groups: Vec<Option<&'t str>>) -> Self {
        Self { text, groups }
    }

    pub fn group(&self, idx: usize) -> Option<&'t str> {
        idx.checked_sub(1)
            .and_then(|i| self.groups.get(i).copied().flatten())
    }

    /// First capture group, or `""`.
    pub fn inner(&self) -> &'t str {
        self.group(1).unwrap_or("")
    }
}

/// State handed to a rule's `exec` while one template compiles.
pub struct CompileContext<'a> {
    pub(crate) template_id: &'a str,
    pub(crate) rule: Rc<str>,
    pub(crate) seed: &'a mut LazyScope,
    pub(crate) styles: &'a mut Vec<String>,
    pub(crate) core: &'a cotmpl_core::Engine,
    pub(crate) env: &'a mut Env,
}

impl CompileContext<'_> {
    pub fn template_id(&self) -> &str {
        self.template_id
    }

    pub fn rule(&self) -> &str {
        &self.rule
    }

    pub fn core(&self) -> &cotmpl_core::Engine {
        self.core
    }

    /// Reserve the next deferred slot of the current rule.
    pub fn reserve_slot(&mut self, slot: LazySlot) -> Result<usize, TemplateError> {
        self.seed
            .push_slot(&self.rule, slot)
            .ok_or_else(|| EvalError::new(format!("rule '{}' has no deferred phase", self.rule)).into())
    }

    /// Reserve a slot and build the instruction that fills it at render time.
    pub fn lazy(
        &mut self,
        slot: LazySlot,
        args: Vec<Expr>,
        capture_locals: bool,
        emit_marker: bool,
    ) -> Result<Instr, TemplateError> {
        let slot = self.reserve_slot(slot)?;
        Ok(Instr::Lazy {
            rule: self.rule.clone(),
            slot,
            args,
            capture_locals,
            emit_marker,
        })
    }

    pub fn add_style(&mut self, css: &str) {
        let css = css.trim();
        if !css.is_empty() {
            self.styles.push(css.to_string());
        }
    }

    /// Run code once, now. A lone expression yields its value; bindings made
    /// here stay visible to later compile-time blocks of the same template.
    pub fn run_compile_time(&mut self, src: &str) -> Result<Option<Value>, TemplateError> {
        let stmts = compile_block(src)?;
        if stmts.len() == 1 {
            if let cotmpl_core::Stmt::Expr(expr) = &stmts[0] {
                return Ok(Some(self.core.eval(expr, self.env)?));
            }
        }
        let program = self
            .core
            .link(stmts.into_iter().map(Instr::Stmt).collect())?;
        self.core.run(&program, self.env, &mut NullSink)?;
        Ok(None)
    }
}

/// A placeholder located in the rendered tree.
#[derive(Debug, Clone)]
pub struct Marked {
    pub node: NodeRef,
    pub slot: usize,
    pub record: usize,
}

/// State handed to a rule's `lazy_exec` after one render.
pub struct LazyContext<'a> {
    pub(crate) rule: Rc<str>,
    pub(crate) template_id: &'a str,
    pub(crate) engine: &'a Engine,
    pub(crate) component: &'a Component,
    pub(crate) root: &'a NodeRef,
    pub(crate) data: &'a Value,
    pub(crate) scope: &'a mut LazyScope,
    pub(crate) refs: &'a mut Vec<(Rc<str>, Value)>,
}

impl LazyContext<'_> {
    pub fn rule(&self) -> &str {
        &self.rule
    }

    pub fn template_id(&self) -> &str {
        self.template_id
    }

    pub fn engine(&self) -> &Engine {
        self.engine
    }

    pub fn component(&self) -> &Component {
        self.component
    }

    /// Fragment produced by the render.
    pub fn root(&self) -> &NodeRef {
        self.root
    }

    pub fn data(&self) -> &Value {
        self.data
    }

    pub fn policy(&self) -> ErrorPolicy {
        self.engine.config().policy
    }

    pub fn scope(&self) -> &LazyScope {
        self.scope
    }

    pub fn scope_mut(&mut self) -> &mut LazyScope {
        self.scope
    }

    /// Bind `name` as a global for `###` code run later in this pass.
    pub fn bind_ref(&mut self, name: Rc<str>, value: Value) {
        match self.refs.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.refs.push((name, value)),
        }
    }

    /// Nodes carrying `attr`, in slot/record order. The attribute is removed.
    pub fn marked(&self, attr: &str) -> Vec<Marked> {
        let mut out = Vec::new();
        for node in self.root.query_attr(attr) {
            let Some(marker) = node.remove_attr(attr) else {
                continue;
            };
            match parse_marker(&marker) {
                Some((slot, record)) => out.push(Marked { node, slot, record }),
                None => debug!(
                    template = %self.template_id,
                    rule = %self.rule,
                    marker = %marker,
                    "ignoring malformed marker"
                ),
            }
        }
        out.sort_by_key(|m| (m.slot, m.record));
        out
    }

    /// Environment for running deferred code: render globals, `root`, and
    /// element references bound so far.
    pub fn env(&self) -> Env {
        let mut env = Env::new().with_status(self.component.status());
        env.set_global("data", self.data.clone());
        env.set_global("component", self.component.to_value());
        env.set_global("i18n", self.engine.i18n(self.template_id));
        env.set_global("tmplId", Value::from(self.template_id));
        env.set_global("root", self.root.to_value());
        for (name, value) in self.refs.iter() {
            env.set_global(name.clone(), value.clone());
        }
        env
    }

    /// Apply the error policy to one record's outcome. Strict escalates (the
    /// renderer logs at its boundary); lenient logs and swallows so sibling
    /// records still run.
    pub fn contain(&self, result: Result<(), TemplateError>) -> Result<(), TemplateError> {
        let Err(err) = result else {
            return Ok(());
        };
        let err = match err {
            e @ TemplateError::LazyExec { .. } => e,
            other => TemplateError::LazyExec {
                template: self.template_id.to_string(),
                rule: self.rule.to_string(),
                message: other.to_string(),
            },
        };
        if self.policy().is_strict() {
            Err(err)
        } else {
            warn!(template = %self.template_id, rule = %self.rule, error = %err, "deferred action failed; continuing");
            Ok(())
        }
    }

    pub(crate) fn run_program(&self, program: &Program, env: &mut Env) -> Result<(), TemplateError> {
        self.engine.core().run(program, env, &mut NullSink)?;
        Ok(())
    }
}

/// Split a rule payload on a separator, trimming each part.
pub(crate) fn split_args<'s>(payload: &'s str, sep: &str) -> Vec<&'s str> {
    payload.split(sep).map(str::trim).collect()
}

/// Literal name from a `##: name ##` payload, with surrounding quotes removed.
pub(crate) fn literal_name(payload: &str) -> &str {
    let trimmed = payload.trim();
    for quote in ['"', '\'', '`'] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|s| s.strip_suffix(quote))
        {
            return inner.trim();
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_order_ends_with_raw() {
        let rules = RuleSet::builtin();
        let names: Vec<&str> = rules.iter().map(|r| r.name.as_ref()).collect();
        assert_eq!(names.first(), Some(&"comment"));
        assert_eq!(names.last(), Some(&"raw"));
        assert!(names.iter().position(|n| *n == "event") < names.iter().position(|n| *n == "deferred"));
        assert!(names.iter().position(|n| *n == "elementRef") < names.iter().position(|n| *n == "deferred"));
    }

    #[test]
    fn test_merge_replaces_in_place_and_appends() {
        let base = RuleSet::builtin();
        let merged = base.merged(&[
            TemplateRule::new("comment"),
            TemplateRule::new("shout").pattern("!!(.*?)!!"),
        ]);
        assert_eq!(merged.len(), base.len() + 1);
        assert_eq!(merged.iter().next().map(|r| r.name.as_ref()), Some("comment"));
        assert!(!merged.get("comment").is_some_and(TemplateRule::is_matching));
        assert_eq!(merged.iter().last().map(|r| r.name.as_ref()), Some("shout"));
        // base untouched
        assert!(base.get("comment").is_some_and(TemplateRule::is_matching));
    }

    #[test]
    fn test_literal_name_and_split() {
        assert_eq!(literal_name(" 'title' "), "title");
        assert_eq!(literal_name("box"), "box");
        assert_eq!(split_args("a :: b", "::"), vec!["a", "b"]);
    }

    #[test]
    fn test_rule_match_groups() {
        let m = RuleMatch::new("##= x ##", vec![Some(" x "), None]);
        assert_eq!(m.inner(), " x ");
        assert_eq!(m.group(2), None);
        assert_eq!(m.group(0), None);
    }
}
