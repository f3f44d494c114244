use crate::component::Component;
use crate::config::EngineConfig;
use crate::dom::NodeRef;
use crate::error::TemplateError;
use crate::markup::parse_fragment;
use crate::matcher::Matcher;
use crate::registry::{Registry, TemplateMeta};
use crate::render::RenderFn;
use crate::rules::{RuleSet, TemplateRule};
use crate::runtime::register_dom_operators;
use crate::scheduler::Scheduler;
use crate::template::compile_template;
use cotmpl_core::{Operator, Value};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, info};

/// Upper bound on scheduler turns for [`Engine::flush`].
const FLUSH_TURNS: usize = 64;

struct EngineInner {
    config: EngineConfig,
    core: RefCell<Rc<cotmpl_core::Engine>>,
    registry: RefCell<Registry>,
    rules: RuleSet,
    matcher: Rc<Matcher>,
    scheduler: Scheduler,
    i18n: RefCell<HashMap<String, Value>>,
    // one entry per template id, in registration order
    styles: RefCell<Vec<(String, Vec<String>)>>,
    next_component: Cell<u64>,
}

/// Template engine: compiler, registry, scheduler and shared configuration.
///
/// Cheap to clone; clones share every table.
#[derive(Clone)]
pub struct Engine(Rc<EngineInner>);

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let rules = RuleSet::builtin();
        let matcher = Rc::new(Matcher::build(&rules));
        let mut core = cotmpl_core::Engine::new();
        register_dom_operators(&mut core);
        Engine(Rc::new(EngineInner {
            config,
            core: RefCell::new(Rc::new(core)),
            registry: RefCell::new(Registry::new()),
            rules,
            matcher,
            scheduler: Scheduler::new(),
            i18n: RefCell::new(HashMap::new()),
            styles: RefCell::new(Vec::new()),
            next_component: Cell::new(0),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.0.config
    }

    pub fn rules(&self) -> &RuleSet {
        &self.0.rules
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.0.scheduler
    }

    /// Run scheduler turns until nothing is due.
    pub fn flush(&self) -> usize {
        self.0.scheduler.flush(FLUSH_TURNS)
    }

    /// Snapshot of the expression engine. Registering an operator later does
    /// not affect a snapshot already taken.
    pub fn core(&self) -> Rc<cotmpl_core::Engine> {
        self.0.core.borrow().clone()
    }

    pub fn register_operator(&self, name: impl Into<String>, operator: Operator) {
        let mut core = self.0.core.borrow_mut();
        Rc::make_mut(&mut core).register(name, operator);
    }

    pub(crate) fn next_component_id(&self) -> u64 {
        let id = self.0.next_component.get() + 1;
        self.0.next_component.set(id);
        id
    }

    // === Compilation and registry ===

    /// Compile and register `text` under `id` with the default rules.
    /// Re-registering identical text returns the existing render function.
    pub fn template(&self, id: &str, text: &str) -> Result<RenderFn, TemplateError> {
        if let Some(meta) = self.0.registry.borrow().get(id) {
            if meta.default_rules && meta.template_text == text {
                return Ok(RenderFn::new(self.clone(), meta.compiled.clone()));
            }
        }
        self.compile_and_register(id, text, self.0.matcher.clone(), true)
    }

    /// Compile with `overrides` merged over the default rules.
    pub fn template_with_rules(
        &self,
        id: &str,
        text: &str,
        overrides: &[TemplateRule],
    ) -> Result<RenderFn, TemplateError> {
        if overrides.is_empty() {
            return self.template(id, text);
        }
        let matcher = Rc::new(Matcher::build(&self.0.rules.merged(overrides)));
        self.compile_and_register(id, text, matcher, false)
    }

    /// Register one template source, with optional rule overrides.
    pub fn add_tmpl(
        &self,
        id: &str,
        source: &str,
        overrides: &[TemplateRule],
    ) -> Result<RenderFn, TemplateError> {
        self.template_with_rules(id, source, overrides)
    }

    fn compile_and_register(
        &self,
        id: &str,
        text: &str,
        matcher: Rc<Matcher>,
        default_rules: bool,
    ) -> Result<RenderFn, TemplateError> {
        let core = self.core();
        let compiled = Rc::new(compile_template(
            id,
            text,
            matcher,
            &core,
            self.0.config.policy,
        )?);
        self.set_styles(id, compiled.styles().to_vec());
        let meta = TemplateMeta {
            compiled: compiled.clone(),
            template_text: text.to_string(),
            source_listing: self
                .0
                .config
                .debug_source
                .then(|| compiled.program().listing()),
            default_rules,
        };
        if self.0.registry.borrow_mut().register(id, meta).is_some() {
            debug!(template = %id, "replaced registered template");
        }
        Ok(RenderFn::new(self.clone(), compiled))
    }

    /// Register every template found in `container`: `<script>` elements of
    /// the configured template type and `<template>` elements, both keyed by
    /// their `id`. Returns the ids in document order.
    pub fn add_tmpls(
        &self,
        container: &NodeRef,
        remove_originals: bool,
        overrides: &[TemplateRule],
    ) -> Result<Vec<String>, TemplateError> {
        let script_type = self.0.config.template_script_type.as_str();
        let mut ids = Vec::new();
        for node in container.descendants() {
            let Some(tag) = node.tag_name() else {
                continue;
            };
            let is_template = match tag.as_str() {
                "script" => node.attr("type").is_some_and(|t| t == script_type),
                "template" => true,
                _ => false,
            };
            if !is_template {
                continue;
            }
            let Some(id) = node.attr("id").filter(|id| !id.is_empty()) else {
                debug!(tag = %tag, "template element without id; skipping");
                continue;
            };
            let source = node.text_content();
            self.template_with_rules(&id, &source, overrides)?;
            if remove_originals {
                node.detach();
            }
            ids.push(id);
        }
        info!(count = ids.len(), "registered templates from container");
        Ok(ids)
    }

    /// [`Engine::add_tmpls`] over a markup string.
    pub fn add_tmpls_from_markup(
        &self,
        markup: &str,
        overrides: &[TemplateRule],
    ) -> Result<Vec<String>, TemplateError> {
        let container = parse_fragment(markup);
        self.add_tmpls(&container, false, overrides)
    }

    pub fn lookup(&self, id: &str) -> Option<RenderFn> {
        let registry = self.0.registry.borrow();
        let meta = registry.get(id)?;
        Some(RenderFn::new(self.clone(), meta.compiled.clone()))
    }

    /// Look up by dotted namespace path (`group.key`).
    pub fn resolve(&self, path: &str) -> Option<RenderFn> {
        let registry = self.0.registry.borrow();
        let meta = registry.resolve(path)?;
        Some(RenderFn::new(self.clone(), meta.compiled.clone()))
    }

    pub fn meta(&self, id: &str) -> Option<TemplateMeta> {
        self.0.registry.borrow().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.0.registry.borrow().ids()
    }

    /// `(group.key, id)` pairs of the namespace table.
    pub fn namespace(&self) -> Vec<(String, String)> {
        self.0.registry.borrow().namespace_entries()
    }

    pub fn remap(&self, old: &str, new: &str) -> Result<(), TemplateError> {
        if !self.0.registry.borrow_mut().remap(old, new) {
            return Err(TemplateError::UnknownTemplate(old.to_string()));
        }
        let mut styles = self.0.styles.borrow_mut();
        styles.retain(|(id, _)| id != new);
        if let Some(entry) = styles.iter_mut().find(|(id, _)| id == old) {
            entry.0 = new.to_string();
        }
        Ok(())
    }

    pub fn delete(&self, id: &str) -> bool {
        self.0.styles.borrow_mut().retain(|(owner, _)| owner != id);
        self.0.registry.borrow_mut().delete(id).is_some()
    }

    /// Lookup, then render.
    pub fn render(&self, id: &str, data: impl Into<Value>) -> Result<Component, TemplateError> {
        self.lookup(id)
            .ok_or_else(|| TemplateError::UnknownTemplate(id.to_string()))?
            .render(data)
    }

    // === i18n and styles ===

    pub fn set_i18n(&self, id: &str, table: impl Into<Value>) {
        self.0.i18n.borrow_mut().insert(id.to_string(), table.into());
    }

    /// The i18n entry for `id`, `null` when none was set.
    pub fn i18n(&self, id: &str) -> Value {
        self.0.i18n.borrow().get(id).cloned().unwrap_or(Value::Null)
    }

    fn set_styles(&self, id: &str, css: Vec<String>) {
        let mut styles = self.0.styles.borrow_mut();
        styles.retain(|(owner, _)| owner != id);
        if !css.is_empty() {
            styles.push((id.to_string(), css));
        }
    }

    /// Hoisted `<style>` bodies of every registered template.
    pub fn stylesheet(&self) -> String {
        self.0
            .styles
            .borrow()
            .iter()
            .flat_map(|(_, css)| css.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lookup_is_idempotent() {
        let engine = Engine::default();
        let a = engine.template("card", "<b>##= data.x ##</b>").expect("compile");
        let b = engine.template("card", "<b>##= data.x ##</b>").expect("compile");
        assert!(a.ptr_eq(&b));
        let looked = engine.lookup("card").expect("lookup");
        assert!(looked.ptr_eq(&engine.lookup("card").expect("lookup")));
        assert!(looked.ptr_eq(&a));

        let c = engine.template("card", "<i></i>").expect("recompile");
        assert!(!c.ptr_eq(&a));
        assert!(engine.lookup("card").expect("lookup").ptr_eq(&c));
    }

    #[test]
    fn test_namespace_and_remap() {
        let engine = Engine::default();
        engine.template("shop-line-item", "<li></li>").expect("compile");
        assert_eq!(
            engine.namespace(),
            vec![("shop.lineItem".to_string(), "shop-line-item".to_string())]
        );
        assert!(engine.resolve("shop.lineItem").is_some());
        engine.remap("shop-line-item", "shop-row").expect("remap");
        assert!(engine.lookup("shop-line-item").is_none());
        assert_eq!(engine.lookup("shop-row").map(|f| f.id().to_string()), Some("shop-row".to_string()));
        assert!(matches!(
            engine.remap("nope", "x"),
            Err(TemplateError::UnknownTemplate(_))
        ));
        assert!(engine.delete("shop-row"));
        assert!(engine.ids().is_empty());
    }

    #[test]
    fn test_add_tmpl_applies_overrides() {
        let engine = Engine::default();
        let shout = TemplateRule::new("shout")
            .pattern("!!(.*?)!!")
            .exec(|_, m| Ok(vec![cotmpl_core::Instr::Text(Rc::from(m.inner().to_uppercase()))]));
        let f = engine.add_tmpl("loud", "<p>!!hey!! ##= data.x ##</p>", &[shout]).expect("compile");
        let c = f.render(serde_json::json!({"x": 1})).expect("render");
        assert_eq!(c.element().map(|e| e.text_content()).as_deref(), Some("HEY 1"));

        let plain = engine.add_tmpl("quiet", "<p>!!hey!!</p>", &[]).expect("compile");
        let c = plain.render(serde_json::json!({"x": 1})).expect("render");
        assert_eq!(c.element().map(|e| e.text_content()).as_deref(), Some("!!hey!!"));
    }

    #[test]
    fn test_add_tmpls_from_container() {
        let engine = Engine::default();
        let container = parse_fragment(concat!(
            r#"<div><script type="text/co-template" id="a"><p>##= data.n ##</p></script>"#,
            r#"<script type="text/javascript" id="js">x()</script>"#,
            r#"<template id="b"><i>##- data.n ##</i></template></div>"#,
        ));
        let ids = engine.add_tmpls(&container, true, &[]).expect("add");
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        let div = container.first_child().expect("div");
        assert_eq!(div.element_children().len(), 1);
        let comp = engine.render("b", serde_json::json!({"n": "<x>"})).expect("render");
        assert_eq!(comp.element().expect("el").inner_html(), "&lt;x&gt;");
    }

    #[test]
    fn test_styles_hoisted_once_per_template() {
        let engine = Engine::default();
        let f = engine
            .template("s", "<style>.s { margin: 0 }</style><div>x</div>")
            .expect("compile");
        f.render(serde_json::json!({"a": 1})).expect("render");
        f.render(serde_json::json!({"a": 2})).expect("render");
        assert_eq!(engine.stylesheet(), ".s { margin: 0 }");
        engine.template("s", "<div></div>").expect("recompile");
        assert_eq!(engine.stylesheet(), "");
    }

    #[test]
    fn test_debug_source_listing() {
        let engine = Engine::new(EngineConfig {
            debug_source: true,
            ..EngineConfig::default()
        });
        engine.template("d", "## if data.x { ##<b></b>## } ##").expect("compile");
        let listing = engine.meta("d").and_then(|m| m.source_listing).expect("listing");
        assert!(listing.contains("if"));
        assert!(Engine::default().meta("d").is_none());
    }

    #[test]
    fn test_unknown_template() {
        let engine = Engine::default();
        assert!(matches!(
            engine.render("missing", Value::Null),
            Err(TemplateError::UnknownTemplate(_))
        ));
    }
}
