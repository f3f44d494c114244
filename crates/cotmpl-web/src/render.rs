//! Renderer: runs a compiled template and builds the component scope.

use crate::component::{Component, Hook, HookFn};
use crate::dom::NodeRef;
use crate::engine::Engine;
use crate::error::TemplateError;
use crate::lazy::LazyScope;
use crate::markup::parse_fragment;
use crate::rules::{LazyContext, apply_props};
use crate::template::CompiledTemplate;
use cotmpl_core::{Env, Value};
use std::fmt;
use std::rc::Rc;
use tracing::{debug, error, warn};

/// Callable handle to a registered template.
#[derive(Clone)]
pub struct RenderFn {
    engine: Engine,
    template: Rc<CompiledTemplate>,
}

type Callback = Box<dyn FnOnce(&Component)>;

/// Options for one render call.
pub struct RenderOptions {
    data: Value,
    wrapper: Option<NodeRef>,
    callback: Option<Callback>,
    base: Option<Component>,
    hooks: Vec<(Hook, HookFn)>,
}

impl RenderOptions {
    pub fn new(data: impl Into<Value>) -> Self {
        Self {
            data: data.into(),
            wrapper: None,
            callback: None,
            base: None,
            hooks: Vec::new(),
        }
    }

    /// Container the rendered roots are appended to.
    pub fn wrapper(mut self, wrapper: NodeRef) -> Self {
        self.wrapper = Some(wrapper);
        self
    }

    /// Called with the finished component.
    pub fn callback(mut self, f: impl FnOnce(&Component) + 'static) -> Self {
        self.callback = Some(Box::new(f));
        self
    }

    /// Render into an existing component, keeping its id, status and hooks.
    pub fn base(mut self, component: Component) -> Self {
        self.base = Some(component);
        self
    }

    pub fn hook(mut self, hook: Hook, f: impl Fn(&Component) + 'static) -> Self {
        self.hooks.push((hook, Rc::new(f)));
        self
    }
}

impl RenderFn {
    pub(crate) fn new(engine: Engine, template: Rc<CompiledTemplate>) -> Self {
        Self { engine, template }
    }

    pub fn id(&self) -> &str {
        self.template.id()
    }

    pub fn template(&self) -> &Rc<CompiledTemplate> {
        &self.template
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Same compiled template.
    pub fn ptr_eq(&self, other: &RenderFn) -> bool {
        Rc::ptr_eq(&self.template, &other.template)
    }

    pub fn render(&self, data: impl Into<Value>) -> Result<Component, TemplateError> {
        self.render_with(RenderOptions::new(data))
    }

    /// Positional form: `(data, wrapper, callback, base)`.
    pub fn render_args(
        &self,
        data: impl Into<Value>,
        wrapper: Option<&NodeRef>,
        callback: Option<Callback>,
        base: Option<&Component>,
    ) -> Result<Component, TemplateError> {
        let mut opts = RenderOptions::new(data);
        opts.wrapper = wrapper.cloned();
        opts.callback = callback;
        opts.base = base.cloned();
        self.render_with(opts)
    }

    pub fn render_with(&self, opts: RenderOptions) -> Result<Component, TemplateError> {
        let RenderOptions {
            data,
            wrapper,
            callback,
            base,
            hooks,
        } = opts;
        let id = self.template.id();

        let component = match base {
            Some(base) => {
                base.ensure_live()?;
                base
            }
            None => Component::new(self.engine.next_component_id(), self.clone()),
        };
        component.begin_render(self, data.clone(), wrapper.clone());
        for (hook, f) in hooks {
            component.on_rc(hook, f);
        }

        if !data.is_truthy() {
            let marker = NodeRef::comment(format!("co-empty:{id}"));
            self.place(&component, marker.clone(), vec![marker], wrapper.as_ref(), None)?;
            if let Some(callback) = callback {
                callback(&component);
            }
            return Ok(component);
        }

        let mut scope = self.template.seed();
        let mut env = Env::new().with_status(component.status());
        env.set_global("data", data.clone());
        env.set_global("component", component.to_value());
        env.set_global("i18n", self.engine.i18n(id));
        env.set_global("tmplId", Value::from(id));

        let markup = match self.engine.core().run(self.template.program(), &mut env, &mut scope) {
            Ok(markup) => markup,
            Err(err) => {
                let err = TemplateError::Render {
                    template: id.to_string(),
                    message: err.message,
                };
                let input = serde_json::Value::from(&data);
                if self.engine.config().policy.is_strict() {
                    error!(template = %id, data = %input, error = %err, "template failed to render");
                    return Err(err);
                }
                warn!(template = %id, data = %input, error = %err, "template failed to render; showing error marker");
                let marker = NodeRef::element("co-error");
                marker.set_attr("data-co-template", id);
                marker.set_text_content(&err.to_string());
                self.place(&component, marker.clone(), vec![marker], wrapper.as_ref(), None)?;
                return Ok(component);
            }
        };
        drop(env);

        let fragment = parse_fragment(&markup);
        self.run_deferred(&component, &fragment, &data, &mut scope)?;

        let (element, roots) = resolve_target(&fragment);
        let props = data.get(&self.engine.config().props_key);
        if element.is_element() && props.as_object().is_some() {
            apply_props(&element, &props);
        }
        element.normalize();
        let roots = if element.is_fragment() {
            fragment.children()
        } else {
            roots
        };
        self.place(&component, element, roots, wrapper.as_ref(), Some(scope))?;
        debug!(template = %id, component = component.id(), "rendered");

        if let Some(callback) = callback {
            callback(&component);
        }
        Ok(component)
    }

    fn run_deferred(
        &self,
        component: &Component,
        fragment: &NodeRef,
        data: &Value,
        scope: &mut LazyScope,
    ) -> Result<(), TemplateError> {
        let id = self.template.id();
        let strict = self.engine.config().policy.is_strict();
        let mut refs = Vec::new();
        for rule in self.template.matcher().lazy_rules() {
            if scope.len(&rule.name) == 0 {
                continue;
            }
            let Some(lazy_exec) = rule.lazy_exec.clone() else {
                continue;
            };
            let mut ctx = LazyContext {
                rule: rule.name.clone(),
                template_id: id,
                engine: &self.engine,
                component,
                root: fragment,
                data,
                scope: &mut *scope,
                refs: &mut refs,
            };
            if let Err(err) = lazy_exec(&mut ctx) {
                if strict {
                    error!(template = %id, rule = %rule.name, error = %err, "deferred phase failed");
                    return Err(err);
                }
                warn!(template = %id, rule = %rule.name, error = %err, "deferred phase failed; continuing");
            }
        }
        Ok(())
    }

    /// Record the return target on the component and insert it into the
    /// wrapper, firing the append hooks.
    fn place(
        &self,
        component: &Component,
        element: NodeRef,
        roots: Vec<NodeRef>,
        wrapper: Option<&NodeRef>,
        lazy: Option<LazyScope>,
    ) -> Result<(), TemplateError> {
        let Some(wrapper) = wrapper else {
            component.finish_render(element, roots, lazy);
            return Ok(());
        };
        component.run_hooks(Hook::BeforeAppendTo);
        for root in &roots {
            wrapper.append_child(root)?;
        }
        let element = if element.is_fragment() {
            wrapper.clone()
        } else {
            element
        };
        component.finish_render(element, roots, lazy);
        component.schedule_hooks(Hook::AfterAppendTo);
        Ok(())
    }
}

/// Return target of a rendered fragment: a leading comment, the single
/// element, or the fragment itself. A single target is detached from the
/// fragment.
fn resolve_target(fragment: &NodeRef) -> (NodeRef, Vec<NodeRef>) {
    if let Some(first) = fragment.first_child().filter(NodeRef::is_comment) {
        first.detach();
        return (first.clone(), vec![first]);
    }
    let elements = fragment.element_children();
    if let [only] = elements.as_slice() {
        only.detach();
        return (only.clone(), vec![only.clone()]);
    }
    (fragment.clone(), fragment.children())
}

impl fmt::Debug for RenderFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderFn")
            .field("id", &self.template.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use pretty_assertions::assert_eq;
    use std::cell::{Cell, RefCell};

    fn recorder() -> (Rc<RefCell<Vec<Vec<Value>>>>, Value) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let sink = calls.clone();
        let f = Value::function("record", move |args| {
            sink.borrow_mut().push(args.to_vec());
            Ok(Value::Null)
        });
        (calls, f)
    }

    fn element(c: &Component) -> NodeRef {
        c.element().expect("rendered element")
    }

    #[test]
    fn test_interpolates_into_single_root() {
        let engine = Engine::default();
        let f = engine.template("greet", "<div>##=data.name##</div>").expect("compile");
        let c = f.render(serde_json::json!({"name": "Ann"})).expect("render");
        let root = element(&c);
        assert_eq!(root.tag_name().as_deref(), Some("div"));
        assert_eq!(root.text_content(), "Ann");
        assert!(root.parent().is_none());
        assert_eq!(c.data().get("name"), Value::from("Ann"));
    }

    #[test]
    fn test_escape_produces_text_only() {
        let engine = Engine::default();
        let f = engine.template("esc", "##- data.html ##").expect("compile");
        let c = f.render(serde_json::json!({"html": "<b>x</b>"})).expect("render");
        let root = element(&c);
        assert_eq!(root.inner_html(), "&lt;b&gt;x&lt;/b&gt;");
        assert!(root.descendants().iter().all(|n| !n.is_element()));
    }

    #[test]
    fn test_click_dispatches_handler_once() {
        let engine = Engine::default();
        let f = engine
            .template("btn", r###"<button data-co-event="##:data.fn##">Go</button>"###)
            .expect("compile");
        let (calls, handler) = recorder();
        let c = f.render(Value::object([("fn", handler)])).expect("render");
        let button = element(&c);
        assert!(!button.has_attr("data-co-event"));

        button.dispatch_event("click").expect("dispatch");
        let calls = calls.borrow();
        assert_eq!(calls.len(), 1);
        let ctx = &calls[0][1];
        let clicked = NodeRef::from_value(&ctx.get("element")).expect("element in context");
        assert!(clicked.ptr_eq(&button));
        let component = Component::from_value(&ctx.get("component")).expect("component");
        assert!(component.ptr_eq(&c));
    }

    #[test]
    fn test_insert_waits_for_next_turn() {
        let engine = Engine::default();
        let f = engine
            .template("ins", r#"<div>##% "<span>Hi</span>" :: true ##</div>"#)
            .expect("compile");
        let c = f.render(serde_json::json!({"x": 1})).expect("render");
        let div = element(&c);
        let placeholder = div.first_child().expect("placeholder");
        assert_eq!(placeholder.tag_name().as_deref(), Some("co-insert"));

        engine.flush();
        assert_eq!(div.inner_html(), "<span>Hi</span>");
    }

    #[test]
    fn test_top_level_insert_replaces_return_target() {
        let engine = Engine::default();
        let f = engine
            .template("ins-top", r#"##% "<span>Hi</span>" :: true ##"#)
            .expect("compile");
        let c = f.render(serde_json::json!({"x": 1})).expect("render");
        assert_eq!(element(&c).tag_name().as_deref(), Some("co-insert"));

        engine.flush();
        let target = element(&c);
        assert_eq!(target.outer_html(), "<span>Hi</span>");
        assert_eq!(c.roots().len(), 1);
        assert!(c.roots()[0].ptr_eq(&target));
    }

    #[test]
    fn test_top_level_insert_of_several_nodes() {
        let engine = Engine::default();
        let f = engine
            .template("ins-many", r#"##% "<b>a</b><i>b</i>" :: true ##"#)
            .expect("compile");
        let c = f.render(serde_json::json!({"x": 1})).expect("render");
        engine.flush();
        let target = element(&c);
        assert!(target.is_fragment());
        assert_eq!(target.inner_html(), "<b>a</b><i>b</i>");
        assert_eq!(c.roots().len(), 2);
    }

    #[test]
    fn test_leading_comment_is_return_target() {
        let engine = Engine::default();
        let f = engine
            .template("annotated", "<!--note--><div>##=data.x##</div>")
            .expect("compile");
        let c = f.render(serde_json::json!({"x": 1})).expect("render");
        let target = element(&c);
        assert!(target.is_comment());
        assert_eq!(target.node_value().as_deref(), Some("note"));
        assert!(target.parent().is_none());
        assert_eq!(c.roots().len(), 1);
    }

    #[test]
    fn test_insert_now_and_delayed() {
        let engine = Engine::default();
        let f = engine
            .template("ins2", "<p>##% data.now ##|##% data.later :: 50 ##</p>")
            .expect("compile");
        let c = f
            .render(serde_json::json!({"now": "<b>a</b>", "later": "<i>b</i>"}))
            .expect("render");
        let p = element(&c);
        assert_eq!(p.inner_html(), "<b>a</b>|<co-insert></co-insert>");
        engine.scheduler().run_pending();
        assert_eq!(p.child_count(), 3);
        engine.scheduler().advance(std::time::Duration::from_millis(50));
        assert_eq!(p.inner_html(), "<b>a</b>|<i>b</i>");
    }

    #[test]
    fn test_lazy_records_follow_source_occurrences() {
        let engine = Engine::default();
        let f = engine
            .template(
                "list",
                concat!(
                    r###"<ul data-co-event="##: data.fn ##">"###,
                    "## for item in data.items { ##",
                    r###"<li data-co-event="##: data.fn :: item ##">##= item ##</li>"###,
                    "## } ##</ul>",
                ),
            )
            .expect("compile");
        let (calls, handler) = recorder();
        let data = Value::object([
            ("fn", handler),
            ("items", Value::array(["a", "b", "c"].map(Value::from))),
        ]);
        let c = f.render(data.clone()).expect("render");
        assert_eq!(c.lazy_len("event"), 2);
        assert_eq!(c.lazy_records("event"), vec![1, 3]);
        assert_eq!(c.listener_count(), 4);

        let items = element(&c).element_children();
        items[1].dispatch(&crate::dom::Event::new("click", &items[1])).expect("dispatch");
        // bubbles from the item to the list
        assert_eq!(calls.borrow().len(), 2);
        assert_eq!(calls.borrow()[0][1].get("customData"), Value::from("b"));
        assert_eq!(calls.borrow()[1][1].get("customData"), Value::Null);

        let again = c.render(data).expect("re-render");
        assert_eq!(again.lazy_records("event"), vec![1, 3]);
    }

    #[test]
    fn test_falsy_data_renders_placeholder() {
        let engine = Engine::default();
        let f = engine.template("maybe", "<div>##= data ##</div>").expect("compile");
        let c = f.render(Value::Null).expect("render");
        let marker = element(&c);
        assert!(marker.is_comment());
        assert_eq!(marker.node_value().as_deref(), Some("co-empty:maybe"));
    }

    #[test]
    fn test_render_error_policy() {
        let lenient = Engine::default();
        let f = lenient.template("bad", "<p>##= data.boom() ##</p>").expect("compile");
        let c = f.render(serde_json::json!({"x": 1})).expect("lenient render");
        let marker = element(&c);
        assert_eq!(marker.tag_name().as_deref(), Some("co-error"));
        assert_eq!(marker.attr("data-co-template").as_deref(), Some("bad"));

        let strict = Engine::new(EngineConfig::strict());
        let f = strict.template("bad", "<p>##= data.boom() ##</p>").expect("compile");
        assert!(matches!(
            f.render(serde_json::json!({"x": 1})),
            Err(TemplateError::Render { .. })
        ));
    }

    fn failing_handler() -> Value {
        Value::function("boom", |_| Err(cotmpl_core::EvalError::new("kaboom")))
    }

    fn render_failing_button(engine: &Engine) -> NodeRef {
        let f = engine
            .template("failing", r###"<button data-co-event="##:data.fn##">Go</button>"###)
            .expect("compile");
        let c = f.render(Value::object([("fn", failing_handler())])).expect("render");
        element(&c)
    }

    #[test]
    fn test_lenient_handler_error_keeps_other_listeners_running() {
        let engine = Engine::default();
        let button = render_failing_button(&engine);
        let hits = Rc::new(Cell::new(0));
        let seen = hits.clone();
        button.add_event_listener("click", move |_, _| {
            seen.set(seen.get() + 1);
            Ok(())
        });
        let host = NodeRef::element("div");
        host.append_child(&button).expect("append");
        let bubbled = Rc::new(Cell::new(0));
        let seen = bubbled.clone();
        host.add_event_listener("click", move |_, _| {
            seen.set(seen.get() + 1);
            Ok(())
        });

        button.dispatch_event("click").expect("lenient dispatch");
        assert_eq!(hits.get(), 1);
        assert_eq!(bubbled.get(), 1);
    }

    #[test]
    fn test_trigger_name_without_handlers_declares_entry() {
        let engine = Engine::default();
        let f = engine
            .template("quiet-trigger", r###"<div data-co-event="##:data.spec##"></div>"###)
            .expect("compile");
        let spec = Value::object([("triggerName", Value::from("panel"))]);
        let c = f.render(Value::object([("spec", spec)])).expect("render");
        assert_eq!(c.trigger_names(), vec!["panel".to_string()]);
        let entry = c.to_value().get("trigger").get("panel");
        assert!(entry.as_object().is_some_and(|events| events.is_empty()));
        assert!(c.trigger("panel", "click").is_none());
    }

    #[test]
    fn test_strict_handler_error_fails_dispatch() {
        let engine = Engine::new(EngineConfig::strict());
        let button = render_failing_button(&engine);
        let err = button.dispatch_event("click").expect_err("strict dispatch");
        assert!(err.message.contains("'click' handler failed"));
        assert!(err.message.contains("kaboom"));
    }

    #[test]
    fn test_lazy_failure_is_isolated_when_lenient() {
        let engine = Engine::default();
        let f = engine
            .template(
                "two",
                concat!(
                    r###"<div><a data-co-event="##: data.missing ::: 3 ##"></a>"###,
                    r###"<b data-co-event="##: data.fn ##"></b></div>"###,
                ),
            )
            .expect("compile");
        let (calls, handler) = recorder();
        let c = f.render(Value::object([("fn", handler)])).expect("render");
        let b = element(&c).element_children()[1].clone();
        b.dispatch_event("click").expect("dispatch");
        assert_eq!(calls.borrow().len(), 1);

        let strict = Engine::new(EngineConfig::strict());
        let f = strict
            .template("one", r###"<a data-co-event="##: 3 ##"></a>"###)
            .expect("compile");
        assert!(matches!(
            f.render(serde_json::json!({"x": 1})),
            Err(TemplateError::LazyExec { .. })
        ));
    }

    #[test]
    fn test_wrapper_hooks_timing() {
        let engine = Engine::default();
        let f = engine.template("pair", "<i>a</i><i>b</i>").expect("compile");
        let before = Rc::new(Cell::new(0));
        let after = Rc::new(Cell::new(0));
        let (b, a) = (before.clone(), after.clone());
        let wrapper = NodeRef::element("section");
        let c = f
            .render_with(
                RenderOptions::new(serde_json::json!({"x": 1}))
                    .wrapper(wrapper.clone())
                    .hook(Hook::BeforeAppendTo, move |_| b.set(b.get() + 1))
                    .hook(Hook::AfterAppendTo, move |_| a.set(a.get() + 1)),
            )
            .expect("render");
        assert_eq!((before.get(), after.get()), (1, 0));
        assert_eq!(wrapper.inner_html(), "<i>a</i><i>b</i>");
        assert!(element(&c).ptr_eq(&wrapper));
        assert_eq!(c.roots().len(), 2);

        engine.flush();
        assert_eq!((before.get(), after.get()), (1, 1));
    }

    #[test]
    fn test_callback_sees_finished_component() {
        let engine = Engine::default();
        let f = engine.template("cb", "<em>##= data.v ##</em>").expect("compile");
        let seen = Rc::new(RefCell::new(String::new()));
        let s = seen.clone();
        f.render_args(
            serde_json::json!({"v": "ok"}),
            None,
            Some(Box::new(move |c: &Component| {
                *s.borrow_mut() = c.element().map(|e| e.outer_html()).unwrap_or_default();
            })),
            None,
        )
        .expect("render");
        assert_eq!(*seen.borrow(), "<em>ok</em>");
    }

    #[test]
    fn test_element_refs_and_loop_locals_in_deferred_code() {
        let engine = Engine::default();
        let f = engine
            .template(
                "refs",
                concat!(
                    r###"<div><b data-co-element-ref="##: title ##"></b>"###,
                    "### set_text(title, data.heading) ##",
                    "## for item, i in data.items { ##",
                    "### data.seen(item, i) ##",
                    "## } ##</div>",
                ),
            )
            .expect("compile");
        let (calls, seen) = recorder();
        let data = Value::object([
            ("heading", Value::from("Title")),
            ("seen", seen),
            ("items", Value::array(["x", "y"].map(Value::from))),
        ]);
        let c = f.render(data).expect("render");
        assert_eq!(element(&c).inner_html(), "<b>Title</b>");
        let calls = calls.borrow();
        assert_eq!(
            calls.iter().map(|args| (args[0].clone(), args[1].clone())).collect::<Vec<_>>(),
            vec![
                (Value::from("x"), Value::from(0i64)),
                (Value::from("y"), Value::from(1i64)),
            ]
        );
    }

    #[test]
    fn test_named_elements_load_and_triggers() {
        let engine = Engine::default();
        let f = engine
            .template(
                "form",
                concat!(
                    r###"<form data-co-load="##: data.init :: 'boot' ##">"###,
                    r###"<input data-co-named-element="##: field ##">"###,
                    r###"<button data-co-event="##: {click: data.fn, triggerName: 'send', namedElement: 'submit'} ##"></button>"###,
                    "</form>",
                ),
            )
            .expect("compile");
        let (loads, init) = recorder();
        let (clicks, handler) = recorder();
        let c = f
            .render(Value::object([("init", init), ("fn", handler)]))
            .expect("render");
        let form = element(&c);

        assert_eq!(c.named("field").and_then(|n| n.tag_name()).as_deref(), Some("input"));
        assert_eq!(c.named("submit").and_then(|n| n.tag_name()).as_deref(), Some("button"));

        let loads = loads.borrow();
        assert_eq!(loads.len(), 1);
        assert!(NodeRef::from_value(&loads[0][0]).is_some_and(|n| n.ptr_eq(&form)));
        assert_eq!(loads[0][1].get("customData"), Value::from("boot"));

        c.fire_trigger("send", "click").expect("trigger");
        assert_eq!(clicks.borrow().len(), 1);
        assert!(c.fire_trigger("send", "keyup").is_err());
    }

    #[test]
    fn test_props_applied_to_single_root() {
        let engine = Engine::default();
        let f = engine
            .template("card", r###"<div class="card" data-co-props="##: data.extra ##"></div>"###)
            .expect("compile");
        let c = f
            .render(serde_json::json!({
                "extra": {"title": "T"},
                "_props": {"data.id": 9, "className": "card wide"},
            }))
            .expect("render");
        let div = element(&c);
        assert_eq!(div.attr("title").as_deref(), Some("T"));
        assert_eq!(div.data("id").as_deref(), Some("9"));
        assert_eq!(div.classes(), vec!["card", "wide"]);
    }

    #[test]
    fn test_status_persists_across_renders() {
        let engine = Engine::default();
        let f = engine
            .template("count", "## status.n = (status.n || 0) + 1 ##<p>##= status.n ##</p>")
            .expect("compile");
        let c = f.render(serde_json::json!({"x": 1})).expect("render");
        let id = c.id();
        let c = c.refresh(serde_json::json!({"y": 2})).expect("refresh");
        assert_eq!(c.id(), id);
        assert_eq!(element(&c).text_content(), "2");
        assert_eq!(c.status_value().get("n"), Value::from(2i64));
    }
}
