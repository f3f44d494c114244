//! Component scope: the live object a render returns.
//!
//! A component owns the rendered roots, the per-instance `status` map, the
//! named-element and trigger tables and the listeners installed by the
//! deferred phase. Re-rendering reuses the same object, so its id, status
//! and hooks persist. `release` is terminal.

use crate::dom::NodeRef;
use crate::error::{DomError, TemplateError};
use crate::lazy::LazyScope;
use crate::render::{RenderFn, RenderOptions};
use cotmpl_core::{Function, HostObject, ObjectMap, SharedMap, Value};
use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    BeforeAppendTo,
    /// Runs on the scheduler turn after insertion.
    AfterAppendTo,
    BeforeRemove,
    /// Runs on the scheduler turn after removal.
    AfterRemove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Constructed,
    Rendered,
    Removed,
    Released,
}

pub(crate) type HookFn = Rc<dyn Fn(&Component)>;

pub(crate) struct ComponentScope {
    id: u64,
    tmpl_id: Option<Rc<str>>,
    element: Option<NodeRef>,
    roots: Vec<NodeRef>,
    data: Option<Value>,
    status: SharedMap,
    wrapper: Option<NodeRef>,
    parent_component: Option<WeakComponent>,
    trigger: BTreeMap<String, BTreeMap<String, Function>>,
    named: BTreeMap<String, NodeRef>,
    hooks: Vec<(Hook, HookFn)>,
    lazy: Option<LazyScope>,
    spacer: Option<NodeRef>,
    state: Lifecycle,
    render_fn: RenderFn,
}

#[derive(Clone)]
pub struct Component(Rc<RefCell<ComponentScope>>);

#[derive(Clone, Default)]
pub struct WeakComponent(Weak<RefCell<ComponentScope>>);

impl WeakComponent {
    pub fn upgrade(&self) -> Option<Component> {
        self.0.upgrade().map(Component)
    }
}

impl Component {
    pub(crate) fn new(id: u64, render_fn: RenderFn) -> Self {
        Component(Rc::new(RefCell::new(ComponentScope {
            id,
            tmpl_id: Some(Rc::from(render_fn.id())),
            element: None,
            roots: Vec::new(),
            data: None,
            status: Rc::new(RefCell::new(ObjectMap::new())),
            wrapper: None,
            parent_component: None,
            trigger: BTreeMap::new(),
            named: BTreeMap::new(),
            hooks: Vec::new(),
            lazy: None,
            spacer: None,
            state: Lifecycle::Constructed,
            render_fn,
        })))
    }

    pub fn id(&self) -> u64 {
        self.0.borrow().id
    }

    pub fn tmpl_id(&self) -> Option<String> {
        self.0.borrow().tmpl_id.as_deref().map(str::to_string)
    }

    /// The resolved return target: a single root element, the empty-data
    /// comment, the wrapper for multi-root renders into a container, or the
    /// fragment otherwise.
    pub fn element(&self) -> Option<NodeRef> {
        self.0.borrow().element.clone()
    }

    /// Top-level nodes produced by the last render.
    pub fn roots(&self) -> Vec<NodeRef> {
        self.0.borrow().roots.clone()
    }

    pub fn data(&self) -> Value {
        self.0.borrow().data.clone().unwrap_or(Value::Null)
    }

    pub fn status(&self) -> SharedMap {
        self.0.borrow().status.clone()
    }

    /// Snapshot of `status` as a value.
    pub fn status_value(&self) -> Value {
        Value::Object(Rc::new(self.0.borrow().status.borrow().clone()))
    }

    pub fn wrapper(&self) -> Option<NodeRef> {
        self.0.borrow().wrapper.clone()
    }

    pub fn spacer(&self) -> Option<NodeRef> {
        self.0.borrow().spacer.clone()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.0.borrow().state
    }

    pub fn is_released(&self) -> bool {
        self.lifecycle() == Lifecycle::Released
    }

    pub fn render_fn(&self) -> RenderFn {
        self.0.borrow().render_fn.clone()
    }

    pub fn parent_component(&self) -> Option<Component> {
        self.0
            .borrow()
            .parent_component
            .as_ref()
            .and_then(WeakComponent::upgrade)
    }

    pub fn set_parent_component(&self, parent: &Component) {
        self.0.borrow_mut().parent_component = Some(parent.downgrade());
    }

    pub fn named(&self, key: &str) -> Option<NodeRef> {
        self.0.borrow().named.get(key).cloned()
    }

    pub fn named_keys(&self) -> Vec<String> {
        self.0.borrow().named.keys().cloned().collect()
    }

    pub fn set_named(&self, key: &str, node: NodeRef) {
        self.0.borrow_mut().named.insert(key.to_string(), node);
    }

    pub fn trigger(&self, name: &str, event_type: &str) -> Option<Function> {
        self.0.borrow().trigger.get(name)?.get(event_type).cloned()
    }

    pub fn trigger_names(&self) -> Vec<String> {
        self.0.borrow().trigger.keys().cloned().collect()
    }

    /// Make sure `trigger[name]` exists, even with no events under it.
    pub fn declare_trigger(&self, name: &str) {
        self.0.borrow_mut().trigger.entry(name.to_string()).or_default();
    }

    pub fn set_trigger(&self, name: &str, event_type: &str, f: Function) {
        self.0
            .borrow_mut()
            .trigger
            .entry(name.to_string())
            .or_default()
            .insert(event_type.to_string(), f);
    }

    /// Call `trigger[name][event_type]`, dispatching that event on its node.
    pub fn fire_trigger(&self, name: &str, event_type: &str) -> Result<(), TemplateError> {
        let f = self
            .trigger(name, event_type)
            .ok_or_else(|| cotmpl_core::EvalError::new(format!("no trigger {name}.{event_type}")))?;
        f.call(&[])?;
        Ok(())
    }

    /// Listeners currently recorded by the deferred phase.
    pub fn listener_count(&self) -> usize {
        let inner = self.0.borrow();
        let Some(scope) = &inner.lazy else {
            return 0;
        };
        scope
            .rule_names()
            .iter()
            .flat_map(|rule| scope.slots(rule).iter())
            .flat_map(|slot| slot.records.iter())
            .map(|record| record.listeners.len())
            .sum()
    }

    /// Compile-time occurrences of `rule` in the last render's LazyScope.
    pub fn lazy_len(&self, rule: &str) -> usize {
        self.0.borrow().lazy.as_ref().map(|s| s.len(rule)).unwrap_or(0)
    }

    /// Records filled for `rule` during the last render, per slot.
    pub fn lazy_records(&self, rule: &str) -> Vec<usize> {
        self.0
            .borrow()
            .lazy
            .as_ref()
            .map(|s| s.slots(rule).iter().map(|slot| slot.records.len()).collect())
            .unwrap_or_default()
    }

    /// Register a lifecycle hook. Hooks survive `render`/`refresh`.
    pub fn on(&self, hook: Hook, f: impl Fn(&Component) + 'static) {
        self.on_rc(hook, Rc::new(f));
    }

    pub(crate) fn on_rc(&self, hook: Hook, f: HookFn) {
        self.0.borrow_mut().hooks.push((hook, f));
    }

    /// Element the component's listeners report as `componentElement`.
    pub fn component_element(&self) -> Option<NodeRef> {
        let inner = self.0.borrow();
        match &inner.element {
            Some(el) if el.is_element() => Some(el.clone()),
            _ => inner.roots.first().and_then(NodeRef::parent),
        }
    }

    pub fn downgrade(&self) -> WeakComponent {
        WeakComponent(Rc::downgrade(&self.0))
    }

    pub fn ptr_eq(&self, other: &Component) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn to_value(&self) -> Value {
        Value::host(self.clone())
    }

    pub fn from_value(value: &Value) -> Option<Component> {
        value.downcast_host::<Component>().cloned()
    }

    pub(crate) fn ensure_live(&self) -> Result<(), TemplateError> {
        if self.is_released() {
            return Err(TemplateError::Released(self.id()));
        }
        Ok(())
    }

    // === Render support ===

    /// Reset per-render state before `render_fn` renders into this object.
    pub(crate) fn begin_render(&self, render_fn: &RenderFn, data: Value, wrapper: Option<NodeRef>) {
        self.detach_listeners();
        let mut inner = self.0.borrow_mut();
        inner.tmpl_id = Some(Rc::from(render_fn.id()));
        inner.render_fn = render_fn.clone();
        inner.data = Some(data);
        inner.wrapper = wrapper;
        inner.element = None;
        inner.roots.clear();
        inner.named.clear();
        inner.trigger.clear();
        inner.lazy = None;
        inner.spacer = None;
    }

    pub(crate) fn finish_render(&self, element: NodeRef, roots: Vec<NodeRef>, lazy: Option<LazyScope>) {
        let mut inner = self.0.borrow_mut();
        inner.element = Some(element);
        inner.roots = roots;
        inner.lazy = lazy;
        inner.state = Lifecycle::Rendered;
    }

    pub(crate) fn has_root(&self, node: &NodeRef) -> bool {
        self.0.borrow().roots.iter().any(|root| root.ptr_eq(node))
    }

    /// Put `new` where `old` sits among the roots. When `old` was the return
    /// target, the target becomes the single replacement, the parent they
    /// already sit in, or a fresh fragment holding them.
    pub(crate) fn replace_root(&self, old: &NodeRef, new: &[NodeRef]) -> Result<(), DomError> {
        let mut inner = self.0.borrow_mut();
        let Some(pos) = inner.roots.iter().position(|root| root.ptr_eq(old)) else {
            return Ok(());
        };
        inner.roots.splice(pos..=pos, new.iter().cloned());
        if !inner.element.as_ref().is_some_and(|el| el.ptr_eq(old)) {
            return Ok(());
        }
        let target = match (new, new.first().and_then(NodeRef::parent)) {
            ([only], _) => only.clone(),
            (_, Some(parent)) => parent,
            (_, None) => {
                let fragment = NodeRef::fragment();
                for node in new {
                    fragment.append_child(node)?;
                }
                fragment
            }
        };
        inner.element = Some(target);
        Ok(())
    }

    pub(crate) fn run_hooks(&self, hook: Hook) {
        let hooks: Vec<HookFn> = self
            .0
            .borrow()
            .hooks
            .iter()
            .filter(|(h, _)| *h == hook)
            .map(|(_, f)| f.clone())
            .collect();
        for f in hooks {
            f(self);
        }
    }

    /// Queue `hook` for the next scheduler turn. It fires even if the
    /// component is removed or released in the meantime.
    pub(crate) fn schedule_hooks(&self, hook: Hook) {
        if !self.0.borrow().hooks.iter().any(|(h, _)| *h == hook) {
            return;
        }
        let me = self.clone();
        self.render_fn()
            .engine()
            .scheduler()
            .submit(move || me.run_hooks(hook));
    }

    fn detach_listeners(&self) -> usize {
        // take the scope out so listener removal runs without a borrow
        let taken = self.0.borrow_mut().lazy.take();
        let Some(mut scope) = taken else {
            return 0;
        };
        let removed = scope.detach_listeners();
        self.0.borrow_mut().lazy = Some(scope);
        removed
    }

    // === Lifecycle ===

    /// Re-render with new data. Into the container if the last render had
    /// one; in place if the roots sit in a tree; detached otherwise. The same
    /// component object is returned in every case.
    pub fn render(&self, data: impl Into<Value>) -> Result<Component, TemplateError> {
        self.ensure_live()?;
        let data = data.into();
        let render_fn = self.render_fn();
        let old_roots = self.roots();
        let old_element = self.element();

        if let Some(wrapper) = self.wrapper() {
            self.detach_listeners();
            for root in &old_roots {
                root.detach();
            }
            return render_fn.render_with(RenderOptions::new(data).wrapper(wrapper).base(self.clone()));
        }

        let in_tree_parent = old_roots.first().and_then(NodeRef::parent).filter(|parent| {
            !old_element
                .as_ref()
                .is_some_and(|el| el.is_fragment() && el.ptr_eq(parent))
        });
        let rendered = render_fn.render_with(RenderOptions::new(data).base(self.clone()))?;
        if let Some(parent) = in_tree_parent {
            let anchor = old_roots.first();
            for root in rendered.roots() {
                parent.insert_before(&root, anchor)?;
            }
            for root in &old_roots {
                root.detach();
            }
        }
        Ok(rendered)
    }

    /// Merge `partial` over the current data and re-render.
    pub fn refresh(&self, partial: impl Into<Value>) -> Result<Component, TemplateError> {
        self.ensure_live()?;
        let merged = self.data().merged(&partial.into());
        self.render(merged)
    }

    /// Drop every per-render reference. `id`, `status` and hooks survive;
    /// every later lifecycle call fails with `Released`.
    pub fn release(&self) {
        self.detach_listeners();
        let mut inner = self.0.borrow_mut();
        inner.tmpl_id = None;
        inner.element = None;
        inner.roots.clear();
        inner.data = None;
        inner.wrapper = None;
        inner.parent_component = None;
        inner.trigger.clear();
        inner.named.clear();
        inner.lazy = None;
        inner.spacer = None;
        inner.state = Lifecycle::Released;
        debug!(component = inner.id, "released");
    }

    /// Detach from the tree. With `use_spacer`, a comment keeps the position.
    /// Returns the single root, or a fragment holding every root.
    pub fn remove(&self, use_spacer: bool) -> Result<NodeRef, TemplateError> {
        self.ensure_live()?;
        self.run_hooks(Hook::BeforeRemove);
        self.detach_listeners();
        let roots = self.roots();
        if use_spacer {
            if let Some(first) = roots.first() {
                if let Some(parent) = first.parent() {
                    let spacer = NodeRef::comment(format!("co-spacer:{}", self.id()));
                    parent.insert_before(&spacer, Some(first))?;
                    self.0.borrow_mut().spacer = Some(spacer);
                }
            }
        }
        for root in &roots {
            root.detach();
        }
        {
            let mut inner = self.0.borrow_mut();
            inner.wrapper = None;
            inner.state = Lifecycle::Removed;
        }
        self.schedule_hooks(Hook::AfterRemove);

        match roots.as_slice() {
            [single] => Ok(single.clone()),
            _ => {
                let fragment = NodeRef::fragment();
                for root in &roots {
                    fragment.append_child(root)?;
                }
                Ok(fragment)
            }
        }
    }

    pub fn append_to(&self, parent: &NodeRef) -> Result<(), TemplateError> {
        self.ensure_live()?;
        self.run_hooks(Hook::BeforeAppendTo);
        for root in self.roots() {
            parent.append_child(&root)?;
        }
        {
            let mut inner = self.0.borrow_mut();
            inner.wrapper = Some(parent.clone());
            inner.state = Lifecycle::Rendered;
        }
        self.schedule_hooks(Hook::AfterAppendTo);
        Ok(())
    }

    /// Put this component where `target` is; `target` is detached.
    pub fn replace_node(&self, target: &NodeRef) -> Result<(), TemplateError> {
        self.ensure_live()?;
        let parent = target.parent().ok_or(crate::error::DomError::NotFound)?;
        for root in self.roots() {
            parent.insert_before(&root, Some(target))?;
        }
        target.detach();
        self.mark_attached_under(&parent);
        Ok(())
    }

    /// Put this component where `other`'s roots are; `other` is detached.
    pub fn replace(&self, other: &Component) -> Result<(), TemplateError> {
        self.ensure_live()?;
        let other_roots = other.roots();
        let Some(parent) = other_roots.first().and_then(NodeRef::parent) else {
            return Err(TemplateError::Detached(other.id()));
        };
        let anchor = other_roots.first();
        for root in self.roots() {
            parent.insert_before(&root, anchor)?;
        }
        for root in &other_roots {
            root.detach();
        }
        other.0.borrow_mut().state = Lifecycle::Removed;
        self.mark_attached_under(&parent);
        Ok(())
    }

    fn mark_attached_under(&self, parent: &NodeRef) {
        let mut inner = self.0.borrow_mut();
        inner.state = Lifecycle::Rendered;
        if inner.spacer.as_ref().is_some_and(|s| s.parent().is_none()) {
            inner.spacer = None;
        }
        if inner.wrapper.is_some() {
            inner.wrapper = Some(parent.clone());
        }
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(inner) => f
                .debug_struct("Component")
                .field("id", &inner.id)
                .field("tmpl_id", &inner.tmpl_id)
                .field("state", &inner.state)
                .finish(),
            Err(_) => f.write_str("Component(<busy>)"),
        }
    }
}

impl HostObject for Component {
    fn type_name(&self) -> &'static str {
        "component"
    }

    fn get(&self, key: &str) -> Value {
        let Ok(inner) = self.0.try_borrow() else {
            return Value::Null;
        };
        match key {
            "id" | "_id" => Value::Int(inner.id as i64),
            "tmplId" => inner.tmpl_id.as_deref().map(Value::from).unwrap_or(Value::Null),
            "data" => inner.data.clone().unwrap_or(Value::Null),
            "status" => Value::Object(Rc::new(inner.status.borrow().clone())),
            "element" => inner.element.as_ref().map(NodeRef::to_value).unwrap_or(Value::Null),
            "trigger" => Value::object(inner.trigger.iter().map(|(name, events)| {
                (
                    name.as_str(),
                    Value::object(events.iter().map(|(ev, f)| (ev.as_str(), Value::Func(f.clone())))),
                )
            })),
            other => inner
                .named
                .get(other)
                .map(NodeRef::to_value)
                .unwrap_or(Value::Null),
        }
    }

    fn display_string(&self) -> String {
        format!("[component {}]", self.id())
    }

    fn host_eq(&self, other: &dyn HostObject) -> bool {
        other
            .as_any()
            .downcast_ref::<Component>()
            .is_some_and(|c| c.ptr_eq(self))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
