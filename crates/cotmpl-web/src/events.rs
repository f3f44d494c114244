//! Event attacher for `data-co-event`.
//!
//! A spec is either one callable (bound to `click`) or a mapping from event
//! type to callable with the reserved keys `load`, `namedElement` and
//! `triggerName`. The shape is resolved once when the deferred phase reads
//! the record, never at dispatch time.

use crate::component::Component;
use crate::dom::{ListenerId, NodeRef};
use crate::error::{ErrorPolicy, TemplateError};
use crate::rules::LazyContext;
use cotmpl_core::{EvalError, Function, Value};
use std::rc::Rc;
use tracing::{debug, error};

const DEFAULT_EVENT: &str = "click";

#[derive(Debug, Clone)]
pub enum EventSpec {
    Single(Function),
    Mapped(MappedEvents),
}

#[derive(Debug, Clone, Default)]
pub struct MappedEvents {
    pub handlers: Vec<(String, Function)>,
    pub load: Option<Function>,
    pub named_element: Option<String>,
    pub trigger_name: Option<String>,
}

impl EventSpec {
    /// `Ok(None)` for `null`: a spec expression may legitimately be empty.
    pub fn from_value(value: &Value) -> Result<Option<EventSpec>, TemplateError> {
        match value {
            Value::Null => Ok(None),
            Value::Func(f) => Ok(Some(EventSpec::Single(f.clone()))),
            Value::Object(map) => {
                let mut mapped = MappedEvents::default();
                for (key, entry) in map.iter() {
                    match key.as_ref() {
                        "load" => mapped.load = Some(expect_function(key, entry)?),
                        "namedElement" => mapped.named_element = Some(entry.display_string()),
                        "triggerName" => mapped.trigger_name = Some(entry.display_string()),
                        event => mapped
                            .handlers
                            .push((event.to_string(), expect_function(key, entry)?)),
                    }
                }
                Ok(Some(EventSpec::Mapped(mapped)))
            }
            other => Err(EvalError::new(format!(
                "event spec must be a function or an object, got {}",
                other.type_name()
            ))
            .into()),
        }
    }
}

fn expect_function(key: &str, value: &Value) -> Result<Function, TemplateError> {
    value.as_function().cloned().ok_or_else(|| {
        EvalError::new(format!("event spec '{key}' is {}, not a function", value.type_name())).into()
    })
}

/// Second argument handed to listeners and `load` callbacks.
pub fn callback_context(
    data: &Value,
    custom: &Value,
    element: &NodeRef,
    component_element: Value,
    component: Value,
) -> Value {
    Value::object([
        ("data", data.clone()),
        ("customData", custom.clone()),
        ("element", element.to_value()),
        ("componentElement", component_element),
        ("component", component),
    ])
}

/// Wire `spec` onto `node`. Listener ids are appended to `listeners` so the
/// component can detach them later.
pub fn attach(
    ctx: &LazyContext<'_>,
    node: &NodeRef,
    spec: &EventSpec,
    custom: &Value,
    listeners: &mut Vec<(NodeRef, ListenerId)>,
) -> Result<(), TemplateError> {
    let policy = ctx.policy();
    let template: Rc<str> = Rc::from(ctx.template_id());
    match spec {
        EventSpec::Single(f) => {
            let id = listen(ctx, node, DEFAULT_EVENT, f, custom, policy, &template);
            listeners.push((node.clone(), id));
        }
        EventSpec::Mapped(mapped) => {
            if let Some(name) = &mapped.named_element {
                ctx.component().set_named(name, node.clone());
            }
            if let Some(trigger) = &mapped.trigger_name {
                ctx.component().declare_trigger(trigger);
            }
            for (event_type, f) in &mapped.handlers {
                let id = listen(ctx, node, event_type, f, custom, policy, &template);
                listeners.push((node.clone(), id));
                if let Some(trigger) = &mapped.trigger_name {
                    ctx.component()
                        .set_trigger(trigger, event_type, trigger_fn(node, event_type));
                }
            }
            if let Some(load) = &mapped.load {
                let cb_ctx = callback_context(
                    ctx.data(),
                    custom,
                    node,
                    lazy_component_element(ctx),
                    ctx.component().to_value(),
                );
                load.call(&[node.to_value(), cb_ctx])?;
            }
        }
    }
    Ok(())
}

/// Component element as seen during the deferred phase, before the return
/// target is resolved: the single root element, else the fragment.
pub(crate) fn lazy_component_element(ctx: &LazyContext<'_>) -> Value {
    let elements = ctx.root().element_children();
    match elements.as_slice() {
        [only] => only.to_value(),
        _ => ctx.root().to_value(),
    }
}

fn listen(
    ctx: &LazyContext<'_>,
    node: &NodeRef,
    event_type: &str,
    f: &Function,
    custom: &Value,
    policy: ErrorPolicy,
    template: &Rc<str>,
) -> ListenerId {
    let weak_node = node.downgrade();
    let weak_component = ctx.component().downgrade();
    let data = ctx.data().clone();
    let custom = custom.clone();
    let f = f.clone();
    let template = template.clone();
    let event_name = event_type.to_string();
    node.add_event_listener(event_type, move |event, _current| {
        let Some(element) = weak_node.upgrade() else {
            return Ok(());
        };
        let component = weak_component.upgrade();
        let cb_ctx = callback_context(
            &data,
            &custom,
            &element,
            component
                .as_ref()
                .and_then(Component::component_element)
                .map(|n| n.to_value())
                .unwrap_or(Value::Null),
            component.as_ref().map(Component::to_value).unwrap_or(Value::Null),
        );
        match f.call(&[event.to_value(&element), cb_ctx]) {
            Ok(_) => Ok(()),
            Err(e) => contain_handler_error(policy, &template, &event_name, e),
        }
    })
}

fn contain_handler_error(
    policy: ErrorPolicy,
    template: &str,
    event: &str,
    err: EvalError,
) -> Result<(), EvalError> {
    let err = TemplateError::EventHandler {
        event: event.to_string(),
        message: err.message,
    };
    error!(template = %template, event = %event, error = %err, "event handler failed");
    if policy.is_strict() {
        Err(err.into())
    } else {
        Ok(())
    }
}

fn trigger_fn(node: &NodeRef, event_type: &str) -> Function {
    let weak = node.downgrade();
    let event_type = event_type.to_string();
    Function::new(format!("trigger:{event_type}"), move |_args| {
        match weak.upgrade() {
            Some(node) => node.dispatch_event(&event_type)?,
            None => debug!(event = %event_type, "trigger target is gone"),
        }
        Ok(Value::Null)
    })
}

