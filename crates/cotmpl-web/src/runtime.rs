//! Tree operators registered on every engine, so deferred code and event
//! handlers written in the template language can touch nodes.

use crate::component::Component;
use crate::dom::{Event, NodeRef};
use cotmpl_core::{Context, EvalError, EvalResult, Value};

pub fn register_dom_operators(core: &mut cotmpl_core::Engine) {
    core.register("text", op_text);
    core.register("set_text", op_set_text);
    core.register("attr", op_attr);
    core.register("set_attr", op_set_attr);
    core.register("add_class", op_add_class);
    core.register("remove_class", op_remove_class);
    core.register("dispatch", op_dispatch);
    core.register("named", op_named);
}

fn node_arg(args: &[Value], idx: usize, op: &str) -> Result<NodeRef, EvalError> {
    args.get(idx)
        .and_then(NodeRef::from_value)
        .ok_or_else(|| EvalError::new(format!("{op}: argument {} must be a node", idx + 1)))
}

fn str_arg(args: &[Value], idx: usize) -> String {
    args.get(idx).map(Value::display_string).unwrap_or_default()
}

fn op_text(args: &[Value], _ctx: &mut Context) -> EvalResult {
    Ok(Value::from(node_arg(args, 0, "text")?.text_content()))
}

fn op_set_text(args: &[Value], _ctx: &mut Context) -> EvalResult {
    node_arg(args, 0, "set_text")?.set_text_content(&str_arg(args, 1));
    Ok(Value::Null)
}

fn op_attr(args: &[Value], _ctx: &mut Context) -> EvalResult {
    let node = node_arg(args, 0, "attr")?;
    Ok(node
        .attr(&str_arg(args, 1))
        .map(Value::from)
        .unwrap_or(Value::Null))
}

fn op_set_attr(args: &[Value], _ctx: &mut Context) -> EvalResult {
    let node = node_arg(args, 0, "set_attr")?;
    let name = str_arg(args, 1);
    match args.get(2).unwrap_or(&Value::Null) {
        Value::Null | Value::Bool(false) => {
            node.remove_attr(&name);
        }
        Value::Bool(true) => node.set_attr(&name, ""),
        other => node.set_attr(&name, other.display_string()),
    }
    Ok(Value::Null)
}

fn op_add_class(args: &[Value], _ctx: &mut Context) -> EvalResult {
    let node = node_arg(args, 0, "add_class")?;
    for class in str_arg(args, 1).split_whitespace() {
        node.add_class(class);
    }
    Ok(Value::Null)
}

fn op_remove_class(args: &[Value], _ctx: &mut Context) -> EvalResult {
    let node = node_arg(args, 0, "remove_class")?;
    for class in str_arg(args, 1).split_whitespace() {
        node.remove_class(class);
    }
    Ok(Value::Null)
}

/// `dispatch(node, type, detail?)`
fn op_dispatch(args: &[Value], _ctx: &mut Context) -> EvalResult {
    let node = node_arg(args, 0, "dispatch")?;
    let event_type = str_arg(args, 1);
    if event_type.is_empty() {
        return Err(EvalError::new("dispatch: event type is required"));
    }
    let detail = args.get(2).cloned().unwrap_or(Value::Null);
    node.dispatch(&Event::new(event_type, &node).with_detail(detail))?;
    Ok(Value::Null)
}

/// `named(component, key)`
fn op_named(args: &[Value], _ctx: &mut Context) -> EvalResult {
    let component = args
        .first()
        .and_then(Component::from_value)
        .ok_or_else(|| EvalError::new("named: argument 1 must be a component"))?;
    Ok(component
        .named(&str_arg(args, 1))
        .map(|n| n.to_value())
        .unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn core() -> cotmpl_core::Engine {
        let mut core = cotmpl_core::Engine::new();
        register_dom_operators(&mut core);
        core
    }

    #[test]
    fn test_node_operators() {
        let core = core();
        let el = NodeRef::element("p");
        let data = Value::object([("el", el.to_value())]);
        core.eval_str("set_text(data.el, 'hi')", data.clone()).expect("set_text");
        core.eval_str("set_attr(data.el, 'title', 3)", data.clone()).expect("set_attr");
        core.eval_str("add_class(data.el, 'a b')", data.clone()).expect("add_class");
        core.eval_str("remove_class(data.el, 'a')", data.clone()).expect("remove_class");
        assert_eq!(core.eval_str("text(data.el)", data.clone()).expect("text"), Value::from("hi"));
        assert_eq!(core.eval_str("attr(data.el, 'title')", data).expect("attr"), Value::from("3"));
        assert_eq!(el.classes(), vec!["b"]);
    }

    #[test]
    fn test_dispatch_reaches_listener() {
        let core = core();
        let el = NodeRef::element("button");
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        el.add_event_listener("ping", move |ev, _| {
            assert_eq!(ev.detail(), &Value::from(5i64));
            h.set(h.get() + 1);
            Ok(())
        });
        core.eval_str("dispatch(data, 'ping', 5)", el.to_value()).expect("dispatch");
        assert_eq!(hits.get(), 1);
        assert!(core.eval_str("dispatch(1, 'ping')", Value::Null).is_err());
    }
}
