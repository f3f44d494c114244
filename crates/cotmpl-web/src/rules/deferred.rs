//! Rules with a deferred phase. Each one leaves a marker at compile time
//! (an attribute value, a placeholder element, or nothing for `###`) and
//! finds its record again once the rendered tree exists.

use super::{CompileContext, LazyContext, Marked, RuleMatch, TemplateRule, literal_name, split_args};
use crate::component::{Component, WeakComponent};
use crate::dom::NodeRef;
use crate::error::TemplateError;
use crate::events::{self, EventSpec, callback_context, lazy_component_element};
use crate::lazy::{LazyRecord, LazySlot};
use crate::markup::parse_fragment;
use cotmpl_core::{EvalError, Expr, Instr, Value, compile_block, compile_expr, link_program};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, error};

const INSERT_TAG: &str = "co-insert";
const INSERT_ATTR: &str = "data-co-insert";

fn attr_pattern(attr: &str) -> String {
    format!(r###"{attr}\s*=\s*"##:((?s:.*?))##""###)
}

/// `attr="<marker>"` around a lazy instruction.
fn in_attribute(attr: &str, lazy: Instr) -> Vec<Instr> {
    vec![
        Instr::Text(Rc::from(format!("{attr}=\""))),
        lazy,
        Instr::Text(Rc::from("\"")),
    ]
}

fn optional_expr(src: Option<&str>) -> Result<Expr, TemplateError> {
    match src.map(str::trim).filter(|s| !s.is_empty()) {
        Some(src) => Ok(compile_expr(src)?),
        None => Ok(Expr::Literal(Value::Null)),
    }
}

fn record_of<'s>(ctx: &'s LazyContext<'_>, m: &Marked) -> Result<&'s LazyRecord, TemplateError> {
    ctx.scope()
        .get_record(ctx.rule(), m.slot, m.record)
        .ok_or_else(|| EvalError::new(format!("no record {}.{}", m.slot, m.record)).into())
}

fn slot_label(ctx: &LazyContext<'_>, slot: usize) -> Option<Rc<str>> {
    ctx.scope()
        .slots(ctx.rule())
        .get(slot)
        .and_then(|s| s.label.clone())
}

// === props ===

pub(super) fn props() -> TemplateRule {
    const ATTR: &str = "data-co-props";
    TemplateRule::new("props")
        .pattern(attr_pattern(ATTR))
        .exec(|ctx: &mut CompileContext<'_>, m: &RuleMatch<'_>| {
            let expr = compile_expr(m.inner().trim())?;
            let lazy = ctx.lazy(LazySlot::default(), vec![expr], false, true)?;
            Ok(in_attribute(ATTR, lazy))
        })
        .lazy_exec(|ctx| {
            for m in ctx.marked(ATTR) {
                let result = record_of(ctx, &m).map(|r| apply_props(&m.node, &r.value(0)));
                ctx.contain(result)?;
            }
            Ok(())
        })
}

/// Apply a property bag to an element. `data-*`, `data.*` and `dataset`
/// entries go to the dataset, `class`/`className` and `textContent` are
/// special, anything else is an attribute (`null`/`false` remove it).
pub fn apply_props(node: &NodeRef, props: &Value) {
    let Some(map) = props.as_object() else {
        return;
    };
    for (key, value) in map.iter() {
        let key = key.as_ref();
        if let Some(rest) = key.strip_prefix("data.") {
            node.set_data(rest, value.display_string());
            continue;
        }
        match key {
            "class" | "className" => node.set_attr("class", value.display_string()),
            "textContent" => node.set_text_content(&value.display_string()),
            "dataset" => {
                if let Some(entries) = value.as_object() {
                    for (k, v) in entries.iter() {
                        node.set_data(k, v.display_string());
                    }
                }
            }
            _ => match value {
                Value::Null | Value::Bool(false) => {
                    node.remove_attr(key);
                }
                Value::Bool(true) => node.set_attr(key, ""),
                other => node.set_attr(key, other.display_string()),
            },
        }
    }
}

// === named element / element ref ===

fn labelled(name: &'static str, attr: &'static str) -> TemplateRule {
    TemplateRule::new(name)
        .pattern(attr_pattern(attr))
        .exec(move |ctx, m| {
            let label = literal_name(m.inner());
            if label.is_empty() {
                return Err(EvalError::new(format!("{attr} needs a name")).into());
            }
            let lazy = ctx.lazy(LazySlot::labelled(label), Vec::new(), false, true)?;
            Ok(in_attribute(attr, lazy))
        })
}

pub(super) fn named_element() -> TemplateRule {
    const ATTR: &str = "data-co-named-element";
    labelled("namedElement", ATTR).lazy_exec(|ctx| {
        for m in ctx.marked(ATTR) {
            if let Some(label) = slot_label(ctx, m.slot) {
                ctx.component().set_named(&label, m.node.clone());
            }
        }
        Ok(())
    })
}

pub(super) fn element_ref() -> TemplateRule {
    const ATTR: &str = "data-co-element-ref";
    labelled("elementRef", ATTR).lazy_exec(|ctx| {
        for m in ctx.marked(ATTR) {
            if let Some(label) = slot_label(ctx, m.slot) {
                ctx.bind_ref(label, m.node.to_value());
            }
        }
        Ok(())
    })
}

// === load ===

pub(super) fn load() -> TemplateRule {
    const ATTR: &str = "data-co-load";
    TemplateRule::new("load")
        .pattern(attr_pattern(ATTR))
        .exec(|ctx, m| {
            let (f, data) = match m.inner().split_once("::") {
                Some((f, data)) => (f, Some(data)),
                None => (m.inner(), None),
            };
            let args = vec![compile_expr(f.trim())?, optional_expr(data)?];
            let lazy = ctx.lazy(LazySlot::default(), args, false, true)?;
            Ok(in_attribute(ATTR, lazy))
        })
        .lazy_exec(|ctx| {
            for m in ctx.marked(ATTR) {
                let result = run_load(ctx, &m);
                ctx.contain(result)?;
            }
            Ok(())
        })
}

fn run_load(ctx: &LazyContext<'_>, m: &Marked) -> Result<(), TemplateError> {
    let record = record_of(ctx, m)?;
    let target = record.value(0);
    let Some(f) = target.as_function() else {
        return Err(EvalError::new(format!("load target is {}, not a function", target.type_name())).into());
    };
    let cb_ctx = callback_context(
        ctx.data(),
        &record.value(1),
        &m.node,
        lazy_component_element(ctx),
        ctx.component().to_value(),
    );
    f.call(&[m.node.to_value(), cb_ctx])?;
    Ok(())
}

// === event ===

pub(super) fn event() -> TemplateRule {
    const ATTR: &str = "data-co-event";
    TemplateRule::new("event")
        .pattern(attr_pattern(ATTR))
        .exec(|ctx, m| {
            let mut args = Vec::new();
            for part in split_args(m.inner(), ":::") {
                let (spec, custom) = match part.split_once("::") {
                    Some((spec, custom)) => (spec, Some(custom)),
                    None => (part, None),
                };
                args.push(compile_expr(spec.trim())?);
                args.push(optional_expr(custom)?);
            }
            let lazy = ctx.lazy(LazySlot::default(), args, false, true)?;
            Ok(in_attribute(ATTR, lazy))
        })
        .lazy_exec(|ctx| {
            let rule = ctx.rule.clone();
            for m in ctx.marked(ATTR) {
                let mut listeners = Vec::new();
                let result = attach_all(ctx, &m, &mut listeners);
                if let Some(record) = ctx.scope_mut().get_record_mut(&rule, m.slot, m.record) {
                    record.listeners.extend(listeners);
                }
                ctx.contain(result)?;
            }
            Ok(())
        })
}

fn attach_all(
    ctx: &LazyContext<'_>,
    m: &Marked,
    listeners: &mut Vec<(NodeRef, crate::dom::ListenerId)>,
) -> Result<(), TemplateError> {
    let values = record_of(ctx, m)?.values.clone();
    for pair in values.chunks(2) {
        let custom = pair.get(1).cloned().unwrap_or(Value::Null);
        if let Some(spec) = EventSpec::from_value(&pair[0])? {
            events::attach(ctx, &m.node, &spec, &custom, listeners)?;
        }
    }
    Ok(())
}

// === deferred code ===

pub(super) fn deferred_code() -> TemplateRule {
    TemplateRule::new("deferred")
        .pattern(r"###((?s:.*?))##")
        .exec(|ctx, m| {
            let stmts = compile_block(m.inner())?;
            let program = link_program(stmts.into_iter().map(Instr::Stmt).collect())?;
            let lazy = ctx.lazy(LazySlot::with_code(program), Vec::new(), true, false)?;
            Ok(vec![lazy])
        })
        .lazy_exec(|ctx| {
            let slots: Vec<_> = ctx
                .scope()
                .slots(ctx.rule())
                .iter()
                .map(|s| (s.code.clone(), s.records.iter().map(|r| r.locals.clone()).collect::<Vec<_>>()))
                .collect();
            for (code, records) in slots {
                let Some(code) = code else {
                    continue;
                };
                for locals in records {
                    let mut env = ctx.env();
                    env.push_frame();
                    for (name, value) in locals {
                        env.define(name, value);
                    }
                    let result = ctx.run_program(&code, &mut env);
                    ctx.contain(result)?;
                }
            }
            Ok(())
        })
}

// === insert ===

#[derive(Debug, Clone, Copy, PartialEq)]
enum InsertTiming {
    Now,
    NextTurn,
    After(Duration),
}

fn insert_timing(flag: &Value, delay_ms: u64) -> InsertTiming {
    match flag {
        Value::Null | Value::Bool(false) => InsertTiming::Now,
        Value::Bool(true) => InsertTiming::NextTurn,
        Value::Str(s) => match s.as_ref() {
            "delay" => InsertTiming::After(Duration::from_millis(delay_ms)),
            "now" | "" => InsertTiming::Now,
            _ => InsertTiming::NextTurn,
        },
        Value::Int(ms) => InsertTiming::After(Duration::from_millis((*ms).max(0) as u64)),
        Value::Float(ms) if ms.is_finite() => InsertTiming::After(Duration::from_millis(ms.max(0.0) as u64)),
        _ => InsertTiming::NextTurn,
    }
}

pub(super) fn insert() -> TemplateRule {
    TemplateRule::new("insert")
        .pattern(r"##%((?s:.*?))##")
        .exec(|ctx, m| {
            let (content, flag) = match m.inner().split_once("::") {
                Some((content, flag)) => (content, Some(flag)),
                None => (m.inner(), None),
            };
            let args = vec![compile_expr(content.trim())?, optional_expr(flag)?];
            let lazy = ctx.lazy(LazySlot::default(), args, false, true)?;
            Ok(vec![
                Instr::Text(Rc::from(format!("<{INSERT_TAG} {INSERT_ATTR}=\""))),
                lazy,
                Instr::Text(Rc::from(format!("\"></{INSERT_TAG}>"))),
            ])
        })
        .lazy_exec(|ctx| {
            let ctx = &*ctx;
            let delay_ms = ctx.engine().config().insert_delay_ms;
            for m in ctx.marked(INSERT_ATTR) {
                let result = record_of(ctx, &m).and_then(|record| {
                    let content = record.value(0);
                    let owner = ctx.component().downgrade();
                    match insert_timing(&record.value(1), delay_ms) {
                        InsertTiming::Now => insert_content(&m.node, &content, &owner),
                        InsertTiming::NextTurn => {
                            schedule_insert(ctx, m.node.clone(), content, owner, Duration::ZERO);
                            Ok(())
                        }
                        InsertTiming::After(delay) => {
                            schedule_insert(ctx, m.node.clone(), content, owner, delay);
                            Ok(())
                        }
                    }
                });
                ctx.contain(result)?;
            }
            Ok(())
        })
}

fn schedule_insert(
    ctx: &LazyContext<'_>,
    placeholder: NodeRef,
    content: Value,
    owner: WeakComponent,
    delay: Duration,
) {
    let template = ctx.template_id().to_string();
    ctx.engine().scheduler().submit_after(delay, move || {
        if let Err(err) = insert_content(&placeholder, &content, &owner) {
            error!(template = %template, error = %err, "deferred insert failed");
        }
    });
}

/// Replace `placeholder` with `content`.
pub(crate) fn insert_content(
    placeholder: &NodeRef,
    content: &Value,
    owner: &WeakComponent,
) -> Result<(), TemplateError> {
    let component = owner.upgrade();
    let parent = placeholder.parent();
    if parent.is_none() && !component.as_ref().is_some_and(|c| c.has_root(placeholder)) {
        debug!("insert placeholder is detached; skipping");
        return Ok(());
    }
    let mut nodes = Vec::new();
    collect_nodes(content, owner, &mut nodes);
    if let Some(parent) = parent {
        for node in &nodes {
            parent.insert_before(node, Some(placeholder))?;
        }
        placeholder.detach();
    }
    if let Some(component) = component {
        component.replace_root(placeholder, &nodes)?;
    }
    Ok(())
}

fn collect_nodes(content: &Value, owner: &WeakComponent, out: &mut Vec<NodeRef>) {
    match content {
        Value::Null => {}
        Value::Str(markup) => out.extend(parse_fragment(markup).children()),
        Value::Array(items) => {
            for item in items.iter() {
                collect_nodes(item, owner, out);
            }
        }
        Value::Host(_) => {
            if let Some(node) = NodeRef::from_value(content) {
                if node.is_fragment() {
                    out.extend(node.children());
                } else {
                    out.push(node);
                }
            } else if let Some(child) = Component::from_value(content) {
                if let Some(owner) = owner.upgrade() {
                    child.set_parent_component(&owner);
                }
                out.extend(child.roots());
            } else {
                out.push(NodeRef::text(content.display_string()));
            }
        }
        other => out.push(NodeRef::text(other.display_string())),
    }
}
