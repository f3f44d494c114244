//! In-memory node tree.
//!
//! Nodes are reference counted; a node owns its children and points back to
//! its parent weakly. Listener closures registered on a node must not hold
//! that node strongly (use [`WeakNode`]) or the node can never be freed.

use crate::error::DomError;
use cotmpl_core::{EvalError, HostObject, Value};
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

pub const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

/// Elements whose text is never normalised away.
const PRESERVE_WHITESPACE: &[&str] = &["pre", "textarea", "script", "style"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Element,
    Text,
    Comment,
    Fragment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerFn = Rc<dyn Fn(&Event, &NodeRef) -> Result<(), EvalError>>;

struct Listener {
    id: ListenerId,
    event_type: String,
    callback: ListenerFn,
}

enum NodeKind {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
    },
    Text(String),
    Comment(String),
    Fragment,
}

struct NodeData {
    kind: NodeKind,
    parent: Weak<RefCell<NodeData>>,
    children: Vec<NodeRef>,
    listeners: Vec<Listener>,
    next_listener: u64,
}

#[derive(Clone)]
pub struct NodeRef(Rc<RefCell<NodeData>>);

#[derive(Clone)]
pub struct WeakNode(Weak<RefCell<NodeData>>);

impl WeakNode {
    pub fn upgrade(&self) -> Option<NodeRef> {
        self.0.upgrade().map(NodeRef)
    }
}

/// A dispatched event. Bubbles from `target` to the root.
#[derive(Clone)]
pub struct Event {
    event_type: String,
    target: NodeRef,
    detail: Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, target: &NodeRef) -> Self {
        Self {
            event_type: event_type.into(),
            target: target.clone(),
            detail: Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn target(&self) -> &NodeRef {
        &self.target
    }

    pub fn detail(&self) -> &Value {
        &self.detail
    }

    /// Event as seen by template callbacks.
    pub fn to_value(&self, current: &NodeRef) -> Value {
        Value::object([
            ("type", Value::string(&self.event_type)),
            ("target", self.target.to_value()),
            ("currentTarget", current.to_value()),
            ("detail", self.detail.clone()),
        ])
    }
}

impl NodeRef {
    fn new(kind: NodeKind) -> Self {
        NodeRef(Rc::new(RefCell::new(NodeData {
            kind,
            parent: Weak::new(),
            children: Vec::new(),
            listeners: Vec::new(),
            next_listener: 0,
        })))
    }

    pub fn element(tag: &str) -> Self {
        Self::new(NodeKind::Element {
            tag: tag.to_ascii_lowercase(),
            attrs: Vec::new(),
        })
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(NodeKind::Text(content.into()))
    }

    pub fn comment(content: impl Into<String>) -> Self {
        Self::new(NodeKind::Comment(content.into()))
    }

    pub fn fragment() -> Self {
        Self::new(NodeKind::Fragment)
    }

    pub fn ptr_eq(&self, other: &NodeRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakNode {
        WeakNode(Rc::downgrade(&self.0))
    }

    pub fn to_value(&self) -> Value {
        Value::host(self.clone())
    }

    pub fn from_value(value: &Value) -> Option<NodeRef> {
        value.downcast_host::<NodeRef>().cloned()
    }

    pub fn node_type(&self) -> NodeType {
        match self.0.borrow().kind {
            NodeKind::Element { .. } => NodeType::Element,
            NodeKind::Text(_) => NodeType::Text,
            NodeKind::Comment(_) => NodeType::Comment,
            NodeKind::Fragment => NodeType::Fragment,
        }
    }

    pub fn is_element(&self) -> bool {
        self.node_type() == NodeType::Element
    }

    pub fn is_comment(&self) -> bool {
        self.node_type() == NodeType::Comment
    }

    pub fn is_fragment(&self) -> bool {
        self.node_type() == NodeType::Fragment
    }

    pub fn tag_name(&self) -> Option<String> {
        match &self.0.borrow().kind {
            NodeKind::Element { tag, .. } => Some(tag.clone()),
            _ => None,
        }
    }

    /// Character data of a text or comment node.
    pub fn node_value(&self) -> Option<String> {
        match &self.0.borrow().kind {
            NodeKind::Text(s) | NodeKind::Comment(s) => Some(s.clone()),
            _ => None,
        }
    }

    // === Tree ===

    pub fn parent(&self) -> Option<NodeRef> {
        self.0.borrow().parent.upgrade().map(NodeRef)
    }

    pub fn children(&self) -> Vec<NodeRef> {
        self.0.borrow().children.clone()
    }

    pub fn child_count(&self) -> usize {
        self.0.borrow().children.len()
    }

    pub fn first_child(&self) -> Option<NodeRef> {
        self.0.borrow().children.first().cloned()
    }

    pub fn element_children(&self) -> Vec<NodeRef> {
        self.children().into_iter().filter(NodeRef::is_element).collect()
    }

    fn can_hold_children(&self) -> bool {
        matches!(
            self.0.borrow().kind,
            NodeKind::Element { .. } | NodeKind::Fragment
        )
    }

    fn is_ancestor_of(&self, node: &NodeRef) -> bool {
        let mut current = Some(node.clone());
        while let Some(n) = current {
            if n.ptr_eq(self) {
                return true;
            }
            current = n.parent();
        }
        false
    }

    /// Detach from the current parent, if any.
    pub fn detach(&self) {
        let Some(parent) = self.parent() else {
            return;
        };
        parent
            .0
            .borrow_mut()
            .children
            .retain(|c| !c.ptr_eq(self));
        self.0.borrow_mut().parent = Weak::new();
    }

    /// Append `child`, moving it from its current parent. Appending a
    /// fragment moves the fragment's children instead.
    pub fn append_child(&self, child: &NodeRef) -> Result<(), DomError> {
        self.insert_before(child, None)
    }

    pub fn insert_before(&self, new: &NodeRef, reference: Option<&NodeRef>) -> Result<(), DomError> {
        if !self.can_hold_children() {
            return Err(DomError::NotAContainer);
        }
        if new.is_ancestor_of(self) {
            return Err(DomError::HierarchyRequest);
        }
        if let Some(r) = reference {
            if r.ptr_eq(new) {
                return Ok(());
            }
            if !r.parent().is_some_and(|p| p.ptr_eq(self)) {
                return Err(DomError::NotFound);
            }
        }
        let moving = if new.is_fragment() {
            let kids = new.children();
            for k in &kids {
                k.0.borrow_mut().parent = Weak::new();
            }
            new.0.borrow_mut().children.clear();
            kids
        } else {
            new.detach();
            vec![new.clone()]
        };
        let mut data = self.0.borrow_mut();
        let mut at = match reference {
            Some(r) => data
                .children
                .iter()
                .position(|c| c.ptr_eq(r))
                .ok_or(DomError::NotFound)?,
            None => data.children.len(),
        };
        for node in moving {
            node.0.borrow_mut().parent = Rc::downgrade(&self.0);
            data.children.insert(at, node);
            at += 1;
        }
        Ok(())
    }

    pub fn replace_child(&self, new: &NodeRef, old: &NodeRef) -> Result<(), DomError> {
        self.insert_before(new, Some(old))?;
        old.detach();
        Ok(())
    }

    pub fn remove_child(&self, child: &NodeRef) -> Result<(), DomError> {
        if !child.parent().is_some_and(|p| p.ptr_eq(self)) {
            return Err(DomError::NotFound);
        }
        child.detach();
        Ok(())
    }

    /// Pre-order descendants, excluding `self`.
    pub fn descendants(&self) -> Vec<NodeRef> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeRef> = self.children().into_iter().rev().collect();
        while let Some(node) = stack.pop() {
            stack.extend(node.children().into_iter().rev());
            out.push(node);
        }
        out
    }

    /// `self` and every descendant element carrying `attr`, in document order.
    pub fn query_attr(&self, attr: &str) -> Vec<NodeRef> {
        std::iter::once(self.clone())
            .chain(self.descendants())
            .filter(|n| n.has_attr(attr))
            .collect()
    }

    // === Attributes ===

    pub fn attr(&self, name: &str) -> Option<String> {
        match &self.0.borrow().kind {
            NodeKind::Element { attrs, .. } => attrs
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone()),
            _ => None,
        }
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    pub fn attributes(&self) -> Vec<(String, String)> {
        match &self.0.borrow().kind {
            NodeKind::Element { attrs, .. } => attrs.clone(),
            _ => Vec::new(),
        }
    }

    /// Silently ignored on non-elements.
    pub fn set_attr(&self, name: &str, value: impl Into<String>) {
        if let NodeKind::Element { attrs, .. } = &mut self.0.borrow_mut().kind {
            let value = value.into();
            match attrs.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
                Some(slot) => slot.1 = value,
                None => attrs.push((name.to_ascii_lowercase(), value)),
            }
        }
    }

    pub fn remove_attr(&self, name: &str) -> Option<String> {
        if let NodeKind::Element { attrs, .. } = &mut self.0.borrow_mut().kind {
            let idx = attrs.iter().position(|(k, _)| k.eq_ignore_ascii_case(name))?;
            return Some(attrs.remove(idx).1);
        }
        None
    }

    /// Dataset entry, `fooBar` <-> `data-foo-bar`.
    pub fn data(&self, key: &str) -> Option<String> {
        self.attr(&dataset_attr(key))
    }

    pub fn set_data(&self, key: &str, value: impl Into<String>) {
        self.set_attr(&dataset_attr(key), value);
    }

    pub fn classes(&self) -> Vec<String> {
        self.attr("class")
            .map(|c| c.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes().iter().any(|c| c == class)
    }

    pub fn add_class(&self, class: &str) {
        let mut classes = self.classes();
        if !classes.iter().any(|c| c == class) {
            classes.push(class.to_string());
            self.set_attr("class", classes.join(" "));
        }
    }

    pub fn remove_class(&self, class: &str) {
        let classes = self.classes();
        if classes.iter().any(|c| c == class) {
            let kept: Vec<String> = classes.into_iter().filter(|c| c != class).collect();
            self.set_attr("class", kept.join(" "));
        }
    }

    // === Content ===

    pub fn text_content(&self) -> String {
        match &self.0.borrow().kind {
            NodeKind::Text(s) => return s.clone(),
            NodeKind::Comment(_) => return String::new(),
            _ => {}
        }
        let mut out = String::new();
        for node in self.descendants() {
            if let NodeKind::Text(s) = &node.0.borrow().kind {
                out.push_str(s);
            }
        }
        out
    }

    pub fn set_text_content(&self, text: &str) {
        let mut guard = self.0.borrow_mut();
        let data = &mut *guard;
        match &mut data.kind {
            NodeKind::Text(s) | NodeKind::Comment(s) => *s = text.to_string(),
            _ => {
                for c in data.children.drain(..) {
                    c.0.borrow_mut().parent = Weak::new();
                }
                if !text.is_empty() {
                    let t = NodeRef::text(text);
                    t.0.borrow_mut().parent = Rc::downgrade(&self.0);
                    data.children.push(t);
                }
            }
        }
    }

    /// Merge adjacent text nodes and drop whitespace-only text and comments,
    /// recursively. Content of `pre`/`textarea`/`script`/`style` is kept.
    pub fn normalize(&self) {
        if self
            .tag_name()
            .is_some_and(|t| PRESERVE_WHITESPACE.contains(&t.as_str()))
        {
            return;
        }
        let children = self.children();
        let mut kept: Vec<NodeRef> = Vec::with_capacity(children.len());
        for child in children {
            match child.node_type() {
                NodeType::Comment => {
                    child.0.borrow_mut().parent = Weak::new();
                }
                NodeType::Text => {
                    let text = child.text_content();
                    if text.trim().is_empty() {
                        child.0.borrow_mut().parent = Weak::new();
                        continue;
                    }
                    let merged = match kept.last() {
                        Some(prev) if prev.node_type() == NodeType::Text => {
                            if let NodeKind::Text(s) = &mut prev.0.borrow_mut().kind {
                                s.push_str(&text);
                            }
                            true
                        }
                        _ => false,
                    };
                    if merged {
                        child.0.borrow_mut().parent = Weak::new();
                    } else {
                        kept.push(child);
                    }
                }
                _ => {
                    child.normalize();
                    kept.push(child);
                }
            }
        }
        self.0.borrow_mut().children = kept;
    }

    // === Serialisation ===

    pub fn outer_html(&self) -> String {
        let mut out = String::new();
        write_node(self, &mut out, false);
        out
    }

    pub fn inner_html(&self) -> String {
        let raw = self
            .tag_name()
            .is_some_and(|t| crate::markup::VERBATIM_ELEMENTS.contains(&t.as_str()));
        let mut out = String::new();
        for c in self.children() {
            write_node(&c, &mut out, raw);
        }
        out
    }

    // === Events ===

    pub fn add_event_listener(
        &self,
        event_type: &str,
        callback: impl Fn(&Event, &NodeRef) -> Result<(), EvalError> + 'static,
    ) -> ListenerId {
        let mut data = self.0.borrow_mut();
        data.next_listener += 1;
        let id = ListenerId(data.next_listener);
        data.listeners.push(Listener {
            id,
            event_type: event_type.to_string(),
            callback: Rc::new(callback),
        });
        id
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        let mut data = self.0.borrow_mut();
        let before = data.listeners.len();
        data.listeners.retain(|l| l.id != id);
        data.listeners.len() != before
    }

    pub fn listener_count(&self, event_type: &str) -> usize {
        self.0
            .borrow()
            .listeners
            .iter()
            .filter(|l| l.event_type == event_type)
            .count()
    }

    pub fn dispatch_event(&self, event_type: &str) -> Result<(), EvalError> {
        self.dispatch(&Event::new(event_type, self))
    }

    /// Run listeners on the target, then on each ancestor. The first failing
    /// listener stops propagation and its error is returned.
    pub fn dispatch(&self, event: &Event) -> Result<(), EvalError> {
        let mut current = Some(self.clone());
        while let Some(node) = current {
            let callbacks: Vec<ListenerFn> = node
                .0
                .borrow()
                .listeners
                .iter()
                .filter(|l| l.event_type == event.event_type)
                .map(|l| l.callback.clone())
                .collect();
            for cb in callbacks {
                cb(event, &node)?;
            }
            current = node.parent();
        }
        Ok(())
    }
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.borrow().kind {
            NodeKind::Element { tag, .. } => write!(f, "<{tag}>"),
            NodeKind::Text(s) => write!(f, "#text {s:?}"),
            NodeKind::Comment(s) => write!(f, "<!--{s}-->"),
            NodeKind::Fragment => write!(f, "#fragment"),
        }
    }
}

impl HostObject for NodeRef {
    fn type_name(&self) -> &'static str {
        "node"
    }

    fn get(&self, key: &str) -> Value {
        match key {
            "tagName" => self.tag_name().map(Value::from).unwrap_or(Value::Null),
            "textContent" => Value::from(self.text_content()),
            "innerHTML" => Value::from(self.inner_html()),
            "outerHTML" => Value::from(self.outer_html()),
            "className" => Value::from(self.attr("class").unwrap_or_default()),
            "parentNode" => self.parent().map(|p| p.to_value()).unwrap_or(Value::Null),
            "children" => Value::array(self.element_children().iter().map(NodeRef::to_value)),
            "childNodes" => Value::array(self.children().iter().map(NodeRef::to_value)),
            "firstChild" => self.first_child().map(|c| c.to_value()).unwrap_or(Value::Null),
            "dataset" => Value::object(self.attributes().into_iter().filter_map(|(k, v)| {
                k.strip_prefix("data-")
                    .map(|rest| (camel_case(rest), Value::from(v)))
            })),
            other => self.attr(other).map(Value::from).unwrap_or(Value::Null),
        }
    }

    fn display_string(&self) -> String {
        self.outer_html()
    }

    fn host_eq(&self, other: &dyn HostObject) -> bool {
        other
            .as_any()
            .downcast_ref::<NodeRef>()
            .is_some_and(|n| n.ptr_eq(self))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn write_node(node: &NodeRef, out: &mut String, raw_text: bool) {
    let data = node.0.borrow();
    match &data.kind {
        NodeKind::Text(s) => {
            if raw_text {
                out.push_str(s);
            } else {
                out.push_str(&escape_text(s));
            }
        }
        NodeKind::Comment(s) => {
            out.push_str("<!--");
            out.push_str(s);
            out.push_str("-->");
        }
        NodeKind::Fragment => {
            for c in &data.children {
                write_node(c, out, raw_text);
            }
        }
        NodeKind::Element { tag, attrs } => {
            out.push('<');
            out.push_str(tag);
            for (k, v) in attrs {
                out.push(' ');
                out.push_str(k);
                out.push_str("=\"");
                out.push_str(&escape_attr(v));
                out.push('"');
            }
            out.push('>');
            if VOID_ELEMENTS.contains(&tag.as_str()) {
                return;
            }
            let raw = crate::markup::VERBATIM_ELEMENTS.contains(&tag.as_str());
            for c in &data.children {
                write_node(c, out, raw);
            }
            out.push_str("</");
            out.push_str(tag);
            out.push('>');
        }
    }
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub(crate) fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// `fooBar` -> `data-foo-bar`; keys already prefixed pass through.
pub fn dataset_attr(key: &str) -> String {
    if key.starts_with("data-") {
        return key.to_ascii_lowercase();
    }
    let mut out = String::from("data-");
    for ch in key.chars() {
        if ch.is_ascii_uppercase() {
            out.push('-');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// `foo-bar` -> `fooBar`.
pub fn camel_case(kebab: &str) -> String {
    let mut out = String::with_capacity(kebab.len());
    let mut upper = false;
    for ch in kebab.chars() {
        if ch == '-' {
            upper = true;
        } else if upper {
            out.push(ch.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn div_with(children: &[&NodeRef]) -> NodeRef {
        let div = NodeRef::element("div");
        for c in children {
            div.append_child(c).expect("append");
        }
        div
    }

    #[test]
    fn test_append_moves_between_parents() {
        let child = NodeRef::text("x");
        let a = div_with(&[&child]);
        let b = NodeRef::element("p");
        b.append_child(&child).expect("append");
        assert_eq!(a.child_count(), 0);
        assert!(child.parent().is_some_and(|p| p.ptr_eq(&b)));
    }

    #[test]
    fn test_fragment_append_moves_children() {
        let frag = NodeRef::fragment();
        frag.append_child(&NodeRef::element("a")).expect("append");
        frag.append_child(&NodeRef::element("b")).expect("append");
        let host = NodeRef::element("div");
        host.append_child(&frag).expect("append");
        assert_eq!(frag.child_count(), 0);
        assert_eq!(host.inner_html(), "<a></a><b></b>");
    }

    #[test]
    fn test_cycle_rejected() {
        let inner = NodeRef::element("span");
        let outer = div_with(&[&inner]);
        assert_eq!(inner.append_child(&outer), Err(DomError::HierarchyRequest));
    }

    #[test]
    fn test_insert_before_and_replace() {
        let b = NodeRef::element("b");
        let host = div_with(&[&b]);
        let a = NodeRef::element("a");
        host.insert_before(&a, Some(&b)).expect("insert");
        let c = NodeRef::element("c");
        host.replace_child(&c, &b).expect("replace");
        assert_eq!(host.inner_html(), "<a></a><c></c>");
        assert!(b.parent().is_none());
    }

    #[test]
    fn test_dataset_and_classes() {
        let el = NodeRef::element("div");
        el.set_data("userId", "7");
        el.add_class("a");
        el.add_class("b");
        el.remove_class("a");
        assert_eq!(el.attr("data-user-id").as_deref(), Some("7"));
        assert_eq!(el.outer_html(), r#"<div data-user-id="7" class="b"></div>"#);
    }

    #[test]
    fn test_normalize_merges_and_strips() {
        let host = div_with(&[
            &NodeRef::text("a"),
            &NodeRef::text("b"),
            &NodeRef::comment("note"),
            &NodeRef::text("  "),
            &NodeRef::element("i"),
        ]);
        host.normalize();
        assert_eq!(host.inner_html(), "ab<i></i>");
    }

    #[test]
    fn test_normalize_drops_blank_text_between_words() {
        let host = div_with(&[
            &NodeRef::text(" "),
            &NodeRef::text("x"),
            &NodeRef::text("\n  "),
            &NodeRef::comment("gap"),
            &NodeRef::text("y"),
            &NodeRef::text(" "),
        ]);
        host.normalize();
        assert_eq!(host.child_count(), 1);
        assert_eq!(host.inner_html(), "xy");
    }

    #[test]
    fn test_dispatch_bubbles_and_listener_removal() {
        let hits = Rc::new(Cell::new(0));
        let inner = NodeRef::element("button");
        let outer = div_with(&[&inner]);
        let h = hits.clone();
        let id = inner.add_event_listener("click", move |_, _| {
            h.set(h.get() + 1);
            Ok(())
        });
        let h = hits.clone();
        outer.add_event_listener("click", move |ev, current| {
            assert!(!ev.target().ptr_eq(current));
            h.set(h.get() + 10);
            Ok(())
        });
        inner.dispatch_event("click").expect("dispatch");
        assert_eq!(hits.get(), 11);
        assert!(inner.remove_event_listener(id));
        inner.dispatch_event("click").expect("dispatch");
        assert_eq!(hits.get(), 21);
    }

    #[test]
    fn test_host_value_identity() {
        let el = NodeRef::element("div");
        assert_eq!(el.to_value(), el.to_value());
        assert_ne!(el.to_value(), NodeRef::element("div").to_value());
        assert_eq!(NodeRef::from_value(&el.to_value()), Some(el));
    }
}
