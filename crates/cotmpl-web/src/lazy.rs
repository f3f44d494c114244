use crate::dom::{ListenerId, NodeRef};
use cotmpl_core::{EvalError, LazyCapture, LazySink, Program, Value};
use std::rc::Rc;

/// One compile-time occurrence of a deferred rule.
///
/// `label` and `code` are fixed at compile time; `records` is filled while
/// the template runs (once per execution of the occurrence, so an occurrence
/// inside a loop collects one record per iteration).
#[derive(Debug, Clone, Default)]
pub struct LazySlot {
    pub label: Option<Rc<str>>,
    pub code: Option<Rc<Program>>,
    pub records: Vec<LazyRecord>,
}

impl LazySlot {
    pub fn labelled(label: impl Into<Rc<str>>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::default()
        }
    }

    pub fn with_code(code: Program) -> Self {
        Self {
            code: Some(Rc::new(code)),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LazyRecord {
    pub values: Vec<Value>,
    pub locals: Vec<(Rc<str>, Value)>,
    /// Listeners installed for this record, removed on `remove`/re-render.
    pub listeners: Vec<(NodeRef, ListenerId)>,
}

impl LazyRecord {
    pub fn value(&self, idx: usize) -> Value {
        self.values.get(idx).cloned().unwrap_or(Value::Null)
    }
}

/// Per-render bag of deferred-rule slots, keyed by rule name in rule order.
#[derive(Debug, Clone, Default)]
pub struct LazyScope {
    rules: Vec<(Rc<str>, Vec<LazySlot>)>,
}

impl LazyScope {
    pub fn with_rules<'a>(names: impl IntoIterator<Item = &'a Rc<str>>) -> Self {
        Self {
            rules: names.into_iter().map(|n| (n.clone(), Vec::new())).collect(),
        }
    }

    pub fn rule_names(&self) -> Vec<Rc<str>> {
        self.rules.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn slots(&self, rule: &str) -> &[LazySlot] {
        self.rules
            .iter()
            .find(|(n, _)| n.as_ref() == rule)
            .map(|(_, s)| s.as_slice())
            .unwrap_or(&[])
    }

    pub fn slots_mut(&mut self, rule: &str) -> Option<&mut Vec<LazySlot>> {
        self.rules
            .iter_mut()
            .find(|(n, _)| n.as_ref() == rule)
            .map(|(_, s)| s)
    }

    /// Number of compile-time occurrences of `rule`.
    pub fn len(&self, rule: &str) -> usize {
        self.slots(rule).len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.iter().all(|(_, s)| s.is_empty())
    }

    pub fn get_record(&self, rule: &str, slot: usize, record: usize) -> Option<&LazyRecord> {
        self.slots(rule).get(slot)?.records.get(record)
    }

    pub fn get_record_mut(&mut self, rule: &str, slot: usize, record: usize) -> Option<&mut LazyRecord> {
        self.slots_mut(rule)?.get_mut(slot)?.records.get_mut(record)
    }

    /// Reserve the next slot for `rule`, returning its index. Rules without
    /// a deferred phase have no entry and get `None`.
    pub fn push_slot(&mut self, rule: &str, slot: LazySlot) -> Option<usize> {
        let slots = self.slots_mut(rule)?;
        slots.push(slot);
        Some(slots.len() - 1)
    }

    /// Remove every listener recorded by any rule.
    pub fn detach_listeners(&mut self) -> usize {
        let mut removed = 0;
        for (_, slots) in &mut self.rules {
            for slot in slots.iter_mut() {
                for record in &mut slot.records {
                    for (node, id) in record.listeners.drain(..) {
                        if node.remove_event_listener(id) {
                            removed += 1;
                        }
                    }
                }
            }
        }
        removed
    }
}

impl LazySink for LazyScope {
    fn record(&mut self, rule: &str, slot: usize, capture: LazyCapture) -> Result<usize, EvalError> {
        let slots = self
            .slots_mut(rule)
            .ok_or_else(|| EvalError::new(format!("rule '{rule}' has no deferred phase")))?;
        let target = slots
            .get_mut(slot)
            .ok_or_else(|| EvalError::new(format!("rule '{rule}' has no slot {slot}")))?;
        target.records.push(LazyRecord {
            values: capture.values,
            locals: capture.locals,
            listeners: Vec::new(),
        });
        Ok(target.records.len() - 1)
    }
}

/// Split a `slot.record` marker written by the program.
pub fn parse_marker(marker: &str) -> Option<(usize, usize)> {
    let (slot, record) = marker.trim().split_once('.')?;
    Some((slot.parse().ok()?, record.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_clones_are_independent() {
        let name: Rc<str> = Rc::from("event");
        let mut seed = LazyScope::with_rules([&name]);
        seed.push_slot("event", LazySlot::default());
        let mut a = seed.clone();
        LazySink::record(&mut a, "event", 0, LazyCapture::default()).expect("record");
        assert_eq!(a.slots("event")[0].records.len(), 1);
        assert_eq!(seed.slots("event")[0].records.len(), 0);
    }

    #[test]
    fn test_unknown_rule_has_no_slot() {
        let mut scope = LazyScope::default();
        assert_eq!(scope.push_slot("missing", LazySlot::default()), None);
        assert!(LazySink::record(&mut scope, "missing", 0, LazyCapture::default()).is_err());
    }

    #[test]
    fn test_parse_marker() {
        assert_eq!(parse_marker("3.12"), Some((3, 12)));
        assert_eq!(parse_marker("x"), None);
    }
}
