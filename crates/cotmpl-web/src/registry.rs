//! Template cache and the dotted namespace table.
//!
//! Registration is keyed by template id and last-writer-wins. An id with a
//! hyphen (`group-name-x`) is also reachable as `group.nameX`.

use crate::template::CompiledTemplate;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

#[derive(Debug, Clone)]
pub struct TemplateMeta {
    pub compiled: Rc<CompiledTemplate>,
    pub template_text: String,
    /// Instruction listing, kept when `debugSource` is on.
    pub source_listing: Option<String>,
    /// Compiled with the engine's default rule set.
    pub default_rules: bool,
}

#[derive(Debug, Default)]
pub struct Registry {
    templates: HashMap<String, TemplateMeta>,
    // group -> key -> template id
    namespace: BTreeMap<String, BTreeMap<String, String>>,
}

/// `group-name-x` -> (`group`, `nameX`). Ids without a hyphen have no path.
pub fn namespace_path(id: &str) -> Option<(String, String)> {
    let (group, rest) = id.split_once('-')?;
    if group.is_empty() || rest.is_empty() {
        return None;
    }
    let mut key = String::with_capacity(rest.len());
    for (idx, segment) in rest.split('-').filter(|s| !s.is_empty()).enumerate() {
        if idx == 0 {
            key.push_str(segment);
            continue;
        }
        let mut chars = segment.chars();
        if let Some(first) = chars.next() {
            key.extend(first.to_uppercase());
            key.push_str(chars.as_str());
        }
    }
    Some((group.to_string(), key))
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `meta` under `id`, returning the replaced entry.
    pub fn register(&mut self, id: &str, meta: TemplateMeta) -> Option<TemplateMeta> {
        if let Some((group, key)) = namespace_path(id) {
            self.namespace
                .entry(group)
                .or_default()
                .insert(key, id.to_string());
        }
        self.templates.insert(id.to_string(), meta)
    }

    pub fn get(&self, id: &str) -> Option<&TemplateMeta> {
        self.templates.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.templates.contains_key(id)
    }

    /// Look up through the namespace table (`group.key`).
    pub fn resolve(&self, path: &str) -> Option<&TemplateMeta> {
        let (group, key) = path.split_once('.')?;
        let id = self.namespace.get(group)?.get(key)?;
        self.templates.get(id)
    }

    pub fn delete(&mut self, id: &str) -> Option<TemplateMeta> {
        let removed = self.templates.remove(id)?;
        if let Some((group, key)) = namespace_path(id) {
            if let Some(entries) = self.namespace.get_mut(&group) {
                if entries.get(&key).is_some_and(|owner| owner == id) {
                    entries.remove(&key);
                }
                if entries.is_empty() {
                    self.namespace.remove(&group);
                }
            }
        }
        Some(removed)
    }

    /// Move `old` to `new`. The compiled template is re-labelled so
    /// diagnostics name the new id.
    pub fn remap(&mut self, old: &str, new: &str) -> bool {
        let Some(mut meta) = self.delete(old) else {
            return false;
        };
        meta.compiled = Rc::new(meta.compiled.with_id(new));
        self.register(new, meta);
        true
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.templates.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// `(group.key, id)` pairs in path order.
    pub fn namespace_entries(&self) -> Vec<(String, String)> {
        self.namespace
            .iter()
            .flat_map(|(group, entries)| {
                entries
                    .iter()
                    .map(move |(key, id)| (format!("{group}.{key}"), id.clone()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
