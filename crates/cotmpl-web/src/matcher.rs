//! Matcher builder: folds an ordered rule set into one alternation.
//!
//! Each rule pattern becomes `(pattern)` in a combined regex. The regex
//! crate resolves alternatives leftmost-first, so at any position the
//! earliest-registered rule that matches wins. A pattern that does not
//! compile is left out with a warning; the template still compiles, that
//! rule just never fires.

use crate::lazy::LazyScope;
use crate::rules::{RuleMatch, RuleSet, TemplateRule};
use regex::Regex;
use std::rc::Rc;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
struct Alternative {
    rule: usize,
    /// Index of the wrapping group in the combined regex.
    group: usize,
    /// Capture groups of the rule's own pattern (excluding group 0).
    inner_groups: usize,
}

/// One rule match found while scanning a template.
#[derive(Debug, Clone)]
pub struct Found<'t> {
    pub start: usize,
    pub end: usize,
    pub rule: usize,
    pub matched: RuleMatch<'t>,
}

#[derive(Debug)]
pub struct Matcher {
    regex: Option<Regex>,
    alternatives: Vec<Alternative>,
    rules: Vec<TemplateRule>,
    seed: LazyScope,
}

impl Matcher {
    pub fn build(rule_set: &RuleSet) -> Self {
        let rules: Vec<TemplateRule> = rule_set.iter().cloned().collect();
        let mut alternatives = Vec::new();
        let mut parts = Vec::new();
        let mut next_group = 1;

        for (idx, rule) in rules.iter().enumerate() {
            let (Some(pattern), Some(_)) = (&rule.pattern, &rule.exec) else {
                continue;
            };
            let compiled = match Regex::new(pattern) {
                Ok(re) => re,
                Err(err) => {
                    warn!(rule = %rule.name, error = %err, "skipping rule with malformed pattern");
                    continue;
                }
            };
            let inner_groups = compiled.captures_len() - 1;
            alternatives.push(Alternative {
                rule: idx,
                group: next_group,
                inner_groups,
            });
            parts.push(format!("({pattern})"));
            next_group += 1 + inner_groups;
        }

        let regex = if parts.is_empty() {
            None
        } else {
            match Regex::new(&parts.join("|")) {
                Ok(re) => Some(re),
                Err(err) => {
                    warn!(error = %err, "combined rule pattern failed to build; templates will not match any rule");
                    None
                }
            }
        };

        let lazy_names: Vec<Rc<str>> = rules
            .iter()
            .filter(|r| r.lazy_exec.is_some())
            .map(|r| r.name.clone())
            .collect();
        let seed = LazyScope::with_rules(lazy_names.iter());

        Self {
            regex,
            alternatives,
            rules,
            seed,
        }
    }

    pub fn rules(&self) -> &[TemplateRule] {
        &self.rules
    }

    pub fn rule(&self, idx: usize) -> Option<&TemplateRule> {
        self.rules.get(idx)
    }

    /// Rules with a deferred phase, in registration order.
    pub fn lazy_rules(&self) -> impl Iterator<Item = &TemplateRule> {
        self.rules.iter().filter(|r| r.lazy_exec.is_some())
    }

    /// Empty per-template LazyScope with one entry per deferred rule.
    pub fn seed(&self) -> LazyScope {
        self.seed.clone()
    }

    /// Number of rules taking part in matching.
    pub fn alternative_count(&self) -> usize {
        self.alternatives.len()
    }

    pub fn scan<'t>(&self, text: &'t str) -> Vec<Found<'t>> {
        let Some(regex) = &self.regex else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for caps in regex.captures_iter(text) {
            let Some((alt, whole)) = self
                .alternatives
                .iter()
                .find_map(|a| caps.get(a.group).map(|m| (a, m)))
            else {
                continue;
            };
            let groups = (1..=alt.inner_groups)
                .map(|i| caps.get(alt.group + i).map(|m| m.as_str()))
                .collect();
            out.push(Found {
                start: whole.start(),
                end: whole.end(),
                rule: alt.rule,
                matched: RuleMatch::new(whole.as_str(), groups),
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn names<'a>(m: &'a Matcher, found: &[Found<'_>]) -> Vec<&'a str> {
        found
            .iter()
            .filter_map(|f| m.rule(f.rule).map(|r| r.name.as_ref()))
            .collect()
    }

    #[test]
    fn test_earliest_rule_wins() {
        let m = Matcher::build(&RuleSet::builtin());
        let found = m.scan("a ##= x ## b ##- y ## ## let z = 1 ## ### go() ## ##* c ##");
        assert_eq!(names(&m, &found), vec!["interpolate", "escape", "raw", "deferred", "comment"]);
        assert_eq!(found[0].matched.inner(), " x ");
    }

    #[test]
    fn test_attribute_rules_capture_payload() {
        let m = Matcher::build(&RuleSet::builtin());
        let found = m.scan(r###"<a data-co-event="##: data.fn ::: data.g :: 1 ##">x</a>"###);
        assert_eq!(names(&m, &found), vec!["event"]);
        assert_eq!(found[0].matched.inner(), " data.fn ::: data.g :: 1 ");
        assert!(found[0].matched.text.starts_with("data-co-event="));
    }

    #[test]
    fn test_malformed_pattern_is_skipped() {
        let rules = RuleSet::builtin().merged(&[TemplateRule::new("broken")
            .pattern("(unclosed")
            .exec(|_, _| Ok(Vec::new()))]);
        let m = Matcher::build(&rules);
        assert_eq!(m.alternative_count(), RuleSet::builtin().len());
        assert_eq!(names(&m, &m.scan("##= 1 ##")), vec!["interpolate"]);
    }

    #[test]
    fn test_lazy_only_rule_seeds_scope() {
        let rules = RuleSet::builtin().merged(&[TemplateRule::new("audit").lazy_exec(|_| Ok(()))]);
        let m = Matcher::build(&rules);
        assert_eq!(m.alternative_count(), RuleSet::builtin().len());
        let seed = m.seed();
        assert_eq!(seed.rule_names().last().map(|n| n.to_string()), Some("audit".to_string()));
        assert!(seed.is_empty());
    }

    #[test]
    fn test_inner_groups_are_rule_local() {
        let rules = RuleSet::new(vec![
            TemplateRule::new("pair")
                .pattern(r"<(\w+)=(\w+)>")
                .exec(|_, _| Ok(Vec::new())),
            TemplateRule::new("word")
                .pattern(r"@(\w+)")
                .exec(|_, _| Ok(Vec::new())),
        ]);
        let m = Matcher::build(&rules);
        let found = m.scan("<a=b> @c");
        assert_eq!(found[0].matched.group(2), Some("b"));
        assert_eq!(found[1].matched.inner(), "c");
        assert_eq!(found[1].matched.group(2), None);
    }
}
