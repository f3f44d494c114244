//! Template parser: one pass of the combined matcher over the template text.
//!
//! Literal text between matches becomes [`Instr::Text`]; each match is handed
//! to its rule's `exec`. Literal text never passes through a code generator,
//! so it needs no escaping here.

use crate::error::{ErrorPolicy, TemplateError};
use crate::lazy::LazyScope;
use crate::matcher::Matcher;
use crate::rules::CompileContext;
use cotmpl_core::{Env, Instr, Value};
use std::rc::Rc;
use tracing::{error, warn};

#[derive(Debug)]
pub struct ParsedTemplate {
    pub instrs: Vec<Instr>,
    /// LazyScope seed with one slot per deferred-rule occurrence.
    pub seed: LazyScope,
    pub styles: Vec<String>,
}

pub fn parse_template(
    template_id: &str,
    text: &str,
    matcher: &Matcher,
    core: &cotmpl_core::Engine,
    policy: ErrorPolicy,
) -> Result<ParsedTemplate, TemplateError> {
    let mut seed = matcher.seed();
    let mut styles = Vec::new();
    let mut env = Env::new();
    env.set_global("tmplId", Value::from(template_id));

    let mut instrs = Vec::new();
    let mut last = 0;
    for found in matcher.scan(text) {
        push_text(&mut instrs, &text[last..found.start]);
        last = found.end;
        let Some(rule) = matcher.rule(found.rule) else {
            continue;
        };
        let Some(exec) = rule.exec.clone() else {
            continue;
        };
        let mut ctx = CompileContext {
            template_id,
            rule: rule.name.clone(),
            seed: &mut seed,
            styles: &mut styles,
            core,
            env: &mut env,
        };
        match exec(&mut ctx, &found.matched) {
            Ok(out) => instrs.extend(out),
            Err(err) => {
                let err = TemplateError::RuleCompile {
                    template: template_id.to_string(),
                    rule: rule.name.to_string(),
                    fragment: found.matched.text.to_string(),
                    message: err.to_string(),
                };
                if policy.is_strict() {
                    error!(template = %template_id, rule = %rule.name, fragment = %found.matched.text, error = %err, "rule failed to compile");
                    return Err(err);
                }
                warn!(template = %template_id, rule = %rule.name, fragment = %found.matched.text, error = %err, "rule failed to compile; dropping fragment");
            }
        }
    }
    push_text(&mut instrs, &text[last..]);

    Ok(ParsedTemplate {
        instrs,
        seed,
        styles,
    })
}

fn push_text(instrs: &mut Vec<Instr>, literal: &str) {
    if !literal.is_empty() {
        instrs.push(Instr::Text(Rc::from(literal)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleSet;

    fn parse(text: &str, policy: ErrorPolicy) -> Result<ParsedTemplate, TemplateError> {
        let matcher = Matcher::build(&RuleSet::builtin());
        parse_template("t", text, &matcher, &cotmpl_core::Engine::new(), policy)
    }

    #[test]
    fn test_text_and_emits() {
        let parsed = parse("<p>##= data.a ##|##- data.b ##</p>", ErrorPolicy::Strict).expect("parse");
        let kinds: Vec<&str> = parsed
            .instrs
            .iter()
            .map(|i| match i {
                Instr::Text(_) => "text",
                Instr::Emit { escape: false, .. } => "emit",
                Instr::Emit { escape: true, .. } => "escape",
                Instr::Stmt(_) => "stmt",
                Instr::Lazy { .. } => "lazy",
            })
            .collect();
        assert_eq!(kinds, vec!["text", "emit", "text", "escape", "text"]);
    }

    #[test]
    fn test_one_slot_per_occurrence() {
        let parsed = parse(
            r###"## for x in data.items { ##<b data-co-event="##: data.fn ##"></b>## } ##<i data-co-event="##: data.fn ##"></i>"###,
            ErrorPolicy::Strict,
        )
        .expect("parse");
        assert_eq!(parsed.seed.len("event"), 2);
        assert_eq!(parsed.seed.len("props"), 0);
    }

    #[test]
    fn test_rule_error_policy() {
        let err = parse("a ##= 1 + ## b", ErrorPolicy::Strict).expect_err("strict");
        assert!(matches!(err, TemplateError::RuleCompile { ref rule, .. } if rule == "interpolate"));

        let parsed = parse("a ##= 1 + ## b", ErrorPolicy::Lenient).expect("lenient");
        assert_eq!(parsed.instrs.len(), 2);
    }

    #[test]
    fn test_compile_time_block_persists_bindings() {
        let parsed = parse("##! let n = 20 ##<i>##! n + 1 ##</i>", ErrorPolicy::Strict).expect("parse");
        let texts: String = parsed
            .instrs
            .iter()
            .filter_map(|i| match i {
                Instr::Text(t) => Some(t.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, "<i>21</i>");
    }

    #[test]
    fn test_styles_are_hoisted() {
        let parsed = parse("<style>.a { color: red }</style><div></div>", ErrorPolicy::Strict).expect("parse");
        assert_eq!(parsed.styles, vec![".a { color: red }".to_string()]);
        assert_eq!(parsed.instrs.len(), 1);
    }
}
