//! Template compiler: parse, then link the instruction list into a program.

use crate::error::{ErrorPolicy, TemplateError};
use crate::lazy::LazyScope;
use crate::matcher::Matcher;
use crate::parser::parse_template;
use cotmpl_core::{Program, link_program};
use std::rc::Rc;
use tracing::{debug, error, warn};

/// Result of compiling one template. Rendering never mutates it.
#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    id: Rc<str>,
    program: Program,
    seed: LazyScope,
    matcher: Rc<Matcher>,
    styles: Vec<String>,
}

impl CompiledTemplate {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Fresh LazyScope for one render.
    pub fn seed(&self) -> LazyScope {
        self.seed.clone()
    }

    pub fn matcher(&self) -> &Rc<Matcher> {
        &self.matcher
    }

    pub fn styles(&self) -> &[String] {
        &self.styles
    }

    /// Compile-time occurrences of `rule`.
    pub fn lazy_count(&self, rule: &str) -> usize {
        self.seed.len(rule)
    }

    pub(crate) fn with_id(&self, id: &str) -> Self {
        Self {
            id: Rc::from(id),
            ..self.clone()
        }
    }
}

pub fn compile_template(
    id: &str,
    text: &str,
    matcher: Rc<Matcher>,
    core: &cotmpl_core::Engine,
    policy: ErrorPolicy,
) -> Result<CompiledTemplate, TemplateError> {
    let parsed = parse_template(id, text, &matcher, core, policy)?;
    let program = match link_program(parsed.instrs) {
        Ok(program) => program,
        Err(err) => {
            let err = TemplateError::Compile {
                template: id.to_string(),
                message: err.to_string(),
            };
            if policy.is_strict() {
                error!(template = %id, error = %err, "template failed to compile");
                return Err(err);
            }
            warn!(template = %id, error = %err, "template failed to compile; it will render nothing");
            Program::empty()
        }
    };
    debug!(template = %id, instrs = program.instr_count(), "compiled template");
    Ok(CompiledTemplate {
        id: Rc::from(id),
        program,
        seed: parsed.seed,
        matcher,
        styles: parsed.styles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleSet;

    fn compile(text: &str, policy: ErrorPolicy) -> Result<CompiledTemplate, TemplateError> {
        let matcher = Rc::new(Matcher::build(&RuleSet::builtin()));
        compile_template("card", text, matcher, &cotmpl_core::Engine::new(), policy)
    }

    #[test]
    fn test_unbalanced_block_is_compile_error() {
        let err = compile("## if data.x { ##<b></b>", ErrorPolicy::Strict).expect_err("strict");
        assert!(matches!(err, TemplateError::Compile { .. }));
    }

    #[test]
    fn test_lenient_compile_error_renders_nothing() {
        let tmpl = compile("<b></b>## } ##", ErrorPolicy::Lenient).expect("lenient");
        assert!(tmpl.program().is_empty());
    }

    #[test]
    fn test_lazy_counts_and_rename() {
        let tmpl = compile(
            r###"<a data-co-named-element="##: 'title' ##"></a>### log(1) ##"###,
            ErrorPolicy::Strict,
        )
        .expect("compile");
        assert_eq!(tmpl.lazy_count("namedElement"), 1);
        assert_eq!(tmpl.lazy_count("deferred"), 1);
        let renamed = tmpl.with_id("other");
        assert_eq!(renamed.id(), "other");
        assert_eq!(renamed.lazy_count("deferred"), 1);
    }
}
