//! Compile-time-only rules: they turn a match into instructions and leave
//! nothing for the deferred phase.

use super::{CompileContext, RuleMatch, TemplateRule};
use crate::error::TemplateError;
use cotmpl_core::{Instr, compile_block, compile_expr};
use std::rc::Rc;

fn emit(m: &RuleMatch<'_>, escape: bool) -> Result<Vec<Instr>, TemplateError> {
    let expr = compile_expr(m.inner().trim())?;
    Ok(vec![Instr::Emit { expr, escape }])
}

pub(super) fn comment() -> TemplateRule {
    TemplateRule::new("comment")
        .pattern(r"##\*(?s:.*?)##")
        .exec(|_, _| Ok(Vec::new()))
}

pub(super) fn compile_time() -> TemplateRule {
    TemplateRule::new("compile")
        .pattern(r"##!((?s:.*?))##")
        .exec(|ctx: &mut CompileContext<'_>, m: &RuleMatch<'_>| {
            Ok(match ctx.run_compile_time(m.inner())? {
                Some(value) if !value.is_null() => {
                    vec![Instr::Text(Rc::from(value.display_string()))]
                }
                _ => Vec::new(),
            })
        })
}

pub(super) fn interpolate() -> TemplateRule {
    TemplateRule::new("interpolate")
        .pattern(r"##=((?s:.*?))##")
        .exec(|_, m| emit(m, false))
}

pub(super) fn escape() -> TemplateRule {
    TemplateRule::new("escape")
        .pattern(r"##-((?s:.*?))##")
        .exec(|_, m| emit(m, true))
}

/// Hoists `<style>` bodies into the engine stylesheet, once per template.
pub(super) fn style() -> TemplateRule {
    TemplateRule::new("style")
        .pattern(r"(?i:<style\b[^>]*>)((?s:.*?))(?i:</style>)")
        .exec(|ctx, m| {
            ctx.add_style(m.inner());
            Ok(Vec::new())
        })
}

pub(super) fn raw() -> TemplateRule {
    TemplateRule::new("raw")
        .pattern(r"##((?s:.*?))##")
        .exec(|_, m| {
            let stmts = compile_block(m.inner())?;
            Ok(stmts.into_iter().map(Instr::Stmt).collect())
        })
}
