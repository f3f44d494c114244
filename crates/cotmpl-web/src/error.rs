use cotmpl_core::{EvalError, ProgramError, ReaderError};
use serde::{Deserialize, Serialize};

/// Whether failures escalate to the caller or are contained at the boundary
/// where they happen. One switch covers compile time and render time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    Strict,
    #[default]
    Lenient,
}

impl ErrorPolicy {
    pub fn is_strict(self) -> bool {
        matches!(self, ErrorPolicy::Strict)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DomError {
    #[error("node cannot contain children")]
    NotAContainer,
    #[error("node would become its own ancestor")]
    HierarchyRequest,
    #[error("reference node is not a child of this node")]
    NotFound,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("template '{template}': rule '{rule}' failed on `{fragment}`: {message}")]
    RuleCompile {
        template: String,
        rule: String,
        fragment: String,
        message: String,
    },
    #[error("template '{template}' failed to compile: {message}")]
    Compile { template: String, message: String },
    #[error("template '{template}' failed to render: {message}")]
    Render { template: String, message: String },
    #[error("template '{template}': deferred rule '{rule}' failed: {message}")]
    LazyExec {
        template: String,
        rule: String,
        message: String,
    },
    #[error("'{event}' handler failed: {message}")]
    EventHandler { event: String, message: String },
    #[error("unknown template '{0}'")]
    UnknownTemplate(String),
    #[error("component {0} has been released")]
    Released(u64),
    #[error("component {0} is not attached to a parent")]
    Detached(u64),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Syntax(#[from] ReaderError),
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error(transparent)]
    Dom(#[from] DomError),
}

impl From<TemplateError> for EvalError {
    fn from(err: TemplateError) -> Self {
        match err {
            TemplateError::Eval(e) => e,
            other => EvalError::new(other.to_string()),
        }
    }
}
