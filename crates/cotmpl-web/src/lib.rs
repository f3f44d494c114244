//! Template-to-renderer compiler over an in-memory node tree.
//!
//! Templates are compiled once into a [`RenderFn`]; each render runs the
//! compiled program, parses its markup into nodes, then lets the deferred
//! rules wire events, element references and inserted content onto the new
//! tree. The result is a [`Component`] with its own lifecycle.

pub mod component;
pub mod config;
pub mod dom;
pub mod engine;
pub mod error;
pub mod events;
pub mod lazy;
pub mod markup;
pub mod matcher;
pub mod parser;
pub mod registry;
pub mod render;
pub mod rules;
pub mod runtime;
pub mod scheduler;
pub mod template;

pub use component::{Component, Hook, Lifecycle, WeakComponent};
pub use config::EngineConfig;
pub use dom::{Event, ListenerId, NodeRef, NodeType, WeakNode};
pub use engine::Engine;
pub use error::{DomError, ErrorPolicy, TemplateError};
pub use events::{EventSpec, MappedEvents};
pub use lazy::{LazyRecord, LazyScope, LazySlot};
pub use markup::parse_fragment;
pub use matcher::Matcher;
pub use registry::{Registry, TemplateMeta, namespace_path};
pub use render::{RenderFn, RenderOptions};
pub use rules::{CompileContext, LazyContext, Marked, RuleMatch, RuleSet, TemplateRule, apply_props};
pub use scheduler::{Scheduler, TaskHandle};
pub use template::CompiledTemplate;

pub use cotmpl_core::{EvalError, Function, Value};
