//! Per-run execution context
//!
//! One [`Context`] is threaded through a single program run. It carries the
//! borrowed-in state dictionary, the global bindings produced by the run,
//! the scene graph under construction, pragmas, and the deduplicated error
//! and log sets the host inspects afterwards.

use std::path::Path;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};

use crate::model::{Node, StateDict, Vector};

pub struct Context {
    pub state: StateDict,
    /// Global bindings produced by this run.
    pub names: IndexMap<Rc<str>, Vector>,
    /// Root of the scene graph; its children are the run's output.
    pub graph: Node,
    pub pragmas: IndexMap<Rc<str>, Vector>,
    /// Recoverable errors, deduplicated, in first-occurrence order.
    pub errors: IndexSet<String>,
    pub logs: IndexSet<String>,
    /// Identity of the source currently executing.
    pub path: Option<Rc<Path>>,
    /// Paths of the modules currently being imported, outermost first.
    /// Used to detect circular imports.
    pub(crate) import_stack: Vec<Rc<Path>>,
}

impl Context {
    pub fn new(state: StateDict, path: Option<Rc<Path>>) -> Context {
        Context {
            state,
            names: IndexMap::new(),
            graph: Node::new("root"),
            pragmas: IndexMap::new(),
            errors: IndexSet::new(),
            logs: IndexSet::new(),
            import_stack: path.iter().cloned().collect(),
            path,
        }
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.insert(message.into());
    }

    pub fn log(&mut self, message: impl Into<String>) {
        self.logs.insert(message.into());
    }
}
