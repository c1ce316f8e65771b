//! Host import contract
//!
//! The VM never touches the filesystem. When an `Import` instruction runs,
//! the host-provided loader is asked for a compiled program keyed by the
//! filename expression and the importing source's identity. The loader owns
//! caching and IO and must be idempotent for the same key.

use std::path::Path;
use std::rc::Rc;

use crate::vm::Program;

pub trait SourceLoader {
    /// Resolve `filename` relative to `current_path` and return the
    /// compiled module, or `None` if it cannot be loaded. The returned
    /// program's own `path` is used for circular-import detection.
    fn load(&mut self, filename: &str, current_path: Option<&Path>) -> Option<Rc<Program>>;
}
