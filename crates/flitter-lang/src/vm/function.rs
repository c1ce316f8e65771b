//! First-class function values
//!
//! A [`Function`] is assembled at run time by the `Func` instruction: the
//! compiled body program, per-parameter default values, and a by-value
//! snapshot of the locals in scope at the definition site. Invocation
//! pushes the parameter values on top of a copy of that snapshot, so the
//! local depths the body was compiled against line up without any lifetime
//! tie to the defining frame.

use std::path::Path;
use std::rc::Rc;

use crate::model::Vector;
use crate::vm::{Local, Program};

pub struct Function {
    pub name: Rc<str>,
    pub parameters: Vec<Rc<str>>,
    /// One default per parameter; `null` when the parameter has none.
    pub defaults: Vec<Vector>,
    pub program: Rc<Program>,
    /// Locals in scope at the definition site, by value.
    pub captured: Vec<Local>,
    /// Source identity of the definition site, used for imports made while
    /// the body runs.
    pub path: Option<Rc<Path>>,
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.parameters.join(";"))
    }
}
