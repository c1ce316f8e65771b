//! Integration-test harness for end-to-end engine execution.
//!
//! These helpers drive the full pipeline:
//! Build AST → Simplify → Compile → Run → Inspect context
//!
//! The textual parser is an external collaborator, so programs are built
//! programmatically with the small expression constructors below.

use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};

use flitter_lang::model::{Node, StateDict, Vector};
use flitter_lang::tree::simplify::StaticBinding;
use flitter_lang::tree::{Binding, Expression, MathsOp, PolyBinding, Top};
use flitter_lang::vm::loader::SourceLoader;
use flitter_lang::{Context, Program};

/// Drives one program over one or more frames, carrying state forward the
/// way an engine frame loop would.
pub struct TestHarness {
    program: Program,
    state: StateDict,
    pub context: Option<Context>,
}

impl TestHarness {
    /// Simplify (with no static or dynamic names) and compile.
    pub fn new(top: Top) -> TestHarness {
        let (simplified, outcome) = top.simplify(None, &IndexMap::new(), &IndexSet::new());
        assert!(
            outcome.errors.is_empty(),
            "simplification errors: {:?}",
            outcome.errors
        );
        TestHarness {
            program: simplified.compile(),
            state: StateDict::new(),
            context: None,
        }
    }

    /// Compile without partial evaluation, to exercise the VM paths the
    /// simplifier would otherwise fold away.
    pub fn new_unsimplified(top: Top) -> TestHarness {
        TestHarness {
            program: top.compile(),
            state: StateDict::new(),
            context: None,
        }
    }

    /// The partially-evaluated tree the compiled program retains.
    pub fn simplified_top(&self) -> &Top {
        self.program.top().expect("program should retain its tree")
    }

    pub fn set_state(&mut self, key: Vector, value: Vector) {
        self.state.set(key, value);
    }

    pub fn state(&self) -> &StateDict {
        &self.state
    }

    pub fn run(&mut self) {
        self.run_with_variables(IndexMap::new());
    }

    pub fn run_with_variables(&mut self, variables: IndexMap<Rc<str>, Vector>) {
        let state = std::mem::take(&mut self.state);
        let context = self.program.run(state, variables).expect("run should succeed");
        self.state = context.state.clone();
        self.context = Some(context);
    }

    pub fn run_with_loader(&mut self, loader: &mut dyn SourceLoader) {
        let state = std::mem::take(&mut self.state);
        let context = self
            .program
            .run_with_loader(state, IndexMap::new(), loader)
            .expect("run should succeed");
        self.state = context.state.clone();
        self.context = Some(context);
    }

    /// Host-side handling of `!store key=… value=…` nodes: write each into
    /// the state dictionary, as a controller renderer would between frames.
    pub fn apply_store_nodes(&mut self) {
        let context = self.context.as_ref().expect("run first");
        for node in context.graph.children() {
            if &*node.kind() == "store" {
                if let (Some(key), Some(value)) =
                    (node.get_attribute("key"), node.get_attribute("value"))
                {
                    self.state.set(key, value);
                }
            }
        }
    }

    pub fn global(&self, name: &str) -> Vector {
        let context = self.context.as_ref().expect("run first");
        context.names.get(name).cloned().unwrap_or_default()
    }

    pub fn pragma(&self, name: &str) -> Vector {
        let context = self.context.as_ref().expect("run first");
        context.pragmas.get(name).cloned().unwrap_or_default()
    }

    pub fn children(&self) -> Vec<Node> {
        self.context.as_ref().expect("run first").graph.children()
    }

    pub fn errors(&self) -> Vec<String> {
        let context = self.context.as_ref().expect("run first");
        context.errors.iter().cloned().collect()
    }
}

/// A canned module table standing in for the filesystem loader.
#[derive(Default)]
pub struct MapLoader {
    modules: HashMap<String, Rc<Program>>,
}

impl MapLoader {
    pub fn with_module(mut self, filename: &str, top: Top) -> MapLoader {
        let top = Top {
            path: Some(Rc::from(Path::new(filename))),
            ..top
        };
        self.modules
            .insert(filename.to_string(), Rc::new(top.compile()));
        self
    }
}

impl SourceLoader for MapLoader {
    fn load(&mut self, filename: &str, _current_path: Option<&Path>) -> Option<Rc<Program>> {
        self.modules.get(filename).cloned()
    }
}

// --- expression constructors ---------------------------------------------

pub fn lit(n: f64) -> Expression {
    Expression::Literal(Vector::from(n))
}

pub fn name(n: &str) -> Expression {
    Expression::name(n)
}

pub fn add(left: Expression, right: Expression) -> Expression {
    Expression::maths(MathsOp::Add, left, right)
}

pub fn mul(left: Expression, right: Expression) -> Expression {
    Expression::maths(MathsOp::Multiply, left, right)
}

pub fn node(kind: &str) -> Expression {
    Expression::Literal(Vector::from(Node::new(kind)))
}

pub fn attributes(node: Expression, bindings: Vec<(&str, Expression)>) -> Expression {
    Expression::Attributes {
        node: Box::new(node),
        bindings: bindings
            .into_iter()
            .map(|(name, expr)| Binding::new(name, expr))
            .collect(),
    }
}

pub fn let_one(name: &str, expr: Expression) -> Expression {
    Expression::Let {
        bindings: vec![PolyBinding::new(&[name], expr)],
    }
}

pub fn statics_of(pairs: &[(&str, Vector)]) -> IndexMap<Rc<str>, StaticBinding> {
    pairs
        .iter()
        .map(|(name, value)| (Rc::from(*name), StaticBinding::Value(value.clone())))
        .collect()
}
