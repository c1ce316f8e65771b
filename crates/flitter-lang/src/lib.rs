//! # Flitter language engine
//!
//! The evaluation core of a live-coded declarative language for generative
//! visuals: a dynamically-typed vector value model, a scene-graph node
//! tree, a partial evaluator over the expression AST, a compiler lowering
//! the simplified tree to a linear instruction stream, and a stack-based
//! virtual machine executed once per frame.
//!
//! ## Pipeline
//!
//! ```text
//! source text
//!     ↓  (external parser)
//! tree::Top               - expression AST
//!     ↓  Top::simplify    - constant folding, unrolling, inlining
//! tree::Top               - simplified AST
//!     ↓  Top::compile     - lowering, peephole, label linking
//! vm::Program
//!     ↓  Program::run     - one frame
//! context::Context        - graph, globals, pragmas, errors, logs
//! ```
//!
//! The textual grammar, render backends, clock and frame loop are external
//! collaborators: they construct the AST, consume the per-frame [`Context`]
//! and provide module loading through [`vm::loader::SourceLoader`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use flitter_lang::model::StateDict;
//!
//! let (top, _) = top.simplify(None, &statics, &dynamics);
//! let program = top.compile();
//! let context = program.run(StateDict::new(), globals)?;
//! for node in context.graph.children() {
//!     // hand the scene graph to a renderer
//! }
//! ```

pub mod builtins;
pub mod compiler;
pub mod context;
pub mod error;
pub mod model;
pub mod tree;
pub mod vm;

pub use context::Context;
pub use error::{Error, Result};
pub use model::{Node, Object, Query, StateDict, Vector};
pub use tree::simplify::{SimplifyLimits, StaticBinding};
pub use tree::{Expression, Top};
pub use vm::loader::SourceLoader;
pub use vm::Program;
