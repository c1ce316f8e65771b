//! Expression trees
//!
//! The abstract syntax produced by the (external) parser. Node constructors
//! arrive as [`Literal`](Expression::Literal) vectors containing nodes;
//! [`FunctionName`](Expression::FunctionName) is produced only by the
//! partial evaluator, which keeps statically-known callees symbolic so that
//! calls to them can be inlined.

pub mod simplify;

use std::path::Path;
use std::rc::Rc;

use crate::model::{Query, Vector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Numeric identity; yields `null` for non-numeric operands.
    Pos,
    Neg,
    Not,
    Ceil,
    Floor,
    Fract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathsOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    FloorDivide,
    Modulo,
    Power,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    EqualTo,
    NotEqualTo,
    LessThan,
    GreaterThan,
    LessThanOrEqualTo,
    GreaterThanOrEqualTo,
}

/// A single-name binding (attribute values, keyword arguments, function
/// parameters with defaults).
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub name: Rc<str>,
    pub expr: Expression,
}

impl Binding {
    pub fn new(name: &str, expr: Expression) -> Binding {
        Binding {
            name: Rc::from(name),
            expr,
        }
    }
}

/// A destructuring binding: one expression bound to one or more names.
/// Short values wrap around the name list.
#[derive(Debug, Clone, PartialEq)]
pub struct PolyBinding {
    pub names: Vec<Rc<str>>,
    pub expr: Expression,
}

impl PolyBinding {
    pub fn new(names: &[&str], expr: Expression) -> PolyBinding {
        PolyBinding {
            names: names.iter().map(|n| Rc::from(*n)).collect(),
            expr,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfCondition {
    pub condition: Expression,
    pub then: Expression,
}

/// A function definition. The `captures` and `recursive` flags are computed
/// by the partial evaluator and drive the inlining decision.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: Rc<str>,
    pub parameters: Vec<Binding>,
    pub body: Expression,
    /// Body references names outside its own parameters (and name).
    pub captures: bool,
    /// Body calls itself.
    pub recursive: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Vector),
    Name(Rc<str>),
    FunctionName(Rc<str>),
    /// State lookup: `$key`.
    Lookup(Box<Expression>),
    Range {
        start: Box<Expression>,
        stop: Box<Expression>,
        step: Box<Expression>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expression>,
    },
    Maths {
        op: MathsOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Compare {
        op: CompareOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    And {
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Or {
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Xor {
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Slice {
        expr: Box<Expression>,
        index: Box<Expression>,
    },
    /// A slice whose index folded to a literal.
    FastSlice {
        expr: Box<Expression>,
        index: Vector,
    },
    Call {
        function: Box<Expression>,
        args: Vec<Expression>,
        keywords: Vec<Binding>,
    },
    Tag {
        node: Box<Expression>,
        tag: Rc<str>,
    },
    Attributes {
        node: Box<Expression>,
        bindings: Vec<Binding>,
    },
    Append {
        node: Box<Expression>,
        children: Box<Expression>,
    },
    Prepend {
        node: Box<Expression>,
        children: Box<Expression>,
    },
    Sequence(Vec<Expression>),
    /// Bindings scoped to the remainder of the enclosing sequence.
    Let {
        bindings: Vec<PolyBinding>,
    },
    /// Bindings scoped to a single body expression; produced by the
    /// simplifier when inlining calls.
    InlineLet {
        body: Box<Expression>,
        bindings: Vec<PolyBinding>,
    },
    For {
        names: Vec<Rc<str>>,
        source: Box<Expression>,
        body: Box<Expression>,
    },
    IfElse {
        tests: Vec<IfCondition>,
        else_: Option<Box<Expression>>,
    },
    FunctionDef(Rc<FunctionDef>),
    Import {
        names: Vec<Rc<str>>,
        filename: Box<Expression>,
    },
    Pragma {
        name: Rc<str>,
        expr: Box<Expression>,
    },
    Search(Query),
}

impl Expression {
    pub fn literal(value: impl Into<Vector>) -> Expression {
        Expression::Literal(value.into())
    }

    pub fn name(name: &str) -> Expression {
        Expression::Name(Rc::from(name))
    }

    pub fn unary(op: UnaryOp, expr: Expression) -> Expression {
        Expression::Unary {
            op,
            expr: Box::new(expr),
        }
    }

    pub fn maths(op: MathsOp, left: Expression, right: Expression) -> Expression {
        Expression::Maths {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn compare(op: CompareOp, left: Expression, right: Expression) -> Expression {
        Expression::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Is this a binding form that scopes the remainder of a sequence?
    pub fn is_sequence_binding(&self) -> bool {
        matches!(
            self,
            Expression::Let { .. } | Expression::Import { .. } | Expression::FunctionDef(_)
        )
    }
}

/// The root of a parsed program: the top-level expression sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Top {
    pub body: Vec<Expression>,
    pub path: Option<Rc<Path>>,
}

impl Top {
    pub fn new(body: Vec<Expression>) -> Top {
        Top { body, path: None }
    }

    pub fn with_path(body: Vec<Expression>, path: Rc<Path>) -> Top {
        Top {
            body,
            path: Some(path),
        }
    }
}

/// Conservative free-reference test, used for recursion detection and
/// dead-binding elimination. Shadowing is ignored, which can only
/// over-report references.
pub(crate) fn references_name(expr: &Expression, name: &str) -> bool {
    match expr {
        Expression::Literal(_) | Expression::Search(_) => false,
        Expression::Name(n) | Expression::FunctionName(n) => **n == *name,
        Expression::Lookup(key) => references_name(key, name),
        Expression::Range { start, stop, step } => {
            references_name(start, name)
                || references_name(stop, name)
                || references_name(step, name)
        }
        Expression::Unary { expr, .. } => references_name(expr, name),
        Expression::Maths { left, right, .. }
        | Expression::Compare { left, right, .. }
        | Expression::And { left, right }
        | Expression::Or { left, right }
        | Expression::Xor { left, right } => {
            references_name(left, name) || references_name(right, name)
        }
        Expression::Slice { expr, index } => {
            references_name(expr, name) || references_name(index, name)
        }
        Expression::FastSlice { expr, .. } => references_name(expr, name),
        Expression::Call {
            function,
            args,
            keywords,
        } => {
            references_name(function, name)
                || args.iter().any(|a| references_name(a, name))
                || keywords.iter().any(|k| references_name(&k.expr, name))
        }
        Expression::Tag { node, .. } => references_name(node, name),
        Expression::Attributes { node, bindings } => {
            references_name(node, name)
                || bindings.iter().any(|b| references_name(&b.expr, name))
        }
        Expression::Append { node, children } | Expression::Prepend { node, children } => {
            references_name(node, name) || references_name(children, name)
        }
        Expression::Sequence(exprs) => exprs.iter().any(|e| references_name(e, name)),
        Expression::Let { bindings } => bindings.iter().any(|b| references_name(&b.expr, name)),
        Expression::InlineLet { body, bindings } => {
            references_name(body, name)
                || bindings.iter().any(|b| references_name(&b.expr, name))
        }
        Expression::For { source, body, .. } => {
            references_name(source, name) || references_name(body, name)
        }
        Expression::IfElse { tests, else_ } => {
            tests
                .iter()
                .any(|t| references_name(&t.condition, name) || references_name(&t.then, name))
                || else_.as_ref().is_some_and(|e| references_name(e, name))
        }
        Expression::FunctionDef(def) => {
            references_name(&def.body, name)
                || def
                    .parameters
                    .iter()
                    .any(|p| references_name(&p.expr, name))
        }
        Expression::Import { filename, .. } => references_name(filename, name),
        Expression::Pragma { expr, .. } => references_name(expr, name),
    }
}
