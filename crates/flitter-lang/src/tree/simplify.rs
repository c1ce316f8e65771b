//! Partial evaluation
//!
//! Walks an expression tree with a mapping of statically-known names and
//! returns an equivalent, simpler tree: constants folded, algebra
//! normalised, loops over literal sources unrolled, calls to known
//! functions inlined, dead bindings removed. Running the simplified program
//! is observationally equal to running the original, and simplification is
//! idempotent.

use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};

use crate::builtins;
use crate::model::{StateDict, Vector};
use crate::tree::{
    references_name, Binding, CompareOp, Expression, FunctionDef, IfCondition, MathsOp,
    PolyBinding, Top, UnaryOp,
};

/// Work caps preventing unrolling and inlining from blowing up code size.
/// On cap the expression is left as-is.
#[derive(Debug, Clone, Copy)]
pub struct SimplifyLimits {
    /// Maximum iterations a literal-source loop may unroll to.
    pub max_unroll: usize,
    /// Maximum nesting depth of inlined calls.
    pub max_inline_depth: usize,
}

impl Default for SimplifyLimits {
    fn default() -> Self {
        SimplifyLimits {
            max_unroll: 1024,
            max_inline_depth: 256,
        }
    }
}

/// What the simplifier statically knows about a name.
#[derive(Debug, Clone)]
pub enum StaticBinding {
    /// A concrete value; references fold to literals.
    Value(Vector),
    /// An alias for another name; references are substituted untouched.
    Rename(Rc<str>),
    /// A known function definition; calls to it may inline.
    Function(Rc<FunctionDef>),
}

impl From<Vector> for StaticBinding {
    fn from(value: Vector) -> StaticBinding {
        StaticBinding::Value(value)
    }
}

#[derive(Debug, Default)]
pub struct SimplifyOutcome {
    pub errors: IndexSet<String>,
}

/// Simplify a bare expression; mostly useful for tests and diagnostic
/// tooling. `dynamic` names are left symbolic rather than reported unbound.
pub fn simplify_expression(
    expr: &Expression,
    state: Option<&StateDict>,
    static_vars: &IndexMap<Rc<str>, StaticBinding>,
    dynamic: &IndexSet<Rc<str>>,
) -> (Expression, SimplifyOutcome) {
    let mut simplifier = Simplifier::new(state, static_vars, dynamic, SimplifyLimits::default());
    let simplified = simplifier.expr(expr);
    (simplified, simplifier.finish())
}

impl Top {
    /// Partially evaluate the whole program. Statically-consumed top-level
    /// bindings are re-emitted with literal right-hand sides so they still
    /// become globals at run time.
    pub fn simplify(
        &self,
        state: Option<&StateDict>,
        static_vars: &IndexMap<Rc<str>, StaticBinding>,
        dynamic: &IndexSet<Rc<str>>,
    ) -> (Top, SimplifyOutcome) {
        self.simplify_with_limits(state, static_vars, dynamic, SimplifyLimits::default())
    }

    pub fn simplify_with_limits(
        &self,
        state: Option<&StateDict>,
        static_vars: &IndexMap<Rc<str>, StaticBinding>,
        dynamic: &IndexSet<Rc<str>>,
        limits: SimplifyLimits,
    ) -> (Top, SimplifyOutcome) {
        let mut simplifier = Simplifier::new(state, static_vars, dynamic, limits);
        let (body, _) = simplifier.sequence_items(&self.body, true);
        let top = Top {
            body,
            path: self.path.clone(),
        };
        (top, simplifier.finish())
    }
}

struct Simplifier<'a> {
    state: Option<&'a StateDict>,
    names: IndexMap<Rc<str>, Option<StaticBinding>>,
    errors: IndexSet<String>,
    /// Stack of sinks collecting names that may resolve later (function
    /// captures, node-scope attributes). While any sink is active, unknown
    /// names are recorded instead of reported as errors.
    unbound: Vec<IndexSet<Rc<str>>>,
    limits: SimplifyLimits,
    inline_depth: usize,
}

impl<'a> Simplifier<'a> {
    fn new(
        state: Option<&'a StateDict>,
        static_vars: &IndexMap<Rc<str>, StaticBinding>,
        dynamic: &IndexSet<Rc<str>>,
        limits: SimplifyLimits,
    ) -> Simplifier<'a> {
        let mut names: IndexMap<Rc<str>, Option<StaticBinding>> = IndexMap::new();
        for (name, binding) in static_vars {
            names.insert(name.clone(), Some(binding.clone()));
        }
        for name in dynamic {
            names.insert(name.clone(), None);
        }
        Simplifier {
            state,
            names,
            errors: IndexSet::new(),
            unbound: Vec::new(),
            limits,
            inline_depth: 0,
        }
    }

    fn finish(self) -> SimplifyOutcome {
        SimplifyOutcome {
            errors: self.errors,
        }
    }

    fn expr(&mut self, expr: &Expression) -> Expression {
        match expr {
            Expression::Literal(value) => Expression::Literal(value.copynodes()),
            Expression::Name(name) => self.name(name),
            Expression::FunctionName(name) => Expression::FunctionName(name.clone()),
            Expression::Lookup(key) => self.lookup(key),
            Expression::Range { start, stop, step } => self.range(start, stop, step),
            Expression::Unary { op, expr } => self.unary(*op, expr),
            Expression::Maths { op, left, right } => self.maths(*op, left, right),
            Expression::Compare { op, left, right } => self.comparison(*op, left, right),
            Expression::And { left, right } => self.and(left, right),
            Expression::Or { left, right } => self.or(left, right),
            Expression::Xor { left, right } => self.xor(left, right),
            Expression::Slice { expr, index } => self.slice(expr, index),
            Expression::FastSlice { expr, index } => {
                let expr = self.expr(expr);
                match expr {
                    Expression::Literal(value) => Expression::Literal(value.slice(index)),
                    expr => Expression::FastSlice {
                        expr: Box::new(expr),
                        index: index.clone(),
                    },
                }
            }
            Expression::Call {
                function,
                args,
                keywords,
            } => self.call(function, args, keywords),
            Expression::Tag { node, tag } => self.tag(node, tag),
            Expression::Attributes { node, bindings } => self.attributes(node, bindings),
            Expression::Append { node, children } => self.append(node, children),
            Expression::Prepend { node, children } => self.prepend(node, children),
            Expression::Sequence(items) => {
                let saved = self.names.clone();
                let (items, has_bindings) = self.sequence_items(items, false);
                self.names = saved;
                match items.len() {
                    0 => Expression::Literal(Vector::null()),
                    1 if !has_bindings => items.into_iter().next().unwrap(),
                    _ => Expression::Sequence(items),
                }
            }
            Expression::Let { bindings } => {
                // A bare Let outside a sequence scopes nothing; simplify its
                // bindings and keep whatever remains dynamic.
                let remaining = self.process_bindings(bindings, false);
                Expression::Let {
                    bindings: remaining,
                }
            }
            Expression::InlineLet { body, bindings } => self.inline_let(body, bindings),
            Expression::For {
                names,
                source,
                body,
            } => self.for_loop(names, source, body),
            Expression::IfElse { tests, else_ } => self.if_else(tests, else_.as_deref()),
            Expression::FunctionDef(def) => {
                let def = self.function_def(def);
                self.names
                    .insert(def.name.clone(), Some(StaticBinding::Function(def.clone())));
                Expression::FunctionDef(def)
            }
            Expression::Import { names, filename } => {
                let filename = Box::new(self.expr(filename));
                for name in names {
                    self.names.insert(name.clone(), None);
                }
                Expression::Import {
                    names: names.clone(),
                    filename,
                }
            }
            Expression::Pragma { name, expr } => Expression::Pragma {
                name: name.clone(),
                expr: Box::new(self.expr(expr)),
            },
            Expression::Search(query) => Expression::Search(query.clone()),
        }
    }

    fn name(&mut self, name: &Rc<str>) -> Expression {
        if let Some(binding) = self.names.get(name) {
            return match binding {
                None => Expression::Name(name.clone()),
                Some(StaticBinding::Value(value)) => Expression::Literal(value.copynodes()),
                // Substitute the alias target without re-resolving it: the
                // target may be shadowed later in the same binding list and
                // must keep referring to the outer name.
                Some(StaticBinding::Rename(target)) => Expression::Name(target.clone()),
                Some(StaticBinding::Function(_)) => Expression::FunctionName(name.clone()),
            };
        }
        if let Some(value) = builtins::static_value(name) {
            return Expression::Literal(value);
        }
        if let Some(def) = builtins::static_builtin(name) {
            return Expression::Literal(Vector::from(def));
        }
        if builtins::dynamic_builtin(name).is_some() {
            return Expression::Name(name.clone());
        }
        if let Some(sink) = self.unbound.last_mut() {
            sink.insert(name.clone());
            return Expression::Name(name.clone());
        }
        self.errors.insert(format!("Unbound name '{}'", name));
        Expression::Literal(Vector::null())
    }

    fn lookup(&mut self, key: &Expression) -> Expression {
        let key = self.expr(key);
        if let Expression::Literal(key_value) = &key {
            if let Some(state) = self.state {
                if state.contains(key_value) {
                    return Expression::Literal(state.get(key_value));
                }
            }
        }
        Expression::Lookup(Box::new(key))
    }

    fn range(&mut self, start: &Expression, stop: &Expression, step: &Expression) -> Expression {
        let start = self.expr(start);
        let stop = self.expr(stop);
        let step = self.expr(step);
        if let (Expression::Literal(a), Expression::Literal(b), Expression::Literal(c)) =
            (&start, &stop, &step)
        {
            return Expression::Literal(Vector::range(a, b, c));
        }
        Expression::Range {
            start: Box::new(start),
            stop: Box::new(stop),
            step: Box::new(step),
        }
    }

    fn unary(&mut self, op: UnaryOp, expr: &Expression) -> Expression {
        let inner = self.expr(expr);
        if let Expression::Literal(value) = &inner {
            let folded = match op {
                UnaryOp::Pos => value.pos(),
                UnaryOp::Neg => value.neg(),
                UnaryOp::Not => value.not_vec(),
                UnaryOp::Ceil => value.ceil(),
                UnaryOp::Floor => value.floor(),
                UnaryOp::Fract => value.fract(),
            };
            return Expression::Literal(folded);
        }
        match op {
            // Positive strips anything already known to be numeric.
            UnaryOp::Pos => match inner {
                Expression::Unary {
                    op: UnaryOp::Pos | UnaryOp::Neg,
                    ..
                }
                | Expression::Maths { .. } => inner,
                inner => Expression::unary(UnaryOp::Pos, inner),
            },
            UnaryOp::Neg => self.negative(inner),
            _ => Expression::unary(op, inner),
        }
    }

    /// Push a negation into an already-simplified operand.
    fn negative(&mut self, inner: Expression) -> Expression {
        match inner {
            Expression::Unary {
                op: UnaryOp::Neg,
                expr,
            } => self.expr(&Expression::unary(UnaryOp::Pos, (*expr).clone())),
            Expression::Maths { op, left, right } => {
                let (left, right) = (*left, *right);
                let rebuilt = match (op, &left, &right) {
                    (MathsOp::Multiply, Expression::Literal(lit), _) => Some(Expression::maths(
                        MathsOp::Multiply,
                        Expression::Literal(lit.neg()),
                        right.clone(),
                    )),
                    (MathsOp::Multiply, _, Expression::Literal(lit)) => Some(Expression::maths(
                        MathsOp::Multiply,
                        left.clone(),
                        Expression::Literal(lit.neg()),
                    )),
                    (MathsOp::Divide, Expression::Literal(lit), _) => Some(Expression::maths(
                        MathsOp::Divide,
                        Expression::Literal(lit.neg()),
                        right.clone(),
                    )),
                    (MathsOp::Add, Expression::Literal(lit), _) => Some(Expression::maths(
                        MathsOp::Subtract,
                        Expression::Literal(lit.neg()),
                        right.clone(),
                    )),
                    (MathsOp::Add, _, Expression::Literal(lit)) => Some(Expression::maths(
                        MathsOp::Subtract,
                        Expression::Literal(lit.neg()),
                        left.clone(),
                    )),
                    (MathsOp::Subtract, Expression::Literal(lit), _) => Some(Expression::maths(
                        MathsOp::Add,
                        Expression::Literal(lit.neg()),
                        right.clone(),
                    )),
                    (MathsOp::Subtract, _, Expression::Literal(lit)) => Some(Expression::maths(
                        MathsOp::Subtract,
                        Expression::Literal(lit.clone()),
                        left.clone(),
                    )),
                    _ => None,
                };
                match rebuilt {
                    Some(expr) => self.expr(&expr),
                    None => Expression::unary(
                        UnaryOp::Neg,
                        Expression::Maths {
                            op,
                            left: Box::new(left),
                            right: Box::new(right),
                        },
                    ),
                }
            }
            inner => Expression::unary(UnaryOp::Neg, inner),
        }
    }

    fn maths(&mut self, op: MathsOp, left: &Expression, right: &Expression) -> Expression {
        let left = self.expr(left);
        let right = self.expr(right);
        if let (Expression::Literal(a), Expression::Literal(b)) = (&left, &right) {
            let folded = match op {
                MathsOp::Add => a.add(b),
                MathsOp::Subtract => a.sub(b),
                MathsOp::Multiply => a.mul(b),
                MathsOp::Divide => a.truediv(b),
                MathsOp::FloorDivide => a.floordiv(b),
                MathsOp::Modulo => a.modulo(b),
                MathsOp::Power => a.pow(b),
            };
            return Expression::Literal(folded);
        }
        let one = Vector::from(1.0);
        let zero = Vector::from(0.0);
        match op {
            MathsOp::Add => {
                if matches!(&left, Expression::Literal(lit) if *lit == zero) {
                    return self.expr(&Expression::unary(UnaryOp::Pos, right));
                }
                if matches!(&right, Expression::Literal(lit) if *lit == zero) {
                    return self.expr(&Expression::unary(UnaryOp::Pos, left));
                }
                if let Expression::Unary {
                    op: UnaryOp::Neg,
                    expr,
                } = &right
                {
                    let rebuilt = Expression::maths(MathsOp::Subtract, left, (**expr).clone());
                    return self.expr(&rebuilt);
                }
                if let Expression::Unary {
                    op: UnaryOp::Neg,
                    expr,
                } = &left
                {
                    let rebuilt = Expression::maths(MathsOp::Subtract, right, (**expr).clone());
                    return self.expr(&rebuilt);
                }
                Expression::maths(op, left, right)
            }
            MathsOp::Subtract => {
                if matches!(&right, Expression::Literal(lit) if *lit == zero) {
                    return self.expr(&Expression::unary(UnaryOp::Pos, left));
                }
                if matches!(&left, Expression::Literal(lit) if *lit == zero) {
                    return self.expr(&Expression::unary(UnaryOp::Neg, right));
                }
                if let Expression::Unary {
                    op: UnaryOp::Neg,
                    expr,
                } = &right
                {
                    let rebuilt = Expression::maths(MathsOp::Add, left, (**expr).clone());
                    return self.expr(&rebuilt);
                }
                Expression::maths(op, left, right)
            }
            MathsOp::Multiply => self.multiply(left, right),
            MathsOp::Divide => {
                if let Expression::Literal(lit) = &right {
                    if *lit == one {
                        return self.expr(&Expression::unary(UnaryOp::Pos, left));
                    }
                    let inverse = one.truediv(lit);
                    if !inverse.is_empty() {
                        let rebuilt = Expression::maths(
                            MathsOp::Multiply,
                            Expression::Literal(inverse),
                            left,
                        );
                        return self.expr(&rebuilt);
                    }
                }
                Expression::maths(op, left, right)
            }
            MathsOp::FloorDivide => {
                if matches!(&right, Expression::Literal(lit) if *lit == one) {
                    return self.expr(&Expression::unary(UnaryOp::Floor, left));
                }
                Expression::maths(op, left, right)
            }
            MathsOp::Modulo => {
                if matches!(&right, Expression::Literal(lit) if *lit == one) {
                    return self.expr(&Expression::unary(UnaryOp::Fract, left));
                }
                Expression::maths(op, left, right)
            }
            MathsOp::Power => {
                if matches!(&right, Expression::Literal(lit) if *lit == one) {
                    return self.expr(&Expression::unary(UnaryOp::Pos, left));
                }
                Expression::maths(op, left, right)
            }
        }
    }

    fn multiply(&mut self, left: Expression, right: Expression) -> Expression {
        let one = Vector::from(1.0);
        let minus_one = Vector::minus_one();
        for (lit_side, other) in [(&left, &right), (&right, &left)] {
            let Expression::Literal(lit) = lit_side else {
                continue;
            };
            if *lit == one {
                return self.expr(&Expression::unary(UnaryOp::Pos, other.clone()));
            }
            if *lit == minus_one {
                return self.expr(&Expression::unary(UnaryOp::Neg, other.clone()));
            }
            // Propagate the literal through a half-literal subtree when
            // that creates more folding opportunities.
            let rebuilt = match other {
                Expression::Maths {
                    op: op @ (MathsOp::Add | MathsOp::Subtract),
                    left: a,
                    right: b,
                } => match (&**a, &**b) {
                    (Expression::Literal(known), _) => {
                        let scaled = Expression::Literal(lit.mul(known));
                        let grown = Expression::maths(
                            MathsOp::Multiply,
                            Expression::Literal(lit.clone()),
                            (**b).clone(),
                        );
                        Some(match op {
                            MathsOp::Add => Expression::maths(MathsOp::Add, grown, scaled),
                            _ => Expression::maths(MathsOp::Subtract, scaled, grown),
                        })
                    }
                    (_, Expression::Literal(known)) => {
                        let scaled = Expression::Literal(lit.mul(known));
                        let grown = Expression::maths(
                            MathsOp::Multiply,
                            Expression::Literal(lit.clone()),
                            (**a).clone(),
                        );
                        Some(match op {
                            MathsOp::Add => Expression::maths(MathsOp::Add, grown, scaled),
                            _ => Expression::maths(MathsOp::Subtract, grown, scaled),
                        })
                    }
                    _ => None,
                },
                Expression::Maths {
                    op: MathsOp::Multiply,
                    left: a,
                    right: b,
                } => match (&**a, &**b) {
                    (Expression::Literal(known), _) => Some(Expression::maths(
                        MathsOp::Multiply,
                        Expression::Literal(lit.mul(known)),
                        (**b).clone(),
                    )),
                    (_, Expression::Literal(known)) => Some(Expression::maths(
                        MathsOp::Multiply,
                        Expression::Literal(lit.mul(known)),
                        (**a).clone(),
                    )),
                    _ => None,
                },
                Expression::Maths {
                    op: MathsOp::Divide,
                    left: a,
                    right: b,
                } => match &**a {
                    Expression::Literal(known) => Some(Expression::maths(
                        MathsOp::Divide,
                        Expression::Literal(lit.mul(known)),
                        (**b).clone(),
                    )),
                    _ => None,
                },
                Expression::Unary {
                    op: UnaryOp::Neg,
                    expr,
                } => Some(Expression::maths(
                    MathsOp::Multiply,
                    Expression::Literal(lit.neg()),
                    (**expr).clone(),
                )),
                _ => None,
            };
            if let Some(rebuilt) = rebuilt {
                return self.expr(&rebuilt);
            }
        }
        Expression::maths(MathsOp::Multiply, left, right)
    }

    fn comparison(&mut self, op: CompareOp, left: &Expression, right: &Expression) -> Expression {
        let left = self.expr(left);
        let right = self.expr(right);
        if let (Expression::Literal(a), Expression::Literal(b)) = (&left, &right) {
            let result = match op {
                CompareOp::EqualTo => a.eq_vec(b),
                CompareOp::NotEqualTo => a.ne_vec(b),
                CompareOp::LessThan => {
                    Vector::boolean(a.compare(b) == Some(std::cmp::Ordering::Less))
                }
                CompareOp::GreaterThan => {
                    Vector::boolean(a.compare(b) == Some(std::cmp::Ordering::Greater))
                }
                CompareOp::LessThanOrEqualTo => Vector::boolean(matches!(
                    a.compare(b),
                    Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
                )),
                CompareOp::GreaterThanOrEqualTo => Vector::boolean(matches!(
                    a.compare(b),
                    Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
                )),
            };
            return Expression::Literal(result);
        }
        Expression::compare(op, left, right)
    }

    fn and(&mut self, left: &Expression, right: &Expression) -> Expression {
        let left = self.expr(left);
        if let Expression::Literal(value) = &left {
            return if value.truthy() {
                self.expr(right)
            } else {
                left
            };
        }
        let right = self.expr(right);
        Expression::And {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn or(&mut self, left: &Expression, right: &Expression) -> Expression {
        let left = self.expr(left);
        if let Expression::Literal(value) = &left {
            return if value.truthy() {
                left
            } else {
                self.expr(right)
            };
        }
        let right = self.expr(right);
        Expression::Or {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn xor(&mut self, left: &Expression, right: &Expression) -> Expression {
        let left = self.expr(left);
        let right = self.expr(right);
        match (&left, &right) {
            (Expression::Literal(a), Expression::Literal(b)) => {
                let folded = if !a.truthy() {
                    b.clone()
                } else if !b.truthy() {
                    a.clone()
                } else {
                    Vector::boolean(false)
                };
                Expression::Literal(folded)
            }
            (Expression::Literal(a), _) if !a.truthy() => right,
            (_, Expression::Literal(b)) if !b.truthy() => left,
            _ => Expression::Xor {
                left: Box::new(left),
                right: Box::new(right),
            },
        }
    }

    fn slice(&mut self, expr: &Expression, index: &Expression) -> Expression {
        let expr = self.expr(expr);
        let index = self.expr(index);
        match (expr, index) {
            (Expression::Literal(value), Expression::Literal(index)) => {
                Expression::Literal(value.slice(&index))
            }
            (expr, Expression::Literal(index)) => Expression::FastSlice {
                expr: Box::new(expr),
                index,
            },
            (expr, index) => Expression::Slice {
                expr: Box::new(expr),
                index: Box::new(index),
            },
        }
    }

    fn call(
        &mut self,
        function: &Expression,
        args: &[Expression],
        keywords: &[Binding],
    ) -> Expression {
        let function = self.expr(function);
        let args: Vec<Expression> = args.iter().map(|a| self.expr(a)).collect();
        let keywords: Vec<Binding> = keywords
            .iter()
            .map(|k| Binding {
                name: k.name.clone(),
                expr: self.expr(&k.expr),
            })
            .collect();
        if let Expression::FunctionName(name) = &function {
            if let Some(Some(StaticBinding::Function(def))) = self.names.get(name) {
                let def = def.clone();
                if let Some(inlined) = self.try_inline(&def, &args, &keywords) {
                    return inlined;
                }
            }
        }
        if let Expression::Literal(callables) = &function {
            if let Some(folded) = self.try_fold_call(callables, &args, &keywords) {
                return folded;
            }
        }
        Expression::Call {
            function: Box::new(function),
            args,
            keywords,
        }
    }

    fn try_inline(
        &mut self,
        def: &Rc<FunctionDef>,
        args: &[Expression],
        keywords: &[Binding],
    ) -> Option<Expression> {
        if def.captures || self.inline_depth >= self.limits.max_inline_depth {
            return None;
        }
        let all_literal = args.iter().all(|a| matches!(a, Expression::Literal(_)))
            && keywords
                .iter()
                .all(|k| matches!(k.expr, Expression::Literal(_)));
        if def.recursive && !all_literal {
            return None;
        }
        let mut bindings = Vec::with_capacity(def.parameters.len());
        for (i, parameter) in def.parameters.iter().enumerate() {
            let value = args
                .get(i)
                .cloned()
                .or_else(|| {
                    keywords
                        .iter()
                        .find(|k| k.name == parameter.name)
                        .map(|k| k.expr.clone())
                })
                .unwrap_or_else(|| parameter.expr.clone());
            bindings.push(PolyBinding {
                names: vec![parameter.name.clone()],
                expr: value,
            });
        }
        let inlined = Expression::InlineLet {
            body: Box::new(def.body.clone()),
            bindings,
        };
        self.inline_depth += 1;
        let simplified = self.expr(&inlined);
        self.inline_depth -= 1;
        Some(simplified)
    }

    fn try_fold_call(
        &mut self,
        callables: &Vector,
        args: &[Expression],
        keywords: &[Binding],
    ) -> Option<Expression> {
        if !keywords.is_empty() {
            return None;
        }
        let objects = callables.objects()?;
        let mut arg_values = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                Expression::Literal(value) => arg_values.push(value.clone()),
                _ => return None,
            }
        }
        let mut results = Vec::new();
        for object in objects {
            match object {
                crate::model::Object::Builtin(def) => match &def.kind {
                    builtins::BuiltinKind::Static(function) => {
                        results.push(function(&arg_values).ok()?)
                    }
                    builtins::BuiltinKind::Dynamic(_) => return None,
                },
                _ => return None,
            }
        }
        Some(Expression::Literal(Vector::compose(results)))
    }

    fn tag(&mut self, node: &Expression, tag: &Rc<str>) -> Expression {
        let node = self.expr(node);
        if let Expression::Literal(value) = node {
            let value = value.copynodes();
            for node in value.iter_nodes() {
                node.add_tag(tag);
            }
            return Expression::Literal(value);
        }
        Expression::Tag {
            node: Box::new(node),
            tag: tag.clone(),
        }
    }

    fn attributes(&mut self, node: &Expression, bindings: &[Binding]) -> Expression {
        let node = self.expr(node);
        // Attribute values may refer to sibling attributes through the node
        // scope, so unknown names here stay symbolic for the VM to resolve.
        self.unbound.push(IndexSet::new());
        let mut bindings: Vec<Binding> = bindings
            .iter()
            .map(|b| Binding {
                name: b.name.clone(),
                expr: self.expr(&b.expr),
            })
            .collect();
        self.unbound.pop();
        match node {
            Expression::Attributes {
                node: inner,
                bindings: mut inner_bindings,
            } => {
                inner_bindings.append(&mut bindings);
                Expression::Attributes {
                    node: inner,
                    bindings: inner_bindings,
                }
            }
            Expression::Literal(value) => {
                let value = value.copynodes();
                let mut remaining = Vec::new();
                let mut folding = true;
                for binding in bindings {
                    match (&binding.expr, folding) {
                        (Expression::Literal(attribute), true) => {
                            for node in value.iter_nodes() {
                                node.set_attribute(&binding.name, attribute.clone());
                            }
                        }
                        _ => {
                            folding = false;
                            remaining.push(binding);
                        }
                    }
                }
                if remaining.is_empty() {
                    Expression::Literal(value)
                } else {
                    Expression::Attributes {
                        node: Box::new(Expression::Literal(value)),
                        bindings: remaining,
                    }
                }
            }
            node => Expression::Attributes {
                node: Box::new(node),
                bindings,
            },
        }
    }

    fn append(&mut self, node: &Expression, children: &Expression) -> Expression {
        let node = self.expr(node);
        let children = self.expr(children);
        match (node, children) {
            (Expression::Literal(parents), Expression::Literal(child_values)) => {
                Expression::Literal(append_literal(&parents, &child_values))
            }
            // Push a literal append through an intermediate attribute
            // operation onto a literal root.
            (
                Expression::Attributes { node, bindings },
                children @ Expression::Literal(_),
            ) if matches!(node.as_ref(), Expression::Literal(_)) => {
                let inner = self.append(&node, &children);
                Expression::Attributes {
                    node: Box::new(inner),
                    bindings,
                }
            }
            // Pull a literal head out of an appended sequence.
            (Expression::Literal(parents), Expression::Sequence(mut items))
                if matches!(items.first(), Some(Expression::Literal(_))) =>
            {
                let Expression::Literal(head) = items.remove(0) else {
                    unreachable!()
                };
                let parents = append_literal(&parents, &head);
                let children = match items.len() {
                    1 => items.pop().unwrap(),
                    _ => Expression::Sequence(items),
                };
                Expression::Append {
                    node: Box::new(Expression::Literal(parents)),
                    children: Box::new(children),
                }
            }
            (node, children) => Expression::Append {
                node: Box::new(node),
                children: Box::new(children),
            },
        }
    }

    fn prepend(&mut self, node: &Expression, children: &Expression) -> Expression {
        let node = self.expr(node);
        let children = self.expr(children);
        match (node, children) {
            (Expression::Literal(parents), Expression::Literal(child_values)) => {
                let parents = parents.copynodes();
                let parent_nodes: Vec<_> = parents.iter_nodes().cloned().collect();
                let children: Vec<_> = child_values.iter_nodes().cloned().collect();
                for (i, parent) in parent_nodes.iter().enumerate() {
                    let last = i + 1 == parent_nodes.len();
                    for child in children.iter().rev() {
                        let child = if last { child.clone() } else { child.copy() };
                        parent.insert(child);
                    }
                }
                Expression::Literal(parents)
            }
            (node, children) => Expression::Prepend {
                node: Box::new(node),
                children: Box::new(children),
            },
        }
    }

    fn inline_let(&mut self, body: &Expression, bindings: &[PolyBinding]) -> Expression {
        let saved = self.names.clone();
        let remaining = self.process_bindings(bindings, false);
        let body = self.expr(body);
        self.names = saved;
        let remaining = prune_dead_bindings(remaining, &body);
        if remaining.is_empty() {
            body
        } else {
            Expression::InlineLet {
                body: Box::new(body),
                bindings: remaining,
            }
        }
    }

    /// Process a binding list in order, updating the environment. Returns
    /// the bindings that stay dynamic (plus any materialised renames).
    /// With `keep_static`, statically-consumed bindings are re-emitted with
    /// their folded right-hand sides (used at the top level, where locals
    /// become globals).
    fn process_bindings(
        &mut self,
        bindings: &[PolyBinding],
        keep_static: bool,
    ) -> Vec<PolyBinding> {
        let mut out = Vec::new();
        for binding in bindings {
            let expr = self.expr(&binding.expr);
            match &expr {
                Expression::Literal(value) => {
                    if binding.names.len() == 1 {
                        self.names.insert(
                            binding.names[0].clone(),
                            Some(StaticBinding::Value(value.clone())),
                        );
                    } else {
                        for (i, name) in binding.names.iter().enumerate() {
                            self.names.insert(
                                name.clone(),
                                Some(StaticBinding::Value(value.item_wrapped(i))),
                            );
                        }
                    }
                    if keep_static {
                        out.push(PolyBinding {
                            names: binding.names.clone(),
                            expr,
                        });
                    }
                }
                Expression::Name(target) if binding.names.len() == 1 => {
                    self.names.insert(
                        binding.names[0].clone(),
                        Some(StaticBinding::Rename(target.clone())),
                    );
                    if keep_static {
                        out.push(PolyBinding {
                            names: binding.names.clone(),
                            expr,
                        });
                    }
                }
                Expression::FunctionName(target) if binding.names.len() == 1 => {
                    let target_binding = self.names.get(target).cloned().flatten();
                    self.names.insert(binding.names[0].clone(), target_binding);
                    if keep_static {
                        out.push(PolyBinding {
                            names: binding.names.clone(),
                            expr,
                        });
                    }
                }
                _ => {
                    // This binding stays dynamic: any alias pointing at a
                    // name it shadows must be materialised first so the
                    // alias keeps referring to the outer value.
                    for name in &binding.names {
                        let aliases: Vec<Rc<str>> = self
                            .names
                            .iter()
                            .filter_map(|(alias, b)| match b {
                                Some(StaticBinding::Rename(target)) if target == name => {
                                    Some(alias.clone())
                                }
                                _ => None,
                            })
                            .collect();
                        for alias in aliases {
                            out.push(PolyBinding {
                                names: vec![alias.clone()],
                                expr: Expression::Name(name.clone()),
                            });
                            self.names.insert(alias, None);
                        }
                    }
                    for name in &binding.names {
                        self.names.insert(name.clone(), None);
                    }
                    out.push(PolyBinding {
                        names: binding.names.clone(),
                        expr,
                    });
                }
            }
        }
        out
    }

    fn for_loop(
        &mut self,
        names: &[Rc<str>],
        source: &Expression,
        body: &Expression,
    ) -> Expression {
        let source = self.expr(source);
        if let Expression::Literal(values) = &source {
            if !names.is_empty() {
                let iterations = values.len().div_ceil(names.len());
                if iterations <= self.limits.max_unroll {
                    let saved = self.names.clone();
                    let mut parts = Vec::with_capacity(iterations);
                    let mut index = 0usize;
                    for _ in 0..iterations {
                        for (j, name) in names.iter().enumerate() {
                            let value = values.item((index + j) as i64);
                            self.names
                                .insert(name.clone(), Some(StaticBinding::Value(value)));
                        }
                        parts.push(self.expr(body));
                        index += names.len();
                    }
                    self.names = saved;
                    return self.expr(&Expression::Sequence(parts));
                }
            }
        }
        let saved = self.names.clone();
        for name in names {
            self.names.insert(name.clone(), None);
        }
        let body = self.expr(body);
        self.names = saved;
        Expression::For {
            names: names.to_vec(),
            source: Box::new(source),
            body: Box::new(body),
        }
    }

    fn if_else(&mut self, tests: &[IfCondition], else_: Option<&Expression>) -> Expression {
        let mut out_tests: Vec<IfCondition> = Vec::new();
        for test in tests {
            let condition = self.expr(&test.condition);
            if let Expression::Literal(value) = &condition {
                if value.truthy() {
                    let then = self.expr(&test.then);
                    if out_tests.is_empty() {
                        return then;
                    }
                    return Expression::IfElse {
                        tests: out_tests,
                        else_: Some(Box::new(then)),
                    };
                }
                continue;
            }
            let then = self.expr(&test.then);
            out_tests.push(IfCondition { condition, then });
        }
        let else_ = else_.map(|e| self.expr(e));
        if out_tests.is_empty() {
            return else_.unwrap_or(Expression::Literal(Vector::null()));
        }
        Expression::IfElse {
            tests: out_tests,
            else_: else_.map(Box::new),
        }
    }

    fn function_def(&mut self, def: &Rc<FunctionDef>) -> Rc<FunctionDef> {
        let saved = self.names.clone();
        let mut parameters = Vec::with_capacity(def.parameters.len());
        for parameter in &def.parameters {
            parameters.push(Binding {
                name: parameter.name.clone(),
                expr: self.expr(&parameter.expr),
            });
        }
        self.names.insert(def.name.clone(), None);
        for parameter in &parameters {
            self.names.insert(parameter.name.clone(), None);
        }
        self.unbound.push(IndexSet::new());
        let body = self.expr(&def.body);
        let unbound = self.unbound.pop().unwrap_or_default();
        let mut captures = !unbound.is_empty();
        if !captures {
            for (name, binding) in &self.names {
                if binding.is_some()
                    || *name == def.name
                    || parameters.iter().any(|p| p.name == *name)
                {
                    continue;
                }
                if references_name(&body, name) {
                    captures = true;
                    break;
                }
            }
        }
        let recursive = references_name(&body, &def.name);
        self.names = saved;
        Rc::new(FunctionDef {
            name: def.name.clone(),
            parameters,
            body,
            captures,
            recursive,
        })
    }

    /// Shared sequence walk: scopes `Let`/`Import`/`FunctionDef` bindings
    /// over the remaining items, flattens nested binding-free sequences and
    /// merges adjacent literals. Returns the items and whether any binding
    /// forms remain.
    fn sequence_items(
        &mut self,
        items: &[Expression],
        top_level: bool,
    ) -> (Vec<Expression>, bool) {
        let mut out: Vec<Expression> = Vec::with_capacity(items.len());
        let mut has_bindings = false;
        for item in items {
            match item {
                Expression::Let { bindings } => {
                    let remaining = self.process_bindings(bindings, top_level);
                    if !remaining.is_empty() {
                        out.push(Expression::Let {
                            bindings: remaining,
                        });
                        has_bindings = true;
                    }
                }
                Expression::Import { .. } | Expression::FunctionDef(_) => {
                    out.push(self.expr(item));
                    has_bindings = true;
                }
                item => {
                    let simplified = self.expr(item);
                    match simplified {
                        Expression::Sequence(inner)
                            if !inner.iter().any(Expression::is_sequence_binding) =>
                        {
                            for inner_item in inner {
                                push_merging(&mut out, inner_item);
                            }
                        }
                        simplified => push_merging(&mut out, simplified),
                    }
                }
            }
        }
        if !top_level {
            prune_dead_lets(&mut out);
            has_bindings = out.iter().any(Expression::is_sequence_binding);
        }
        (out, has_bindings)
    }
}

/// Append literal children to literal parents: every parent receives the
/// children, the last parent taking the originals and earlier parents
/// copies. Non-node elements on either side are ignored.
fn append_literal(parents: &Vector, children: &Vector) -> Vector {
    let parents = parents.copynodes();
    let parent_nodes: Vec<_> = parents.iter_nodes().cloned().collect();
    for (i, parent) in parent_nodes.iter().enumerate() {
        let last = i + 1 == parent_nodes.len();
        for child in children.iter_nodes() {
            let child = if last { child.clone() } else { child.copy() };
            parent.append(child);
        }
    }
    parents
}

fn push_merging(out: &mut Vec<Expression>, item: Expression) {
    if let (Some(Expression::Literal(previous)), Expression::Literal(value)) =
        (out.last_mut(), &item)
    {
        *previous = Vector::compose(vec![previous.clone(), value.clone()]);
        return;
    }
    out.push(item);
}

/// Drop bindings whose names are not referenced by the body or by a later
/// binding in the same list.
fn prune_dead_bindings(bindings: Vec<PolyBinding>, body: &Expression) -> Vec<PolyBinding> {
    let mut kept: Vec<PolyBinding> = Vec::with_capacity(bindings.len());
    for (i, binding) in bindings.iter().enumerate() {
        let used = binding.names.iter().any(|name| {
            references_name(body, name)
                || bindings[i + 1..]
                    .iter()
                    .any(|later| references_name(&later.expr, name))
        });
        if used {
            kept.push(binding.clone());
        }
    }
    kept
}

/// Drop `Let` bindings in a sequence whose names no later item references.
fn prune_dead_lets(items: &mut Vec<Expression>) {
    let mut index = 0;
    while index < items.len() {
        if let Expression::Let { bindings } = &items[index] {
            let rest = &items[index + 1..];
            let kept: Vec<PolyBinding> = bindings
                .iter()
                .filter(|binding| {
                    binding
                        .names
                        .iter()
                        .any(|name| rest.iter().any(|item| references_name(item, name)))
                })
                .cloned()
                .collect();
            if kept.is_empty() {
                items.remove(index);
                continue;
            }
            items[index] = Expression::Let { bindings: kept };
        }
        index += 1;
    }
}
