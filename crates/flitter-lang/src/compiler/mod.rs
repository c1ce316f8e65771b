//! AST to instruction lowering
//!
//! Compiles a simplified expression tree to a linear instruction list. The
//! compiler maintains a compile-time stack of local-variable names (`lvars`)
//! so that name references become local loads by depth wherever possible,
//! falling back to runtime name resolution otherwise. Forward control flow
//! is emitted against symbolic labels resolved by the linker.

pub mod instructions;
pub mod optimize;

use std::path::Path;
use std::rc::Rc;

use crate::compiler::instructions::Instruction;
use crate::compiler::optimize::{link, optimize};
use crate::model::Vector;
use crate::tree::{
    Binding, CompareOp, Expression, FunctionDef, IfCondition, MathsOp, PolyBinding, Top, UnaryOp,
};
use crate::vm::Program;

impl Top {
    /// Compile to an optimised, linked program. Top-level expressions
    /// attach to the graph root; top-level bindings become globals.
    pub fn compile(&self) -> Program {
        let mut compiler = Compiler::new(self.path.clone());
        for expr in &self.body {
            match expr {
                Expression::Let { bindings } => compiler.let_bindings(bindings),
                Expression::Import { names, filename } => compiler.import(names, filename),
                Expression::FunctionDef(def) => compiler.function_def(def),
                Expression::Pragma { name, expr } => {
                    compiler.expr(expr);
                    compiler.emit(Instruction::Pragma(name.clone()));
                }
                expr => {
                    compiler.expr(expr);
                    compiler.emit(Instruction::AppendRoot);
                }
            }
        }
        let locals = compiler.lvars.clone();
        for (i, name) in locals.iter().enumerate() {
            compiler.emit(Instruction::LocalLoad(locals.len() - 1 - i));
            compiler.emit(Instruction::StoreGlobal(name.clone()));
        }
        if !locals.is_empty() {
            compiler.emit(Instruction::LocalDrop(locals.len()));
        }
        let instructions = link(optimize(compiler.instructions));
        Program::new(instructions, self.path.clone()).with_top(Rc::new(self.clone()))
    }
}

struct Compiler {
    instructions: Vec<Instruction>,
    lvars: Vec<Rc<str>>,
    next_label: usize,
    path: Option<Rc<Path>>,
}

impl Compiler {
    fn new(path: Option<Rc<Path>>) -> Compiler {
        Compiler {
            instructions: Vec::new(),
            lvars: Vec::new(),
            next_label: 0,
            path,
        }
    }

    fn emit(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    fn label(&mut self) -> usize {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    fn expr(&mut self, expr: &Expression) {
        match expr {
            Expression::Literal(value) => {
                if value.has_nodes() {
                    self.emit(Instruction::LiteralNode(value.clone()));
                } else {
                    self.emit(Instruction::Literal(value.clone().intern()));
                }
            }
            Expression::Name(name) | Expression::FunctionName(name) => {
                match self.lvars.iter().rposition(|lvar| lvar == name) {
                    Some(position) => {
                        self.emit(Instruction::LocalLoad(self.lvars.len() - 1 - position))
                    }
                    None => self.emit(Instruction::Name(name.clone())),
                }
            }
            Expression::Lookup(key) => match key.as_ref() {
                Expression::Literal(value) => {
                    self.emit(Instruction::LookupLiteral(value.clone().intern()))
                }
                key => {
                    self.expr(key);
                    self.emit(Instruction::Lookup);
                }
            },
            Expression::Range { start, stop, step } => {
                self.expr(start);
                self.expr(stop);
                self.expr(step);
                self.emit(Instruction::Range);
            }
            Expression::Unary { op, expr } => {
                self.expr(expr);
                self.emit(match op {
                    UnaryOp::Pos => Instruction::Pos,
                    UnaryOp::Neg => Instruction::Neg,
                    UnaryOp::Not => Instruction::Not,
                    UnaryOp::Ceil => Instruction::Ceil,
                    UnaryOp::Floor => Instruction::Floor,
                    UnaryOp::Fract => Instruction::Fract,
                });
            }
            Expression::Maths { op, left, right } => {
                self.expr(left);
                self.expr(right);
                self.emit(match op {
                    MathsOp::Add => Instruction::Add,
                    MathsOp::Subtract => Instruction::Sub,
                    MathsOp::Multiply => Instruction::Mul,
                    MathsOp::Divide => Instruction::TrueDiv,
                    MathsOp::FloorDivide => Instruction::FloorDiv,
                    MathsOp::Modulo => Instruction::Mod,
                    MathsOp::Power => Instruction::Pow,
                });
            }
            Expression::Compare { op, left, right } => {
                self.expr(left);
                self.expr(right);
                self.emit(match op {
                    CompareOp::EqualTo => Instruction::Eq,
                    CompareOp::NotEqualTo => Instruction::Ne,
                    CompareOp::LessThan => Instruction::Lt,
                    CompareOp::GreaterThan => Instruction::Gt,
                    CompareOp::LessThanOrEqualTo => Instruction::Le,
                    CompareOp::GreaterThanOrEqualTo => Instruction::Ge,
                });
            }
            Expression::And { left, right } => self.short_circuit(left, right, false),
            Expression::Or { left, right } => self.short_circuit(left, right, true),
            Expression::Xor { left, right } => {
                self.expr(left);
                self.expr(right);
                self.emit(Instruction::Xor);
            }
            Expression::Slice { expr, index } => {
                self.expr(expr);
                self.expr(index);
                self.emit(Instruction::Slice);
            }
            Expression::FastSlice { expr, index } => {
                self.expr(expr);
                match single_integral(index) {
                    Some(i) => self.emit(Instruction::IndexLiteral(i)),
                    None => self.emit(Instruction::SliceLiteral(index.clone().intern())),
                }
            }
            Expression::Call {
                function,
                args,
                keywords,
            } => self.call(function, args, keywords),
            Expression::Tag { node, tag } => {
                self.expr(node);
                self.emit(Instruction::Tag(tag.clone()));
            }
            Expression::Attributes { node, bindings } => self.attributes(node, bindings),
            Expression::Append { node, children } => {
                self.expr(node);
                self.expr(children);
                self.emit(Instruction::Append(1));
            }
            Expression::Prepend { node, children } => {
                self.expr(node);
                self.expr(children);
                self.emit(Instruction::Prepend);
            }
            Expression::Sequence(items) => self.sequence(items),
            Expression::Let { bindings } => {
                // A bare Let produces no value; scoping is handled by the
                // enclosing sequence.
                self.let_bindings(bindings);
                self.emit(Instruction::Literal(Vector::null()));
            }
            Expression::InlineLet { body, bindings } => {
                let base = self.lvars.len();
                self.let_bindings(bindings);
                self.expr(body);
                let count = self.lvars.len() - base;
                if count > 0 {
                    self.emit(Instruction::LocalDrop(count));
                    self.lvars.truncate(base);
                }
            }
            Expression::For {
                names,
                source,
                body,
            } => self.for_loop(names, source, body),
            Expression::IfElse { tests, else_ } => self.if_else(tests, else_.as_deref()),
            Expression::FunctionDef(def) => {
                self.function_def(def);
                self.emit(Instruction::Literal(Vector::null()));
            }
            Expression::Import { names, filename } => {
                self.import(names, filename);
                self.emit(Instruction::Literal(Vector::null()));
            }
            Expression::Pragma { name, expr } => {
                self.expr(expr);
                self.emit(Instruction::Pragma(name.clone()));
                self.emit(Instruction::Literal(Vector::null()));
            }
            Expression::Search(query) => self.emit(Instruction::Search(query.clone())),
        }
    }

    fn short_circuit(&mut self, left: &Expression, right: &Expression, on_true: bool) {
        self.expr(left);
        let end = self.label();
        self.emit(Instruction::Dup);
        if on_true {
            self.emit(Instruction::BranchTrue { label: end, offset: 0 });
        } else {
            self.emit(Instruction::BranchFalse { label: end, offset: 0 });
        }
        self.emit(Instruction::Drop(1));
        self.expr(right);
        self.emit(Instruction::Label(end));
    }

    fn call(&mut self, function: &Expression, args: &[Expression], keywords: &[Binding]) {
        for arg in args {
            self.expr(arg);
        }
        if keywords.is_empty() {
            if let Expression::Literal(value) = function {
                if let Some([object]) = value.objects() {
                    if object.is_callable() {
                        self.emit(Instruction::CallFast {
                            function: object.clone(),
                            args: args.len(),
                        });
                        return;
                    }
                }
            }
        }
        for keyword in keywords {
            self.expr(&keyword.expr);
        }
        self.expr(function);
        self.emit(Instruction::Call {
            args: args.len(),
            keywords: keywords.iter().map(|k| k.name.clone()).collect(),
        });
    }

    fn attributes(&mut self, node: &Expression, bindings: &[Binding]) {
        self.expr(node);
        self.emit(Instruction::BeginFor);
        let start = self.label();
        let end = self.label();
        self.emit(Instruction::Label(start));
        self.emit(Instruction::PushNext { label: end, offset: 0 });
        self.emit(Instruction::SetNodeScope);
        for binding in bindings {
            self.expr(&binding.expr);
            self.emit(Instruction::Attribute(binding.name.clone()));
        }
        self.emit(Instruction::ClearNodeScope);
        self.emit(Instruction::Jump { label: start, offset: 0 });
        self.emit(Instruction::Label(end));
        self.emit(Instruction::EndForCompose);
    }

    fn sequence(&mut self, items: &[Expression]) {
        let base = self.lvars.len();
        let mut values = 0usize;
        for item in items {
            match item {
                Expression::Let { bindings } => self.let_bindings(bindings),
                Expression::Import { names, filename } => self.import(names, filename),
                Expression::FunctionDef(def) => self.function_def(def),
                item => {
                    self.expr(item);
                    values += 1;
                }
            }
        }
        match values {
            0 => self.emit(Instruction::Literal(Vector::null())),
            1 => {}
            values => self.emit(Instruction::Compose(values)),
        }
        let count = self.lvars.len() - base;
        if count > 0 {
            self.emit(Instruction::LocalDrop(count));
            self.lvars.truncate(base);
        }
    }

    fn let_bindings(&mut self, bindings: &[PolyBinding]) {
        for binding in bindings {
            self.expr(&binding.expr);
            let names: Rc<[Rc<str>]> = binding.names.clone().into();
            self.emit(Instruction::LocalPush(names));
            self.lvars.extend(binding.names.iter().cloned());
        }
    }

    fn import(&mut self, names: &[Rc<str>], filename: &Expression) {
        self.expr(filename);
        self.emit(Instruction::Import {
            names: names.to_vec().into(),
        });
        self.lvars.extend(names.iter().cloned());
    }

    fn function_def(&mut self, def: &Rc<FunctionDef>) {
        // The body is compiled as a nested program against the current
        // local scope extended with the parameters; the runtime snapshot
        // taken by Func lines the locals stack up with these depths.
        let mut inner = Compiler::new(self.path.clone());
        inner.lvars = self.lvars.clone();
        inner
            .lvars
            .extend(def.parameters.iter().map(|p| p.name.clone()));
        inner.next_label = self.next_label;
        inner.expr(&def.body);
        let body = Program::new(link(optimize(inner.instructions)), self.path.clone());
        self.emit(Instruction::Literal(Vector::from(Rc::new(body))));
        for parameter in &def.parameters {
            self.expr(&parameter.expr);
        }
        self.emit(Instruction::Func {
            name: def.name.clone(),
            parameters: def.parameters.iter().map(|p| p.name.clone()).collect(),
        });
        let names: Rc<[Rc<str>]> = vec![def.name.clone()].into();
        self.emit(Instruction::LocalPush(names));
        self.lvars.push(def.name.clone());
    }

    fn for_loop(&mut self, names: &[Rc<str>], source: &Expression, body: &Expression) {
        self.expr(source);
        self.emit(Instruction::BeginFor);
        for name in names {
            self.emit(Instruction::Literal(Vector::null()));
            let single: Rc<[Rc<str>]> = vec![name.clone()].into();
            self.emit(Instruction::LocalPush(single));
            self.lvars.push(name.clone());
        }
        let start = self.label();
        let end = self.label();
        self.emit(Instruction::Label(start));
        self.emit(Instruction::Next {
            names: names.len(),
            label: end,
            offset: 0,
        });
        self.expr(body);
        self.emit(Instruction::Jump { label: start, offset: 0 });
        self.emit(Instruction::Label(end));
        self.emit(Instruction::EndForCompose);
        if !names.is_empty() {
            self.emit(Instruction::LocalDrop(names.len()));
            self.lvars.truncate(self.lvars.len() - names.len());
        }
    }

    fn if_else(&mut self, tests: &[IfCondition], else_: Option<&Expression>) {
        let end = self.label();
        for test in tests {
            self.expr(&test.condition);
            let next = self.label();
            self.emit(Instruction::BranchFalse { label: next, offset: 0 });
            self.expr(&test.then);
            self.emit(Instruction::Jump { label: end, offset: 0 });
            self.emit(Instruction::Label(next));
        }
        match else_ {
            Some(else_) => self.expr(else_),
            None => self.emit(Instruction::Literal(Vector::null())),
        }
        self.emit(Instruction::Label(end));
    }
}

fn single_integral(index: &Vector) -> Option<i64> {
    let n = index.as_f64()?;
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        Some(n as i64)
    } else {
        None
    }
}
