//! Virtual machine
//!
//! Executes a linked instruction list against a value stack, a locals
//! stack and a loop stack, producing a [`Context`] holding the scene graph
//! and global bindings for one frame. Execution is single-threaded and
//! deterministic; recoverable language errors are recorded in the context
//! while stack-discipline violations abort the run.

pub mod function;
pub mod loader;

use std::fmt;
use std::path::Path;
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::builtins::{self, BuiltinKind};
use crate::compiler::instructions::Instruction;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::model::{search, Node, Object, StateDict, Vector};
use crate::tree::Top;
use crate::vm::function::Function;
use crate::vm::loader::SourceLoader;

/// Initial value-stack capacity for a top-level run.
const STACK_CAPACITY: usize = 256;

/// A named local binding.
#[derive(Debug, Clone)]
pub struct Local {
    pub name: Rc<str>,
    pub value: Vector,
}

/// An open `for` loop: the source vector, the read position and the number
/// of iterations completed so far.
struct LoopFrame {
    source: Vector,
    position: usize,
    count: usize,
}

/// An immutable, linked program ready for execution.
pub struct Program {
    instructions: Vec<Instruction>,
    path: Option<Rc<Path>>,
    top: Option<Rc<Top>>,
}

impl Program {
    pub fn new(instructions: Vec<Instruction>, path: Option<Rc<Path>>) -> Program {
        Program {
            instructions,
            path,
            top: None,
        }
    }

    pub fn with_top(mut self, top: Rc<Top>) -> Program {
        self.top = Some(top);
        self
    }

    pub fn set_top(&mut self, top: Rc<Top>) {
        self.top = Some(top);
    }

    pub fn set_path(&mut self, path: Rc<Path>) {
        self.path = Some(path);
    }

    pub fn path(&self) -> Option<&Rc<Path>> {
        self.path.as_ref()
    }

    /// The partially-evaluated tree this program was compiled from, kept
    /// for diagnostics and re-compilation.
    pub fn top(&self) -> Option<&Rc<Top>> {
        self.top.as_ref()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Execute one frame without import support.
    pub fn run(&self, state: StateDict, variables: IndexMap<Rc<str>, Vector>) -> Result<Context> {
        self.run_internal(state, variables, None)
    }

    /// Execute one frame, resolving `Import` instructions through the
    /// given loader.
    pub fn run_with_loader(
        &self,
        state: StateDict,
        variables: IndexMap<Rc<str>, Vector>,
        loader: &mut dyn SourceLoader,
    ) -> Result<Context> {
        self.run_internal(state, variables, Some(loader))
    }

    fn run_internal(
        &self,
        state: StateDict,
        variables: IndexMap<Rc<str>, Vector>,
        loader: Option<&mut dyn SourceLoader>,
    ) -> Result<Context> {
        let mut context = Context::new(state, self.path.clone());
        context.names = variables;
        let mut machine = Machine {
            context: &mut context,
            loader,
            node_scopes: Vec::new(),
        };
        let mut locals: Vec<Local> = Vec::new();
        let stack = self.execute(&mut machine, &mut locals, STACK_CAPACITY)?;
        drop(machine);
        if !stack.is_empty() || !locals.is_empty() {
            return Err(self.internal(
                self.instructions.len(),
                format!(
                    "run ended with {} stack values and {} locals",
                    stack.len(),
                    locals.len()
                ),
            ));
        }
        trace!(
            target: "flitter",
            nodes = context.graph.child_count(),
            globals = context.names.len(),
            errors = context.errors.len(),
            "run complete"
        );
        Ok(context)
    }

    fn execute(
        &self,
        machine: &mut Machine<'_, '_>,
        locals: &mut Vec<Local>,
        capacity: usize,
    ) -> Result<Vec<Vector>> {
        let mut stack: Vec<Vector> = Vec::with_capacity(capacity);
        let mut loops: Vec<LoopFrame> = Vec::new();
        let mut pc = 0usize;
        macro_rules! pop {
            () => {
                match stack.pop() {
                    Some(value) => value,
                    None => return Err(self.internal(pc, "value stack underflow".to_string())),
                }
            };
        }
        macro_rules! pop_many {
            ($count:expr) => {{
                let count = $count;
                if stack.len() < count {
                    return Err(self.internal(pc, "value stack underflow".to_string()));
                }
                stack.split_off(stack.len() - count)
            }};
        }
        macro_rules! jump {
            ($offset:expr) => {{
                let target = pc as isize + $offset;
                if target < 0 || target as usize > self.instructions.len() {
                    return Err(Error::JumpOutOfBounds { pc: pc - 1 });
                }
                pc = target as usize;
            }};
        }
        while pc < self.instructions.len() {
            let instruction = &self.instructions[pc];
            pc += 1;
            match instruction {
                Instruction::Literal(value) => stack.push(value.clone()),
                Instruction::LiteralNode(value) => stack.push(value.copynodes()),
                Instruction::Dup => {
                    let Some(top) = stack.last() else {
                        return Err(self.internal(pc, "value stack underflow".to_string()));
                    };
                    stack.push(top.clone());
                }
                Instruction::Drop(count) => {
                    let _ = pop_many!(*count);
                }
                Instruction::Label(label) => return Err(Error::UnlinkedLabel { label: *label }),
                Instruction::Jump { offset, .. } => jump!(*offset),
                Instruction::BranchTrue { offset, .. } => {
                    if pop!().truthy() {
                        jump!(*offset);
                    }
                }
                Instruction::BranchFalse { offset, .. } => {
                    if !pop!().truthy() {
                        jump!(*offset);
                    }
                }
                Instruction::Pragma(name) => {
                    let value = pop!();
                    machine.context.pragmas.insert(name.clone(), value);
                }
                Instruction::Import { names } => {
                    let filename = pop!();
                    self.import(machine, locals, names, &filename)?;
                }
                Instruction::Name(name) => {
                    let value = resolve_name(machine, locals, name);
                    stack.push(value);
                }
                Instruction::Lookup => {
                    let key = pop!();
                    stack.push(machine.context.state.get(&key));
                }
                Instruction::LookupLiteral(key) => stack.push(machine.context.state.get(key)),
                Instruction::Range => {
                    let step = pop!();
                    let stop = pop!();
                    let start = pop!();
                    stack.push(Vector::range(&start, &stop, &step));
                }
                Instruction::Neg => {
                    let value = pop!();
                    stack.push(value.neg());
                }
                Instruction::Pos => {
                    let value = pop!();
                    stack.push(value.pos());
                }
                Instruction::Not => {
                    let value = pop!();
                    stack.push(value.not_vec());
                }
                Instruction::Ceil => {
                    let value = pop!();
                    stack.push(value.ceil());
                }
                Instruction::Floor => {
                    let value = pop!();
                    stack.push(value.floor());
                }
                Instruction::Fract => {
                    let value = pop!();
                    stack.push(value.fract());
                }
                Instruction::Add => {
                    let right = pop!();
                    let left = pop!();
                    stack.push(left.add(&right));
                }
                Instruction::Sub => {
                    let right = pop!();
                    let left = pop!();
                    stack.push(left.sub(&right));
                }
                Instruction::Mul => {
                    let right = pop!();
                    let left = pop!();
                    stack.push(left.mul(&right));
                }
                Instruction::MulAdd => {
                    let add = pop!();
                    let mul = pop!();
                    let value = pop!();
                    stack.push(value.mul_add(&mul, &add));
                }
                Instruction::TrueDiv => {
                    let right = pop!();
                    let left = pop!();
                    stack.push(left.truediv(&right));
                }
                Instruction::FloorDiv => {
                    let right = pop!();
                    let left = pop!();
                    stack.push(left.floordiv(&right));
                }
                Instruction::Mod => {
                    let right = pop!();
                    let left = pop!();
                    stack.push(left.modulo(&right));
                }
                Instruction::Pow => {
                    let right = pop!();
                    let left = pop!();
                    stack.push(left.pow(&right));
                }
                Instruction::Eq => {
                    let right = pop!();
                    let left = pop!();
                    stack.push(left.eq_vec(&right));
                }
                Instruction::Ne => {
                    let right = pop!();
                    let left = pop!();
                    stack.push(left.ne_vec(&right));
                }
                Instruction::Lt => {
                    let right = pop!();
                    let left = pop!();
                    stack.push(Vector::boolean(
                        left.compare(&right) == Some(std::cmp::Ordering::Less),
                    ));
                }
                Instruction::Gt => {
                    let right = pop!();
                    let left = pop!();
                    stack.push(Vector::boolean(
                        left.compare(&right) == Some(std::cmp::Ordering::Greater),
                    ));
                }
                Instruction::Le => {
                    let right = pop!();
                    let left = pop!();
                    stack.push(Vector::boolean(matches!(
                        left.compare(&right),
                        Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
                    )));
                }
                Instruction::Ge => {
                    let right = pop!();
                    let left = pop!();
                    stack.push(Vector::boolean(matches!(
                        left.compare(&right),
                        Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
                    )));
                }
                Instruction::Xor => {
                    let right = pop!();
                    let left = pop!();
                    let result = if !left.truthy() {
                        right
                    } else if !right.truthy() {
                        left
                    } else {
                        Vector::boolean(false)
                    };
                    stack.push(result);
                }
                Instruction::Slice => {
                    let index = pop!();
                    let value = pop!();
                    stack.push(value.slice(&index));
                }
                Instruction::SliceLiteral(index) => {
                    let value = pop!();
                    stack.push(value.slice(index));
                }
                Instruction::IndexLiteral(index) => {
                    let value = pop!();
                    stack.push(value.item(*index));
                }
                Instruction::Call { args, keywords } => {
                    let function = pop!();
                    let mut keyword_values = pop_many!(keywords.len());
                    let mut kwargs: Vec<(Rc<str>, Vector)> = Vec::with_capacity(keywords.len());
                    for name in keywords.iter() {
                        kwargs.push((name.clone(), keyword_values.remove(0)));
                    }
                    let args = pop_many!(*args);
                    let mut results = Vec::new();
                    if let Some(objects) = function.objects() {
                        for object in objects {
                            if let Some(result) =
                                self.call_object(machine, object, &args, &kwargs, pc)?
                            {
                                results.push(result);
                            }
                        }
                    }
                    stack.push(Vector::compose(results));
                }
                Instruction::CallFast { function, args } => {
                    let args = pop_many!(*args);
                    let result = self
                        .call_object(machine, function, &args, &[], pc)?
                        .unwrap_or_default();
                    stack.push(result);
                }
                Instruction::Func { name, parameters } => {
                    let defaults = pop_many!(parameters.len());
                    let program = pop!();
                    let Some([Object::Program(body)]) = program.objects() else {
                        return Err(
                            self.internal(pc, "Func did not find a body program".to_string())
                        );
                    };
                    let function = Function {
                        name: name.clone(),
                        parameters: parameters.to_vec(),
                        defaults,
                        program: body.clone(),
                        captured: locals.clone(),
                        path: machine.context.path.clone(),
                    };
                    stack.push(Vector::from(Rc::new(function)));
                }
                Instruction::Tag(tag) => {
                    let Some(top) = stack.last() else {
                        return Err(self.internal(pc, "value stack underflow".to_string()));
                    };
                    for node in top.iter_nodes() {
                        node.add_tag(tag);
                    }
                }
                Instruction::Attribute(name) => {
                    let value = pop!();
                    let Some(top) = stack.last() else {
                        return Err(self.internal(pc, "value stack underflow".to_string()));
                    };
                    for node in top.iter_nodes() {
                        node.set_attribute(name, value.clone());
                    }
                }
                Instruction::Append(count) => {
                    let children = Vector::compose(pop_many!(*count));
                    let Some(parents) = stack.last() else {
                        return Err(self.internal(pc, "value stack underflow".to_string()));
                    };
                    let parent_nodes: Vec<Node> = parents.iter_nodes().cloned().collect();
                    for (i, parent) in parent_nodes.iter().enumerate() {
                        let last = i + 1 == parent_nodes.len();
                        for child in children.iter_nodes() {
                            let child = if last { child.clone() } else { child.copy() };
                            parent.append(child);
                        }
                    }
                }
                Instruction::Prepend => {
                    let children = pop!();
                    let Some(parents) = stack.last() else {
                        return Err(self.internal(pc, "value stack underflow".to_string()));
                    };
                    let parent_nodes: Vec<Node> = parents.iter_nodes().cloned().collect();
                    let child_nodes: Vec<Node> = children.iter_nodes().cloned().collect();
                    for (i, parent) in parent_nodes.iter().enumerate() {
                        let last = i + 1 == parent_nodes.len();
                        for child in child_nodes.iter().rev() {
                            let child = if last { child.clone() } else { child.copy() };
                            parent.insert(child);
                        }
                    }
                }
                Instruction::AppendRoot => {
                    let children = pop!();
                    for node in children.iter_nodes() {
                        machine.context.graph.append_root(node);
                    }
                }
                Instruction::Compose(count) => {
                    let parts = pop_many!(*count);
                    stack.push(Vector::compose(parts));
                }
                Instruction::BeginFor => {
                    let source = pop!();
                    loops.push(LoopFrame {
                        source,
                        position: 0,
                        count: 0,
                    });
                }
                Instruction::Next { names, offset, .. } => {
                    let Some(frame) = loops.last_mut() else {
                        return Err(Error::NoLoopFrame { pc: pc - 1 });
                    };
                    if *names == 0 || frame.position >= frame.source.len() {
                        jump!(*offset);
                    } else {
                        if locals.len() < *names {
                            return Err(
                                self.internal(pc, "locals stack underflow".to_string())
                            );
                        }
                        let base = locals.len() - names;
                        for j in 0..*names {
                            locals[base + j].value =
                                frame.source.item((frame.position + j) as i64);
                        }
                        frame.position += names;
                        frame.count += 1;
                    }
                }
                Instruction::PushNext { offset, .. } => {
                    let Some(frame) = loops.last_mut() else {
                        return Err(Error::NoLoopFrame { pc: pc - 1 });
                    };
                    if frame.position >= frame.source.len() {
                        jump!(*offset);
                    } else {
                        let value = frame.source.item(frame.position as i64);
                        frame.position += 1;
                        frame.count += 1;
                        stack.push(value);
                    }
                }
                Instruction::EndForCompose => {
                    let Some(frame) = loops.pop() else {
                        return Err(Error::NoLoopFrame { pc: pc - 1 });
                    };
                    let parts = pop_many!(frame.count);
                    stack.push(Vector::compose(parts));
                }
                Instruction::SetNodeScope => {
                    let scope = stack
                        .last()
                        .and_then(|top| top.iter_nodes().next().cloned());
                    machine.node_scopes.push(scope);
                }
                Instruction::ClearNodeScope => {
                    machine.node_scopes.pop();
                }
                Instruction::LocalLoad(depth) => {
                    if *depth >= locals.len() {
                        return Err(self.internal(pc, format!("no local at depth {}", depth)));
                    }
                    let value = locals[locals.len() - 1 - depth].value.copynodes();
                    stack.push(value);
                }
                Instruction::LocalPush(names) => {
                    let value = pop!();
                    if names.len() == 1 {
                        locals.push(Local {
                            name: names[0].clone(),
                            value,
                        });
                    } else {
                        for (i, name) in names.iter().enumerate() {
                            locals.push(Local {
                                name: name.clone(),
                                value: value.item_wrapped(i),
                            });
                        }
                    }
                }
                Instruction::LocalDrop(count) => {
                    if *count > locals.len() {
                        return Err(self.internal(pc, "locals stack underflow".to_string()));
                    }
                    locals.truncate(locals.len() - count);
                }
                Instruction::StoreGlobal(name) => {
                    let value = pop!();
                    machine.context.names.insert(name.clone(), value);
                }
                Instruction::Search(query) => {
                    let nodes = search(&machine.context.graph, query);
                    stack.push(Vector::from_nodes(nodes));
                }
            }
        }
        if !loops.is_empty() {
            return Err(self.internal(pc, "loop stack not empty at end of program".to_string()));
        }
        Ok(stack)
    }

    /// Invoke one element of a callable vector. `Ok(None)` means the
    /// element was not callable and is silently skipped.
    fn call_object(
        &self,
        machine: &mut Machine<'_, '_>,
        object: &Object,
        args: &[Vector],
        kwargs: &[(Rc<str>, Vector)],
        pc: usize,
    ) -> Result<Option<Vector>> {
        match object {
            Object::Func(function) => {
                let mut locals = function.captured.clone();
                for (i, parameter) in function.parameters.iter().enumerate() {
                    let value = args
                        .get(i)
                        .cloned()
                        .or_else(|| {
                            kwargs
                                .iter()
                                .find(|(name, _)| name == parameter)
                                .map(|(_, value)| value.clone())
                        })
                        .unwrap_or_else(|| function.defaults[i].clone());
                    locals.push(Local {
                        name: parameter.clone(),
                        value,
                    });
                }
                let saved_path = machine.context.path.clone();
                machine.context.path = function.path.clone();
                let result = function.program.execute(machine, &mut locals, 16);
                machine.context.path = saved_path;
                let mut stack = result?;
                if stack.len() != 1 {
                    return Err(self.internal(
                        pc,
                        format!(
                            "function {} left {} values on the stack",
                            function.name,
                            stack.len()
                        ),
                    ));
                }
                Ok(Some(stack.pop().unwrap()))
            }
            Object::Builtin(def) => {
                let result = match &def.kind {
                    BuiltinKind::Static(function) => {
                        if !kwargs.is_empty() {
                            Err("keyword arguments are not supported".to_string())
                        } else {
                            function(args)
                        }
                    }
                    BuiltinKind::Dynamic(function) => function(machine.context, args, kwargs),
                };
                match result {
                    Ok(value) => Ok(Some(value)),
                    Err(message) => {
                        machine
                            .context
                            .error(format!("Error calling {}(): {}", def.name, message));
                        Ok(Some(Vector::null()))
                    }
                }
            }
            _ => Ok(None),
        }
    }

    fn import(
        &self,
        machine: &mut Machine<'_, '_>,
        locals: &mut Vec<Local>,
        names: &Rc<[Rc<str>]>,
        filename: &Vector,
    ) -> Result<()> {
        let filename = filename.as_text();
        let current = machine.context.path.clone();
        let program = match &mut machine.loader {
            Some(loader) => loader.load(&filename, current.as_deref()),
            None => None,
        };
        let Some(program) = program else {
            machine
                .context
                .error(format!("Unable to import '{}'", filename));
            bind_null_locals(locals, names);
            return Ok(());
        };
        let module_path = program.path.clone();
        if let Some(path) = &module_path {
            if machine.context.import_stack.contains(path) {
                machine
                    .context
                    .error(format!("Circular import of '{}'", filename));
                bind_null_locals(locals, names);
                return Ok(());
            }
        }
        // The module shares state, errors, logs, graph and pragmas with the
        // importer but produces its own globals.
        let saved_names = std::mem::take(&mut machine.context.names);
        machine.context.path = module_path.clone();
        if let Some(path) = &module_path {
            machine.context.import_stack.push(path.clone());
        }
        let mut module_locals: Vec<Local> = Vec::new();
        let result = program.execute(machine, &mut module_locals, STACK_CAPACITY);
        if module_path.is_some() {
            machine.context.import_stack.pop();
        }
        machine.context.path = current;
        let module_names = std::mem::replace(&mut machine.context.names, saved_names);
        let stack = result?;
        if !stack.is_empty() || !module_locals.is_empty() {
            return Err(self.internal(
                0,
                format!("module '{}' ended with a non-empty stack", filename),
            ));
        }
        for name in names.iter() {
            match module_names.get(name) {
                Some(value) => locals.push(Local {
                    name: name.clone(),
                    value: value.clone(),
                }),
                None => {
                    machine.context.error(format!(
                        "Import of '{}' from '{}' failed",
                        name, filename
                    ));
                    locals.push(Local {
                        name: name.clone(),
                        value: Vector::null(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Build a stack-discipline error, logging the five instructions
    /// around the failure point.
    fn internal(&self, pc: usize, message: String) -> Error {
        let failed = pc.saturating_sub(1);
        let start = failed.saturating_sub(2);
        let end = (failed + 3).min(self.instructions.len());
        for index in start..end {
            let marker = if index == failed { ">" } else { " " };
            debug!(
                target: "flitter",
                "{} {:4}: {}",
                marker, index, self.instructions[index]
            );
        }
        Error::StackDiscipline {
            pc: failed,
            message,
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, instruction) in self.instructions.iter().enumerate() {
            writeln!(f, "{:4}: {}", index, instruction)?;
        }
        Ok(())
    }
}

struct Machine<'a, 'b> {
    context: &'a mut Context,
    loader: Option<&'b mut dyn SourceLoader>,
    /// Attribute scopes for nodes under construction, innermost last.
    /// `None` entries mark scopes opened over non-node values.
    node_scopes: Vec<Option<Node>>,
}

/// Resolution order: locals by name, program globals, static builtins,
/// dynamic builtins, then the attribute scope of the node under
/// construction. Unresolved names record an error and yield `null`.
fn resolve_name(machine: &mut Machine<'_, '_>, locals: &[Local], name: &Rc<str>) -> Vector {
    if let Some(local) = locals.iter().rev().find(|local| local.name == *name) {
        return local.value.copynodes();
    }
    if let Some(value) = machine.context.names.get(name.as_ref()) {
        return value.clone();
    }
    if let Some(value) = builtins::static_value(name) {
        return value;
    }
    if let Some(def) = builtins::static_builtin(name) {
        return Vector::from(def);
    }
    if let Some(def) = builtins::dynamic_builtin(name) {
        return Vector::from(def);
    }
    if let Some(scope) = machine.node_scopes.iter().rev().flatten().next() {
        if let Some(value) = scope.get_attribute(name) {
            return value;
        }
    }
    machine.context.error(format!("Unbound name '{}'", name));
    Vector::null()
}

fn bind_null_locals(locals: &mut Vec<Local>, names: &Rc<[Rc<str>]>) {
    for name in names.iter() {
        locals.push(Local {
            name: name.clone(),
            value: Vector::null(),
        });
    }
}
