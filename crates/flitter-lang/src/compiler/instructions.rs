//! Instruction set
//!
//! Flat instruction encoding for the stack-based VM. Jump instructions are
//! emitted against symbolic labels ([`Instruction::Label`] markers) and
//! carry a relative offset that the linker resolves before execution;
//! execution advances with `pc += offset` after the fetch.

use std::fmt;
use std::rc::Rc;

use crate::model::{Object, Query, Vector};

#[derive(Debug, Clone)]
pub enum Instruction {
    /// Push a literal vector.
    Literal(Vector),
    /// Push a node-bearing literal; every node is pushed as a fresh copy so
    /// the interned literal itself is never mutated.
    LiteralNode(Vector),
    Dup,
    Drop(usize),
    /// Jump target marker; removed by the linker.
    Label(usize),
    Jump { label: usize, offset: isize },
    BranchTrue { label: usize, offset: isize },
    BranchFalse { label: usize, offset: isize },
    Pragma(Rc<str>),
    Import { names: Rc<[Rc<str>]> },
    /// Resolve a name at runtime: locals, then globals, then builtins,
    /// then the node scope.
    Name(Rc<str>),
    Lookup,
    LookupLiteral(Vector),
    Range,
    Neg,
    Pos,
    Not,
    Ceil,
    Floor,
    Fract,
    Add,
    Sub,
    Mul,
    MulAdd,
    TrueDiv,
    FloorDiv,
    Mod,
    Pow,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Xor,
    Slice,
    SliceLiteral(Vector),
    IndexLiteral(i64),
    Call { args: usize, keywords: Rc<[Rc<str>]> },
    /// Direct invocation of a single literal callable, no keywords.
    CallFast { function: Object, args: usize },
    /// Pop per-parameter defaults then the body program and push a
    /// `Function` value capturing the current locals.
    Func { name: Rc<str>, parameters: Rc<[Rc<str>]> },
    Tag(Rc<str>),
    /// Pop a value and set it as an attribute on the nodes below.
    Attribute(Rc<str>),
    /// Pop `count` child vectors and append their nodes to the node vector
    /// below; the last parent receives the originals, earlier parents
    /// copies.
    Append(usize),
    Prepend,
    /// Pop a vector and attach its parentless nodes to the graph root.
    AppendRoot,
    /// Pop `count` vectors and push their concatenation.
    Compose(usize),
    /// Pop the loop source and open a loop frame.
    BeginFor,
    /// Bind the next `names` source elements into the top locals, or jump
    /// to `label` when the source is exhausted.
    Next { names: usize, label: usize, offset: isize },
    /// Push the next source element, or jump to `label` when exhausted.
    PushNext { label: usize, offset: isize },
    /// Close the loop frame and compose one result per iteration.
    EndForCompose,
    SetNodeScope,
    ClearNodeScope,
    /// Push a copy of the local at depth (0 = most recent).
    LocalLoad(usize),
    /// Pop one vector and bind it to the given names, destructuring with
    /// wrap-around when there is more than one.
    LocalPush(Rc<[Rc<str>]>),
    LocalDrop(usize),
    StoreGlobal(Rc<str>),
    Search(Query),
}

impl Instruction {
    pub fn is_jump(&self) -> bool {
        matches!(
            self,
            Instruction::Jump { .. }
                | Instruction::BranchTrue { .. }
                | Instruction::BranchFalse { .. }
                | Instruction::Next { .. }
                | Instruction::PushNext { .. }
        )
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Literal(v) => write!(f, "Literal {}", v),
            Instruction::LiteralNode(v) => write!(f, "LiteralNode {}", v),
            Instruction::Dup => write!(f, "Dup"),
            Instruction::Drop(n) => write!(f, "Drop {}", n),
            Instruction::Label(l) => write!(f, ".L{}", l),
            Instruction::Jump { label, offset } => write!(f, "Jump .L{} ({:+})", label, offset),
            Instruction::BranchTrue { label, offset } => {
                write!(f, "BranchTrue .L{} ({:+})", label, offset)
            }
            Instruction::BranchFalse { label, offset } => {
                write!(f, "BranchFalse .L{} ({:+})", label, offset)
            }
            Instruction::Pragma(name) => write!(f, "Pragma {}", name),
            Instruction::Import { names } => write!(f, "Import {}", names.join(";")),
            Instruction::Name(name) => write!(f, "Name {}", name),
            Instruction::Lookup => write!(f, "Lookup"),
            Instruction::LookupLiteral(v) => write!(f, "LookupLiteral {}", v),
            Instruction::Range => write!(f, "Range"),
            Instruction::Neg => write!(f, "Neg"),
            Instruction::Pos => write!(f, "Pos"),
            Instruction::Not => write!(f, "Not"),
            Instruction::Ceil => write!(f, "Ceil"),
            Instruction::Floor => write!(f, "Floor"),
            Instruction::Fract => write!(f, "Fract"),
            Instruction::Add => write!(f, "Add"),
            Instruction::Sub => write!(f, "Sub"),
            Instruction::Mul => write!(f, "Mul"),
            Instruction::MulAdd => write!(f, "MulAdd"),
            Instruction::TrueDiv => write!(f, "TrueDiv"),
            Instruction::FloorDiv => write!(f, "FloorDiv"),
            Instruction::Mod => write!(f, "Mod"),
            Instruction::Pow => write!(f, "Pow"),
            Instruction::Eq => write!(f, "Eq"),
            Instruction::Ne => write!(f, "Ne"),
            Instruction::Gt => write!(f, "Gt"),
            Instruction::Lt => write!(f, "Lt"),
            Instruction::Ge => write!(f, "Ge"),
            Instruction::Le => write!(f, "Le"),
            Instruction::Xor => write!(f, "Xor"),
            Instruction::Slice => write!(f, "Slice"),
            Instruction::SliceLiteral(v) => write!(f, "SliceLiteral {}", v),
            Instruction::IndexLiteral(i) => write!(f, "IndexLiteral {}", i),
            Instruction::Call { args, keywords } => {
                write!(f, "Call {}", args)?;
                if !keywords.is_empty() {
                    write!(f, " ({})", keywords.join(";"))?;
                }
                Ok(())
            }
            Instruction::CallFast { function, args } => {
                write!(f, "CallFast {} {}", Vector::from_objects(vec![function.clone()]), args)
            }
            Instruction::Func { name, parameters } => {
                write!(f, "Func {} ({})", name, parameters.join(";"))
            }
            Instruction::Tag(tag) => write!(f, "Tag #{}", tag),
            Instruction::Attribute(name) => write!(f, "Attribute {}", name),
            Instruction::Append(n) => write!(f, "Append {}", n),
            Instruction::Prepend => write!(f, "Prepend"),
            Instruction::AppendRoot => write!(f, "AppendRoot"),
            Instruction::Compose(n) => write!(f, "Compose {}", n),
            Instruction::BeginFor => write!(f, "BeginFor"),
            Instruction::Next { names, label, offset } => {
                write!(f, "Next {} .L{} ({:+})", names, label, offset)
            }
            Instruction::PushNext { label, offset } => {
                write!(f, "PushNext .L{} ({:+})", label, offset)
            }
            Instruction::EndForCompose => write!(f, "EndForCompose"),
            Instruction::SetNodeScope => write!(f, "SetNodeScope"),
            Instruction::ClearNodeScope => write!(f, "ClearNodeScope"),
            Instruction::LocalLoad(depth) => write!(f, "LocalLoad {}", depth),
            Instruction::LocalPush(names) => write!(f, "LocalPush {}", names.join(";")),
            Instruction::LocalDrop(n) => write!(f, "LocalDrop {}", n),
            Instruction::StoreGlobal(name) => write!(f, "StoreGlobal {}", name),
            Instruction::Search(query) => write!(f, "Search {:?}", query),
        }
    }
}
