//! The universal runtime value
//!
//! A [`Vector`] is either a densely-packed array of 64-bit floats or a boxed
//! sequence of heterogeneous objects (strings, nodes, callables,
//! sub-programs). All arithmetic, comparison, slicing and composition is
//! defined here. Numeric storage keeps up to 16 values inline; object
//! storage is reference-counted so clones are cheap.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::builtins::BuiltinDef;
use crate::model::node::Node;
use crate::vm::function::Function;
use crate::vm::Program;

/// Inline numeric storage; spills to the heap past 16 elements.
pub type Numbers = SmallVec<[f64; 16]>;

/// A single element of an object vector.
#[derive(Clone)]
pub enum Object {
    Str(Rc<str>),
    Node(Node),
    Func(Rc<Function>),
    Program(Rc<Program>),
    Builtin(&'static BuiltinDef),
    /// Boxed number, produced when composition widens a numeric vector.
    Float(f64),
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::Str(s) => write!(f, "{:?}", s),
            Object::Node(n) => write!(f, "{:?}", n),
            Object::Func(func) => write!(f, "{:?}", func),
            Object::Program(_) => write!(f, "Program"),
            Object::Builtin(b) => write!(f, "{:?}", b),
            Object::Float(v) => write!(f, "{:?}", v),
        }
    }
}

impl Object {
    pub fn is_callable(&self) -> bool {
        matches!(self, Object::Func(_) | Object::Builtin(_))
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Object::Float(n) => Some(*n),
            _ => None,
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Object::Str(s) => !s.is_empty(),
            Object::Float(n) => *n != 0.0,
            _ => true,
        }
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Object::Str(a), Object::Str(b)) => a == b,
            (Object::Node(a), Object::Node(b)) => a.ptr_eq(b),
            (Object::Func(a), Object::Func(b)) => Rc::ptr_eq(a, b),
            (Object::Program(a), Object::Program(b)) => Rc::ptr_eq(a, b),
            (Object::Builtin(a), Object::Builtin(b)) => std::ptr::eq(*a, *b),
            (Object::Float(a), Object::Float(b)) => number_eq(*a, *b),
            _ => false,
        }
    }
}

/// The universal runtime value.
#[derive(Clone)]
pub enum Vector {
    Numeric(Numbers),
    Objects(Rc<[Object]>),
}

impl Default for Vector {
    fn default() -> Self {
        Vector::null()
    }
}

impl Vector {
    /// The empty vector.
    pub fn null() -> Vector {
        Vector::Numeric(SmallVec::new())
    }

    /// Length-1 numeric `[1]` or `[0]`.
    pub fn boolean(value: bool) -> Vector {
        Vector::from(if value { 1.0 } else { 0.0 })
    }

    pub fn minus_one() -> Vector {
        Vector::from(-1.0)
    }

    /// A symbol is an interned length-1 string vector.
    pub fn symbol(name: &str) -> Vector {
        Vector::Objects(Rc::from(vec![Object::Str(Rc::from(name))])).intern()
    }

    pub fn from_objects(objects: Vec<Object>) -> Vector {
        if objects.is_empty() {
            Vector::null()
        } else {
            Vector::Objects(Rc::from(objects))
        }
    }

    pub fn from_nodes(nodes: Vec<Node>) -> Vector {
        Vector::from_objects(nodes.into_iter().map(Object::Node).collect())
    }

    pub fn len(&self) -> usize {
        match self {
            Vector::Numeric(ns) => ns.len(),
            Vector::Objects(os) => os.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Vector::Numeric(_))
    }

    pub fn numbers(&self) -> Option<&[f64]> {
        match self {
            Vector::Numeric(ns) => Some(ns),
            Vector::Objects(_) => None,
        }
    }

    pub fn objects(&self) -> Option<&[Object]> {
        match self {
            Vector::Objects(os) => Some(os),
            Vector::Numeric(_) => None,
        }
    }

    /// The single number of a length-1 numeric vector.
    pub fn as_f64(&self) -> Option<f64> {
        match self.numbers() {
            Some([n]) => Some(*n),
            _ => None,
        }
    }

    /// Concatenation of the textual form of every element, with numbers
    /// rendered shortest-form. Used for filenames and log output.
    pub fn as_text(&self) -> String {
        let mut out = String::new();
        match self {
            Vector::Numeric(ns) => {
                for n in ns {
                    out.push_str(&format_number(*n));
                }
            }
            Vector::Objects(os) => {
                for o in os.iter() {
                    match o {
                        Object::Str(s) => out.push_str(s),
                        Object::Float(n) => out.push_str(&format_number(*n)),
                        Object::Node(n) => out.push_str(&format!("!{}", n.kind())),
                        Object::Func(f) => out.push_str(&f.name),
                        Object::Program(_) => out.push_str("<program>"),
                        Object::Builtin(b) => out.push_str(b.name),
                    }
                }
            }
        }
        out
    }

    /// Non-empty with at least one non-zero / non-empty-string / live element.
    pub fn truthy(&self) -> bool {
        match self {
            Vector::Numeric(ns) => ns.iter().any(|n| *n != 0.0),
            Vector::Objects(os) => os.iter().any(Object::truthy),
        }
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = &Node> {
        self.objects().unwrap_or(&[]).iter().filter_map(|o| match o {
            Object::Node(n) => Some(n),
            _ => None,
        })
    }

    pub fn has_nodes(&self) -> bool {
        self.iter_nodes().next().is_some()
    }

    /// A copy in which every node element is replaced by a copy of the node.
    /// Non-node vectors are returned unchanged.
    pub fn copynodes(&self) -> Vector {
        if !self.has_nodes() {
            return self.clone();
        }
        let objects = self
            .objects()
            .unwrap()
            .iter()
            .map(|o| match o {
                Object::Node(n) => Object::Node(n.copy()),
                other => other.clone(),
            })
            .collect();
        Vector::from_objects(objects)
    }

    // --- arithmetic -------------------------------------------------------

    pub(crate) fn zip_map(&self, other: &Vector, f: impl Fn(f64, f64) -> f64) -> Vector {
        let (Some(xs), Some(ys)) = (self.numbers(), other.numbers()) else {
            return Vector::null();
        };
        let (n, m) = (xs.len(), ys.len());
        if n == 0 || m == 0 {
            return Vector::null();
        }
        let count = if n == m {
            n
        } else if n > m && n % m == 0 {
            n
        } else if m > n && m % n == 0 {
            m
        } else {
            return Vector::null();
        };
        let mut out = Numbers::with_capacity(count);
        for i in 0..count {
            out.push(f(xs[i % n], ys[i % m]));
        }
        Vector::Numeric(out)
    }

    pub fn add(&self, other: &Vector) -> Vector {
        self.zip_map(other, |x, y| x + y)
    }

    pub fn sub(&self, other: &Vector) -> Vector {
        self.zip_map(other, |x, y| x - y)
    }

    pub fn mul(&self, other: &Vector) -> Vector {
        self.zip_map(other, |x, y| x * y)
    }

    pub fn truediv(&self, other: &Vector) -> Vector {
        self.zip_map(other, |x, y| x / y)
    }

    pub fn floordiv(&self, other: &Vector) -> Vector {
        self.zip_map(other, |x, y| (x / y).floor())
    }

    /// Flooring modulo: the result takes the sign of the divisor.
    pub fn modulo(&self, other: &Vector) -> Vector {
        self.zip_map(other, |x, y| x - (x / y).floor() * y)
    }

    pub fn pow(&self, other: &Vector) -> Vector {
        self.zip_map(other, |x, y| x.powf(y))
    }

    /// `self * mul + add` with a single pass over the output.
    pub fn mul_add(&self, mul: &Vector, add: &Vector) -> Vector {
        let (Some(xs), Some(ys), Some(zs)) = (self.numbers(), mul.numbers(), add.numbers()) else {
            return Vector::null();
        };
        let lengths = [xs.len(), ys.len(), zs.len()];
        let count = *lengths.iter().max().unwrap();
        if count == 0 || lengths.iter().any(|n| *n == 0 || count % *n != 0) {
            return Vector::null();
        }
        let mut out = Numbers::with_capacity(count);
        for i in 0..count {
            out.push(xs[i % xs.len()].mul_add(ys[i % ys.len()], zs[i % zs.len()]));
        }
        Vector::Numeric(out)
    }

    pub(crate) fn unary_map(&self, f: impl Fn(f64) -> f64) -> Vector {
        match self.numbers() {
            Some(ns) if !ns.is_empty() => Vector::Numeric(ns.iter().map(|n| f(*n)).collect()),
            _ => Vector::null(),
        }
    }

    pub fn neg(&self) -> Vector {
        self.unary_map(|n| -n)
    }

    /// Identity on numeric vectors, `null` otherwise.
    pub fn pos(&self) -> Vector {
        match self {
            Vector::Numeric(_) => self.clone(),
            Vector::Objects(_) => Vector::null(),
        }
    }

    pub fn ceil(&self) -> Vector {
        self.unary_map(f64::ceil)
    }

    pub fn floor(&self) -> Vector {
        self.unary_map(f64::floor)
    }

    pub fn fract(&self) -> Vector {
        self.unary_map(|n| n - n.floor())
    }

    pub fn round(&self) -> Vector {
        self.unary_map(f64::round)
    }

    pub fn not_vec(&self) -> Vector {
        Vector::boolean(!self.truthy())
    }

    // --- comparison -------------------------------------------------------

    /// Language-level equality, with IEEE semantics for numbers.
    pub fn eq_vec(&self, other: &Vector) -> Vector {
        Vector::boolean(self.coerce_eq(other))
    }

    pub fn ne_vec(&self, other: &Vector) -> Vector {
        Vector::boolean(!self.coerce_eq(other))
    }

    fn coerce_eq(&self, other: &Vector) -> bool {
        if self.len() != other.len() {
            return false;
        }
        match (self, other) {
            (Vector::Numeric(xs), Vector::Numeric(ys)) => {
                xs.iter().zip(ys.iter()).all(|(x, y)| x == y)
            }
            (Vector::Objects(xs), Vector::Objects(ys)) => {
                xs.iter().zip(ys.iter()).all(|(x, y)| x == y)
            }
            (Vector::Numeric(ns), Vector::Objects(os))
            | (Vector::Objects(os), Vector::Numeric(ns)) => ns
                .iter()
                .zip(os.iter())
                .all(|(n, o)| o.as_number() == Some(*n)),
        }
    }

    /// Lexicographic ordering across elements; `None` for mismatched kinds.
    pub fn compare(&self, other: &Vector) -> Option<Ordering> {
        match (self, other) {
            (Vector::Numeric(xs), Vector::Numeric(ys)) => {
                for (x, y) in xs.iter().zip(ys.iter()) {
                    match x.partial_cmp(y)? {
                        Ordering::Equal => continue,
                        order => return Some(order),
                    }
                }
                Some(xs.len().cmp(&ys.len()))
            }
            (Vector::Objects(xs), Vector::Objects(ys)) => {
                for (x, y) in xs.iter().zip(ys.iter()) {
                    let order = match (x, y) {
                        (Object::Str(a), Object::Str(b)) => a.cmp(b),
                        (Object::Float(a), Object::Float(b)) => a.partial_cmp(b)?,
                        _ => return None,
                    };
                    match order {
                        Ordering::Equal => continue,
                        order => return Some(order),
                    }
                }
                Some(xs.len().cmp(&ys.len()))
            }
            _ => None,
        }
    }

    // --- slicing and ranges -----------------------------------------------

    /// Index by a numeric vector: each index is floored, in-range indices
    /// pick the element, out-of-range slots are filled with zero (boxed
    /// for object sources). The result always has the index vector's
    /// length and is numeric iff the source is numeric.
    pub fn slice(&self, index: &Vector) -> Vector {
        let Some(indices) = index.numbers() else {
            return Vector::null();
        };
        let n = self.len();
        match self {
            Vector::Numeric(ns) => {
                let mut out = Numbers::with_capacity(indices.len());
                for i in indices {
                    let i = i.floor();
                    if i >= 0.0 && (i as usize) < n {
                        out.push(ns[i as usize]);
                    } else {
                        out.push(0.0);
                    }
                }
                if out.is_empty() {
                    Vector::null()
                } else {
                    Vector::Numeric(out)
                }
            }
            Vector::Objects(os) => {
                let mut out = Vec::with_capacity(indices.len());
                for i in indices {
                    let i = i.floor();
                    if i >= 0.0 && (i as usize) < n {
                        out.push(os[i as usize].clone());
                    } else {
                        out.push(Object::Float(0.0));
                    }
                }
                Vector::from_objects(out)
            }
        }
    }

    /// Single in-range element, `null` otherwise.
    pub fn item(&self, index: i64) -> Vector {
        if index < 0 || index as usize >= self.len() {
            return Vector::null();
        }
        let index = index as usize;
        match self {
            Vector::Numeric(ns) => Vector::from(ns[index]),
            Vector::Objects(os) => Vector::from_objects(vec![os[index].clone()]),
        }
    }

    /// Element at `index mod len`; used by destructuring bindings, which
    /// wrap rather than pad.
    pub fn item_wrapped(&self, index: usize) -> Vector {
        if self.is_empty() {
            Vector::null()
        } else {
            self.item((index % self.len()) as i64)
        }
    }

    /// `start`, `stop`, `step` may each be `null` (defaulting to 0, none
    /// and 1); a missing stop or a zero step yields `null`.
    pub fn range(start: &Vector, stop: &Vector, step: &Vector) -> Vector {
        let start = match start.as_f64() {
            Some(n) => n,
            None if start.is_empty() => 0.0,
            None => return Vector::null(),
        };
        let step = match step.as_f64() {
            Some(n) => n,
            None if step.is_empty() => 1.0,
            None => return Vector::null(),
        };
        let Some(stop) = stop.as_f64() else {
            return Vector::null();
        };
        if step == 0.0 {
            return Vector::null();
        }
        let count = ((stop - start) / step).ceil();
        if !(count > 0.0) {
            return Vector::null();
        }
        let count = count as usize;
        let mut out = Numbers::with_capacity(count);
        for i in 0..count {
            out.push(start + step * i as f64);
        }
        Vector::Numeric(out)
    }

    // --- composition ------------------------------------------------------

    /// Concatenate, staying numeric when every input is numeric and
    /// widening to objects otherwise. Empty input composes to `null`.
    pub fn compose(parts: Vec<Vector>) -> Vector {
        let mut parts: Vec<Vector> = parts.into_iter().filter(|v| !v.is_empty()).collect();
        match parts.len() {
            0 => return Vector::null(),
            1 => return parts.pop().unwrap(),
            _ => {}
        }
        if parts.iter().all(Vector::is_numeric) {
            let mut out = Numbers::with_capacity(parts.iter().map(Vector::len).sum());
            for part in &parts {
                out.extend_from_slice(part.numbers().unwrap());
            }
            return Vector::Numeric(out);
        }
        let mut out = Vec::with_capacity(parts.iter().map(Vector::len).sum());
        for part in parts {
            match part {
                Vector::Numeric(ns) => out.extend(ns.into_iter().map(Object::Float)),
                Vector::Objects(os) => out.extend(os.iter().cloned()),
            }
        }
        Vector::from_objects(out)
    }

    // --- interning --------------------------------------------------------

    /// Return a canonical shared instance for short node-free vectors.
    /// Node-bearing vectors are mutable and are never interned.
    pub fn intern(self) -> Vector {
        const MAX_INTERN_LENGTH: usize = 32;
        if self.len() > MAX_INTERN_LENGTH || self.has_nodes() {
            return self;
        }
        INTERN_TABLE.with(|table| {
            let mut table = table.borrow_mut();
            let key = self.structural_hash();
            let bucket = table.entry(key).or_default();
            for existing in bucket.iter() {
                if existing == &self {
                    return existing.clone();
                }
            }
            bucket.push(self.clone());
            self
        })
    }

    /// Structural hash used for interning and state keys: `-0.0`
    /// canonicalises to `0.0`, integral floats hash as integers, `NaN`
    /// hashes bit-for-bit.
    pub fn structural_hash(&self) -> u64 {
        let mut hasher = rustc_hash::FxHasher::default();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

thread_local! {
    static INTERN_TABLE: RefCell<FxHashMap<u64, Vec<Vector>>> = RefCell::new(FxHashMap::default());
}

fn hash_number<H: Hasher>(n: f64, state: &mut H) {
    let n = if n == 0.0 { 0.0 } else { n };
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        (n as i64).hash(state);
    } else {
        n.to_bits().hash(state);
    }
}

fn number_eq(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

impl Hash for Vector {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Vector::Numeric(ns) => {
                for n in ns {
                    hash_number(*n, state);
                }
            }
            Vector::Objects(os) => {
                for o in os.iter() {
                    match o {
                        Object::Str(s) => s.hash(state),
                        Object::Float(n) => hash_number(*n, state),
                        Object::Node(n) => n.id().hash(state),
                        Object::Func(f) => (Rc::as_ptr(f) as usize).hash(state),
                        Object::Program(p) => (Rc::as_ptr(p) as usize).hash(state),
                        Object::Builtin(b) => (*b as *const BuiltinDef as usize).hash(state),
                    }
                }
            }
        }
    }
}

/// Structural equality. Unlike the language's `==`, `NaN` compares equal to
/// itself so that vectors are usable as map keys.
impl PartialEq for Vector {
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        match (self, other) {
            (Vector::Numeric(xs), Vector::Numeric(ys)) => {
                xs.iter().zip(ys.iter()).all(|(x, y)| number_eq(*x, *y))
            }
            (Vector::Objects(xs), Vector::Objects(ys)) => {
                xs.iter().zip(ys.iter()).all(|(x, y)| x == y)
            }
            (Vector::Numeric(ns), Vector::Objects(os))
            | (Vector::Objects(os), Vector::Numeric(ns)) => ns
                .iter()
                .zip(os.iter())
                .all(|(n, o)| o.as_number().is_some_and(|m| number_eq(*n, m))),
        }
    }
}

impl Eq for Vector {}

impl From<f64> for Vector {
    fn from(n: f64) -> Vector {
        Vector::Numeric(SmallVec::from_slice(&[n]))
    }
}

impl From<i64> for Vector {
    fn from(n: i64) -> Vector {
        Vector::from(n as f64)
    }
}

impl From<&[f64]> for Vector {
    fn from(ns: &[f64]) -> Vector {
        Vector::Numeric(SmallVec::from_slice(ns))
    }
}

impl From<Vec<f64>> for Vector {
    fn from(ns: Vec<f64>) -> Vector {
        Vector::Numeric(SmallVec::from_vec(ns))
    }
}

impl From<&str> for Vector {
    fn from(s: &str) -> Vector {
        Vector::Objects(Rc::from(vec![Object::Str(Rc::from(s))]))
    }
}

impl From<Node> for Vector {
    fn from(node: Node) -> Vector {
        Vector::Objects(Rc::from(vec![Object::Node(node)]))
    }
}

impl From<Rc<Function>> for Vector {
    fn from(function: Rc<Function>) -> Vector {
        Vector::Objects(Rc::from(vec![Object::Func(function)]))
    }
}

impl From<Rc<Program>> for Vector {
    fn from(program: Rc<Program>) -> Vector {
        Vector::Objects(Rc::from(vec![Object::Program(program)]))
    }
}

impl From<&'static BuiltinDef> for Vector {
    fn from(builtin: &'static BuiltinDef) -> Vector {
        Vector::Objects(Rc::from(vec![Object::Builtin(builtin)]))
    }
}

/// Shortest-form rendering: integral values drop the fraction.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vector::Numeric(ns) => {
                for (i, n) in ns.iter().enumerate() {
                    if i > 0 {
                        write!(f, ";")?;
                    }
                    write!(f, "{}", format_number(*n))?;
                }
            }
            Vector::Objects(os) => {
                for (i, o) in os.iter().enumerate() {
                    if i > 0 {
                        write!(f, ";")?;
                    }
                    match o {
                        Object::Str(s) => write!(f, "'{}'", s)?,
                        Object::Float(n) => write!(f, "{}", format_number(*n))?,
                        Object::Node(n) => write!(f, "!{}", n.kind())?,
                        Object::Func(func) => write!(f, "{}", func.name)?,
                        Object::Program(_) => write!(f, "<program>")?,
                        Object::Builtin(b) => write!(f, "{}", b.name)?,
                    }
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self)
    }
}
