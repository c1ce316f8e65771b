//! Builtin callables
//!
//! Two tables: *static* builtins are pure functions of their arguments and
//! are safe for the partial evaluator to fold; *dynamic* builtins receive
//! the live [`Context`] and are never folded. A handful of static names
//! (`null`, `true`, `false`, `inf`, `nan`) resolve directly to values.

use std::rc::Rc;

use crate::context::Context;
use crate::model::Vector;

pub type StaticFn = fn(&[Vector]) -> Result<Vector, String>;
pub type DynamicFn = fn(&mut Context, &[Vector], &[(Rc<str>, Vector)]) -> Result<Vector, String>;

pub enum BuiltinKind {
    Static(StaticFn),
    Dynamic(DynamicFn),
}

pub struct BuiltinDef {
    pub name: &'static str,
    pub kind: BuiltinKind,
}

impl std::fmt::Debug for BuiltinDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BuiltinDef({})", self.name)
    }
}

/// Value-like static names.
pub fn static_value(name: &str) -> Option<Vector> {
    match name {
        "null" => Some(Vector::null()),
        "true" => Some(Vector::boolean(true)),
        "false" => Some(Vector::boolean(false)),
        "inf" => Some(Vector::from(f64::INFINITY)),
        "nan" => Some(Vector::from(f64::NAN)),
        _ => None,
    }
}

pub fn static_builtin(name: &str) -> Option<&'static BuiltinDef> {
    UNARY_BUILTINS
        .iter()
        .chain(STATIC_BUILTINS.iter())
        .find(|def| def.name == name)
}

pub fn dynamic_builtin(name: &str) -> Option<&'static BuiltinDef> {
    DYNAMIC_BUILTINS.iter().find(|def| def.name == name)
}

macro_rules! unary_builtins {
    ($(($name:literal, $f:expr)),* $(,)?) => {
        &[$(BuiltinDef {
            name: $name,
            kind: BuiltinKind::Static(|args| {
                let [x] = args else {
                    return Err(format!("{}() takes exactly one argument", $name));
                };
                Ok(x.unary_map($f))
            }),
        }),*]
    };
}

static UNARY_BUILTINS: &[BuiltinDef] = unary_builtins![
    ("abs", f64::abs),
    ("sqrt", f64::sqrt),
    ("exp", f64::exp),
    ("log", |n| n.ln()),
    ("log2", f64::log2),
    ("log10", f64::log10),
    ("sin", f64::sin),
    ("cos", f64::cos),
    ("tan", f64::tan),
    ("asin", f64::asin),
    ("acos", f64::acos),
    ("round", f64::round),
    ("ceil", f64::ceil),
    ("floor", f64::floor),
    ("fract", |n| n - n.floor()),
    ("sign", f64::signum),
];

static STATIC_BUILTINS: &[BuiltinDef] = &[
    BuiltinDef {
        name: "len",
        kind: BuiltinKind::Static(|args| {
            let [x] = args else {
                return Err("len() takes exactly one argument".to_string());
            };
            Ok(Vector::from(x.len() as f64))
        }),
    },
    BuiltinDef {
        name: "sum",
        kind: BuiltinKind::Static(|args| {
            let [x] = args else {
                return Err("sum() takes exactly one argument".to_string());
            };
            match x.numbers() {
                Some(ns) => Ok(Vector::from(ns.iter().sum::<f64>())),
                None => Ok(Vector::null()),
            }
        }),
    },
    BuiltinDef {
        name: "product",
        kind: BuiltinKind::Static(|args| {
            let [x] = args else {
                return Err("product() takes exactly one argument".to_string());
            };
            match x.numbers() {
                Some(ns) => Ok(Vector::from(ns.iter().product::<f64>())),
                None => Ok(Vector::null()),
            }
        }),
    },
    BuiltinDef {
        name: "min",
        kind: BuiltinKind::Static(|args| fold_or_zip(args, "min", f64::min)),
    },
    BuiltinDef {
        name: "max",
        kind: BuiltinKind::Static(|args| fold_or_zip(args, "max", f64::max)),
    },
    BuiltinDef {
        name: "hypot",
        kind: BuiltinKind::Static(|args| {
            let [x] = args else {
                return Err("hypot() takes exactly one argument".to_string());
            };
            match x.numbers() {
                Some(ns) => Ok(Vector::from(
                    ns.iter().map(|n| n * n).sum::<f64>().sqrt(),
                )),
                None => Ok(Vector::null()),
            }
        }),
    },
    BuiltinDef {
        name: "clamp",
        kind: BuiltinKind::Static(|args| {
            let [x, lo, hi] = args else {
                return Err("clamp() takes exactly three arguments".to_string());
            };
            Ok(x.zip_map(lo, f64::max).zip_map(hi, f64::min))
        }),
    },
    BuiltinDef {
        name: "zip",
        kind: BuiltinKind::Static(|args| {
            if args.is_empty() {
                return Ok(Vector::null());
            }
            let mut sources = Vec::with_capacity(args.len());
            let mut longest = 0usize;
            for arg in args {
                match arg.numbers() {
                    Some(ns) if !ns.is_empty() => {
                        longest = longest.max(ns.len());
                        sources.push(ns);
                    }
                    _ => return Ok(Vector::null()),
                }
            }
            let mut out = Vec::with_capacity(longest * sources.len());
            for i in 0..longest {
                for source in &sources {
                    out.push(source[i % source.len()]);
                }
            }
            Ok(Vector::from(out))
        }),
    },
];

/// With one argument, fold the elements to a scalar; with several, combine
/// them element-wise.
fn fold_or_zip(args: &[Vector], name: &str, f: fn(f64, f64) -> f64) -> Result<Vector, String> {
    match args {
        [] => Err(format!("{}() takes at least one argument", name)),
        [x] => match x.numbers() {
            Some(ns) if !ns.is_empty() => Ok(Vector::from(ns.iter().copied().reduce(f).unwrap())),
            _ => Ok(Vector::null()),
        },
        [first, rest @ ..] => {
            let mut out = first.clone();
            for arg in rest {
                out = out.zip_map(arg, f);
            }
            Ok(out)
        }
    }
}

static DYNAMIC_BUILTINS: &[BuiltinDef] = &[BuiltinDef {
    name: "debug",
    kind: BuiltinKind::Dynamic(|context, args, _keywords| {
        let [value] = args else {
            return Err("debug() takes exactly one argument".to_string());
        };
        let message = format!("{:?}", value);
        tracing::debug!(target: "flitter", "{}", message);
        context.log(message);
        Ok(value.clone())
    }),
}];

/// Iterate every builtin definition; used for lookups that must scan both
/// tables and by hosts listing the available names.
pub fn all_builtins() -> impl Iterator<Item = &'static BuiltinDef> {
    UNARY_BUILTINS
        .iter()
        .chain(STATIC_BUILTINS.iter())
        .chain(DYNAMIC_BUILTINS.iter())
}
