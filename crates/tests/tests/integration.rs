//! Integration tests for end-to-end engine execution.
//!
//! These tests verify the full pipeline:
//! Build AST → Simplify → Compile → Run → Inspect graph/globals/state

use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};

use flitter_lang::model::Vector;
use flitter_lang::tree::{Binding, Expression, FunctionDef, PolyBinding, Top};
use flitter_tests::{
    add, attributes, let_one, lit, mul, name, node, MapLoader, TestHarness,
};

/// `let x = 2 + 3` followed by `!pragma v = x * x` folds to a literal
/// pragma of 25 and surfaces it to the host.
#[test]
fn test_arithmetic_folding() {
    let top = Top::new(vec![
        let_one("x", add(lit(2.0), lit(3.0))),
        Expression::Pragma {
            name: Rc::from("v"),
            expr: Box::new(mul(name("x"), name("x"))),
        },
    ]);
    let mut harness = TestHarness::new(top);

    // The simplified tree carries the pragma as a literal.
    let pragma = harness
        .simplified_top()
        .body
        .iter()
        .find_map(|expr| match expr {
            Expression::Pragma { expr, .. } => Some(expr.as_ref().clone()),
            _ => None,
        })
        .expect("pragma should survive simplification");
    assert_eq!(pragma, lit(25.0));

    harness.run();
    assert_eq!(harness.pragma("v"), Vector::from(25.0));
    assert_eq!(harness.global("x"), Vector::from(5.0));
}

/// `for i in ..3` over a `!dot x=i*2` body unrolls into three literal
/// nodes with the attribute already computed.
#[test]
fn test_loop_unrolling() {
    let top = Top::new(vec![Expression::For {
        names: vec![Rc::from("i")],
        source: Box::new(Expression::Range {
            start: Box::new(Expression::Literal(Vector::null())),
            stop: Box::new(lit(3.0)),
            step: Box::new(Expression::Literal(Vector::null())),
        }),
        body: Box::new(attributes(node("dot"), vec![("x", mul(name("i"), lit(2.0)))])),
    }]);
    let mut harness = TestHarness::new(top);

    // Fully unrolled and folded: a single literal of three nodes.
    assert_eq!(harness.simplified_top().body.len(), 1);
    assert!(matches!(
        harness.simplified_top().body[0],
        Expression::Literal(ref value) if value.len() == 3
    ));

    harness.run();
    let children = harness.children();
    assert_eq!(children.len(), 3);
    for (i, child) in children.iter().enumerate() {
        assert_eq!(&*child.kind(), "dot");
        assert_eq!(
            child.get_attribute("x"),
            Some(Vector::from(i as f64 * 2.0))
        );
    }
}

/// `func square(n) n*n` followed by `let y = square(4)` folds the call
/// into the literal 16 bound to `y`.
#[test]
fn test_function_inlining() {
    let square = FunctionDef {
        name: Rc::from("square"),
        parameters: vec![Binding::new("n", Expression::Literal(Vector::null()))],
        body: mul(name("n"), name("n")),
        captures: false,
        recursive: false,
    };
    let top = Top::new(vec![
        Expression::FunctionDef(Rc::new(square)),
        let_one(
            "y",
            Expression::Call {
                function: Box::new(name("square")),
                args: vec![lit(4.0)],
                keywords: vec![],
            },
        ),
    ]);
    let mut harness = TestHarness::new(top);

    let binding = harness
        .simplified_top()
        .body
        .iter()
        .find_map(|expr| match expr {
            Expression::Let { bindings } => bindings
                .iter()
                .find(|b| b.names == vec![Rc::<str>::from("y")])
                .map(|b| b.expr.clone()),
            _ => None,
        })
        .expect("y binding should survive");
    assert_eq!(binding, lit(16.0));

    harness.run();
    assert_eq!(harness.global("y"), Vector::from(16.0));
}

/// A program writes `!store key=:foo value=7`; the host applies it to the
/// state; a second program reads it back with `$:foo`.
#[test]
fn test_state_round_trip() {
    let writer = Top::new(vec![attributes(
        node("store"),
        vec![
            ("key", Expression::Literal(Vector::symbol("foo"))),
            ("value", lit(7.0)),
        ],
    )]);
    let mut harness = TestHarness::new(writer);
    harness.run();
    harness.apply_store_nodes();
    assert_eq!(
        harness.state().get(&Vector::symbol("foo")),
        Vector::from(7.0)
    );

    let reader = Top::new(vec![attributes(
        node("emit"),
        vec![(
            "value",
            Expression::Lookup(Box::new(Expression::Literal(Vector::symbol("foo")))),
        )],
    )]);
    let mut harness2 = TestHarness::new(reader);
    harness2.set_state(Vector::symbol("foo"), Vector::from(7.0));
    harness2.run();
    let children = harness2.children();
    assert_eq!(&*children[0].kind(), "emit");
    assert_eq!(children[0].get_attribute("value"), Some(Vector::from(7.0)));
}

/// Modules `a.fl` and `b.fl` import each other: the run reports exactly
/// one circular-import error and the cycled names bind to null.
#[test]
fn test_circular_import() {
    let module_a = Top::new(vec![
        Expression::Import {
            names: vec![Rc::from("bval")],
            filename: Box::new(Expression::Literal(Vector::from("b.fl"))),
        },
        let_one("aval", lit(1.0)),
    ]);
    let module_b = Top::new(vec![
        Expression::Import {
            names: vec![Rc::from("aval")],
            filename: Box::new(Expression::Literal(Vector::from("a.fl"))),
        },
        let_one("bval", lit(2.0)),
    ]);
    let root = Top::new(vec![
        Expression::Import {
            names: vec![Rc::from("aval")],
            filename: Box::new(Expression::Literal(Vector::from("a.fl"))),
        },
        let_one("result", name("aval")),
    ]);

    let mut loader = MapLoader::default()
        .with_module("a.fl", module_a)
        .with_module("b.fl", module_b);
    let mut harness = TestHarness::new_unsimplified(root);
    harness.run_with_loader(&mut loader);

    let errors = harness.errors();
    let circular: Vec<_> = errors
        .iter()
        .filter(|e| e.contains("Circular import"))
        .collect();
    assert_eq!(circular.len(), 1, "errors: {:?}", errors);
    // a.fl still exports its own value despite the cycle below it.
    assert_eq!(harness.global("result"), Vector::from(1.0));
}

/// `(false and sqrt()) or 1`: the erroring call is never evaluated, so
/// the result is 1 and no error is recorded.
#[test]
fn test_short_circuit_evaluation() {
    let failing_call = Expression::Call {
        function: Box::new(name("sqrt")),
        args: vec![],
        keywords: vec![],
    };
    let top = Top::new(vec![let_one(
        "x",
        Expression::Or {
            left: Box::new(Expression::And {
                left: Box::new(Expression::Literal(Vector::boolean(false))),
                right: Box::new(failing_call),
            }),
            right: Box::new(lit(1.0)),
        },
    )]);
    let mut harness = TestHarness::new_unsimplified(top);
    harness.run();
    assert_eq!(harness.global("x"), Vector::from(1.0));
    assert!(harness.errors().is_empty());
}

/// Running the simplified program and the unsimplified program produces
/// structurally equal graphs for the same runtime variables.
#[test]
fn test_simplified_and_unsimplified_graphs_agree() {
    let build = || {
        Top::new(vec![
            let_one("size", mul(name("v"), lit(2.0))),
            attributes(
                node("dot"),
                vec![("size", name("size")), ("fixed", add(lit(1.0), lit(2.0)))],
            ),
        ])
    };
    let variables = || {
        let mut variables: IndexMap<Rc<str>, Vector> = IndexMap::new();
        variables.insert(Rc::from("v"), Vector::from(3.0));
        variables
    };

    let mut plain = TestHarness::new_unsimplified(build());
    plain.run_with_variables(variables());

    let (simplified, _) = build().simplify(
        None,
        &IndexMap::new(),
        &IndexSet::from_iter([Rc::<str>::from("v")]),
    );
    let mut folded = TestHarness::new_unsimplified(simplified);
    folded.run_with_variables(variables());

    let plain_children = plain.children();
    let folded_children = folded.children();
    assert_eq!(plain_children.len(), folded_children.len());
    for (a, b) in plain_children.iter().zip(folded_children.iter()) {
        assert!(a.structure_eq(b), "graphs diverged: {} vs {}", a, b);
    }
}

/// Simplifying an already-simplified tree is a no-op.
#[test]
fn test_simplify_is_idempotent_end_to_end() {
    let top = Top::new(vec![
        let_one("x", add(name("v"), lit(1.0))),
        Expression::For {
            names: vec![Rc::from("i")],
            source: Box::new(name("x")),
            body: Box::new(mul(name("i"), lit(2.0))),
        },
    ]);
    let dynamics = IndexSet::from_iter([Rc::<str>::from("v")]);
    let (once, _) = top.simplify(None, &IndexMap::new(), &dynamics);
    let (twice, _) = once.simplify(None, &IndexMap::new(), &dynamics);
    assert_eq!(once.body, twice.body);
}

/// Keyword arguments reach dynamic builtins; `debug` logs and passes its
/// argument through unchanged.
#[test]
fn test_debug_builtin_logs_value() {
    let top = Top::new(vec![let_one(
        "y",
        Expression::Call {
            function: Box::new(name("debug")),
            args: vec![lit(5.0)],
            keywords: vec![],
        },
    )]);
    let mut harness = TestHarness::new(top);
    harness.run();
    assert_eq!(harness.global("y"), Vector::from(5.0));
    let context = harness.context.as_ref().unwrap();
    assert_eq!(context.logs.len(), 1);
}

/// Imported bindings are visible to the rest of the importing program.
#[test]
fn test_import_binds_module_globals() {
    let module = Top::new(vec![
        let_one("shade", lit(0.5)),
        let_one("scale", lit(4.0)),
    ]);
    let root = Top::new(vec![
        Expression::Import {
            names: vec![Rc::from("shade"), Rc::from("scale")],
            filename: Box::new(Expression::Literal(Vector::from("colours.fl"))),
        },
        let_one("combined", mul(name("shade"), name("scale"))),
    ]);
    let mut loader = MapLoader::default().with_module("colours.fl", module);
    let mut harness = TestHarness::new_unsimplified(root);
    harness.run_with_loader(&mut loader);
    assert!(harness.errors().is_empty(), "{:?}", harness.errors());
    assert_eq!(harness.global("combined"), Vector::from(2.0));
}

/// A multi-binding destructures its vector across names, wrapping when
/// the value is short.
#[test]
fn test_destructuring_let() {
    let top = Top::new(vec![Expression::Let {
        bindings: vec![PolyBinding::new(
            &["x", "y", "z"],
            Expression::Literal(Vector::from(vec![5.0, 10.0])),
        )],
    }]);
    let mut harness = TestHarness::new_unsimplified(top);
    harness.run();
    assert_eq!(harness.global("x"), Vector::from(5.0));
    assert_eq!(harness.global("y"), Vector::from(10.0));
    assert_eq!(harness.global("z"), Vector::from(5.0));
}

/// Nested appends compose into the parent in document order.
#[test]
fn test_append_builds_nested_graph() {
    let inner = Expression::Sequence(vec![node("leaf"), node("leaf")]);
    let top = Top::new(vec![Expression::Append {
        node: Box::new(node("group")),
        children: Box::new(inner),
    }]);
    let mut harness = TestHarness::new_unsimplified(top);
    harness.run();
    let children = harness.children();
    assert_eq!(children.len(), 1);
    assert_eq!(&*children[0].kind(), "group");
    assert_eq!(children[0].child_count(), 2);
}

/// The same literal expression used under two parents yields distinct
/// node copies, not shared children.
#[test]
fn test_literal_nodes_do_not_alias_between_parents() {
    let shared = let_one("n", node("dot"));
    let top = Top::new(vec![
        shared,
        Expression::Append {
            node: Box::new(node("left")),
            children: Box::new(name("n")),
        },
        Expression::Append {
            node: Box::new(node("right")),
            children: Box::new(name("n")),
        },
    ]);
    let mut harness = TestHarness::new_unsimplified(top);
    harness.run();
    let children = harness.children();
    let left_child = &children[0].children()[0];
    let right_child = &children[1].children()[0];
    assert!(!left_child.ptr_eq(right_child));
    left_child.set_attribute("x", Vector::from(1.0));
    assert!(right_child.get_attribute("x").is_none());
}

/// Errors recorded across a frame are deduplicated.
#[test]
fn test_errors_are_deduplicated() {
    let top = Top::new(vec![
        let_one("a", name("missing")),
        let_one("b", name("missing")),
    ]);
    let mut harness = TestHarness::new_unsimplified(top);
    harness.run();
    assert_eq!(harness.errors(), vec!["Unbound name 'missing'".to_string()]);
}

/// State persists across frames through the harness, like the engine's
/// frame loop.
#[test]
fn test_state_persists_across_frames() {
    let writer = Top::new(vec![attributes(
        node("store"),
        vec![
            ("key", Expression::Literal(Vector::symbol("count"))),
            (
                "value",
                add(
                    Expression::Lookup(Box::new(Expression::Literal(Vector::symbol("count")))),
                    lit(1.0),
                ),
            ),
        ],
    )]);
    let mut harness = TestHarness::new_unsimplified(writer);
    harness.set_state(Vector::symbol("count"), Vector::from(0.0));
    for _ in 0..3 {
        harness.run();
        harness.apply_store_nodes();
    }
    assert_eq!(
        harness.state().get(&Vector::symbol("count")),
        Vector::from(3.0)
    );
}

/// `MathsOp` broadcasting reaches the VM intact: a length-1 operand
/// cycles over a longer one.
#[test]
fn test_vector_broadcast_end_to_end() {
    let top = Top::new(vec![let_one(
        "out",
        mul(
            Expression::Literal(Vector::from(vec![1.0, 2.0, 3.0])),
            name("scale"),
        ),
    )]);
    let mut harness = TestHarness::new_unsimplified(top);
    let mut variables: IndexMap<Rc<str>, Vector> = IndexMap::new();
    variables.insert(Rc::from("scale"), Vector::from(10.0));
    harness.run_with_variables(variables);
    assert_eq!(harness.global("out"), Vector::from(vec![10.0, 20.0, 30.0]));
}
