//! Property tests over generated expressions.
//!
//! - Compiling the same source twice gives identical packages.
//! - A second optimizer pass over optimized code rewrites nothing.
//! - Optimized and unoptimized code compute the same results, for scalar
//!   operands and for vectors mixed with scalars.
//! - Juxtaposition grows a vector up to four components and fails past that.

use float_cmp::approx_eq;
use proptest::prelude::*;
use proptest::sample::select;

use vecscript::bytecode::optimize::optimize;
use vecscript::compiler::CompileError;
use vecscript::{CompiledScript, Compiler, CompilerOptions, Engine, ExitStatus, Interpreter, Value};

const BINARY: &[&str] = &[
    "+", "-", "*", "/", "&", "|", "^", "<", ">", "<=", ">=", "==", "!=",
];
const UNARY: &[&str] = &["-", "!"];

/// `p q r` take the vector size under test, `x y` are always scalars.
fn header(size: u8) -> String {
    format!("#input p {size}\n#input q {size}\n#input r {size}\n#input x\n#input y\n")
}

fn leaf() -> impl Strategy<Value = String> {
    let name = select(&["p", "q", "r", "x", "y"][..]).prop_map(str::to_string);
    prop_oneof![
        3 => name.clone(),
        1 => (select(UNARY), name).prop_map(|(u, n)| format!("{}{}", u, n)),
        1 => (1u8..10).prop_map(|n| n.to_string()),
        1 => (1u8..40).prop_map(|n| format!("{}.{}", n / 10, n % 10)),
    ]
}

fn expression() -> impl Strategy<Value = String> {
    leaf().prop_recursive(4, 24, 3, |inner| {
        prop_oneof![
            3 => (inner.clone(), select(BINARY), inner.clone())
                .prop_map(|(a, op, b)| format!("{} {} {}", a, op, b)),
            1 => (select(UNARY), inner.clone()).prop_map(|(u, e)| format!("{}({})", u, e)),
            1 => inner.prop_map(|e| format!("({})", e)),
        ]
    })
}

fn lane() -> impl Strategy<Value = f32> {
    (-40i32..40).prop_map(|n| n as f32 / 4.0)
}

/// Values for `p q r` (truncated to the size) followed by `x y`.
fn inputs() -> impl Strategy<Value = ([[f32; 4]; 3], [f32; 2])> {
    (
        prop::array::uniform3(prop::array::uniform4(lane())),
        prop::array::uniform2(lane()),
    )
}

fn compile(engine: &Engine, source: &str, optimize: bool) -> CompiledScript {
    let options = CompilerOptions::default().with_optimize(optimize);
    match Compiler::new(engine).compile(source, &options) {
        Ok(script) => script,
        Err(failure) => panic!("'{}' failed to compile: {}", source, failure),
    }
}

fn evaluate(
    engine: &Engine,
    script: &CompiledScript,
    size: u8,
    (vectors, scalars): &([[f32; 4]; 3], [f32; 2]),
) -> Value {
    let mut package = script.new_package();
    for (name, lanes) in ["p", "q", "r"].iter().zip(vectors) {
        let value = Value::from_slice(&lanes[..size as usize]);
        script.set(&mut package, name, value).unwrap();
    }
    for (name, x) in ["x", "y"].iter().zip(scalars) {
        script.set(&mut package, name, Value::scalar(*x)).unwrap();
    }
    assert_eq!(Interpreter::new(engine).execute(&mut package), ExitStatus::Success);
    script.get(&package, "a").unwrap()
}

fn same_lane(a: f32, b: f32) -> bool {
    a == b || (a.is_nan() && b.is_nan()) || approx_eq!(f32, a, b, epsilon = 1e-3, ulps = 4)
}

proptest! {
    #[test]
    fn compilation_is_deterministic(expr in expression(), size in 1u8..=4) {
        let engine = Engine::new();
        let source = format!("{}a = {};", header(size), expr);
        let first = compile(&engine, &source, true);
        let second = compile(&engine, &source, true);
        prop_assert_eq!(first.package.bytes(), second.package.bytes());
        prop_assert_eq!(first.variables, second.variables);
    }

    #[test]
    fn optimizer_is_idempotent(expr in expression(), size in 1u8..=4) {
        let engine = Engine::new();
        let source = format!("{}a = {}; b = a * ({});", header(size), expr, expr);
        let job = Compiler::new(&engine)
            .compile_job(&source, &CompilerOptions::default())
            .unwrap();
        let mut code = job.code.clone();
        prop_assert_eq!(optimize(&mut code, &job.slot_sizes()), 0);
        prop_assert_eq!(code, job.code);
    }

    #[test]
    fn optimization_preserves_results(
        expr in expression(),
        size in 1u8..=4,
        values in inputs(),
    ) {
        let engine = Engine::new();
        let source = format!("{}a = {};", header(size), expr);
        let fast = evaluate(&engine, &compile(&engine, &source, true), size, &values);
        let slow = evaluate(&engine, &compile(&engine, &source, false), size, &values);
        prop_assert_eq!(fast.size, slow.size);
        for (a, b) in fast.components().iter().zip(slow.components()) {
            prop_assert!(
                same_lane(*a, *b),
                "{} gave {} optimized and {} unoptimized",
                expr,
                fast,
                slow
            );
        }
    }

    #[test]
    fn juxtaposition_grows_up_to_four(count in 1usize..7) {
        let engine = Engine::new();
        let operands: Vec<String> = (1..=count).map(|n| n.to_string()).collect();
        let source = format!("a = {};", operands.join(" "));
        let result = Compiler::new(&engine).compile(&source, &CompilerOptions::default());

        if count <= 4 {
            let script = result.unwrap();
            prop_assert_eq!(script.variable("a").unwrap().vector_size as usize, count);
            let mut package = script.new_package();
            prop_assert_eq!(Interpreter::new(&engine).execute(&mut package), ExitStatus::Success);
            let expected: Vec<f32> = (1..=count).map(|n| n as f32).collect();
            let value = script.get(&package, "a").unwrap();
            prop_assert_eq!(value.components(), expected.as_slice());
        } else {
            let failure = result.unwrap_err();
            let is_size_error = matches!(failure.error, CompileError::VectorSizeMismatch { .. });
            prop_assert!(is_size_error, "{} failed with {}", source, failure.error);
        }
    }
}

#[test]
fn chains_fuse_for_scalars_and_stay_for_mixed_sizes() {
    use vecscript::bytecode::jumps::token_boundaries;
    use vecscript::bytecode::op::ScriptOp;

    let engine = Engine::new();
    let ops = |source: &str| {
        let script = compile(&engine, source, true);
        let code = script.package.code().to_vec();
        token_boundaries(&code).into_iter().map(|b| code[b]).collect::<Vec<u8>>()
    };

    let scalar = ops(&format!("{}a = x / y / 2; b = x & y & 3; c = x | y | 0;", header(1)));
    assert!(scalar.contains(&ScriptOp::DivA.byte()));
    assert!(scalar.contains(&ScriptOp::All.byte()));
    assert!(scalar.contains(&ScriptOp::Any.byte()));

    let fsm = ops(&format!("{}a = x - (y * 2);", header(1)));
    assert!(fsm.contains(&ScriptOp::Fsm.byte()));

    let mixed = ops(&format!("{}a = p * x * q;", header(3)));
    assert!(!mixed.contains(&ScriptOp::MulA.byte()));
}
