use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use float_cmp::assert_approx_eq;

use vecscript::bytecode::jumps::token_boundaries;
use vecscript::bytecode::op::ScriptOp;
use vecscript::compiler::CompileError;
use vecscript::{
    CompiledScript, Compiler, CompilerOptions, Engine, ExitStatus, Interpreter, InterpreterConfig,
    NativeFunction, Value,
};

fn compile(engine: &Engine, source: &str) -> CompiledScript {
    compile_with(engine, source, &CompilerOptions::default())
}

fn compile_with(engine: &Engine, source: &str, options: &CompilerOptions) -> CompiledScript {
    match Compiler::new(engine).compile(source, options) {
        Ok(script) => script,
        Err(failure) => panic!("'{}' failed to compile: {}", source, failure),
    }
}

/// Op bytes at instruction boundaries, skipping operands and immediates.
fn ops(script: &CompiledScript) -> Vec<u8> {
    let code = script.package.code();
    token_boundaries(code).into_iter().map(|b| code[b]).collect()
}

#[test]
fn simple_assignment() {
    let engine = Engine::new();
    let script = compile(&engine, "a = 1 + 2 * 3;");
    let mut package = script.new_package();
    assert_eq!(Interpreter::new(&engine).execute(&mut package), ExitStatus::Success);
    assert_eq!(script.get(&package, "a").unwrap(), Value::scalar(7.0));
}

#[test]
fn fused_multiply_add() {
    let engine = Engine::new();
    let source = "#input x\n#input y\n#input z\na = x + y * z;";
    let fused = compile(&engine, source);
    let plain = compile_with(&engine, source, &CompilerOptions::default().with_optimize(false));

    assert!(ops(&fused).contains(&ScriptOp::Fma.byte()));
    assert!(!ops(&plain).contains(&ScriptOp::Fma.byte()));

    for script in [&fused, &plain] {
        let mut package = script.new_package();
        script.set(&mut package, "x", Value::scalar(1.0)).unwrap();
        script.set(&mut package, "y", Value::scalar(2.0)).unwrap();
        script.set(&mut package, "z", Value::scalar(3.0)).unwrap();
        assert_eq!(Interpreter::new(&engine).execute(&mut package), ExitStatus::Success);
        assert_eq!(script.get(&package, "a").unwrap(), Value::scalar(7.0));
    }
}

#[test]
fn fused_vector_operands() {
    let engine = Engine::new();
    let source = "#input x 3\n#input y 3\n#input z 3\na = x + y * z;";
    let fused = compile(&engine, source);
    let plain = compile_with(&engine, source, &CompilerOptions::default().with_optimize(false));

    let run = |script: &CompiledScript| {
        let mut package = script.new_package();
        script.set(&mut package, "x", Value::from_slice(&[0.5, 1.0, -2.0])).unwrap();
        script.set(&mut package, "y", Value::from_slice(&[3.0, 0.25, 4.0])).unwrap();
        script.set(&mut package, "z", Value::from_slice(&[1.5, 8.0, -0.5])).unwrap();
        assert_eq!(Interpreter::new(&engine).execute(&mut package), ExitStatus::Success);
        script.get(&package, "a").unwrap()
    };
    let (a, b) = (run(&fused), run(&plain));
    assert_eq!(a.size, 3);
    for (x, y) in a.components().iter().zip(b.components()) {
        assert_approx_eq!(f32, *x, *y, ulps = 2);
    }
}

#[test]
fn conditional_branch() {
    let engine = Engine::new();
    let script = compile(&engine, "a = 0; if (a == 0) a = 5; else a = 10;");
    let mut package = script.new_package();
    assert_eq!(Interpreter::new(&engine).execute(&mut package), ExitStatus::Success);
    assert_eq!(script.get(&package, "a").unwrap(), Value::scalar(5.0));
}

#[test]
fn external_call_and_validation_mode() {
    let engine = Engine::new();
    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();
    engine
        .register_function(
            "double",
            NativeFunction::unary(move |x| {
                flag.store(true, Ordering::SeqCst);
                x * 2.0
            }),
        )
        .unwrap();

    let script = compile(&engine, "a = double(21);");
    let mut package = script.new_package();
    let status = Interpreter::new(&engine)
        .validation_mode(true)
        .execute(&mut package);
    assert_eq!(status, ExitStatus::Success);
    assert_eq!(script.get(&package, "a").unwrap(), Value::scalar(0.0));
    assert!(!called.load(Ordering::SeqCst));

    let mut package = script.new_package();
    assert_eq!(Interpreter::new(&engine).execute(&mut package), ExitStatus::Success);
    assert_eq!(script.get(&package, "a").unwrap(), Value::scalar(42.0));
    assert!(called.load(Ordering::SeqCst));
}

#[test]
fn replaced_function_pointer_is_used() {
    let engine = Engine::new();
    let id = engine
        .register_function("scale", NativeFunction::binary(|x, y| x * y))
        .unwrap();
    let script = compile(&engine, "a = scale(3, 4);");

    engine
        .update_function_pointer(id, NativeFunction::binary(|x, y| x + y))
        .unwrap();
    let mut package = script.new_package();
    assert_eq!(Interpreter::new(&engine).execute(&mut package), ExitStatus::Success);
    assert_eq!(script.get(&package, "a").unwrap(), Value::scalar(7.0));
}

#[test]
fn yield_and_resume() {
    let engine = Engine::new();
    let script = compile(&engine, "yield 2;");
    let mut package = script.new_package();
    let mut interpreter = Interpreter::new(&engine);

    assert_eq!(interpreter.execute(&mut package), ExitStatus::Yield);
    assert_eq!(interpreter.resume(&mut package), ExitStatus::Yield);
    assert_eq!(interpreter.resume(&mut package), ExitStatus::Success);
    assert!(!package.is_suspended());
}

#[test]
fn resume_on_another_interpreter() {
    let engine = Engine::new();
    let script = compile(&engine, "a = 1; yield; a = a + 1;");
    let mut package = script.new_package();

    assert_eq!(Interpreter::new(&engine).execute(&mut package), ExitStatus::Yield);
    assert_eq!(Interpreter::new(&engine).resume(&mut package), ExitStatus::Success);
    assert_eq!(script.get(&package, "a").unwrap(), Value::scalar(2.0));
}

#[test]
fn endless_loop_hits_iteration_cap() {
    let engine = Engine::new();
    let script = compile(&engine, "a = 0; while (1) { a = a + 1; }");
    let mut package = script.new_package();
    let config = InterpreterConfig {
        max_iterations: 100,
        ..InterpreterConfig::default()
    };
    let status = Interpreter::with_config(&engine, config).execute(&mut package);
    assert_eq!(status, ExitStatus::ErrorMaxIterations);
    assert!(status.is_error());
}

#[test]
fn stack_discipline() {
    let engine = Engine::new();
    let script = compile(&engine, "push(1 2 3); push(4); b = pop; a = pop;");
    let mut package = script.new_package();
    let mut interpreter = Interpreter::new(&engine);
    assert_eq!(interpreter.execute(&mut package), ExitStatus::Success);
    assert_eq!(script.get(&package, "b").unwrap(), Value::scalar(4.0));
    assert_eq!(script.get(&package, "a").unwrap().components(), &[1.0, 2.0, 3.0]);
    assert_eq!(package.stack_offset(), 0);
    assert_eq!(interpreter.max_stack_values(), 2);
}

#[test]
fn unmatched_pop_is_rejected_at_compile_time() {
    let engine = Engine::new();
    let failure = Compiler::new(&engine)
        .compile("a = pop;", &CompilerOptions::default())
        .unwrap_err();
    assert!(matches!(failure.error, CompileError::StackUnderflow { .. }));
    assert!(!failure.diagnostics.is_empty());
}

#[test]
fn id_cannot_be_popped_as_number() {
    let engine = Engine::new();
    let script = compile(&engine, "#input target id\npush(target); a = pop;");
    let mut package = script.new_package();
    script.set_id(&mut package, "target", 7).unwrap();

    let config = InterpreterConfig {
        validate_metadata: true,
        ..InterpreterConfig::default()
    };
    let status = Interpreter::with_config(&engine, config).execute(&mut package);
    assert_eq!(status, ExitStatus::ErrorStackTypeMismatch);
}

#[test]
fn vector_growth_past_four_fails() {
    let engine = Engine::new();
    let script = compile(&engine, "#input v 4\na = v;");
    assert_eq!(script.variable("v").unwrap().vector_size, 4);

    let err = Compiler::new(&engine)
        .compile("#input v 4\na = v 1;", &CompilerOptions::default())
        .unwrap_err();
    assert!(matches!(err.error, CompileError::VectorSizeMismatch { .. }));
}

#[test]
fn jumps_land_on_instruction_boundaries() {
    let engine = Engine::new();
    let source = "
        i = 0; s = 0;
        while (i < 10) {
            i = i + 1;
            if (i == 3) { s = s + 100; } else { s = s + i; }
        }
        for (j = 0; j < 4; j = j + 1) { s = s - j; }
        if (!s) s = -1;
    ";
    let script = compile(&engine, source);
    let code = script.package.code();
    let boundaries = token_boundaries(code);

    let mut jumps = 0;
    for &pos in &boundaries {
        let Some(op) = ScriptOp::from_byte(code[pos]) else {
            continue;
        };
        let p = pos + 1;
        let target = match op {
            ScriptOp::Jz | ScriptOp::Jnz | ScriptOp::Jump => p + code[p] as usize,
            ScriptOp::JumpBack => p - code[p] as usize,
            _ => continue,
        };
        jumps += 1;
        assert!(
            target == code.len() || boundaries.contains(&target),
            "{} at {} lands inside an instruction at {}",
            op.name(),
            pos,
            target
        );
    }
    assert!(jumps >= 4);

    let mut package = script.new_package();
    assert_eq!(Interpreter::new(&engine).execute(&mut package), ExitStatus::Success);
    // 1+2+4+..+10 plus 100, minus 0+1+2+3
    assert_eq!(script.get(&package, "s").unwrap(), Value::scalar(146.0));
}

#[test]
fn define_substitutes_identifiers() {
    let engine = Engine::new();
    let script = compile(&engine, "#define speed 4\na = speed * 2;");
    let mut package = script.new_package();
    assert_eq!(Interpreter::new(&engine).execute(&mut package), ExitStatus::Success);
    assert_eq!(script.get(&package, "a").unwrap(), Value::scalar(8.0));
}

#[test]
fn builtins_on_vectors() {
    let engine = Engine::new();
    let script = compile(
        &engine,
        "v = 3 0 4 0; l = length(v); n = normalize(v); m = max(1 5, 4 2); c = clamp(7, 0, 5);",
    );
    let mut package = script.new_package();
    assert_eq!(Interpreter::new(&engine).execute(&mut package), ExitStatus::Success);
    assert_approx_eq!(f32, script.get(&package, "l").unwrap().x(), 5.0, ulps = 2);
    let n = script.get(&package, "n").unwrap();
    assert_approx_eq!(f32, n.lane(0), 0.6, epsilon = 1e-6);
    assert_approx_eq!(f32, n.lane(2), 0.8, epsilon = 1e-6);
    assert_eq!(script.get(&package, "m").unwrap().components(), &[4.0, 5.0]);
    assert_eq!(script.get(&package, "c").unwrap(), Value::scalar(5.0));
}

#[test]
fn seeded_random_is_repeatable() {
    let engine = Engine::new();
    let script = compile(&engine, "seed(42); a = random(); b = random(10, 20);");

    let run = || {
        let mut package = script.new_package();
        assert_eq!(Interpreter::new(&engine).execute(&mut package), ExitStatus::Success);
        (script.get(&package, "a").unwrap(), script.get(&package, "b").unwrap())
    };
    let (a, b) = run();
    assert_eq!(run(), (a, b));
    assert!((0.0..1.0).contains(&a.x()));
    assert!((10.0..20.0).contains(&b.x()));
}

#[test]
fn compiled_script_survives_serialization() {
    let engine = Engine::new();
    let script = compile(&engine, "#input p 2 1 2\n#output r\nr = p * 2;");
    let back = CompiledScript::from_bytes(&script.to_bytes().unwrap()).unwrap();
    assert_eq!(back, script);

    let mut package = back.new_package();
    assert_eq!(Interpreter::new(&engine).execute(&mut package), ExitStatus::Success);
    assert_eq!(back.get(&package, "r").unwrap().components(), &[2.0, 4.0]);
}

#[test]
fn interpreters_share_one_engine_across_threads() {
    let engine = Engine::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    engine
        .register_function(
            "tick",
            NativeFunction::unary(move |x| {
                counter.fetch_add(1, Ordering::Relaxed);
                x + 1.0
            }),
        )
        .unwrap();
    let script = compile(&engine, "#input seed_value\na = tick(seed_value) * 2;");
    let id = engine.add_script(script);

    std::thread::scope(|scope| {
        for n in 0..4 {
            let engine = &engine;
            scope.spawn(move || {
                let script = engine.script(id).unwrap();
                let mut package = script.new_package();
                script.set(&mut package, "seed_value", Value::scalar(n as f32)).unwrap();
                let status = Interpreter::new(engine).execute(&mut package);
                assert_eq!(status, ExitStatus::Success);
                assert_eq!(script.get(&package, "a").unwrap(), Value::scalar((n as f32 + 1.0) * 2.0));
            });
        }
    });
    assert_eq!(calls.load(Ordering::Relaxed), 4);
    assert!(engine.remove_script(id).is_some());
}
