use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser as ClapParser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use vecscript::frontend::lexer::Lexer;
use vecscript::frontend::token_dumper::TokenDumper;
use vecscript::{CompiledScript, Compiler, CompilerOptions, Engine, Interpreter, Package, Value};

#[derive(ClapParser, Debug)]
#[command(name = "vecscript", about = "Compile and run a vector script")]
struct Args {
    /// Script file (.vs)
    file: PathBuf,

    /// Show tokens only
    #[arg(long)]
    tokens: bool,

    /// Show the syntax tree after flattening
    #[arg(long)]
    ast: bool,

    /// Show the disassembled byte code
    #[arg(long)]
    bc: bool,

    #[arg(long)]
    no_optimize: bool,

    #[arg(long)]
    no_color: bool,

    /// Print token source text instead of the debug form
    #[arg(long)]
    pretty: bool,

    /// Input values, e.g. `--set speed=1,2,3 --set scale=2`
    #[arg(long, value_name = "NAME=V,..")]
    set: Vec<String>,
}

fn main() -> ExitCode {
    Registry::default()
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    ensure_extension(&args.file);

    let source = match std::fs::read_to_string(&args.file) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Failed to read '{}': {}", args.file.display(), e);
            return ExitCode::FAILURE;
        }
    };

    if args.tokens {
        return dump_tokens(&source, args.no_color, args.pretty);
    }
    run_program(&source, &args)
}

fn ensure_extension(path: &Path) {
    if path.extension().and_then(|e| e.to_str()) != Some("vs") {
        eprintln!("Warning: expected a .vs file, got {}", path.display());
    }
}

fn dump_tokens(source: &str, no_color: bool, pretty: bool) -> ExitCode {
    match Lexer::new(source).tokenize() {
        Ok(tokens) => {
            let mut dumper = TokenDumper::new();
            if no_color {
                dumper = dumper.no_color();
            }
            if pretty {
                dumper = dumper.pretty();
            }
            dumper.dump(&tokens);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Lexer error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_program(source: &str, args: &Args) -> ExitCode {
    let engine = Engine::new();
    let options = CompilerOptions::default().with_optimize(!args.no_optimize);

    let job = match Compiler::new(&engine).compile_job(source, &options) {
        Ok(job) => job,
        Err(failure) => {
            for diagnostic in &failure.diagnostics {
                eprintln!("{}", diagnostic);
            }
            eprintln!("Compile error: {}", failure);
            return ExitCode::FAILURE;
        }
    };

    if args.ast {
        println!("=== SYNTAX TREE ===");
        print!("{}", job.root.to_tree_string());
    }

    let script = match CompiledScript::from_job(job) {
        Ok(script) => script,
        Err(e) => {
            eprintln!("Compile error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    for diagnostic in &script.diagnostics {
        eprintln!("{}", diagnostic);
    }

    if args.bc {
        println!("=== BYTE CODE ===");
        print!("{}", script.disassemble());
    }

    let mut package = script.new_package();
    for assignment in &args.set {
        if let Err(e) = apply_input(&script, &mut package, assignment) {
            eprintln!("Invalid --set '{}': {}", assignment, e);
            return ExitCode::FAILURE;
        }
    }

    let status = Interpreter::new(&engine).execute(&mut package);
    println!("=== {} ===", status);
    for variable in &script.variables {
        match script.get(&package, &variable.name) {
            Ok(value) => println!("{:<16} {}", variable.name, value),
            Err(e) => eprintln!("{}: {}", variable.name, e),
        }
    }

    if status.is_error() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Parses `name=v,..` and writes the value into the package.
fn apply_input(script: &CompiledScript, package: &mut Package, assignment: &str) -> Result<(), String> {
    let (name, values) = assignment
        .split_once('=')
        .ok_or_else(|| "expected NAME=V,..".to_string())?;
    let components = values
        .split(',')
        .map(|v| v.trim().parse::<f32>().map_err(|e| e.to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    if components.is_empty() || components.len() > 4 {
        return Err("a value has 1 to 4 components".to_string());
    }
    script
        .set(package, name.trim(), Value::from_slice(&components))
        .map_err(|e| e.to_string())
}
