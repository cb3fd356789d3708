//! Command-line driver for the Ark toolchain.
//!
//! ```text
//! ark run   <file.ark>            compile and execute a source file
//! ark build <file.ark> [-o FILE]  compile a source file to a container
//! ark exec  <file.arkc>           execute a compiled container
//! ```
//!
//! Pass `-v` (debug) or `-vv` (trace) to raise log verbosity.

use std::path::PathBuf;
use std::process::ExitCode;

use ark::compiler::Compiler;
use ark::value::Value;
use ark::vm::Vm;
use ark::ArkResult;

fn main() -> ExitCode {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    let verbosity = args.iter().fold(0usize, |acc, a| match a.as_str() {
        "-v" => acc + 1,
        "-vv" => acc + 2,
        _ => acc,
    });
    args.retain(|a| a != "-v" && a != "-vv");

    let level = match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let result = match args.split_first() {
        Some((cmd, rest)) if cmd == "run" => run(rest),
        Some((cmd, rest)) if cmd == "build" => build(rest),
        Some((cmd, rest)) if cmd == "exec" => exec(rest),
        // Bare file argument: treat as `run`.
        Some((file, [])) if !file.starts_with('-') => run(&[file.clone()]),
        _ => {
            usage();
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{error}");
            ExitCode::FAILURE
        }
    }
}

fn usage() {
    eprintln!("usage: ark [-v|-vv] <run|build|exec> <file> [-o output]");
}

fn run(args: &[String]) -> ArkResult<()> {
    let path = expect_file(args)?;
    let source = std::fs::read_to_string(&path)?;
    let result = ark::run_source(&source, &path.to_string_lossy())?;
    if result != Value::Nil {
        println!("{result}");
    }
    Ok(())
}

fn build(args: &[String]) -> ArkResult<()> {
    let path = expect_file(args)?;
    let output = args
        .iter()
        .position(|a| a == "-o")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .unwrap_or_else(|| path.with_extension("arkc"));

    let source = std::fs::read_to_string(&path)?;
    let mut compiler = Compiler::new(0, Vec::new(), 0);
    compiler.feed(&source, &path.to_string_lossy())?;
    compiler.compile()?;
    compiler.save_to(&output)?;
    println!("wrote {}", output.display());
    Ok(())
}

fn exec(args: &[String]) -> ArkResult<()> {
    let path = expect_file(args)?;
    let mut machine = Vm::new(false);
    machine.feed(&path)?;
    let result = machine.run()?;
    if result != Value::Nil {
        println!("{result}");
    }
    Ok(())
}

/// First positional argument, skipping flags and the `-o` output value.
fn expect_file(args: &[String]) -> ArkResult<PathBuf> {
    let mut skip_next = false;
    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg == "-o" {
            skip_next = true;
            continue;
        }
        if !arg.starts_with('-') {
            return Ok(PathBuf::from(arg));
        }
    }
    Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "missing input file").into())
}
