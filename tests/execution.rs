//! End-to-end tests: source text through the compiler, the binary container
//! and the VM, checking the final value each program leaves behind.

use ark::compiler::Compiler;
use ark::container::{ContainerError, Image};
use ark::value::Value;
use ark::vm::Vm;
use ark::{run_source, ArkError};

fn compile(src: &str) -> Vec<u8> {
    let mut compiler = Compiler::new(0, Vec::new(), 0);
    compiler.feed(src, "<e2e>").expect("feed failed");
    compiler.compile().expect("compile failed");
    compiler.bytecode().to_vec()
}

fn run(src: &str) -> Value {
    run_source(src, "<e2e>").expect("program should run")
}

// ─────────────────────────────────────────────────────────────────────────────
// Programs
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn multiplication_of_two_bindings() {
    assert_eq!(run("(let x 6) (let y 7) (* x y)"), Value::Number(42.0));
}

#[test]
fn recursive_fibonacci() {
    let src = "(let f (fun (n) (if (< n 2) n (+ (f (- n 1)) (f (- n 2)))))) (f 10)";
    assert_eq!(run(src), Value::Number(55.0));
}

#[test]
fn counter_closure_with_captured_mutable_scope() {
    let src = "(let make (fun (x) (fun (&x) { (set x (+ x 1)) x }))) \
               (let c (make 0)) \
               (c) (c) (c)";
    assert_eq!(run(src), Value::Number(3.0));
}

#[test]
fn list_append_in_place_and_concat() {
    assert_eq!(
        run("(let xs (list 1 2 3)) (append! xs 4) (len xs)"),
        Value::Number(4.0)
    );
    assert_eq!(
        run("(concat (list 1) (list 2 3) (list 4))"),
        Value::list(vec![
            Value::Number(1.0),
            Value::Number(2.0),
            Value::Number(3.0),
            Value::Number(4.0),
        ])
    );
}

#[test]
fn unbound_variable_is_rejected_at_compile_time() {
    let err = run_source("(let a 1) (fun () b)", "<e2e>").unwrap_err();
    match err {
        ArkError::Compile(e) => {
            assert!(e.message.contains("Unbound variable error"), "{}", e.message);
            // The error points at `b`, on the first line of the source.
            assert_eq!(e.span.line, 1);
        }
        other => panic!("expected a compile error, got: {other}"),
    }
}

#[test]
fn corrupted_container_is_rejected_before_execution() {
    let mut bytes = compile("(let x 6) (let y 7) (* x y)");
    // Flip one byte of the code region.
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;

    let mut vm = Vm::new(false);
    let err = vm.feed_bytes(&bytes).unwrap_err();
    assert!(matches!(
        err,
        ArkError::Container(ContainerError::HashMismatch)
    ));
}

// ─────────────────────────────────────────────────────────────────────────────
// Container round-trips
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn decompiled_container_reserialises_byte_for_byte() {
    let sources = [
        "(let x 6) (let y 7) (* x y)",
        "(let f (fun (n) (if (< n 2) n (+ (f (- n 1)) (f (- n 2)))))) (f 10)",
        "(import \"tools.arkm\") (let q '(tools:x)) (mut l (list 1 \"two\" 3.5))",
    ];
    for src in sources {
        let bytes = compile(src);
        let image = Image::read(&bytes).expect("container should load");
        assert_eq!(image.serialize().unwrap(), bytes, "round-trip for {src}");
    }
}

#[test]
fn identical_sources_compile_to_identical_bodies() {
    let a = compile("(let greeting \"hello\") (print greeting)");
    let b = compile("(let greeting \"hello\") (print greeting)");
    // Only the timestamp (offset 10..18) and hash (18..50) may differ.
    assert_eq!(a[..10], b[..10]);
    assert_eq!(a[50..], b[50..]);
}

// ─────────────────────────────────────────────────────────────────────────────
// A slightly larger program exercising most of the instruction set
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn iterative_prime_sieve() {
    let src = "\
        (let prime? (fun (n) {\n\
          (mut d 2)\n\
          (mut ok (> n 1))\n\
          (while (and ok (<= (* d d) n)) {\n\
            (if (= (mod n d) 0) (set ok false) ())\n\
            (set d (+ d 1))\n\
          })\n\
          ok\n\
        }))\n\
        (mut primes (list))\n\
        (mut n 2)\n\
        (while (< n 30) {\n\
          (if (prime? n) (append! primes n) ())\n\
          (set n (+ n 1))\n\
        })\n\
        primes\n";
    assert_eq!(
        run(src),
        Value::list(
            [2.0, 3.0, 5.0, 7.0, 11.0, 13.0, 17.0, 19.0, 23.0, 29.0]
                .into_iter()
                .map(Value::Number)
                .collect()
        )
    );
}
