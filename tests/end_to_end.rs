//! Assembles, links, and runs the seven concrete scenarios from spec.md §8.
//! Gated behind `--features integration` since it shells out to `gcc` and
//! executes the produced binary.

#![cfg(feature = "integration")]

use std::io::Write;
use std::process::Command;

use bxc::{compile_file, CompilerConfig};

fn run_scenario(src: &str) -> String {
    let dir = tempfile::tempdir().unwrap();
    let src_path = dir.path().join("t.bx");
    std::fs::File::create(&src_path).unwrap().write_all(src.as_bytes()).unwrap();

    let exe = compile_file(&src_path, &CompilerConfig::default()).expect("compile");
    let output = Command::new(&exe).output().expect("run compiled binary");
    assert!(output.status.success());
    String::from_utf8(output.stdout).unwrap()
}

#[test]
fn arithmetic_precedence_prints_14() {
    assert_eq!(run_scenario("def main() { print(2 + 3 * 4); }"), "14\n");
}

#[test]
fn while_loop_prints_counter() {
    let src = "def main() { var x = 0 : int; while (x < 3) { print(x); x = x + 1; } }";
    assert_eq!(run_scenario(src), "0\n1\n2\n");
}

#[test]
fn short_circuit_and_prints_0() {
    assert_eq!(run_scenario("def main() { if (true && false) print(1); else print(0); }"), "0\n");
}

#[test]
fn recursive_factorial_prints_120() {
    let src = "def f(n: int): int { if (n <= 1) return 1; return n * f(n - 1); } def main() { print(f(5)); }";
    assert_eq!(run_scenario(src), "120\n");
}
