use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

// End-to-end: write the script to a temp dir, run the real binary on it and
// look at what the process printed.
fn run_script(source: &str, extra_args: &[&str]) -> Output {
    let dir = tempfile::tempdir().expect("temp dir for script");
    let path: PathBuf = dir.path().join("script.lox");
    fs::write(&path, source).expect("write script");

    Command::new(env!("CARGO_BIN_EXE_myloxc"))
        .args(extra_args)
        .arg(&path)
        .output()
        .expect("run myloxc")
}

fn stdout_of(source: &str) -> String {
    let output = run_script(source, &[]);
    assert!(
        output.status.success(),
        "script failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("utf8 stdout")
}

#[test]
fn arithmetic_precedence() {
    assert_eq!(stdout_of("print 1 + 2 * 3;"), "7\n");
    assert_eq!(stdout_of("print (1 + 2) * 3;"), "9\n");
    assert_eq!(stdout_of("print -2 * 3;"), "-6\n");
}

#[test]
fn string_concatenation() {
    assert_eq!(
        stdout_of("var a = \"foo\"; var b = \"bar\"; print a + b + a;"),
        "foobarfoo\n"
    );
}

#[test]
fn interned_concatenation_is_identical_to_the_literal() {
    assert_eq!(stdout_of("print \"foo\" + \"bar\" == \"foobar\";"), "true\n");
}

#[test]
fn for_loop_accumulates() {
    assert_eq!(
        stdout_of("var x = 0; for (var i = 0; i < 5; i = i + 1) { x = x + i; } print x;"),
        "10\n"
    );
}

#[test]
fn while_loop() {
    assert_eq!(
        stdout_of("var i = 0; while (i < 3) { print i; i = i + 1; }"),
        "0\n1\n2\n"
    );
}

#[test]
fn recursive_fibonacci() {
    assert_eq!(
        stdout_of(
            "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);"
        ),
        "55\n"
    );
}

#[test]
fn closure_counter_keeps_private_state() {
    let source = "fun mk() { var i = 0; fun get() { i = i + 1; return i; } return get; } \
                  var c = mk(); print c(); print c(); print c();";
    assert_eq!(stdout_of(source), "1\n2\n3\n");
}

#[test]
fn sibling_closures_share_one_upvalue() {
    let source = "\
fun mk() {
  var n = 0;
  fun bump() { n = n + 1; }
  fun read() { return n; }
  bump(); bump();
  print read();
}
mk();";
    assert_eq!(stdout_of(source), "2\n");
}

#[test]
fn equality_and_truthiness() {
    assert_eq!(
        stdout_of("print \"a\" == \"a\"; print nil == false; print !nil;"),
        "true\nfalse\ntrue\n"
    );
    assert_eq!(stdout_of("print 0 == false; print \"\" == false;"), "false\nfalse\n");
}

#[test]
fn logical_operators_short_circuit() {
    assert_eq!(stdout_of("print 1 and 2; print nil and 2;"), "2\nnil\n");
    assert_eq!(stdout_of("print 1 or 2; print false or \"x\";"), "1\nx\n");
}

#[test]
fn binding_through_a_variable_matches_the_expression() {
    // var x = E; print x;  ==  print E;  for side-effect-free E
    let direct = stdout_of("print (1 + 2) * 3 - 4 / 2;");
    let bound = stdout_of("var x = (1 + 2) * 3 - 4 / 2; print x;");
    assert_eq!(direct, bound);
}

#[test]
fn block_scoping_shadows_and_restores() {
    let source = "var a = \"outer\"; { var a = \"inner\"; print a; } print a;";
    assert_eq!(stdout_of(source), "inner\nouter\n");
}

#[test]
fn native_clock_is_a_number() {
    assert_eq!(stdout_of("print clock() >= 0;"), "true\n");
}

#[test]
fn recursion_boundary_at_frame_limit() {
    // 1 script frame + 63 nested calls = exactly the 64 frame limit
    let ok = run_script("fun f(n) { if (n > 0) f(n - 1); } f(62);", &[]);
    assert!(ok.status.success(), "64 frames must run");

    let over = run_script("fun f(n) { if (n > 0) f(n - 1); } f(63);", &[]);
    assert_eq!(over.status.code(), Some(70));
    let stderr = String::from_utf8_lossy(&over.stderr);
    assert!(stderr.starts_with("Stack overflow.\n"), "stderr: {}", stderr);
}

#[test]
fn runtime_error_prints_the_traceback() {
    let source = "\
fun addUp() {
  return 1 + nil;
}
addUp();";
    let output = run_script(source, &[]);
    assert_eq!(output.status.code(), Some(70));
    assert_eq!(
        String::from_utf8_lossy(&output.stderr),
        "Operands must be two numbers or two strings.\n\
         [line 2] in addUp()\n\
         [line 4] in script\n"
    );
}

#[test]
fn undefined_variable_is_a_runtime_error() {
    let output = run_script("print missing;", &[]);
    assert_eq!(output.status.code(), Some(70));
    assert!(
        String::from_utf8_lossy(&output.stderr).starts_with("Undefined variable 'missing'.\n")
    );
}

#[test]
fn wrong_arity_reports_expected_and_got() {
    let output = run_script("fun two(a, b) { return a; } two(1);", &[]);
    assert_eq!(output.status.code(), Some(70));
    assert!(
        String::from_utf8_lossy(&output.stderr)
            .starts_with("Expected 2 arguments but got 1.\n")
    );
}

#[test]
fn calling_a_number_is_a_runtime_error() {
    let output = run_script("var x = 7; x();", &[]);
    assert_eq!(output.status.code(), Some(70));
    assert!(
        String::from_utf8_lossy(&output.stderr)
            .starts_with("Can only call functions and classes.\n")
    );
}

#[test]
fn compile_error_exits_65_with_location() {
    let output = run_script("print 1", &[]);
    assert_eq!(output.status.code(), Some(65));
    assert_eq!(
        String::from_utf8_lossy(&output.stderr),
        "[line 1] Error at end: Expect ';' after value.\n"
    );

    let output = run_script("var x = ;", &[]);
    assert_eq!(output.status.code(), Some(65));
    assert_eq!(
        String::from_utf8_lossy(&output.stderr),
        "[line 1] Error at ';': Expect expression.\n"
    );
}

#[test]
fn gc_stress_does_not_change_program_output() {
    let source = "\
fun mk() { var i = 0; fun get() { i = i + 1; return i; } return get; }
var c = mk();
var s = \"\";
for (var j = 0; j < 20; j = j + 1) {
  s = s + \"ab\";
  c();
}
print c();
print s == s + \"\";";
    let plain = run_script(source, &[]);
    let stressed = run_script(source, &["--gc-stress"]);
    assert!(plain.status.success());
    assert!(stressed.status.success());
    assert_eq!(plain.stdout, stressed.stdout);
    assert_eq!(String::from_utf8_lossy(&stressed.stdout), "21\ntrue\n");
}
