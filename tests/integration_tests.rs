// Integration tests for the Ruff interpreter.
//
// These run complete programs through the public VM entry point and check
// the observable output or error outcome, mirroring the teacher's own
// integration-test style of exercising whole programs rather than isolated
// internal functions.

use ruff::errors::RuffError;
use ruff::vm::VM;
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

struct SharedWriter(Rc<RefCell<Vec<u8>>>);

impl Write for SharedWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(data);
        Ok(data.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run(source: &str) -> Result<String, Vec<RuffError>> {
    let buf = Rc::new(RefCell::new(Vec::new()));
    let mut vm = VM::with_writer(Box::new(SharedWriter(buf.clone())));
    vm.run_source(source, None)?;
    Ok(String::from_utf8(buf.borrow().clone()).unwrap())
}

#[test]
fn arrays_index_and_mutate() {
    let out = run(
        "var arr = [1, 2, 3]; \
         arr[1] = 99; \
         print arr[0]; \
         print arr[1]; \
         print arr[2];",
    )
    .unwrap();
    assert_eq!(out, "1\n99\n3\n");
}

#[test]
fn dicts_insert_and_lookup() {
    let out = run(
        "var d = {\"a\": 1, \"b\": 2}; \
         d[\"c\"] = 3; \
         print d[\"a\"]; \
         print d[\"c\"];",
    )
    .unwrap();
    assert_eq!(out, "1\n3\n");
}

#[test]
fn recursive_function_computes_factorial() {
    let out = run(
        "function fact(i64 n) -> i64 { if (n < 2) { return 1; } return n * fact(n - 1); } \
         print fact(6);",
    )
    .unwrap();
    assert_eq!(out, "720\n");
}

#[test]
fn if_else_chain_selects_correct_branch() {
    let out = run(
        "function classify(i64 n) -> str { \
             if (n < 0) { return \"negative\"; } \
             else if (n == 0) { return \"zero\"; } \
             else { return \"positive\"; } \
         } \
         print classify(-3); \
         print classify(0); \
         print classify(7);",
    )
    .unwrap();
    assert_eq!(out, "negative\nzero\npositive\n");
}

#[test]
fn class_construction_and_field_access() {
    let out = run(
        "class Point { init(i64 x, i64 y) { this.x = x; this.y = y; } \
            sum() -> i64 { return this.x + this.y; } } \
         var p = Point(3, 4); \
         print p.sum();",
    )
    .unwrap();
    assert_eq!(out, "7\n");
}

#[test]
fn string_concatenation_with_plus() {
    let out = run("print \"Hello, \" + \"World\";").unwrap();
    assert_eq!(out, "Hello, World\n");
}

#[test]
fn native_length_function_on_array() {
    let out = run("print len([1, 2, 3, 4]);").unwrap();
    assert_eq!(out, "4\n");
}

#[test]
fn array_index_out_of_bounds_is_a_runtime_error() {
    let result = run("var arr = [1, 2, 3]; print arr[10];");
    assert!(result.is_err());
}

#[test]
fn undefined_variable_is_a_compile_error() {
    let result = run("print thisNameDoesNotExist;");
    assert!(result.is_err());
}

#[test]
fn module_import_binds_exported_function() {
    let dir = std::env::temp_dir().join(format!("ruff_integration_test_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let module_path = dir.join("math_utils.ruff");
    std::fs::write(&module_path, "export function square(i64 n) -> i64 { return n * n; }").unwrap();
    let main_path = dir.join("main.ruff");
    std::fs::write(
        &main_path,
        "import square from \"./math_utils.ruff\"; print square(5);",
    )
    .unwrap();

    let source = std::fs::read_to_string(&main_path).unwrap();
    let buf = Rc::new(RefCell::new(Vec::new()));
    let mut vm = VM::with_writer(Box::new(SharedWriter(buf.clone())));
    vm.run_source(&source, Some(main_path.to_string_lossy().into_owned())).unwrap();
    let out = String::from_utf8(buf.borrow().clone()).unwrap();
    assert_eq!(out, "25\n");

    let _ = std::fs::remove_dir_all(&dir);
}
