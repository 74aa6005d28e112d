use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

fn run_kettle(dir: &Path, args: &[&str]) -> (String, String, i32) {
    let output = Command::new(env!("CARGO_BIN_EXE_kettle"))
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to execute kettle");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code().unwrap_or(-1))
}

fn write_image(dir: &TempDir, name: &str, text: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, text).unwrap();
    path.to_str().unwrap().to_string()
}

fn assert_success(dir: &TempDir, args: &[&str]) -> String {
    let (stdout, stderr, code) = run_kettle(dir.path(), args);
    assert_eq!(code, 0, "kettle should succeed, stderr:\n{}", stderr);
    stdout
}

/// `add(II)I` prints and returns the sum; `greet([Ljava/lang/String;)V`
/// prints its first argument.
const CALC: &str = r#"
[[classes]]
name = "demo/Calc"
super = "java/lang/Object"
constants = [
    { methodref = ["kettle/Console", "println", "(I)V"] },
    { methodref = ["kettle/Console", "println", "(Ljava/lang/String;)V"] },
]

[[classes.methods]]
name = "add"
descriptor = "(II)I"
flags = ["public", "static"]
max_stack = 2
max_locals = 2
code = [{ iload = 0 }, { iload = 1 }, "iadd", "dup", { invokestatic = 1 }, "ireturn"]

[[classes.methods]]
name = "greet"
descriptor = "([Ljava/lang/String;)V"
flags = ["public", "static"]
max_stack = 2
max_locals = 1
code = [{ aload = 0 }, { iconst = 0 }, "aaload", { invokestatic = 2 }, "return"]
"#;

/// Recurses 100 frames deep, then prints "done".
const RECURSE: &str = r#"
entry = "demo/Rec.main"

[[classes]]
name = "demo/Rec"
super = "java/lang/Object"
constants = [
    { methodref = ["demo/Rec", "down", "(I)V"] },
    { methodref = ["kettle/Console", "println", "(Ljava/lang/String;)V"] },
    { string = "done" },
]

[[classes.methods]]
name = "down"
descriptor = "(I)V"
flags = ["static"]
max_stack = 2
max_locals = 1
code = [
    { iload = 0 }, { if = ["le", 6] },
    { iload = 0 }, { iconst = 1 }, "isub",
    { invokestatic = 1 },
    "return",
]

[[classes.methods]]
name = "main"
descriptor = "()V"
flags = ["public", "static"]
max_stack = 1
max_locals = 0
code = [{ iconst = 100 }, { invokestatic = 1 }, { ldc = 3 }, { invokestatic = 2 }, "return"]
"#;

#[test]
fn test_run_with_entry_and_args() {
    let dir = TempDir::new().unwrap();
    let image = write_image(&dir, "calc.toml", CALC);
    let stdout = assert_success(
        &dir,
        &["run", &image, "--entry", "demo.Calc.add", "--arg", "40", "--arg", "2"],
    );
    assert_eq!(stdout, "42\n");
}

#[test]
fn test_string_array_entry_receives_all_args() {
    let dir = TempDir::new().unwrap();
    let image = write_image(&dir, "calc.toml", CALC);
    let stdout = assert_success(
        &dir,
        &["run", &image, "--entry", "demo/Calc.greet", "--arg", "hi", "--arg", "there"],
    );
    assert_eq!(stdout, "hi\n");
}

#[test]
fn test_bad_argument_is_fatal() {
    let dir = TempDir::new().unwrap();
    let image = write_image(&dir, "calc.toml", CALC);
    let (_, stderr, code) = run_kettle(
        dir.path(),
        &["run", &image, "--entry", "demo/Calc.add:(II)I", "--arg", "x", "--arg", "2"],
    );
    assert_eq!(code, 2);
    assert!(stderr.contains("x is not a valid I argument"), "stderr:\n{}", stderr);
}

#[test]
fn test_missing_entry_point() {
    let dir = TempDir::new().unwrap();
    let image = write_image(&dir, "calc.toml", CALC);
    let (_, stderr, code) = run_kettle(dir.path(), &["run", &image]);
    assert_eq!(code, 2);
    assert!(stderr.contains("no entry point"), "stderr:\n{}", stderr);
}

#[test]
fn test_json_image() {
    let dir = TempDir::new().unwrap();
    let image = write_image(
        &dir,
        "hello.json",
        r#"{
            "entry": "demo/Hello.main",
            "classes": [{
                "name": "demo/Hello",
                "super": "java/lang/Object",
                "constants": [
                    {"string": "hello"},
                    {"methodref": ["kettle/Console", "println", "(Ljava/lang/String;)V"]}
                ],
                "methods": [{
                    "name": "main",
                    "descriptor": "()V",
                    "flags": ["public", "static"],
                    "max_stack": 1,
                    "code": [{"ldc": 1}, {"invokestatic": 2}, "return"]
                }]
            }]
        }"#,
    );
    assert_eq!(assert_success(&dir, &["run", &image]), "hello\n");
}

#[test]
fn test_max_depth_flag() {
    let dir = TempDir::new().unwrap();
    let image = write_image(&dir, "rec.toml", RECURSE);
    assert_eq!(assert_success(&dir, &["run", &image]), "done\n");

    let (_, stderr, code) = run_kettle(dir.path(), &["run", &image, "--max-depth", "50"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("java.lang.StackOverflowError"), "stderr:\n{}", stderr);
}

#[test]
fn test_config_file_beside_image() {
    let dir = TempDir::new().unwrap();
    let image = write_image(&dir, "rec.toml", RECURSE);
    std::fs::write(dir.path().join("kettle.toml"), "max_call_depth = 20\n").unwrap();

    let (_, stderr, code) = run_kettle(dir.path(), &["run", &image]);
    assert_eq!(code, 1);
    assert!(stderr.contains("java.lang.StackOverflowError"), "stderr:\n{}", stderr);

    // The flag wins over the file.
    assert_eq!(
        assert_success(&dir, &["run", &image, "--max-depth", "500"]),
        "done\n"
    );
}

#[test]
fn test_explicit_config_file() {
    let dir = TempDir::new().unwrap();
    let image = write_image(&dir, "rec.toml", RECURSE);
    let config = write_image(&dir, "tight.toml", "max_call_depth = 10\n");
    let (_, _, code) = run_kettle(dir.path(), &["run", &image, "--config", &config]);
    assert_eq!(code, 1);

    let broken = write_image(&dir, "broken.toml", "max_call_depth = \"deep\"\n");
    let (_, stderr, code) = run_kettle(dir.path(), &["run", &image, "--config", &broken]);
    assert_eq!(code, 2);
    assert!(stderr.contains("failed to parse configuration"), "stderr:\n{}", stderr);
}

#[test]
fn test_no_verify_defers_to_runtime_fault() {
    let dir = TempDir::new().unwrap();
    let image = write_image(
        &dir,
        "bad.toml",
        r#"
entry = "demo/Bad.main"

[[classes]]
name = "demo/Bad"
super = "java/lang/Object"

[[classes.methods]]
name = "main"
descriptor = "()V"
flags = ["public", "static"]
max_stack = 2
code = ["pop", "return"]
"#,
    );
    let (_, stderr, code) = run_kettle(dir.path(), &["run", &image]);
    assert_eq!(code, 1);
    assert!(stderr.contains("java.lang.VerifyError"), "stderr:\n{}", stderr);

    // Without verification the underflow is an engine fault.
    let (_, stderr, code) = run_kettle(dir.path(), &["run", &image, "--no-verify"]);
    assert_eq!(code, 2);
    assert!(stderr.contains("operand stack underflow"), "stderr:\n{}", stderr);
}

#[test]
fn test_timings_json() {
    let dir = TempDir::new().unwrap();
    let image = write_image(&dir, "rec.toml", RECURSE);
    let (stdout, stderr, code) = run_kettle(dir.path(), &["run", &image, "--timings=json"]);
    assert_eq!(code, 0);
    assert_eq!(stdout, "done\n");
    let line = stderr
        .lines()
        .find(|l| l.starts_with('{'))
        .expect("timings line");
    let json: serde_json::Value = serde_json::from_str(line).unwrap();
    assert!(json["execute_ms"].is_number());
    assert!(json["load_ms"].is_number());
}

#[test]
fn test_check_command() {
    let dir = TempDir::new().unwrap();
    let image = write_image(&dir, "calc.toml", CALC);
    let stdout = assert_success(&dir, &["check", &image]);
    assert_eq!(stdout, "ok: 1 classes\n");

    let bad = write_image(
        &dir,
        "bad.toml",
        r#"
[[classes]]
name = "demo/Bad"
super = "java/lang/Object"

[[classes.methods]]
name = "jump"
descriptor = "()V"
flags = ["static"]
code = [{ goto = 9 }]
"#,
    );
    let (_, stderr, code) = run_kettle(dir.path(), &["check", &bad]);
    assert_eq!(code, 1);
    assert!(stderr.contains("demo.Bad"), "stderr:\n{}", stderr);
    assert!(stderr.contains("1 of 1 classes failed"), "stderr:\n{}", stderr);
}

#[test]
fn test_disasm_command() {
    let dir = TempDir::new().unwrap();
    let image = write_image(&dir, "calc.toml", CALC);
    let stdout = assert_success(&dir, &["disasm", &image, "--class", "demo.Calc"]);
    assert!(stdout.starts_with("class demo/Calc extends java/lang/Object"));
    assert!(stdout.contains("add(II)I"));
    assert!(stdout.contains("Iadd"));

    let (_, stderr, code) = run_kettle(dir.path(), &["disasm", &image, "--class", "demo.Nope"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("demo.Nope not found"));
}

#[test]
fn test_unreadable_image() {
    let dir = TempDir::new().unwrap();
    let (_, stderr, code) = run_kettle(dir.path(), &["run", "missing.toml"]);
    assert_eq!(code, 2);
    assert!(stderr.contains("failed to read missing.toml"), "stderr:\n{}", stderr);
}
