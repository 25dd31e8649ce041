use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_evald");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn evald");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(Value::Null)
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().unwrap_or(Value::Null)
}

const METHODS: &[&str] = &[
    "departments.upsert",
    "departments.list",
    "users.upsert",
    "users.list",
    "projects.upsert",
    "projects.assignPm",
    "participation.upsert",
    "participation.replace",
    "participation.get",
    "periods.create",
    "periods.list",
    "periods.update",
    "periods.setActive",
    "periods.status",
    "weights.set",
    "weights.list",
    "gradeRatios.set",
    "gradeRatios.list",
    "departmentGrades.set",
    "departmentGrades.get",
    "peerEvaluations.submit",
    "pmEvaluations.submit",
    "qualitativeEvaluations.submit",
    "evaluations.calculate",
    "finals.list",
    "finals.breakdown",
    "quotas.get",
    "grades.roster",
    "grades.validate",
    "grades.adjust",
    "grades.history",
    "settings.get",
    "settings.update",
];

#[test]
fn every_method_is_routed_and_needs_a_workspace() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "h", "health", json!({}));
    assert!(health["workspacePath"].is_null());

    for (i, method) in METHODS.iter().enumerate() {
        let id = format!("m{}", i);
        let error = request_err(&mut stdin, &mut reader, &id, method, json!({}));
        assert_eq!(error["code"], "no_workspace", "{} was not routed", method);
    }

    let error = request_err(&mut stdin, &mut reader, "x", "payroll.export", json!({}));
    assert_eq!(error["code"], "not_implemented");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn workspace_selection_and_malformed_lines() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let error = request_err(&mut stdin, &mut reader, "1", "workspace.select", json!({}));
    assert_eq!(error["code"], "bad_params");

    let selected = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );
    assert_eq!(
        selected["workspacePath"].as_str(),
        Some(workspace.path().to_string_lossy().as_ref())
    );
    assert!(workspace.path().join("evald.sqlite3").exists());

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read bad_json reply");
    let reply: Value = serde_json::from_str(line.trim()).expect("reply json");
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["error"]["code"], "bad_json");

    let error = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "periods.create",
        json!({ "name": "Q1", "startDate": "2025-03-31", "endDate": "2025-01-01" }),
    );
    assert_eq!(error["code"], "rejected_input");

    let listed = request_ok(&mut stdin, &mut reader, "4", "periods.list", json!({}));
    assert_eq!(listed["periods"], json!([]));

    drop(stdin);
    let _ = child.wait();
}
