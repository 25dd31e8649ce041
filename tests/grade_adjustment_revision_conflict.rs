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
struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    fn start(workspace: &std::path::Path) -> Self {
        let (child, stdin, reader) = spawn_sidecar();
        let mut s = Self {
            child,
            stdin,
            reader,
            next_id: 0,
        };
        s.ok(
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        s
    }

    fn id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    fn ok(&mut self, method: &str, params: Value) -> Value {
        let id = self.id();
        request_ok(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    fn err(&mut self, method: &str, params: Value) -> Value {
        let id = self.id();
        request_err(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    fn stop(mut self) {
        drop(self.stdin);
        let _ = self.child.wait();
    }
}


/// Four scored employees in "ops" with department grade S (ratios 25/25/50).
fn seed(s: &mut Sidecar) -> String {
    s.ok("departments.upsert", json!({ "id": "ops", "name": "Operations" }));
    s.ok("projects.upsert", json!({ "id": "p1", "name": "Platform" }));
    let created = s.ok(
        "periods.create",
        json!({ "name": "2026 H1", "startDate": "2026-01-01", "endDate": "2026-06-30" }),
    );
    let period_id = created["period"]["id"].as_str().expect("period id").to_string();
    s.ok("periods.setActive", json!({ "periodId": period_id }));
    s.ok(
        "weights.set",
        json!({ "role": "employee", "peer": 0, "pm": 0, "qualitative": 100 }),
    );
    let mut evaluations = Vec::new();
    for id in ["a", "b", "c", "d"] {
        s.ok(
            "users.upsert",
            json!({ "id": id, "name": id, "role": "employee", "departmentId": "ops" }),
        );
        s.ok(
            "participation.upsert",
            json!({ "userId": id, "periodId": period_id, "projectId": "p1", "weight": 100 }),
        );
        evaluations.push(json!({
            "evaluateeId": id,
            "qualitativeScore": 15,
            "departmentContribution": 5
        }));
    }
    s.ok("users.upsert", json!({ "id": "hr", "name": "HR", "role": "admin" }));
    s.ok(
        "qualitativeEvaluations.submit",
        json!({ "evaluatorId": "hr", "periodId": period_id, "evaluations": evaluations }),
    );
    s.ok("evaluations.calculate", json!({ "periodId": period_id }));
    s.ok(
        "departmentGrades.set",
        json!({ "departmentId": "ops", "periodId": period_id, "grade": "S" }),
    );
    s.ok(
        "gradeRatios.set",
        json!({ "departmentGrade": "S", "sRatio": 25, "aRatio": 25, "bRatio": 50 }),
    );
    period_id
}

#[test]
fn stale_revision_is_a_conflict_not_a_silent_overwrite() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let mut first = Sidecar::start(workspace.path());
    let period_id = seed(&mut first);
    let mut second = Sidecar::start(workspace.path());

    // Both read revision 0.
    let seen_by_first = first.ok(
        "grades.roster",
        json!({ "departmentId": "ops", "periodId": period_id }),
    );
    let seen_by_second = second.ok(
        "grades.roster",
        json!({ "departmentId": "ops", "periodId": period_id }),
    );
    assert_eq!(seen_by_first["revision"], 0);
    assert_eq!(seen_by_second["revision"], 0);
    assert_eq!(seen_by_first["quotas"], json!({ "S": 1, "A": 1 }));

    let committed = first.ok(
        "grades.adjust",
        json!({
            "departmentId": "ops",
            "periodId": period_id,
            "expectedRevision": 0,
            "adjustments": [{ "userId": "a", "grade": "S" }]
        }),
    );
    assert_eq!(committed["revision"], 1);

    // Second sidecar validated against the old snapshot; its S would be the second one.
    let err = second.err(
        "grades.adjust",
        json!({
            "departmentId": "ops",
            "periodId": period_id,
            "expectedRevision": 0,
            "adjustments": [{ "userId": "b", "grade": "S" }]
        }),
    );
    assert_eq!(err["code"], "concurrency_conflict");
    assert_eq!(err["details"], json!({ "expected": 0, "actual": 1 }));

    // After re-reading, the same proposal is judged against current state.
    let err = second.err(
        "grades.adjust",
        json!({
            "departmentId": "ops",
            "periodId": period_id,
            "expectedRevision": 1,
            "adjustments": [{ "userId": "b", "grade": "S" }]
        }),
    );
    assert_eq!(err["message"], "S count 2 exceeds quota 1");

    let committed = second.ok(
        "grades.adjust",
        json!({
            "departmentId": "ops",
            "periodId": period_id,
            "expectedRevision": 1,
            "adjustments": [{ "userId": "b", "grade": "A" }]
        }),
    );
    assert_eq!(committed["revision"], 2);

    let history = first.ok(
        "grades.history",
        json!({ "departmentId": "ops", "periodId": period_id }),
    );
    let entries = history["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["userId"], "a");
    assert_eq!(entries[1]["revision"], 2);

    first.stop();
    second.stop();
}

#[test]
fn clearing_a_grade_is_recorded_and_unchanged_batches_keep_the_revision() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let mut s = Sidecar::start(workspace.path());
    let period_id = seed(&mut s);

    s.ok(
        "grades.adjust",
        json!({
            "departmentId": "ops",
            "periodId": period_id,
            "adjustments": [{ "userId": "a", "grade": "B+" }, { "userId": "b", "grade": "B-" }]
        }),
    );
    let same = s.ok(
        "grades.adjust",
        json!({
            "departmentId": "ops",
            "periodId": period_id,
            "adjustments": [{ "userId": "a", "grade": "B+" }]
        }),
    );
    assert_eq!(same["revision"], 1);
    assert!(same["updated"].as_array().expect("updated").is_empty());

    let cleared = s.ok(
        "grades.adjust",
        json!({
            "departmentId": "ops",
            "periodId": period_id,
            "adjustments": [{ "userId": "a", "grade": null }, { "userId": "b", "grade": null }]
        }),
    );
    assert_eq!(cleared["revision"], 2);
    assert_eq!(cleared["counts"]["ungraded"], 4);

    let history = s.ok(
        "grades.history",
        json!({ "departmentId": "ops", "periodId": period_id }),
    );
    let entries = history["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[2]["previousGrade"], "B+");
    assert!(entries[2]["grade"].is_null());

    s.stop();
}
