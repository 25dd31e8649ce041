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


fn user_ids() -> Vec<String> {
    (0..10).map(|i| format!("u{}", i)).collect()
}

/// Ten scored employees in "ops", department grade A, ratios 10/30/60.
fn seed_scored_department(s: &mut Sidecar) -> String {
    s.ok("departments.upsert", json!({ "id": "ops", "name": "Operations" }));
    s.ok("users.upsert", json!({ "id": "lead", "name": "Lead", "role": "team_lead" }));
    for id in user_ids() {
        s.ok(
            "users.upsert",
            json!({ "id": id, "name": id, "role": "employee", "departmentId": "ops" }),
        );
    }
    s.ok("projects.upsert", json!({ "id": "p1", "name": "Platform" }));
    let created = s.ok(
        "periods.create",
        json!({ "name": "2025 H2", "startDate": "2025-07-01", "endDate": "2025-12-31" }),
    );
    let period_id = created["period"]["id"].as_str().expect("period id").to_string();
    s.ok("periods.setActive", json!({ "periodId": period_id }));
    s.ok(
        "weights.set",
        json!({ "role": "employee", "peer": 0, "pm": 0, "qualitative": 100 }),
    );

    let mut evaluations = Vec::new();
    for (i, id) in user_ids().into_iter().enumerate() {
        s.ok(
            "participation.replace",
            json!({
                "userId": id,
                "periodId": period_id,
                "weights": [{ "projectId": "p1", "weight": 100 }]
            }),
        );
        evaluations.push(json!({
            "evaluateeId": id,
            "qualitativeScore": 10 + i as i64,
            "departmentContribution": 5
        }));
    }
    s.ok(
        "qualitativeEvaluations.submit",
        json!({ "evaluatorId": "lead", "periodId": period_id, "evaluations": evaluations }),
    );
    let summary = s.ok("evaluations.calculate", json!({ "periodId": period_id }));
    assert_eq!(summary["calculated"], 10);
    assert_eq!(summary["status"], "ready");

    s.ok(
        "departmentGrades.set",
        json!({ "departmentId": "ops", "periodId": period_id, "grade": "A" }),
    );
    s.ok(
        "gradeRatios.set",
        json!({ "departmentGrade": "A", "sRatio": 10, "aRatio": 30, "bRatio": 60 }),
    );
    period_id
}

fn batch(grades: &[&str]) -> Value {
    Value::Array(
        grades
            .iter()
            .enumerate()
            .map(|(i, g)| json!({ "userId": format!("u{}", i), "grade": g }))
            .collect(),
    )
}

#[test]
fn grade_a_department_of_ten_allows_one_s_and_three_a() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let mut s = Sidecar::start(workspace.path());
    let period_id = seed_scored_department(&mut s);

    let quotas = s.ok(
        "quotas.get",
        json!({ "departmentId": "ops", "periodId": period_id }),
    );
    assert_eq!(quotas["rosterSize"], 10);
    assert_eq!(quotas["departmentGrade"], "A");
    assert_eq!(quotas["quotas"], json!({ "S": 1, "A": 3 }));
    assert_eq!(quotas["revision"], 0);

    let accepted = batch(&["S", "A", "A", "A", "B+", "B+", "B-", "B-", "B", "B"]);
    let dry = s.ok(
        "grades.validate",
        json!({ "departmentId": "ops", "periodId": period_id, "adjustments": accepted }),
    );
    assert_eq!(dry["valid"], true);

    let committed = s.ok(
        "grades.adjust",
        json!({ "departmentId": "ops", "periodId": period_id, "adjustments": accepted }),
    );
    assert_eq!(committed["revision"], 1);
    assert_eq!(committed["updated"].as_array().expect("updated").len(), 10);
    assert_eq!(committed["counts"]["S"], 1);
    assert_eq!(committed["counts"]["A"], 3);

    let rejected = batch(&["S", "S", "A", "A", "B+", "B+", "B-", "B-", "B", "A"]);
    let err = s.err(
        "grades.adjust",
        json!({ "departmentId": "ops", "periodId": period_id, "adjustments": rejected }),
    );
    assert_eq!(err["code"], "rejected_adjustment");
    assert_eq!(err["message"], "S count 2 exceeds quota 1");
    assert_eq!(err["details"]["rule"], "s_quota");
    assert_eq!(err["details"]["expected"], 1);
    assert_eq!(err["details"]["actual"], 2);

    // A single extra S on top of unchanged grades is still over quota.
    let err = s.err(
        "grades.adjust",
        json!({
            "departmentId": "ops",
            "periodId": period_id,
            "adjustments": [{ "userId": "u9", "grade": "S" }]
        }),
    );
    assert_eq!(err["message"], "S count 2 exceeds quota 1");

    let roster = s.ok(
        "grades.roster",
        json!({ "departmentId": "ops", "periodId": period_id }),
    );
    assert_eq!(roster["revision"], 1);
    assert_eq!(roster["counts"]["S"], 1);
    assert_eq!(roster["counts"]["B"], 2);
    let members = roster["members"].as_array().expect("members");
    assert_eq!(members.len(), 10);
    assert_eq!(members[0]["userId"], "u0");
    assert_eq!(members[0]["grade"], "S");

    let finals = s.ok(
        "finals.list",
        json!({ "periodId": period_id, "departmentId": "ops" }),
    );
    let u1 = finals["finals"]
        .as_array()
        .expect("finals")
        .iter()
        .find(|f| f["userId"] == "u1")
        .cloned()
        .expect("u1 row");
    assert_eq!(u1["grade"], "A");

    let history = s.ok(
        "grades.history",
        json!({ "departmentId": "ops", "periodId": period_id }),
    );
    let entries = history["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 10);
    assert!(entries.iter().all(|e| e["revision"] == 1 && e["previousGrade"].is_null()));

    s.stop();
}

#[test]
fn b_band_imbalance_is_rejected_and_nothing_is_written() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let mut s = Sidecar::start(workspace.path());
    let period_id = seed_scored_department(&mut s);

    s.ok(
        "grades.adjust",
        json!({
            "departmentId": "ops",
            "periodId": period_id,
            "adjustments": batch(&["S", "A", "A", "A", "B+", "B+", "B-", "B-", "B", "B"])
        }),
    );

    let err = s.err(
        "grades.adjust",
        json!({
            "departmentId": "ops",
            "periodId": period_id,
            "adjustments": [
                { "userId": "u8", "grade": "B+" },
                { "userId": "u9", "grade": "C" }
            ]
        }),
    );
    assert_eq!(err["code"], "rejected_adjustment");
    assert_eq!(err["message"], "B+ count 3 does not equal B- count 2");
    assert_eq!(err["details"]["rule"], "b_balance");

    let roster = s.ok(
        "grades.roster",
        json!({ "departmentId": "ops", "periodId": period_id }),
    );
    assert_eq!(roster["revision"], 1);
    let members = roster["members"].as_array().expect("members");
    assert_eq!(members[9]["grade"], "B");

    let dry = s.ok(
        "grades.validate",
        json!({
            "departmentId": "ops",
            "periodId": period_id,
            "adjustments": [{ "userId": "u8", "grade": "B+" }, { "userId": "u9", "grade": "B-" }]
        }),
    );
    assert_eq!(dry["valid"], true);
    assert_eq!(dry["counts"]["B+"], 3);

    s.stop();
}

#[test]
fn roster_rules_are_checked_before_quotas() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let mut s = Sidecar::start(workspace.path());
    let period_id = seed_scored_department(&mut s);

    let err = s.err(
        "grades.adjust",
        json!({
            "departmentId": "ops",
            "periodId": period_id,
            "adjustments": [{ "userId": "lead", "grade": "B" }]
        }),
    );
    assert_eq!(err["details"]["rule"], "not_in_roster");

    let err = s.err(
        "grades.adjust",
        json!({
            "departmentId": "ops",
            "periodId": period_id,
            "adjustments": [{ "userId": "u1", "grade": "B" }, { "userId": "u1", "grade": "C" }]
        }),
    );
    assert_eq!(err["code"], "rejected_input");

    // A new member with participation but no final score blocks the period.
    s.ok(
        "users.upsert",
        json!({ "id": "u10", "name": "u10", "role": "employee", "departmentId": "ops" }),
    );
    s.ok(
        "participation.replace",
        json!({
            "userId": "u10",
            "periodId": period_id,
            "weights": [{ "projectId": "p1", "weight": 100 }]
        }),
    );
    let err = s.err(
        "grades.adjust",
        json!({
            "departmentId": "ops",
            "periodId": period_id,
            "adjustments": [{ "userId": "u10", "grade": "B" }]
        }),
    );
    assert_eq!(err["details"]["rule"], "missing_final_score");

    let err = s.err(
        "grades.adjust",
        json!({
            "departmentId": "ops",
            "periodId": period_id,
            "adjustments": [{ "userId": "u1", "grade": "B" }]
        }),
    );
    assert_eq!(err["code"], "period_not_ready");
    assert_eq!(err["details"]["pending"], json!(["u10"]));

    s.stop();
}

#[test]
fn child_department_needs_its_own_grade_and_respects_the_parent_quota() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let mut s = Sidecar::start(workspace.path());
    let period_id = seed_scored_department(&mut s);
    s.ok("departments.upsert", json!({ "id": "rnd", "name": "Research", "parentId": "ops" }));
    s.ok(
        "users.upsert",
        json!({ "id": "u9", "name": "u9", "role": "employee", "departmentId": "rnd" }),
    );

    let err = s.err(
        "quotas.get",
        json!({ "departmentId": "rnd", "periodId": period_id }),
    );
    assert_eq!(err["code"], "no_quota_defined");

    let err = s.err(
        "grades.adjust",
        json!({
            "departmentId": "rnd",
            "periodId": period_id,
            "adjustments": [{ "userId": "u9", "grade": "A" }]
        }),
    );
    assert_eq!(err["code"], "no_quota_defined");

    s.ok(
        "grades.adjust",
        json!({
            "departmentId": "rnd",
            "periodId": period_id,
            "adjustments": [{ "userId": "u9", "grade": "B" }]
        }),
    );

    // The parent's roster still covers the member of its child department.
    let quotas = s.ok(
        "quotas.get",
        json!({ "departmentId": "ops", "periodId": period_id }),
    );
    assert_eq!(quotas["rosterSize"], 10);
    // The child's commit moved grades on the parent's roster as well.
    assert_eq!(quotas["revision"], 1);

    s.ok(
        "gradeRatios.set",
        json!({ "departmentGrade": "S", "sRatio": 100, "aRatio": 0, "bRatio": 0 }),
    );
    s.ok(
        "departmentGrades.set",
        json!({ "departmentId": "rnd", "periodId": period_id, "grade": "S" }),
    );
    let committed = s.ok(
        "grades.adjust",
        json!({
            "departmentId": "ops",
            "periodId": period_id,
            "adjustments": [{ "userId": "u0", "grade": "S" }],
            "expectedRevision": 1
        }),
    );
    assert_eq!(committed["revision"], 2);

    let dry_run = s.ok(
        "grades.validate",
        json!({
            "departmentId": "rnd",
            "periodId": period_id,
            "adjustments": [{ "userId": "u9", "grade": "S" }]
        }),
    );
    assert_eq!(dry_run["valid"], false);
    assert_eq!(dry_run["violation"]["details"]["departmentId"], "ops");

    let err = s.err(
        "grades.adjust",
        json!({
            "departmentId": "rnd",
            "periodId": period_id,
            "adjustments": [{ "userId": "u9", "grade": "S" }]
        }),
    );
    assert_eq!(err["code"], "rejected_adjustment");
    assert_eq!(err["details"]["rule"], "s_quota");
    assert_eq!(err["details"]["departmentId"], "ops");
    assert_eq!(err["details"]["expected"], 1);
    assert_eq!(err["details"]["actual"], 2);
    assert_eq!(err["message"], "S count 2 exceeds quota 1 in department ops");

    let roster = s.ok("grades.roster", json!({ "departmentId": "ops", "periodId": period_id }));
    assert_eq!(roster["counts"]["S"], 1);

    s.stop();
}
