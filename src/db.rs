use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "evald.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // Other sidecars may hold the write lock briefly during a grade commit.
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS departments(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            parent_id TEXT,
            head_user_id TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_departments_parent ON departments(parent_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            role TEXT NOT NULL,
            department_id TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_department ON users(department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS projects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluation_periods(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS project_pms(
            project_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            pm_user_id TEXT NOT NULL,
            PRIMARY KEY(project_id, period_id),
            FOREIGN KEY(project_id) REFERENCES projects(id),
            FOREIGN KEY(period_id) REFERENCES evaluation_periods(id),
            FOREIGN KEY(pm_user_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS participation_weights(
            user_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            weight INTEGER NOT NULL,
            PRIMARY KEY(user_id, project_id, period_id),
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(project_id) REFERENCES projects(id),
            FOREIGN KEY(period_id) REFERENCES evaluation_periods(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_participation_period ON participation_weights(period_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluation_weights(
            role TEXT NOT NULL,
            item TEXT NOT NULL,
            weight REAL NOT NULL,
            PRIMARY KEY(role, item)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS peer_evaluations(
            id TEXT PRIMARY KEY,
            evaluator_id TEXT NOT NULL,
            evaluatee_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            score INTEGER NOT NULL,
            criteria_json TEXT,
            feedback TEXT,
            FOREIGN KEY(evaluator_id) REFERENCES users(id),
            FOREIGN KEY(evaluatee_id) REFERENCES users(id),
            FOREIGN KEY(project_id) REFERENCES projects(id),
            FOREIGN KEY(period_id) REFERENCES evaluation_periods(id),
            UNIQUE(evaluator_id, evaluatee_id, project_id, period_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_peer_evaluations_period ON peer_evaluations(period_id, evaluatee_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pm_evaluations(
            id TEXT PRIMARY KEY,
            pm_id TEXT NOT NULL,
            evaluatee_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            score INTEGER NOT NULL,
            comment TEXT,
            FOREIGN KEY(pm_id) REFERENCES users(id),
            FOREIGN KEY(evaluatee_id) REFERENCES users(id),
            FOREIGN KEY(project_id) REFERENCES projects(id),
            FOREIGN KEY(period_id) REFERENCES evaluation_periods(id),
            UNIQUE(evaluatee_id, project_id, period_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS qualitative_evaluations(
            id TEXT PRIMARY KEY,
            evaluator_id TEXT NOT NULL,
            evaluatee_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            qualitative_score INTEGER NOT NULL,
            department_contribution INTEGER NOT NULL,
            feedback TEXT,
            FOREIGN KEY(evaluator_id) REFERENCES users(id),
            FOREIGN KEY(evaluatee_id) REFERENCES users(id),
            FOREIGN KEY(period_id) REFERENCES evaluation_periods(id),
            UNIQUE(evaluatee_id, period_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS department_grade_ratios(
            department_grade TEXT PRIMARY KEY,
            s_ratio REAL NOT NULL,
            a_ratio REAL NOT NULL,
            b_ratio REAL NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS department_evaluations(
            department_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            grade TEXT NOT NULL,
            PRIMARY KEY(department_id, period_id),
            FOREIGN KEY(department_id) REFERENCES departments(id),
            FOREIGN KEY(period_id) REFERENCES evaluation_periods(id)
        )",
        [],
    )?;

    // Derived tables: rewritten wholesale by evaluations.calculate.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS project_score_aggregates(
            user_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            participation_weight INTEGER NOT NULL,
            peer_average REAL,
            peer_count INTEGER NOT NULL,
            pm_score REAL,
            pm_id TEXT,
            PRIMARY KEY(user_id, project_id, period_id),
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(period_id) REFERENCES evaluation_periods(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS final_evaluations(
            user_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            role TEXT NOT NULL,
            peer_score REAL,
            pm_score REAL,
            qualitative_score REAL,
            final_score REAL NOT NULL,
            PRIMARY KEY(user_id, period_id),
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(period_id) REFERENCES evaluation_periods(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_final_evaluations_period ON final_evaluations(period_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_adjustments(
            user_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            grade TEXT NOT NULL,
            department_id TEXT NOT NULL,
            PRIMARY KEY(user_id, period_id),
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(period_id) REFERENCES evaluation_periods(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_adjustment_revisions(
            department_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            revision INTEGER NOT NULL,
            PRIMARY KEY(department_id, period_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_adjustment_history(
            id TEXT PRIMARY KEY,
            department_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            previous_grade TEXT,
            grade TEXT,
            revision INTEGER NOT NULL,
            adjusted_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_adjustment_history_key
         ON grade_adjustment_history(department_id, period_id, revision)",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let raw = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, raw),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_db_is_idempotent_and_settings_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = open_db(dir.path()).expect("open");
        assert_eq!(settings_get_json(&conn, "missing").expect("get"), None);
        settings_set_json(&conn, "k", &serde_json::json!({ "a": 1 })).expect("set");
        drop(conn);

        let conn = open_db(dir.path()).expect("reopen");
        let v = settings_get_json(&conn, "k").expect("get").expect("value");
        assert_eq!(v["a"], 1);
    }
}
