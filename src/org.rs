//! Organization directory fed by collaborators: departments, users, projects,
//! PM assignments, and the department roster used for quota purposes.

use crate::config::QuotaSettings;
use crate::error::EngineError;
use crate::model::{DepartmentGrade, Role};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeSet, HashSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub department_id: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepartmentRecord {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub head_user_id: Option<String>,
}

fn user_from_row(r: &Row<'_>) -> rusqlite::Result<(String, String, String, Option<String>, bool)> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get::<_, i64>(4)? != 0,
    ))
}

fn into_user(
    (id, name, role, department_id, active): (String, String, String, Option<String>, bool),
) -> Result<UserRecord, EngineError> {
    let role = Role::parse(&role)
        .ok_or_else(|| EngineError::invariant(format!("unknown role '{}' stored for {}", role, id)))?;
    Ok(UserRecord {
        id,
        name,
        role,
        department_id,
        active,
    })
}

pub fn get_user(conn: &Connection, user_id: &str) -> Result<Option<UserRecord>, EngineError> {
    let row = conn
        .query_row(
            "SELECT id, name, role, department_id, active FROM users WHERE id = ?",
            [user_id],
            user_from_row,
        )
        .optional()?;
    row.map(into_user).transpose()
}

/// All users, or the direct members of one department, ordered by id.
pub fn list_users(
    conn: &Connection,
    department_id: Option<&str>,
) -> Result<Vec<UserRecord>, EngineError> {
    let rows = match department_id {
        Some(d) => {
            let mut stmt = conn.prepare(
                "SELECT id, name, role, department_id, active FROM users
                 WHERE department_id = ? ORDER BY id",
            )?;
            let rows = stmt
                .query_map([d], user_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn
                .prepare("SELECT id, name, role, department_id, active FROM users ORDER BY id")?;
            let rows = stmt
                .query_map([], user_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    rows.into_iter().map(into_user).collect()
}

pub fn upsert_user(conn: &Connection, user: &UserRecord) -> Result<(), EngineError> {
    if let Some(d) = &user.department_id {
        if get_department(conn, d)?.is_none() {
            return Err(EngineError::not_found("department", d.as_str()));
        }
    }
    conn.execute(
        "INSERT INTO users(id, name, role, department_id, active) VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           role = excluded.role,
           department_id = excluded.department_id,
           active = excluded.active",
        (
            &user.id,
            &user.name,
            user.role.as_str(),
            &user.department_id,
            user.active as i64,
        ),
    )?;
    Ok(())
}

pub fn get_department(
    conn: &Connection,
    department_id: &str,
) -> Result<Option<DepartmentRecord>, EngineError> {
    Ok(conn
        .query_row(
            "SELECT id, name, parent_id, head_user_id FROM departments WHERE id = ?",
            [department_id],
            |r| {
                Ok(DepartmentRecord {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    parent_id: r.get(2)?,
                    head_user_id: r.get(3)?,
                })
            },
        )
        .optional()?)
}

pub fn list_departments(conn: &Connection) -> Result<Vec<DepartmentRecord>, EngineError> {
    let mut stmt =
        conn.prepare("SELECT id, name, parent_id, head_user_id FROM departments ORDER BY id")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(DepartmentRecord {
                id: r.get(0)?,
                name: r.get(1)?,
                parent_id: r.get(2)?,
                head_user_id: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Inserts or updates a department, refusing a parent link that would close a cycle.
pub fn upsert_department(conn: &Connection, dept: &DepartmentRecord) -> Result<(), EngineError> {
    if let Some(parent) = &dept.parent_id {
        let mut seen = HashSet::new();
        let mut cursor = Some(parent.clone());
        while let Some(id) = cursor {
            if id == dept.id {
                return Err(EngineError::rejected_with(
                    "department parent link would create a cycle",
                    json!({ "departmentId": dept.id, "parentId": parent }),
                ));
            }
            if !seen.insert(id.clone()) {
                break;
            }
            cursor = match get_department(conn, &id)? {
                Some(d) => d.parent_id,
                None if id == *parent => {
                    return Err(EngineError::not_found("department", id));
                }
                None => None,
            };
        }
    }
    conn.execute(
        "INSERT INTO departments(id, name, parent_id, head_user_id) VALUES(?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           parent_id = excluded.parent_id,
           head_user_id = excluded.head_user_id",
        (&dept.id, &dept.name, &dept.parent_id, &dept.head_user_id),
    )?;
    Ok(())
}

/// The department itself followed by every descendant, breadth first.
pub fn department_subtree(conn: &Connection, root: &str) -> Result<Vec<String>, EngineError> {
    let mut stmt = conn.prepare("SELECT id FROM departments WHERE parent_id = ? ORDER BY id")?;
    let mut out = Vec::new();
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([root.to_string()]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        let children = stmt
            .query_map([&id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        queue.extend(children);
        out.push(id);
    }
    Ok(out)
}

/// Parent chain of a department, nearest first.
pub fn department_ancestors(conn: &Connection, department_id: &str) -> Result<Vec<String>, EngineError> {
    let mut out = Vec::new();
    let mut seen = BTreeSet::from([department_id.to_string()]);
    let mut cursor = get_department(conn, department_id)?.and_then(|d| d.parent_id);
    while let Some(id) = cursor {
        if !seen.insert(id.clone()) {
            break;
        }
        cursor = get_department(conn, &id)?.and_then(|d| d.parent_id);
        out.push(id);
    }
    Ok(out)
}

/// Active members of the department and its descendants. The department head
/// is left out when the quota policy excludes managers from their own roster.
pub fn department_roster(
    conn: &Connection,
    department_id: &str,
    policy: &QuotaSettings,
) -> Result<Vec<UserRecord>, EngineError> {
    let dept = get_department(conn, department_id)?
        .ok_or_else(|| EngineError::not_found("department", department_id))?;
    let mut roster = Vec::new();
    for id in department_subtree(conn, department_id)? {
        roster.extend(list_users(conn, Some(id.as_str()))?.into_iter().filter(|u| u.active));
    }
    if !policy.include_manager_in_roster {
        if let Some(head) = &dept.head_user_id {
            roster.retain(|u| &u.id != head);
        }
    }
    roster.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(roster)
}

pub fn upsert_project(conn: &Connection, project_id: &str, name: &str) -> Result<(), EngineError> {
    conn.execute(
        "INSERT INTO projects(id, name) VALUES(?, ?)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        (project_id, name),
    )?;
    Ok(())
}

pub fn project_exists(conn: &Connection, project_id: &str) -> Result<bool, EngineError> {
    let v: Option<i64> = conn
        .query_row("SELECT 1 FROM projects WHERE id = ?", [project_id], |r| r.get(0))
        .optional()?;
    Ok(v.is_some())
}

pub fn assign_pm(
    conn: &Connection,
    project_id: &str,
    period_id: &str,
    pm_user_id: &str,
) -> Result<(), EngineError> {
    if !project_exists(conn, project_id)? {
        return Err(EngineError::not_found("project", project_id));
    }
    if !period_exists(conn, period_id)? {
        return Err(EngineError::not_found("evaluation period", period_id));
    }
    if get_user(conn, pm_user_id)?.is_none() {
        return Err(EngineError::not_found("user", pm_user_id));
    }
    conn.execute(
        "INSERT INTO project_pms(project_id, period_id, pm_user_id) VALUES(?, ?, ?)
         ON CONFLICT(project_id, period_id) DO UPDATE SET pm_user_id = excluded.pm_user_id",
        (project_id, period_id, pm_user_id),
    )?;
    Ok(())
}

pub fn assigned_pm(
    conn: &Connection,
    project_id: &str,
    period_id: &str,
) -> Result<Option<String>, EngineError> {
    Ok(conn
        .query_row(
            "SELECT pm_user_id FROM project_pms WHERE project_id = ? AND period_id = ?",
            (project_id, period_id),
            |r| r.get(0),
        )
        .optional()?)
}

pub fn period_exists(conn: &Connection, period_id: &str) -> Result<bool, EngineError> {
    let v: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM evaluation_periods WHERE id = ?",
            [period_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(v.is_some())
}

pub fn set_department_grade(
    conn: &Connection,
    department_id: &str,
    period_id: &str,
    grade: DepartmentGrade,
) -> Result<(), EngineError> {
    if get_department(conn, department_id)?.is_none() {
        return Err(EngineError::not_found("department", department_id));
    }
    if !period_exists(conn, period_id)? {
        return Err(EngineError::not_found("evaluation period", period_id));
    }
    conn.execute(
        "INSERT INTO department_evaluations(department_id, period_id, grade) VALUES(?, ?, ?)
         ON CONFLICT(department_id, period_id) DO UPDATE SET grade = excluded.grade",
        (department_id, period_id, grade.as_str()),
    )?;
    Ok(())
}

pub fn department_grade(
    conn: &Connection,
    department_id: &str,
    period_id: &str,
) -> Result<Option<DepartmentGrade>, EngineError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT grade FROM department_evaluations WHERE department_id = ? AND period_id = ?",
            (department_id, period_id),
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        None => Ok(None),
        Some(g) => DepartmentGrade::parse(&g).map(Some).ok_or_else(|| {
            EngineError::invariant(format!(
                "unknown department grade '{}' stored for {}",
                g, department_id
            ))
        }),
    }
}
