use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    dispatch, get_enum, get_optional_bool, get_optional_str, get_required_i64, get_required_str,
    to_json, HandlerFn,
};
use crate::ipc::types::{AppState, Request};
use crate::model::Role;
use crate::org::{self, DepartmentRecord, UserRecord};
use crate::participation::{self, ParticipationLedger, ProjectShare};
use crate::period;
use rusqlite::Connection;
use serde_json::{json, Value};

const ROLE_LABELS: &str = "employee, team_lead, dept_head, center_head, admin";

fn departments_upsert(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let dept = DepartmentRecord {
        id: get_required_str(params, "id")?,
        name: get_required_str(params, "name")?,
        parent_id: get_optional_str(params, "parentId"),
        head_user_id: get_optional_str(params, "headUserId"),
    };
    org::upsert_department(conn, &dept)?;
    Ok(json!({ "department": to_json(&dept)? }))
}

fn departments_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let departments = org::list_departments(conn)?;
    Ok(json!({ "departments": to_json(&departments)? }))
}

fn users_upsert(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let user = UserRecord {
        id: get_required_str(params, "id")?,
        name: get_required_str(params, "name")?,
        role: get_enum(params, "role", Role::parse, ROLE_LABELS)?,
        department_id: get_optional_str(params, "departmentId"),
        active: get_optional_bool(params, "active")?.unwrap_or(true),
    };
    org::upsert_user(conn, &user)?;
    Ok(json!({ "user": to_json(&user)? }))
}

fn users_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let department_id = get_optional_str(params, "departmentId");
    let users = org::list_users(conn, department_id.as_deref())?;
    Ok(json!({ "users": to_json(&users)? }))
}

fn projects_upsert(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let name = get_required_str(params, "name")?;
    org::upsert_project(conn, &id, &name)?;
    Ok(json!({ "projectId": id }))
}

fn projects_assign_pm(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let project_id = get_required_str(params, "projectId")?;
    let period_id = get_required_str(params, "periodId")?;
    let pm_user_id = get_required_str(params, "pmUserId")?;
    org::assign_pm(conn, &project_id, &period_id, &pm_user_id)?;
    Ok(json!({
        "projectId": project_id,
        "periodId": period_id,
        "pmUserId": pm_user_id
    }))
}

fn require_user_and_period(
    conn: &Connection,
    user_id: &str,
    period_id: &str,
) -> Result<(), HandlerErr> {
    if org::get_user(conn, user_id)?.is_none() {
        return Err(crate::error::EngineError::not_found("user", user_id).into());
    }
    period::require_period(conn, period_id)?;
    Ok(())
}

fn participation_upsert(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let period_id = get_required_str(params, "periodId")?;
    let share = ProjectShare {
        project_id: get_required_str(params, "projectId")?,
        weight: get_required_i64(params, "weight")?,
    };
    require_user_and_period(conn, &user_id, &period_id)?;
    if !org::project_exists(conn, &share.project_id)? {
        return Err(crate::error::EngineError::not_found("project", share.project_id).into());
    }
    let total = participation::upsert_weight(conn, &user_id, &period_id, &share)?;
    Ok(json!({ "userId": user_id, "periodId": period_id, "total": total }))
}

fn participation_replace(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let period_id = get_required_str(params, "periodId")?;
    let raw = params
        .get("weights")
        .ok_or_else(|| HandlerErr::bad_params("missing weights"))?;
    let shares: Vec<ProjectShare> = serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid weights: {}", e)))?;
    require_user_and_period(conn, &user_id, &period_id)?;
    for share in &shares {
        if !org::project_exists(conn, &share.project_id)? {
            return Err(
                crate::error::EngineError::not_found("project", share.project_id.as_str()).into(),
            );
        }
    }
    participation::replace_weights(conn, &user_id, &period_id, &shares)?;
    Ok(json!({ "userId": user_id, "periodId": period_id, "total": 100 }))
}

fn participation_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let period_id = get_required_str(params, "periodId")?;
    let ledger = ParticipationLedger::load(conn, &period_id)?;
    Ok(json!({
        "userId": user_id,
        "periodId": period_id,
        "weights": to_json(&ledger.weights_for(&user_id))?,
        "total": ledger.total_for(&user_id),
        "ledger": to_json(&ledger.status(&user_id))?,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: HandlerFn = match req.method.as_str() {
        "departments.upsert" => departments_upsert,
        "departments.list" => departments_list,
        "users.upsert" => users_upsert,
        "users.list" => users_list,
        "projects.upsert" => projects_upsert,
        "projects.assignPm" => projects_assign_pm,
        "participation.upsert" => participation_upsert,
        "participation.replace" => participation_replace,
        "participation.get" => participation_get,
        _ => return None,
    };
    Some(dispatch(state, req, handler))
}
