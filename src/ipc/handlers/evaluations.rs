use crate::calc;
use crate::config;
use crate::error::EngineError;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    dispatch, get_optional_str, get_required_str, get_string_list, to_json, HandlerFn,
};
use crate::ipc::types::{AppState, Request};
use crate::org;
use rusqlite::Connection;
use serde_json::{json, Value};

fn evaluations_calculate(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let period_id = get_required_str(params, "periodId")?;
    let user_ids = get_string_list(params, "userIds")?;
    let summary = calc::calculate_period(conn, &period_id, user_ids.as_deref())?;
    to_json(&summary)
}

fn finals_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let period_id = get_required_str(params, "periodId")?;
    let rows = match get_optional_str(params, "departmentId") {
        Some(department_id) => {
            let policy = config::quota_settings(conn)?;
            let ids: Vec<String> = org::department_roster(conn, &department_id, &policy)?
                .into_iter()
                .map(|u| u.id)
                .collect();
            calc::load_final_evaluations(conn, &period_id, Some(ids.as_slice()))?
        }
        None => calc::load_final_evaluations(conn, &period_id, None)?,
    };
    Ok(json!({ "periodId": period_id, "finals": to_json(&rows)? }))
}

fn finals_breakdown(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let period_id = get_required_str(params, "periodId")?;
    let user_id = get_required_str(params, "userId")?;
    let ids = vec![user_id.clone()];
    let row = calc::load_final_evaluations(conn, &period_id, Some(ids.as_slice()))?
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::not_found("final evaluation", user_id.as_str()))?;
    let projects = calc::load_project_aggregates(conn, &period_id, &user_id)?;
    Ok(json!({
        "final": to_json(&row)?,
        "projects": to_json(&projects)?,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: HandlerFn = match req.method.as_str() {
        "evaluations.calculate" => evaluations_calculate,
        "finals.list" => finals_list,
        "finals.breakdown" => finals_breakdown,
        _ => return None,
    };
    Some(dispatch(state, req, handler))
}
