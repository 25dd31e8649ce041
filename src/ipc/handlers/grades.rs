use crate::adjust::{self, ProposedAdjustment};
use crate::config;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{dispatch, get_optional_i64, get_required_str, to_json, HandlerFn};
use crate::ipc::types::{AppState, Request};
use crate::quota;
use rusqlite::Connection;
use serde_json::{json, Value};

fn department_and_period(params: &Value) -> Result<(String, String), HandlerErr> {
    Ok((
        get_required_str(params, "departmentId")?,
        get_required_str(params, "periodId")?,
    ))
}

fn parse_adjustments(params: &Value) -> Result<Vec<ProposedAdjustment>, HandlerErr> {
    let raw = params
        .get("adjustments")
        .ok_or_else(|| HandlerErr::bad_params("missing adjustments"))?;
    serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid adjustments: {}", e)))
}

fn quotas_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (department_id, period_id) = department_and_period(params)?;
    let policy = config::quota_settings(conn)?;
    let report = quota::quotas_for(conn, &department_id, &period_id, &policy)?;
    let mut out = to_json(&report)?;
    out["revision"] = json!(adjust::current_revision(conn, &department_id, &period_id)?);
    Ok(out)
}

fn grades_roster(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (department_id, period_id) = department_and_period(params)?;
    let policy = config::quota_settings(conn)?;
    let view = adjust::roster_view(conn, &department_id, &period_id, &policy)?;
    to_json(&view)
}

/// Dry run: a rule violation is a normal result here, not an error response.
fn grades_validate(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (department_id, period_id) = department_and_period(params)?;
    let proposals = parse_adjustments(params)?;
    let policy = config::quota_settings(conn)?;
    match adjust::preview(conn, &department_id, &period_id, &proposals, &policy)? {
        Ok(counts) => Ok(json!({ "valid": true, "counts": to_json(&counts)? })),
        Err(e) => Ok(json!({
            "valid": false,
            "violation": {
                "code": e.code(),
                "message": e.to_string(),
                "details": e.details(),
            }
        })),
    }
}

fn grades_adjust(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (department_id, period_id) = department_and_period(params)?;
    let proposals = parse_adjustments(params)?;
    let expected_revision = get_optional_i64(params, "expectedRevision")?;
    let policy = config::quota_settings(conn)?;
    let outcome = adjust::adjust_grades(
        conn,
        &department_id,
        &period_id,
        &proposals,
        expected_revision,
        &policy,
    )?;
    to_json(&outcome)
}

fn grades_history(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (department_id, period_id) = department_and_period(params)?;
    let entries = adjust::history(conn, &department_id, &period_id)?;
    Ok(json!({
        "departmentId": department_id,
        "periodId": period_id,
        "entries": to_json(&entries)?,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: HandlerFn = match req.method.as_str() {
        "quotas.get" => quotas_get,
        "grades.roster" => grades_roster,
        "grades.validate" => grades_validate,
        "grades.adjust" => grades_adjust,
        "grades.history" => grades_history,
        _ => return None,
    };
    Some(dispatch(state, req, handler))
}
