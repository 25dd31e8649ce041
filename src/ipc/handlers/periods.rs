use crate::calc;
use crate::config;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    dispatch, get_optional_bool, get_optional_str, get_required_str, to_json, HandlerFn,
};
use crate::ipc::types::{AppState, Request};
use crate::org;
use crate::period::{self, PeriodPatch};
use rusqlite::Connection;
use serde_json::{json, Value};

fn periods_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let start = period::parse_date(&get_required_str(params, "startDate")?, "startDate")?;
    let end = period::parse_date(&get_required_str(params, "endDate")?, "endDate")?;
    let created = period::create_period(conn, &name, start, end)?;
    Ok(json!({ "period": to_json(&created)? }))
}

fn periods_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let periods = period::list_periods(conn)?;
    Ok(json!({ "periods": to_json(&periods)? }))
}

fn periods_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let period_id = get_required_str(params, "periodId")?;
    let patch = PeriodPatch {
        name: get_optional_str(params, "name"),
        start_date: get_optional_str(params, "startDate")
            .map(|s| period::parse_date(&s, "startDate"))
            .transpose()?,
        end_date: get_optional_str(params, "endDate")
            .map(|s| period::parse_date(&s, "endDate"))
            .transpose()?,
    };
    let updated = period::update_period(conn, &period_id, patch)?;
    Ok(json!({ "period": to_json(&updated)? }))
}

fn periods_set_active(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let period_id = get_required_str(params, "periodId")?;
    let active = get_optional_bool(params, "active")?.unwrap_or(true);
    let updated = period::set_active(conn, &period_id, active)?;
    Ok(json!({ "period": to_json(&updated)? }))
}

/// Readiness of all active users, or of one department's roster.
fn periods_status(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let period_id = get_required_str(params, "periodId")?;
    let readiness = match get_optional_str(params, "departmentId") {
        Some(department_id) => {
            let policy = config::quota_settings(conn)?;
            let ids: Vec<String> = org::department_roster(conn, &department_id, &policy)?
                .into_iter()
                .map(|u| u.id)
                .collect();
            calc::period_readiness(conn, &period_id, Some(ids.as_slice()))?
        }
        None => calc::period_readiness(conn, &period_id, None)?,
    };
    to_json(&readiness)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: HandlerFn = match req.method.as_str() {
        "periods.create" => periods_create,
        "periods.list" => periods_list,
        "periods.update" => periods_update,
        "periods.setActive" => periods_set_active,
        "periods.status" => periods_status,
        _ => return None,
    };
    Some(dispatch(state, req, handler))
}
