use crate::config;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{dispatch, get_required_str, to_json, HandlerFn};
use crate::ipc::types::{AppState, Request};
use crate::submissions::{self, PeerSubmission, PmSubmission, QualitativeSubmission};
use rusqlite::Connection;
use serde_json::Value;

fn peer_submit(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let evaluator_id = get_required_str(params, "evaluatorId")?;
    let period_id = get_required_str(params, "periodId")?;
    let batch: Vec<PeerSubmission> = submissions::parse_batch(params.get("evaluations"))?;
    let settings = config::submission_settings(conn)?;
    let outcome = submissions::submit_peer(conn, &evaluator_id, &period_id, &batch, &settings)?;
    to_json(&outcome)
}

fn pm_submit(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let pm_id = get_required_str(params, "pmId")?;
    let period_id = get_required_str(params, "periodId")?;
    let batch: Vec<PmSubmission> = submissions::parse_batch(params.get("evaluations"))?;
    let outcome = submissions::submit_pm(conn, &pm_id, &period_id, &batch)?;
    to_json(&outcome)
}

fn qualitative_submit(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let evaluator_id = get_required_str(params, "evaluatorId")?;
    let period_id = get_required_str(params, "periodId")?;
    let batch: Vec<QualitativeSubmission> = submissions::parse_batch(params.get("evaluations"))?;
    let outcome = submissions::submit_qualitative(conn, &evaluator_id, &period_id, &batch)?;
    to_json(&outcome)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: HandlerFn = match req.method.as_str() {
        "peerEvaluations.submit" => peer_submit,
        "pmEvaluations.submit" => pm_submit,
        "qualitativeEvaluations.submit" => qualitative_submit,
        _ => return None,
    };
    Some(dispatch(state, req, handler))
}
