//! Peer, PM and qualitative submission intake.
//!
//! Every row in a batch is range-checked before anything is written; a batch
//! either lands whole or not at all. Out-of-range input never reaches the
//! aggregator.

use crate::aggregate::{
    PeerScore, DEPARTMENT_CONTRIBUTION_MAX, PM_SCORE_MAX, QUALITATIVE_MAX,
};
use crate::config::SubmissionSettings;
use crate::error::EngineError;
use crate::org;
use crate::participation::ParticipationLedger;
use crate::period;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSubmission {
    pub evaluatee_id: String,
    pub project_id: String,
    #[serde(default)]
    pub score: Option<i64>,
    #[serde(default)]
    pub scores: Option<Vec<i64>>,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PmSubmission {
    pub evaluatee_id: String,
    pub project_id: String,
    pub score: i64,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualitativeSubmission {
    pub evaluatee_id: String,
    pub qualitative_score: i64,
    pub department_contribution: i64,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOutcome {
    pub period_id: String,
    pub saved: usize,
}

pub fn parse_batch<T: DeserializeOwned>(raw: Option<&Value>) -> Result<Vec<T>, EngineError> {
    let raw = raw.ok_or_else(|| EngineError::rejected("missing evaluations"))?;
    let batch: Vec<T> = serde_json::from_value(raw.clone())
        .map_err(|e| EngineError::rejected(format!("invalid evaluations: {}", e)))?;
    if batch.is_empty() {
        return Err(EngineError::rejected("evaluations must not be empty"));
    }
    Ok(batch)
}

fn row_error(index: usize, message: impl Into<String>) -> EngineError {
    EngineError::rejected_with(message, json!({ "index": index }))
}

fn require_user(conn: &Connection, user_id: &str) -> Result<(), EngineError> {
    match org::get_user(conn, user_id)? {
        Some(_) => Ok(()),
        None => Err(EngineError::not_found("user", user_id)),
    }
}

fn peer_score(index: usize, s: &PeerSubmission) -> Result<PeerScore, EngineError> {
    let score = match (&s.score, &s.scores) {
        (Some(total), None) => PeerScore::Total(*total),
        (None, Some(criteria)) => PeerScore::Criteria(criteria.clone()),
        _ => {
            return Err(row_error(
                index,
                "each peer evaluation needs exactly one of score or scores",
            ))
        }
    };
    if let Some(msg) = score.range_error() {
        return Err(row_error(index, msg));
    }
    Ok(score)
}

pub fn submit_peer(
    conn: &Connection,
    evaluator_id: &str,
    period_id: &str,
    batch: &[PeerSubmission],
    settings: &SubmissionSettings,
) -> Result<SubmitOutcome, EngineError> {
    period::require_open(conn, period_id)?;
    require_user(conn, evaluator_id)?;
    let ledger = ParticipationLedger::load(conn, period_id)?;

    let mut seen = HashSet::new();
    let mut scored = Vec::with_capacity(batch.len());
    for (i, s) in batch.iter().enumerate() {
        if s.evaluatee_id == evaluator_id {
            return Err(row_error(i, "peers cannot evaluate themselves"));
        }
        if !seen.insert((s.evaluatee_id.as_str(), s.project_id.as_str())) {
            return Err(row_error(
                i,
                format!(
                    "{} appears twice for project {} in this batch",
                    s.evaluatee_id, s.project_id
                ),
            ));
        }
        require_user(conn, &s.evaluatee_id)?;
        if !org::project_exists(conn, &s.project_id)? {
            return Err(EngineError::not_found("project", s.project_id.as_str()));
        }
        let score = peer_score(i, s)?;
        if settings.require_evaluatee_participation
            && !ledger.participates_in(&s.evaluatee_id, &s.project_id)
        {
            return Err(row_error(
                i,
                format!(
                    "{} does not participate in project {} this period",
                    s.evaluatee_id, s.project_id
                ),
            ));
        }
        scored.push((s, score));
    }

    if let Some(cap) = settings.peer_batch_average_cap {
        let total: i64 = scored.iter().map(|(_, score)| score.total()).sum();
        let average = total as f64 / scored.len() as f64;
        if average > cap {
            return Err(EngineError::rejected_with(
                format!(
                    "average peer score {:.1} exceeds the limit of {}",
                    average, cap
                ),
                json!({ "average": average, "limit": cap }),
            ));
        }
    }

    let tx = conn.unchecked_transaction()?;
    for (s, score) in &scored {
        let criteria_json = match score {
            PeerScore::Criteria(c) => Some(
                serde_json::to_string(c).map_err(|e| EngineError::invariant(e.to_string()))?,
            ),
            PeerScore::Total(_) => None,
        };
        tx.execute(
            "INSERT INTO peer_evaluations(
                id, evaluator_id, evaluatee_id, project_id, period_id, score, criteria_json, feedback
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(evaluator_id, evaluatee_id, project_id, period_id) DO UPDATE SET
               score = excluded.score,
               criteria_json = excluded.criteria_json,
               feedback = excluded.feedback",
            (
                uuid::Uuid::new_v4().to_string(),
                evaluator_id,
                &s.evaluatee_id,
                &s.project_id,
                period_id,
                score.total(),
                criteria_json,
                &s.feedback,
            ),
        )?;
    }
    tx.commit()?;
    info!(evaluator_id, period_id, saved = scored.len(), "peer evaluations saved");
    Ok(SubmitOutcome {
        period_id: period_id.to_string(),
        saved: scored.len(),
    })
}

pub fn submit_pm(
    conn: &Connection,
    pm_id: &str,
    period_id: &str,
    batch: &[PmSubmission],
) -> Result<SubmitOutcome, EngineError> {
    period::require_open(conn, period_id)?;
    require_user(conn, pm_id)?;

    let mut seen = HashSet::new();
    for (i, s) in batch.iter().enumerate() {
        if !seen.insert((s.evaluatee_id.as_str(), s.project_id.as_str())) {
            return Err(row_error(
                i,
                format!(
                    "{} appears twice for project {} in this batch",
                    s.evaluatee_id, s.project_id
                ),
            ));
        }
        if !(0..=PM_SCORE_MAX).contains(&s.score) {
            return Err(row_error(
                i,
                format!("PM score {} is out of range (0-{})", s.score, PM_SCORE_MAX),
            ));
        }
        if !org::project_exists(conn, &s.project_id)? {
            return Err(EngineError::not_found("project", s.project_id.as_str()));
        }
        match org::assigned_pm(conn, &s.project_id, period_id)? {
            Some(assigned) if assigned == pm_id => {}
            Some(_) => {
                return Err(row_error(
                    i,
                    format!("{} is not the PM of project {}", pm_id, s.project_id),
                ))
            }
            None => {
                return Err(row_error(
                    i,
                    format!("project {} has no PM assigned for this period", s.project_id),
                ))
            }
        }
        require_user(conn, &s.evaluatee_id)?;
    }

    let tx = conn.unchecked_transaction()?;
    for s in batch {
        tx.execute(
            "INSERT INTO pm_evaluations(id, pm_id, evaluatee_id, project_id, period_id, score, comment)
             VALUES(?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(evaluatee_id, project_id, period_id) DO UPDATE SET
               pm_id = excluded.pm_id,
               score = excluded.score,
               comment = excluded.comment",
            (
                uuid::Uuid::new_v4().to_string(),
                pm_id,
                &s.evaluatee_id,
                &s.project_id,
                period_id,
                s.score,
                &s.comment,
            ),
        )?;
    }
    tx.commit()?;
    info!(pm_id, period_id, saved = batch.len(), "PM evaluations saved");
    Ok(SubmitOutcome {
        period_id: period_id.to_string(),
        saved: batch.len(),
    })
}

pub fn submit_qualitative(
    conn: &Connection,
    evaluator_id: &str,
    period_id: &str,
    batch: &[QualitativeSubmission],
) -> Result<SubmitOutcome, EngineError> {
    period::require_open(conn, period_id)?;
    require_user(conn, evaluator_id)?;

    let mut seen = HashSet::new();
    for (i, s) in batch.iter().enumerate() {
        if !seen.insert(s.evaluatee_id.as_str()) {
            return Err(row_error(
                i,
                format!("{} appears twice in this batch", s.evaluatee_id),
            ));
        }
        if !(0..=QUALITATIVE_MAX).contains(&s.qualitative_score) {
            return Err(row_error(
                i,
                format!(
                    "qualitative score {} is out of range (0-{})",
                    s.qualitative_score, QUALITATIVE_MAX
                ),
            ));
        }
        if !(0..=DEPARTMENT_CONTRIBUTION_MAX).contains(&s.department_contribution) {
            return Err(row_error(
                i,
                format!(
                    "department contribution {} is out of range (0-{})",
                    s.department_contribution, DEPARTMENT_CONTRIBUTION_MAX
                ),
            ));
        }
        require_user(conn, &s.evaluatee_id)?;
    }

    let tx = conn.unchecked_transaction()?;
    for s in batch {
        tx.execute(
            "INSERT INTO qualitative_evaluations(
                id, evaluator_id, evaluatee_id, period_id, qualitative_score,
                department_contribution, feedback
             ) VALUES(?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(evaluatee_id, period_id) DO UPDATE SET
               evaluator_id = excluded.evaluator_id,
               qualitative_score = excluded.qualitative_score,
               department_contribution = excluded.department_contribution,
               feedback = excluded.feedback",
            (
                uuid::Uuid::new_v4().to_string(),
                evaluator_id,
                &s.evaluatee_id,
                period_id,
                s.qualitative_score,
                s.department_contribution,
                &s.feedback,
            ),
        )?;
    }
    tx.commit()?;
    info!(evaluator_id, period_id, saved = batch.len(), "qualitative evaluations saved");
    Ok(SubmitOutcome {
        period_id: period_id.to_string(),
        saved: batch.len(),
    })
}
