//! Folds raw peer and PM submissions into one prorated score per user.
//!
//! Everything here is recomputed wholesale from the submission tables. Scores
//! are never interpolated: a project with nonzero participation but no peer
//! submissions (or no PM score) leaves the user pending. Stored values outside
//! their declared range are an invariant violation, not something to clamp.

use crate::error::EngineError;
use crate::model::EvaluationItem;
use crate::participation::ProjectShare;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;

/// Per-criterion maxima of the seven-part peer rubric; they sum to 100.
pub const PEER_CRITERIA_MAX: [i64; 7] = [20, 20, 10, 10, 10, 10, 20];
pub const PEER_SCORE_MAX: i64 = 100;
pub const PM_SCORE_MAX: i64 = 100;
pub const QUALITATIVE_MAX: i64 = 20;
pub const DEPARTMENT_CONTRIBUTION_MAX: i64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerScore {
    Total(i64),
    Criteria(Vec<i64>),
}

impl PeerScore {
    pub fn total(&self) -> i64 {
        match self {
            Self::Total(v) => *v,
            Self::Criteria(c) => c.iter().sum(),
        }
    }

    /// First range violation, if any.
    pub fn range_error(&self) -> Option<String> {
        match self {
            Self::Total(v) => {
                if !(0..=PEER_SCORE_MAX).contains(v) {
                    return Some(format!("peer score {} is out of range (0-{})", v, PEER_SCORE_MAX));
                }
                None
            }
            Self::Criteria(c) => {
                if c.len() != PEER_CRITERIA_MAX.len() {
                    return Some(format!(
                        "peer criteria must have exactly {} scores, got {}",
                        PEER_CRITERIA_MAX.len(),
                        c.len()
                    ));
                }
                for (i, (score, max)) in c.iter().zip(PEER_CRITERIA_MAX.iter()).enumerate() {
                    if !(0..=*max).contains(score) {
                        return Some(format!(
                            "score at index {} is out of range (0-{})",
                            i, max
                        ));
                    }
                }
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PmRecord {
    pub pm_id: String,
    pub score: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualitativeRecord {
    pub qualitative: i64,
    pub department_contribution: i64,
}

impl QualitativeRecord {
    /// The 20 + 10 split folded into one 0..=30 value.
    pub fn combined(&self) -> i64 {
        self.qualitative + self.department_contribution
    }
}

/// Raw submissions for one period, keyed by (evaluatee, project).
#[derive(Debug, Clone, Default)]
pub struct PeriodInputs {
    /// Peer totals ordered by evaluator id so averages are bit-reproducible.
    pub peers: BTreeMap<(String, String), Vec<PeerScore>>,
    pub pms: BTreeMap<(String, String), PmRecord>,
    pub pm_assignments: BTreeMap<String, String>,
    pub qualitative: BTreeMap<String, QualitativeRecord>,
}

impl PeriodInputs {
    pub fn load(conn: &Connection, period_id: &str) -> Result<Self, EngineError> {
        let mut inputs = PeriodInputs::default();

        let mut stmt = conn.prepare(
            "SELECT evaluatee_id, project_id, score, criteria_json
             FROM peer_evaluations
             WHERE period_id = ?
             ORDER BY evaluatee_id, project_id, evaluator_id",
        )?;
        let rows = stmt
            .query_map([period_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (evaluatee, project, score, criteria_json) in rows {
            let peer = match criteria_json {
                Some(raw) => {
                    let criteria: Vec<i64> = serde_json::from_str(&raw).map_err(|e| {
                        EngineError::invariant(format!(
                            "stored peer criteria for {} in {} are unreadable: {}",
                            evaluatee, project, e
                        ))
                    })?;
                    if criteria.iter().sum::<i64>() != score {
                        return Err(EngineError::invariant(format!(
                            "stored peer total {} for {} in {} disagrees with its criteria",
                            score, evaluatee, project
                        )));
                    }
                    PeerScore::Criteria(criteria)
                }
                None => PeerScore::Total(score),
            };
            inputs.peers.entry((evaluatee, project)).or_default().push(peer);
        }

        let mut stmt = conn.prepare(
            "SELECT evaluatee_id, project_id, pm_id, score
             FROM pm_evaluations
             WHERE period_id = ?",
        )?;
        let rows = stmt
            .query_map([period_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    PmRecord {
                        pm_id: r.get(2)?,
                        score: r.get(3)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (evaluatee, project, record) in rows {
            inputs.pms.insert((evaluatee, project), record);
        }

        let mut stmt =
            conn.prepare("SELECT project_id, pm_user_id FROM project_pms WHERE period_id = ?")?;
        inputs.pm_assignments = stmt
            .query_map([period_id], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<BTreeMap<String, String>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT evaluatee_id, qualitative_score, department_contribution
             FROM qualitative_evaluations
             WHERE period_id = ?",
        )?;
        inputs.qualitative = stmt
            .query_map([period_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    QualitativeRecord {
                        qualitative: r.get(1)?,
                        department_contribution: r.get(2)?,
                    },
                ))
            })?
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(inputs)
    }
}

/// Why a user's final score cannot be computed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PendingReason {
    ParticipationIncomplete {
        total: i64,
    },
    PeerMissing {
        #[serde(rename = "projectId")]
        project_id: String,
    },
    PmUnassigned {
        #[serde(rename = "projectId")]
        project_id: String,
    },
    PmMissing {
        #[serde(rename = "projectId")]
        project_id: String,
    },
    QualitativeMissing,
}

impl PendingReason {
    /// Missing PM assignment is admin configuration; everything else is
    /// input that simply has not arrived yet.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PmUnassigned { .. } => "configuration_missing",
            _ => "incomplete_inputs",
        }
    }

    pub fn component(&self) -> Option<EvaluationItem> {
        match self {
            Self::ParticipationIncomplete { .. } => None,
            Self::PeerMissing { .. } => Some(EvaluationItem::Peer),
            Self::PmUnassigned { .. } | Self::PmMissing { .. } => Some(EvaluationItem::Pm),
            Self::QualitativeMissing => Some(EvaluationItem::Qualitative),
        }
    }
}

/// The per (user, project, period) aggregation record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectAggregate {
    pub project_id: String,
    pub participation_weight: i64,
    pub peer_average: Option<f64>,
    pub peer_count: i64,
    pub pm_score: Option<f64>,
    pub pm_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreAggregate {
    pub projects: Vec<ProjectAggregate>,
    pub peer_score: Option<f64>,
    pub pm_score: Option<f64>,
    pub pending: Vec<PendingReason>,
}

fn check_range(what: &str, user_id: &str, value: i64, max: i64) -> Result<(), EngineError> {
    if !(0..=max).contains(&value) {
        return Err(EngineError::invariant(format!(
            "{} {} for {} outside 0..={}",
            what, value, user_id, max
        )));
    }
    Ok(())
}

pub fn peer_average(user_id: &str, scores: &[PeerScore]) -> Result<Option<f64>, EngineError> {
    if scores.is_empty() {
        return Ok(None);
    }
    let mut sum = 0_i64;
    for s in scores {
        if let Some(msg) = s.range_error() {
            return Err(EngineError::invariant(format!("{} ({})", msg, user_id)));
        }
        sum += s.total();
    }
    Ok(Some(sum as f64 / scores.len() as f64))
}

/// Prorates peer and PM scores across the user's projects.
///
/// `shares` must be the user's complete ledger; an incomplete ledger is
/// reported as pending without touching any submission.
pub fn aggregate_user(
    user_id: &str,
    shares: &[ProjectShare],
    inputs: &PeriodInputs,
) -> Result<ScoreAggregate, EngineError> {
    let mut pending = Vec::new();
    let total: i64 = shares.iter().map(|s| s.weight).sum();
    if total != crate::participation::FULL_PARTICIPATION {
        pending.push(PendingReason::ParticipationIncomplete { total });
        return Ok(ScoreAggregate {
            projects: Vec::new(),
            peer_score: None,
            pm_score: None,
            pending,
        });
    }

    let mut projects = Vec::with_capacity(shares.len());
    let mut peer_sum = 0.0_f64;
    let mut pm_sum = 0.0_f64;
    let mut peer_complete = true;
    let mut pm_complete = true;

    for share in shares {
        let key = (user_id.to_string(), share.project_id.clone());
        let peers = inputs.peers.get(&key).map(|v| v.as_slice()).unwrap_or(&[]);
        let avg = peer_average(user_id, peers)?;

        let assigned_pm = inputs.pm_assignments.get(&share.project_id);
        let pm = match assigned_pm {
            None => None,
            Some(pm_id) => inputs.pms.get(&key).filter(|r| &r.pm_id == pm_id),
        };
        if let Some(record) = pm {
            check_range("pm score", user_id, record.score, PM_SCORE_MAX)?;
        }

        if share.weight > 0 {
            match avg {
                Some(a) => peer_sum += a * share.weight as f64 / 100.0,
                None => {
                    peer_complete = false;
                    pending.push(PendingReason::PeerMissing {
                        project_id: share.project_id.clone(),
                    });
                }
            }
            match (assigned_pm, pm) {
                (None, _) => {
                    pm_complete = false;
                    pending.push(PendingReason::PmUnassigned {
                        project_id: share.project_id.clone(),
                    });
                }
                (Some(_), None) => {
                    pm_complete = false;
                    pending.push(PendingReason::PmMissing {
                        project_id: share.project_id.clone(),
                    });
                }
                (Some(_), Some(record)) => {
                    pm_sum += record.score as f64 * share.weight as f64 / 100.0;
                }
            }
        }

        projects.push(ProjectAggregate {
            project_id: share.project_id.clone(),
            participation_weight: share.weight,
            peer_average: avg,
            peer_count: peers.len() as i64,
            pm_score: pm.map(|r| r.score as f64),
            pm_id: pm.map(|r| r.pm_id.clone()),
        });
    }

    Ok(ScoreAggregate {
        projects,
        peer_score: peer_complete.then_some(peer_sum),
        pm_score: pm_complete.then_some(pm_sum),
        pending,
    })
}

/// Range-checked 0..=30 qualitative value, or `None` when not submitted.
pub fn qualitative_score(user_id: &str, inputs: &PeriodInputs) -> Result<Option<i64>, EngineError> {
    let Some(record) = inputs.qualitative.get(user_id) else {
        return Ok(None);
    };
    check_range("qualitative score", user_id, record.qualitative, QUALITATIVE_MAX)?;
    check_range(
        "department contribution",
        user_id,
        record.department_contribution,
        DEPARTMENT_CONTRIBUTION_MAX,
    )?;
    Ok(Some(record.combined()))
}
