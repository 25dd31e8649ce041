use crate::aggregate::{self, PendingReason, PeriodInputs, ProjectAggregate};
use crate::error::EngineError;
use crate::model::{EvaluationItem, Grade, Role};
use crate::org::{self, UserRecord};
use crate::participation::{LedgerStatus, ParticipationLedger};
use crate::weights::{RoleWeights, WeightTable};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use tracing::{debug, info};

/// Weighted combination of the three components. Components whose role
/// weight is zero may be absent and contribute nothing.
pub fn final_score(
    peer: Option<f64>,
    pm: Option<f64>,
    qualitative: Option<f64>,
    weights: &RoleWeights,
) -> f64 {
    peer.unwrap_or(0.0) * weights.peer / 100.0
        + pm.unwrap_or(0.0) * weights.pm / 100.0
        + qualitative.unwrap_or(0.0) * weights.qualitative / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalEvaluation {
    pub user_id: String,
    pub period_id: String,
    pub role: Role,
    pub peer_score: Option<f64>,
    pub pm_score: Option<f64>,
    /// Qualitative (0-20) plus department contribution (0-10), out of 30.
    pub qualitative_score: Option<f64>,
    pub final_score: f64,
    /// Effective grade from the grade-adjustment table; never written here.
    pub grade: Option<Grade>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UserOutcome {
    Computed(FinalEvaluation, Vec<ProjectAggregate>),
    Pending(Vec<PendingReason>),
    NotParticipating,
}

pub fn calculate_user(
    user: &UserRecord,
    period_id: &str,
    ledger: &ParticipationLedger,
    inputs: &PeriodInputs,
    weights: &WeightTable,
) -> Result<UserOutcome, EngineError> {
    if ledger.status(&user.id) == LedgerStatus::Unassigned {
        return Ok(UserOutcome::NotParticipating);
    }
    let role_weights = weights.role_weights(user.role)?;

    let agg = aggregate::aggregate_user(&user.id, ledger.weights_for(&user.id), inputs)?;
    let qualitative = aggregate::qualitative_score(&user.id, inputs)?;

    let required = |reason: &PendingReason| match reason.component() {
        Some(item) => role_weights.get(item) > 0.0,
        None => true,
    };
    let mut pending: Vec<PendingReason> = agg.pending.into_iter().filter(required).collect();
    if qualitative.is_none() && role_weights.qualitative > 0.0 {
        pending.push(PendingReason::QualitativeMissing);
    }
    if !pending.is_empty() {
        return Ok(UserOutcome::Pending(pending));
    }

    // Components the role does not weigh are stored as null even when submitted.
    let weighed = |item: EvaluationItem, score: Option<f64>| {
        score.filter(|_| role_weights.get(item) > 0.0)
    };
    let peer = weighed(EvaluationItem::Peer, agg.peer_score);
    let pm = weighed(EvaluationItem::Pm, agg.pm_score);
    let qualitative = weighed(EvaluationItem::Qualitative, qualitative.map(|q| q as f64));
    let final_score = final_score(peer, pm, qualitative, &role_weights);
    Ok(UserOutcome::Computed(
        FinalEvaluation {
            user_id: user.id.clone(),
            period_id: period_id.to_string(),
            role: user.role,
            peer_score: peer,
            pm_score: pm,
            qualitative_score: qualitative,
            final_score,
            grade: None,
        },
        agg.projects,
    ))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUser {
    pub user_id: String,
    pub reasons: Vec<PendingEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    pub kind: &'static str,
    #[serde(flatten)]
    pub reason: PendingReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodStatus {
    InProgress,
    Ready,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalcSummary {
    pub period_id: String,
    pub status: PeriodStatus,
    pub calculated: usize,
    pub pending: Vec<PendingUser>,
    pub not_participating: Vec<String>,
    pub rows_digest: String,
}

fn ensure_period(conn: &Connection, period_id: &str) -> Result<(), EngineError> {
    if org::period_exists(conn, period_id)? {
        Ok(())
    } else {
        Err(EngineError::not_found("evaluation period", period_id))
    }
}

/// Recomputes FinalEvaluation rows for the period.
///
/// Every input is re-read; nothing is written until every user in scope has
/// been evaluated, so a fatal error leaves the previous rows untouched. Rows of
/// the users in scope are then replaced wholesale in one transaction.
pub fn calculate_period(
    conn: &Connection,
    period_id: &str,
    user_ids: Option<&[String]>,
) -> Result<CalcSummary, EngineError> {
    ensure_period(conn, period_id)?;

    let users = match user_ids {
        Some(ids) => {
            let mut out = Vec::with_capacity(ids.len());
            let unique: BTreeSet<&String> = ids.iter().collect();
            for id in unique {
                let user = org::get_user(conn, id)?
                    .ok_or_else(|| EngineError::not_found("user", id.as_str()))?;
                out.push(user);
            }
            out
        }
        None => org::list_users(conn, None)?
            .into_iter()
            .filter(|u| u.active)
            .collect(),
    };

    let ledger = ParticipationLedger::load(conn, period_id)?;
    let inputs = PeriodInputs::load(conn, period_id)?;
    let weights = WeightTable::load(conn)?;

    let mut computed = Vec::new();
    let mut pending = Vec::new();
    let mut not_participating = Vec::new();
    for user in &users {
        match calculate_user(user, period_id, &ledger, &inputs, &weights)? {
            UserOutcome::Computed(row, projects) => computed.push((row, projects)),
            UserOutcome::Pending(reasons) => {
                debug!(user_id = %user.id, reasons = reasons.len(), "final score pending");
                pending.push(PendingUser {
                    user_id: user.id.clone(),
                    reasons: reasons
                        .into_iter()
                        .map(|reason| PendingEntry {
                            kind: reason.kind(),
                            reason,
                        })
                        .collect(),
                });
            }
            UserOutcome::NotParticipating => not_participating.push(user.id.clone()),
        }
    }

    let tx = conn.unchecked_transaction()?;
    for user in &users {
        tx.execute(
            "DELETE FROM project_score_aggregates WHERE period_id = ? AND user_id = ?",
            (period_id, &user.id),
        )?;
        tx.execute(
            "DELETE FROM final_evaluations WHERE period_id = ? AND user_id = ?",
            (period_id, &user.id),
        )?;
    }
    for (row, projects) in &computed {
        tx.execute(
            "INSERT INTO final_evaluations(
                user_id, period_id, role, peer_score, pm_score, qualitative_score, final_score
             ) VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &row.user_id,
                period_id,
                row.role.as_str(),
                row.peer_score,
                row.pm_score,
                row.qualitative_score,
                row.final_score,
            ),
        )?;
        for p in projects {
            tx.execute(
                "INSERT INTO project_score_aggregates(
                    user_id, project_id, period_id, participation_weight,
                    peer_average, peer_count, pm_score, pm_id
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    &row.user_id,
                    &p.project_id,
                    period_id,
                    p.participation_weight,
                    p.peer_average,
                    p.peer_count,
                    p.pm_score,
                    &p.pm_id,
                ),
            )?;
        }
    }
    tx.commit()?;

    let readiness = period_readiness(conn, period_id, None)?;
    let rows_digest = period_rows_digest(conn, period_id)?;
    info!(
        period_id,
        calculated = computed.len(),
        pending = pending.len(),
        not_participating = not_participating.len(),
        status = ?readiness.status,
        "final scores calculated"
    );

    Ok(CalcSummary {
        period_id: period_id.to_string(),
        status: readiness.status,
        calculated: computed.len(),
        pending,
        not_participating,
        rows_digest,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodReadiness {
    pub period_id: String,
    pub status: PeriodStatus,
    pub scored: usize,
    /// Members with nonzero participation but no FinalEvaluation row.
    pub pending_user_ids: Vec<String>,
}

/// Readiness of the whole active user base, or of `members` when given.
pub fn period_readiness(
    conn: &Connection,
    period_id: &str,
    members: Option<&[String]>,
) -> Result<PeriodReadiness, EngineError> {
    ensure_period(conn, period_id)?;
    let ledger = ParticipationLedger::load(conn, period_id)?;
    let mut stmt = conn.prepare("SELECT user_id FROM final_evaluations WHERE period_id = ?")?;
    let scored = stmt
        .query_map([period_id], |r| r.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    let candidates: Vec<String> = match members {
        Some(m) => m.to_vec(),
        None => org::list_users(conn, None)?
            .into_iter()
            .filter(|u| u.active)
            .map(|u| u.id)
            .collect(),
    };

    let mut pending_user_ids = Vec::new();
    let mut scored_count = 0;
    for id in candidates {
        if scored.contains(&id) {
            scored_count += 1;
        } else if ledger.total_for(&id) > 0 {
            pending_user_ids.push(id);
        }
    }
    pending_user_ids.sort();

    Ok(PeriodReadiness {
        period_id: period_id.to_string(),
        status: if pending_user_ids.is_empty() {
            PeriodStatus::Ready
        } else {
            PeriodStatus::InProgress
        },
        scored: scored_count,
        pending_user_ids,
    })
}

pub fn load_final_evaluations(
    conn: &Connection,
    period_id: &str,
    user_ids: Option<&[String]>,
) -> Result<Vec<FinalEvaluation>, EngineError> {
    let mut sql = String::from(
        "SELECT f.user_id, f.role, f.peer_score, f.pm_score, f.qualitative_score, f.final_score, g.grade
         FROM final_evaluations f
         LEFT JOIN grade_adjustments g ON g.user_id = f.user_id AND g.period_id = f.period_id
         WHERE f.period_id = ?",
    );
    let mut bind_values: Vec<Value> = vec![Value::Text(period_id.to_string())];
    if let Some(ids) = user_ids {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = std::iter::repeat("?")
            .take(ids.len())
            .collect::<Vec<_>>()
            .join(",");
        write!(sql, " AND f.user_id IN ({})", placeholders).ok();
        bind_values.extend(ids.iter().map(|id| Value::Text(id.clone())));
    }
    sql.push_str(" ORDER BY f.user_id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(bind_values), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<f64>>(2)?,
                r.get::<_, Option<f64>>(3)?,
                r.get::<_, Option<f64>>(4)?,
                r.get::<_, f64>(5)?,
                r.get::<_, Option<String>>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(user_id, role, peer, pm, qual, final_score, grade)| {
            let role = Role::parse(&role).ok_or_else(|| {
                EngineError::invariant(format!("unknown role '{}' stored for {}", role, user_id))
            })?;
            let grade = match grade {
                Some(g) => Some(Grade::parse(&g).ok_or_else(|| {
                    EngineError::invariant(format!("unknown grade '{}' stored for {}", g, user_id))
                })?),
                None => None,
            };
            Ok(FinalEvaluation {
                user_id,
                period_id: period_id.to_string(),
                role,
                peer_score: peer,
                pm_score: pm,
                qualitative_score: qual,
                final_score,
                grade,
            })
        })
        .collect()
}

pub fn load_project_aggregates(
    conn: &Connection,
    period_id: &str,
    user_id: &str,
) -> Result<Vec<ProjectAggregate>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT project_id, participation_weight, peer_average, peer_count, pm_score, pm_id
         FROM project_score_aggregates
         WHERE period_id = ? AND user_id = ?
         ORDER BY project_id",
    )?;
    let rows = stmt
        .query_map((period_id, user_id), |r| {
            Ok(ProjectAggregate {
                project_id: r.get(0)?,
                participation_weight: r.get(1)?,
                peer_average: r.get(2)?,
                peer_count: r.get(3)?,
                pm_score: r.get(4)?,
                pm_id: r.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn push_opt_bits(buf: &mut String, v: Option<f64>) {
    match v {
        Some(x) => {
            write!(buf, "{:016x}", x.to_bits()).ok();
        }
        None => buf.push('-'),
    }
    buf.push('|');
}

/// SHA-256 over the exact bits of every derived row of the period. Equal
/// digests mean byte-identical FinalEvaluation rows.
pub fn period_rows_digest(conn: &Connection, period_id: &str) -> Result<String, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT user_id, role, peer_score, pm_score, qualitative_score, final_score
         FROM final_evaluations
         WHERE period_id = ?
         ORDER BY user_id",
    )?;
    let rows = stmt
        .query_map([period_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<f64>>(2)?,
                r.get::<_, Option<f64>>(3)?,
                r.get::<_, Option<f64>>(4)?,
                r.get::<_, f64>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut hasher = Sha256::new();
    let mut line = String::new();
    for (user_id, role, peer, pm, qual, final_score) in rows {
        line.clear();
        line.push_str(&user_id);
        line.push('|');
        line.push_str(&role);
        line.push('|');
        push_opt_bits(&mut line, peer);
        push_opt_bits(&mut line, pm);
        push_opt_bits(&mut line, qual);
        push_opt_bits(&mut line, Some(final_score));
        line.push('\n');
        hasher.update(line.as_bytes());
    }
    Ok(format!("{:x}", hasher.finalize()))
}
