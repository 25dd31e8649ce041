//! Manual grade adjustments for one (department, period) roster.
//!
//! A batch is validated against the union of unchanged and proposed grades for
//! the whole roster and committed atomically. Validation and commit share one
//! IMMEDIATE transaction, so two submissions for the same key cannot both pass
//! against a stale snapshot; the per-key revision counter lets callers detect
//! that someone else committed since they last read the roster.

use crate::calc::{self, PeriodStatus};
use crate::config::QuotaSettings;
use crate::error::{AdjustmentRule, AdjustmentViolation, EngineError};
use crate::model::{DepartmentGrade, Grade, Role};
use crate::org;
use crate::period;
use crate::quota::{self, Quotas};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedAdjustment {
    pub user_id: String,
    /// `None` clears the user's adjustment.
    pub grade: Option<Grade>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GradeCounts {
    #[serde(rename = "S")]
    pub s: usize,
    #[serde(rename = "A")]
    pub a: usize,
    #[serde(rename = "B+")]
    pub b_plus: usize,
    #[serde(rename = "B")]
    pub b: usize,
    #[serde(rename = "B-")]
    pub b_minus: usize,
    #[serde(rename = "C")]
    pub c: usize,
    #[serde(rename = "D")]
    pub d: usize,
    pub ungraded: usize,
}

impl GradeCounts {
    pub fn add(&mut self, grade: Option<Grade>) {
        match grade {
            Some(Grade::S) => self.s += 1,
            Some(Grade::A) => self.a += 1,
            Some(Grade::BPlus) => self.b_plus += 1,
            Some(Grade::B) => self.b += 1,
            Some(Grade::BMinus) => self.b_minus += 1,
            Some(Grade::C) => self.c += 1,
            Some(Grade::D) => self.d += 1,
            None => self.ungraded += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub user_id: String,
    pub name: String,
    pub role: Role,
    pub final_score: Option<f64>,
    /// Adjusted grade recorded for this period.
    pub grade: Option<Grade>,
    /// Grade inherited from the prior period when carry-forward is enabled.
    pub carried_grade: Option<Grade>,
}

impl RosterEntry {
    pub fn effective_grade(&self) -> Option<Grade> {
        self.grade.or(self.carried_grade)
    }
}

/// Everything the validator needs, read in one pass.
#[derive(Debug, Clone)]
pub struct AdjustmentContext {
    pub department_id: String,
    pub period_id: String,
    pub roster: Vec<RosterEntry>,
    /// Roster members with participation but no final score yet.
    pub pending: Vec<String>,
    pub department_grade: Option<DepartmentGrade>,
    /// `None` when the department has no grade for the period.
    pub quotas: Option<Quotas>,
    pub revision: i64,
}

impl AdjustmentContext {
    pub fn load(
        conn: &Connection,
        department_id: &str,
        period_id: &str,
        policy: &QuotaSettings,
    ) -> Result<Self, EngineError> {
        let current = period::require_period(conn, period_id)?;
        let members = org::department_roster(conn, department_id, policy)?;
        let ids: Vec<String> = members.iter().map(|u| u.id.clone()).collect();

        let finals: BTreeMap<String, f64> =
            calc::load_final_evaluations(conn, period_id, Some(ids.as_slice()))?
                .into_iter()
                .map(|f| (f.user_id, f.final_score))
                .collect();
        let grades = adjusted_grades(conn, period_id)?;
        let carried = if policy.carry_forward_prior_grades {
            match period::prior_period(conn, &current)? {
                Some(prior) => adjusted_grades(conn, &prior.id)?,
                None => BTreeMap::new(),
            }
        } else {
            BTreeMap::new()
        };

        let roster = members
            .into_iter()
            .map(|u| RosterEntry {
                final_score: finals.get(&u.id).copied(),
                grade: grades.get(&u.id).copied(),
                carried_grade: carried.get(&u.id).copied(),
                user_id: u.id,
                name: u.name,
                role: u.role,
            })
            .collect();

        let readiness = calc::period_readiness(conn, period_id, Some(ids.as_slice()))?;
        let (department_grade, quotas) =
            match quota::quotas_for_roster(conn, department_id, period_id, ids.len()) {
                Ok(report) => (Some(report.department_grade), Some(report.quotas)),
                Err(EngineError::NoQuotaDefined { .. }) => (None, None),
                Err(e) => return Err(e),
            };

        Ok(Self {
            department_id: department_id.to_string(),
            period_id: period_id.to_string(),
            roster,
            pending: readiness.pending_user_ids,
            department_grade,
            quotas,
            revision: current_revision(conn, department_id, period_id)?,
        })
    }

    pub fn counts(&self) -> GradeCounts {
        let mut counts = GradeCounts::default();
        for entry in &self.roster {
            counts.add(entry.effective_grade());
        }
        counts
    }

    /// Applies `proposals` over the current roster grades and checks, in order:
    /// batch shape, roster membership, final score presence, period readiness,
    /// department grade for S/A, S quota, A quota, B+/B- balance.
    pub fn validate(&self, proposals: &[ProposedAdjustment]) -> Result<GradeCounts, EngineError> {
        let mut seen = HashSet::new();
        for p in proposals {
            if !seen.insert(p.user_id.as_str()) {
                return Err(EngineError::rejected_with(
                    format!("user {} appears more than once in the batch", p.user_id),
                    json!({ "userId": p.user_id }),
                ));
            }
        }

        let by_user: BTreeMap<&str, &RosterEntry> =
            self.roster.iter().map(|e| (e.user_id.as_str(), e)).collect();
        for p in proposals {
            let entry = by_user.get(p.user_id.as_str()).ok_or_else(|| {
                EngineError::RejectedAdjustment(AdjustmentViolation {
                    rule: AdjustmentRule::NotInRoster,
                    expected: 0,
                    actual: 0,
                    user_id: Some(p.user_id.clone()),
                    department_id: None,
                })
            })?;
            if p.grade.is_some() && entry.final_score.is_none() {
                return Err(EngineError::RejectedAdjustment(AdjustmentViolation {
                    rule: AdjustmentRule::MissingFinalScore,
                    expected: 0,
                    actual: 0,
                    user_id: Some(p.user_id.clone()),
                    department_id: None,
                }));
            }
        }

        if !self.pending.is_empty() {
            return Err(EngineError::PeriodNotReady {
                period_id: self.period_id.clone(),
                pending: self.pending.clone(),
            });
        }

        let counts = self.projected_counts(proposals);
        check_counts(&counts, self.quotas, &self.department_id, &self.period_id)?;
        Ok(counts)
    }

    /// Roster counts once `proposals` are applied. Users off this roster are ignored.
    pub fn projected_counts(&self, proposals: &[ProposedAdjustment]) -> GradeCounts {
        let proposed: BTreeMap<&str, Option<Grade>> = proposals
            .iter()
            .map(|p| (p.user_id.as_str(), p.grade))
            .collect();
        let mut counts = GradeCounts::default();
        for entry in &self.roster {
            let grade = match proposed.get(entry.user_id.as_str()) {
                Some(Some(g)) => Some(*g),
                // Clearing drops the in-period row; a carried grade counts again.
                Some(None) => entry.carried_grade,
                None => entry.effective_grade(),
            };
            counts.add(grade);
        }
        counts
    }

    fn current_grade(&self, user_id: &str) -> Option<Grade> {
        self.roster
            .iter()
            .find(|e| e.user_id == user_id)
            .and_then(|e| e.grade)
    }
}

/// S/A quotas of every graded ancestor department must still hold once the
/// batch lands, since their rosters include this department's members.
/// Returns every ancestor, graded or not.
fn check_ancestor_quotas(
    conn: &Connection,
    department_id: &str,
    period_id: &str,
    proposals: &[ProposedAdjustment],
    policy: &QuotaSettings,
) -> Result<Vec<String>, EngineError> {
    let ancestors = org::department_ancestors(conn, department_id)?;
    for ancestor in &ancestors {
        let ctx = AdjustmentContext::load(conn, ancestor, period_id, policy)?;
        let Some(quotas) = ctx.quotas else {
            continue;
        };
        let counts = ctx.projected_counts(proposals);
        let over = [
            (AdjustmentRule::SQuota, quotas.s, counts.s as i64),
            (AdjustmentRule::AQuota, quotas.a, counts.a as i64),
        ]
        .into_iter()
        .find(|(_, quota, count)| count > quota);
        if let Some((rule, expected, actual)) = over {
            return Err(EngineError::RejectedAdjustment(AdjustmentViolation {
                rule,
                expected,
                actual,
                user_id: None,
                department_id: Some(ancestor.clone()),
            }));
        }
    }
    Ok(ancestors)
}

/// Quota and balance rules over final roster counts.
pub fn check_counts(
    counts: &GradeCounts,
    quotas: Option<Quotas>,
    department_id: &str,
    period_id: &str,
) -> Result<(), EngineError> {
    let quotas = match quotas {
        Some(q) => q,
        None if counts.s > 0 || counts.a > 0 => {
            return Err(EngineError::NoQuotaDefined {
                department_id: department_id.to_string(),
                period_id: period_id.to_string(),
            })
        }
        None => Quotas { s: 0, a: 0 },
    };
    if counts.s as i64 > quotas.s {
        return Err(EngineError::RejectedAdjustment(AdjustmentViolation {
            rule: AdjustmentRule::SQuota,
            expected: quotas.s,
            actual: counts.s as i64,
            user_id: None,
            department_id: None,
        }));
    }
    if counts.a as i64 > quotas.a {
        return Err(EngineError::RejectedAdjustment(AdjustmentViolation {
            rule: AdjustmentRule::AQuota,
            expected: quotas.a,
            actual: counts.a as i64,
            user_id: None,
            department_id: None,
        }));
    }
    if counts.b_plus != counts.b_minus {
        return Err(EngineError::RejectedAdjustment(AdjustmentViolation {
            rule: AdjustmentRule::BBalance,
            expected: counts.b_minus as i64,
            actual: counts.b_plus as i64,
            user_id: None,
            department_id: None,
        }));
    }
    Ok(())
}

fn adjusted_grades(conn: &Connection, period_id: &str) -> Result<BTreeMap<String, Grade>, EngineError> {
    let mut stmt = conn.prepare("SELECT user_id, grade FROM grade_adjustments WHERE period_id = ?")?;
    let rows = stmt
        .query_map([period_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|(user, raw)| {
            let grade = Grade::parse(&raw).ok_or_else(|| {
                EngineError::invariant(format!("unknown grade '{}' stored for {}", raw, user))
            })?;
            Ok((user, grade))
        })
        .collect()
}

pub fn current_revision(
    conn: &Connection,
    department_id: &str,
    period_id: &str,
) -> Result<i64, EngineError> {
    let rev: Option<i64> = conn
        .query_row(
            "SELECT revision FROM grade_adjustment_revisions WHERE department_id = ? AND period_id = ?",
            (department_id, period_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(rev.unwrap_or(0))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterView {
    pub department_id: String,
    pub period_id: String,
    pub status: PeriodStatus,
    pub members: Vec<RosterEntry>,
    pub counts: GradeCounts,
    pub department_grade: Option<DepartmentGrade>,
    pub quotas: Option<Quotas>,
    pub revision: i64,
}

pub fn roster_view(
    conn: &Connection,
    department_id: &str,
    period_id: &str,
    policy: &QuotaSettings,
) -> Result<RosterView, EngineError> {
    let ctx = AdjustmentContext::load(conn, department_id, period_id, policy)?;
    Ok(RosterView {
        counts: ctx.counts(),
        status: if ctx.pending.is_empty() {
            PeriodStatus::Ready
        } else {
            PeriodStatus::InProgress
        },
        department_id: ctx.department_id,
        period_id: ctx.period_id,
        members: ctx.roster,
        department_grade: ctx.department_grade,
        quotas: ctx.quotas,
        revision: ctx.revision,
    })
}

/// Runs the validator without committing anything.
pub fn preview(
    conn: &Connection,
    department_id: &str,
    period_id: &str,
    proposals: &[ProposedAdjustment],
    policy: &QuotaSettings,
) -> Result<Result<GradeCounts, EngineError>, EngineError> {
    let ctx = AdjustmentContext::load(conn, department_id, period_id, policy)?;
    let checked = ctx.validate(proposals).and_then(|counts| {
        check_ancestor_quotas(conn, department_id, period_id, proposals, policy)?;
        Ok(counts)
    });
    match checked {
        Ok(counts) => Ok(Ok(counts)),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => Ok(Err(e)),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustOutcome {
    pub department_id: String,
    pub period_id: String,
    pub revision: i64,
    pub updated: Vec<String>,
    pub counts: GradeCounts,
}

pub fn adjust_grades(
    conn: &Connection,
    department_id: &str,
    period_id: &str,
    proposals: &[ProposedAdjustment],
    expected_revision: Option<i64>,
    policy: &QuotaSettings,
) -> Result<AdjustOutcome, EngineError> {
    // Takes the write lock up front so the snapshot we validate is the one we commit over.
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let revision = current_revision(&tx, department_id, period_id)?;
    if let Some(expected) = expected_revision {
        if expected != revision {
            return Err(EngineError::ConcurrencyConflict {
                expected,
                actual: revision,
            });
        }
    }

    let ctx = AdjustmentContext::load(&tx, department_id, period_id, policy)?;
    let counts = ctx.validate(proposals)?;
    let ancestors = check_ancestor_quotas(&tx, department_id, period_id, proposals, policy)?;

    let changed: Vec<(&ProposedAdjustment, Option<Grade>)> = proposals
        .iter()
        .map(|p| (p, ctx.current_grade(&p.user_id)))
        .filter(|(p, previous)| p.grade != *previous)
        .collect();
    if changed.is_empty() {
        tx.commit()?;
        debug!(department_id, period_id, revision, "grade adjustment was a no-op");
        return Ok(AdjustOutcome {
            department_id: department_id.to_string(),
            period_id: period_id.to_string(),
            revision,
            updated: Vec::new(),
            counts,
        });
    }

    let next = revision + 1;
    let adjusted_at = chrono::Utc::now().to_rfc3339();
    let mut updated = Vec::with_capacity(changed.len());
    for (p, previous) in changed {
        match p.grade {
            Some(grade) => {
                tx.execute(
                    "INSERT INTO grade_adjustments(user_id, period_id, grade, department_id)
                     VALUES(?, ?, ?, ?)
                     ON CONFLICT(user_id, period_id) DO UPDATE SET
                       grade = excluded.grade,
                       department_id = excluded.department_id",
                    (&p.user_id, period_id, grade.as_str(), department_id),
                )?;
            }
            None => {
                tx.execute(
                    "DELETE FROM grade_adjustments WHERE user_id = ? AND period_id = ?",
                    (&p.user_id, period_id),
                )?;
            }
        }
        tx.execute(
            "INSERT INTO grade_adjustment_history(
                id, department_id, period_id, user_id, previous_grade, grade, revision, adjusted_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                uuid::Uuid::new_v4().to_string(),
                department_id,
                period_id,
                &p.user_id,
                previous.map(Grade::as_str),
                p.grade.map(Grade::as_str),
                next,
                &adjusted_at,
            ),
        )?;
        updated.push(p.user_id.clone());
    }
    tx.execute(
        "INSERT INTO grade_adjustment_revisions(department_id, period_id, revision) VALUES(?, ?, ?)
         ON CONFLICT(department_id, period_id) DO UPDATE SET revision = excluded.revision",
        (department_id, period_id, next),
    )?;
    // Enclosing rosters changed too; stale readers of those must conflict.
    for ancestor in &ancestors {
        tx.execute(
            "INSERT INTO grade_adjustment_revisions(department_id, period_id, revision) VALUES(?, ?, 1)
             ON CONFLICT(department_id, period_id) DO UPDATE SET revision = revision + 1",
            (ancestor, period_id),
        )?;
    }
    tx.commit()?;

    info!(
        department_id,
        period_id,
        revision = next,
        updated = updated.len(),
        "grade adjustments committed"
    );
    Ok(AdjustOutcome {
        department_id: department_id.to_string(),
        period_id: period_id.to_string(),
        revision: next,
        updated,
        counts,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub user_id: String,
    pub previous_grade: Option<String>,
    pub grade: Option<String>,
    pub revision: i64,
    pub adjusted_at: String,
}

pub fn history(
    conn: &Connection,
    department_id: &str,
    period_id: &str,
) -> Result<Vec<HistoryEntry>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, previous_grade, grade, revision, adjusted_at
         FROM grade_adjustment_history
         WHERE department_id = ? AND period_id = ?
         ORDER BY revision, user_id",
    )?;
    let rows = stmt
        .query_map((department_id, period_id), |r| {
            Ok(HistoryEntry {
                id: r.get(0)?,
                user_id: r.get(1)?,
                previous_grade: r.get(2)?,
                grade: r.get(3)?,
                revision: r.get(4)?,
                adjusted_at: r.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
