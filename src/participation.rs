//! Per (user, period) project participation shares.

use crate::error::EngineError;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};

pub const FULL_PARTICIPATION: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectShare {
    pub project_id: String,
    pub weight: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum LedgerStatus {
    /// No participation rows; the user is not scored for the period.
    Unassigned,
    /// Rows exist but do not reach 100 yet.
    Incomplete { total: i64 },
    Complete,
}

/// Snapshot of every user's shares for one period, ordered by project id.
#[derive(Debug, Clone, Default)]
pub struct ParticipationLedger {
    by_user: BTreeMap<String, Vec<ProjectShare>>,
}

impl ParticipationLedger {
    pub fn from_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (String, ProjectShare)>,
    {
        let mut by_user: BTreeMap<String, Vec<ProjectShare>> = BTreeMap::new();
        for (user_id, share) in rows {
            by_user.entry(user_id).or_default().push(share);
        }
        for shares in by_user.values_mut() {
            shares.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        }
        Self { by_user }
    }

    pub fn load(conn: &Connection, period_id: &str) -> Result<Self, EngineError> {
        let mut stmt = conn.prepare(
            "SELECT user_id, project_id, weight
             FROM participation_weights
             WHERE period_id = ?
             ORDER BY user_id, project_id",
        )?;
        let rows = stmt
            .query_map([period_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    ProjectShare {
                        project_id: r.get(1)?,
                        weight: r.get(2)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_rows(rows))
    }

    pub fn weights_for(&self, user_id: &str) -> &[ProjectShare] {
        self.by_user
            .get(user_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn total_for(&self, user_id: &str) -> i64 {
        self.weights_for(user_id).iter().map(|s| s.weight).sum()
    }

    pub fn status(&self, user_id: &str) -> LedgerStatus {
        let shares = self.weights_for(user_id);
        if shares.is_empty() {
            return LedgerStatus::Unassigned;
        }
        let total: i64 = shares.iter().map(|s| s.weight).sum();
        if total == FULL_PARTICIPATION {
            LedgerStatus::Complete
        } else {
            LedgerStatus::Incomplete { total }
        }
    }

    pub fn participates_in(&self, user_id: &str, project_id: &str) -> bool {
        self.weights_for(user_id)
            .iter()
            .any(|s| s.project_id == project_id && s.weight > 0)
    }
}

fn validate_share_weight(share: &ProjectShare) -> Result<(), EngineError> {
    if !(1..=FULL_PARTICIPATION).contains(&share.weight) {
        return Err(EngineError::rejected_with(
            "participation weight must be in 1..=100",
            json!({ "projectId": share.project_id, "weight": share.weight }),
        ));
    }
    Ok(())
}

/// A wholesale replacement must be complete: no duplicates and exactly 100.
pub fn validate_replacement(shares: &[ProjectShare]) -> Result<(), EngineError> {
    let mut seen = HashSet::new();
    for share in shares {
        validate_share_weight(share)?;
        if !seen.insert(share.project_id.as_str()) {
            return Err(EngineError::rejected_with(
                "duplicate project in participation weights",
                json!({ "projectId": share.project_id }),
            ));
        }
    }
    let total: i64 = shares.iter().map(|s| s.weight).sum();
    if total != FULL_PARTICIPATION {
        return Err(EngineError::rejected_with(
            format!("participation weights must sum to 100, got {}", total),
            json!({ "total": total }),
        ));
    }
    Ok(())
}

pub fn replace_weights(
    conn: &Connection,
    user_id: &str,
    period_id: &str,
    shares: &[ProjectShare],
) -> Result<(), EngineError> {
    validate_replacement(shares)?;
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM participation_weights WHERE user_id = ? AND period_id = ?",
        (user_id, period_id),
    )?;
    for share in shares {
        tx.execute(
            "INSERT INTO participation_weights(user_id, project_id, period_id, weight)
             VALUES(?, ?, ?, ?)",
            (user_id, &share.project_id, period_id, share.weight),
        )?;
    }
    tx.commit()?;
    Ok(())
}

/// Sets one project's share. Partial totals are allowed; overshooting 100 is not.
pub fn upsert_weight(
    conn: &Connection,
    user_id: &str,
    period_id: &str,
    share: &ProjectShare,
) -> Result<i64, EngineError> {
    validate_share_weight(share)?;
    let tx = conn.unchecked_transaction()?;
    let others: Option<i64> = tx
        .query_row(
            "SELECT SUM(weight) FROM participation_weights
             WHERE user_id = ? AND period_id = ? AND project_id <> ?",
            (user_id, period_id, &share.project_id),
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    let total = others.unwrap_or(0) + share.weight;
    if total > FULL_PARTICIPATION {
        return Err(EngineError::rejected_with(
            format!("participation weights would total {}, above 100", total),
            json!({ "total": total }),
        ));
    }
    tx.execute(
        "INSERT INTO participation_weights(user_id, project_id, period_id, weight)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(user_id, project_id, period_id) DO UPDATE SET weight = excluded.weight",
        (user_id, &share.project_id, period_id, share.weight),
    )?;
    tx.commit()?;
    Ok(total)
}
