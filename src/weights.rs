//! Role x evaluation-item weight table.

use crate::error::EngineError;
use crate::model::{EvaluationItem, Role};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;

const SUM_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleWeights {
    pub peer: f64,
    pub pm: f64,
    pub qualitative: f64,
}

impl RoleWeights {
    pub fn get(&self, item: EvaluationItem) -> f64 {
        match item {
            EvaluationItem::Peer => self.peer,
            EvaluationItem::Pm => self.pm,
            EvaluationItem::Qualitative => self.qualitative,
        }
    }

    /// Writer-side invariant: each weight in 0..=100, summing to 100.
    pub fn validate(&self) -> Result<(), EngineError> {
        for item in EvaluationItem::ALL {
            let w = self.get(item);
            if !w.is_finite() || !(0.0..=100.0).contains(&w) {
                return Err(EngineError::rejected_with(
                    format!("{} weight must be in 0..=100", item.as_str()),
                    json!({ "item": item.as_str(), "weight": w }),
                ));
            }
        }
        let sum = self.peer + self.pm + self.qualitative;
        if (sum - 100.0).abs() > SUM_TOLERANCE {
            return Err(EngineError::rejected_with(
                format!("role weights must sum to 100, got {}", sum),
                json!({ "sum": sum }),
            ));
        }
        Ok(())
    }
}

/// Explicit enumerated-key table. A missing (role, item) entry is a
/// configuration error at lookup time; it never reads as zero.
#[derive(Debug, Clone, Default)]
pub struct WeightTable {
    entries: BTreeMap<(Role, EvaluationItem), f64>,
}

impl WeightTable {
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (Role, EvaluationItem, f64)>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(role, item, weight)| ((role, item), weight))
                .collect(),
        }
    }

    /// Reads the table fresh. Rows with unknown role/item labels are ignored
    /// rather than guessed at.
    pub fn load(conn: &Connection) -> Result<Self, EngineError> {
        let mut stmt = conn.prepare("SELECT role, item, weight FROM evaluation_weights")?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, f64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_entries(rows.into_iter().filter_map(
            |(role, item, weight)| Some((Role::parse(&role)?, EvaluationItem::parse(&item)?, weight)),
        )))
    }

    pub fn weight_for(&self, role: Role, item: EvaluationItem) -> Result<f64, EngineError> {
        self.entries
            .get(&(role, item))
            .copied()
            .ok_or_else(|| EngineError::ConfigurationMissing {
                what: format!("{} weight for role {}", item.as_str(), role.as_str()),
                details: Some(json!({ "role": role.as_str(), "item": item.as_str() })),
            })
    }

    pub fn role_weights(&self, role: Role) -> Result<RoleWeights, EngineError> {
        Ok(RoleWeights {
            peer: self.weight_for(role, EvaluationItem::Peer)?,
            pm: self.weight_for(role, EvaluationItem::Pm)?,
            qualitative: self.weight_for(role, EvaluationItem::Qualitative)?,
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = (Role, EvaluationItem, f64)> + '_ {
        self.entries
            .iter()
            .map(|((role, item), weight)| (*role, *item, *weight))
    }
}

/// Replaces all three weights of `role` after validating the sum.
pub fn store_role_weights(
    conn: &Connection,
    role: Role,
    weights: &RoleWeights,
) -> Result<(), EngineError> {
    weights.validate()?;
    let tx = conn.unchecked_transaction()?;
    for item in EvaluationItem::ALL {
        tx.execute(
            "INSERT INTO evaluation_weights(role, item, weight) VALUES(?, ?, ?)
             ON CONFLICT(role, item) DO UPDATE SET weight = excluded.weight",
            (role.as_str(), item.as_str(), weights.get(item)),
        )?;
    }
    tx.commit()?;
    Ok(())
}
