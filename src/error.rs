use serde_json::json;
use thiserror::Error;

/// Failure classes of the evaluation engine.
///
/// IncompleteInputs is deliberately absent: a user whose inputs are not all in
/// yet is reported as pending in the calculation summary, not as an error.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Admin-owned configuration (weights, ratio rows) is absent. Never retried.
    #[error("configuration missing: {what}")]
    ConfigurationMissing {
        what: String,
        details: Option<serde_json::Value>,
    },

    /// No department grade recorded for the period, so S/A cannot be awarded.
    #[error("no department grade set for department {department_id} in period {period_id}")]
    NoQuotaDefined {
        department_id: String,
        period_id: String,
    },

    /// Caller error caught at the door.
    #[error("{message}")]
    RejectedInput {
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("{0}")]
    RejectedAdjustment(AdjustmentViolation),

    /// Optimistic-lock failure on a (department, period) grade commit.
    #[error("grade revision changed: expected {expected}, found {actual}")]
    ConcurrencyConflict { expected: i64, actual: i64 },

    #[error("period {period_id} is not ready for grade adjustment ({} members pending)", pending.len())]
    PeriodNotReady {
        period_id: String,
        pending: Vec<String>,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A stored raw score violates its declared range.
    #[error("invariant violated: {message}")]
    Invariant { message: String },

    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

/// One failed grade-adjustment rule with its numeric delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjustmentViolation {
    pub rule: AdjustmentRule,
    pub expected: i64,
    pub actual: i64,
    pub user_id: Option<String>,
    /// Set when the rule failed on an enclosing department's roster.
    pub department_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustmentRule {
    SQuota,
    AQuota,
    BBalance,
    NotInRoster,
    MissingFinalScore,
}

impl AdjustmentRule {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SQuota => "s_quota",
            Self::AQuota => "a_quota",
            Self::BBalance => "b_balance",
            Self::NotInRoster => "not_in_roster",
            Self::MissingFinalScore => "missing_final_score",
        }
    }
}

impl std::fmt::Display for AdjustmentViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.rule {
            AdjustmentRule::SQuota => {
                write!(f, "S count {} exceeds quota {}", self.actual, self.expected)?
            }
            AdjustmentRule::AQuota => {
                write!(f, "A count {} exceeds quota {}", self.actual, self.expected)?
            }
            AdjustmentRule::BBalance => write!(
                f,
                "B+ count {} does not equal B- count {}",
                self.actual, self.expected
            )?,
            AdjustmentRule::NotInRoster => write!(
                f,
                "user {} is not on the department roster",
                self.user_id.as_deref().unwrap_or("?")
            )?,
            AdjustmentRule::MissingFinalScore => write!(
                f,
                "user {} has no computed final score",
                self.user_id.as_deref().unwrap_or("?")
            )?,
        }
        if let Some(department_id) = &self.department_id {
            write!(f, " in department {}", department_id)?;
        }
        Ok(())
    }
}

impl EngineError {
    pub fn configuration_missing(what: impl Into<String>) -> Self {
        Self::ConfigurationMissing {
            what: what.into(),
            details: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::RejectedInput {
            message: message.into(),
            details: None,
        }
    }

    pub fn rejected_with(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self::RejectedInput {
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }

    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigurationMissing { .. } => "configuration_missing",
            Self::NoQuotaDefined { .. } => "no_quota_defined",
            Self::RejectedInput { .. } => "rejected_input",
            Self::RejectedAdjustment(_) => "rejected_adjustment",
            Self::ConcurrencyConflict { .. } => "concurrency_conflict",
            Self::PeriodNotReady { .. } => "period_not_ready",
            Self::NotFound { .. } => "not_found",
            Self::Invariant { .. } => "invariant_violation",
            Self::Db(_) => "db_query_failed",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::ConfigurationMissing { details, .. } => details.clone(),
            Self::NoQuotaDefined {
                department_id,
                period_id,
            } => Some(json!({
                "departmentId": department_id,
                "periodId": period_id,
            })),
            Self::RejectedInput { details, .. } => details.clone(),
            Self::RejectedAdjustment(v) => {
                let mut details = json!({
                    "rule": v.rule.as_str(),
                    "expected": v.expected,
                    "actual": v.actual,
                    "userId": v.user_id,
                });
                if let Some(department_id) = &v.department_id {
                    details["departmentId"] = json!(department_id);
                }
                Some(details)
            }
            Self::ConcurrencyConflict { expected, actual } => Some(json!({
                "expected": expected,
                "actual": actual,
            })),
            Self::PeriodNotReady { pending, .. } => Some(json!({ "pending": pending })),
            Self::NotFound { entity, id } => Some(json!({ "entity": entity, "id": id })),
            Self::Invariant { .. } | Self::Db(_) => None,
        }
    }

    /// Fatal errors abort a whole batch and are surfaced to the admin.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConfigurationMissing { .. } | Self::Invariant { .. } | Self::Db(_)
        )
    }
}
