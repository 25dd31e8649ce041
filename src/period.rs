use crate::error::EngineError;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationPeriod {
    pub id: String,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub is_active: bool,
}

pub fn parse_date(raw: &str, field: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).map_err(|_| {
        EngineError::rejected_with(
            format!("{} must be a YYYY-MM-DD date", field),
            json!({ "field": field, "value": raw }),
        )
    })
}

fn check_window(start: NaiveDate, end: NaiveDate) -> Result<(), EngineError> {
    if start > end {
        return Err(EngineError::rejected_with(
            "startDate must not be after endDate",
            json!({ "startDate": start.to_string(), "endDate": end.to_string() }),
        ));
    }
    Ok(())
}

fn read_period(r: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, String, i64)> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
}

fn into_period(
    (id, name, start, end, active): (String, String, String, String, i64),
) -> Result<EvaluationPeriod, EngineError> {
    let bad = |raw: &str| EngineError::invariant(format!("period {} has invalid date '{}'", id, raw));
    let start_date = NaiveDate::parse_from_str(&start, DATE_FORMAT).map_err(|_| bad(&start))?;
    let end_date = NaiveDate::parse_from_str(&end, DATE_FORMAT).map_err(|_| bad(&end))?;
    Ok(EvaluationPeriod {
        id,
        name,
        start_date,
        end_date,
        is_active: active != 0,
    })
}

pub fn get_period(conn: &Connection, period_id: &str) -> Result<Option<EvaluationPeriod>, EngineError> {
    let row = conn
        .query_row(
            "SELECT id, name, start_date, end_date, is_active FROM evaluation_periods WHERE id = ?",
            [period_id],
            read_period,
        )
        .optional()?;
    row.map(into_period).transpose()
}

pub fn require_period(conn: &Connection, period_id: &str) -> Result<EvaluationPeriod, EngineError> {
    get_period(conn, period_id)?.ok_or_else(|| EngineError::not_found("evaluation period", period_id))
}

/// Newest first.
pub fn list_periods(conn: &Connection) -> Result<Vec<EvaluationPeriod>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT id, name, start_date, end_date, is_active FROM evaluation_periods
         ORDER BY start_date DESC, id",
    )?;
    let rows = stmt
        .query_map([], read_period)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(into_period).collect()
}

fn ensure_name_free(conn: &Connection, name: &str, except: Option<&str>) -> Result<(), EngineError> {
    let owner: Option<String> = conn
        .query_row(
            "SELECT id FROM evaluation_periods WHERE name = ?",
            [name],
            |r| r.get(0),
        )
        .optional()?;
    match owner {
        Some(id) if Some(id.as_str()) != except => Err(EngineError::rejected_with(
            format!("an evaluation period named '{}' already exists", name),
            json!({ "periodId": id }),
        )),
        _ => Ok(()),
    }
}

pub fn create_period(
    conn: &Connection,
    name: &str,
    start_date: NaiveDate,
    end_date: NaiveDate,
) -> Result<EvaluationPeriod, EngineError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::rejected("period name must not be empty"));
    }
    check_window(start_date, end_date)?;
    ensure_name_free(conn, name, None)?;
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO evaluation_periods(id, name, start_date, end_date, is_active)
         VALUES(?, ?, ?, ?, 0)",
        (
            &id,
            name,
            start_date.format(DATE_FORMAT).to_string(),
            end_date.format(DATE_FORMAT).to_string(),
        ),
    )?;
    require_period(conn, &id)
}

#[derive(Debug, Default)]
pub struct PeriodPatch {
    pub name: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

pub fn update_period(
    conn: &Connection,
    period_id: &str,
    patch: PeriodPatch,
) -> Result<EvaluationPeriod, EngineError> {
    let current = require_period(conn, period_id)?;
    let name = match patch.name {
        Some(n) => {
            let n = n.trim().to_string();
            if n.is_empty() {
                return Err(EngineError::rejected("period name must not be empty"));
            }
            ensure_name_free(conn, &n, Some(period_id))?;
            n
        }
        None => current.name,
    };
    let start = patch.start_date.unwrap_or(current.start_date);
    let end = patch.end_date.unwrap_or(current.end_date);
    check_window(start, end)?;
    conn.execute(
        "UPDATE evaluation_periods SET name = ?, start_date = ?, end_date = ? WHERE id = ?",
        (
            &name,
            start.format(DATE_FORMAT).to_string(),
            end.format(DATE_FORMAT).to_string(),
            period_id,
        ),
    )?;
    require_period(conn, period_id)
}

/// At most one period is active; activating one closes every other.
pub fn set_active(conn: &Connection, period_id: &str, active: bool) -> Result<EvaluationPeriod, EngineError> {
    require_period(conn, period_id)?;
    let tx = conn.unchecked_transaction()?;
    if active {
        tx.execute(
            "UPDATE evaluation_periods SET is_active = 0 WHERE id <> ?",
            [period_id],
        )?;
    }
    tx.execute(
        "UPDATE evaluation_periods SET is_active = ? WHERE id = ?",
        (active as i64, period_id),
    )?;
    tx.commit()?;
    require_period(conn, period_id)
}

/// Submissions are only accepted for the active period.
pub fn require_open(conn: &Connection, period_id: &str) -> Result<EvaluationPeriod, EngineError> {
    let period = require_period(conn, period_id)?;
    if !period.is_active {
        return Err(EngineError::rejected_with(
            format!("evaluation period {} is not open for submissions", period.name),
            json!({ "reason": "period_not_open", "periodId": period_id }),
        ));
    }
    Ok(period)
}

/// The latest period that ended before `period` started.
pub fn prior_period(
    conn: &Connection,
    period: &EvaluationPeriod,
) -> Result<Option<EvaluationPeriod>, EngineError> {
    let row = conn
        .query_row(
            "SELECT id, name, start_date, end_date, is_active FROM evaluation_periods
             WHERE end_date < ? AND id <> ?
             ORDER BY end_date DESC, id DESC
             LIMIT 1",
            (period.start_date.format(DATE_FORMAT).to_string(), &period.id),
            read_period,
        )
        .optional()?;
    row.map(into_period).transpose()
}
