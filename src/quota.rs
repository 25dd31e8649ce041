//! Department grade quotas: department grade + ratio row + roster size.

use crate::config::QuotaSettings;
use crate::error::EngineError;
use crate::model::DepartmentGrade;
use crate::org;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Absorbs representation error so e.g. 10 * 30 / 100 floors to 3, not 2.
const FLOOR_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRatio {
    pub s_ratio: f64,
    pub a_ratio: f64,
    pub b_ratio: f64,
}

impl GradeRatio {
    pub fn validate(&self) -> Result<(), EngineError> {
        for (field, v) in [
            ("sRatio", self.s_ratio),
            ("aRatio", self.a_ratio),
            ("bRatio", self.b_ratio),
        ] {
            if !v.is_finite() || !(0.0..=100.0).contains(&v) {
                return Err(EngineError::rejected_with(
                    format!("{} must be in 0..=100", field),
                    json!({ "field": field, "value": v }),
                ));
            }
        }
        let sum = self.s_ratio + self.a_ratio + self.b_ratio;
        if sum > 100.0 + FLOOR_EPSILON {
            return Err(EngineError::rejected_with(
                format!("grade ratios sum to {}, above 100", sum),
                json!({ "sum": sum }),
            ));
        }
        Ok(())
    }
}

pub fn store_ratio(
    conn: &Connection,
    grade: DepartmentGrade,
    ratio: &GradeRatio,
) -> Result<(), EngineError> {
    ratio.validate()?;
    conn.execute(
        "INSERT INTO department_grade_ratios(department_grade, s_ratio, a_ratio, b_ratio)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(department_grade) DO UPDATE SET
           s_ratio = excluded.s_ratio,
           a_ratio = excluded.a_ratio,
           b_ratio = excluded.b_ratio",
        (grade.as_str(), ratio.s_ratio, ratio.a_ratio, ratio.b_ratio),
    )?;
    Ok(())
}

pub fn ratio_for(conn: &Connection, grade: DepartmentGrade) -> Result<Option<GradeRatio>, EngineError> {
    Ok(conn
        .query_row(
            "SELECT s_ratio, a_ratio, b_ratio FROM department_grade_ratios WHERE department_grade = ?",
            [grade.as_str()],
            |r| {
                Ok(GradeRatio {
                    s_ratio: r.get(0)?,
                    a_ratio: r.get(1)?,
                    b_ratio: r.get(2)?,
                })
            },
        )
        .optional()?)
}

pub fn list_ratios(conn: &Connection) -> Result<Vec<(DepartmentGrade, GradeRatio)>, EngineError> {
    let mut out = Vec::new();
    for grade in DepartmentGrade::ALL {
        if let Some(r) = ratio_for(conn, grade)? {
            out.push((grade, r));
        }
    }
    Ok(out)
}

/// floor(roster_size * ratio / 100). Floor keeps small rosters conservative.
pub fn quota_for(roster_size: usize, ratio: f64) -> i64 {
    let raw = roster_size as f64 * ratio / 100.0;
    (raw + FLOOR_EPSILON).floor().max(0.0) as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quotas {
    #[serde(rename = "S")]
    pub s: i64,
    #[serde(rename = "A")]
    pub a: i64,
}

impl Quotas {
    pub fn compute(roster_size: usize, ratio: &GradeRatio) -> Self {
        Self {
            s: quota_for(roster_size, ratio.s_ratio),
            a: quota_for(roster_size, ratio.a_ratio),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaReport {
    pub department_id: String,
    pub period_id: String,
    pub roster_size: usize,
    pub department_grade: DepartmentGrade,
    pub ratio: GradeRatio,
    pub quotas: Quotas,
}

/// Quotas read fresh from the current roster and department grade.
pub fn quotas_for(
    conn: &Connection,
    department_id: &str,
    period_id: &str,
    policy: &QuotaSettings,
) -> Result<QuotaReport, EngineError> {
    let roster = org::department_roster(conn, department_id, policy)?;
    quotas_for_roster(conn, department_id, period_id, roster.len())
}

pub fn quotas_for_roster(
    conn: &Connection,
    department_id: &str,
    period_id: &str,
    roster_size: usize,
) -> Result<QuotaReport, EngineError> {
    if !org::period_exists(conn, period_id)? {
        return Err(EngineError::not_found("evaluation period", period_id));
    }
    let grade = org::department_grade(conn, department_id, period_id)?.ok_or_else(|| {
        EngineError::NoQuotaDefined {
            department_id: department_id.to_string(),
            period_id: period_id.to_string(),
        }
    })?;
    let ratio = ratio_for(conn, grade)?.ok_or_else(|| EngineError::ConfigurationMissing {
        what: format!("grade ratio row for department grade {}", grade.as_str()),
        details: Some(json!({ "departmentGrade": grade.as_str() })),
    })?;
    Ok(QuotaReport {
        department_id: department_id.to_string(),
        period_id: period_id.to_string(),
        roster_size,
        department_grade: grade,
        quotas: Quotas::compute(roster_size, &ratio),
        ratio,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grade_a_department_of_ten_gets_one_s_and_three_a() {
        let ratio = GradeRatio {
            s_ratio: 10.0,
            a_ratio: 30.0,
            b_ratio: 60.0,
        };
        assert_eq!(Quotas::compute(10, &ratio), Quotas { s: 1, a: 3 });
    }

    #[test]
    fn floor_not_round() {
        assert_eq!(quota_for(9, 10.0), 0);
        assert_eq!(quota_for(7, 30.0), 2);
        assert_eq!(quota_for(0, 50.0), 0);
    }

    #[test]
    fn quota_never_shrinks_as_roster_grows() {
        for ratio in [0.0, 5.0, 10.0, 15.0, 30.0, 33.3, 100.0] {
            let mut prev = 0;
            for n in 0..200 {
                let q = quota_for(n, ratio);
                assert!(q >= prev, "ratio {} n {}: {} < {}", ratio, n, q, prev);
                prev = q;
            }
        }
    }

    #[test]
    fn ratios_over_100_are_rejected() {
        let r = GradeRatio {
            s_ratio: 30.0,
            a_ratio: 50.0,
            b_ratio: 30.0,
        };
        assert_eq!(r.validate().expect_err("sum 110").code(), "rejected_input");
    }

    #[test]
    fn missing_department_grade_or_ratio_row_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = crate::db::open_db(dir.path()).expect("open");
        org::upsert_department(
            &conn,
            &org::DepartmentRecord {
                id: "d1".into(),
                name: "D1".into(),
                parent_id: None,
                head_user_id: None,
            },
        )
        .expect("dept");
        let start = crate::period::parse_date("2025-01-01", "s").expect("date");
        let end = crate::period::parse_date("2025-06-30", "e").expect("date");
        let p = crate::period::create_period(&conn, "H1", start, end).expect("period");

        let err = quotas_for_roster(&conn, "d1", &p.id, 10).expect_err("no grade");
        assert_eq!(err.code(), "no_quota_defined");

        org::set_department_grade(&conn, "d1", &p.id, DepartmentGrade::A).expect("grade");
        let err = quotas_for_roster(&conn, "d1", &p.id, 10).expect_err("no ratio");
        assert_eq!(err.code(), "configuration_missing");

        store_ratio(
            &conn,
            DepartmentGrade::A,
            &GradeRatio {
                s_ratio: 10.0,
                a_ratio: 30.0,
                b_ratio: 60.0,
            },
        )
        .expect("ratio");
        let report = quotas_for_roster(&conn, "d1", &p.id, 10).expect("quotas");
        assert_eq!(report.quotas, Quotas { s: 1, a: 3 });
    }
}
