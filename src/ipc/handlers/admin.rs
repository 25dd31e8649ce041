use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{dispatch, get_enum, get_required_f64, get_required_str, to_json, HandlerFn};
use crate::ipc::types::{AppState, Request};
use crate::model::{DepartmentGrade, Role};
use crate::org;
use crate::quota::{self, GradeRatio};
use crate::weights::{self, RoleWeights, WeightTable};
use rusqlite::Connection;
use serde_json::{json, Value};

const ROLE_LABELS: &str = "employee, team_lead, dept_head, center_head, admin";
const DEPARTMENT_GRADE_LABELS: &str = "S, A, B";

fn weights_set(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let role = get_enum(params, "role", Role::parse, ROLE_LABELS)?;
    let w = RoleWeights {
        peer: get_required_f64(params, "peer")?,
        pm: get_required_f64(params, "pm")?,
        qualitative: get_required_f64(params, "qualitative")?,
    };
    weights::store_role_weights(conn, role, &w)?;
    Ok(json!({ "role": role.as_str(), "weights": to_json(&w)? }))
}

fn weights_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let table = WeightTable::load(conn)?;
    let entries: Vec<Value> = table
        .entries()
        .map(|(role, item, weight)| {
            json!({ "role": role.as_str(), "item": item.as_str(), "weight": weight })
        })
        .collect();
    Ok(json!({ "weights": entries }))
}

fn grade_ratios_set(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let grade = get_enum(
        params,
        "departmentGrade",
        DepartmentGrade::parse,
        DEPARTMENT_GRADE_LABELS,
    )?;
    let ratio = GradeRatio {
        s_ratio: get_required_f64(params, "sRatio")?,
        a_ratio: get_required_f64(params, "aRatio")?,
        b_ratio: get_required_f64(params, "bRatio")?,
    };
    quota::store_ratio(conn, grade, &ratio)?;
    Ok(json!({ "departmentGrade": grade.as_str(), "ratio": to_json(&ratio)? }))
}

fn grade_ratios_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let mut rows = Vec::new();
    for (grade, ratio) in quota::list_ratios(conn)? {
        let mut row = to_json(&ratio)?;
        row["departmentGrade"] = json!(grade.as_str());
        rows.push(row);
    }
    Ok(json!({ "ratios": rows }))
}

fn department_grades_set(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let department_id = get_required_str(params, "departmentId")?;
    let period_id = get_required_str(params, "periodId")?;
    let grade = get_enum(params, "grade", DepartmentGrade::parse, DEPARTMENT_GRADE_LABELS)?;
    org::set_department_grade(conn, &department_id, &period_id, grade)?;
    Ok(json!({
        "departmentId": department_id,
        "periodId": period_id,
        "grade": grade.as_str()
    }))
}

fn department_grades_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let department_id = get_required_str(params, "departmentId")?;
    let period_id = get_required_str(params, "periodId")?;
    let grade = org::department_grade(conn, &department_id, &period_id)?;
    Ok(json!({
        "departmentId": department_id,
        "periodId": period_id,
        "grade": grade.map(|g| g.as_str())
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: HandlerFn = match req.method.as_str() {
        "weights.set" => weights_set,
        "weights.list" => weights_list,
        "gradeRatios.set" => grade_ratios_set,
        "gradeRatios.list" => grade_ratios_list,
        "departmentGrades.set" => department_grades_set,
        "departmentGrades.get" => department_grades_get,
        _ => return None,
    };
    Some(dispatch(state, req, handler))
}
