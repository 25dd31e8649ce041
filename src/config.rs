use crate::db;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingsSection {
    Submissions,
    Quota,
}

impl SettingsSection {
    pub const ALL: [SettingsSection; 2] = [SettingsSection::Submissions, SettingsSection::Quota];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submissions" => Some(Self::Submissions),
            "quota" => Some(Self::Quota),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Submissions => "submissions",
            Self::Quota => "quota",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Submissions => "engine.submissions",
            Self::Quota => "engine.quota",
        }
    }
}

fn default_section(section: SettingsSection) -> Value {
    match section {
        SettingsSection::Submissions => json!({
            "peerBatchAverageCap": 70,
            "requireEvaluateeParticipation": true
        }),
        SettingsSection::Quota => json!({
            "includeManagerInRoster": true,
            "carryForwardPriorGrades": false
        }),
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_nullable_percent(v: &Value, key: &str) -> Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number or null", key))?;
    if !(0.0..=100.0).contains(&n) {
        return Err(format!("{} must be in 0..=100", key));
    }
    Ok(json!(n))
}

fn merge_section_patch(
    section: SettingsSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal settings object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SettingsSection::Submissions => match k.as_str() {
                "peerBatchAverageCap" => {
                    obj.insert(k.clone(), parse_nullable_percent(v, k)?);
                }
                "requireEvaluateeParticipation" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown submissions field: {}", k)),
            },
            SettingsSection::Quota => match k.as_str() {
                "includeManagerInRoster" | "carryForwardPriorGrades" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown quota field: {}", k)),
            },
        }
    }
    Ok(())
}

pub fn load_section(conn: &Connection, section: SettingsSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Fields written by an older build that no longer validate fall back to defaults.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

/// Validates `patch` against the section schema and persists the merged result.
/// Returns `Ok(Err(msg))` when the patch itself is invalid.
pub fn update_section(
    conn: &Connection,
    section: SettingsSection,
    patch: &Map<String, Value>,
) -> anyhow::Result<Result<Value, String>> {
    let mut current = load_section(conn, section)?;
    if let Err(msg) = merge_section_patch(section, &mut current, patch) {
        return Ok(Err(msg));
    }
    db::settings_set_json(conn, section.key(), &current)?;
    Ok(Ok(current))
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionSettings {
    pub peer_batch_average_cap: Option<f64>,
    pub require_evaluatee_participation: bool,
}

/// Roster policy for quota purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSettings {
    pub include_manager_in_roster: bool,
    pub carry_forward_prior_grades: bool,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            include_manager_in_roster: true,
            carry_forward_prior_grades: false,
        }
    }
}

pub fn submission_settings(conn: &Connection) -> anyhow::Result<SubmissionSettings> {
    let obj = load_section(conn, SettingsSection::Submissions)?;
    Ok(SubmissionSettings {
        peer_batch_average_cap: obj.get("peerBatchAverageCap").and_then(|v| v.as_f64()),
        require_evaluatee_participation: obj
            .get("requireEvaluateeParticipation")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
    })
}

pub fn quota_settings(conn: &Connection) -> anyhow::Result<QuotaSettings> {
    let obj = load_section(conn, SettingsSection::Quota)?;
    let defaults = QuotaSettings::default();
    Ok(QuotaSettings {
        include_manager_in_roster: obj
            .get("includeManagerInRoster")
            .and_then(|v| v.as_bool())
            .unwrap_or(defaults.include_manager_in_roster),
        carry_forward_prior_grades: obj
            .get("carryForwardPriorGrades")
            .and_then(|v| v.as_bool())
            .unwrap_or(defaults.carry_forward_prior_grades),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_and_patches_validate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = db::open_db(dir.path()).expect("open");

        let s = submission_settings(&conn).expect("load");
        assert_eq!(s.peer_batch_average_cap, Some(70.0));
        assert!(s.require_evaluatee_participation);
        assert_eq!(quota_settings(&conn).expect("load"), QuotaSettings::default());

        let bad = json!({ "peerBatchAverageCap": 140 });
        let res = update_section(
            &conn,
            SettingsSection::Submissions,
            bad.as_object().expect("obj"),
        )
        .expect("db");
        assert!(res.is_err());

        let unknown = json!({ "roundQuotas": true });
        let res = update_section(&conn, SettingsSection::Quota, unknown.as_object().expect("obj"))
            .expect("db");
        assert_eq!(res, Err("unknown quota field: roundQuotas".to_string()));

        let patch = json!({ "peerBatchAverageCap": null });
        update_section(&conn, SettingsSection::Submissions, patch.as_object().expect("obj"))
            .expect("db")
            .expect("valid patch");
        let patch = json!({ "includeManagerInRoster": false });
        update_section(&conn, SettingsSection::Quota, patch.as_object().expect("obj"))
            .expect("db")
            .expect("valid patch");

        assert_eq!(
            submission_settings(&conn).expect("load").peer_batch_average_cap,
            None
        );
        assert!(!quota_settings(&conn).expect("load").include_manager_in_roster);
    }
}
