use crate::config::{self, SettingsSection};
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{dispatch, get_enum, HandlerFn};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{Map, Value};

fn settings_get(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let mut out = Map::new();
    for section in SettingsSection::ALL {
        out.insert(
            section.name().to_string(),
            config::load_section(conn, section)?,
        );
    }
    Ok(Value::Object(out))
}

fn settings_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let section = get_enum(params, "section", SettingsSection::parse, "submissions, quota")?;
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))?;
    match config::update_section(conn, section, patch)? {
        Ok(updated) => {
            let mut out = Map::new();
            out.insert(section.name().to_string(), updated);
            Ok(Value::Object(out))
        }
        Err(msg) => Err(HandlerErr::bad_params(msg)),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: HandlerFn = match req.method.as_str() {
        "settings.get" => settings_get,
        "settings.update" => settings_update,
        _ => return None,
    };
    Some(dispatch(state, req, handler))
}
