use crate::error::EngineError;
use serde_json::json;
use tracing::{error, warn};

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Error raised inside a handler, carrying the wire code it maps to.
#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
    fatal: bool,
}

impl HandlerErr {
    pub fn bad_params(message: impl Into<String>) -> Self {
        Self {
            code: "bad_params",
            message: message.into(),
            details: None,
            fatal: false,
        }
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self {
            code: "server_error",
            message: message.into(),
            details: None,
            fatal: true,
        }
    }

    pub fn response(self, id: &str, method: &str) -> serde_json::Value {
        if self.fatal {
            error!(method, code = self.code, message = %self.message, "request failed");
        } else {
            warn!(method, code = self.code, message = %self.message, "request rejected");
        }
        err(id, self.code, self.message, self.details)
    }
}

impl From<EngineError> for HandlerErr {
    fn from(e: EngineError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
            details: e.details(),
            fatal: e.is_fatal(),
        }
    }
}

impl From<anyhow::Error> for HandlerErr {
    fn from(e: anyhow::Error) -> Self {
        Self {
            code: "db_query_failed",
            message: format!("{e:#}"),
            details: None,
            fatal: true,
        }
    }
}
