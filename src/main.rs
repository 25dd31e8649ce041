mod adjust;
mod aggregate;
mod calc;
mod config;
mod db;
mod error;
mod ipc;
mod model;
mod org;
mod participation;
mod period;
mod quota;
mod submissions;
mod weights;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

fn main() {
    // stdout carries the wire protocol; logs go to stderr only.
    let filter = EnvFilter::try_from_env("EVALD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_writer(io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut state = ipc::AppState::default();
    if let Some(path) = std::env::var_os("EVALD_WORKSPACE") {
        if let Err(e) = ipc::open_workspace(&mut state, PathBuf::from(path)) {
            error!(error = %format!("{e:#}"), "failed to open EVALD_WORKSPACE");
        }
    }
    info!(version = env!("CARGO_PKG_VERSION"), "evald ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id; answer with an id-less error.
                warn!(error = %e, "unparseable request line");
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
