mod accounts;
mod agent;
mod audit;
mod calendar;
mod clock;
mod config;
mod db;
mod google;
mod ipc;
mod lab;
mod logging;
mod schedule;
mod storage;
mod validate;

use std::io::{self, BufRead, Write};

fn main() -> anyhow::Result<()> {
    let cfg = config::Config::from_env()?;
    // Dropping the handle stops the file writer.
    let _logger = logging::init(&cfg)?;
    let mut state = ipc::AppState::new(cfg.clock.clone());

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                log::error!("event=stdin_closed err={e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to answer to.
                log::warn!("event=bad_json err={e}");
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() },
                });
                let _ = writeln!(stdout, "{resp}");
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
    log::info!("event=shutdown");
    Ok(())
}
