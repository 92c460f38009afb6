//! Echo Worker - reference worker speaking the bridge protocol.
//!
//! Reads one JSON request per line from stdin and answers on stdout with a
//! pretty-printed JSON object followed by `__END__`. Besides `echo` it
//! understands a handful of commands that misbehave on purpose, so the
//! bridge's failure handling can be exercised against a real process:
//!
//! | command             | behavior                                             |
//! |---------------------|------------------------------------------------------|
//! | `echo`              | `{"echo": true, "seq": n, "params": {...}}`          |
//! | `sleep`             | answers after `ms` milliseconds, off the main loop   |
//! | `ignore`            | never answers                                        |
//! | `fail`              | answers with an error payload                        |
//! | `crash`             | exits with code 3                                    |
//! | `exit`              | exits with code 0                                    |
//! | `garbage`           | writes an unparseable frame                          |
//! | `dribble`           | writes its answer one byte at a time                 |
//! | `oom`               | prints `MemoryError` on stderr, then answers         |
//! | `orphan`            | answers an unknown id first, then the real one       |
//! | `file`              | delivers its answer through a side file              |
//! | `pid`               | `{"pid": <process id>}`                              |
//! | `grow`              | allocates and keeps `mb` MiB, then answers           |
//! | `check_memory`      | `restart_needed` from `ECHO_WORKER_RESTART_NEEDED`;  |
//! |                     | never answers if `ECHO_WORKER_SILENT_CHECK=1`        |
//! | `check_environment` | `status` from `ECHO_WORKER_STATUS` (default `"ok"`)  |
//!
//! # Running with a Rust host
//!
//! ```ignore
//! use serde_json::json;
//! use worker_bridge::Bridge;
//!
//! let bridge = Bridge::builder("./target/debug/echo-worker").build();
//! let result = bridge.send_command("echo", json!({"message": "hello"})).await?;
//! assert_eq!(result["echo"], true);
//! bridge.stop().await?;
//! ```

use std::io::{self, BufRead, Write};
use std::thread;
use std::time::Duration;

use serde_json::{json, Map, Value};

const SENTINEL: &str = "__END__";

fn main() -> io::Result<()> {
    let stdin = io::stdin();
    let mut seq: u64 = 0;
    let mut ballast: Vec<Vec<u8>> = Vec::new();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let mut request: Map<String, Value> = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                eprintln!("echo-worker: bad request line: {}", e);
                continue;
            }
        };

        let id = request
            .remove("id")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let command = request
            .remove("command")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();

        match command.as_str() {
            "echo" => {
                seq += 1;
                reply(&id, json!({"echo": true, "seq": seq, "params": request}))?;
            }
            "sleep" => {
                let ms = request.get("ms").and_then(Value::as_u64).unwrap_or(100);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(ms));
                    let _ = reply(&id, json!({"slept": ms}));
                });
            }
            "ignore" => {}
            "fail" => {
                write_frame(&json!({"id": id, "error": "requested failure"}))?;
            }
            "crash" => std::process::exit(3),
            "exit" => std::process::exit(0),
            "garbage" => {
                let mut out = io::stdout().lock();
                out.write_all(format!("{{not json{}\n", SENTINEL).as_bytes())?;
                out.flush()?;
            }
            "dribble" => {
                let body = frame_text(&json!({"id": id, "result": {"dribbled": true}}));
                let mut out = io::stdout().lock();
                for byte in body.as_bytes() {
                    out.write_all(&[*byte])?;
                    out.flush()?;
                    thread::sleep(Duration::from_micros(200));
                }
            }
            "oom" => {
                eprintln!("MemoryError: simulated allocation failure");
                reply(&id, json!({"oom": true}))?;
            }
            "orphan" => {
                reply("00000000-0000-0000-0000-000000000000", json!({"stray": true}))?;
                reply(&id, json!({"orphan_sent": true}))?;
            }
            "file" => {
                let path = std::env::temp_dir().join(format!("fallback_response_{}.json", id));
                let body = json!({"id": id, "result": {"from_file": true}});
                std::fs::write(&path, body.to_string())?;
                write_frame(&json!({"id": id, "file_response": path, "fallback": true}))?;
            }
            "pid" => reply(&id, json!({"pid": std::process::id()}))?,
            "grow" => {
                let mb = request.get("mb").and_then(Value::as_u64).unwrap_or(1) as usize;
                // Non-zero fill so every page is resident.
                ballast.push(vec![0xA5; mb * 1024 * 1024]);
                let held: usize = ballast.iter().map(Vec::len).sum();
                reply(&id, json!({"held_mb": held / (1024 * 1024)}))?;
            }
            "check_memory" if env_flag("ECHO_WORKER_SILENT_CHECK") => {}
            "check_memory" => {
                let restart_needed = env_flag("ECHO_WORKER_RESTART_NEEDED");
                reply(&id, json!({"restart_needed": restart_needed, "rss_mb": 12}))?;
            }
            "check_environment" => {
                let status =
                    std::env::var("ECHO_WORKER_STATUS").unwrap_or_else(|_| "ok".to_string());
                reply(&id, json!({"status": status}))?;
            }
            other => {
                write_frame(&json!({"id": id, "error": format!("Unknown command: {}", other)}))?;
            }
        }
    }

    Ok(())
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "1").unwrap_or(false)
}

fn reply(id: &str, result: Value) -> io::Result<()> {
    write_frame(&json!({"id": id, "result": result}))
}

fn frame_text(message: &Value) -> String {
    let body = serde_json::to_string_pretty(message).unwrap_or_else(|_| message.to_string());
    format!("{}{}\n", body, SENTINEL)
}

fn write_frame(message: &Value) -> io::Result<()> {
    let mut out = io::stdout().lock();
    out.write_all(frame_text(message).as_bytes())?;
    out.flush()
}
