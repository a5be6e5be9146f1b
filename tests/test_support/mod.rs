#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

/// Every test runs against this pinned clock (a Friday).
pub const NOW: &str = "2026-10-16T08:00";

pub fn temp_dir(prefix: &str) -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .expect("create temp dir")
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_studyd");
    let mut child = Command::new(exe)
        .env("STUDYD_NOW", NOW)
        .env("STUDYD_LOG", "warn")
        .env_remove("STUDYD_LOG_DIR")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn studyd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Error code of a failed response; panics if the call succeeded.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

pub fn str_field(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {key} in {v}"))
        .to_string()
}

pub fn select_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    path: &std::path::Path,
) {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": path.to_string_lossy() }),
    );
}

/// Registers and logs in `username`. The first account in a workspace
/// becomes staff and superuser.
pub fn register(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    username: &str,
) -> Value {
    let res = request_ok(
        stdin,
        reader,
        &format!("reg-{username}"),
        "users.register",
        json!({
            "username": username,
            "email": format!("{username}@uni.example"),
            "firstName": username,
            "password": "correct-horse",
            "passwordConfirm": "correct-horse",
        }),
    );
    res.get("user").cloned().expect("user")
}

pub fn login(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, username: &str) {
    let _ = request_ok(
        stdin,
        reader,
        &format!("login-{username}"),
        "session.login",
        json!({ "username": username, "password": "correct-horse" }),
    );
}

/// A second-semester 2026 term with one course; returns (semesterId, courseId).
pub fn semester_with_course(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    course_name: &str,
) -> (String, String) {
    let sem = request_ok(
        stdin,
        reader,
        "sem",
        "semesters.create",
        json!({
            "name": "2026/2",
            "year": 2026,
            "period": "2",
            "startDate": "2026-08-01",
            "endDate": "2026-12-15",
        }),
    );
    let semester_id = str_field(&sem, "semesterId");
    let course = request_ok(
        stdin,
        reader,
        "course",
        "courses.create",
        json!({ "semesterId": semester_id, "name": course_name }),
    );
    (semester_id, str_field(&course, "courseId"))
}
