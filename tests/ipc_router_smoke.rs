mod test_support;

use serde_json::json;
use std::io::{BufRead, Write};
use test_support::{
    register, request, request_err, request_ok, select_workspace, semester_with_course,
    spawn_sidecar, str_field, temp_dir,
};

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("studyd-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["now"], "2026-10-16T08:00:00");
    assert!(health["workspacePath"].is_null());

    assert_eq!(
        request_err(&mut stdin, &mut reader, "2", "semesters.list", json!({})),
        "no_workspace"
    );
    select_workspace(&mut stdin, &mut reader, workspace.path());
    assert_eq!(
        request_err(&mut stdin, &mut reader, "3", "semesters.list", json!({})),
        "not_authenticated"
    );

    register(&mut stdin, &mut reader, "ana");
    let (_semester_id, course_id) = semester_with_course(&mut stdin, &mut reader, "Algebra");

    // One call per family; none may fall through to not_implemented.
    let calls = [
        ("setup.get", json!({})),
        ("session.whoami", json!({})),
        ("semesters.list", json!({})),
        ("courses.list", json!({})),
        ("schedule.list", json!({ "courseId": course_id })),
        ("materials.list", json!({})),
        ("tasks.list", json!({})),
        ("agenda.list", json!({})),
        ("calendar.dashboard", json!({})),
        ("agent.ask", json!({ "scope": "home", "question": "what is next?" })),
        ("audit.days", json!({})),
        ("lab.hours.list", json!({})),
        ("lab.agenda", json!({})),
        ("home.dashboard", json!({})),
        ("search", json!({ "q": "alg" })),
    ];
    for (i, (method, params)) in calls.iter().enumerate() {
        let id = format!("f{i}");
        let resp = request(&mut stdin, &mut reader, &id, method, params.clone());
        assert_eq!(resp["ok"], true, "{method}: {resp}");
    }

    let unknown = request(&mut stdin, &mut reader, "9", "grades.open", json!({}));
    assert_eq!(unknown["error"]["code"], "not_implemented");

    writeln!(stdin, "{{not json").expect("write");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read");
    let bad: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(bad["error"]["code"], "bad_json");

    // The loop keeps serving after a bad line.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "courses.open",
        json!({ "courseId": course_id }),
    );
    assert_eq!(str_field(&again["course"], "name"), "Algebra");

    drop(stdin);
    let status = child.wait().expect("wait");
    assert!(status.success());
}
