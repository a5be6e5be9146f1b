mod test_support;

use serde_json::json;
use test_support::{
    register, request_err, request_ok, select_workspace, semester_with_course, spawn_sidecar,
    str_field, temp_dir,
};

#[test]
fn tasks_track_deadlines_and_status() {
    let workspace = temp_dir("studyd-tasks");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, workspace.path());
    register(&mut stdin, &mut reader, "ana");
    let (_semester_id, course_id) = semester_with_course(&mut stdin, &mut reader, "Physics");

    let past = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "tasks.create",
        json!({ "courseId": course_id, "title": "Old report", "deadline": "2026-10-15T10:00" }),
    );
    assert_eq!(past, "validation_failed");

    // Within the one-hour grace window, and already overdue.
    let late = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "tasks.create",
        json!({ "courseId": course_id, "title": "Lab sheet", "deadline": "2026-10-16T07:30" }),
    );
    assert_eq!(late["task"]["overdue"], true);

    let list = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "tasks.create",
        json!({ "courseId": course_id, "title": "Problem list 4", "suggestedDate": "2026-10-20" }),
    );
    assert_eq!(list["task"]["deadline"], "2026-10-20T23:59:00");
    assert_eq!(list["task"]["daysToDeadline"], 4);
    let list_id = str_field(&list, "taskId");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "tasks.create",
        json!({ "courseId": course_id, "title": "Read chapter 2" }),
    );

    let toggled = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "tasks.toggle",
        json!({ "taskId": list_id }),
    );
    assert_eq!(toggled["status"], "DONE");

    let pending = request_ok(&mut stdin, &mut reader, "6", "tasks.list", json!({}));
    let titles: Vec<&str> = pending["tasks"]
        .as_array()
        .expect("tasks")
        .iter()
        .filter_map(|t| t["title"].as_str())
        .collect();
    assert_eq!(titles, vec!["Lab sheet", "Read chapter 2"]);
    assert_eq!(pending["stats"]["total"], 3);
    assert_eq!(pending["stats"]["pending"], 2);
    assert_eq!(pending["stats"]["done"], 1);
    assert_eq!(pending["stats"]["overdue"], 1);

    let done = request_ok(&mut stdin, &mut reader, "7", "tasks.list", json!({ "status": "done" }));
    assert_eq!(done["tasks"].as_array().map(|a| a.len()), Some(1));

    let _ = request_ok(&mut stdin, &mut reader, "8", "tasks.delete", json!({ "taskId": list_id }));
    let all = request_ok(&mut stdin, &mut reader, "9", "tasks.list", json!({ "status": "all" }));
    assert_eq!(all["stats"]["total"], 2);
}

#[test]
fn agenda_scopes_and_periods() {
    let workspace = temp_dir("studyd-agenda");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, workspace.path());
    register(&mut stdin, &mut reader, "ana");
    let (semester_id, course_id) = semester_with_course(&mut stdin, &mut reader, "Chemistry");

    let in_past = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "agenda.create",
        json!({ "title": "Too late", "start": "2026-10-15T09:00" }),
    );
    assert_eq!(in_past, "validation_failed");

    let missing_course = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "agenda.create",
        json!({ "title": "Quiz", "scope": "COURSE", "start": "2026-10-20T09:00" }),
    );
    assert_eq!(missing_course, "validation_failed");

    let exam = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "agenda.create",
        json!({
            "title": "Midterm",
            "scope": "course",
            "kind": "exam",
            "start": "2026-10-22T10:00",
            "end": "2026-10-22T12:00",
            "courseId": course_id,
        }),
    );
    // Course events inherit the course's semester.
    assert_eq!(exam["event"]["semesterId"], semester_id.as_str());
    assert_eq!(exam["event"]["courseName"], "Chemistry");
    assert_eq!(exam["event"]["kindLabel"], "Exam");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "agenda.create",
        json!({ "title": "Study group", "kind": "activity", "start": "2026-10-16T18:00" }),
    );

    let upcoming = request_ok(&mut stdin, &mut reader, "5", "agenda.list", json!({}));
    let titles: Vec<&str> = upcoming["events"]
        .as_array()
        .expect("events")
        .iter()
        .filter_map(|e| e["title"].as_str())
        .collect();
    assert_eq!(titles, vec!["Study group", "Midterm"]);
    assert_eq!(upcoming["events"][0]["isToday"], true);
    assert_eq!(upcoming["importantUpcoming"].as_array().map(|a| a.len()), Some(1));

    let exams = request_ok(&mut stdin, &mut reader, "6", "agenda.list", json!({ "kind": "EXAM" }));
    assert_eq!(exams["pagination"]["total"], 1);

    let past = request_ok(&mut stdin, &mut reader, "7", "agenda.list", json!({ "period": "past" }));
    assert_eq!(past["events"].as_array().map(|a| a.len()), Some(0));
}
