mod test_support;

use serde_json::json;
use test_support::{
    login, register, request, request_err, request_ok, select_workspace, semester_with_course,
    spawn_sidecar, str_field, temp_dir,
};

#[test]
fn semester_course_and_weekly_slots_lifecycle() {
    let workspace = temp_dir("studyd-courses");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, workspace.path());
    register(&mut stdin, &mut reader, "ana");
    let (semester_id, course_id) = semester_with_course(&mut stdin, &mut reader, "Linear Algebra");

    let listed = request_ok(&mut stdin, &mut reader, "1", "semesters.list", json!({}));
    assert_eq!(listed["currentSemesterId"], semester_id.as_str());
    assert_eq!(listed["semesters"][0]["courseCount"], 1);
    assert_eq!(listed["semesters"][0]["isCurrent"], true);

    let dup = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "semesters.create",
        json!({
            "name": "again",
            "year": 2026,
            "period": "2",
            "startDate": "2026-08-01",
            "endDate": "2026-12-15",
        }),
    );
    assert_eq!(dup, "validation_failed");

    let same_name = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "courses.create",
        json!({ "semesterId": semester_id, "name": "linear algebra" }),
    );
    assert_eq!(same_name, "validation_failed");

    let monday = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "schedule.create",
        json!({ "courseId": course_id, "weekday": 0, "startTime": "08:00", "endTime": "10:00", "location": "B-12" }),
    );
    let monday_id = str_field(&monday, "slotId");
    assert_eq!(monday["slot"]["weekdayName"], "Monday");

    let overlap = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "schedule.create",
        json!({ "courseId": course_id, "weekday": 0, "startTime": "09:00", "endTime": "11:00" }),
    );
    assert_eq!(overlap, "conflict");

    let backwards = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "schedule.create",
        json!({ "courseId": course_id, "weekday": 2, "startTime": "12:00", "endTime": "10:00" }),
    );
    assert_eq!(backwards, "validation_failed");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "schedule.create",
        json!({ "courseId": course_id, "weekday": 2, "startTime": "10:00", "endTime": "12:00" }),
    );
    let slots = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "schedule.list",
        json!({ "courseId": course_id }),
    );
    assert_eq!(slots["slots"].as_array().map(|a| a.len()), Some(2));

    let dates = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "courses.upcomingClassDates",
        json!({ "courseId": course_id, "limit": 3 }),
    );
    let got: Vec<&str> = dates["dates"]
        .as_array()
        .expect("dates")
        .iter()
        .filter_map(|d| d["date"].as_str())
        .collect();
    assert_eq!(got, vec!["2026-10-19", "2026-10-21", "2026-10-26"]);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "schedule.update",
        json!({ "slotId": monday_id, "patch": { "active": false } }),
    );
    let active = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "schedule.list",
        json!({ "courseId": course_id }),
    );
    assert_eq!(active["slots"].as_array().map(|a| a.len()), Some(1));
    let all = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "schedule.list",
        json!({ "courseId": course_id, "includeInactive": true }),
    );
    assert_eq!(all["slots"].as_array().map(|a| a.len()), Some(2));

    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "courses.open",
        json!({ "courseId": course_id }),
    );
    assert_eq!(opened["course"]["accessCount"], 1);
    assert_eq!(opened["slots"].as_array().map(|a| a.len()), Some(1));

    let _ = request_ok(&mut stdin, &mut reader, "14", "session.logout", json!({}));
    register(&mut stdin, &mut reader, "bia");
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "15",
            "courses.open",
            json!({ "courseId": course_id }),
        ),
        "forbidden"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "16",
            "schedule.create",
            json!({ "courseId": course_id, "weekday": 4, "startTime": "08:00", "endTime": "09:00" }),
        ),
        "forbidden"
    );

    login(&mut stdin, &mut reader, "ana");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "semesters.delete",
        json!({ "semesterId": semester_id }),
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "18",
            "courses.open",
            json!({ "courseId": course_id }),
        ),
        "not_found"
    );
}

#[test]
fn inactive_slots_still_respect_the_same_start_rule() {
    let workspace = temp_dir("studyd-slots");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, workspace.path());
    register(&mut stdin, &mut reader, "ana");
    let (_semester_id, course_id) = semester_with_course(&mut stdin, &mut reader, "Statistics");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "schedule.create",
        json!({ "courseId": course_id, "weekday": 0, "startTime": "08:00", "endTime": "10:00" }),
    );
    let tuesday = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "schedule.create",
        json!({ "courseId": course_id, "weekday": 1, "startTime": "08:00", "endTime": "10:00" }),
    );
    let tuesday_id = str_field(&tuesday, "slotId");

    let moved = request(
        &mut stdin,
        &mut reader,
        "3",
        "schedule.update",
        json!({ "slotId": tuesday_id, "patch": { "weekday": 0, "active": false } }),
    );
    assert_eq!(moved["error"]["code"], "validation_failed");
    assert!(moved["error"]["details"]["fields"]["startTime"].is_string());

    // Overlap is only checked for active slots.
    let parked = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "schedule.update",
        json!({ "slotId": tuesday_id, "patch": { "weekday": 0, "startTime": "09:00", "endTime": "11:00", "active": false } }),
    );
    assert_eq!(parked["slot"]["active"], false);

    let audit = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "audit.day",
        json!({ "date": "2026-10-16" }),
    );
    assert_eq!(audit["stats"]["errors"], 0);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "schedule.delete",
        json!({ "slotId": tuesday_id }),
    );
    let all = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "schedule.list",
        json!({ "courseId": course_id, "includeInactive": true }),
    );
    assert_eq!(all["slots"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "8",
            "schedule.delete",
            json!({ "slotId": tuesday_id }),
        ),
        "not_found"
    );
}

#[test]
fn course_rename_keeps_the_slug_and_delete_cascades() {
    let workspace = temp_dir("studyd-course-edit");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, workspace.path());
    register(&mut stdin, &mut reader, "ana");
    let (semester_id, physics_id) = semester_with_course(&mut stdin, &mut reader, "Physics I");
    let chemistry = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "courses.create",
        json!({ "semesterId": semester_id, "name": "Chemistry" }),
    );
    let chemistry_id = str_field(&chemistry, "courseId");

    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "2",
            "courses.update",
            json!({ "courseId": chemistry_id, "patch": { "name": "PHYSICS i" } }),
        ),
        "validation_failed"
    );

    let renamed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "courses.update",
        json!({ "courseId": physics_id, "patch": { "name": "physics i", "description": "Mechanics" } }),
    );
    assert_eq!(renamed["course"]["name"], "physics i");
    assert_eq!(renamed["course"]["slug"], "physics-i");
    assert_eq!(renamed["course"]["description"], "Mechanics");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "schedule.create",
        json!({ "courseId": chemistry_id, "weekday": 3, "startTime": "14:00", "endTime": "16:00" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "tasks.create",
        json!({ "courseId": chemistry_id, "title": "Titration report" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "agenda.create",
        json!({ "title": "Lab exam", "scope": "COURSE", "courseId": chemistry_id, "start": "2026-10-23T10:00" }),
    );

    let _ = request_ok(&mut stdin, &mut reader, "7", "session.logout", json!({}));
    register(&mut stdin, &mut reader, "bia");
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "8",
            "courses.delete",
            json!({ "courseId": chemistry_id }),
        ),
        "forbidden"
    );

    login(&mut stdin, &mut reader, "ana");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "courses.delete",
        json!({ "courseId": chemistry_id }),
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "10",
            "courses.open",
            json!({ "courseId": chemistry_id }),
        ),
        "not_found"
    );
    let tasks = request_ok(&mut stdin, &mut reader, "11", "tasks.list", json!({ "status": "all" }));
    assert_eq!(tasks["stats"]["total"], 0);
    let agenda = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "agenda.list",
        json!({ "period": "all" }),
    );
    assert_eq!(agenda["pagination"]["total"], 0);
    let courses = request_ok(&mut stdin, &mut reader, "13", "courses.list", json!({}));
    assert_eq!(courses["pagination"]["total"], 1);
}
