mod test_support;

use serde_json::json;
use test_support::{
    login, register, request, request_err, request_ok, select_workspace, semester_with_course,
    spawn_sidecar, str_field, temp_dir,
};

#[test]
fn semester_edits_open_view_and_task_board() {
    let workspace = temp_dir("studyd-semester-edit");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, workspace.path());
    register(&mut stdin, &mut reader, "ana");
    let (semester_id, genetics_id) = semester_with_course(&mut stdin, &mut reader, "Genetics");

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "semesters.create",
        json!({
            "name": "2026/1",
            "year": 2026,
            "period": "1",
            "startDate": "2026-02-01",
            "endDate": "2026-07-15",
        }),
    );
    let first_id = str_field(&first, "semesterId");

    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "2",
            "semesters.update",
            json!({ "semesterId": first_id, "patch": { "endDate": "2026-01-01" } }),
        ),
        "validation_failed"
    );
    let taken = request(
        &mut stdin,
        &mut reader,
        "3",
        "semesters.update",
        json!({ "semesterId": first_id, "patch": { "period": "2" } }),
    );
    assert_eq!(taken["error"]["code"], "validation_failed");
    assert!(taken["error"]["details"]["fields"]["period"].is_string());

    let summer = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "semesters.update",
        json!({ "semesterId": first_id, "patch": { "period": "summer", "name": "Summer school" } }),
    );
    assert_eq!(summer["semester"]["period"], "SUMMER");
    assert_eq!(summer["semester"]["periodLabel"], "Summer");
    assert_eq!(summer["semester"]["name"], "Summer school");

    let ecology = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "courses.create",
        json!({ "semesterId": semester_id, "name": "Ecology" }),
    );
    let ecology_id = str_field(&ecology, "courseId");
    let botany = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "courses.create",
        json!({ "semesterId": first_id, "name": "Botany" }),
    );
    let botany_id = str_field(&botany, "courseId");

    let events = [
        json!({ "title": "Seminar", "scope": "SEMESTER", "semesterId": semester_id, "start": "2026-10-20T10:00" }),
        json!({ "title": "Lab report due", "scope": "COURSE", "courseId": ecology_id, "start": "2026-10-25T10:00" }),
        json!({ "title": "Final exam", "scope": "COURSE", "courseId": genetics_id, "start": "2026-11-20T10:00" }),
        json!({ "title": "Free day", "start": "2026-10-18T10:00" }),
        json!({ "title": "Herbarium visit", "scope": "COURSE", "courseId": botany_id, "start": "2026-10-19T10:00" }),
    ];
    for (i, ev) in events.iter().enumerate() {
        let _ = request_ok(&mut stdin, &mut reader, &format!("ev{i}"), "agenda.create", ev.clone());
    }

    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "semesters.open",
        json!({ "semesterId": semester_id }),
    );
    let names: Vec<&str> = opened["courses"]
        .as_array()
        .expect("courses")
        .iter()
        .filter_map(|c| c["name"].as_str())
        .collect();
    assert_eq!(names, vec!["Ecology", "Genetics"]);
    let titles: Vec<&str> = opened["upcomingEvents"]
        .as_array()
        .expect("events")
        .iter()
        .filter_map(|e| e["title"].as_str())
        .collect();
    assert_eq!(titles, vec!["Seminar", "Lab report due"]);

    for day in 0..10 {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("quiz{day}"),
            "agenda.create",
            json!({
                "title": format!("Quiz {day}"),
                "scope": "SEMESTER",
                "semesterId": semester_id,
                "start": format!("2026-10-{:02}T09:00", 21 + day),
            }),
        );
    }
    let crowded = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "semesters.open",
        json!({ "semesterId": semester_id }),
    );
    assert_eq!(crowded["upcomingEvents"].as_array().map(|a| a.len()), Some(10));

    let mut task_ids = Vec::new();
    for (i, (course, title)) in [
        (&genetics_id, "Punnett squares"),
        (&genetics_id, "DNA reading"),
        (&ecology_id, "Field notes"),
        (&botany_id, "Leaf collection"),
    ]
    .iter()
    .enumerate()
    {
        let t = request_ok(
            &mut stdin,
            &mut reader,
            &format!("task{i}"),
            "tasks.create",
            json!({ "courseId": course, "title": title }),
        );
        task_ids.push(str_field(&t, "taskId"));
    }
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "tasks.toggle",
        json!({ "taskId": task_ids[0] }),
    );

    let board = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "semesters.tasks",
        json!({ "semesterId": semester_id }),
    );
    assert_eq!(board["stats"]["total"], 3);
    assert_eq!(board["stats"]["done"], 1);
    assert_eq!(board["pagination"]["pageSize"], 15);
    assert_eq!(board["semester"]["id"], semester_id.as_str());

    let field = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "semesters.tasks",
        json!({ "semesterId": semester_id, "courseId": ecology_id }),
    );
    assert_eq!(field["tasks"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(field["tasks"][0]["title"], "Field notes");

    let done = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "semesters.tasks",
        json!({ "semesterId": semester_id, "status": "done" }),
    );
    assert_eq!(done["tasks"].as_array().map(|a| a.len()), Some(1));

    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "13",
            "semesters.tasks",
            json!({ "semesterId": semester_id, "courseId": botany_id }),
        ),
        "not_found"
    );
}

#[test]
fn out_of_range_pages_come_back_empty() {
    let workspace = temp_dir("studyd-pages");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, workspace.path());
    register(&mut stdin, &mut reader, "ana");
    let (semester_id, course_id) = semester_with_course(&mut stdin, &mut reader, "Logic");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "tasks.create",
        json!({ "courseId": course_id, "title": "Truth tables" }),
    );

    let calls = [
        ("tasks.list", json!({ "status": "all", "page": i64::MAX }), "tasks"),
        ("semesters.tasks", json!({ "semesterId": semester_id, "page": i64::MAX }), "tasks"),
        ("agenda.list", json!({ "page": i64::MAX }), "events"),
        ("courses.list", json!({ "page": i64::MAX }), "courses"),
        ("materials.list", json!({ "page": i64::MAX }), "materials"),
    ];
    for (i, (method, params, key)) in calls.iter().enumerate() {
        let res = request_ok(&mut stdin, &mut reader, &format!("p{i}"), method, params.clone());
        assert_eq!(res[*key].as_array().map(|a| a.len()), Some(0), "{method}: {res}");
        assert_eq!(res["pagination"]["hasNext"], false, "{method}");
    }

    let health = request_ok(&mut stdin, &mut reader, "2", "health", json!({}));
    assert!(health["workspacePath"].is_string());
}

#[test]
fn task_and_agenda_edits_follow_the_create_rules() {
    let workspace = temp_dir("studyd-edits");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, workspace.path());
    register(&mut stdin, &mut reader, "ana");
    let (semester_id, course_id) = semester_with_course(&mut stdin, &mut reader, "Calculus");

    let task = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "tasks.create",
        json!({ "courseId": course_id, "title": "Limits", "deadline": "2026-10-30T18:00" }),
    );
    let task_id = str_field(&task, "taskId");
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "2",
            "tasks.update",
            json!({ "taskId": task_id, "patch": { "title": "  " } }),
        ),
        "validation_failed"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "3",
            "tasks.update",
            json!({ "taskId": task_id, "patch": { "deadline": "2026-10-01T12:00" } }),
        ),
        "validation_failed"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "4",
            "tasks.update",
            json!({ "taskId": task_id, "patch": { "priority": "high" } }),
        ),
        "bad_params"
    );
    let started = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "tasks.update",
        json!({ "taskId": task_id, "patch": { "status": "in_progress", "deadline": "2026-11-02T18:00" } }),
    );
    assert_eq!(started["task"]["status"], "IN_PROGRESS");
    assert_eq!(started["task"]["deadline"], "2026-11-02T18:00:00");
    assert_eq!(started["task"]["daysToDeadline"], 17);
    assert_eq!(started["task"]["title"], "Limits");

    let exam = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "agenda.create",
        json!({ "title": "Quiz", "scope": "COURSE", "courseId": course_id, "start": "2026-10-22T10:00" }),
    );
    let exam_id = str_field(&exam, "eventId");
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "7",
            "agenda.update",
            json!({ "eventId": exam_id, "patch": { "end": "2026-10-22T09:00" } }),
        ),
        "validation_failed"
    );
    let promoted = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "agenda.update",
        json!({ "eventId": exam_id, "patch": { "kind": "exam", "end": "2026-10-22T12:00" } }),
    );
    assert_eq!(promoted["event"]["kindLabel"], "Exam");
    assert_eq!(promoted["event"]["semesterId"], semester_id.as_str());

    let general = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "agenda.update",
        json!({ "eventId": exam_id, "patch": { "scope": "general" } }),
    );
    assert!(general["event"]["courseId"].is_null());
    assert!(general["event"]["semesterId"].is_null());
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "10",
            "agenda.update",
            json!({ "eventId": exam_id, "patch": { "scope": "SEMESTER" } }),
        ),
        "validation_failed"
    );

    let _ = request_ok(&mut stdin, &mut reader, "11", "session.logout", json!({}));
    register(&mut stdin, &mut reader, "bia");
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "12",
            "tasks.update",
            json!({ "taskId": task_id, "patch": { "title": "Mine now" } }),
        ),
        "forbidden"
    );
    assert_eq!(
        request_err(&mut stdin, &mut reader, "13", "agenda.delete", json!({ "eventId": exam_id })),
        "forbidden"
    );

    login(&mut stdin, &mut reader, "ana");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "agenda.delete",
        json!({ "eventId": exam_id }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "agenda.list",
        json!({ "period": "all" }),
    );
    assert_eq!(listed["pagination"]["total"], 0);
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "16",
            "agenda.update",
            json!({ "eventId": exam_id, "patch": { "title": "Back" } }),
        ),
        "not_found"
    );
}

#[test]
fn calendar_patches_respect_the_configured_limits() {
    let workspace = temp_dir("studyd-calendar-edit");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, workspace.path());
    register(&mut stdin, &mut reader, "ana");

    let setup = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "setup.update",
        json!({ "section": "calendar", "patch": { "maxEventHours": 4 } }),
    );
    assert_eq!(setup["calendar"]["maxEventHours"], 4);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "calendar.events.create",
        json!({ "event": { "title": "Group study", "kind": "study", "start": "2026-10-21T14:00", "end": "2026-10-21T16:00" } }),
    );
    let event_id = str_field(&created, "eventId");

    let too_long = request(
        &mut stdin,
        &mut reader,
        "3",
        "calendar.events.update",
        json!({ "eventId": event_id, "patch": { "end": "2026-10-21T19:00" } }),
    );
    assert_eq!(too_long["error"]["code"], "validation_failed");
    assert!(too_long["error"]["details"]["fields"]["end"].is_string());
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "4",
            "calendar.events.update",
            json!({ "eventId": event_id, "patch": { "reminderMinutes": 2 } }),
        ),
        "validation_failed"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "5",
            "calendar.events.update",
            json!({ "eventId": event_id, "patch": { "customColor": "orange" } }),
        ),
        "validation_failed"
    );

    let longer = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "calendar.events.update",
        json!({ "eventId": event_id, "patch": { "end": "2026-10-21T17:30", "customColor": "#123ABC" } }),
    );
    assert_eq!(longer["event"]["end"], "2026-10-21T17:30:00");
    assert_eq!(longer["event"]["durationHours"], 3.5);
    assert_eq!(longer["event"]["color"], "#123ABC");
    assert_eq!(longer["event"]["title"], "Group study");
}

#[test]
fn profiles_report_initials_defaults_and_live_stats() {
    let workspace = temp_dir("studyd-profile");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, workspace.path());
    let maria = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "users.register",
        json!({
            "username": "msouza",
            "email": "maria@uni.example",
            "firstName": "maria",
            "lastName": "souza",
            "password": "correct-horse",
            "passwordConfirm": "correct-horse",
        }),
    );
    let maria_id = str_field(&maria["user"], "id");

    let fresh = request_ok(&mut stdin, &mut reader, "2", "users.profile.get", json!({}));
    assert_eq!(fresh["user"]["initials"], "MS");
    assert_eq!(fresh["profile"]["studyHoursPerDay"], 4);
    assert_eq!(fresh["profile"]["darkTheme"], true);
    assert_eq!(fresh["profile"]["emailNotifications"], true);
    assert_eq!(fresh["profile"]["timezone"], "America/Sao_Paulo");
    assert_eq!(fresh["stats"]["totalCourses"], 0);

    let (_semester_id, course_id) = semester_with_course(&mut stdin, &mut reader, "Anatomy");
    let task = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "tasks.create",
        json!({ "courseId": course_id, "title": "Bones chart" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "tasks.toggle",
        json!({ "taskId": str_field(&task, "taskId") }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "calendar.events.create",
        json!({ "event": { "title": "Review", "start": "2026-10-19T10:00", "end": "2026-10-19T11:00" } }),
    );

    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "6",
            "users.profile.update",
            json!({ "patch": { "studyHoursPerDay": 30 } }),
        ),
        "validation_failed"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "7",
            "users.profile.update",
            json!({ "patch": { "nickname": "mari" } }),
        ),
        "bad_params"
    );
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "users.profile.update",
        json!({ "patch": { "institution": "USP", "darkTheme": false, "studyHoursPerDay": 6 } }),
    );
    assert_eq!(updated["profile"]["institution"], "USP");
    assert_eq!(updated["profile"]["darkTheme"], false);
    assert_eq!(updated["profile"]["studyHoursPerDay"], 6);
    assert_eq!(updated["profile"]["timezone"], "America/Sao_Paulo");
    assert_eq!(updated["stats"]["totalCourses"], 1);
    assert_eq!(updated["stats"]["totalEvents"], 1);
    assert_eq!(updated["stats"]["completedTasks"], 1);

    let _ = request_ok(&mut stdin, &mut reader, "9", "session.logout", json!({}));
    let bia = register(&mut stdin, &mut reader, "bia");
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "10",
            "users.profile.get",
            json!({ "userId": maria_id }),
        ),
        "forbidden"
    );

    login(&mut stdin, &mut reader, "msouza");
    let other = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "users.profile.get",
        json!({ "userId": str_field(&bia, "id") }),
    );
    assert_eq!(other["user"]["initials"], "B");
    assert_eq!(other["stats"]["completedTasks"], 0);
}
