mod test_support;

use serde_json::{json, Value};
use test_support::{
    register, request_err, request_ok, select_workspace, semester_with_course, spawn_sidecar,
    str_field, temp_dir,
};

fn titles_on(month: &Value, day: &str) -> Vec<String> {
    month["eventsByDay"][day]
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|o| o["title"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn recurring_events_and_class_slots_share_the_calendar() {
    let workspace = temp_dir("studyd-calendar");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, workspace.path());
    register(&mut stdin, &mut reader, "ana");
    let (_semester_id, course_id) = semester_with_course(&mut stdin, &mut reader, "Databases");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "schedule.create",
        json!({ "courseId": course_id, "weekday": 1, "startTime": "08:00", "endTime": "10:00" }),
    );

    let backwards = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "calendar.events.create",
        json!({ "event": { "title": "Oops", "start": "2026-10-19T14:00", "end": "2026-10-19T13:00" } }),
    );
    assert_eq!(backwards, "validation_failed");
    let bad_kind = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "calendar.events.create",
        json!({ "event": { "title": "Party", "kind": "party", "start": "2026-10-19T14:00", "end": "2026-10-19T15:00" } }),
    );
    assert_eq!(bad_kind, "validation_failed");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "calendar.events.create",
        json!({
            "event": {
                "title": "Study session",
                "kind": "study",
                "start": "2026-10-19T14:00",
                "end": "2026-10-19T16:00",
            },
            "recurrence": { "kind": "weekly", "weekdays": [1, 3], "until": "2026-10-31" },
        }),
    );
    let event_id = str_field(&created, "eventId");
    assert_eq!(created["event"]["recurrence"]["kind"], "weekly");

    let feed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "calendar.feed",
        json!({ "start": "2026-10-19", "end": "2026-10-31" }),
    );
    let feed = feed.as_array().expect("feed array");
    let study: Vec<&str> = feed
        .iter()
        .filter(|o| o["title"] == "Study session")
        .filter_map(|o| o["start"].as_str())
        .collect();
    assert_eq!(
        study,
        vec![
            "2026-10-19T14:00:00",
            "2026-10-21T14:00:00",
            "2026-10-26T14:00:00",
            "2026-10-28T14:00:00",
        ]
    );
    let slots: Vec<&Value> = feed.iter().filter(|o| o["isFixedSlot"] == true).collect();
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0]["start"], "2026-10-20T08:00:00");
    assert_eq!(slots[0]["courseName"], "Databases");

    let month = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "calendar.month",
        json!({ "year": 2026, "month": 10 }),
    );
    assert_eq!(month["monthName"], "October");
    assert_eq!(titles_on(&month, "6"), vec!["Databases".to_string()]);
    assert!(titles_on(&month, "21").contains(&"Study session".to_string()));
    assert_eq!(month["prev"]["month"], 9);
    assert_eq!(month["next"]["month"], 11);

    let wrapped = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "calendar.month",
        json!({ "year": 2026, "month": 13, "view": "weekly" }),
    );
    assert_eq!(wrapped["year"], 2027);
    assert_eq!(wrapped["month"], 1);
    assert!(wrapped["hourGrid"].is_array());

    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "calendar.events.open",
        json!({ "eventId": event_id }),
    );
    assert_eq!(opened["nextOccurrences"][0], "2026-10-19T14:00:00");
    assert_eq!(opened["isPast"], false);

    let cleared = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "calendar.recurrence.set",
        json!({ "eventId": event_id, "recurrence": null }),
    );
    assert!(cleared["event"]["recurrence"].is_null());

    let week = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "calendar.events.list",
        json!({ "period": "custom", "from": "2026-10-19", "to": "2026-10-31", "kinds": ["study"] }),
    );
    assert_eq!(week["total"], 1);
    assert_eq!(week["byKind"]["study"], 1);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "calendar.events.delete",
        json!({ "eventId": event_id }),
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "12",
            "calendar.events.open",
            json!({ "eventId": event_id }),
        ),
        "not_found"
    );
}
