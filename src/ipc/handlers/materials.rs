use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde_json::{json, Value};

use super::courses::{owned_course, visible_course};
use crate::clock::fmt_date_time;
use crate::ipc::error::err;
use crate::ipc::helpers::{
    db_conn, db_err, finish, forbidden, invalid, like_pattern, need_str, new_id, not_found,
    opt_str, params, require_user, workspace, HandlerResult, Page,
};
use crate::ipc::types::{AppState, Request};
use crate::storage::{self, MaterialKind, UploadError};

const PAGE_SIZE: i64 = 20;

const MATERIAL_SELECT: &str = "SELECT m.id, m.course_id, c.name, m.title, m.stored_path,
        m.original_name, m.kind, m.size_bytes, m.uploaded_at, m.uploader_id
     FROM materials m
     JOIN courses c ON c.id = m.course_id
     JOIN semesters s ON s.id = c.semester_id";

fn material_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    let size: i64 = r.get(7)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "courseId": r.get::<_, String>(1)?,
        "courseName": r.get::<_, String>(2)?,
        "title": r.get::<_, String>(3)?,
        "storedPath": r.get::<_, String>(4)?,
        "originalName": r.get::<_, String>(5)?,
        "kind": r.get::<_, String>(6)?,
        "sizeBytes": size,
        "sizeLabel": storage::human_size(size.max(0) as u64),
        "uploadedAt": r.get::<_, String>(8)?,
        "uploaderId": r.get::<_, Option<String>>(9)?,
    }))
}

/// Materials joined with their course, newest first. `where_sql` sees the
/// aliases `m`, `c` and `s`; a negative `limit` means no limit.
pub fn select_materials(
    conn: &Connection,
    where_sql: &str,
    binds: &[&dyn ToSql],
    limit: i64,
    offset: i64,
) -> rusqlite::Result<Vec<Value>> {
    let mut stmt = conn.prepare(&format!(
        "{MATERIAL_SELECT} WHERE {where_sql} ORDER BY m.uploaded_at DESC, m.title LIMIT {limit} OFFSET {offset}"
    ))?;
    let rows = stmt
        .query_map(binds, material_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

struct MaterialRef {
    course_id: String,
    stored_path: String,
    original_name: String,
    size_bytes: i64,
    uploader_id: Option<String>,
}

fn load_material(conn: &Connection, id: &str) -> rusqlite::Result<Option<MaterialRef>> {
    conn.query_row(
        "SELECT course_id, stored_path, original_name, size_bytes, uploader_id FROM materials WHERE id = ?",
        [id],
        |r| {
            Ok(MaterialRef {
                course_id: r.get(0)?,
                stored_path: r.get(1)?,
                original_name: r.get(2)?,
                size_bytes: r.get(3)?,
                uploader_id: r.get(4)?,
            })
        },
    )
    .optional()
}

fn handle_upload(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let ws = workspace(state, req)?;
    let p = params(req)?;
    let course_id = need_str(req, p, "courseId")?;
    owned_course(conn, req, &user, &course_id)?;
    let title = opt_str(req, p, "title")?
        .ok_or_else(|| invalid(req, "title", "title is required"))?;
    if title.chars().count() > 200 {
        return Err(invalid(req, "title", "title must be at most 200 characters"));
    }
    let source = need_str(req, p, "sourcePath")?;
    let upload = storage::inspect_upload(Path::new(&source)).map_err(|e| match e {
        UploadError::Missing(_) => err(&req.id, "not_found", e.to_string(), None),
        UploadError::Io(_) => err(&req.id, "io_failed", e.to_string(), None),
        _ => invalid(req, "file", e.to_string()),
    })?;
    let kind = match opt_str(req, p, "kind")? {
        None => upload.kind,
        Some(raw) => MaterialKind::parse(&raw)
            .ok_or_else(|| invalid(req, "kind", "kind must be PDF, TXT or DOCX"))?,
    };

    let id = new_id();
    let now = state.clock.now();
    let stored_path = storage::store(ws, &upload, &id, now)
        .map_err(|e| err(&req.id, "io_failed", e.to_string(), None))?;
    let inserted = conn.execute(
        "INSERT INTO materials(id, course_id, title, stored_path, original_name, kind, size_bytes, uploaded_at, uploader_id)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            id,
            course_id,
            title,
            stored_path,
            upload.original_name,
            kind.as_str(),
            upload.size_bytes as i64,
            fmt_date_time(now),
            user.id
        ],
    );
    if let Err(e) = inserted {
        let _ = storage::remove(ws, &stored_path);
        return Err(db_err(req, "db_insert_failed", e));
    }
    log::info!(
        "event=material_uploaded id={id} course={course_id} kind={} bytes={}",
        kind.as_str(),
        upload.size_bytes
    );
    let material = select_materials(conn, "m.id = ?1", params![id], 1, 0)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .into_iter()
        .next()
        .ok_or_else(|| not_found(req, "material"))?;
    Ok(json!({ "materialId": id, "material": material }))
}

fn handle_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let page = Page::from_params(req, p, PAGE_SIZE)?;

    let mut clauses: Vec<String> = vec!["s.owner_id = ?1".into()];
    let mut binds: Vec<Box<dyn ToSql>> = Vec::new();
    binds.push(Box::new(user.id.clone()));
    if let Some(q) = opt_str(req, p, "search")? {
        let n = binds.len() + 1;
        clauses.push(format!(
            "(m.title LIKE ?{n} ESCAPE '\\' OR c.name LIKE ?{n} ESCAPE '\\')"
        ));
        binds.push(Box::new(like_pattern(&q)));
    }
    if let Some(raw) = opt_str(req, p, "kind")? {
        let kind = MaterialKind::parse(&raw)
            .ok_or_else(|| invalid(req, "kind", "kind must be PDF, TXT or DOCX"))?;
        clauses.push(format!("m.kind = ?{}", binds.len() + 1));
        binds.push(Box::new(kind.as_str()));
    }
    if let Some(course_id) = opt_str(req, p, "courseId")? {
        clauses.push(format!("m.course_id = ?{}", binds.len() + 1));
        binds.push(Box::new(course_id));
    }
    let where_sql = clauses.join(" AND ");
    let refs: Vec<&dyn ToSql> = binds.iter().map(|b| b.as_ref()).collect();

    let total: i64 = conn
        .query_row(
            &format!(
                "SELECT COUNT(*) FROM materials m JOIN courses c ON c.id = m.course_id
                 JOIN semesters s ON s.id = c.semester_id WHERE {where_sql}"
            ),
            refs.as_slice(),
            |r| r.get(0),
        )
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    let materials = select_materials(conn, &where_sql, &refs, page.size, page.offset())
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    Ok(json!({ "materials": materials, "pagination": page.meta(total) }))
}

fn handle_download(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let ws = workspace(state, req)?;
    let p = params(req)?;
    let material_id = need_str(req, p, "materialId")?;
    let m = load_material(conn, &material_id)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .ok_or_else(|| not_found(req, "material"))?;
    visible_course(conn, req, &user, &m.course_id)?;

    let path = storage::resolve(ws, &m.stored_path);
    if !path.is_file() {
        return Err(err(&req.id, "not_found", "material file is missing", None));
    }
    let copied_to = match opt_str(req, p, "outPath")? {
        None => None,
        Some(out) => {
            std::fs::copy(&path, &out)
                .map_err(|e| err(&req.id, "io_failed", e.to_string(), None))?;
            Some(out)
        }
    };
    Ok(json!({
        "path": path.to_string_lossy(),
        "fileName": m.original_name,
        "mimeType": storage::mime_for(&m.original_name),
        "sizeLabel": storage::human_size(m.size_bytes.max(0) as u64),
        "copiedTo": copied_to,
    }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let ws = workspace(state, req)?;
    let material_id = need_str(req, params(req)?, "materialId")?;
    let m = load_material(conn, &material_id)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .ok_or_else(|| not_found(req, "material"))?;
    let is_uploader = m.uploader_id.as_deref() == Some(user.id.as_str());
    if !is_uploader && !user.staff && !user.superuser {
        return Err(forbidden(req, "only the uploader can delete this material"));
    }
    conn.execute("DELETE FROM materials WHERE id = ?", [&material_id])
        .map_err(|e| db_err(req, "db_delete_failed", e))?;
    if let Err(e) = storage::remove(ws, &m.stored_path) {
        log::warn!("event=material_file_remove_failed path={} err={e}", m.stored_path);
    }
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "materials.upload" => handle_upload(state, req),
        "materials.list" => handle_list(state, req),
        "materials.download" => handle_download(state, req),
        "materials.delete" => handle_delete(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
