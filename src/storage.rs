//! Course material files: upload checks, on-disk layout under the workspace
//! `materials/` dir, and the small presentation helpers downloads need.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

use crate::db::MATERIALS_DIR;

pub const MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;
pub const ALLOWED_EXTENSIONS: [&str; 5] = ["pdf", "txt", "md", "doc", "docx"];

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("source file not found: {0}")]
    Missing(String),
    #[error("file type not allowed; use one of: {}", ALLOWED_EXTENSIONS.join(", "))]
    Extension,
    #[error("file is larger than 50 MB")]
    TooLarge,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialKind {
    Pdf,
    Txt,
    Docx,
}

impl MaterialKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PDF" => Some(Self::Pdf),
            "TXT" => Some(Self::Txt),
            "DOCX" => Some(Self::Docx),
            _ => None,
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "pdf" => Some(Self::Pdf),
            "txt" | "md" => Some(Self::Txt),
            "doc" | "docx" => Some(Self::Docx),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pdf => "PDF",
            Self::Txt => "TXT",
            Self::Docx => "DOCX",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub source: PathBuf,
    pub original_name: String,
    pub extension: String,
    pub size_bytes: u64,
    pub kind: MaterialKind,
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

pub fn inspect_upload(source: &Path) -> Result<Upload, UploadError> {
    if !source.is_file() {
        return Err(UploadError::Missing(source.to_string_lossy().to_string()));
    }
    let extension = extension_of(source)
        .filter(|e| ALLOWED_EXTENSIONS.contains(&e.as_str()))
        .ok_or(UploadError::Extension)?;
    let size_bytes = std::fs::metadata(source)?.len();
    if size_bytes > MAX_UPLOAD_BYTES {
        return Err(UploadError::TooLarge);
    }
    let kind = MaterialKind::from_extension(&extension).ok_or(UploadError::Extension)?;
    let original_name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| format!("upload.{extension}"));
    Ok(Upload {
        source: source.to_path_buf(),
        original_name,
        extension,
        size_bytes,
        kind,
    })
}

fn safe_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Copies the upload into `materials/YYYY/MM/<id>-<name>` and returns the
/// path relative to the workspace, always with `/` separators.
pub fn store(
    workspace: &Path,
    upload: &Upload,
    id: &str,
    at: NaiveDateTime,
) -> anyhow::Result<String> {
    let rel_dir = format!("{}/{}", MATERIALS_DIR, at.format("%Y/%m"));
    let dir = workspace.join(&rel_dir);
    std::fs::create_dir_all(&dir)?;
    let file_name = format!("{}-{}", id, safe_file_name(&upload.original_name));
    std::fs::copy(&upload.source, dir.join(&file_name))?;
    Ok(format!("{rel_dir}/{file_name}"))
}

pub fn resolve(workspace: &Path, stored_path: &str) -> PathBuf {
    stored_path
        .split('/')
        .fold(workspace.to_path_buf(), |acc, part| acc.join(part))
}

pub fn remove(workspace: &Path, stored_path: &str) -> std::io::Result<()> {
    match std::fs::remove_file(resolve(workspace, stored_path)) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

pub fn human_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KB {
        format!("{bytes} bytes")
    } else if b < KB * KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{:.1} MB", b / (KB * KB))
    }
}

pub fn mime_for(file_name: &str) -> &'static str {
    match extension_of(Path::new(file_name)).as_deref() {
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        Some("md") => "text/markdown",
        Some("doc") => "application/msword",
        Some("docx") => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_extensions_and_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exe = dir.path().join("virus.exe");
        std::fs::write(&exe, b"MZ").expect("write");
        assert!(matches!(inspect_upload(&exe), Err(UploadError::Extension)));
        assert!(matches!(
            inspect_upload(&dir.path().join("nope.pdf")),
            Err(UploadError::Missing(_))
        ));
    }

    #[test]
    fn stores_under_dated_dir() {
        let src_dir = tempfile::tempdir().expect("tempdir");
        let ws = tempfile::tempdir().expect("tempdir");
        let src = src_dir.path().join("Lecture Notes.MD");
        std::fs::write(&src, b"# week 1").expect("write");

        let up = inspect_upload(&src).expect("inspect");
        assert_eq!(up.kind, MaterialKind::Txt);
        assert_eq!(up.size_bytes, 8);

        let at = crate::clock::parse_date_time("2026-10-16T10:00").expect("dt");
        let rel = store(ws.path(), &up, "abc", at).expect("store");
        assert_eq!(rel, "materials/2026/10/abc-Lecture_Notes.MD");
        assert!(resolve(ws.path(), &rel).is_file());
        remove(ws.path(), &rel).expect("remove");
        remove(ws.path(), &rel).expect("second remove is a no-op");
    }

    #[test]
    fn sizes_and_mimes() {
        assert_eq!(human_size(512), "512 bytes");
        assert_eq!(human_size(1536), "1.5 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(mime_for("a.PDF"), "application/pdf");
        assert_eq!(mime_for("a.bin"), "application/octet-stream");
        assert_eq!(MaterialKind::parse("docx"), Some(MaterialKind::Docx));
    }
}
