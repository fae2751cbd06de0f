//! File browser over the jailed working directory.
//!
//! - `GET    /api/fs[/path]` — list a directory or read a file
//! - `PUT    /api/fs/path`   — write a file (parents created)
//! - `DELETE /api/fs/path`   — delete a file or directory tree
//!
//! ## Path jail
//!
//! Request paths are resolved lexically (`.` and `..` collapsed, with `..`
//! clamped at the jail root) and the result must still start with the
//! absolute working-directory prefix or the request is refused. Null bytes
//! are rejected outright.
//!
//! Directory listings hide dotfiles (including the data directory) and sort
//! directories first, then by name. File reads are served raw with a
//! content type inferred from the extension.

use std::path::{Component, Path, PathBuf};

use axum::{
    body::Bytes,
    extract::{Path as UrlPath, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::state::AppState;

/// One entry in a directory listing.
#[derive(Debug, Serialize)]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub mod_time: String,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

/// Resolve a request path inside the jail. Returns the absolute target path,
/// or `None` when the path is malformed or escapes the working directory.
fn resolve_path(work_dir_abs: &Path, req_path: &str) -> Option<PathBuf> {
    if req_path.contains('\0') {
        return None;
    }

    // Lexical clean: collapse `.`, clamp `..` at the jail root.
    let mut stack: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(req_path).components() {
        match component {
            Component::Normal(c) => stack.push(c),
            Component::ParentDir => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut full = work_dir_abs.to_path_buf();
    for c in stack {
        full.push(c);
    }

    // Absolute-prefix check after resolution.
    if full.starts_with(work_dir_abs) {
        Some(full)
    } else {
        None
    }
}

async fn work_dir_abs(state: &AppState) -> Result<PathBuf, Response> {
    tokio::fs::canonicalize(&state.config.work_dir)
        .await
        .map_err(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Working directory unavailable: {e}"),
            )
        })
}

async fn resolve(state: &AppState, req_path: &str) -> Result<(PathBuf, String), Response> {
    let root = work_dir_abs(state).await?;
    let clean = format!("/{}", req_path.trim_start_matches('/'));
    match resolve_path(&root, &clean) {
        Some(full) => Ok((full, clean)),
        None => Err(error_response(StatusCode::BAD_REQUEST, "Invalid path")),
    }
}

/// `GET /api/fs` — the working directory itself.
pub async fn get_root(State(state): State<AppState>) -> Response {
    get_inner(state, String::new()).await
}

/// `GET /api/fs/{path}` — read a file or list a directory.
pub async fn get_path(State(state): State<AppState>, UrlPath(path): UrlPath<String>) -> Response {
    get_inner(state, path).await
}

async fn get_inner(state: AppState, req_path: String) -> Response {
    let (full, clean) = match resolve(&state, &req_path).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let metadata = match tokio::fs::metadata(&full).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return error_response(StatusCode::NOT_FOUND, "Not found");
        }
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    if metadata.is_dir() {
        list_directory(&full, &clean).await
    } else {
        read_file(&full).await
    }
}

async fn list_directory(full: &Path, req_path: &str) -> Response {
    let mut read_dir = match tokio::fs::read_dir(full).await {
        Ok(rd) => rd,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    let mut files = Vec::new();
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        // Dotfiles (and the session data directory) stay hidden.
        if name.starts_with('.') {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let mod_time = metadata
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
            .unwrap_or_default();
        let entry_path = if req_path == "/" {
            format!("/{name}")
        } else {
            format!("{req_path}/{name}")
        };
        files.push(FileInfo {
            name,
            path: entry_path,
            is_dir: metadata.is_dir(),
            size: metadata.len(),
            mod_time,
        });
    }

    sort_listing(&mut files);

    Json(json!({"path": req_path, "files": files})).into_response()
}

/// Directories first, then by name.
fn sort_listing(files: &mut [FileInfo]) {
    files.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
}

async fn read_file(full: &Path) -> Response {
    let bytes = match tokio::fs::read(full).await {
        Ok(b) => b,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };
    let ext = full
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    (
        [(header::CONTENT_TYPE, content_type(&ext))],
        bytes,
    )
        .into_response()
}

/// `PUT /api/fs/{path}` — write the request body as the file's new contents.
pub async fn put_path(
    State(state): State<AppState>,
    UrlPath(path): UrlPath<String>,
    body: Bytes,
) -> Response {
    let (full, _) = match resolve(&state, &path).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    if let Some(parent) = full.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    }
    if let Err(e) = tokio::fs::write(&full, &body).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }
    Json(json!({"success": true})).into_response()
}

/// `DELETE /api/fs/{path}` — remove a file or directory tree.
pub async fn delete_path(
    State(state): State<AppState>,
    UrlPath(path): UrlPath<String>,
) -> Response {
    let (full, _) = match resolve(&state, &path).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let metadata = match tokio::fs::metadata(&full).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return error_response(StatusCode::NOT_FOUND, "Not found");
        }
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(&full).await
    } else {
        tokio::fs::remove_file(&full).await
    };
    match result {
        Ok(()) => Json(json!({"success": true})).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// MIME type by file extension, `text/plain` fallback.
fn content_type(ext: &str) -> &'static str {
    match ext {
        "html" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "jsx" => "application/javascript; charset=utf-8",
        "ts" | "tsx" => "application/typescript; charset=utf-8",
        "json" => "application/json; charset=utf-8",
        "xml" => "application/xml; charset=utf-8",
        "md" => "text/markdown; charset=utf-8",
        "go" => "text/x-go; charset=utf-8",
        "py" => "text/x-python; charset=utf-8",
        "rs" => "text/x-rust; charset=utf-8",
        "java" => "text/x-java; charset=utf-8",
        "c" | "h" => "text/x-c; charset=utf-8",
        "cpp" | "hpp" => "text/x-c++; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        _ => "text/plain; charset=utf-8",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_path_stays_inside_jail() {
        let root = Path::new("/home/dev/project");
        assert_eq!(
            resolve_path(root, "/src/main.rs"),
            Some(PathBuf::from("/home/dev/project/src/main.rs"))
        );
        assert_eq!(resolve_path(root, "/"), Some(root.to_path_buf()));
    }

    #[test]
    fn resolve_path_clamps_traversal() {
        let root = Path::new("/home/dev/project");
        // `..` sequences collapse but can never climb above the jail root.
        assert_eq!(
            resolve_path(root, "/../../etc/passwd"),
            Some(PathBuf::from("/home/dev/project/etc/passwd"))
        );
        assert_eq!(
            resolve_path(root, "/src/../README.md"),
            Some(PathBuf::from("/home/dev/project/README.md"))
        );
    }

    #[test]
    fn resolve_path_rejects_null_bytes() {
        let root = Path::new("/home/dev/project");
        assert_eq!(resolve_path(root, "/a\0b"), None);
    }

    #[test]
    fn listing_sorts_directories_first_then_names() {
        let mut files = vec![
            FileInfo {
                name: "zeta.rs".into(),
                path: "/zeta.rs".into(),
                is_dir: false,
                size: 1,
                mod_time: String::new(),
            },
            FileInfo {
                name: "src".into(),
                path: "/src".into(),
                is_dir: true,
                size: 0,
                mod_time: String::new(),
            },
            FileInfo {
                name: "alpha.rs".into(),
                path: "/alpha.rs".into(),
                is_dir: false,
                size: 1,
                mod_time: String::new(),
            },
            FileInfo {
                name: "docs".into(),
                path: "/docs".into(),
                is_dir: true,
                size: 0,
                mod_time: String::new(),
            },
        ];
        sort_listing(&mut files);
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["docs", "src", "alpha.rs", "zeta.rs"]);
    }

    #[test]
    fn content_types_cover_common_extensions() {
        assert_eq!(content_type("rs"), "text/x-rust; charset=utf-8");
        assert_eq!(content_type("png"), "image/png");
        assert_eq!(content_type("weird"), "text/plain; charset=utf-8");
    }
}
