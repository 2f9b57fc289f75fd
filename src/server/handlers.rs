//! HTTP request handlers.

use crate::error::{AppError, Result};
use crate::server::AppState;
use axum::{
    Json,
    body::Body,
    extract::{Multipart, State, multipart::MultipartError},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use serde_json::json;
use std::path::Path;

/// Build a response, returning 500 on error (which shouldn't happen).
fn build_response(status: StatusCode, content_type: &str, body: impl Into<Body>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(body.into())
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("Internal error"))
                .unwrap_or_default()
        })
}

/// `Content-Disposition` value for a download named `file_name`.
fn attachment(file_name: &str) -> String {
    let ascii: String = file_name
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .filter(|c| *c != '"' && *c != '\\')
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii,
        urlencoding::encode(file_name)
    )
}

// ============================================================================
// WEB PAGES
// ============================================================================

/// Index page with the upload form.
pub async fn index(State(state): State<AppState>) -> Html<String> {
    let upload = &state.config.upload;
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>{title}</title>
    <style>
        body {{ font-family: system-ui, sans-serif; max-width: 600px; margin: 2rem auto; padding: 0 1rem; }}
        h1 {{ color: #333; }}
        a {{ color: #0066cc; }}
        .upload {{ background: #f5f5f5; padding: 1rem; border-radius: 8px; margin: 1rem 0; }}
        code {{ background: #e8e8e8; padding: 0.2rem 0.4rem; border-radius: 4px; }}
    </style>
</head>
<body>
    <h1>{title}</h1>
    <form class="upload" action="/api/convert" method="post" enctype="multipart/form-data">
        <p><input type="file" name="file" accept="{accept}"></p>
        <p>Maximum size: <strong>{max_size} MB</strong></p>
        <p><button type="submit">Convert to PDF</button></p>
    </form>
    <h2>Debug</h2>
    <ul>
        <li><a href="/api/debug-info">Last conversion (JSON)</a></li>
        <li><a href="/api/debug-html">Last synthesized HTML</a></li>
        <li><a href="/health">Health</a></li>
    </ul>
</body>
</html>"#,
        title = state.config.server.title,
        accept = upload.allowed_extensions.join(","),
        max_size = upload.max_size_mb,
    );

    Html(html)
}

/// Liveness check.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "app": state.config.server.title,
    }))
}

// ============================================================================
// CONVERSION
// ============================================================================

fn multipart_error(err: MultipartError, max_size_mb: u64) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(max_size_mb)
    } else {
        AppError::BadRequest(format!("Invalid upload: {}", err.body_text()))
    }
}

/// Convert an uploaded EPUB (multipart field `file`) to PDF.
pub async fn convert(State(state): State<AppState>, mut multipart: Multipart) -> Result<Response<Body>> {
    let upload = &state.config.upload;

    let mut file = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, upload.max_size_mb))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| multipart_error(e, upload.max_size_mb))?;
        file = Some((file_name, content_type, data));
        break;
    }

    let (file_name, content_type, data) =
        file.ok_or_else(|| AppError::BadRequest("No file uploaded".to_string()))?;

    if file_name.is_empty() {
        return Err(AppError::BadRequest("No file selected".to_string()));
    }

    if !upload.extension_allowed(&file_name) {
        return Err(AppError::BadRequest(format!(
            "File type not allowed. Allowed types: {}",
            upload.allowed_extensions.join(", ")
        )));
    }

    if let Some(content_type) = &content_type
        && !upload.mime_allowed(content_type)
    {
        tracing::warn!(
            file = %file_name,
            content_type = %content_type,
            "Unexpected content type, continuing on file extension"
        );
    }

    if data.len() as u64 > upload.max_size_bytes() {
        return Err(AppError::PayloadTooLarge(upload.max_size_mb));
    }
    if data.is_empty() {
        return Err(AppError::BadRequest("Uploaded file is empty".to_string()));
    }

    let request_id = uuid::Uuid::new_v4();
    let started = std::time::Instant::now();
    tracing::info!(%request_id, file = %file_name, bytes = data.len(), "Converting upload");

    let pdf = state.convert(data.to_vec()).await?;

    tracing::info!(
        %request_id,
        bytes = pdf.len(),
        elapsed = ?started.elapsed(),
        "Conversion complete"
    );

    let stem = Path::new(&file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("converted");

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/pdf")
        .header(
            header::CONTENT_DISPOSITION,
            attachment(&format!("{}.pdf", stem)),
        )
        .header(header::CONTENT_LENGTH, pdf.len())
        .body(Body::from(pdf))
        .unwrap_or_else(|_| Response::default()))
}

// ============================================================================
// DEBUG SNAPSHOT
// ============================================================================

fn snapshot_disabled() -> AppError {
    AppError::NotFound("Debug snapshot is disabled".to_string())
}

fn no_snapshot() -> AppError {
    AppError::NotFound("No debug file found. Convert an EPUB file first.".to_string())
}

async fn snapshot_markup(state: &AppState) -> Result<String> {
    if !state.snapshot_enabled() {
        return Err(snapshot_disabled());
    }
    state.snapshot_markup().await?.ok_or_else(no_snapshot)
}

/// Size and preview of the last synthesized document.
pub async fn debug_info(State(state): State<AppState>) -> Result<impl IntoResponse> {
    if !state.snapshot_enabled() {
        return Err(snapshot_disabled());
    }

    let Some(info) = state
        .snapshot_info(state.config.debug.preview_chars)
        .await?
    else {
        return Ok(Json(json!({
            "file_exists": false,
            "message": "No debug file found. Convert an EPUB file first.",
        })));
    };

    let size_kb = (info.size as f64 / 1024.0 * 100.0).round() / 100.0;
    Ok(Json(json!({
        "file_exists": true,
        "file_size": info.size,
        "file_size_kb": size_kb,
        "preview": info.preview,
        "download_url": "/api/download-debug",
        "view_url": "/api/debug-html",
    })))
}

/// The last synthesized document as HTML.
pub async fn debug_html(State(state): State<AppState>) -> Result<Response<Body>> {
    let markup = snapshot_markup(&state).await?;
    Ok(build_response(
        StatusCode::OK,
        "text/html; charset=utf-8",
        markup,
    ))
}

/// The last synthesized document as a download.
pub async fn download_debug(State(state): State<AppState>) -> Result<Response<Body>> {
    let markup = snapshot_markup(&state).await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(header::CONTENT_DISPOSITION, attachment("debug.html"))
        .body(Body::from(markup))
        .unwrap_or_else(|_| Response::default()))
}
