use std::io;

use axum::body::Body;
use axum::extract::multipart::{Multipart, MultipartError, MultipartRejection};
use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use taric_commit::{CommitError, PublishRequest};
use taric_index::{IndexEntry, Scheduled};
use taric_types::{DeltaDate, ModTime, Seq};
use tracing::{debug, info};

use crate::error::{ServerError, ServerResult};
use crate::state::AppState;

/// Multipart field carrying the uploaded file.
pub const FILE_FIELD: &str = "file";

#[derive(Debug, Default, Deserialize)]
pub struct UploadParams {
    pub modtime: Option<String>,
}

pub async fn healthcheck() -> &'static str {
    "OK"
}

pub async fn root() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// GET /taricdeltas, /taricdeltas/
pub async fn deltas_default(State(state): State<AppState>) -> ServerResult<Json<Vec<IndexEntry>>> {
    deltas_on(&state, DeltaDate::yesterday()).await
}

/// GET /taricdeltas/{date}
pub async fn deltas_for_date(
    State(state): State<AppState>,
    Path(date): Path<String>,
) -> ServerResult<Json<Vec<IndexEntry>>> {
    let date = DeltaDate::parse(&date).map_err(|_| ServerError::InvalidDate(date))?;
    deltas_on(&state, date).await
}

async fn deltas_on(state: &AppState, date: DeltaDate) -> ServerResult<Json<Vec<IndexEntry>>> {
    let doc = state.index().load().await?;
    let entries: Vec<IndexEntry> = doc.on_date(&date).into_iter().cloned().collect();
    if entries.is_empty() {
        return Err(ServerError::NoDeltas(date));
    }
    debug!(%date, count = entries.len(), "delta entries listed");
    Ok(Json(entries))
}

/// Any /taricfiles request without a seq.
pub async fn missing_seq() -> ServerError {
    ServerError::InvalidSeq(String::new())
}

/// GET /taricfiles/{seq}
pub async fn get_file(State(state): State<AppState>, Path(seq): Path<String>) -> ServerResult<Response> {
    let seq = parse_seq(seq)?;
    let opened = state.protocol().open(seq).await?;
    debug!(%seq, size = opened.size, "streaming delta file");
    let headers = [
        (CONTENT_TYPE, HeaderValue::from_static("text/xml")),
        (CONTENT_LENGTH, HeaderValue::from(opened.size)),
    ];
    Ok((headers, Body::from_stream(opened.stream)).into_response())
}

/// POST /taricfiles/{seq}?modtime=...
///
/// The `file` field is staged as it arrives; other fields are skipped.
pub async fn upload_file(
    State(state): State<AppState>,
    Path(seq): Path<String>,
    Query(params): Query<UploadParams>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ServerResult<(StatusCode, &'static str)> {
    let seq = parse_seq(seq)?;
    let modtime = params
        .modtime
        .map(|raw| ModTime::parse(&raw).map_err(|_| ServerError::InvalidModTime(raw)))
        .transpose()?;
    let mut multipart = multipart.map_err(|e| {
        debug!(%seq, error = %e, "upload is not multipart");
        ServerError::NoFile
    })?;
    let limit = state.max_upload();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, limit))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        if field.file_name().map_or(true, str::is_empty) {
            return Err(ServerError::NoFile);
        }

        let mut request = PublishRequest::streaming(seq, field.map_err(io::Error::other).boxed());
        if let Some(modtime) = modtime {
            request = request.with_modtime(modtime);
        }
        let receipt = state.protocol().publish(request).await.map_err(|e| match e {
            CommitError::Upload(e) => body_error(e, limit),
            other => other.into(),
        })?;
        info!(%seq, size = receipt.entry.size, replaced = receipt.replaced, "upload accepted");
        return Ok((StatusCode::OK, "200 OK File uploaded"));
    }
    Err(ServerError::NoFile)
}

/// DELETE /taricfiles/{seq}
///
/// The index entry is dropped by the reconciliation scheduled here.
pub async fn delete_file(
    State(state): State<AppState>,
    Path(seq): Path<String>,
) -> ServerResult<(StatusCode, &'static str)> {
    let seq = parse_seq(seq)?;
    let removed = state.protocol().remove(seq).await?;
    schedule_rebuild(&state);
    if removed {
        Ok((StatusCode::OK, "200 OK File removed"))
    } else {
        Ok((StatusCode::OK, "200 OK File not present"))
    }
}

/// POST /rebuildindex
pub async fn rebuild_index(State(state): State<AppState>) -> (StatusCode, &'static str) {
    schedule_rebuild(&state);
    (StatusCode::ACCEPTED, "202 Index rebuild scheduled")
}

fn schedule_rebuild(state: &AppState) {
    match state.reconciler().schedule() {
        Scheduled::Started(_) => info!("index rebuild started"),
        Scheduled::Coalesced => info!("index rebuild already running, request coalesced"),
    }
}

fn parse_seq(raw: String) -> ServerResult<Seq> {
    Seq::parse(&raw).map_err(|_| ServerError::InvalidSeq(raw))
}

fn multipart_error(e: MultipartError, limit: usize) -> ServerError {
    multipart_error_ref(&e, limit)
}

fn multipart_error_ref(e: &MultipartError, limit: usize) -> ServerError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ServerError::UploadTooLarge { limit }
    } else {
        ServerError::BadUpload(e.body_text())
    }
}

/// Map a failure reading the file field back to the multipart error behind it.
fn body_error(e: io::Error, limit: usize) -> ServerError {
    let Some(inner) = e.into_inner() else {
        return ServerError::BadUpload("unreadable upload".into());
    };
    match inner.downcast_ref::<MultipartError>() {
        Some(multipart) => multipart_error_ref(multipart, limit),
        None => ServerError::BadUpload(inner.to_string()),
    }
}
