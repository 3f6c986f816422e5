//! REST handlers of the dynamic mount API.
//!
//! Routes:
//!
//! ```text
//! POST   /api/v1/volumes/{volume_name}/mounts              create mount
//! GET    /api/v1/volumes/{volume_name}/mounts              list mounts
//! GET    /api/v1/volumes/{volume_name}/mounts/{mount_id}   get mount
//! DELETE /api/v1/volumes/{volume_name}/mounts/{mount_id}   delete mount
//! ```
//!
//! Error kinds map to statuses: invalid argument and reference conflicts
//! are 400, not-found is 404, quota rejection is 406, everything else 500.

use std::sync::{Arc, LazyLock};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use regex::Regex;

use crate::api::{
    ErrorBody, MountRequest, CODE_INSUFFICIENT_DISK_QUOTA, CODE_INTERNAL, CODE_INVALID_ARGUMENT,
    CODE_NOT_FOUND,
};
use crate::error::Error;
use crate::volume::Provisioner;

#[derive(Clone)]
struct AppState {
    provisioner: Arc<Provisioner>,
}

pub(crate) fn router(provisioner: Arc<Provisioner>) -> Router {
    Router::new()
        .route(
            "/api/v1/volumes/{volume_name}/mounts",
            get(list_mounts).post(create_mount),
        )
        .route(
            "/api/v1/volumes/{volume_name}/mounts/{mount_id}",
            get(get_mount).delete(delete_mount),
        )
        .with_state(AppState { provisioner })
}

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z0-9_-]+$").expect("identifier regex"));

fn check_identifier(identifier: &str) -> bool {
    !identifier.is_empty() && IDENTIFIER.is_match(identifier)
}

fn invalid_argument(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody::new(CODE_INVALID_ARGUMENT, message)),
    )
        .into_response()
}

fn error_response(err: Error) -> Response {
    let (status, code) = match &err {
        Error::InvalidArgument(_) | Error::Conflict(_) => {
            (StatusCode::BAD_REQUEST, CODE_INVALID_ARGUMENT)
        }
        Error::NotFound(_) => (StatusCode::NOT_FOUND, CODE_NOT_FOUND),
        Error::InsufficientQuota(_) => (StatusCode::NOT_ACCEPTABLE, CODE_INSUFFICIENT_DISK_QUOTA),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, CODE_INTERNAL),
    };
    (status, Json(ErrorBody::new(code, err.to_string()))).into_response()
}

async fn create_mount(
    State(state): State<AppState>,
    Path(volume_name): Path<String>,
    body: Result<Json<MountRequest>, JsonRejection>,
) -> Response {
    if !check_identifier(&volume_name) {
        return invalid_argument("volume_name is invalid");
    }

    let Json(mut req) = match body {
        Ok(body) => body,
        Err(_) => return invalid_argument("invalid JSON body"),
    };

    req.mount_id = req.mount_id.trim().to_string();
    req.reference = req.reference.trim().to_string();

    if !check_identifier(&req.mount_id) {
        return invalid_argument("mount_id is invalid");
    }
    if req.reference.is_empty() {
        return invalid_argument("reference is invalid");
    }

    match state.provisioner.create_mount(&volume_name, &req).await {
        Ok(status) => (StatusCode::CREATED, Json(status)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_mount(
    State(state): State<AppState>,
    Path((volume_name, mount_id)): Path<(String, String)>,
) -> Response {
    if !check_identifier(&volume_name) {
        return invalid_argument("volume_name is invalid");
    }
    if !check_identifier(&mount_id) {
        return invalid_argument("mount_id is invalid");
    }

    match state.provisioner.get_dynamic_mount(&volume_name, &mount_id) {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(err) if err.is_not_found() => error_response(Error::NotFound(format!(
            "volume_name {volume_name} with mount_id {mount_id} is not found"
        ))),
        Err(err) => error_response(err),
    }
}

async fn delete_mount(
    State(state): State<AppState>,
    Path((volume_name, mount_id)): Path<(String, String)>,
) -> Response {
    if !check_identifier(&volume_name) {
        return invalid_argument("volume_name is invalid");
    }
    if !check_identifier(&mount_id) {
        return invalid_argument("mount_id is invalid");
    }

    let volume_id = format!("{volume_name}/{mount_id}");
    match state.provisioner.delete_volume(&volume_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

async fn list_mounts(
    State(state): State<AppState>,
    Path(volume_name): Path<String>,
) -> Response {
    if !check_identifier(&volume_name) {
        return invalid_argument("volume_name is invalid");
    }

    match state.provisioner.list_dynamic_mounts(&volume_name) {
        Ok(statuses) => (StatusCode::OK, Json(statuses)).into_response(),
        Err(err) => error_response(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_accepts_expected_charset() {
        assert!(check_identifier("csi-dynamic-volume-0"));
        assert!(check_identifier("mount_1"));
        assert!(check_identifier("A9"));
    }

    #[test]
    fn test_identifier_rejects_bad_input() {
        assert!(!check_identifier(""));
        assert!(!check_identifier("a/b"));
        assert!(!check_identifier("a b"));
        assert!(!check_identifier("a:b"));
        assert!(!check_identifier("../escape"));
    }
}
