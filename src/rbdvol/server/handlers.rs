/*
 * Copyright (C) 2025 The Rbdvol Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Thin adapter between the protocol verbs and the lifecycle engine. Errors
//! travel in-band as the `Err` field with HTTP 500; success is 200 with an
//! empty `Err`.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::rbdvol::api::{
    ActivateResponse, CapabilitiesResponse, CapabilityScope, CreateRequest, ErrorResponse,
    GetResponse, ListResponse, MountRequest, MountResponse, NameRequest, PathResponse,
    UnmountRequest, VolumeInfo,
};
use crate::rbdvol::observability::metrics;
use crate::rbdvol::util::error::DynResult;
use crate::rbdvol::volume::{VolumeDriver, VolumeStatus};

pub(super) type AppState = Arc<VolumeDriver>;

fn finish<T: serde::Serialize>(
    op: &str,
    started: Instant,
    result: DynResult<T>,
    on_error: impl FnOnce(String) -> T,
) -> Response {
    match result {
        Ok(body) => {
            metrics::record_operation(op, "ok", started.elapsed());
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => {
            metrics::record_operation(op, "error", started.elapsed());
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(on_error(err.to_string())),
            )
                .into_response()
        }
    }
}

fn volume_info(status: VolumeStatus) -> VolumeInfo {
    VolumeInfo {
        name: status.name,
        mountpoint: status
            .mountpoint
            .map(|path| path.display().to_string())
            .unwrap_or_default(),
    }
}

pub(super) async fn activate() -> Json<ActivateResponse> {
    Json(ActivateResponse {
        implements: vec!["VolumeDriver".to_string()],
    })
}

pub(super) async fn capabilities() -> Json<CapabilitiesResponse> {
    // Images live on the cluster, so any host running this plugin can serve
    // them: global scope.
    Json(CapabilitiesResponse {
        capabilities: CapabilityScope {
            scope: "global".to_string(),
        },
    })
}

pub(super) async fn create(
    State(driver): State<AppState>,
    Json(request): Json<CreateRequest>,
) -> Response {
    let started = Instant::now();
    let opts = request.opts.unwrap_or_default();
    let result = driver
        .create(&request.name, &opts)
        .await
        .map(|()| ErrorResponse::default());
    finish("create", started, result, |err| ErrorResponse { err })
}

pub(super) async fn remove(
    State(driver): State<AppState>,
    Json(request): Json<NameRequest>,
) -> Response {
    let started = Instant::now();
    let result = driver
        .remove(&request.name)
        .await
        .map(|()| ErrorResponse::default());
    finish("remove", started, result, |err| ErrorResponse { err })
}

pub(super) async fn mount(
    State(driver): State<AppState>,
    Json(request): Json<MountRequest>,
) -> Response {
    let started = Instant::now();
    let result = driver
        .mount(&request.name, &request.id)
        .await
        .map(|mountpoint| MountResponse {
            mountpoint: mountpoint.display().to_string(),
            err: String::new(),
        });
    finish("mount", started, result, |err| MountResponse {
        mountpoint: String::new(),
        err,
    })
}

pub(super) async fn unmount(
    State(driver): State<AppState>,
    Json(request): Json<UnmountRequest>,
) -> Response {
    let started = Instant::now();
    let result = driver
        .unmount(&request.name, &request.id)
        .await
        .map(|()| ErrorResponse::default());
    finish("unmount", started, result, |err| ErrorResponse { err })
}

pub(super) async fn path(
    State(driver): State<AppState>,
    Json(request): Json<NameRequest>,
) -> Response {
    let started = Instant::now();
    let result = driver.path(&request.name).map(|mountpoint| PathResponse {
        mountpoint: mountpoint.display().to_string(),
        err: String::new(),
    });
    finish("path", started, result, |err| PathResponse {
        mountpoint: String::new(),
        err,
    })
}

pub(super) async fn get(
    State(driver): State<AppState>,
    Json(request): Json<NameRequest>,
) -> Response {
    let started = Instant::now();
    let result = driver.get(&request.name).await.map(|status| GetResponse {
        volume: Some(volume_info(status)),
        err: String::new(),
    });
    finish("get", started, result, |err| GetResponse {
        volume: None,
        err,
    })
}

pub(super) async fn list(State(driver): State<AppState>) -> Response {
    let started = Instant::now();
    let result = driver.list().await.map(|statuses| ListResponse {
        volumes: statuses.into_iter().map(volume_info).collect(),
        err: String::new(),
    });
    finish("list", started, result, |err| ListResponse {
        volumes: Vec::new(),
        err,
    })
}

pub(super) async fn metrics_endpoint() -> Response {
    match metrics::render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}
