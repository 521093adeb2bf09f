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

//! The plugin socket: Docker POSTs JSON verbs to
//! `<socket-dir>/<plugin>.sock`, one request per verb. Connections are
//! served concurrently; serialization of the actual volume work happens in
//! the engine, not here.

mod handlers;

use std::fs;
use std::io::ErrorKind;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HyperAcceptor;
use hyper_util::service::TowerToHyperService;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};

use crate::rbdvol::logger;
use crate::rbdvol::util::error::{with_context, DynResult};
use crate::rbdvol::volume::VolumeDriver;

const SERVER_COMPONENT: &str = "server";

pub fn build_router(driver: Arc<VolumeDriver>) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(handlers::activate))
        .route("/VolumeDriver.Capabilities", post(handlers::capabilities))
        .route("/VolumeDriver.Create", post(handlers::create))
        .route("/VolumeDriver.Remove", post(handlers::remove))
        .route("/VolumeDriver.Mount", post(handlers::mount))
        .route("/VolumeDriver.Unmount", post(handlers::unmount))
        .route("/VolumeDriver.Path", post(handlers::path))
        .route("/VolumeDriver.Get", post(handlers::get))
        .route("/VolumeDriver.List", post(handlers::list))
        .route("/metrics", get(handlers::metrics_endpoint))
        .with_state(driver)
}

/// Binds the plugin socket and serves until SIGTERM or SIGINT, then waits
/// for the in-flight verb to finish before returning.
pub async fn serve(driver: Arc<VolumeDriver>) -> DynResult<()> {
    let socket_path = driver.config().socket_path();

    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            with_context(
                e,
                format!("Failed to create socket directory {}", parent.display()),
            )
        })?;
    }

    // A previous instance that died hard leaves the socket file behind;
    // binding requires it gone.
    match fs::remove_file(&socket_path) {
        Ok(()) => logger::warn(SERVER_COMPONENT, "Removed stale plugin socket")
            .field("socket", socket_path.display().to_string())
            .emit(),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(with_context(
                err,
                format!("Failed to remove stale socket {}", socket_path.display()),
            ))
        }
    }

    let listener = UnixListener::bind(&socket_path).map_err(|e| {
        with_context(
            e,
            format!("Failed to bind plugin socket {}", socket_path.display()),
        )
    })?;

    let app = build_router(driver.clone());
    logger::info(SERVER_COMPONENT, "Volume plugin listening")
        .field("socket", socket_path.display().to_string())
        .field("plugin", driver.config().plugin_name.as_str())
        .emit();

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| with_context(e, "Failed to install SIGTERM handler"))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| with_context(e, "Failed to install SIGINT handler"))?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                logger::info(SERVER_COMPONENT, "Received SIGTERM; shutting down").emit();
                break;
            }
            _ = sigint.recv() => {
                logger::info(SERVER_COMPONENT, "Received SIGINT; shutting down").emit();
                break;
            }
            accepted = listener.accept() => {
                let (stream, _addr) = accepted
                    .map_err(|e| with_context(e, "Failed to accept connection on plugin socket"))?;
                let service = app.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = TowerToHyperService::new(service);
                    if let Err(err) = HyperAcceptor::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(io, service)
                        .await
                    {
                        let should_log = err
                            .downcast_ref::<hyper::Error>()
                            .map(|hyper_err| {
                                !(hyper_err.is_closed() || hyper_err.is_incomplete_message())
                            })
                            .unwrap_or(true);
                        if should_log {
                            logger::error(SERVER_COMPONENT, "HTTP serving error")
                                .err(&err)
                                .emit();
                        }
                    }
                });
            }
        }
    }

    // New requests are no longer accepted; let the verb in flight complete.
    driver.quiesce().await;

    if let Err(err) = fs::remove_file(&socket_path) {
        if err.kind() != ErrorKind::NotFound {
            logger::warn(SERVER_COMPONENT, "Failed to remove plugin socket during shutdown")
                .field("socket", socket_path.display().to_string())
                .err(&err)
                .emit();
        }
    }

    Ok(())
}
