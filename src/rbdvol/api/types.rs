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

//! Wire types of the Docker volume driver protocol. Field names are fixed by
//! the protocol; an empty (or omitted) `Err` means success.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreateRequest {
    #[serde(rename = "Name")]
    pub name: String,
    /// `docker volume create -o` options; this driver understands `pool`,
    /// `size` and `fstype`.
    #[serde(rename = "Opts", default)]
    pub opts: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NameRequest {
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MountRequest {
    #[serde(rename = "Name")]
    pub name: String,
    /// Opaque per-container id; the matching Unmount carries the same one.
    #[serde(rename = "ID", default)]
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UnmountRequest {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ID", default)]
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorResponse {
    #[serde(rename = "Err")]
    pub err: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MountResponse {
    #[serde(rename = "Mountpoint")]
    pub mountpoint: String,
    #[serde(rename = "Err")]
    pub err: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PathResponse {
    #[serde(rename = "Mountpoint")]
    pub mountpoint: String,
    #[serde(rename = "Err")]
    pub err: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VolumeInfo {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Mountpoint", default, skip_serializing_if = "String::is_empty")]
    pub mountpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GetResponse {
    #[serde(rename = "Volume", skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeInfo>,
    #[serde(rename = "Err")]
    pub err: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ListResponse {
    #[serde(rename = "Volumes")]
    pub volumes: Vec<VolumeInfo>,
    #[serde(rename = "Err")]
    pub err: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityScope {
    #[serde(rename = "Scope")]
    pub scope: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitiesResponse {
    #[serde(rename = "Capabilities")]
    pub capabilities: CapabilityScope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateResponse {
    #[serde(rename = "Implements")]
    pub implements: Vec<String>,
}
