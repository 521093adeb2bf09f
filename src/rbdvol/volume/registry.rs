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

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A volume this host currently owns: remote lock held, kernel mapping
/// present, filesystem mounted. One record per mountpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedVolume {
    /// RBD image name.
    pub name: String,
    pub pool: String,
    /// Host kernel device path, e.g. `/dev/rbd/<pool>/<image>`.
    pub device: String,
    pub fstype: String,
    /// Cookie under which this host holds the advisory lock.
    pub locker: String,
    /// Opaque id the runtime supplied on Mount; Unmount must match it.
    pub client_id: String,
}

/// The host's view of its active mounts, keyed by mountpoint. In-memory only:
/// after a daemon restart the registry starts empty and pre-existing mounts
/// are simply unknown to us.
#[derive(Debug, Default)]
pub struct MountRegistry {
    volumes: HashMap<PathBuf, MountedVolume>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, mountpoint: &Path) -> Option<&MountedVolume> {
        self.volumes.get(mountpoint)
    }

    pub fn contains(&self, mountpoint: &Path) -> bool {
        self.volumes.contains_key(mountpoint)
    }

    pub fn insert(&mut self, mountpoint: PathBuf, volume: MountedVolume) {
        self.volumes.insert(mountpoint, volume);
    }

    pub fn remove(&mut self, mountpoint: &Path) -> Option<MountedVolume> {
        self.volumes.remove(mountpoint)
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }
}
