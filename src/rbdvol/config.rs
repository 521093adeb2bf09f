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

use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;

/// What happens to the backing RBD image when Docker removes the volume.
///
/// `Rename` parks the image under a `zz_` prefix so an operator (or a cleanup
/// script) can decide its fate later; `Delete` destroys it for real.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RemoveAction {
    Ignore,
    Delete,
    Rename,
}

/// Everything the daemon needs to know, fixed at startup. Built once from the
/// CLI flags and passed explicitly; there is no ambient configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Plugin name; names the socket and the Docker `--volume-driver` value.
    pub plugin_name: String,
    /// Default Ceph pool for images named without one.
    pub pool: String,
    /// Ceph user passed to `rbd --id`.
    pub user: String,
    /// Ceph cluster configuration file passed to `rbd --conf`; empty means
    /// the tool's own default.
    pub cluster_config: String,
    /// Size in MB for images created without an explicit `@size`.
    pub default_size_mb: u32,
    /// Filesystem type for created images; `mkfs.<type>` must be on PATH.
    pub default_fstype: String,
    /// Root under which per-volume mountpoints are created,
    /// `<root>/<pool>/<image>`. Already includes the plugin name.
    pub mount_root: PathBuf,
    /// Directory holding the plugin Unix socket.
    pub socket_dir: PathBuf,
    pub remove_action: RemoveAction,
    /// Whether missing images may be provisioned by `Create`.
    pub can_create: bool,
    /// Deadline for external commands (mkfs uses its own, longer one).
    pub shell_timeout: Duration,
}

impl DriverConfig {
    pub fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(format!("{}.sock", self.plugin_name))
    }

    pub fn mountpoint(&self, pool: &str, image: &str) -> PathBuf {
        self.mount_root.join(pool).join(image)
    }
}
