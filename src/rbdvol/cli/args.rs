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

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::rbdvol::config::{DriverConfig, RemoveAction};
use crate::rbdvol::logger::LogFormat;

/// Ceph RBD volume plugin for Docker.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct RbdVol {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the volume plugin daemon
    Serve(ServeArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// Plugin name, used for the socket and the Docker --volume-driver option
    #[arg(long, default_value = "rbd")]
    pub name: String,

    /// Ceph user
    #[arg(long, default_value = "admin")]
    pub user: String,

    /// Ceph cluster configuration file (empty lets rbd pick its default)
    #[arg(long, default_value = "")]
    pub config: String,

    /// Default Ceph pool for RBD operations
    #[arg(long, default_value = "rbd")]
    pub pool: String,

    /// Docker plugin directory for the Unix socket
    #[arg(long, default_value = "/run/docker/plugins")]
    pub plugins: PathBuf,

    /// Base mount directory for volumes on the host
    #[arg(long, default_value = "/var/lib/docker/volumes")]
    pub mount: PathBuf,

    /// Allow provisioning of RBD images that do not exist yet
    #[arg(long)]
    pub create: bool,

    /// What to do with the backing image when a volume is removed
    #[arg(long, value_enum, default_value = "ignore")]
    pub remove_action: RemoveAction,

    /// RBD image size in MB for created images
    #[arg(long, default_value_t = 20 * 1024)]
    pub size: u32,

    /// Filesystem type for created images (requires mkfs.<type> on PATH)
    #[arg(long = "fs", default_value = "xfs")]
    pub fstype: String,

    /// Deadline for external commands, e.g. "2m" or "90s"
    #[arg(long, value_parser = humantime::parse_duration, default_value = "2m")]
    pub shell_timeout: Duration,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    pub log_format: LogFormatArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

impl ServeArgs {
    /// Collapses the flags into the one configuration value the rest of the
    /// daemon sees. The mount root gains the plugin name so multiple plugin
    /// instances never collide under the Docker volume directory.
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            plugin_name: self.name.clone(),
            pool: self.pool.clone(),
            user: self.user.clone(),
            cluster_config: self.config.clone(),
            default_size_mb: self.size,
            default_fstype: self.fstype.clone(),
            mount_root: self.mount.join(&self.name),
            socket_dir: self.plugins.clone(),
            remove_action: self.remove_action,
            can_create: self.create,
            shell_timeout: self.shell_timeout,
        }
    }
}
