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

//! The block-device capability: everything the lifecycle engine needs from
//! the remote Ceph cluster and the host kernel, behind one trait so tests can
//! substitute an in-memory fake. The vocabulary of the underlying tools stays
//! below this boundary.

mod cli;

pub use cli::RbdCli;

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use crate::rbdvol::logger;
use crate::rbdvol::util::error::{find_in_chain, DynResult};

pub type OpsFuture<T> = Pin<Box<dyn Future<Output = DynResult<T>> + Send>>;

/// Operations on RBD images and their host-side mappings. Each call respects
/// the configured command deadline and may fail with an error whose chain
/// carries the tool diagnostics.
pub trait RbdOps: Send + Sync {
    fn image_exists(&self, pool: &str, image: &str) -> OpsFuture<bool>;

    /// Provisions a formatted image: create, temporary lock, map,
    /// `mkfs.<fstype>`, unmap, unlock. Compensates earlier steps in reverse
    /// order when a later one fails.
    fn create_image(&self, pool: &str, image: &str, size_mb: u32, fstype: &str) -> OpsFuture<()>;

    fn remove_image(&self, pool: &str, image: &str) -> OpsFuture<()>;

    fn rename_image(&self, pool: &str, image: &str, new_name: &str) -> OpsFuture<()>;

    /// Image names in a pool, for List.
    fn list_images(&self, pool: &str) -> OpsFuture<Vec<String>>;

    /// Takes the advisory exclusive lock under the given cookie.
    fn lock_image(&self, pool: &str, image: &str, cookie: &str) -> OpsFuture<()>;

    /// Releases the advisory lock held under the cookie, discovering the
    /// remote client id when the tool requires it.
    fn unlock_image(&self, pool: &str, image: &str, cookie: &str) -> OpsFuture<()>;

    /// Maps the image into the host kernel, returning the device path.
    fn map_image(&self, pool: &str, image: &str) -> OpsFuture<String>;

    /// Unmaps a kernel device. Fails with a [`DeviceBusy`] in the error chain
    /// when the device is still in use.
    fn unmap_device(&self, device: &str) -> OpsFuture<()>;

    /// Filesystem type on the device, or an error when it cannot be told.
    fn detect_fstype(&self, device: &str) -> OpsFuture<String>;

    /// Sanity-checks the filesystem before mounting; XFS gets the read-only
    /// repair probe with a mount/unmount retry on reported corruption.
    fn verify_filesystem(&self, device: &str, fstype: &str, mountpoint: &Path) -> OpsFuture<()>;

    fn mount_device(&self, device: &str, mountpoint: &Path, fstype: &str) -> OpsFuture<()>;

    fn unmount_device(&self, device: &str) -> OpsFuture<()>;
}

/// A kernel device could not be unmapped because something still uses it,
/// typically a container whose mount namespace kept the filesystem alive
/// after the host-side umount.
#[derive(Debug)]
pub struct DeviceBusy {
    pub device: String,
}

impl fmt::Display for DeviceBusy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device {} is still in use", self.device)
    }
}

impl Error for DeviceBusy {}

pub fn is_device_busy(err: &(dyn Error + 'static)) -> bool {
    find_in_chain::<DeviceBusy>(err).is_some()
}

/// The cookie identifying this host's advisory locks: the hostname, or
/// `HOST_UNKNOWN` when it cannot be read.
pub fn local_locker_cookie() -> String {
    match nix::unistd::gethostname() {
        Ok(hostname) => hostname.to_string_lossy().into_owned(),
        Err(err) => {
            logger::warn("rbd", "Unable to read hostname for locker cookie")
                .err(&err)
                .emit();
            "HOST_UNKNOWN".to_string()
        }
    }
}
