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

//! The volume lifecycle engine.
//!
//! Turns Docker's volume verbs into sequences of block-device operations
//! under two exclusion mechanisms: the remote advisory lock keeps other hosts
//! away from an image, and one driver-wide mutex serializes this host's
//! mutating verbs end to end, external commands included.
//!
//! Every multi-step verb unwinds the steps that already succeeded, in
//! reverse order, when a later one fails; unwind failures are logged but the
//! caller sees the original error.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::name::parse_volume_name;
use super::registry::{MountRegistry, MountedVolume};
use crate::rbdvol::config::{DriverConfig, RemoveAction};
use crate::rbdvol::logger;
use crate::rbdvol::observability::metrics;
use crate::rbdvol::rbd::{is_device_busy, local_locker_cookie, RbdOps};
use crate::rbdvol::util::error::{new_error, with_context, DynResult};

const VOLUME_COMPONENT: &str = "volume";

const MOUNTPOINT_MODE: u32 = 0o775;

/// What Get and List report per volume: the image name and, when this host
/// has it mounted, the mountpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeStatus {
    pub name: String,
    pub mountpoint: Option<PathBuf>,
}

pub struct VolumeDriver {
    config: DriverConfig,
    rbd: Arc<dyn RbdOps>,
    // Doubles as the engine-wide verb lock: mutating verbs hold the guard
    // for their entire duration, including external command execution, which
    // is why this is the async mutex. Known mounts disappear on restart; an
    // Unmount for a mountpoint we no longer know about succeeds silently
    // rather than tearing down state another container may still use.
    volumes: Mutex<MountRegistry>,
}

impl VolumeDriver {
    pub fn new(config: DriverConfig, rbd: Arc<dyn RbdOps>) -> Self {
        logger::info(VOLUME_COMPONENT, "Volume driver ready")
            .field("plugin", config.plugin_name.as_str())
            .field("pool", config.pool.as_str())
            .field("mount_root", config.mount_root.display().to_string())
            .emit();
        Self {
            config,
            rbd,
            volumes: Mutex::new(MountRegistry::new()),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Waits for the in-flight mutating verb, if any, to finish. Used by the
    /// server's graceful shutdown.
    pub async fn quiesce(&self) {
        let _guard = self.volumes.lock().await;
    }

    /// Ensures the named image exists, provisioning it when allowed. Does not
    /// mount and does not touch the registry beyond the idempotency check.
    pub async fn create(&self, name: &str, opts: &HashMap<String, String>) -> DynResult<()> {
        logger::info(VOLUME_COMPONENT, "API Create").name(name).emit();
        let volumes = self.volumes.lock().await;

        let parsed = parse_volume_name(name, &self.config.pool, self.config.default_size_mb)?;
        let mut pool = parsed.pool;
        let mut size_mb = parsed.size_mb;
        let mut fstype = self.config.default_fstype.clone();

        // `docker volume create -o pool=… -o size=… -o fstype=…`
        if let Some(opt) = opts.get("pool").filter(|v| !v.is_empty()) {
            pool = opt.clone();
        }
        if let Some(opt) = opts.get("size").filter(|v| !v.is_empty()) {
            match opt.parse::<u32>() {
                Ok(parsed_size) if parsed_size > 0 => size_mb = parsed_size,
                _ => logger::warn(VOLUME_COMPONENT, "Using default size; size option did not parse")
                    .name(name)
                    .field("size", opt.as_str())
                    .emit(),
            }
        }
        if let Some(opt) = opts.get("fstype").filter(|v| !v.is_empty()) {
            fstype = opt.clone();
        }

        let mountpoint = self.config.mountpoint(&pool, &parsed.image);
        if volumes.contains(&mountpoint) {
            logger::info(VOLUME_COMPONENT, "Volume is already in known mounts")
                .mountpoint(&mountpoint)
                .emit();
            return Ok(());
        }

        if self.rbd.image_exists(&pool, &parsed.image).await? {
            return Ok(());
        }

        if !self.config.can_create {
            let message = format!("Ceph RBD Image not found: {}", parsed.image);
            logger::error(VOLUME_COMPONENT, message.as_str()).emit();
            return Err(new_error(message));
        }

        self.rbd
            .create_image(&pool, &parsed.image, size_mb, &fstype)
            .await
            .map_err(|e| {
                let message = format!("Unable to create Ceph RBD Image({}): {}", parsed.image, e);
                logger::error(VOLUME_COMPONENT, message.as_str()).emit();
                new_error(message)
            })?;
        Ok(())
    }

    /// Locks, maps, verifies and mounts the image, then records the volume.
    /// Each failure releases exactly what was acquired, newest first.
    pub async fn mount(&self, name: &str, client_id: &str) -> DynResult<PathBuf> {
        logger::info(VOLUME_COMPONENT, "API Mount")
            .name(name)
            .client(client_id)
            .emit();
        let mut volumes = self.volumes.lock().await;

        let parsed = parse_volume_name(name, &self.config.pool, self.config.default_size_mb)?;
        let mountpoint = self.config.mountpoint(&parsed.pool, &parsed.image);

        let locker = local_locker_cookie();
        if let Err(err) = self
            .rbd
            .lock_image(&parsed.pool, &parsed.image, &locker)
            .await
        {
            logger::error(VOLUME_COMPONENT, "Unable to lock image for mount")
                .name(name)
                .err(&err)
                .emit();
            return Err(new_error("Unable to get Exclusive Lock"));
        }

        let device = match self.rbd.map_image(&parsed.pool, &parsed.image).await {
            Ok(device) => device,
            Err(err) => {
                logger::error(VOLUME_COMPONENT, "Unable to map image to a kernel device")
                    .name(name)
                    .err(&err)
                    .emit();
                self.unlock_quietly(&parsed.pool, &parsed.image, &locker).await;
                return Err(new_error("Unable to map kernel device"));
            }
        };

        let fstype = match self.rbd.detect_fstype(&device).await {
            Ok(fstype) => fstype,
            Err(err) => {
                // Not fatal: a freshly created image formatted with the
                // configured default is the common case here.
                logger::warn(
                    VOLUME_COMPONENT,
                    "Unable to detect filesystem type; assuming the default",
                )
                .device(&device)
                .field("fstype", self.config.default_fstype.as_str())
                .err(&err)
                .emit();
                self.config.default_fstype.clone()
            }
        };

        if let Err(err) = self
            .rbd
            .verify_filesystem(&device, &fstype, &mountpoint)
            .await
        {
            logger::error(VOLUME_COMPONENT, "Filesystem verification failed")
                .device(&device)
                .err(&err)
                .emit();
            self.unmap_quietly(&device).await;
            self.unlock_quietly(&parsed.pool, &parsed.image, &locker).await;
            return Err(new_error(
                "Image filesystem has errors, requires manual repairs",
            ));
        }

        if let Err(err) = ensure_mountpoint(&mountpoint) {
            logger::error(VOLUME_COMPONENT, "Unable to create mount directory")
                .mountpoint(&mountpoint)
                .err(&err)
                .emit();
            self.unmap_quietly(&device).await;
            self.unlock_quietly(&parsed.pool, &parsed.image, &locker).await;
            return Err(new_error("Unable to make mountdir"));
        }

        if let Err(err) = self.rbd.mount_device(&device, &mountpoint, &fstype).await {
            logger::error(VOLUME_COMPONENT, "Unable to mount device")
                .device(&device)
                .mountpoint(&mountpoint)
                .err(&err)
                .emit();
            self.unmap_quietly(&device).await;
            self.unlock_quietly(&parsed.pool, &parsed.image, &locker).await;
            return Err(new_error("Unable to mount device"));
        }

        volumes.insert(
            mountpoint.clone(),
            MountedVolume {
                name: parsed.image,
                pool: parsed.pool,
                device,
                fstype,
                locker,
                client_id: client_id.to_string(),
            },
        );
        metrics::set_mounted_volumes(volumes.len());

        Ok(mountpoint)
    }

    /// Tears a volume down. Unknown mountpoints and mismatched client ids
    /// succeed silently; teardown errors accumulate instead of stopping the
    /// later steps, except that a busy device aborts immediately (it is still
    /// in use inside a container, and releasing the lock would invite another
    /// host in).
    pub async fn unmount(&self, name: &str, client_id: &str) -> DynResult<()> {
        logger::info(VOLUME_COMPONENT, "API Unmount")
            .name(name)
            .client(client_id)
            .emit();
        let mut volumes = self.volumes.lock().await;

        let parsed = parse_volume_name(name, &self.config.pool, self.config.default_size_mb)?;
        let mountpoint = self.config.mountpoint(&parsed.pool, &parsed.image);

        let record = match volumes.get(&mountpoint) {
            Some(record) => record.clone(),
            None => {
                // The runtime retries Unmount after failed Mounts, and this
                // registry forgets everything on restart.
                logger::warn(
                    VOLUME_COMPONENT,
                    "Volume is not in known mounts; ignoring unmount request",
                )
                .volume(&parsed.pool, &parsed.image)
                .emit();
                return Ok(());
            }
        };

        if record.client_id != client_id {
            logger::warn(
                VOLUME_COMPONENT,
                "Unmount client id does not match the mount owner; ignoring",
            )
            .volume(&parsed.pool, &parsed.image)
            .field("owner", record.client_id.as_str())
            .field("requestor", client_id)
            .emit();
            return Ok(());
        }

        let mut failures: Vec<&'static str> = Vec::new();

        if let Err(err) = self.rbd.unmount_device(&record.device).await {
            logger::error(VOLUME_COMPONENT, "Error unmounting device")
                .device(&record.device)
                .err(&err)
                .emit();
            failures.push("Error unmounting device");
        }

        if let Err(err) = self.rbd.unmap_device(&record.device).await {
            if is_device_busy(err.as_ref()) {
                // The host-side view is already gone from the umount above;
                // anything further (unlock, forgetting the record) would be
                // actively harmful while a container still uses the device.
                logger::warn(VOLUME_COMPONENT, "Device busy during unmap; aborting unmount")
                    .device(&record.device)
                    .emit();
                return Err(err);
            }
            logger::error(VOLUME_COMPONENT, "Error unmapping kernel device")
                .device(&record.device)
                .err(&err)
                .emit();
            failures.push("Error unmapping kernel device");
        }

        if let Err(err) = self
            .rbd
            .unlock_image(&record.pool, &record.name, &record.locker)
            .await
        {
            logger::error(VOLUME_COMPONENT, "Error unlocking image")
                .volume(&record.pool, &record.name)
                .err(&err)
                .emit();
            failures.push("Error unlocking image");
        }

        volumes.remove(&mountpoint);
        metrics::set_mounted_volumes(volumes.len());

        if failures.is_empty() {
            Ok(())
        } else {
            Err(new_error(failures.join(", ")))
        }
    }

    /// Applies the configured remove action to the backing image, holding
    /// the advisory lock across it. A deleted image takes its lock with it,
    /// so that unlock is best-effort; a renamed image keeps the lock under
    /// the new name.
    pub async fn remove(&self, name: &str) -> DynResult<()> {
        logger::info(VOLUME_COMPONENT, "API Remove").name(name).emit();
        let mut volumes = self.volumes.lock().await;

        let parsed = parse_volume_name(name, &self.config.pool, self.config.default_size_mb)?;
        let mountpoint = self.config.mountpoint(&parsed.pool, &parsed.image);

        if !volumes.contains(&mountpoint) {
            logger::warn(VOLUME_COMPONENT, "Volume is not in known mounts")
                .mountpoint(&mountpoint)
                .emit();
        }

        if !self.rbd.image_exists(&parsed.pool, &parsed.image).await? {
            let message = format!("Ceph RBD Image not found: {}", parsed.image);
            logger::error(VOLUME_COMPONENT, message.as_str()).emit();
            return Err(new_error(message));
        }

        let locker = local_locker_cookie();
        if let Err(err) = self
            .rbd
            .lock_image(&parsed.pool, &parsed.image, &locker)
            .await
        {
            logger::error(VOLUME_COMPONENT, "Unable to lock image for remove")
                .volume(&parsed.pool, &parsed.image)
                .err(&err)
                .emit();
            return Err(new_error(format!(
                "Unable to lock image for remove: {}",
                parsed.image
            )));
        }

        match self.config.remove_action {
            RemoveAction::Delete => {
                if let Err(err) = self.rbd.remove_image(&parsed.pool, &parsed.image).await {
                    let message =
                        format!("Unable to remove Ceph RBD Image({}): {}", parsed.image, err);
                    logger::error(VOLUME_COMPONENT, message.as_str()).emit();
                    self.unlock_quietly(&parsed.pool, &parsed.image, &locker).await;
                    return Err(new_error(message));
                }
                self.unlock_quietly(&parsed.pool, &parsed.image, &locker).await;
            }
            RemoveAction::Rename => {
                let parked = format!("zz_{}", parsed.image);
                if let Err(err) = self
                    .rbd
                    .rename_image(&parsed.pool, &parsed.image, &parked)
                    .await
                {
                    let message = format!(
                        "Unable to rename with zz_ prefix: RBD Image({}): {}",
                        parsed.image, err
                    );
                    logger::error(VOLUME_COMPONENT, message.as_str()).emit();
                    self.unlock_quietly(&parsed.pool, &parsed.image, &locker).await;
                    return Err(new_error(message));
                }
                // The lock travelled with the image.
                self.unlock_quietly(&parsed.pool, &parked, &locker).await;
            }
            RemoveAction::Ignore => {
                self.unlock_quietly(&parsed.pool, &parsed.image, &locker).await;
            }
        }

        volumes.remove(&mountpoint);
        metrics::set_mounted_volumes(volumes.len());
        Ok(())
    }

    /// Reports whether the image exists and where it is mounted on this
    /// host. A registry entry for an image that no longer exists is stale
    /// and gets dropped on the way out.
    pub async fn get(&self, name: &str) -> DynResult<VolumeStatus> {
        let parsed = parse_volume_name(name, &self.config.pool, self.config.default_size_mb)?;
        let exists = self.rbd.image_exists(&parsed.pool, &parsed.image).await?;
        let mountpoint = self.config.mountpoint(&parsed.pool, &parsed.image);

        let mut volumes = self.volumes.lock().await;
        if !exists {
            logger::warn(VOLUME_COMPONENT, "Image does not exist")
                .name(name)
                .emit();
            volumes.remove(&mountpoint);
            metrics::set_mounted_volumes(volumes.len());
            return Err(new_error(format!("Image {name} does not exist")));
        }

        let mounted = volumes.contains(&mountpoint);
        Ok(VolumeStatus {
            name: name.to_string(),
            mountpoint: mounted.then_some(mountpoint),
        })
    }

    /// Enumerates images in the default pool. Images in other pools exist
    /// and can be mounted by name, but are not listed here.
    pub async fn list(&self) -> DynResult<Vec<VolumeStatus>> {
        let names = self.rbd.list_images(&self.config.pool).await?;
        let volumes = self.volumes.lock().await;

        Ok(names
            .into_iter()
            .map(|name| {
                let mountpoint = self.config.mountpoint(&self.config.pool, &name);
                let mounted = volumes.contains(&mountpoint);
                VolumeStatus {
                    name,
                    mountpoint: mounted.then_some(mountpoint),
                }
            })
            .collect())
    }

    /// The mountpoint the volume would occupy. Purely computational; does
    /// not check that the image exists or is mounted.
    pub fn path(&self, name: &str) -> DynResult<PathBuf> {
        let parsed = parse_volume_name(name, &self.config.pool, self.config.default_size_mb)?;
        Ok(self.config.mountpoint(&parsed.pool, &parsed.image))
    }

    async fn unlock_quietly(&self, pool: &str, image: &str, cookie: &str) {
        if let Err(err) = self.rbd.unlock_image(pool, image, cookie).await {
            logger::warn(VOLUME_COMPONENT, "Cleanup unlock failed")
                .volume(pool, image)
                .err(&err)
                .emit();
        }
    }

    async fn unmap_quietly(&self, device: &str) {
        if let Err(err) = self.rbd.unmap_device(device).await {
            logger::warn(VOLUME_COMPONENT, "Cleanup unmap failed")
                .device(device)
                .err(&err)
                .emit();
        }
    }
}

fn ensure_mountpoint(mountpoint: &Path) -> DynResult<()> {
    fs::create_dir_all(mountpoint).map_err(|e| {
        with_context(
            e,
            format!("Failed to create mountpoint {}", mountpoint.display()),
        )
    })?;
    fs::set_permissions(mountpoint, fs::Permissions::from_mode(MOUNTPOINT_MODE)).map_err(|e| {
        with_context(
            e,
            format!(
                "Failed to set permissions on mountpoint {}",
                mountpoint.display()
            ),
        )
    })?;
    Ok(())
}
