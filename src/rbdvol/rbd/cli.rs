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

//! Production [`RbdOps`] backed by the `rbd` executable plus the host's
//! `blkid`, `mount`, `umount`, `xfs_repair` and `mkfs.*` tools.

use std::path::Path;
use std::time::Duration;

use super::{local_locker_cookie, DeviceBusy, OpsFuture, RbdOps};
use crate::rbdvol::logger;
use crate::rbdvol::util::error::{find_in_chain, new_error, with_context, DynResult};
use crate::rbdvol::util::shell::{
    is_timeout_error, lookup_program, run_with_timeout, CommandFailure, MKFS_TIMEOUT,
};

const RBD_COMPONENT: &str = "rbd";

/// `rbd unmap` exits with this status when the device is still open.
const UNMAP_BUSY_STATUS: i32 = 16;

#[derive(Debug, Clone)]
pub struct RbdCli {
    user: String,
    cluster_config: String,
    shell_timeout: Duration,
}

impl RbdCli {
    pub fn new(user: impl Into<String>, cluster_config: impl Into<String>, shell_timeout: Duration) -> Self {
        Self {
            user: user.into(),
            cluster_config: cluster_config.into(),
            shell_timeout,
        }
    }

    /// Invokes `rbd` with the standing `--pool`/`--conf`/`--id` flags. An
    /// empty pool (device-only commands such as unmap) or an empty
    /// config/user omits the flag and lets the tool use its defaults.
    async fn rbdsh(&self, pool: &str, args: &[&str]) -> DynResult<String> {
        let mut full_args: Vec<&str> = Vec::with_capacity(args.len() + 6);
        if !pool.is_empty() {
            full_args.push("--pool");
            full_args.push(pool);
        }
        if !self.cluster_config.is_empty() {
            full_args.push("--conf");
            full_args.push(&self.cluster_config);
        }
        if !self.user.is_empty() {
            full_args.push("--id");
            full_args.push(&self.user);
        }
        full_args.extend_from_slice(args);
        run_with_timeout(self.shell_timeout, "rbd", &full_args).await
    }

    async fn image_exists_inner(&self, pool: &str, image: &str) -> DynResult<bool> {
        // `rbd info` failing is how the tool says "no such image"; the error
        // itself is not propagated.
        match self.rbdsh(pool, &["info", image]).await {
            Ok(_) => Ok(true),
            Err(err) => {
                logger::debug(RBD_COMPONENT, "Image lookup failed; treating as absent")
                    .volume(pool, image)
                    .err(&err)
                    .emit();
                Ok(false)
            }
        }
    }

    async fn create_image_inner(
        &self,
        pool: &str,
        image: &str,
        size_mb: u32,
        fstype: &str,
    ) -> DynResult<()> {
        logger::info(RBD_COMPONENT, "Creating RBD image")
            .volume(pool, image)
            .field("size_mb", size_mb.to_string())
            .field("fstype", fstype)
            .emit();

        // An image without a filesystem is useless to Docker; refuse early
        // when we cannot format it afterwards.
        let mkfs = lookup_program(&format!("mkfs.{fstype}"))
            .ok_or_else(|| new_error(format!("Unable to find mkfs.{fstype} in PATH")))?;
        let mkfs = mkfs.to_string_lossy().into_owned();

        self.rbdsh(
            pool,
            &[
                "create",
                "--image-format",
                "2",
                "--size",
                &size_mb.to_string(),
                image,
            ],
        )
        .await
        .map_err(|e| with_context(e, format!("Failed to create image {pool}/{image}")))?;

        // Lock while formatting so no other host grabs the fresh image.
        let cookie = local_locker_cookie();
        self.lock_image_inner(pool, image, &cookie).await?;

        let device = match self.map_image_inner(pool, image).await {
            Ok(device) => device,
            Err(err) => {
                self.unlock_quietly(pool, image, &cookie).await;
                return Err(err);
            }
        };

        if let Err(err) = run_with_timeout(MKFS_TIMEOUT, &mkfs, &[&device]).await {
            self.unmap_quietly(&device).await;
            self.unlock_quietly(pool, image, &cookie).await;
            return Err(with_context(err, format!("mkfs.{fstype} failed on {device}")));
        }

        self.unmap_device_inner(&device).await?;
        self.unlock_image_inner(pool, image, &cookie).await?;
        Ok(())
    }

    async fn remove_image_inner(&self, pool: &str, image: &str) -> DynResult<()> {
        logger::info(RBD_COMPONENT, "Removing RBD image")
            .volume(pool, image)
            .emit();
        self.rbdsh(pool, &["rm", image])
            .await
            .map_err(|e| with_context(e, format!("Failed to remove image {pool}/{image}")))?;
        Ok(())
    }

    async fn rename_image_inner(&self, pool: &str, image: &str, new_name: &str) -> DynResult<()> {
        logger::info(RBD_COMPONENT, "Renaming RBD image")
            .volume(pool, image)
            .field("new_name", new_name)
            .emit();
        self.rbdsh(pool, &["rename", image, new_name])
            .await
            .map_err(|e| {
                with_context(
                    e,
                    format!("Failed to rename image {pool}/{image} to {new_name}"),
                )
            })?;
        Ok(())
    }

    async fn list_images_inner(&self, pool: &str) -> DynResult<Vec<String>> {
        let listing = self
            .rbdsh(pool, &["ls"])
            .await
            .map_err(|e| with_context(e, format!("Failed to list images in pool {pool}")))?;
        Ok(listing
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn lock_image_inner(&self, pool: &str, image: &str, cookie: &str) -> DynResult<()> {
        self.rbdsh(pool, &["lock", "add", image, cookie])
            .await
            .map_err(|e| with_context(e, format!("Failed to lock image {pool}/{image}")))?;
        Ok(())
    }

    async fn unlock_image_inner(&self, pool: &str, image: &str, cookie: &str) -> DynResult<()> {
        // `rbd lock rm` wants the remote client id as well as the cookie, and
        // only `rbd lock list` knows it.
        let listing = self
            .rbdsh(pool, &["lock", "list", image])
            .await
            .map_err(|e| with_context(e, format!("Failed to list locks on {pool}/{image}")))?;
        if listing.is_empty() {
            return Err(new_error(format!(
                "Image {pool}/{image} holds no locks to release"
            )));
        }

        let client_id = client_id_for_cookie(&listing, cookie).ok_or_else(|| {
            new_error(format!(
                "Unable to determine lock client id for cookie {cookie} on {pool}/{image}"
            ))
        })?;

        self.rbdsh(pool, &["lock", "rm", image, cookie, &client_id])
            .await
            .map_err(|e| with_context(e, format!("Failed to unlock image {pool}/{image}")))?;
        Ok(())
    }

    async fn map_image_inner(&self, pool: &str, image: &str) -> DynResult<String> {
        let device = self
            .rbdsh(pool, &["map", image])
            .await
            .map_err(|e| with_context(e, format!("Failed to map image {pool}/{image}")))?;
        // Some rbd builds print nothing on success; the kernel names the
        // device predictably in that case.
        if device.is_empty() {
            return Ok(default_device_path(pool, image));
        }
        Ok(device)
    }

    async fn unmap_device_inner(&self, device: &str) -> DynResult<()> {
        match self.rbdsh("", &["unmap", device]).await {
            Ok(_) => Ok(()),
            Err(err) => {
                if let Some(failure) = find_in_chain::<CommandFailure>(err.as_ref()) {
                    if failure.status == Some(UNMAP_BUSY_STATUS) {
                        return Err(Box::new(DeviceBusy {
                            device: device.to_string(),
                        }));
                    }
                }
                Err(with_context(err, format!("Failed to unmap device {device}")))
            }
        }
    }

    async fn detect_fstype_inner(&self, device: &str) -> DynResult<String> {
        let fstype = run_with_timeout(
            self.shell_timeout,
            "blkid",
            &["-o", "value", "-s", "TYPE", device],
        )
        .await
        .map_err(|e| with_context(e, format!("blkid failed on {device}")))?;
        if fstype.is_empty() {
            return Err(new_error(format!(
                "Unable to determine filesystem type of {device}"
            )));
        }
        Ok(fstype)
    }

    async fn verify_filesystem_inner(
        &self,
        device: &str,
        fstype: &str,
        mountpoint: &Path,
    ) -> DynResult<()> {
        // Only XFS has a cheap read-only probe worth running here.
        if fstype != "xfs" {
            return Ok(());
        }

        match self.xfs_repair_dry_run(device).await {
            Ok(()) => Ok(()),
            Err(err) if is_timeout_error(err.as_ref()) => {
                // A slow probe is not corruption; the mount itself will tell.
                logger::warn(RBD_COMPONENT, "Filesystem probe timed out; proceeding with mount")
                    .device(device)
                    .err(&err)
                    .emit();
                Ok(())
            }
            Err(err) => {
                logger::warn(
                    RBD_COMPONENT,
                    "Filesystem probe reported errors; attempting limited repair",
                )
                .device(device)
                .err(&err)
                .emit();
                self.limited_xfs_repair(device, fstype, mountpoint).await
            }
        }
    }

    /// `xfs_repair -n` exits 1 when it finds corruption, 0 when clean.
    async fn xfs_repair_dry_run(&self, device: &str) -> DynResult<()> {
        run_with_timeout(self.shell_timeout, "xfs_repair", &["-n", device]).await?;
        Ok(())
    }

    /// A mount/unmount cycle replays the XFS log, which clears the common
    /// stale-log complaint; a second dry run decides whether the image really
    /// needs manual repair.
    async fn limited_xfs_repair(
        &self,
        device: &str,
        fstype: &str,
        mountpoint: &Path,
    ) -> DynResult<()> {
        self.mount_device_inner(device, mountpoint, fstype).await?;
        self.unmount_device_inner(device).await?;
        self.xfs_repair_dry_run(device)
            .await
            .map_err(|e| with_context(e, format!("Filesystem on {device} still reports errors")))
    }

    async fn mount_device_inner(
        &self,
        device: &str,
        mountpoint: &Path,
        fstype: &str,
    ) -> DynResult<()> {
        let target = mountpoint.to_string_lossy();
        run_with_timeout(self.shell_timeout, "mount", &["-t", fstype, device, &target])
            .await
            .map_err(|e| {
                with_context(e, format!("Failed to mount {device} at {target}"))
            })?;
        Ok(())
    }

    async fn unmount_device_inner(&self, device: &str) -> DynResult<()> {
        run_with_timeout(self.shell_timeout, "umount", &[device])
            .await
            .map_err(|e| with_context(e, format!("Failed to unmount {device}")))?;
        Ok(())
    }

    async fn unlock_quietly(&self, pool: &str, image: &str, cookie: &str) {
        if let Err(err) = self.unlock_image_inner(pool, image, cookie).await {
            logger::warn(RBD_COMPONENT, "Cleanup unlock failed")
                .volume(pool, image)
                .err(&err)
                .emit();
        }
    }

    async fn unmap_quietly(&self, device: &str) {
        if let Err(err) = self.unmap_device_inner(device).await {
            logger::warn(RBD_COMPONENT, "Cleanup unmap failed")
                .device(device)
                .err(&err)
                .emit();
        }
    }
}

impl RbdOps for RbdCli {
    fn image_exists(&self, pool: &str, image: &str) -> OpsFuture<bool> {
        let this = self.clone();
        let pool = pool.to_string();
        let image = image.to_string();
        Box::pin(async move { this.image_exists_inner(&pool, &image).await })
    }

    fn create_image(&self, pool: &str, image: &str, size_mb: u32, fstype: &str) -> OpsFuture<()> {
        let this = self.clone();
        let pool = pool.to_string();
        let image = image.to_string();
        let fstype = fstype.to_string();
        Box::pin(async move { this.create_image_inner(&pool, &image, size_mb, &fstype).await })
    }

    fn remove_image(&self, pool: &str, image: &str) -> OpsFuture<()> {
        let this = self.clone();
        let pool = pool.to_string();
        let image = image.to_string();
        Box::pin(async move { this.remove_image_inner(&pool, &image).await })
    }

    fn rename_image(&self, pool: &str, image: &str, new_name: &str) -> OpsFuture<()> {
        let this = self.clone();
        let pool = pool.to_string();
        let image = image.to_string();
        let new_name = new_name.to_string();
        Box::pin(async move { this.rename_image_inner(&pool, &image, &new_name).await })
    }

    fn list_images(&self, pool: &str) -> OpsFuture<Vec<String>> {
        let this = self.clone();
        let pool = pool.to_string();
        Box::pin(async move { this.list_images_inner(&pool).await })
    }

    fn lock_image(&self, pool: &str, image: &str, cookie: &str) -> OpsFuture<()> {
        let this = self.clone();
        let pool = pool.to_string();
        let image = image.to_string();
        let cookie = cookie.to_string();
        Box::pin(async move { this.lock_image_inner(&pool, &image, &cookie).await })
    }

    fn unlock_image(&self, pool: &str, image: &str, cookie: &str) -> OpsFuture<()> {
        let this = self.clone();
        let pool = pool.to_string();
        let image = image.to_string();
        let cookie = cookie.to_string();
        Box::pin(async move { this.unlock_image_inner(&pool, &image, &cookie).await })
    }

    fn map_image(&self, pool: &str, image: &str) -> OpsFuture<String> {
        let this = self.clone();
        let pool = pool.to_string();
        let image = image.to_string();
        Box::pin(async move { this.map_image_inner(&pool, &image).await })
    }

    fn unmap_device(&self, device: &str) -> OpsFuture<()> {
        let this = self.clone();
        let device = device.to_string();
        Box::pin(async move { this.unmap_device_inner(&device).await })
    }

    fn detect_fstype(&self, device: &str) -> OpsFuture<String> {
        let this = self.clone();
        let device = device.to_string();
        Box::pin(async move { this.detect_fstype_inner(&device).await })
    }

    fn verify_filesystem(&self, device: &str, fstype: &str, mountpoint: &Path) -> OpsFuture<()> {
        let this = self.clone();
        let device = device.to_string();
        let fstype = fstype.to_string();
        let mountpoint = mountpoint.to_path_buf();
        Box::pin(async move {
            this.verify_filesystem_inner(&device, &fstype, &mountpoint)
                .await
        })
    }

    fn mount_device(&self, device: &str, mountpoint: &Path, fstype: &str) -> OpsFuture<()> {
        let this = self.clone();
        let device = device.to_string();
        let mountpoint = mountpoint.to_path_buf();
        let fstype = fstype.to_string();
        Box::pin(async move { this.mount_device_inner(&device, &mountpoint, &fstype).await })
    }

    fn unmount_device(&self, device: &str) -> OpsFuture<()> {
        let this = self.clone();
        let device = device.to_string();
        Box::pin(async move { this.unmount_device_inner(&device).await })
    }
}

fn default_device_path(pool: &str, image: &str) -> String {
    format!("/dev/rbd/{pool}/{image}")
}

/// Picks the remote client id out of `rbd lock list` output: the single line
/// mentioning the cookie starts with the client id.
fn client_id_for_cookie(listing: &str, cookie: &str) -> Option<String> {
    if cookie.is_empty() {
        return None;
    }
    let matching: Vec<&str> = listing
        .lines()
        .filter(|line| line.contains(cookie))
        .collect();
    if matching.len() != 1 {
        return None;
    }
    matching[0]
        .split_whitespace()
        .next()
        .map(|token| token.to_string())
}
