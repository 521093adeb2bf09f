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

//! Bounded-timeout execution of external commands.
//!
//! Every tool this daemon drives (`rbd`, `blkid`, `mount`, `umount`,
//! `xfs_repair`, `mkfs.*`) runs through here so that a hung command cannot
//! wedge the daemon and, transitively, the container runtime.

use std::env;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time;

use crate::rbdvol::logger;
use crate::rbdvol::util::error::{find_in_chain, new_error, with_context, DynResult};

const SHELL_COMPONENT: &str = "shell";

/// mkfs on a multi-gigabyte image takes a while; it gets its own deadline
/// instead of the configured per-command one.
pub const MKFS_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// A command exceeded its deadline. The child process is killed.
#[derive(Debug)]
pub struct ShellTimeout {
    pub program: String,
    pub timeout: Duration,
}

impl fmt::Display for ShellTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' did not finish within {:?}",
            self.program, self.timeout
        )
    }
}

impl Error for ShellTimeout {}

/// A command ran to completion but exited unsuccessfully. Captured stderr is
/// kept for diagnostics; the exit status lets callers branch on tool-specific
/// codes (`rbd unmap` exits 16 when the device is busy).
#[derive(Debug)]
pub struct CommandFailure {
    pub program: String,
    pub status: Option<i32>,
    pub stderr: String,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "'{}' exited with status {}", self.program, code)?,
            None => write!(f, "'{}' was terminated by a signal", self.program)?,
        }
        if !self.stderr.is_empty() {
            write!(f, ": {}", self.stderr)?;
        }
        Ok(())
    }
}

impl Error for CommandFailure {}

pub fn is_timeout_error(err: &(dyn Error + 'static)) -> bool {
    find_in_chain::<ShellTimeout>(err).is_some()
}

/// Runs a command, returning trimmed stdout on success, [`ShellTimeout`] when
/// the deadline elapses, and [`CommandFailure`] on unsuccessful exit. A zero
/// timeout is a programming error and fails fast.
pub async fn run_with_timeout(
    timeout: Duration,
    program: &str,
    args: &[&str],
) -> DynResult<String> {
    if timeout.is_zero() {
        return Err(new_error("Shell timeout must be positive"));
    }

    logger::debug(SHELL_COMPONENT, "Running command")
        .field("program", program)
        .field("args", args.join(" "))
        .field("timeout", format!("{:?}", timeout))
        .emit();

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command
        .spawn()
        .map_err(|e| with_context(e, format!("Failed to spawn '{}'", program)))?;

    // Dropping the wait future on timeout kills the child via kill_on_drop.
    let output = match time::timeout(timeout, child.wait_with_output()).await {
        Ok(waited) => waited
            .map_err(|e| with_context(e, format!("Failed to collect output of '{}'", program)))?,
        Err(_) => {
            return Err(Box::new(ShellTimeout {
                program: program.to_string(),
                timeout,
            }))
        }
    };

    if !output.status.success() {
        return Err(Box::new(CommandFailure {
            program: program.to_string(),
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Resolves a program name against `PATH`, the way the shell would.
pub fn lookup_program(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
