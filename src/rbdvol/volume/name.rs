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

use crate::rbdvol::logger;
use crate::rbdvol::util::error::{new_error, DynError, DynResult};

/// A volume name decoded from the `[pool/]image[@size]` form Docker hands us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeName {
    pub pool: String,
    pub image: String,
    pub size_mb: u32,
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

fn parse_error(fullname: &str) -> DynError {
    new_error(format!("Unable to parse volume name: {fullname}"))
}

/// Decodes `[pool/]image[@size]`. Pool and image are runs of
/// `[-_.alphanumeric]`; size is a run of decimal digits. A name that does not
/// fit the grammar is an error; a size that fits the grammar but does not
/// convert to a sensible value falls back to the default with a warning.
/// No I/O; total over all inputs.
pub fn parse_volume_name(
    fullname: &str,
    default_pool: &str,
    default_size_mb: u32,
) -> DynResult<VolumeName> {
    let (body, size_part) = match fullname.split_once('@') {
        Some((body, size)) => (body, Some(size)),
        None => (fullname, None),
    };

    let (pool_part, image) = match body.split_once('/') {
        Some((pool, image)) => (Some(pool), image),
        None => (None, body),
    };

    if image.is_empty() || !image.chars().all(is_name_char) {
        return Err(parse_error(fullname));
    }

    let pool = match pool_part {
        Some(pool) if !pool.is_empty() && pool.chars().all(is_name_char) => pool.to_string(),
        Some(_) => return Err(parse_error(fullname)),
        None => default_pool.to_string(),
    };

    let size_mb = match size_part {
        Some(size) if !size.is_empty() && size.bytes().all(|b| b.is_ascii_digit()) => {
            match size.parse::<u32>() {
                Ok(parsed) if parsed > 0 => parsed,
                _ => {
                    logger::warn("volume", "Using default size; requested size is out of range")
                        .name(fullname)
                        .field("size", size)
                        .emit();
                    default_size_mb
                }
            }
        }
        Some(_) => return Err(parse_error(fullname)),
        None => default_size_mb,
    };

    Ok(VolumeName {
        pool,
        image: image.to_string(),
        size_mb,
    })
}
