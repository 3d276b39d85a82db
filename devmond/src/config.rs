/*
 * Copyright (c) Meta Platforms, Inc. and its affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::os::unix::io::RawFd;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;

/// Where the broker serves queries. Re-created on every start.
pub const CONTROL_SOCKET_PATH: &str = protocol::SOCKET_PATH;

/// Presence of this file means we are inside a container and must not
/// touch the host's device model.
pub const CONTAINER_SENTINEL: &str = "/run/dinit/container";

pub const DEFAULT_SYSTEM_SERVICE: &str = "system";

pub const ENV_DUMMY_MODE: &str = "DINIT_DEVMON_DUMMY_MODE";
pub const ENV_CONTAINER: &str = "DINIT_CONTAINER";
pub const ENV_CS_FD: &str = "DINIT_CS_FD";
pub const ENV_SYSTEM_SERVICE: &str = "DINIT_SYSTEM_SERVICE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Run without a device source; every query resolves unavailable.
    pub dummy_mode: bool,
    /// Already-open supervisor session inherited from the environment.
    pub supervisor_fd: Option<RawFd>,
    /// Root service the device services hang off.
    pub system_service: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(
            |key| std::env::var(key).ok(),
            Path::new(CONTAINER_SENTINEL).exists(),
        )
    }

    fn from_lookup(env: impl Fn(&str) -> Option<String>, container_sentinel: bool) -> Result<Self> {
        let dummy_mode = env(ENV_DUMMY_MODE).is_some()
            || env(ENV_CONTAINER).as_deref() == Some("1")
            || container_sentinel;
        let supervisor_fd = env(ENV_CS_FD)
            .map(|v| {
                v.parse::<RawFd>()
                    .with_context(|| format!("{} is not a file descriptor: {:?}", ENV_CS_FD, v))
            })
            .transpose()?;
        let system_service =
            env(ENV_SYSTEM_SERVICE).unwrap_or_else(|| DEFAULT_SYSTEM_SERVICE.to_owned());
        Ok(Self {
            dummy_mode,
            supervisor_fd,
            system_service,
        })
    }
}
