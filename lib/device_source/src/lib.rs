/*
 * Copyright (c) Meta Platforms, Inc. and its affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![deny(warnings)]

//! Adapter over the kernel device model. The broker consumes two parallel
//! views of udev: a closed set of always-tracked subsystems and any device
//! carrying one of the opt-in supervisor tags. Events are labeled with the
//! filter that produced them so the consumer can discard tag-filter events
//! for subsystems the subsystem filter already covers.

use async_trait::async_trait;
use thiserror::Error;

mod descriptor;
mod dummy;
mod udev_source;

pub use descriptor::parse_tag_list;
pub use descriptor::Action;
pub use descriptor::Descriptor;
pub use dummy::DummySource;
pub use udev_source::UdevSource;

/// Subsystems the broker always tracks.
pub const TRACKED_SUBSYSTEMS: &[&str] = &["block", "net", "tty", "usb"];

/// Tag devices opt into supervisor integration with.
pub const TAG_PRIMARY: &str = "dinit";

/// Compatibility tag honored for rules written against the legacy
/// supervisor.
pub const TAG_COMPAT: &str = "systemd";

pub const OPT_IN_TAGS: &[&str] = &[TAG_PRIMARY, TAG_COMPAT];

/// Property naming the services that should wait on a tagged device.
pub const PROP_WAITS_FOR: &str = "WAITS_FOR";

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Udev(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Which enumeration/monitor filter produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterClass {
    /// One of [TRACKED_SUBSYSTEMS]. Authoritative for those subsystems.
    Subsystems,
    /// A device carrying one of [OPT_IN_TAGS].
    Tagged,
}

#[async_trait(?Send)]
pub trait DeviceSource {
    /// One-shot seeding pass over currently-attached devices.
    fn enumerate(&mut self) -> Result<Vec<(FilterClass, Descriptor)>>;

    /// Wait for and return the next device event.
    async fn next_event(&mut self) -> Result<(FilterClass, Descriptor)>;
}
