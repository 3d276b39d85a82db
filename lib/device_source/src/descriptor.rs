/*
 * Copyright (c) Meta Platforms, Inc. and its affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::collections::BTreeSet;

use crate::OPT_IN_TAGS;
use crate::PROP_WAITS_FOR;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Change,
    Remove,
    Bind,
    Unbind,
    Other,
}

impl From<udev::EventType> for Action {
    fn from(t: udev::EventType) -> Self {
        match t {
            udev::EventType::Add => Self::Add,
            udev::EventType::Change => Self::Change,
            udev::EventType::Remove => Self::Remove,
            udev::EventType::Bind => Self::Bind,
            udev::EventType::Unbind => Self::Unbind,
            udev::EventType::Unknown => Self::Other,
        }
    }
}

/// An owned snapshot of a udev device. udev handles are not `Send` and
/// point into library-managed memory, so everything the broker needs is
/// copied out up front (remove events in particular lose their sysfs
/// attributes shortly after delivery).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub action: Action,
    pub syspath: String,
    pub subsystem: Option<String>,
    pub sysname: String,
    pub devnode: Option<String>,
    pub devnum: Option<u64>,
    /// Hardware address, `net` devices only.
    pub mac: Option<String>,
    /// USB idVendor, lowercase hex.
    pub vendor: Option<String>,
    /// USB idProduct, lowercase hex.
    pub product: Option<String>,
    pub waits_for: Option<String>,
    pub tags: BTreeSet<String>,
}

impl Descriptor {
    pub fn from_udev(dev: &udev::Device, action: Action) -> Self {
        let prop = |name: &str| {
            dev.property_value(name)
                .map(|v| v.to_string_lossy().into_owned())
        };
        let attr = |name: &str| {
            dev.attribute_value(name)
                .map(|v| v.to_string_lossy().into_owned())
        };

        let subsystem = dev
            .subsystem()
            .map(|s| s.to_string_lossy().into_owned());

        let mac = match subsystem.as_deref() {
            Some("net") => attr("address").map(|a| a.to_lowercase()),
            _ => None,
        };
        let (vendor, product) = match subsystem.as_deref() {
            Some("usb") => (
                attr("idVendor")
                    .or_else(|| prop("ID_VENDOR_ID"))
                    .map(|v| v.to_lowercase()),
                attr("idProduct")
                    .or_else(|| prop("ID_MODEL_ID"))
                    .map(|v| v.to_lowercase()),
            ),
            _ => (None, None),
        };

        let mut tags = prop("TAGS").map_or_else(BTreeSet::new, |t| parse_tag_list(&t));
        if let Some(current) = prop("CURRENT_TAGS") {
            tags.extend(parse_tag_list(&current));
        }

        Self {
            action,
            syspath: dev.syspath().to_string_lossy().into_owned(),
            subsystem,
            sysname: dev.sysname().to_string_lossy().into_owned(),
            devnode: dev.devnode().map(|p| p.to_string_lossy().into_owned()),
            devnum: dev.devnum(),
            mac,
            vendor,
            product,
            waits_for: prop(PROP_WAITS_FOR),
            tags,
        }
    }

    /// Whether the device carries (at least) one of the opt-in tags.
    pub fn tagged(&self) -> bool {
        OPT_IN_TAGS.iter().any(|t| self.tags.contains(*t))
    }
}

/// udev encodes tag lists as `:a:b:c:`.
pub fn parse_tag_list(s: &str) -> BTreeSet<String> {
    s.split(':')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_owned())
        .collect()
}
