/*
 * Copyright (c) Meta Platforms, Inc. and its affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;

use device_source::Descriptor;
use protocol::QueryKind;
use protocol::STATUS_AVAILABLE;
use protocol::STATUS_UNAVAILABLE;
use slog::debug;
use slog::trace;
use slog::Logger;

use crate::bridge::parse_waits_for;
use crate::bridge::BridgeState;

/// One entry per canonical device. USB devices sharing a vendor:product
/// pair are merged into a single record whose `syspath` is the synthetic
/// `vendor:product` identifier and whose `devset` counts the underlying
/// kernel devices.
#[derive(Debug)]
pub struct Device {
    pub syspath: String,
    pub subsystem: String,
    /// Device node path, or the interface name for `net`. Empty while
    /// the device has neither.
    pub name: String,
    /// Hardware address, `net` only.
    pub mac: String,
    pub devset: HashSet<u64>,
    /// Sticky: set the first time the device is seen carrying an opt-in
    /// tag, never cleared, so removals still flow through the bridge.
    pub has_tag: bool,
    /// Set between the final remove event and bridge teardown.
    pub removed: bool,
    pub bridge: BridgeState,
}

impl Device {
    fn is_net(&self) -> bool {
        self.subsystem == "net"
    }

    pub fn available(&self) -> bool {
        !self.removed && !self.bridge.processing
    }

    /// The full set of values subscriptions can currently match this
    /// device by.
    pub fn match_spec(&self) -> MatchSpec {
        let mut spec = MatchSpec {
            syspath: Some(self.syspath.clone()),
            ..Default::default()
        };
        if !self.name.is_empty() {
            if self.is_net() {
                spec.ifname = Some(self.name.clone());
            } else {
                spec.devnode = Some(self.name.clone());
            }
        }
        if !self.mac.is_empty() {
            spec.mac = Some(self.mac.clone());
        }
        spec
    }
}

/// The device-side values a notification should be matched against.
/// Transition notifications that concern a single value (a rename) carry
/// only that value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSpec {
    pub syspath: Option<String>,
    pub devnode: Option<String>,
    pub ifname: Option<String>,
    pub mac: Option<String>,
}

impl MatchSpec {
    pub fn devnode(value: String) -> Self {
        Self {
            devnode: Some(value),
            ..Default::default()
        }
    }

    pub fn ifname(value: String) -> Self {
        Self {
            ifname: Some(value),
            ..Default::default()
        }
    }

    pub fn mac(value: String) -> Self {
        Self {
            mac: Some(value),
            ..Default::default()
        }
    }

    fn name(is_net: bool, value: String) -> Self {
        if is_net {
            Self::ifname(value)
        } else {
            Self::devnode(value)
        }
    }
}

/// A tagged-device event that must be funneled through the supervisor
/// bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeIntake {
    pub key: String,
    pub removal: bool,
    pub deps: BTreeSet<String>,
}

/// What a table mutation asks the caller to do: write status bytes to
/// matching subscribers, and/or feed the bridge.
#[derive(Debug, Default)]
pub struct Effects {
    pub notifications: Vec<(MatchSpec, u8)>,
    pub bridge: Option<BridgeIntake>,
}

pub struct DeviceTable {
    log: Logger,
    devices: HashMap<String, Device>,
    devnode_index: HashMap<String, String>,
    ifname_index: HashMap<String, String>,
    mac_index: HashMap<String, String>,
    usb_devnum_index: HashMap<u64, String>,
}

impl DeviceTable {
    pub fn new(log: Logger) -> Self {
        Self {
            log,
            devices: HashMap::new(),
            devnode_index: HashMap::new(),
            ifname_index: HashMap::new(),
            mac_index: HashMap::new(),
            usb_devnum_index: HashMap::new(),
        }
    }

    #[allow(dead_code)]
    pub fn get(&self, key: &str) -> Option<&Device> {
        self.devices.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Device> {
        self.devices.get_mut(key)
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Apply an add or change event.
    pub fn apply(&mut self, desc: &Descriptor) -> Effects {
        match usb_identity(desc) {
            Some((key, devnum)) => self.apply_usb(desc, key, devnum),
            None => self.apply_regular(desc),
        }
    }

    fn apply_regular(&mut self, desc: &Descriptor) -> Effects {
        let key = desc.syspath.clone();
        let is_net = desc.subsystem.as_deref() == Some("net");
        let name = if is_net {
            desc.sysname.clone()
        } else {
            desc.devnode.clone().unwrap_or_default()
        };
        let mac = if is_net {
            desc.mac.clone().unwrap_or_default()
        } else {
            String::new()
        };
        let tagged = desc.tagged();
        let mut effects = Effects::default();

        if self.devices.contains_key(&key) {
            let (old_name, old_mac, was_removed) = {
                let dev = &self.devices[&key];
                (dev.name.clone(), dev.mac.clone(), dev.removed)
            };
            // Emit 0 to subscribers of a stale value before the new
            // value is indexed and announced.
            if old_name != name {
                if !old_name.is_empty() {
                    self.unindex_name(&old_name, is_net);
                    effects
                        .notifications
                        .push((MatchSpec::name(is_net, old_name), STATUS_UNAVAILABLE));
                }
                if !name.is_empty() {
                    self.index_name(name.clone(), key.clone(), is_net);
                }
            } else if was_removed && !name.is_empty() {
                // re-added while teardown was pending; the indexes were
                // already dropped
                self.index_name(name.clone(), key.clone(), is_net);
            }
            if old_mac != mac {
                if !old_mac.is_empty() {
                    self.mac_index.remove(&old_mac);
                    effects
                        .notifications
                        .push((MatchSpec::mac(old_mac), STATUS_UNAVAILABLE));
                }
                if !mac.is_empty() {
                    self.mac_index.insert(mac.clone(), key.clone());
                }
            } else if was_removed && !mac.is_empty() {
                self.mac_index.insert(mac.clone(), key.clone());
            }

            let dev = self.devices.get_mut(&key).expect("checked above");
            let renamed = dev.name != name;
            let remacced = dev.mac != mac;
            dev.name = name.clone();
            dev.mac = mac.clone();
            dev.has_tag |= tagged;
            dev.removed = false;
            if renamed && !name.is_empty() && dev.available() {
                effects
                    .notifications
                    .push((MatchSpec::name(is_net, name), STATUS_AVAILABLE));
            }
            if remacced && !mac.is_empty() && dev.available() {
                effects
                    .notifications
                    .push((MatchSpec::mac(mac), STATUS_AVAILABLE));
            }
            if dev.has_tag {
                effects.bridge = Some(BridgeIntake {
                    key,
                    removal: false,
                    deps: parse_waits_for(desc.waits_for.as_deref()),
                });
            }
        } else {
            trace!(self.log, "new device {}", key);
            let dev = Device {
                syspath: key.clone(),
                subsystem: desc.subsystem.clone().unwrap_or_default(),
                name: name.clone(),
                mac: mac.clone(),
                devset: HashSet::new(),
                has_tag: tagged,
                removed: false,
                bridge: BridgeState::default(),
            };
            if !name.is_empty() {
                self.index_name(name, key.clone(), is_net);
            }
            if !mac.is_empty() {
                self.mac_index.insert(mac, key.clone());
            }
            if tagged {
                effects.bridge = Some(BridgeIntake {
                    key: key.clone(),
                    removal: false,
                    deps: parse_waits_for(desc.waits_for.as_deref()),
                });
            } else {
                effects
                    .notifications
                    .push((dev.match_spec(), STATUS_AVAILABLE));
            }
            self.devices.insert(key, dev);
        }
        effects
    }

    fn apply_usb(&mut self, desc: &Descriptor, key: String, devnum: u64) -> Effects {
        let tagged = desc.tagged();
        let mut effects = Effects::default();
        self.usb_devnum_index.insert(devnum, key.clone());
        if let Some(dev) = self.devices.get_mut(&key) {
            dev.devset.insert(devnum);
            dev.has_tag |= tagged;
            dev.removed = false;
            if dev.has_tag {
                effects.bridge = Some(BridgeIntake {
                    key,
                    removal: false,
                    deps: parse_waits_for(desc.waits_for.as_deref()),
                });
            }
        } else {
            trace!(self.log, "new usb device {}", key);
            let dev = Device {
                syspath: key.clone(),
                subsystem: "usb".to_owned(),
                name: String::new(),
                mac: String::new(),
                devset: HashSet::from([devnum]),
                has_tag: tagged,
                removed: false,
                bridge: BridgeState::default(),
            };
            if tagged {
                effects.bridge = Some(BridgeIntake {
                    key: key.clone(),
                    removal: false,
                    deps: parse_waits_for(desc.waits_for.as_deref()),
                });
            } else {
                effects
                    .notifications
                    .push((dev.match_spec(), STATUS_AVAILABLE));
            }
            self.devices.insert(key, dev);
        }
        effects
    }

    /// Apply a remove event. USB removals only tear the record down when
    /// the last underlying device is gone.
    pub fn remove(&mut self, desc: &Descriptor) -> Effects {
        if desc.subsystem.as_deref() == Some("usb") {
            if let Some(devnum) = desc.devnum {
                return self.remove_usb(desc, devnum);
            }
        }
        self.teardown(desc.syspath.clone(), desc)
    }

    fn remove_usb(&mut self, desc: &Descriptor, devnum: u64) -> Effects {
        let key = match self.usb_devnum_index.remove(&devnum) {
            Some(key) => key,
            None => match usb_identity(desc) {
                Some((key, _)) => key,
                None => return Effects::default(),
            },
        };
        let dev = match self.devices.get_mut(&key) {
            Some(dev) => dev,
            None => return Effects::default(),
        };
        dev.devset.remove(&devnum);
        if !dev.devset.is_empty() {
            trace!(self.log, "{} still has {} member(s)", key, dev.devset.len());
            return Effects::default();
        }
        self.teardown(key, desc)
    }

    fn teardown(&mut self, key: String, desc: &Descriptor) -> Effects {
        let mut effects = Effects::default();
        let (has_tag, already_removed) = match self.devices.get(&key) {
            Some(dev) => (dev.has_tag, dev.removed),
            None => return effects,
        };
        if already_removed {
            return effects;
        }
        debug!(self.log, "device {} removed", key);
        if has_tag {
            // the record survives until the bridge has unwired it; its
            // name/mac values stay on the record so the terminal
            // notification can still match value subscribers
            let (name, mac, is_net) = {
                let dev = self.devices.get_mut(&key).expect("checked above");
                dev.removed = true;
                (dev.name.clone(), dev.mac.clone(), dev.is_net())
            };
            if !name.is_empty() {
                self.unindex_name(&name, is_net);
            }
            if !mac.is_empty() {
                self.mac_index.remove(&mac);
            }
            effects.bridge = Some(BridgeIntake {
                key,
                removal: true,
                deps: parse_waits_for(desc.waits_for.as_deref()),
            });
        } else {
            let dev = self.devices.remove(&key).expect("checked above");
            if !dev.name.is_empty() {
                self.unindex_name(&dev.name, dev.is_net());
            }
            if !dev.mac.is_empty() {
                self.mac_index.remove(&dev.mac);
            }
            effects
                .notifications
                .push((dev.match_spec(), STATUS_UNAVAILABLE));
        }
        effects
    }

    /// Drop a removed record once the bridge has drained its events.
    pub fn finalize(&mut self, key: &str) {
        if self.devices.remove(key).is_some() {
            trace!(self.log, "device {} finalized", key);
        }
    }

    /// Resolve a query against the current table state.
    pub fn query(&self, kind: QueryKind, value: &str) -> u8 {
        let key = match kind {
            QueryKind::Syspath | QueryKind::Usb => Some(value.to_owned()),
            QueryKind::Devnode => self.resolve_devnode(value),
            QueryKind::Netif => self.ifname_index.get(value).cloned(),
            QueryKind::Mac => self.mac_index.get(value).cloned(),
        };
        match key.and_then(|k| self.devices.get(&k)) {
            Some(dev) if dev.available() => STATUS_AVAILABLE,
            _ => STATUS_UNAVAILABLE,
        }
    }

    fn resolve_devnode(&self, value: &str) -> Option<String> {
        if let Some(key) = self.devnode_index.get(value) {
            return Some(key.clone());
        }
        resolve_symlink(value).and_then(|real| self.devnode_index.get(&real).cloned())
    }

    fn index_name(&mut self, name: String, key: String, is_net: bool) {
        if is_net {
            self.ifname_index.insert(name, key);
        } else {
            self.devnode_index.insert(name, key);
        }
    }

    fn unindex_name(&mut self, name: &str, is_net: bool) {
        if is_net {
            self.ifname_index.remove(name);
        } else {
            self.devnode_index.remove(name);
        }
    }
}

fn usb_identity(desc: &Descriptor) -> Option<(String, u64)> {
    if desc.subsystem.as_deref() != Some("usb") {
        return None;
    }
    match (&desc.vendor, &desc.product, desc.devnum) {
        (Some(vendor), Some(product), Some(devnum)) => {
            Some((format!("{}:{}", vendor, product), devnum))
        }
        _ => None,
    }
}

/// Resolution rule for device-node aliases: a query value that is not a
/// known devnode but is a symlink is chased with realpath and looked up
/// again.
pub fn resolve_symlink(path: &str) -> Option<String> {
    let meta = std::fs::symlink_metadata(path).ok()?;
    if !meta.file_type().is_symlink() {
        return None;
    }
    std::fs::canonicalize(path)
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}
