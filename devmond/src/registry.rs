/*
 * Copyright (c) Meta Platforms, Inc. and its affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::collections::HashMap;

use protocol::QueryKind;
use slog::trace;
use slog::Logger;
use tokio::sync::mpsc::UnboundedSender;

use crate::table::resolve_symlink;
use crate::table::MatchSpec;

/// One active subscription: the parsed query plus the channel feeding
/// status bytes to the connection task that owns it.
#[derive(Debug)]
pub struct Subscription {
    pub kind: QueryKind,
    pub value: String,
    tx: UnboundedSender<u8>,
}

pub struct Registry {
    log: Logger,
    subscriptions: HashMap<u64, Subscription>,
    next_id: u64,
}

impl Registry {
    pub fn new(log: Logger) -> Self {
        Self {
            log,
            subscriptions: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn add(&mut self, kind: QueryKind, value: String, tx: UnboundedSender<u8>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        trace!(self.log, "subscription {}: {} {:?}", id, kind, value);
        self.subscriptions
            .insert(id, Subscription { kind, value, tx });
        id
    }

    pub fn remove(&mut self, id: u64) {
        if self.subscriptions.remove(&id).is_some() {
            trace!(self.log, "subscription {} removed", id);
        }
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Fan a status byte out to every subscription the spec matches. A
    /// send failure means the connection task is already gone; it will
    /// deregister itself.
    pub fn notify(&self, spec: &MatchSpec, status: u8) {
        for (id, sub) in &self.subscriptions {
            if matches(sub, spec) {
                trace!(self.log, "notify {} -> {}", status, id);
                let _ = sub.tx.send(status);
            }
        }
    }
}

fn matches(sub: &Subscription, spec: &MatchSpec) -> bool {
    match sub.kind {
        QueryKind::Syspath | QueryKind::Usb => spec.syspath.as_deref() == Some(&*sub.value),
        QueryKind::Netif => spec.ifname.as_deref() == Some(&*sub.value),
        QueryKind::Mac => spec.mac.as_deref() == Some(&*sub.value),
        QueryKind::Devnode => match &spec.devnode {
            None => false,
            Some(node) if *node == sub.value => true,
            Some(node) => resolve_symlink(&sub.value).map_or(false, |real| real == *node),
        },
    }
}
