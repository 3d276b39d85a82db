/*
 * Copyright (c) Meta Platforms, Inc. and its affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::cell::RefCell;
use std::rc::Rc;

use device_source::Action;
use device_source::Descriptor;
use device_source::FilterClass;
use device_source::TRACKED_SUBSYSTEMS;
use dinit_client::Dinit;
use dinit_client::ServiceHandle;
use protocol::QueryKind;
use slog::debug;
use slog::trace;
use slog::Logger;
use tokio::sync::mpsc::UnboundedSender;

use crate::bridge;
use crate::registry::Registry;
use crate::table::DeviceTable;

/// All broker state. Mutated only between suspension points of the
/// single-threaded event loop; tasks re-borrow it and never hold a
/// borrow across an await.
pub struct Broker {
    pub log: Logger,
    pub table: DeviceTable,
    pub registry: Registry,
    pub dinit: Dinit,
    pub root: ServiceHandle,
    pub fatal_tx: UnboundedSender<anyhow::Error>,
}

pub type SharedBroker = Rc<RefCell<Broker>>;

impl Broker {
    pub fn new(
        log: Logger,
        dinit: Dinit,
        root: ServiceHandle,
        fatal_tx: UnboundedSender<anyhow::Error>,
    ) -> SharedBroker {
        Rc::new(RefCell::new(Self {
            table: DeviceTable::new(log.clone()),
            registry: Registry::new(log.clone()),
            log,
            dinit,
            root,
            fatal_tx,
        }))
    }

    /// Register a subscription and resolve its initial status in one
    /// step, so no transition can slip between the two.
    pub fn subscribe(
        &mut self,
        kind: QueryKind,
        value: String,
        tx: UnboundedSender<u8>,
    ) -> (u64, u8) {
        let status = self.table.query(kind, &value);
        let id = self.registry.add(kind, value, tx);
        (id, status)
    }

    pub fn unsubscribe(&mut self, id: u64) {
        self.registry.remove(id);
    }
}

/// Feed one device event through the table, fan resulting notifications
/// out to subscribers, and hand tagged-device work to the bridge.
/// `seeding` suppresses notifications during the initial enumeration
/// pass (no subscribers exist yet).
pub fn handle_event(core: &SharedBroker, class: FilterClass, desc: &Descriptor, seeding: bool) {
    let effects = {
        let mut broker = core.borrow_mut();
        if class == FilterClass::Tagged
            && desc
                .subsystem
                .as_deref()
                .map_or(false, |s| TRACKED_SUBSYSTEMS.contains(&s))
        {
            // the subsystem filter already covers this device; handling
            // both views would double-process it
            debug!(
                broker.log,
                "discarding tag-filter event for {}", desc.syspath
            );
            return;
        }
        match desc.action {
            Action::Add | Action::Change => broker.table.apply(desc),
            Action::Remove => broker.table.remove(desc),
            Action::Bind | Action::Unbind | Action::Other => {
                trace!(
                    broker.log,
                    "ignoring {:?} event for {}",
                    desc.action,
                    desc.syspath
                );
                return;
            }
        }
    };
    if !seeding {
        let broker = core.borrow();
        for (spec, status) in &effects.notifications {
            broker.registry.notify(spec, *status);
        }
    }
    if let Some(intake) = effects.bridge {
        bridge::intake(core, intake);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use anyhow::Result;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testutil::new_broker;

    fn block_desc(syspath: &str, tags: &[&str]) -> Descriptor {
        Descriptor {
            action: Action::Add,
            syspath: syspath.to_owned(),
            subsystem: Some("block".to_owned()),
            sysname: "sda1".to_owned(),
            devnode: Some("/dev/sda1".to_owned()),
            devnum: None,
            mac: None,
            vendor: None,
            product: None,
            waits_for: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn tag_filter_events_for_tracked_subsystems_are_discarded() -> Result<()> {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (core, _ops) = new_broker().await?;
                handle_event(
                    &core,
                    FilterClass::Tagged,
                    &block_desc("/sys/block/sda/sda1", &["dinit"]),
                    false,
                );
                assert_eq!(core.borrow().table.len(), 0);

                handle_event(
                    &core,
                    FilterClass::Subsystems,
                    &block_desc("/sys/block/sda/sda1", &[]),
                    false,
                );
                assert_eq!(core.borrow().table.len(), 1);
                Ok(())
            })
            .await
    }

    #[tokio::test]
    async fn bind_events_are_ignored() -> Result<()> {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (core, _ops) = new_broker().await?;
                let mut desc = block_desc("/sys/block/sda/sda1", &[]);
                desc.action = Action::Bind;
                desc.tags = BTreeSet::new();
                handle_event(&core, FilterClass::Subsystems, &desc, false);
                assert_eq!(core.borrow().table.len(), 0);
                Ok(())
            })
            .await
    }
}
