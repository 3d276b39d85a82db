/*
 * Copyright (c) Meta Platforms, Inc. and its affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Mirrors tagged devices into the supervisor. Every tagged device owns a
//! synthetic `device@<syspath>` service wired as a soft dependency of the
//! root service, with the services named in its WAITS_FOR property wired
//! as soft dependencies of the device service.
//!
//! The supervisor conversation for one device must never interleave, so
//! each device funnels its events through a single driver: intake
//! coalesces the newest event into `next_deps`/`pending`/`removal`, and
//! the driver performs one operation at a time, re-reading the coalesced
//! state in between.

use std::collections::BTreeSet;

use dinit_client::Dinit;
use dinit_client::ServiceHandle;
use dinit_client::ServiceState;
use slog::error;
use slog::trace;
use slog::warn;

use crate::broker::Broker;
use crate::broker::SharedBroker;
use crate::table::BridgeIntake;

pub const DEVICE_SERVICE_PREFIX: &str = "device@";

/// Event-serialization state carried by every device record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeState {
    /// A driver task is running for this device.
    pub processing: bool,
    /// An event is waiting for the driver to pick up.
    pub pending: bool,
    /// The waiting event is a removal.
    pub removal: bool,
    /// Dependencies actually wired in the supervisor.
    pub current_deps: BTreeSet<String>,
    /// Dependencies targeted by the operation in flight.
    pub pending_deps: BTreeSet<String>,
    /// Dependencies parsed from the most recent event.
    pub next_deps: BTreeSet<String>,
    /// Device-service handle held while an operation is in flight.
    pub handle: Option<ServiceHandle>,
}

/// WAITS_FOR is whitespace-separated service names; empty or absent
/// means no dependencies.
pub fn parse_waits_for(value: Option<&str>) -> BTreeSet<String> {
    value.map_or_else(BTreeSet::new, |v| {
        v.split_whitespace().map(str::to_owned).collect()
    })
}

/// Record the latest event for a device and start a driver if none is
/// running.
pub fn intake(core: &SharedBroker, intake: BridgeIntake) {
    let spawn = {
        let mut broker = core.borrow_mut();
        let dev = match broker.table.get_mut(&intake.key) {
            Some(dev) => dev,
            None => return,
        };
        let state = &mut dev.bridge;
        state.next_deps = intake.deps;
        state.pending = true;
        state.removal = intake.removal;
        if state.processing {
            false
        } else {
            state.processing = true;
            true
        }
    };
    if spawn {
        let core = core.clone();
        tokio::task::spawn_local(drive(core, intake.key));
    }
}

enum Step {
    Done {
        close: Option<ServiceHandle>,
    },
    Op {
        close: Option<ServiceHandle>,
        removal: bool,
        to_remove: BTreeSet<String>,
        to_add: BTreeSet<String>,
    },
}

async fn drive(core: SharedBroker, key: String) {
    if let Err(e) = drive_inner(&core, &key).await {
        let broker = core.borrow();
        error!(broker.log, "supervisor wiring for {} failed: {:#}", key, e);
        let _ = broker.fatal_tx.send(e);
    }
}

async fn drive_inner(core: &SharedBroker, key: &str) -> anyhow::Result<()> {
    let (dinit, root) = {
        let broker = core.borrow();
        (broker.dinit.clone(), broker.root)
    };
    let service = format!("{}{}", DEVICE_SERVICE_PREFIX, key);
    let mut finished = None;
    loop {
        let step = core.borrow_mut().bridge_step(key, finished.take());
        let (removal, to_remove, to_add) = match step {
            Step::Done { close } => {
                if let Some(handle) = close {
                    dinit.close_service_handle(handle).await?;
                }
                return Ok(());
            }
            Step::Op {
                close,
                removal,
                to_remove,
                to_add,
            } => {
                if let Some(handle) = close {
                    dinit.close_service_handle(handle).await?;
                }
                (removal, to_remove, to_add)
            }
        };

        let mut held = None;
        if let Some((handle, state)) = dinit.load_service(&service, removal).await? {
            dinit.add_dependency(root, handle, removal, true).await?;
            if !removal && state != ServiceState::Started {
                // freshly wired; waiters on the device service must be
                // re-evaluated
                dinit.wake_service(handle).await?;
            }
            let wiring: Vec<_> = to_remove
                .iter()
                .map(|name| wire_dep(&dinit, handle, name, true))
                .chain(to_add.iter().map(|name| wire_dep(&dinit, handle, name, false)))
                .collect();
            futures::future::try_join_all(wiring).await?;
            held = Some(handle);
        }
        core.borrow_mut().bridge_store_handle(key, held);
        finished = Some(removal);
    }
}

/// One dependency edit from the device service to a named service. A
/// service that cannot be loaded is a no-op.
async fn wire_dep(
    dinit: &Dinit,
    device: ServiceHandle,
    name: &str,
    remove: bool,
) -> dinit_client::Result<()> {
    if let Some((handle, _)) = dinit.load_service(name, true).await? {
        dinit.add_dependency(device, handle, remove, true).await?;
        dinit.close_service_handle(handle).await?;
    }
    Ok(())
}

impl Broker {
    /// Account for a finished operation (terminal notification, handle
    /// release, dep-set rotation) and hand the driver its next one.
    fn bridge_step(&mut self, key: &str, finished: Option<bool>) -> Step {
        let mut notification = None;
        let mut finalize = false;
        let step = match self.table.get_mut(key) {
            None => {
                warn!(self.log, "bridge driver for unknown device {}", key);
                Step::Done { close: None }
            }
            Some(dev) => {
                let close = dev.bridge.handle.take();
                if let Some(was_removal) = finished {
                    dev.bridge.current_deps = std::mem::take(&mut dev.bridge.pending_deps);
                    let status = if was_removal {
                        protocol::STATUS_UNAVAILABLE
                    } else {
                        protocol::STATUS_AVAILABLE
                    };
                    notification = Some((dev.match_spec(), status));
                }
                if !dev.bridge.pending {
                    dev.bridge.processing = false;
                    finalize = dev.removed;
                    Step::Done { close }
                } else {
                    dev.bridge.pending = false;
                    dev.bridge.pending_deps = std::mem::take(&mut dev.bridge.next_deps);
                    trace!(
                        self.log,
                        "dispatching {} for {}",
                        if dev.bridge.removal { "removal" } else { "wiring" },
                        key
                    );
                    Step::Op {
                        close,
                        removal: dev.bridge.removal,
                        to_remove: dev.bridge.current_deps.clone(),
                        to_add: dev.bridge.pending_deps.clone(),
                    }
                }
            }
        };
        if finalize {
            self.table.finalize(key);
        }
        if let Some((spec, status)) = notification {
            self.registry.notify(&spec, status);
        }
        step
    }

    fn bridge_store_handle(&mut self, key: &str, handle: Option<ServiceHandle>) {
        match self.table.get_mut(key) {
            Some(dev) => dev.bridge.handle = handle,
            None => warn!(self.log, "device {} vanished mid-operation", key),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use anyhow::Result;
    use device_source::Action;
    use device_source::Descriptor;
    use device_source::FilterClass;
    use pretty_assertions::assert_eq;
    use protocol::QueryKind;
    use protocol::STATUS_AVAILABLE;
    use protocol::STATUS_UNAVAILABLE;
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;
    use crate::broker;
    use crate::testutil::new_broker;
    use crate::testutil::wait_for;
    use crate::testutil::SupervisorOp;

    fn tagged_desc(syspath: &str, waits_for: Option<&str>) -> Descriptor {
        Descriptor {
            action: Action::Add,
            syspath: syspath.to_owned(),
            subsystem: Some("disk".to_owned()),
            sysname: "x".to_owned(),
            devnode: Some("/dev/x".to_owned()),
            devnum: None,
            mac: None,
            vendor: None,
            product: None,
            waits_for: waits_for.map(str::to_owned),
            tags: ["dinit".to_owned()].into_iter().collect(),
        }
    }

    #[test]
    fn waits_for_parsing() {
        assert_eq!(parse_waits_for(None), BTreeSet::new());
        assert_eq!(parse_waits_for(Some("")), BTreeSet::new());
        assert_eq!(
            parse_waits_for(Some("  a   b ")),
            ["a", "b"].into_iter().map(str::to_owned).collect()
        );
    }

    #[tokio::test]
    async fn wires_device_service_and_deps() -> Result<()> {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (core, ops) = new_broker().await?;
                broker::handle_event(
                    &core,
                    FilterClass::Tagged,
                    &tagged_desc("/sys/x", Some("a b")),
                    false,
                );
                // mid-operation the device is not yet ready
                assert_eq!(
                    core.borrow().table.query(QueryKind::Syspath, "/sys/x"),
                    STATUS_UNAVAILABLE
                );
                // the handle release is the last thing the driver does
                wait_for(|| {
                    ops.borrow().last() == Some(&SupervisorOp::Close("device@/sys/x".to_owned()))
                })
                .await?;

                let ops = ops.borrow();
                assert_eq!(ops[0], SupervisorOp::Load("system".to_owned()));
                assert_eq!(ops[1], SupervisorOp::Load("device@/sys/x".to_owned()));
                assert_eq!(
                    ops[2],
                    SupervisorOp::AddDep {
                        from: "system".to_owned(),
                        to: "device@/sys/x".to_owned(),
                    }
                );
                assert_eq!(ops[3], SupervisorOp::Wake("device@/sys/x".to_owned()));
                for dep in ["a", "b"] {
                    assert!(ops.contains(&SupervisorOp::Load(dep.to_owned())));
                    assert!(ops.contains(&SupervisorOp::AddDep {
                        from: "device@/sys/x".to_owned(),
                        to: dep.to_owned(),
                    }));
                }
                // the device handle is released only after the wiring
                assert_eq!(
                    ops.last(),
                    Some(&SupervisorOp::Close("device@/sys/x".to_owned()))
                );
                Ok(())
            })
            .await
    }

    #[tokio::test]
    async fn device_becomes_available_after_wiring() -> Result<()> {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (core, _ops) = new_broker().await?;
                let (tx, mut rx) = unbounded_channel();
                let (_id, initial) =
                    core.borrow_mut()
                        .subscribe(QueryKind::Syspath, "/sys/x".to_owned(), tx);
                assert_eq!(initial, STATUS_UNAVAILABLE);

                broker::handle_event(
                    &core,
                    FilterClass::Tagged,
                    &tagged_desc("/sys/x", None),
                    false,
                );
                wait_for(|| !core.borrow().table.get("/sys/x").unwrap().bridge.processing)
                    .await?;
                assert_eq!(rx.try_recv()?, STATUS_AVAILABLE);
                assert_eq!(
                    core.borrow().table.query(QueryKind::Syspath, "/sys/x"),
                    STATUS_AVAILABLE
                );
                Ok(())
            })
            .await
    }

    #[tokio::test]
    async fn burst_coalesces_to_latest_deps() -> Result<()> {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (core, ops) = new_broker().await?;
                // both events land before the driver gets to run; only
                // the latest WAITS_FOR may be wired
                broker::handle_event(
                    &core,
                    FilterClass::Tagged,
                    &tagged_desc("/sys/x", Some("a")),
                    false,
                );
                let mut change = tagged_desc("/sys/x", Some("b"));
                change.action = Action::Change;
                broker::handle_event(&core, FilterClass::Tagged, &change, false);
                wait_for(|| !core.borrow().table.get("/sys/x").unwrap().bridge.processing)
                    .await?;

                let ops = ops.borrow();
                assert!(!ops.iter().any(|op| matches!(
                    op,
                    SupervisorOp::AddDep { to, .. } if to == "a"
                )));
                assert!(ops.contains(&SupervisorOp::AddDep {
                    from: "device@/sys/x".to_owned(),
                    to: "b".to_owned(),
                }));
                Ok(())
            })
            .await
    }

    #[tokio::test]
    async fn rewires_on_changed_waits_for() -> Result<()> {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (core, ops) = new_broker().await?;
                broker::handle_event(
                    &core,
                    FilterClass::Tagged,
                    &tagged_desc("/sys/x", Some("a")),
                    false,
                );
                wait_for(|| !core.borrow().table.get("/sys/x").unwrap().bridge.processing)
                    .await?;
                let mut change = tagged_desc("/sys/x", Some("b"));
                change.action = Action::Change;
                broker::handle_event(&core, FilterClass::Tagged, &change, false);
                wait_for(|| !core.borrow().table.get("/sys/x").unwrap().bridge.processing)
                    .await?;

                let ops = ops.borrow();
                // second operation unwires a and wires b
                assert!(ops.contains(&SupervisorOp::RemDep {
                    from: "device@/sys/x".to_owned(),
                    to: "a".to_owned(),
                }));
                assert!(ops.contains(&SupervisorOp::AddDep {
                    from: "device@/sys/x".to_owned(),
                    to: "b".to_owned(),
                }));
                let dev = core.borrow();
                let dev = dev.table.get("/sys/x").unwrap();
                assert_eq!(
                    dev.bridge.current_deps,
                    ["b"].into_iter().map(str::to_owned).collect::<BTreeSet<_>>()
                );
                Ok(())
            })
            .await
    }

    #[tokio::test]
    async fn removal_unwires_and_finalizes() -> Result<()> {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (core, ops) = new_broker().await?;
                let (tx, mut rx) = unbounded_channel();
                core.borrow_mut()
                    .subscribe(QueryKind::Syspath, "/sys/x".to_owned(), tx);

                broker::handle_event(
                    &core,
                    FilterClass::Tagged,
                    &tagged_desc("/sys/x", Some("a")),
                    false,
                );
                wait_for(|| !core.borrow().table.get("/sys/x").unwrap().bridge.processing)
                    .await?;
                assert_eq!(rx.try_recv()?, STATUS_AVAILABLE);

                let mut gone = tagged_desc("/sys/x", None);
                gone.action = Action::Remove;
                gone.tags.clear();
                broker::handle_event(&core, FilterClass::Tagged, &gone, false);
                wait_for(|| core.borrow().table.get("/sys/x").is_none()).await?;
                assert_eq!(rx.try_recv()?, STATUS_UNAVAILABLE);

                let ops = ops.borrow();
                assert!(ops.contains(&SupervisorOp::RemDep {
                    from: "system".to_owned(),
                    to: "device@/sys/x".to_owned(),
                }));
                assert!(ops.contains(&SupervisorOp::RemDep {
                    from: "device@/sys/x".to_owned(),
                    to: "a".to_owned(),
                }));
                Ok(())
            })
            .await
    }

    #[tokio::test]
    async fn missing_dep_service_is_a_noop() -> Result<()> {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (core, ops) = crate::testutil::new_broker_with(
                    ["a"].into_iter().map(str::to_owned).collect(),
                    Default::default(),
                )
                .await?;
                broker::handle_event(
                    &core,
                    FilterClass::Tagged,
                    &tagged_desc("/sys/x", Some("a")),
                    false,
                );
                wait_for(|| !core.borrow().table.get("/sys/x").unwrap().bridge.processing)
                    .await?;
                let ops = ops.borrow();
                assert!(ops.contains(&SupervisorOp::Load("a".to_owned())));
                assert!(!ops.iter().any(|op| matches!(
                    op,
                    SupervisorOp::AddDep { to, .. } if to == "a"
                )));
                Ok(())
            })
            .await
    }

    #[tokio::test]
    async fn already_started_service_is_not_woken() -> Result<()> {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (core, ops) = crate::testutil::new_broker_with(
                    Default::default(),
                    ["device@/sys/x"].into_iter().map(str::to_owned).collect(),
                )
                .await?;
                broker::handle_event(
                    &core,
                    FilterClass::Tagged,
                    &tagged_desc("/sys/x", None),
                    false,
                );
                wait_for(|| !core.borrow().table.get("/sys/x").unwrap().bridge.processing)
                    .await?;
                let ops = ops.borrow();
                assert!(!ops
                    .iter()
                    .any(|op| matches!(op, SupervisorOp::Wake(_))));
                Ok(())
            })
            .await
    }
}
