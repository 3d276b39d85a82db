/*
 * Copyright (c) Meta Platforms, Inc. and its affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::collections::HashSet;
use std::collections::VecDeque;

use async_trait::async_trait;
use slog::trace;
use slog::Logger;
use tokio::io::unix::AsyncFd;

use crate::Action;
use crate::Descriptor;
use crate::DeviceSource;
use crate::FilterClass;
use crate::Result;
use crate::OPT_IN_TAGS;
use crate::TRACKED_SUBSYSTEMS;

/// The real adapter: two netlink monitor sockets, one filtered on the
/// tracked subsystems and one on the opt-in tags, each driven through the
/// runtime's fd readiness. Must be constructed inside a runtime.
pub struct UdevSource {
    log: Logger,
    subsystems: AsyncFd<udev::MonitorSocket>,
    tagged: AsyncFd<udev::MonitorSocket>,
    queue: VecDeque<(FilterClass, Descriptor)>,
}

impl UdevSource {
    pub fn new(log: Logger) -> Result<Self> {
        let mut builder = udev::MonitorBuilder::new()?;
        for subsystem in TRACKED_SUBSYSTEMS {
            builder = builder.match_subsystem(subsystem)?;
        }
        let subsystems = AsyncFd::new(builder.listen()?)?;

        let mut builder = udev::MonitorBuilder::new()?;
        for tag in OPT_IN_TAGS {
            builder = builder.match_tag(tag)?;
        }
        let tagged = AsyncFd::new(builder.listen()?)?;

        Ok(Self {
            log,
            subsystems,
            tagged,
            queue: VecDeque::new(),
        })
    }
}

#[async_trait(?Send)]
impl DeviceSource for UdevSource {
    fn enumerate(&mut self) -> Result<Vec<(FilterClass, Descriptor)>> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();

        let mut enumerator = udev::Enumerator::new()?;
        for subsystem in TRACKED_SUBSYSTEMS {
            enumerator.match_subsystem(subsystem)?;
        }
        for dev in enumerator.scan_devices()? {
            let desc = Descriptor::from_udev(&dev, Action::Add);
            trace!(self.log, "enumerated {}", desc.syspath);
            seen.insert(desc.syspath.clone());
            out.push((FilterClass::Subsystems, desc));
        }

        // The tag scans can re-yield devices the subsystem scan already
        // produced; the subsystem view is authoritative for those.
        for tag in OPT_IN_TAGS {
            let mut enumerator = udev::Enumerator::new()?;
            enumerator.match_tag(tag)?;
            for dev in enumerator.scan_devices()? {
                let desc = Descriptor::from_udev(&dev, Action::Add);
                if seen.insert(desc.syspath.clone()) {
                    trace!(self.log, "enumerated tagged {}", desc.syspath);
                    out.push((FilterClass::Tagged, desc));
                }
            }
        }

        Ok(out)
    }

    async fn next_event(&mut self) -> Result<(FilterClass, Descriptor)> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Ok(event);
            }
            tokio::select! {
                guard = self.subsystems.readable_mut() => {
                    drain(FilterClass::Subsystems, guard?, &mut self.queue, &self.log);
                }
                guard = self.tagged.readable_mut() => {
                    drain(FilterClass::Tagged, guard?, &mut self.queue, &self.log);
                }
            }
        }
    }
}

fn drain(
    class: FilterClass,
    mut guard: tokio::io::unix::AsyncFdReadyMutGuard<'_, udev::MonitorSocket>,
    queue: &mut VecDeque<(FilterClass, Descriptor)>,
    log: &Logger,
) {
    while let Some(event) = guard.get_inner_mut().next() {
        let desc = Descriptor::from_udev(&event.device(), Action::from(event.event_type()));
        trace!(log, "received {:?} event for {}", desc.action, desc.syspath);
        queue.push_back((class, desc));
    }
    guard.clear_ready();
}
