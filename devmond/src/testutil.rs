/*
 * Copyright (c) Meta Platforms, Inc. and its affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Scripted in-process supervisor used by the broker tests. It speaks
//! the real control protocol over a socketpair, hands out handles, and
//! records every operation with service names resolved, so tests can
//! assert on wiring order.

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::HashSet;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use dinit_client::wire;
use dinit_client::Dinit;
use slog::Logger;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::mpsc::unbounded_channel;

use crate::broker::Broker;
use crate::broker::SharedBroker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorOp {
    Load(String),
    Close(String),
    AddDep { from: String, to: String },
    RemDep { from: String, to: String },
    Wake(String),
}

pub type OpLog = Rc<RefCell<Vec<SupervisorOp>>>;

pub fn logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

/// A broker core backed by a mock supervisor where every service exists
/// and nothing is started.
pub async fn new_broker() -> Result<(SharedBroker, OpLog)> {
    new_broker_with(HashSet::new(), HashSet::new()).await
}

/// `missing` services answer "no such service"; `started` services are
/// reported already started.
pub async fn new_broker_with(
    missing: HashSet<String>,
    started: HashSet<String>,
) -> Result<(SharedBroker, OpLog)> {
    let (client_end, server_end) = UnixStream::pair()?;
    let ops: OpLog = Rc::new(RefCell::new(Vec::new()));
    tokio::task::spawn_local(run_mock(server_end, missing, started, ops.clone()));
    let (dinit, _events) = Dinit::from_stream(logger(), client_end).await?;
    let root = dinit
        .load_service("system", true)
        .await?
        .context("mock must provide the root service")?
        .0;
    let (fatal_tx, _fatal_rx) = unbounded_channel();
    let core = Broker::new(logger(), dinit, root, fatal_tx);
    Ok((core, ops))
}

async fn run_mock(
    mut stream: UnixStream,
    missing: HashSet<String>,
    started: HashSet<String>,
    ops: OpLog,
) {
    let mut handles: HashMap<u32, String> = HashMap::new();
    let mut next_handle = 100u32;
    let name_of = |handles: &HashMap<u32, String>, handle: u32| {
        handles
            .get(&handle)
            .cloned()
            .unwrap_or_else(|| format!("#{}", handle))
    };
    loop {
        let cmd = match stream.read_u8().await {
            Ok(cmd) => cmd,
            Err(_) => return,
        };
        let result = match cmd {
            wire::CMD_QUERY_VERSION => {
                let mut reply = vec![wire::RP_VERSION];
                reply.extend(wire::PROTOCOL_VERSION.to_le_bytes());
                stream.write_all(&reply).await
            }
            wire::CMD_LOAD_SERVICE => {
                let len = stream.read_u16_le().await.unwrap_or(0) as usize;
                let mut name = vec![0u8; len];
                if stream.read_exact(&mut name).await.is_err() {
                    return;
                }
                let name = String::from_utf8_lossy(&name).into_owned();
                ops.borrow_mut().push(SupervisorOp::Load(name.clone()));
                if missing.contains(&name) {
                    stream.write_all(&[wire::RP_NO_SERVICE]).await
                } else {
                    let handle = next_handle;
                    next_handle += 1;
                    let state = if started.contains(&name) { 2 } else { 0 };
                    handles.insert(handle, name);
                    let mut reply = vec![wire::RP_SERVICE_RECORD, state];
                    reply.extend(handle.to_le_bytes());
                    stream.write_all(&reply).await
                }
            }
            wire::CMD_CLOSE_HANDLE => {
                let handle = match stream.read_u32_le().await {
                    Ok(h) => h,
                    Err(_) => return,
                };
                let name = name_of(&handles, handle);
                handles.remove(&handle);
                ops.borrow_mut().push(SupervisorOp::Close(name));
                stream.write_all(&[wire::RP_ACK]).await
            }
            wire::CMD_ADD_DEP | wire::CMD_REM_DEP => {
                let mut payload = [0u8; 9];
                if stream.read_exact(&mut payload).await.is_err() {
                    return;
                }
                let from = u32::from_le_bytes(payload[1..5].try_into().expect("slice is 4 bytes"));
                let to = u32::from_le_bytes(payload[5..9].try_into().expect("slice is 4 bytes"));
                let op = if cmd == wire::CMD_ADD_DEP {
                    SupervisorOp::AddDep {
                        from: name_of(&handles, from),
                        to: name_of(&handles, to),
                    }
                } else {
                    SupervisorOp::RemDep {
                        from: name_of(&handles, from),
                        to: name_of(&handles, to),
                    }
                };
                ops.borrow_mut().push(op);
                stream.write_all(&[wire::RP_ACK]).await
            }
            wire::CMD_WAKE_SERVICE => {
                let handle = match stream.read_u32_le().await {
                    Ok(h) => h,
                    Err(_) => return,
                };
                ops.borrow_mut()
                    .push(SupervisorOp::Wake(name_of(&handles, handle)));
                stream.write_all(&[wire::RP_ACK]).await
            }
            _ => return,
        };
        if result.is_err() {
            return;
        }
    }
}

/// Poll until a condition holds, letting the local tasks and the
/// reactor make progress in between.
pub async fn wait_for(condition: impl Fn() -> bool) -> Result<()> {
    for _ in 0..500 {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    anyhow::bail!("condition not reached in time")
}
