/*
 * Copyright (c) Meta Platforms, Inc. and its affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::FromRawFd;
use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use nix::sys::socket::bind;
use nix::sys::socket::listen;
use nix::sys::socket::socket;
use nix::sys::socket::AddressFamily;
use nix::sys::socket::SockAddr;
use nix::sys::socket::SockFlag;
use nix::sys::socket::SockType;
use nix::sys::socket::UnixAddr;
use protocol::Handshake;
use slog::debug;
use slog::trace;
use slog::warn;
use slog::Logger;
use tokio::io::AsyncReadExt;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use crate::broker::SharedBroker;

/// Create the control socket with owner-only access. The stale socket
/// file is unlinked first, and the mode is locked down between bind and
/// listen so no other user can ever connect.
pub fn bind_control_socket(path: &Path) -> Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("while unlinking {:?}", path)),
    }
    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .context("while creating the control socket")?;
    let addr = UnixAddr::new(path).with_context(|| format!("bad socket path {:?}", path))?;
    bind(fd, &SockAddr::Unix(addr)).with_context(|| format!("while binding to {:?}", path))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .with_context(|| format!("while restricting {:?}", path))?;
    listen(fd, 64).context("while listening on the control socket")?;
    let listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
    UnixListener::from_std(listener).context("while registering the control socket")
}

/// Accept connections forever; each one runs as its own local task.
pub async fn serve(core: SharedBroker, listener: UnixListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let log = core.borrow().log.clone();
                tokio::task::spawn_local(handle_connection(core.clone(), stream, log));
            }
            Err(e) => {
                let broker = core.borrow();
                warn!(broker.log, "accept failed: {}", e);
            }
        }
    }
}

async fn handle_connection(core: SharedBroker, stream: UnixStream, log: Logger) {
    match drive_connection(&core, stream).await {
        Ok(()) => trace!(log, "connection closed"),
        Err(e) => debug!(log, "connection terminated: {:#}", e),
    }
}

async fn drive_connection(core: &SharedBroker, mut stream: UnixStream) -> Result<()> {
    // The whole header must arrive in one read; clients write the frame
    // with a single syscall.
    let mut header = [0u8; protocol::HEADER_LEN];
    let n = stream
        .read(&mut header)
        .await
        .context("while reading handshake header")?;
    if n != protocol::HEADER_LEN {
        bail!("short handshake header ({} bytes)", n);
    }
    let kind = Handshake::decode_header(&header)?;

    let mut length = [0u8; protocol::LENGTH_LEN];
    stream
        .read_exact(&mut length)
        .await
        .context("while reading query length")?;
    let data_len = Handshake::decode_length(&length)? as usize;

    let mut data = vec![0u8; data_len];
    stream
        .read_exact(&mut data)
        .await
        .context("while reading query value")?;
    let value = String::from_utf8(data).context("query value is not utf-8")?;
    if value.contains('\0') {
        bail!("query value contains NUL");
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (id, initial) = core.borrow_mut().subscribe(kind, value, tx);
    let result = subscription_loop(&mut stream, &mut rx, initial).await;
    core.borrow_mut().unsubscribe(id);
    result
}

/// Write the initial status, then relay transition bytes until the peer
/// hangs up or a write cannot complete. Writes are opportunistic; a full
/// socket buffer evicts the subscriber instead of stalling the broker.
async fn subscription_loop(
    stream: &mut UnixStream,
    rx: &mut mpsc::UnboundedReceiver<u8>,
    initial: u8,
) -> Result<()> {
    write_status(stream, initial)?;
    let mut sink = [0u8; 64];
    loop {
        tokio::select! {
            status = rx.recv() => {
                let status = status.context("subscription channel closed")?;
                write_status(stream, status)?;
            }
            ready = stream.readable() => {
                ready.context("while waiting on subscriber")?;
                match stream.try_read(&mut sink) {
                    Ok(0) => return Ok(()),
                    Ok(_) => bail!("unexpected data after query"),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e).context("while reading from subscriber"),
                }
            }
        }
    }
}

fn write_status(stream: &UnixStream, status: u8) -> Result<()> {
    match stream.try_write(&[status]) {
        Ok(1) => Ok(()),
        Ok(n) => bail!("partial status write ({} bytes)", n),
        Err(e) => Err(e).context("status write failed"),
    }
}
