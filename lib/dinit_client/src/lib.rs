/*
 * Copyright (c) Meta Platforms, Inc. and its affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![deny(warnings)]

//! Asynchronous client for the init supervisor's control socket. The
//! connection is owned by a pair of background tasks (one writing, one
//! reading); public methods enqueue a request and await its reply, which
//! serializes the wire without locks since the supervisor answers
//! requests in order. Unsolicited service events are demultiplexed onto
//! their own channel.

use std::collections::VecDeque;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::path::PathBuf;

use slog::debug;
use slog::trace;
use slog::Logger;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

pub mod wire;

/// Default control socket of the supervisor.
pub static DEFAULT_SOCKET: &str = "/run/dinitctl";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to connect to supervisor at {path:?}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to adopt inherited supervisor socket: {0}")]
    Adopt(std::io::Error),
    #[error("supervisor protocol version {0} is not supported")]
    Version(u16),
    #[error("supervisor session lost")]
    SessionLost,
    #[error("supervisor protocol violation: {0}")]
    Protocol(String),
    #[error("no such service: {0}")]
    NoSuchService(String),
    #[error("supervisor rejected the request")]
    Rejected,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Opaque reference to a loaded service; must be returned to the
/// supervisor with [Dinit::close_service_handle] when done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl ServiceState {
    pub fn code(&self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Starting => 1,
            Self::Started => 2,
            Self::Stopping => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Stopped),
            1 => Some(Self::Starting),
            2 => Some(Self::Started),
            3 => Some(Self::Stopping),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
    Started,
    Stopped,
    StartFailed,
    Other(u8),
}

impl ServiceEvent {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Started,
            1 => Self::Stopped,
            2 => Self::StartFailed,
            other => Self::Other(other),
        }
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<(ServiceHandle, ServiceEvent)>;

#[derive(Debug)]
enum Reply {
    Ack,
    Nak,
    Version(u16),
    ServiceRecord { state: u8, handle: u32 },
    NoService,
}

struct Request {
    bytes: Vec<u8>,
    resp: oneshot::Sender<Result<Reply>>,
}

/// A live session with the supervisor.
#[derive(Clone)]
pub struct Dinit {
    log: Logger,
    tx: mpsc::UnboundedSender<Request>,
}

impl Dinit {
    /// Connect to the supervisor control socket and perform the version
    /// handshake.
    pub async fn connect(
        log: Logger,
        path: impl AsRef<Path>,
    ) -> Result<(Self, EventReceiver)> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| Error::Connect {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_stream(log, stream).await
    }

    /// Adopt an already-open supervisor session fd inherited from the
    /// caller's environment.
    pub async fn from_fd(log: Logger, fd: RawFd) -> Result<(Self, EventReceiver)> {
        let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
        stream.set_nonblocking(true).map_err(Error::Adopt)?;
        let stream = UnixStream::from_std(stream).map_err(Error::Adopt)?;
        Self::from_stream(log, stream).await
    }

    /// Build a session over an already-established stream. This is also
    /// the seam tests use to talk to a scripted peer.
    pub async fn from_stream(
        log: Logger,
        stream: UnixStream,
    ) -> Result<(Self, EventReceiver)> {
        let (reader, writer) = stream.into_split();
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_task(writer, req_rx, resp_tx));
        tokio::spawn(read_task(log.clone(), reader, resp_rx, event_tx));

        let client = Self { log, tx: req_tx };
        let version = client.version().await?;
        if version != wire::PROTOCOL_VERSION {
            return Err(Error::Version(version));
        }
        Ok((client, event_rx))
    }

    pub async fn version(&self) -> Result<u16> {
        match self.roundtrip(wire::query_version()).await? {
            Reply::Version(v) => Ok(v),
            other => Err(unexpected("version", other)),
        }
    }

    /// Load (or look up) a service by name. `allow_missing` turns "no
    /// such service" into `None` instead of an error.
    pub async fn load_service(
        &self,
        name: &str,
        allow_missing: bool,
    ) -> Result<Option<(ServiceHandle, ServiceState)>> {
        trace!(self.log, "load_service {}", name);
        match self.roundtrip(wire::load_service(name)).await? {
            Reply::ServiceRecord { state, handle } => {
                let state = ServiceState::from_code(state).ok_or_else(|| {
                    Error::Protocol(format!("unknown service state {}", state))
                })?;
                Ok(Some((ServiceHandle(handle), state)))
            }
            Reply::NoService if allow_missing => Ok(None),
            Reply::NoService => Err(Error::NoSuchService(name.to_owned())),
            other => Err(unexpected("load_service", other)),
        }
    }

    pub async fn close_service_handle(&self, handle: ServiceHandle) -> Result<()> {
        match self.roundtrip(wire::close_handle(handle.0)).await? {
            Reply::Ack => Ok(()),
            other => Err(unexpected("close_service_handle", other)),
        }
    }

    /// Add or remove the soft waits-for dependency `from → to`. A NAK
    /// with `ignore_missing` set is treated as a no-op.
    pub async fn add_dependency(
        &self,
        from: ServiceHandle,
        to: ServiceHandle,
        remove: bool,
        ignore_missing: bool,
    ) -> Result<()> {
        match self
            .roundtrip(wire::dependency(remove, from.0, to.0))
            .await?
        {
            Reply::Ack => Ok(()),
            Reply::Nak if ignore_missing => Ok(()),
            Reply::Nak => Err(Error::Rejected),
            other => Err(unexpected("add_dependency", other)),
        }
    }

    /// Ask the supervisor to re-evaluate waiters of a service. Returns
    /// whether the service could be woken; a refusal is not an error.
    pub async fn wake_service(&self, handle: ServiceHandle) -> Result<bool> {
        match self.roundtrip(wire::wake_service(handle.0)).await? {
            Reply::Ack => Ok(true),
            Reply::Nak => Ok(false),
            other => Err(unexpected("wake_service", other)),
        }
    }

    async fn roundtrip(&self, bytes: Vec<u8>) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request { bytes, resp: tx })
            .map_err(|_| Error::SessionLost)?;
        rx.await.map_err(|_| Error::SessionLost)?
    }
}

fn unexpected(op: &str, reply: Reply) -> Error {
    Error::Protocol(format!("unexpected reply to {}: {:?}", op, reply))
}

async fn write_task(
    mut writer: OwnedWriteHalf,
    mut req_rx: mpsc::UnboundedReceiver<Request>,
    resp_tx: mpsc::UnboundedSender<oneshot::Sender<Result<Reply>>>,
) {
    while let Some(Request { bytes, resp }) = req_rx.recv().await {
        // Register the reply slot before the bytes hit the wire so the
        // reader can never see a reply without a waiter.
        if let Err(rejected) = resp_tx.send(resp) {
            let _ = rejected.0.send(Err(Error::SessionLost));
            return;
        }
        if writer.write_all(&bytes).await.is_err() {
            return;
        }
    }
}

async fn read_task(
    log: Logger,
    mut reader: OwnedReadHalf,
    mut resp_rx: mpsc::UnboundedReceiver<oneshot::Sender<Result<Reply>>>,
    event_tx: mpsc::UnboundedSender<(ServiceHandle, ServiceEvent)>,
) {
    let mut waiters: VecDeque<oneshot::Sender<Result<Reply>>> = VecDeque::new();
    let err = loop {
        match read_packet(&mut reader).await {
            Ok(Packet::Reply(reply)) => {
                while let Ok(w) = resp_rx.try_recv() {
                    waiters.push_back(w);
                }
                match waiters.pop_front() {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(reply));
                    }
                    None => break Error::Protocol("unsolicited reply".to_owned()),
                }
            }
            Ok(Packet::Event(handle, event)) => {
                trace!(log, "service event {:?} for {:?}", event, handle);
                let _ = event_tx.send((handle, event));
            }
            Err(e) => break e,
        }
    };
    debug!(log, "supervisor session ended: {}", err);
    resp_rx.close();
    for waiter in waiters {
        let _ = waiter.send(Err(Error::SessionLost));
    }
    while let Ok(waiter) = resp_rx.try_recv() {
        let _ = waiter.send(Err(Error::SessionLost));
    }
}

enum Packet {
    Reply(Reply),
    Event(ServiceHandle, ServiceEvent),
}

async fn read_packet(reader: &mut OwnedReadHalf) -> Result<Packet> {
    let kind = reader.read_u8().await.map_err(|_| Error::SessionLost)?;
    let packet = match kind {
        wire::RP_ACK => Packet::Reply(Reply::Ack),
        wire::RP_NAK => Packet::Reply(Reply::Nak),
        wire::RP_NO_SERVICE => Packet::Reply(Reply::NoService),
        wire::RP_VERSION => {
            let version = reader.read_u16_le().await.map_err(|_| Error::SessionLost)?;
            Packet::Reply(Reply::Version(version))
        }
        wire::RP_SERVICE_RECORD => {
            let state = reader.read_u8().await.map_err(|_| Error::SessionLost)?;
            let handle = reader.read_u32_le().await.map_err(|_| Error::SessionLost)?;
            Packet::Reply(Reply::ServiceRecord { state, handle })
        }
        wire::PKT_SERVICE_EVENT => {
            let handle = reader.read_u32_le().await.map_err(|_| Error::SessionLost)?;
            let event = reader.read_u8().await.map_err(|_| Error::SessionLost)?;
            Packet::Event(ServiceHandle(handle), ServiceEvent::from_code(event))
        }
        other => {
            return Err(Error::Protocol(format!(
                "unknown packet type 0x{:02x}",
                other
            )))
        }
    };
    Ok(packet)
}
