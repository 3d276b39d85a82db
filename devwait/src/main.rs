/*
 * Copyright (c) Meta Platforms, Inc. and its affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![deny(warnings)]

//! Oneshot device-dependency helper. Spawned by the supervisor with a
//! dependency specifier and an inherited readiness pipe: it subscribes to
//! the broker, signals readiness once the device is available, and exits
//! when the device goes away again so dependents get torn down.

use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use anyhow::bail;
use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use protocol::Handshake;
use protocol::QueryKind;
use structopt::StructOpt;

const DISK_ALIASES: &[&str] = &["LABEL", "UUID", "PARTLABEL", "PARTUUID", "ID"];

#[derive(StructOpt)]
#[structopt(name = "devwait", no_version)]
struct Opts {
    /// Device dependency, e.g. /dev/sda1, LABEL=root, netif:eth0,
    /// mac:aa:bb:cc:dd:ee:ff or usb:1d6b:0003
    dep: String,
    /// Inherited pipe to write READY=1 to once the device is available
    readiness_fd: RawFd,
}

fn main() -> Result<()> {
    let opts = Opts::from_args();
    let (kind, value) = parse_specifier(&opts.dep)?;
    run(kind, &value, opts.readiness_fd)
}

fn parse_specifier(spec: &str) -> Result<(QueryKind, String)> {
    for alias in DISK_ALIASES {
        if let Some(value) = spec.strip_prefix(alias).and_then(|r| r.strip_prefix('=')) {
            ensure!(!value.is_empty(), "empty {} value", alias);
            return Ok((
                QueryKind::Devnode,
                format!("/dev/disk/by-{}/{}", alias.to_lowercase(), value),
            ));
        }
    }
    if spec.starts_with("/dev/") {
        return Ok((QueryKind::Devnode, spec.to_owned()));
    }
    if spec.starts_with("/sys/") {
        return Ok((QueryKind::Syspath, spec.to_owned()));
    }
    if let Some(name) = spec.strip_prefix("netif:") {
        ensure!(!name.is_empty(), "empty interface name");
        return Ok((QueryKind::Netif, name.to_owned()));
    }
    if let Some(addr) = spec.strip_prefix("mac:") {
        ensure!(!addr.is_empty(), "empty mac address");
        return Ok((QueryKind::Mac, addr.to_owned()));
    }
    if let Some(id) = spec.strip_prefix("usb:") {
        ensure!(
            id.split(':').count() == 2 && id.split(':').all(|p| !p.is_empty()),
            "usb dependency must be usb:<vendor>:<product>"
        );
        return Ok((QueryKind::Usb, id.to_owned()));
    }
    bail!("unrecognized dependency specifier {:?}", spec)
}

fn run(kind: QueryKind, value: &str, readiness_fd: RawFd) -> Result<()> {
    ensure!(
        value.len() <= u16::MAX as usize,
        "dependency value is too long"
    );
    let mut stream = connect_with_retry(Path::new(protocol::SOCKET_PATH))?;

    let mut frame = Handshake::new(kind, value.len() as u16)?.encode().to_vec();
    frame.extend(value.as_bytes());
    stream
        .write_all(&frame)
        .context("while sending the query")?;

    let mut ready = false;
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => bail!("broker closed the connection"),
            Ok(_) => match byte[0] {
                protocol::STATUS_AVAILABLE if !ready => {
                    signal_readiness(readiness_fd)?;
                    ready = true;
                }
                protocol::STATUS_UNAVAILABLE if ready => return Ok(()),
                _ => {}
            },
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("while reading device status"),
        }
    }
}

/// The broker may not exist yet this early in boot; keep trying.
fn connect_with_retry(path: &Path) -> Result<UnixStream> {
    loop {
        match UnixStream::connect(path) {
            Ok(stream) => return Ok(stream),
            Err(e) if should_retry(&e) => std::thread::sleep(Duration::from_millis(250)),
            Err(e) => {
                return Err(e).with_context(|| format!("while connecting to {:?}", path))
            }
        }
    }
}

fn should_retry(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::NotFound | ErrorKind::ConnectionRefused
    ) || e.raw_os_error() == Some(nix::errno::Errno::ENOTDIR as i32)
}

fn signal_readiness(fd: RawFd) -> Result<()> {
    nix::unistd::write(fd, b"READY=1\n").context("readiness write failed")?;
    nix::unistd::close(fd).context("closing the readiness fd failed")?;
    Ok(())
}
