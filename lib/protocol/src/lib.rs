/*
 * Copyright (c) Meta Platforms, Inc. and its affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![deny(warnings)]

//! Wire format spoken between the availability broker and its clients
//! over the control socket. A client opens a stream connection, writes a
//! fixed-size handshake frame followed by the query value, and then reads
//! single status bytes until either side hangs up.

use std::fmt;

use thiserror::Error;

/// Where the broker listens. Shared by the broker and its clients.
pub const SOCKET_PATH: &str = "/run/devmond.sock";

/// First byte of every handshake frame.
pub const MAGIC: u8 = 0xdd;

/// Fixed part of the handshake: magic, NUL-padded tag, terminating NUL.
pub const HEADER_LEN: usize = 8;

/// Little-endian query length that follows the header.
pub const LENGTH_LEN: usize = 2;

/// Full handshake frame size.
pub const FRAME_LEN: usize = HEADER_LEN + LENGTH_LEN;

/// Status byte written when the queried device is present and wired up.
pub const STATUS_AVAILABLE: u8 = 0x01;

/// Status byte written when the queried device is absent or being torn
/// down.
pub const STATUS_UNAVAILABLE: u8 = 0x00;

const TAG_LEN: usize = HEADER_LEN - 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("bad magic byte 0x{0:02x}")]
    BadMagic(u8),
    #[error("unknown dependency tag {0:?}")]
    BadTag(String),
    #[error("handshake header is not NUL-terminated")]
    MissingNul,
    #[error("zero-length query value")]
    ZeroLength,
}

pub type Result<T> = std::result::Result<T, Error>;

/// The flavour of dependency a subscription resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// A device node path, e.g. `/dev/sda1`. May be a symlink.
    Devnode,
    /// A kernel syspath, e.g. `/sys/block/sda/sda1`.
    Syspath,
    /// A network interface name.
    Netif,
    /// A MAC address in lowercase colon form.
    Mac,
    /// A USB `vendor:product` identifier in lowercase hex.
    Usb,
}

impl QueryKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Devnode => "dev",
            Self::Syspath => "sys",
            Self::Netif => "netif",
            Self::Mac => "mac",
            Self::Usb => "usb",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "dev" => Some(Self::Devnode),
            "sys" => Some(Self::Syspath),
            "netif" => Some(Self::Netif),
            "mac" => Some(Self::Mac),
            "usb" => Some(Self::Usb),
            _ => None,
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// The fixed-size frame a client writes before its query value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub kind: QueryKind,
    pub data_len: u16,
}

impl Handshake {
    pub fn new(kind: QueryKind, data_len: u16) -> Result<Self> {
        if data_len == 0 {
            return Err(Error::ZeroLength);
        }
        Ok(Self { kind, data_len })
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut frame = [0u8; FRAME_LEN];
        frame[0] = MAGIC;
        frame[1..1 + self.kind.tag().len()].copy_from_slice(self.kind.tag().as_bytes());
        frame[HEADER_LEN..].copy_from_slice(&self.data_len.to_le_bytes());
        frame
    }

    /// Decode the 8-byte fixed header. The tag occupies bytes 1..7,
    /// NUL-padded; byte 7 must be NUL.
    pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<QueryKind> {
        if header[0] != MAGIC {
            return Err(Error::BadMagic(header[0]));
        }
        if header[HEADER_LEN - 1] != 0 {
            return Err(Error::MissingNul);
        }
        let tag = &header[1..1 + TAG_LEN];
        let end = tag.iter().position(|b| *b == 0).unwrap_or(TAG_LEN);
        if tag[end..].iter().any(|b| *b != 0) {
            return Err(Error::BadTag(String::from_utf8_lossy(tag).into_owned()));
        }
        let tag = std::str::from_utf8(&tag[..end])
            .map_err(|_| Error::BadTag(String::from_utf8_lossy(tag).into_owned()))?;
        QueryKind::from_tag(tag).ok_or_else(|| Error::BadTag(tag.to_owned()))
    }

    /// Decode the two length bytes that follow the header.
    pub fn decode_length(bytes: &[u8; LENGTH_LEN]) -> Result<u16> {
        match u16::from_le_bytes(*bytes) {
            0 => Err(Error::ZeroLength),
            n => Ok(n),
        }
    }
}
