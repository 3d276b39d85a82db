/*
 * Copyright (c) Meta Platforms, Inc. and its affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Byte layout of the supervisor control protocol. Requests are answered
//! in order; service event packets may be interleaved at any point.

pub const PROTOCOL_VERSION: u16 = 1;

pub const CMD_QUERY_VERSION: u8 = 0x00;
pub const CMD_LOAD_SERVICE: u8 = 0x01;
pub const CMD_CLOSE_HANDLE: u8 = 0x02;
pub const CMD_ADD_DEP: u8 = 0x03;
pub const CMD_REM_DEP: u8 = 0x04;
pub const CMD_WAKE_SERVICE: u8 = 0x05;

pub const RP_ACK: u8 = 0x40;
pub const RP_NAK: u8 = 0x41;
pub const RP_VERSION: u8 = 0x42;
pub const RP_SERVICE_RECORD: u8 = 0x43;
pub const RP_NO_SERVICE: u8 = 0x44;

pub const PKT_SERVICE_EVENT: u8 = 0x60;

/// The soft "waits for" dependency kind, the only kind this client uses.
pub const DEP_WAITS_FOR: u8 = 0x02;

pub fn query_version() -> Vec<u8> {
    vec![CMD_QUERY_VERSION]
}

pub fn load_service(name: &str) -> Vec<u8> {
    let mut buf = vec![CMD_LOAD_SERVICE];
    buf.extend((name.len() as u16).to_le_bytes());
    buf.extend(name.as_bytes());
    buf
}

pub fn close_handle(handle: u32) -> Vec<u8> {
    let mut buf = vec![CMD_CLOSE_HANDLE];
    buf.extend(handle.to_le_bytes());
    buf
}

pub fn dependency(remove: bool, from: u32, to: u32) -> Vec<u8> {
    let mut buf = vec![
        if remove { CMD_REM_DEP } else { CMD_ADD_DEP },
        DEP_WAITS_FOR,
    ];
    buf.extend(from.to_le_bytes());
    buf.extend(to.to_le_bytes());
    buf
}

pub fn wake_service(handle: u32) -> Vec<u8> {
    let mut buf = vec![CMD_WAKE_SERVICE];
    buf.extend(handle.to_le_bytes());
    buf
}
