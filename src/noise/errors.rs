// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use thiserror::Error;

/// Stable, flat error kinds for handshake/crypto/packet-shape rejections.
///
/// These are per-packet drop reasons, not exceptions: callers match on the
/// variant to bump a counter (see `crate::stats`), they never unwind.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WireGuardError {
    #[error("destination buffer is too small")]
    DestinationBufferTooSmall,
    #[error("packet length is incorrect for its declared type")]
    IncorrectPacketLength,
    #[error("packet arrived in a state that doesn't expect it")]
    UnexpectedPacket,
    #[error("packet type field does not match any known message")]
    WrongPacketType,
    #[error("receiver index does not match any known session")]
    WrongIndex,
    #[error("static key does not match the expected peer")]
    WrongKey,
    #[error("TAI64N timestamp could not be parsed")]
    InvalidTai64nTimestamp,
    #[error("TAI64N timestamp did not advance past the peer's greatest seen value")]
    WrongTai64nTimestamp,
    #[error("MAC1/MAC2 verification failed")]
    InvalidMac,
    #[error("AEAD authentication tag did not verify")]
    InvalidAeadTag,
    #[error("transport counter is outside the replay window")]
    InvalidCounter,
    #[error("transport counter was already accepted")]
    DuplicateCounter,
    #[error("packet is malformed")]
    InvalidPacket,
    #[error("no current session keypair is installed")]
    NoCurrentSession,
    #[error("lock acquisition failed")]
    LockFailed,
    #[error("session keypair has exceeded its time or message bound")]
    ConnectionExpired,
    #[error("device is under load and requires a cookie reply")]
    UnderLoad,
    #[error("OTP fields did not match the configured expectation")]
    OtpMismatch,
    #[error("decrypted inner source address is not in the peer's allowed-IPs")]
    AllowedIpsMiss,
    #[error("proxy header version or band UUID did not match")]
    InvalidProxyHeader,
}
