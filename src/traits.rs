// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Small collaborator traits the device/pipeline/timer/reconciler modules
//! are generic over. Each isolates a concern that would otherwise pull in
//! per-OS `#[cfg(target_os = ...)]` branches or a concrete network/storage
//! dependency: a TUN handle, a UDP socket, a wall clock, a STUN resolver, a
//! config cache, and a "wake me up" signal channel.
//!
//! A single reference implementation of each ships for the local/native
//! target ([`crate::device::tun_linux::TunSocket`] for `TunDevice`, a thin
//! wrapper over `std::net::UdpSocket` for `UdpSocket`, [`SystemClock`]'s
//! `RealClock`). These are intentionally minimal, not a full platform port.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Reads and writes whole IPv4/IPv6 frames to a local TUN interface.
pub trait TunDevice {
    /// Blocking read of a single frame into `buf`, returning the frame.
    fn read<'a>(&self, buf: &'a mut [u8]) -> io::Result<&'a mut [u8]>;
    fn write(&self, buf: &[u8]) -> io::Result<usize>;
    fn mtu(&self) -> io::Result<usize>;
}

/// A UDP socket capable of non-blocking use from the single-threaded event
/// loop. `local_addr`/`recv_from`/`send_to` mirror `std::net::UdpSocket`
/// deliberately, so the reference implementation is a thin wrapper.
pub trait UdpSocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
    fn recv_from<'a>(&self, buf: &'a mut [u8]) -> io::Result<(&'a mut [u8], SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Wall-clock access, abstracted so tests can run rekey/timeout scenarios
/// in milliseconds instead of the literal minutes the protocol narrates.
pub trait SystemClock {
    /// Milliseconds since an arbitrary but fixed epoch for this clock
    /// instance (monotonic, not wall-clock UTC).
    fn now_ms(&self) -> u64;
    /// Current time as a 12-byte TAI64N timestamp, for handshake anti-replay.
    fn tai64n_now(&self) -> [u8; 12];
}

/// NAT classification used by the config reconciler to decide whether a
/// peer needs persistent keepalives and whether relayed endpoints are
/// skippable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    Open,
    Moderate,
    Symmetric,
}

/// Resolves this host's external mapped address and NAT behavior.
pub trait StunClient {
    fn classify(&self) -> io::Result<(NatType, SocketAddr)>;
}

/// Persists and retrieves the last-applied configuration blob, keyed by
/// its etag, so a restart doesn't need to refetch from the control plane
/// before the tunnel can come up.
pub trait ConfigStore {
    fn load(&self) -> io::Result<Option<Vec<u8>>>;
    fn save(&self, etag: &str, blob: &[u8]) -> io::Result<()>;
}

/// Mirrors the out-of-scope MQTT signaling channel's "wait for next nudge,
/// or time out" shape, without depending on a concrete MQTT client: the
/// payload of a publish is never interpreted here, only its arrival.
pub trait SignalChannel {
    /// Blocks up to `deadline`, returning `true` if a refresh signal
    /// arrived and `false` on timeout.
    fn wait_for_signal(&self, deadline: Duration) -> bool;
}

/// Reference `SystemClock` for the native target: an `Instant` anchor plus
/// `SystemTime` for the TAI64N wall-clock component.
pub struct RealClock {
    start: std::time::Instant,
}

impl Default for RealClock {
    fn default() -> Self {
        RealClock {
            start: std::time::Instant::now(),
        }
    }
}

impl SystemClock for RealClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn tai64n_now(&self) -> [u8; 12] {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        tai64n_from_duration(now)
    }
}

/// TAI64N encodes seconds since 1970-01-01 offset by 2^62, big-endian,
/// followed by big-endian nanoseconds. See `crate::noise::handshake` for
/// the decode side used during handshake verification.
fn tai64n_from_duration(d: Duration) -> [u8; 12] {
    const TAI64_BASE: u64 = 1 << 62;
    let seconds = TAI64_BASE + d.as_secs();
    let nanos = d.subsec_nanos();
    let mut out = [0u8; 12];
    out[..8].copy_from_slice(&seconds.to_be_bytes());
    out[8..].copy_from_slice(&nanos.to_be_bytes());
    out
}

/// A plain `std::net::UdpSocket`-backed implementation, usable wherever a
/// concrete `UdpSocket` impl is needed outside of tests.
pub struct StdUdpSocket(std::net::UdpSocket);

impl StdUdpSocket {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let sock = std::net::UdpSocket::bind(addr)?;
        sock.set_nonblocking(true)?;
        Ok(StdUdpSocket(sock))
    }
}

impl UdpSocket for StdUdpSocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.0.send_to(buf, addr)
    }

    fn recv_from<'a>(&self, buf: &'a mut [u8]) -> io::Result<(&'a mut [u8], SocketAddr)> {
        let (n, addr) = self.0.recv_from(buf)?;
        Ok((&mut buf[..n], addr))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.local_addr()
    }
}

/// Resolves the inner source IP out of an IPv4/IPv6 frame header, shared by
/// the reconciler (NAT classification context) and the device's ingress
/// allowed-IPs check.
pub fn inner_src_ip(frame: &[u8]) -> Option<IpAddr> {
    if frame.is_empty() {
        return None;
    }
    match frame[0] >> 4 {
        4 if frame.len() >= 20 => Some(IpAddr::from([
            frame[12], frame[13], frame[14], frame[15],
        ])),
        6 if frame.len() >= 40 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&frame[8..24]);
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}
