// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The single-threaded data-plane device (§5): owns the TUN handle, the UDP
//! socket, the peer table, the egress routing trie, and the active ACL, and
//! drives the event loop described in §4.6 -- TUN-readable, UDP-readable,
//! and timer-tick, in that priority order, with a bounded poll deadline so
//! the timer wheel is never starved by a busy socket.
//!
//! Fatal construction/config failures surface as [`Error`]. Per-packet drop
//! reasons never propagate as `Result`s on the hot path; they use
//! [`crate::noise::errors::WireGuardError`] as the stable vocabulary and
//! are counted in [`crate::stats::Stats`].

pub mod allowed_ips;
pub mod drop_privileges;
pub mod epoll;
pub mod peer;
#[cfg(target_os = "linux")]
pub mod tun_linux;

pub use allowed_ips::AllowedIps;
pub use peer::{AllowedIP, OtpConfig, Peer, PeerEndpoint};

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use uuid::Uuid;

use crate::acl::{Acl, FilterDecision};
use crate::config::{ConfigError, WireConfig};
use crate::noise::errors::WireGuardError;
use crate::noise::handshake::parse_handshake_anon;
use crate::noise::rate_limiter::RateLimiter;
use crate::noise::{self, Packet, Tunn, TunnResult};
use crate::pbuf;
use crate::proxy::{self, ProxyHeader, ProxyHeaderError};
use crate::reconciler;
use crate::stats::Stats;
use crate::timer;
use crate::traits::{TunDevice, UdpSocket};
use crate::x25519;

/// Fatal, construction- or config-time failures. Never produced on the
/// per-packet hot path -- see [`crate::noise::errors::WireGuardError`] for
/// those.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to drop privileges: {0}")]
    DropPrivileges(String),
    #[error("event queue setup failed: {0}")]
    EventQueue(io::Error),
    #[error("socket setup failed: {0}")]
    Socket(io::Error),
    #[error("tunnel interface name is invalid")]
    InvalidTunnelName,
    #[error("ioctl failed: {0}")]
    IOCtl(io::Error),
    #[error("fcntl failed: {0}")]
    FCntl(io::Error),
    #[error("reading from the tunnel interface failed: {0}")]
    IfaceRead(io::Error),
    #[error("failed to query the tunnel interface MTU: {0}")]
    Mtu(io::Error),
    #[error("binding the UDP listen socket failed: {0}")]
    BindFailed(io::Error),
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),
}

/// Length of the out-of-band OTP trailer appended after a complete
/// handshake initiation/response message, when the target peer's OTP is
/// enabled (§9). Never part of the Noise transcript -- stripped before the
/// core message reaches [`Tunn::parse_incoming_packet`] and validated only
/// after that message's MAC/AEAD checks already succeeded.
const OTP_TRAILER_LEN: usize = 8;

/// Scratch buffer size for a single handshake/transport message. Matches
/// the buffer size `Tunn`'s own doctests and unit tests encapsulate into.
const MAX_MESSAGE_SIZE: usize = 2048;

/// The first little-endian 32 bits of `buf`, WireGuard's message type
/// field, if `buf` is long enough to contain one.
fn wire_message_type(buf: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = buf.get(0..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Splits a trailing 8-byte OTP value off `datagram`, but only when the
/// type field identifies a handshake initiation or response and the length
/// is exactly that message's wire size plus the trailer -- a plain data
/// packet of the same coincidental length is never mistaken for one, since
/// its type field won't match.
fn split_otp_trailer(datagram: &[u8]) -> (&[u8], Option<u64>) {
    let core_len = match wire_message_type(datagram) {
        Some(t) if t == noise::HANDSHAKE_INIT_MESSAGE_TYPE => noise::HANDSHAKE_INIT_WIRE_LEN,
        Some(t) if t == noise::HANDSHAKE_RESP_MESSAGE_TYPE => noise::HANDSHAKE_RESP_WIRE_LEN,
        _ => return (datagram, None),
    };
    if datagram.len() != core_len + OTP_TRAILER_LEN {
        return (datagram, None);
    }
    let (core, trailer) = datagram.split_at(core_len);
    let mut bytes = [0u8; OTP_TRAILER_LEN];
    bytes.copy_from_slice(trailer);
    (core, Some(u64::from_le_bytes(bytes)))
}

/// The destination address of a decrypted IPv4 frame read off the TUN
/// interface, used to pick an egress peer via the routing trie. Mirrors
/// `crate::traits::inner_src_ip`'s offsets but for the destination field.
fn inner_dst_ipv4(frame: &[u8]) -> Option<Ipv4Addr> {
    if frame.len() < 20 || frame[0] >> 4 != 4 {
        return None;
    }
    Some(Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]))
}

/// A single remote peer's wire-visible identity: its 24-bit peer id and its
/// static public key, the two keys Device uses to route an inbound
/// datagram to the right [`Peer`] before it can call that peer's own
/// `Tunn::decapsulate`.
pub struct Device<T: TunDevice, U: UdpSocket> {
    iface: T,
    udp: U,
    static_private: x25519::StaticSecret,
    static_public: x25519::PublicKey,
    device_uuid: Uuid,
    inner_addr: Ipv4Addr,
    relay_port: u16,
    rate_limiter: Arc<RateLimiter>,
    peers: Vec<Peer>,
    /// 24-bit peer id -> index into `peers`, rebuilt whenever `peers` is
    /// swapped by a reconciliation pass.
    peer_id_index: HashMap<u32, usize>,
    /// Static public key bytes -> index into `peers`, used to identify the
    /// source of an anonymous incoming handshake initiation.
    pubkey_index: HashMap<[u8; 32], usize>,
    /// Device-wide longest-prefix-match trie over every peer's allowed IPs,
    /// used for egress routing (§4.5); ingress verification instead checks
    /// a single peer's own ranges directly via `Peer::is_allowed_ip`.
    routes: AllowedIps<usize>,
    acl: Acl,
    next_peer_index: u32,
    pub stats: Stats,
    pbuf_pool: pbuf::Pool,
    start: Instant,
    mtu: usize,
}

impl<T: TunDevice, U: UdpSocket> Device<T, U> {
    /// Builds a device with an empty peer table and a default-allow ACL.
    /// The first [`Device::apply_config`] call is what actually populates
    /// peers and installs a real ACL.
    pub fn new(
        iface: T,
        udp: U,
        static_private: x25519::StaticSecret,
        device_uuid: Uuid,
        inner_addr: Ipv4Addr,
        relay_port: u16,
    ) -> Result<Device<T, U>, Error> {
        let static_public = x25519::PublicKey::from(&static_private);
        let rate_limiter = Arc::new(RateLimiter::new(
            &static_public,
            noise::PEER_HANDSHAKE_RATE_LIMIT,
        ));
        let mtu = iface.mtu().map_err(Error::Mtu)?;

        Ok(Device {
            iface,
            udp,
            static_private,
            static_public,
            device_uuid,
            inner_addr,
            relay_port,
            rate_limiter,
            peers: Vec::new(),
            peer_id_index: HashMap::new(),
            pubkey_index: HashMap::new(),
            routes: AllowedIps::new(),
            acl: Acl::default(),
            next_peer_index: 1,
            stats: Stats::default(),
            pbuf_pool: pbuf::Pool::new(),
            start: Instant::now(),
            mtu,
        })
    }

    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Reconciles a freshly fetched config against the live peer table
    /// (§4.8), swapping in the new peer vector and ACL and rebuilding the
    /// routing trie and both lookup indexes to match.
    pub fn apply_config(&mut self, config: &WireConfig) -> Result<(), Error> {
        tracing::info!(etag = %config.etag, peers = config.peers.len(), "reconciling configuration");
        let existing = std::mem::take(&mut self.peers);
        let out = reconciler::reconcile(
            config,
            &self.static_private,
            &self.rate_limiter,
            existing,
            &mut self.next_peer_index,
            &self.acl,
        )?;
        self.peers = out.peers;
        self.acl = out.acl;
        self.device_uuid = config.interface.device_uuid;
        self.rebuild_indexes();
        Ok(())
    }

    fn rebuild_indexes(&mut self) {
        self.peer_id_index.clear();
        self.pubkey_index.clear();
        self.routes.clear();
        for (i, peer) in self.peers.iter().enumerate() {
            self.peer_id_index.insert(peer.index(), i);
            self.pubkey_index.insert(*peer.public_key().as_bytes(), i);
            for (addr, cidr) in peer.allowed_ips() {
                self.routes.insert(addr, cidr as u32, i);
            }
        }
    }

    /// Drives every peer's timer wheel forward one tick (§4.7): each
    /// peer's `Tunn::update_timers` may produce a handshake initiation or
    /// keepalive to send, and endpoints that have been silent for three
    /// session lifetimes revert to their first configured candidate.
    pub fn tick(&mut self) {
        let now = self.elapsed();
        let silence = timer::REJECT_AFTER_TIME * 3;
        for i in 0..self.peers.len() {
            let mut dst = [0u8; MAX_MESSAGE_SIZE];
            let result = self.peers[i].update_timers(&mut dst);
            self.dispatch_outgoing(i, result);
            self.peers[i].reset_endpoint_on_silence(silence, now);
        }
    }

    /// Handles a `TunnResult` produced by `encapsulate` or `update_timers`
    /// -- i.e. traffic we originated, never a response to something we
    /// just received (see `handle_datagram` for that path).
    fn dispatch_outgoing(&mut self, peer_idx: usize, result: TunnResult) {
        match result {
            TunnResult::Done => {}
            TunnResult::Err(e) => {
                tracing::debug!(?e, peer = peer_idx, "tunnel error on outgoing path");
            }
            TunnResult::WriteToNetwork(packet) => self.transmit(peer_idx, packet),
            TunnResult::WriteToTunnelV4(_, _) | TunnResult::WriteToTunnelV6(_, _) => {
                tracing::warn!(
                    peer = peer_idx,
                    "unexpected tunnel-bound write from an outgoing tunnel call"
                );
            }
        }
    }

    /// Sends `packet` to a peer, appending the OTP trailer when enabled and
    /// fanning out to every configured endpoint for a fresh handshake
    /// initiation (the only message type that legitimately races multiple
    /// paths at once); everything else goes to the last-observed endpoint.
    fn transmit(&mut self, peer_idx: usize, packet: &[u8]) {
        let otp = *self.peers[peer_idx].otp();
        let message_type = wire_message_type(packet);
        let is_handshake = matches!(
            message_type,
            Some(t) if t == noise::HANDSHAKE_INIT_MESSAGE_TYPE || t == noise::HANDSHAKE_RESP_MESSAGE_TYPE
        );

        let mut framed;
        let wire: &[u8] = if is_handshake && otp.enabled() {
            framed = packet.to_vec();
            framed.extend_from_slice(&otp.sender.to_le_bytes());
            &framed
        } else {
            packet
        };

        if message_type == Some(noise::HANDSHAKE_INIT_MESSAGE_TYPE) {
            let endpoints = self.peers[peer_idx].configured_endpoints().to_vec();
            for endpoint in endpoints {
                self.send_to_endpoint(peer_idx, endpoint, wire);
            }
        } else {
            match self.peers[peer_idx].endpoint() {
                Some(endpoint) => self.send_to_endpoint(peer_idx, endpoint, wire),
                None => tracing::debug!(peer = peer_idx, "no endpoint to send to yet"),
            }
        }
    }

    fn send_to_endpoint(&mut self, peer_idx: usize, endpoint: PeerEndpoint, wire: &[u8]) {
        let dest = SocketAddr::V4(SocketAddrV4::new(endpoint.addr, endpoint.port));

        let sent = if endpoint.is_proxy {
            let mut pbuf = self.pbuf_pool.alloc(wire.len());
            pbuf.take(wire);
            let dst_addr = self.peers[peer_idx].inner_addr().unwrap_or(Ipv4Addr::UNSPECIFIED);
            let header = ProxyHeader {
                band_uuid: self.device_uuid,
                src_addr: self.inner_addr,
                dst_addr,
            };
            proxy::prepend(&mut pbuf, &header);
            let result = self.udp.send_to(pbuf.as_slice(), dest);
            self.pbuf_pool.free(pbuf);
            result
        } else {
            self.udp.send_to(wire, dest)
        };

        if let Err(e) = sent {
            if e.raw_os_error() == Some(libc::ENOBUFS) {
                Stats::bump(&self.stats.udp_send_enobufs);
            } else {
                tracing::debug!(error = %e, peer = peer_idx, %dest, "udp send failed");
            }
        } else {
            Stats::add(&self.stats.tx_bytes, wire.len() as u64);
        }
    }

    /// Reads and encrypts every frame currently queued on the TUN
    /// interface (§4.6 step 4), until the device reports it would block.
    fn handle_tun_readable(&mut self) {
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        loop {
            let frame = match self.iface.read(&mut buf) {
                Ok(frame) => frame,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::warn!(error = %e, "tun read failed");
                    return;
                }
            };
            self.encrypt_and_send(frame);
        }
    }

    /// Encrypts and sends a single plaintext IPv4 frame read off the TUN
    /// interface (§4.6.1). Exposed alongside [`Device::handle_datagram`]
    /// so an embedder driving its own reactor (rather than
    /// [`Device::run_once`]'s epoll loop) can feed frames in directly.
    pub fn encrypt_and_send(&mut self, frame: &[u8]) {
        let Some(dst_ip) = inner_dst_ipv4(frame) else {
            Stats::bump(&self.stats.non_ipv4_inner);
            return;
        };
        let Some(&peer_idx) = self.routes.find(IpAddr::V4(dst_ip)) else {
            Stats::bump(&self.stats.allowed_ips_miss);
            return;
        };

        let mut dst = [0u8; MAX_MESSAGE_SIZE];
        let result = self.peers[peer_idx].tunnel.encapsulate(frame, &mut dst);
        self.dispatch_outgoing(peer_idx, result);
    }

    /// Drains every datagram currently queued on the UDP socket (§4.6 step
    /// 5), until the socket reports it would block.
    fn handle_udp_readable(&mut self) {
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        loop {
            let (datagram, src_addr) = match self.udp.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::warn!(error = %e, "udp recv failed");
                    return;
                }
            };
            self.handle_datagram(datagram, src_addr);
        }
    }

    /// Strips and validates a relay header when the datagram arrived on
    /// the relay port, identifies the target peer, and hands the message
    /// to that peer's own tunnel for MAC/AEAD verification (§4.6 step 5,
    /// §4.9). Public alongside [`Device::encrypt_and_send`] for the same
    /// reason -- an embedder may supply datagrams from its own socket
    /// reactor rather than calling [`Device::run_once`].
    pub fn handle_datagram(&mut self, datagram: &[u8], src_addr: SocketAddr) {
        let is_relay = src_addr.port() == self.relay_port;

        let inner = if is_relay {
            match ProxyHeader::decode(datagram, self.device_uuid) {
                Ok(_) => &datagram[proxy::HEADER_LEN..],
                Err(ProxyHeaderError::BandMismatch) => {
                    Stats::bump(&self.stats.udp_proxy_rx_errs);
                    return;
                }
                Err(_) => {
                    Stats::bump(&self.stats.invalid_proxy_header);
                    return;
                }
            }
        } else {
            datagram
        };

        let (core, otp_candidate) = split_otp_trailer(inner);

        let peer_idx = match self.identify_peer(core) {
            Some(idx) => idx,
            None => return,
        };

        let observed_endpoint = match src_addr.ip() {
            IpAddr::V4(addr) => PeerEndpoint {
                is_proxy: is_relay,
                addr,
                port: src_addr.port(),
            },
            IpAddr::V6(_) => return,
        };

        let mut dst = [0u8; MAX_MESSAGE_SIZE];
        let result = self.peers[peer_idx]
            .tunnel
            .decapsulate(Some(src_addr.ip()), core, &mut dst);

        let mac_verified = !matches!(result, TunnResult::Err(_));
        if mac_verified && otp_candidate.is_some() && self.peers[peer_idx].otp().enabled() {
            let ok = otp_candidate.map_or(false, |c| self.peers[peer_idx].otp().matches(c));
            if !ok {
                Stats::bump(&self.stats.otp_mismatches);
                tracing::debug!(peer = peer_idx, "otp mismatch, dropping handshake message");
                return;
            }
        }

        self.handle_decapsulated(peer_idx, observed_endpoint, result);
    }

    /// Looks up which peer an incoming message is addressed to, without
    /// needing a specific peer's tunnel: a handshake initiation carries no
    /// index of its own, so its sender's static key must be decrypted
    /// anonymously first; every other message type carries the receiver's
    /// 24-bit peer id directly in its top bits.
    fn identify_peer(&mut self, core: &[u8]) -> Option<usize> {
        match Tunn::parse_incoming_packet(core) {
            Ok(Packet::HandshakeInit(ref init)) => {
                match parse_handshake_anon(&self.static_private, &self.static_public, init) {
                    Ok(half) => match self.pubkey_index.get(&half.peer_static_public) {
                        Some(&idx) => Some(idx),
                        None => {
                            Stats::bump(&self.stats.unknown_peer_index);
                            None
                        }
                    },
                    Err(_) => {
                        Stats::bump(&self.stats.mac1_invalid);
                        None
                    }
                }
            }
            Ok(Packet::HandshakeResponse(r)) => self.peer_id_by_receiver(r.receiver_idx),
            Ok(Packet::PacketCookieReply(r)) => self.peer_id_by_receiver(r.receiver_idx),
            Ok(Packet::PacketData(r)) => self.peer_id_by_receiver(r.receiver_idx),
            Err(_) => {
                Stats::bump(&self.stats.short_message);
                None
            }
        }
    }

    fn peer_id_by_receiver(&mut self, receiver_idx: u32) -> Option<usize> {
        match self.peer_id_index.get(&(receiver_idx >> 8)) {
            Some(&idx) => Some(idx),
            None => {
                Stats::bump(&self.stats.unknown_peer_index);
                None
            }
        }
    }

    /// Finishes processing a packet that has already cleared its target
    /// peer's MAC/AEAD (and, when applicable, OTP) checks (§4.6 step 6):
    /// promotes the observed endpoint, drains any queued outgoing writes,
    /// and for decrypted inner traffic, verifies allowed-IPs and the ACL
    /// before writing to the TUN interface.
    fn handle_decapsulated(
        &mut self,
        peer_idx: usize,
        observed_endpoint: PeerEndpoint,
        result: TunnResult,
    ) {
        match result {
            TunnResult::Done => {
                self.peers[peer_idx].observe_endpoint(observed_endpoint, self.elapsed());
            }
            TunnResult::Err(e) => {
                match e {
                    WireGuardError::InvalidCounter | WireGuardError::DuplicateCounter => {
                        Stats::bump(&self.stats.replay_rejected);
                    }
                    WireGuardError::OtpMismatch => Stats::bump(&self.stats.otp_mismatches),
                    _ => Stats::bump(&self.stats.auth_failures),
                }
                tracing::debug!(?e, peer = peer_idx, "decapsulate rejected packet");
            }
            TunnResult::WriteToNetwork(packet) => {
                Stats::bump(&self.stats.handshakes_completed);
                self.peers[peer_idx].observe_endpoint(observed_endpoint, self.elapsed());
                self.transmit(peer_idx, packet);
                self.drain_queued(peer_idx);
            }
            TunnResult::WriteToTunnelV4(packet, src_ip) => {
                self.peers[peer_idx].observe_endpoint(observed_endpoint, self.elapsed());
                if !self.peers[peer_idx].is_allowed_ip(src_ip) {
                    Stats::bump(&self.stats.allowed_ips_miss);
                    return;
                }
                if self.acl.evaluate(packet) == FilterDecision::Drop {
                    Stats::bump(&self.stats.acl_deny);
                    return;
                }
                match self.iface.write(packet) {
                    Ok(_) => Stats::add(&self.stats.rx_bytes, packet.len() as u64),
                    Err(e) => tracing::warn!(error = %e, "tun write failed"),
                }
            }
            TunnResult::WriteToTunnelV6(_, _) => {
                self.peers[peer_idx].observe_endpoint(observed_endpoint, self.elapsed());
                Stats::bump(&self.stats.non_ipv4_inner);
            }
        }
    }

    /// After a handshake response, the peer's tunnel may have queued data
    /// packets from before the session existed; `decapsulate` flushes one
    /// per call when fed an empty datagram, so this repeats that call
    /// until the tunnel reports it has nothing left to send.
    fn drain_queued(&mut self, peer_idx: usize) {
        loop {
            let mut dst = [0u8; MAX_MESSAGE_SIZE];
            match self.peers[peer_idx].tunnel.decapsulate(None, &[], &mut dst) {
                TunnResult::WriteToNetwork(packet) => self.transmit(peer_idx, packet),
                _ => break,
            }
        }
    }
}

impl<T, U> Device<T, U>
where
    T: TunDevice + AsRawFd,
    U: UdpSocket + AsRawFd,
{
    /// Builds the poller over this device's TUN and UDP file descriptors.
    /// Kept separate from `new` so a device can be constructed, have its
    /// initial config applied, and only then start polling.
    pub fn poller(&self) -> Result<epoll::Poller, Error> {
        epoll::Poller::new(self.iface.as_raw_fd(), self.udp.as_raw_fd())
    }

    /// Runs a single iteration of the event loop (§4.6): blocks up to
    /// `timeout` for TUN or UDP readability, dispatches whichever fd (if
    /// any) fired, then always advances the timer wheel before returning,
    /// so a busy socket can never starve rekeys and keepalives.
    pub fn run_once(&mut self, poller: &epoll::Poller, timeout: Duration) -> Result<(), Error> {
        match poller.wait(timeout)? {
            epoll::Readable::Tun => self.handle_tun_readable(),
            epoll::Readable::Udp => self.handle_udp_readable(),
            epoll::Readable::Timeout => {}
        }
        self.tick();
        Ok(())
    }
}
