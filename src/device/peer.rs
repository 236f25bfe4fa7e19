// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use std::time::Duration;

use crate::device::AllowedIps;
use crate::noise::{Tunn, TunnResult};

/// Maximum number of candidate endpoints a peer can carry (direct and
/// relayed, mixed). The config reconciler truncates anything beyond this.
pub const MAX_ENDPOINTS: usize = 16;

/// A single candidate address for reaching a peer: either a direct UDP
/// path, or a relay reachable over the proxy framing (§ proxy header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub is_proxy: bool,
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl PeerEndpoint {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.addr, self.port))
    }
}

/// The OTP fields carried alongside a handshake. Their meaning is opaque to
/// this layer: they are simply extra values a peer must echo back correctly,
/// checked after MAC/AEAD verification succeeds, never folded into the
/// Noise transcript itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OtpConfig {
    pub sender: u64,
    pub receiver: [u64; 3],
}

impl OtpConfig {
    /// OTP is disabled for a peer whose three receiver values are all zero.
    pub fn enabled(&self) -> bool {
        self.receiver != [0, 0, 0]
    }

    pub fn matches(&self, candidate: u64) -> bool {
        !self.enabled() || self.receiver.contains(&candidate)
    }
}

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct AllowedIP {
    pub addr: IpAddr,
    pub cidr: u8,
}

impl FromStr for AllowedIP {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ip: Vec<&str> = s.split('/').collect();
        if ip.len() != 2 {
            return Err("Invalid IP format".to_owned());
        }

        let (addr, cidr) = (ip[0].parse::<IpAddr>(), ip[1].parse::<u8>());
        match (addr, cidr) {
            (Ok(addr @ IpAddr::V4(_)), Ok(cidr)) if cidr <= 32 => Ok(AllowedIP { addr, cidr }),
            (Ok(addr @ IpAddr::V6(_)), Ok(cidr)) if cidr <= 128 => Ok(AllowedIP { addr, cidr }),
            _ => Err("Invalid IP format".to_owned()),
        }
    }
}

/// A single remote peer: its Noise tunnel, its candidate endpoints, its
/// allowed source ranges, and the OTP it must satisfy at handshake time.
///
/// The device owns an exclusive `&mut Peer` while driving its event loop, so
/// nothing here needs interior mutability or locking.
pub struct Peer {
    /// The associated tunnel struct
    pub(crate) tunnel: Tunn,
    /// The index the tunnel uses
    index: u32,
    /// Candidate endpoints as configured, in priority order
    endpoints: Vec<PeerEndpoint>,
    /// The endpoint we most recently authenticated a packet from. Replies
    /// are always sent here, never blindly to `endpoints[0]`.
    endpoint_latest: Option<PeerEndpoint>,
    /// Last time a packet was authenticated from any endpoint; used to
    /// decide when to revert `endpoint_latest` back to `endpoints[0]`.
    last_heartbeat: Option<Duration>,
    allowed_ips: AllowedIps<()>,
    preshared_key: Option<[u8; 32]>,
    otp: OtpConfig,
}

impl Peer {
    pub fn new(
        tunnel: Tunn,
        index: u32,
        endpoints: Vec<PeerEndpoint>,
        allowed_ips: &[AllowedIP],
        preshared_key: Option<[u8; 32]>,
        otp: OtpConfig,
    ) -> Peer {
        let endpoints = if endpoints.len() > MAX_ENDPOINTS {
            tracing::warn!(
                count = endpoints.len(),
                "peer has more than {} endpoints, truncating",
                MAX_ENDPOINTS
            );
            endpoints[..MAX_ENDPOINTS].to_vec()
        } else {
            endpoints
        };

        Peer {
            tunnel,
            index,
            endpoint_latest: endpoints.first().copied(),
            endpoints,
            last_heartbeat: None,
            allowed_ips: allowed_ips.iter().map(|ip| (ip, ())).collect(),
            preshared_key,
            otp,
        }
    }

    pub fn update_timers<'a>(&mut self, dst: &'a mut [u8]) -> TunnResult<'a> {
        self.tunnel.update_timers(dst)
    }

    /// The endpoint outbound traffic should currently be sent to.
    pub fn endpoint(&self) -> Option<PeerEndpoint> {
        self.endpoint_latest
    }

    pub fn configured_endpoints(&self) -> &[PeerEndpoint] {
        &self.endpoints
    }

    /// Records that we authenticated a packet from `addr`, promoting it to
    /// `endpoint_latest` if it differs from what we had.
    pub fn observe_endpoint(&mut self, endpoint: PeerEndpoint, now: Duration) {
        self.last_heartbeat = Some(now);
        if self.endpoint_latest != Some(endpoint) {
            tracing::debug!(?endpoint, "updating latest observed endpoint");
            self.endpoint_latest = Some(endpoint);
        }
    }

    /// Reverts to the first configured endpoint after a period of silence,
    /// the way the timer's reset-on-silence policy requires.
    pub fn reset_endpoint_on_silence(&mut self, silence: Duration, now: Duration) {
        let stale = match self.last_heartbeat {
            Some(last) => now.saturating_sub(last) >= silence,
            None => false,
        };
        if stale {
            self.endpoint_latest = self.endpoints.first().copied();
        }
    }

    pub fn is_allowed_ip<I: Into<IpAddr>>(&self, addr: I) -> bool {
        self.allowed_ips.find(addr.into()).is_some()
    }

    pub fn allowed_ips(&self) -> impl Iterator<Item = (IpAddr, u8)> + '_ {
        self.allowed_ips.iter().map(|(_, ip, cidr)| (ip, cidr))
    }

    pub fn time_since_last_handshake(&self) -> Option<std::time::Duration> {
        self.tunnel.time_since_last_handshake()
    }

    pub fn persistent_keepalive(&self) -> Option<u16> {
        self.tunnel.persistent_keepalive()
    }

    pub fn preshared_key(&self) -> Option<&[u8; 32]> {
        self.preshared_key.as_ref()
    }

    pub fn otp(&self) -> &OtpConfig {
        &self.otp
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// The peer's static public key, as fixed when its tunnel was built.
    pub fn public_key(&self) -> crate::x25519::PublicKey {
        self.tunnel.peer_static_public()
    }

    /// The peer's own inner tunnel address, used as the proxy header's
    /// `dst_addr` when sending to it through the relay. `None` if the peer
    /// somehow has no allowed IPs configured.
    pub fn inner_addr(&self) -> Option<Ipv4Addr> {
        self.allowed_ips().find_map(|(addr, _cidr)| match addr {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
    }
}
