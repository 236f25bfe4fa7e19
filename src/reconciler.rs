// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Turns a freshly parsed [`WireConfig`] into a new peer vector and ACL,
//! reusing live session state for peers that did not actually change
//! (§4.8). This module never touches a socket or the TUN fd; it is pure
//! translation plus `Tunn::new` construction for genuinely new peers.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::acl::{Acl, Insn};
use crate::config::{ConfigError, EndpointType, PeerConfig, WireConfig};
use crate::device::peer::{AllowedIP, MAX_ENDPOINTS, OtpConfig, Peer, PeerEndpoint};
use crate::noise::rate_limiter::RateLimiter;
use crate::noise::Tunn;
use crate::serialization::KeyBytes;
use crate::traits::NatType;
use crate::x25519;

/// Keepalive interval used whenever the NAT-open optimization does not
/// apply. WireGuard deployments conventionally use 25s; nothing in the
/// configuration schema overrides it per peer.
pub const DEFAULT_PERSISTENT_KEEPALIVE: u16 = 25;

/// A peer descriptor translated out of the wire config, with the
/// NAT-open keepalive/proxy-skip optimization (§4.8 step 1) already
/// applied.
struct IfacePeer {
    public_key: x25519::PublicKey,
    endpoints: Vec<PeerEndpoint>,
    allowed_ips: Vec<AllowedIP>,
    otp: OtpConfig,
    keepalive: Option<u16>,
}

fn translate_peer(local_nat: NatType, p: &PeerConfig, idx: usize) -> Result<IfacePeer, ConfigError> {
    let key_bytes: KeyBytes = p
        .wireguard_pubkey
        .parse()
        .map_err(|_| ConfigError::BadPublicKey(idx))?;
    let public_key = x25519::PublicKey::from(key_bytes.0);

    let addr: Ipv4Addr = p
        .private_ip
        .parse()
        .map_err(|_| ConfigError::BadAllowedIp(idx))?;
    let allowed_ips = vec![AllowedIP {
        addr: addr.into(),
        cidr: p.private_mask,
    }];

    if p.device_addresses.len() > MAX_ENDPOINTS {
        return Err(ConfigError::TooManyEndpoints(idx, p.device_addresses.len()));
    }

    let both_open = local_nat == NatType::Open && NatType::from(p.nat_type) == NatType::Open;

    let mut endpoints = Vec::with_capacity(p.device_addresses.len());
    for a in &p.device_addresses {
        if both_open && a.kind == EndpointType::Proxy {
            continue;
        }
        let ip: Ipv4Addr = a
            .address
            .parse()
            .map_err(|_| ConfigError::BadAllowedIp(idx))?;
        endpoints.push(PeerEndpoint {
            is_proxy: a.kind == EndpointType::Proxy,
            addr: ip,
            port: a.port,
        });
    }

    let otp = OtpConfig {
        sender: p.otp_sender,
        receiver: p.otp_receiver,
    };

    let keepalive = if both_open {
        None
    } else {
        Some(DEFAULT_PERSISTENT_KEEPALIVE)
    };

    Ok(IfacePeer {
        public_key,
        endpoints,
        allowed_ips,
        otp,
        keepalive,
    })
}

fn decode_program(raw: &[[i64; 4]]) -> Vec<Insn> {
    raw.iter()
        .map(|[code, jt, jf, k]| Insn::new(*code as u16, *jt as u8, *jf as u8, *k as u32))
        .collect()
}

/// Builds the new ACL from the config's program list, falling back to
/// `None` (meaning "keep the device's previous ACL") if any program
/// fails validation, per §4.8 step 4.
fn build_acl(config: &WireConfig) -> Option<Acl> {
    let programs: Vec<Vec<Insn>> = config
        .acl
        .programs
        .iter()
        .map(|raw| decode_program(raw))
        .collect();
    let default_policy = config.acl.default_policy.clone().into();

    match Acl::new(programs, default_policy) {
        Ok(acl) => Some(acl),
        Err(e) => {
            tracing::warn!(error = %e, "ACL failed validation, keeping previous ACL");
            None
        }
    }
}

/// The result of a reconciliation pass: the peer vector to swap in and
/// the ACL to install (already defaulted to the previous one if the new
/// config's programs didn't validate).
pub struct ReconcileOutput {
    pub peers: Vec<Peer>,
    pub acl: Acl,
}

/// Reconciles `config` against `existing_peers` (the device's current peer
/// vector, consumed by value so live session state can be moved rather
/// than copied into reused peers). `next_index` is the device's 24-bit
/// peer-index allocator, advanced in place for every freshly built peer.
pub fn reconcile(
    config: &WireConfig,
    static_private: &x25519::StaticSecret,
    rate_limiter: &Arc<RateLimiter>,
    existing_peers: Vec<Peer>,
    next_index: &mut u32,
    previous_acl: &Acl,
) -> Result<ReconcileOutput, ConfigError> {
    let local_nat: NatType = config.interface.nat_type.into();

    let mut by_key: HashMap<[u8; 32], Peer> = existing_peers
        .into_iter()
        .map(|p| (*p.public_key().as_bytes(), p))
        .collect();

    let mut peers = Vec::with_capacity(config.peers.len());
    for (i, pc) in config.peers.iter().enumerate() {
        let iface_peer = translate_peer(local_nat, pc, i)?;
        let key_bytes = *iface_peer.public_key.as_bytes();

        let reusable = by_key.remove(&key_bytes).filter(|existing| {
            existing.configured_endpoints() == iface_peer.endpoints.as_slice()
                && *existing.otp() == iface_peer.otp
        });

        let peer = match reusable {
            Some(existing) => {
                tracing::debug!(peer = %hex::encode(key_bytes), "reusing existing peer state");
                existing
            }
            None => {
                tracing::info!(peer = %hex::encode(key_bytes), "building fresh peer");
                let index = *next_index & 0x00ff_ffff;
                *next_index = next_index.wrapping_add(1);

                let tunnel = Tunn::new(
                    static_private.clone(),
                    iface_peer.public_key,
                    None,
                    iface_peer.keepalive,
                    index,
                    Some(Arc::clone(rate_limiter)),
                );
                Peer::new(
                    tunnel,
                    index,
                    iface_peer.endpoints.clone(),
                    &iface_peer.allowed_ips,
                    None,
                    iface_peer.otp,
                )
            }
        };
        peers.push(peer);
    }

    let acl = build_acl(config).unwrap_or_else(|| previous_acl.clone());

    Ok(ReconcileOutput { peers, acl })
}
