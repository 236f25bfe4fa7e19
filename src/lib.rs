// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! A userspace WireGuard data-plane engine for mesh-VPN overlays: Noise IK
//! handshakes and transport encryption (`noise`), a BPF-style inner-packet
//! filter (`acl`), a relay/proxy framing format (`proxy`), a typed
//! configuration schema plus reconciler (`config`, `reconciler`), and the
//! single-threaded device event loop that ties them to a TUN interface and
//! a UDP socket (`device`).

pub mod noise;

pub mod acl;
pub mod config;
pub mod device;
pub mod pbuf;
pub mod proxy;
pub mod reconciler;
pub mod stats;
pub mod timer;
pub mod traits;

pub(crate) mod serialization;
pub(crate) mod sleepyinstant;

/// Re-export of the x25519 types
pub mod x25519 {
    pub use x25519_dalek::{
        EphemeralSecret, PublicKey, ReusableSecret, SharedSecret, StaticSecret,
    };
}
