// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Monotonic per-packet-drop-reason counters (§7/§8). Per-packet errors are
//! never propagated up as `Result`s on the hot path; they are exported
//! here instead, readable from any thread for a status snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($field:ident => $name:literal),+ $(,)?) => {
        /// Snapshot-friendly set of drop/error counters. Every field is an
        /// `AtomicU64` so a status-snapshot reader on another thread never
        /// blocks the data-plane thread (§5).
        #[derive(Default)]
        pub struct Stats {
            $(pub $field: AtomicU64),+
        }

        impl Stats {
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed)),+
                }
            }
        }

        /// A plain-data copy of `Stats`, cheap to serialize for a status
        /// report.
        #[derive(Debug, Clone, Copy, Default, serde::Serialize)]
        pub struct StatsSnapshot {
            $(#[serde(rename = $name)] pub $field: u64),+
        }
    };
}

counters! {
    auth_failures => "auth_failures",
    replay_rejected => "replay_rejected",
    non_ipv4_inner => "non_ipv4_inner",
    allowed_ips_miss => "allowed_ips_miss",
    acl_deny => "acl_deny",
    invalid_proxy_header => "invalid_proxy_header",
    unknown_peer_index => "unknown_peer_index",
    alloc_failures => "alloc_failures",
    short_message => "short_message",
    udp_send_enobufs => "udp_send_enobufs",
    udp_proxy_rx_errs => "udp_proxy_rx_errs",
    mac1_invalid => "mac1_invalid",
    cookie_replies_sent => "cookie_replies_sent",
    tai64n_regressions => "tai64n_regressions",
    otp_mismatches => "otp_mismatches",
    handshakes_completed => "handshakes_completed",
    rekeys => "rekeys",
    peer_resets => "peer_resets",
    tx_bytes => "tx_bytes",
    rx_bytes => "rx_bytes",
}

impl Stats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let stats = Stats::default();
        assert_eq!(stats.snapshot().replay_rejected, 0);
        Stats::bump(&stats.replay_rejected);
        Stats::bump(&stats.replay_rejected);
        assert_eq!(stats.snapshot().replay_rejected, 2);
    }
}
