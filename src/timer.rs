// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Timer policy for a single peer.
//!
//! Every function here is pure: given a peer's recorded timestamps and the
//! current time, it returns a `Decision` describing what the caller should
//! do. None of these functions perform I/O, touch a socket, or mutate
//! anything outside of `TimerState` itself — the device event loop is the
//! only place that turns a `Decision` into an actual packet.

use std::time::Duration;

#[cfg(feature = "mock-instant")]
use mock_instant::Instant;

#[cfg(not(feature = "mock-instant"))]
use crate::sleepyinstant::Instant;

// https://www.wireguard.com/papers/wireguard.pdf#page=14
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const COOKIE_EXPIRATION_TIME: Duration = Duration::from_secs(120);

/// What the caller should do as a result of a timer tick. At most one
/// variant applies per call; the event loop checks in priority order
/// (destroy, then reset, then handshake, then keepalive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Nothing,
    SendHandshakeInitiation,
    SendKeepalive,
    /// The current session has outlived `REJECT_AFTER_TIME` and must be
    /// dropped; the peer falls back to its previous session, if any.
    DestroyCurrentSession,
    /// The peer has failed to rekey for `REJECT_AFTER_TIME * 3` or
    /// `REKEY_ATTEMPT_TIME` and every session and queued packet should be
    /// wiped.
    ResetPeer,
}

/// The timestamps a peer's timer policy is evaluated against. All fields
/// are durations since some fixed epoch the caller controls (in practice,
/// the device's start time), which keeps this struct `Copy` and makes the
/// decision functions pure and trivially testable with synthetic values.
#[derive(Debug, Clone, Copy)]
pub struct TimerState {
    pub is_initiator: bool,
    pub session_established: Duration,
    pub handshake_started: Option<Duration>,
    pub last_packet_received: Duration,
    pub last_packet_sent: Duration,
    pub last_data_packet_received: Duration,
    pub last_data_packet_sent: Duration,
    pub want_keepalive: bool,
    pub want_handshake: bool,
    pub persistent_keepalive: Option<Duration>,
    pub last_persistent_keepalive_sent: Duration,
}

impl Default for TimerState {
    fn default() -> Self {
        TimerState {
            is_initiator: false,
            session_established: Duration::ZERO,
            handshake_started: None,
            last_packet_received: Duration::ZERO,
            last_packet_sent: Duration::ZERO,
            last_data_packet_received: Duration::ZERO,
            last_data_packet_sent: Duration::ZERO,
            want_keepalive: false,
            want_handshake: false,
            persistent_keepalive: None,
            last_persistent_keepalive_sent: Duration::ZERO,
        }
    }
}

/// Should the peer's entire state (sessions, handshake, packet queue) be
/// torn down? This takes priority over every other decision.
pub fn should_reset_peer(state: &TimerState, now: Duration) -> bool {
    if now.saturating_sub(state.session_established) >= REJECT_AFTER_TIME * 3 {
        return true;
    }
    if let Some(started) = state.handshake_started {
        if now.saturating_sub(started) >= REKEY_ATTEMPT_TIME {
            return true;
        }
    }
    false
}

/// Should the current session keypair be discarded for having exceeded
/// `REJECT_AFTER_TIME` since it was established?
pub fn should_destroy_current(state: &TimerState, now: Duration) -> bool {
    now.saturating_sub(state.session_established) > REJECT_AFTER_TIME
}

/// Should a handshake initiation be (re)sent?
pub fn should_send_initiation(state: &TimerState, now: Duration) -> bool {
    if let Some(started) = state.handshake_started {
        // A handshake is already in flight; only resend after REKEY_TIMEOUT.
        return now.saturating_sub(started) >= REKEY_TIMEOUT;
    }

    if !state.is_initiator {
        return false;
    }

    if state.session_established < state.last_data_packet_sent
        && now.saturating_sub(state.session_established) >= REKEY_AFTER_TIME
    {
        return true;
    }

    if state.session_established < state.last_data_packet_received
        && now.saturating_sub(state.session_established)
            >= REJECT_AFTER_TIME - KEEPALIVE_TIMEOUT - REKEY_TIMEOUT
    {
        return true;
    }

    if state.last_data_packet_sent > state.last_packet_received
        && now.saturating_sub(state.last_packet_received) >= KEEPALIVE_TIMEOUT + REKEY_TIMEOUT
        && state.want_handshake
    {
        return true;
    }

    false
}

/// Should an empty keepalive packet be sent?
pub fn should_send_keepalive(state: &TimerState, now: Duration) -> bool {
    if state.last_data_packet_received > state.last_packet_sent
        && now.saturating_sub(state.last_packet_sent) >= KEEPALIVE_TIMEOUT
        && state.want_keepalive
    {
        return true;
    }

    if let Some(interval) = state.persistent_keepalive {
        if now.saturating_sub(state.last_persistent_keepalive_sent) >= interval {
            return true;
        }
    }

    false
}

/// Folds the four checks above into a single priority-ordered decision, the
/// way the device event loop actually wants to consume them.
pub fn evaluate(state: &TimerState, now: Duration) -> Decision {
    if should_reset_peer(state, now) {
        return Decision::ResetPeer;
    }
    if should_destroy_current(state, now) {
        return Decision::DestroyCurrentSession;
    }
    if should_send_initiation(state, now) {
        return Decision::SendHandshakeInitiation;
    }
    if should_send_keepalive(state, now) {
        return Decision::SendKeepalive;
    }
    Decision::Nothing
}

/// Wall-clock anchor a device stamps once at startup; every `TimerState`
/// duration is measured relative to it via [`elapsed_since`].
pub fn elapsed_since(start: Instant) -> Duration {
    Instant::now().duration_since(start)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> TimerState {
        TimerState {
            is_initiator: true,
            ..Default::default()
        }
    }

    #[test]
    fn no_handshake_yet_nothing_required_at_time_zero() {
        let state = base();
        assert_eq!(evaluate(&state, Duration::ZERO), Decision::Nothing);
    }

    #[test]
    fn rekeys_after_rekey_after_time_when_we_sent_data() {
        let mut state = base();
        state.last_data_packet_sent = Duration::from_secs(1);
        let now = state.session_established + REKEY_AFTER_TIME;
        assert_eq!(evaluate(&state, now), Decision::SendHandshakeInitiation);
    }

    #[test]
    fn resets_after_reject_after_time_times_three() {
        let state = base();
        let now = REJECT_AFTER_TIME * 3;
        assert_eq!(evaluate(&state, now), Decision::ResetPeer);
    }

    #[test]
    fn resets_after_rekey_attempt_time_without_response() {
        let mut state = base();
        state.handshake_started = Some(Duration::from_secs(0));
        let now = REKEY_ATTEMPT_TIME;
        assert_eq!(evaluate(&state, now), Decision::ResetPeer);
    }

    #[test]
    fn destroys_stale_session() {
        let state = base();
        let now = REJECT_AFTER_TIME + Duration::from_secs(1);
        assert_eq!(evaluate(&state, now), Decision::DestroyCurrentSession);
    }

    #[test]
    fn persistent_keepalive_fires_on_interval() {
        let mut state = base();
        state.persistent_keepalive = Some(Duration::from_secs(25));
        assert!(!should_send_keepalive(&state, Duration::from_secs(24)));
        assert!(should_send_keepalive(&state, Duration::from_secs(25)));
    }
}
