// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use crate::noise::errors::WireGuardError;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};

/// Where encrypted data resides in a data packet
pub const DATA_OFFSET: usize = 16;
/// The overhead of the AEAD
pub const AEAD_SIZE: usize = 16;

/// Width of the replay window, in bits. A single word, not a ring of words:
/// the device owns at most a handful of peers and packet reordering beyond
/// 64 sequence numbers is treated as loss, not legitimate reordering.
const REPLAY_WINDOW: u64 = 64;

/// Tracks which of the last `REPLAY_WINDOW` receive counters have already
/// been seen, relative to the greatest counter accepted so far.
#[derive(Debug, Clone, Default)]
struct ReplayWindow {
    /// Greatest counter value accepted so far, plus one.
    high_water: u64,
    /// Bit `i` is set if `high_water - 1 - i` has been accepted.
    bitmap: u64,
}

impl ReplayWindow {
    /// Checks whether `counter` is new, without mutating state.
    fn will_accept(&self, counter: u64) -> Result<(), WireGuardError> {
        if counter >= self.high_water {
            return Ok(());
        }
        let delta = self.high_water - counter;
        if delta > REPLAY_WINDOW {
            return Err(WireGuardError::InvalidCounter);
        }
        if self.bitmap & (1 << (delta - 1)) != 0 {
            return Err(WireGuardError::DuplicateCounter);
        }
        Ok(())
    }

    /// Marks `counter` as received. Caller must have already checked
    /// `will_accept` before decrypting, and should call this only once
    /// decryption has succeeded.
    fn mark_did_receive(&mut self, counter: u64) -> Result<(), WireGuardError> {
        if counter >= self.high_water {
            let advance = counter + 1 - self.high_water;
            self.bitmap = if advance >= REPLAY_WINDOW {
                0
            } else {
                self.bitmap << advance
            };
            self.bitmap |= 1;
            self.high_water = counter + 1;
            return Ok(());
        }
        let delta = self.high_water - counter;
        if delta > REPLAY_WINDOW {
            return Err(WireGuardError::InvalidCounter);
        }
        let bit = 1 << (delta - 1);
        if self.bitmap & bit != 0 {
            return Err(WireGuardError::DuplicateCounter);
        }
        self.bitmap |= bit;
        Ok(())
    }
}

/// A single established Noise transport keypair: a receiving and a sending
/// AEAD key, bound to a pair of session indices.
///
/// Peers hold up to three of these at a time (current, previous, next) per
/// the handshake state machine; `Keypair` itself only knows how to encrypt
/// and decrypt under a fixed pair of keys, and keeps its own replay state.
pub struct Keypair {
    pub(crate) receiving_index: u32,
    pub(crate) sending_index: u32,
    receiver: LessSafeKey,
    sender: LessSafeKey,
    sending_counter: u64,
    replay_window: ReplayWindow,
    receive_cnt: u64,
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Keypair: {}<- ->{}",
            self.receiving_index, self.sending_index
        )
    }
}

impl Keypair {
    pub(crate) fn new(
        local_index: u32,
        peer_index: u32,
        receiving_key: [u8; 32],
        sending_key: [u8; 32],
    ) -> Keypair {
        Keypair {
            receiving_index: local_index,
            sending_index: peer_index,
            receiver: LessSafeKey::new(
                UnboundKey::new(&CHACHA20_POLY1305, &receiving_key).unwrap(),
            ),
            sender: LessSafeKey::new(UnboundKey::new(&CHACHA20_POLY1305, &sending_key).unwrap()),
            sending_counter: 0,
            replay_window: Default::default(),
            receive_cnt: 0,
        }
    }

    pub(crate) fn local_index(&self) -> usize {
        self.receiving_index as usize
    }

    /// Encrypts `src` into a data packet written to `dst`. `message_type` is
    /// written as the first four bytes of the WireGuard wire format; callers
    /// higher up (the device encapsulation path) frame the rest of the
    /// packet around it.
    pub(crate) fn encrypt_data<'a>(&mut self, src: &[u8], dst: &'a mut [u8]) -> &'a mut [u8] {
        if dst.len() < src.len() + super::DATA_OVERHEAD_SZ {
            panic!("destination buffer is too small");
        }

        let counter = self.sending_counter;
        self.sending_counter += 1;

        let (message_type, rest) = dst.split_at_mut(4);
        let (receiver_index, rest) = rest.split_at_mut(4);
        let (counter_field, data) = rest.split_at_mut(8);

        message_type.copy_from_slice(&super::DATA.to_le_bytes());
        receiver_index.copy_from_slice(&self.sending_index.to_le_bytes());
        counter_field.copy_from_slice(&counter.to_le_bytes());

        let n = {
            let mut nonce = [0u8; 12];
            nonce[4..12].copy_from_slice(&counter.to_le_bytes());
            data[..src.len()].copy_from_slice(src);
            self.sender
                .seal_in_place_separate_tag(
                    Nonce::assume_unique_for_key(nonce),
                    Aad::from(&[]),
                    &mut data[..src.len()],
                )
                .map(|tag| {
                    data[src.len()..src.len() + AEAD_SIZE].copy_from_slice(tag.as_ref());
                    src.len() + AEAD_SIZE
                })
                .unwrap()
        };

        &mut dst[..DATA_OFFSET + n]
    }

    /// Decrypts a received data packet into `dst`, verifying the counter is
    /// within the replay window both before and after running the AEAD, so
    /// that decryption failures can't be used to probe the window.
    pub(crate) fn decrypt_data<'a>(
        &mut self,
        packet: super::PacketData,
        dst: &'a mut [u8],
    ) -> Result<&'a mut [u8], WireGuardError> {
        let ct_len = packet.encrypted_encapsulated_packet.len();
        if dst.len() < ct_len {
            panic!("destination buffer is too small");
        }
        if packet.receiver_idx != self.receiving_index {
            return Err(WireGuardError::WrongIndex);
        }
        self.replay_window.will_accept(packet.counter)?;

        let ret = {
            let mut nonce = [0u8; 12];
            nonce[4..12].copy_from_slice(&packet.counter.to_le_bytes());
            dst[..ct_len].copy_from_slice(packet.encrypted_encapsulated_packet);
            self.receiver
                .open_in_place(
                    Nonce::assume_unique_for_key(nonce),
                    Aad::from(&[]),
                    &mut dst[..ct_len],
                )
                .map_err(|_| WireGuardError::InvalidAeadTag)?
        };

        self.replay_window.mark_did_receive(packet.counter)?;
        self.receive_cnt += 1;
        Ok(ret)
    }

    /// Returns `(high_water, accepted)`, used to estimate packet loss.
    pub(crate) fn current_packet_cnt(&self) -> (u64, u64) {
        (self.replay_window.high_water, self.receive_cnt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_never_replays() {
        let mut w = ReplayWindow::default();
        for i in 0..200 {
            assert!(w.mark_did_receive(i).is_ok());
            assert!(w.mark_did_receive(i).is_err());
        }
    }

    #[test]
    fn rejects_too_far_back() {
        let mut w = ReplayWindow::default();
        assert!(w.mark_did_receive(1000).is_ok());
        assert!(matches!(
            w.will_accept(1000 - REPLAY_WINDOW),
            Err(WireGuardError::InvalidCounter)
        ));
        assert!(w.will_accept(1000 - REPLAY_WINDOW + 1).is_ok());
    }

    #[test]
    fn accepts_reordered_within_window() {
        let mut w = ReplayWindow::default();
        assert!(w.mark_did_receive(10).is_ok());
        assert!(w.mark_did_receive(5).is_ok());
        assert!(w.mark_did_receive(5).is_err());
        assert!(w.mark_did_receive(9).is_ok());
        assert!(w.mark_did_receive(9).is_err());
    }

    #[test]
    fn big_jump_resets_window() {
        let mut w = ReplayWindow::default();
        assert!(w.mark_did_receive(5).is_ok());
        assert!(w.mark_did_receive(5 + REPLAY_WINDOW + 1).is_ok());
        assert!(matches!(
            w.will_accept(5),
            Err(WireGuardError::InvalidCounter)
        ));
    }
}
