// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The 28-byte relay header prepended to WireGuard messages when a peer is
//! reached through the proxy (relay) rather than directly. See §4.9.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |ver|  reserved |                                               |
//! +-+-+-+-+-+-+-+-+                                               +
//! |                         band_uuid (16 bytes)                 |
//! +                                                               +
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         src_addr (4)                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         dst_addr (4)                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         reserved (4)                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::net::Ipv4Addr;
use thiserror::Error;
use uuid::Uuid;

/// Total size of the wire header.
pub const HEADER_LEN: usize = 28;

/// The only version this crate emits or accepts.
pub const VERSION: u8 = 1;

/// The well-known UDP source port that marks a datagram as having come
/// through the relay rather than directly from a peer. Kept as the
/// compiled-in default; callers that run their relay on another port pass
/// an override to the device rather than recompiling (§9 resolution).
pub const DEFAULT_RELAY_PORT: u16 = 82;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProxyHeaderError {
    #[error("proxy header shorter than {HEADER_LEN} bytes")]
    TooShort,
    #[error("proxy header version {0} is not supported")]
    UnsupportedVersion(u8),
    #[error("proxy header band UUID does not match this device")]
    BandMismatch,
}

/// A decoded proxy header. `src_addr`/`dst_addr` are the *inner* tunnel
/// addresses of the sender and intended recipient, not the outer UDP
/// 4-tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    pub band_uuid: Uuid,
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
}

impl ProxyHeader {
    /// Encodes this header into exactly [`HEADER_LEN`] bytes.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = VERSION & 0x0f;
        out[4..20].copy_from_slice(self.band_uuid.as_bytes());
        out[20..24].copy_from_slice(&self.src_addr.octets());
        out[24..28].copy_from_slice(&self.dst_addr.octets());
        out
    }

    /// Parses a header from the front of `buf`, verifying the version and
    /// that `band_uuid` matches `expected_band`. The remaining `reserved`
    /// bytes are not validated, matching the source's tolerance of unused
    /// padding.
    pub fn decode(buf: &[u8], expected_band: Uuid) -> Result<ProxyHeader, ProxyHeaderError> {
        if buf.len() < HEADER_LEN {
            return Err(ProxyHeaderError::TooShort);
        }
        let version = buf[0] & 0x0f;
        if version != VERSION {
            return Err(ProxyHeaderError::UnsupportedVersion(version));
        }
        let band_uuid = Uuid::from_slice(&buf[4..20]).map_err(|_| ProxyHeaderError::BandMismatch)?;
        if band_uuid != expected_band {
            return Err(ProxyHeaderError::BandMismatch);
        }
        let src_addr = Ipv4Addr::new(buf[20], buf[21], buf[22], buf[23]);
        let dst_addr = Ipv4Addr::new(buf[24], buf[25], buf[26], buf[27]);
        Ok(ProxyHeader {
            band_uuid,
            src_addr,
            dst_addr,
        })
    }
}

/// Prepends a proxy header to `pbuf` in place, using the reserved headroom
/// (see `crate::pbuf`).
pub fn prepend(pbuf: &mut crate::pbuf::Pbuf, header: &ProxyHeader) {
    pbuf.prepend(&header.encode());
}

/// Strips and decodes a proxy header from the front of `pbuf`, leaving the
/// remaining WireGuard message as the new payload.
pub fn strip(
    pbuf: &mut crate::pbuf::Pbuf,
    expected_band: Uuid,
) -> Result<ProxyHeader, ProxyHeaderError> {
    let header = ProxyHeader::decode(pbuf.as_slice(), expected_band)?;
    pbuf.strip_front(HEADER_LEN);
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pbuf::Pool;

    #[test]
    fn encode_decode_round_trip() {
        let band = Uuid::new_v4();
        let hdr = ProxyHeader {
            band_uuid: band,
            src_addr: Ipv4Addr::new(10, 0, 0, 2),
            dst_addr: Ipv4Addr::new(10, 0, 0, 3),
        };
        let encoded = hdr.encode();
        assert_eq!(encoded.len(), HEADER_LEN);
        let decoded = ProxyHeader::decode(&encoded, band).expect("decodes");
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn prepend_strip_round_trip_preserves_payload() {
        let mut pool = Pool::new();
        let mut pbuf = pool.alloc(256);
        pbuf.take(b"wireguard message payload");

        let band = Uuid::new_v4();
        let hdr = ProxyHeader {
            band_uuid: band,
            src_addr: Ipv4Addr::new(10, 0, 0, 2),
            dst_addr: Ipv4Addr::new(10, 0, 0, 3),
        };
        prepend(&mut pbuf, &hdr);
        assert_eq!(pbuf.len(), HEADER_LEN + 25);

        let stripped = strip(&mut pbuf, band).expect("strips cleanly");
        assert_eq!(stripped, hdr);
        assert_eq!(pbuf.as_slice(), b"wireguard message payload");
    }

    #[test]
    fn wrong_band_uuid_is_rejected() {
        let hdr = ProxyHeader {
            band_uuid: Uuid::new_v4(),
            src_addr: Ipv4Addr::UNSPECIFIED,
            dst_addr: Ipv4Addr::UNSPECIFIED,
        };
        let encoded = hdr.encode();
        let err = ProxyHeader::decode(&encoded, Uuid::new_v4()).unwrap_err();
        assert_eq!(err, ProxyHeaderError::BandMismatch);
    }

    #[test]
    fn wrong_version_is_rejected() {
        let hdr = ProxyHeader {
            band_uuid: Uuid::new_v4(),
            src_addr: Ipv4Addr::UNSPECIFIED,
            dst_addr: Ipv4Addr::UNSPECIFIED,
        };
        let mut encoded = hdr.encode();
        encoded[0] = 2;
        let err = ProxyHeader::decode(&encoded, hdr.band_uuid).unwrap_err();
        assert_eq!(err, ProxyHeaderError::UnsupportedVersion(2));
    }

    #[test]
    fn short_buffer_is_rejected() {
        let err = ProxyHeader::decode(&[0u8; 10], Uuid::new_v4()).unwrap_err();
        assert_eq!(err, ProxyHeaderError::TooShort);
    }
}
