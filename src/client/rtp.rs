// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP header parsing and wrap-aware sequence-number helpers shared by the
//! transport demultiplexer and the frame reassembler.

use bytes::{Buf, Bytes};

use crate::error::{bail, ErrorInt};
use crate::{ConnectionContext, RtspMessageContext};

/// A parsed RTP packet. `payload` has already had padding stripped and any
/// header extension skipped.
#[derive(Debug, Clone)]
pub struct Packet {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Bytes,
}

/// Parses an RTP packet per [RFC 3550 §5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1).
pub fn parse(
    conn_ctx: &ConnectionContext,
    msg_ctx: &RtspMessageContext,
    channel_id: u8,
    mut data: Bytes,
) -> Result<Packet, crate::Error> {
    if data.len() < 12 {
        bail!(ErrorInt::PacketParseError {
            description: format!("RTP packet too short: {} bytes", data.len()),
        });
    }
    let version = data[0] >> 6;
    if version != 2 {
        bail!(ErrorInt::InvalidVersion {
            conn_ctx: *conn_ctx,
            msg_ctx: *msg_ctx,
            channel_id,
        });
    }
    let has_padding = (data[0] & 0b0010_0000) != 0;
    let has_extension = (data[0] & 0b0001_0000) != 0;
    let cc = usize::from(data[0] & 0x0F);
    let marker = (data[1] & 0b1000_0000) != 0;
    let payload_type = data[1] & 0x7F;
    let sequence_number = u16::from_be_bytes([data[2], data[3]]);
    let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

    let mut header_len = 12 + 4 * cc;
    if data.len() < header_len {
        bail!(ErrorInt::PacketParseError {
            description: format!(
                "RTP packet too short for {} CSRCs: {} bytes",
                cc,
                data.len()
            ),
        });
    }
    if has_extension {
        if data.len() < header_len + 4 {
            bail!(ErrorInt::PacketParseError {
                description: "RTP packet too short for extension header".into(),
            });
        }
        let ext_len_words = u16::from_be_bytes([data[header_len + 2], data[header_len + 3]]);
        header_len += 4 + usize::from(ext_len_words) * 4;
        if data.len() < header_len {
            bail!(ErrorInt::PacketParseError {
                description: "RTP packet too short for extension data".into(),
            });
        }
    }

    data.advance(header_len);

    if has_padding {
        if data.is_empty() {
            bail!(ErrorInt::PacketParseError {
                description: "RTP padding bit set but payload empty".into(),
            });
        }
        let pad_len = usize::from(*data.last().unwrap());
        if pad_len == 0 || pad_len > data.len() {
            bail!(ErrorInt::PacketParseError {
                description: format!("invalid RTP padding length {}", pad_len),
            });
        }
        data.truncate(data.len() - pad_len);
    }

    Ok(Packet {
        marker,
        payload_type,
        sequence_number,
        timestamp,
        ssrc,
        payload: data,
    })
}

/// Wrap-aware "is `a` before `b`": `(b - a) mod 65536 < 32768`.
#[inline]
pub fn seq_before(a: u16, b: u16) -> bool {
    b.wrapping_sub(a) < 0x8000
}

/// Wrap-aware gap size `(b - a) mod 65536`.
#[inline]
pub fn seq_gap(a: u16, b: u16) -> u16 {
    b.wrapping_sub(a)
}

/// Sorts sequence numbers into wrap-aware ascending order, taking `anchor`
/// (typically the set's `seq_min`) as the zero point so the sort is correct
/// regardless of where wraparound falls within the set.
pub fn sort_wrap_aware(seqs: &mut [u16], anchor: u16) {
    seqs.sort_by_key(|&s| seq_gap(anchor, s));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn before_handles_wraparound() {
        assert!(seq_before(65534, 0));
        assert!(seq_before(65535, 1));
        assert!(!seq_before(0, 65534));
    }

    #[test]
    fn gap_is_modular() {
        assert_eq!(seq_gap(65534, 0), 2);
        assert_eq!(seq_gap(10, 11), 1);
        assert_eq!(seq_gap(11, 10), 65535);
    }

    #[test]
    fn sort_wraparound_sequence() {
        let mut v = vec![0u16, 1, 65535, 65534];
        sort_wrap_aware(&mut v, 65534);
        assert_eq!(v, vec![65534, 65535, 0, 1]);
    }

    #[test]
    fn parse_zero_csrc_no_extension_roundtrip() {
        let mut buf = vec![0x80, 0x60, 0x00, 0x01, 0, 0, 0, 100, 0, 0, 0, 42];
        buf.extend_from_slice(b"hello");
        let conn_ctx = ConnectionContext::dummy();
        let msg_ctx = RtspMessageContext::dummy();
        let pkt = parse(&conn_ctx, &msg_ctx, 0, Bytes::from(buf)).unwrap();
        assert_eq!(pkt.sequence_number, 1);
        assert_eq!(pkt.timestamp, 100);
        assert_eq!(pkt.ssrc, 42);
        assert!(!pkt.marker);
        assert_eq!(pkt.payload_type, 0x60);
        assert_eq!(&pkt.payload[..], b"hello");
    }

    #[test]
    fn rejects_wrong_version() {
        let buf = vec![0x00, 0x60, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0];
        let err = parse(
            &ConnectionContext::dummy(),
            &RtspMessageContext::dummy(),
            0,
            Bytes::from(buf),
        )
        .unwrap_err();
        assert!(matches!(&*err.0, ErrorInt::InvalidVersion { .. }));
    }

    #[test]
    fn strips_padding() {
        let mut buf = vec![0xA0, 0x60, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0];
        buf.extend_from_slice(b"data");
        buf.extend_from_slice(&[0, 0, 3]); // 3 bytes of padding, last byte = length
        let pkt = parse(
            &ConnectionContext::dummy(),
            &RtspMessageContext::dummy(),
            0,
            Bytes::from(buf),
        )
        .unwrap();
        assert_eq!(&pkt.payload[..], b"data");
    }
}
