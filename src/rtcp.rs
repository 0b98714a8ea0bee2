// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTCP parsing, [RFC 3550](https://datatracker.ietf.org/doc/html/rfc3550).
//!
//! Only version 2 packets are accepted. Of the recognized packet types (SR,
//! RR, SDES, BYE) only the sender report is surfaced in detail; the others
//! are parsed just far enough to skip over correctly and are reported as
//! [`Packet::Unknown`]-shaped data for logging; nothing downstream needs
//! their contents.

use crate::timestamp::NtpTimestamp;

pub const PT_SR: u8 = 200;
pub const PT_RR: u8 = 201;
pub const PT_SDES: u8 = 202;
pub const PT_BYE: u8 = 203;

/// A single RTCP report block, 24 bytes on the wire.
#[derive(Debug, Clone, Copy)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// Sign-extended from the wire's 24-bit two's-complement field.
    pub cumulative_lost: i32,
    pub extended_highest_seq: u32,
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_since_last_sr: u32,
}

/// A parsed RTCP sender report.
#[derive(Debug, Clone)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_timestamp: NtpTimestamp,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub report_blocks: Vec<ReportBlock>,
}

impl SenderReport {
    pub fn ntp_timestamp(&self) -> NtpTimestamp {
        self.ntp_timestamp
    }

    pub fn rtp_timestamp(&self) -> u32 {
        self.rtp_timestamp
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }
}

/// A parsed RTCP receiver report.
#[derive(Debug, Clone)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub report_blocks: Vec<ReportBlock>,
}

#[derive(Debug)]
pub enum Packet {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    SourceDescription,
    Bye,
    /// Any packet type not listed in RFC 3550 §12, or one we chose not to
    /// decode in detail.
    Unknown { payload_type: u8 },
}

fn sign_extend_24(v: u32) -> i32 {
    // bit 23 is the sign bit.
    if v & 0x0080_0000 != 0 {
        (v | 0xFF00_0000) as i32
    } else {
        v as i32
    }
}

fn parse_report_block(b: &[u8]) -> ReportBlock {
    debug_assert_eq!(b.len(), 24);
    let cumulative_raw = (u32::from(b[5]) << 16) | (u32::from(b[6]) << 8) | u32::from(b[7]);
    ReportBlock {
        ssrc: u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
        fraction_lost: b[4],
        cumulative_lost: sign_extend_24(cumulative_raw),
        extended_highest_seq: u32::from_be_bytes([b[8], b[9], b[10], b[11]]),
        jitter: u32::from_be_bytes([b[12], b[13], b[14], b[15]]),
        last_sr: u32::from_be_bytes([b[16], b[17], b[18], b[19]]),
        delay_since_last_sr: u32::from_be_bytes([b[20], b[21], b[22], b[23]]),
    }
}

fn parse_report_blocks(data: &[u8], rc: usize, fixed_hdr_len: usize) -> Result<Vec<ReportBlock>, String> {
    let mut blocks = Vec::with_capacity(rc);
    let mut off = fixed_hdr_len;
    for _ in 0..rc {
        if data.len() < off + 24 {
            return Err(format!(
                "RTCP report block truncated: need {} bytes, have {}",
                off + 24,
                data.len()
            ));
        }
        blocks.push(parse_report_block(&data[off..off + 24]));
        off += 24;
    }
    Ok(blocks)
}

impl Packet {
    /// Parses one RTCP packet from the front of `data`, returning it and the
    /// remaining bytes (RTCP packets are typically compound: several
    /// concatenated in a single RTP/RTCP payload).
    pub fn parse(data: &[u8]) -> Result<(Packet, &[u8]), String> {
        if data.len() < 4 {
            return Err("RTCP packet shorter than 4-byte header".into());
        }
        let version = data[0] >> 6;
        if version != 2 {
            return Err(format!("unsupported RTCP version {}", version));
        }
        let rc = usize::from(data[0] & 0x1F);
        let payload_type = data[1];
        let length_words = u16::from_be_bytes([data[2], data[3]]);
        let total_len = (usize::from(length_words) + 1) * 4;
        if data.len() < total_len {
            return Err(format!(
                "RTCP packet claims {} bytes but only {} available",
                total_len,
                data.len()
            ));
        }
        let (this, rest) = data.split_at(total_len);

        let pkt = match payload_type {
            PT_SR => {
                if this.len() < 28 {
                    return Err("RTCP SR shorter than fixed header".into());
                }
                let ssrc = u32::from_be_bytes([this[4], this[5], this[6], this[7]]);
                let ntp_msw = u32::from_be_bytes([this[8], this[9], this[10], this[11]]);
                let ntp_lsw = u32::from_be_bytes([this[12], this[13], this[14], this[15]]);
                let rtp_timestamp = u32::from_be_bytes([this[16], this[17], this[18], this[19]]);
                let packet_count = u32::from_be_bytes([this[20], this[21], this[22], this[23]]);
                let octet_count = u32::from_be_bytes([this[24], this[25], this[26], this[27]]);
                let report_blocks = parse_report_blocks(this, rc, 28)?;
                Packet::SenderReport(SenderReport {
                    ssrc,
                    ntp_timestamp: NtpTimestamp::from_parts(ntp_msw, ntp_lsw),
                    rtp_timestamp,
                    packet_count,
                    octet_count,
                    report_blocks,
                })
            }
            PT_RR => {
                if this.len() < 8 {
                    return Err("RTCP RR shorter than fixed header".into());
                }
                let ssrc = u32::from_be_bytes([this[4], this[5], this[6], this[7]]);
                let report_blocks = parse_report_blocks(this, rc, 8)?;
                Packet::ReceiverReport(ReceiverReport { ssrc, report_blocks })
            }
            PT_SDES => Packet::SourceDescription,
            PT_BYE => Packet::Bye,
            other => Packet::Unknown { payload_type: other },
        };
        Ok((pkt, rest))
    }
}

/// Running computation of RFC 3550 §6.4.1 interarrival jitter, smoothed by
/// 1/16th on each sample.
#[derive(Default, Clone, Copy)]
pub struct JitterEstimator {
    jitter: f64,
    prev_rtp: Option<u32>,
    prev_arrival: Option<std::time::Instant>,
}

impl JitterEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, rtp_timestamp: u32, arrival: std::time::Instant, clock_rate: u32) {
        if let (Some(prev_rtp), Some(prev_arrival)) = (self.prev_rtp, self.prev_arrival) {
            let rtp_diff = (rtp_timestamp.wrapping_sub(prev_rtp) as i32) as f64;
            let arrival_diff = arrival
                .saturating_duration_since(prev_arrival)
                .as_secs_f64()
                * f64::from(clock_rate);
            let d = (arrival_diff - rtp_diff).abs();
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.prev_rtp = Some(rtp_timestamp);
        self.prev_arrival = Some(arrival);
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }
}

/// `clamp((expected - received) * 256 / expected, 0, 255)`.
pub fn fraction_lost(expected: u64, received: u64) -> u8 {
    if expected == 0 {
        return 0;
    }
    let lost = expected.saturating_sub(received);
    let frac = (lost.saturating_mul(256)) / expected;
    frac.min(255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sr_bytes(ssrc: u32, ntp: u64, rtp_ts: u32) -> Vec<u8> {
        let mut v = vec![0x80, PT_SR, 0, 6]; // length = 6 words (28 bytes total / 4 - 1)
        v.extend_from_slice(&ssrc.to_be_bytes());
        v.extend_from_slice(&((ntp >> 32) as u32).to_be_bytes());
        v.extend_from_slice(&((ntp & 0xFFFF_FFFF) as u32).to_be_bytes());
        v.extend_from_slice(&rtp_ts.to_be_bytes());
        v.extend_from_slice(&0u32.to_be_bytes());
        v.extend_from_slice(&0u32.to_be_bytes());
        v
    }

    #[test]
    fn parses_sender_report() {
        let data = sr_bytes(0x1234_5678, 0xE1F8_9234_0000_0000, 90_000);
        let (pkt, rest) = Packet::parse(&data).unwrap();
        assert!(rest.is_empty());
        match pkt {
            Packet::SenderReport(sr) => {
                assert_eq!(sr.ssrc, 0x1234_5678);
                assert_eq!(sr.rtp_timestamp, 90_000);
                assert_eq!(sr.ntp_timestamp.0, 0xE1F8_9234_0000_0000);
            }
            _ => panic!("expected SR"),
        }
    }

    #[test]
    fn rejects_bad_version() {
        let mut data = sr_bytes(1, 0, 0);
        data[0] = 0x00; // version 0
        assert!(Packet::parse(&data).is_err());
    }

    #[test]
    fn cumulative_lost_sign_extends() {
        let block = parse_report_block(&[
            0, 0, 0, 1, // ssrc
            0, // fraction lost
            0xFF, 0xFF, 0xFF, // cumulative lost = -1
            0, 0, 0, 0, // ehsr
            0, 0, 0, 0, // jitter
            0, 0, 0, 0, // lsr
            0, 0, 0, 0, // dlsr
        ]);
        assert_eq!(block.cumulative_lost, -1);
    }

    #[test]
    fn fraction_lost_clamps() {
        assert_eq!(fraction_lost(0, 0), 0);
        assert_eq!(fraction_lost(100, 200), 0);
        assert_eq!(fraction_lost(100, 0), 255);
        assert_eq!(fraction_lost(100, 50), 128);
    }
}
