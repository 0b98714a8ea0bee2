// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP frame reassembler: per-timestamp packet assembly, FU-A/STAP-A
//! unpacking into Annex B, loss detection, and SPS/PPS caching.
//!
//! Owned exclusively by the packet reader; synchronous and non-blocking, as
//! the concurrency model calls for.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::rtp::{self, Packet};

const NAL_TYPE_SLICE_IDR: u8 = 5;
const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;
const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;
const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// One reassembled coded picture.
#[derive(Debug, Clone)]
pub struct Frame {
    pub rtp_timestamp: u32,
    pub data: Bytes,
    pub is_key: bool,
    pub corrupted: bool,
}

struct Assembly {
    packets: HashMap<u16, Bytes>,
    /// Seq of the first packet inserted; used as the anchor for wrap-aware
    /// sorting since every other member arrives within the reorder window.
    first_seq: u16,
    first_arrival: Instant,
    marker: bool,
}

/// Running totals exposed via accessor.
#[derive(Default, Debug, Clone, Copy)]
pub struct Stats {
    pub total_frames: u64,
    pub corrupted_frames: u64,
    pub ssrc_changes: u64,
}

pub struct Reassembler {
    ssrc: Option<u32>,
    assemblies: HashMap<u32, Assembly>,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    reorder_window: Duration,
    max_live_assemblies: usize,
    drop_corrupted: bool,
    stats: Stats,
}

impl Reassembler {
    pub fn new(reorder_window: Duration, drop_corrupted: bool) -> Self {
        Self {
            ssrc: None,
            assemblies: HashMap::new(),
            sps: None,
            pps: None,
            reorder_window,
            max_live_assemblies: 8,
            drop_corrupted,
            stats: Stats::default(),
        }
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn sps(&self) -> Option<&Bytes> {
        self.sps.as_ref()
    }

    pub fn pps(&self) -> Option<&Bytes> {
        self.pps.as_ref()
    }

    /// Seeds the SPS/PPS cache from out-of-band NAL units (eg SDP's
    /// `sprop-parameter-sets`), so the first keyframe can be prepended with
    /// the right parameter sets even before any arrive in-band. Each `nal`
    /// is expected already start-code-prefixed, matching the cache's own
    /// storage format. Never overwrites a set already learned in-band.
    pub fn seed_parameter_sets(&mut self, nals: &[Bytes]) {
        for nal in nals {
            if nal.len() <= START_CODE.len() {
                continue;
            }
            match nal[START_CODE.len()] & 0x1F {
                NAL_TYPE_SPS if self.sps.is_none() => self.sps = Some(nal.clone()),
                NAL_TYPE_PPS if self.pps.is_none() => self.pps = Some(nal.clone()),
                _ => {}
            }
        }
    }

    /// Feeds one RTP packet in, returning any frames that became complete as
    /// a result (usually zero or one; a timeout sweep can complete more than
    /// one timestamp on the same call).
    pub fn insert(&mut self, pkt: &Packet, now: Instant) -> Vec<Frame> {
        match self.ssrc {
            None => {
                self.ssrc = Some(pkt.ssrc);
            }
            Some(current) if current != pkt.ssrc => {
                log::warn!("SSRC changed from {:#x} to {:#x}; dropping in-flight assemblies", current, pkt.ssrc);
                self.assemblies.clear();
                self.sps = None;
                self.pps = None;
                self.stats.ssrc_changes += 1;
                self.ssrc = Some(pkt.ssrc);
            }
            _ => {}
        }

        if !pkt.payload.is_empty() {
            self.accept(pkt, now);
        }

        self.sweep(now)
    }

    fn accept(&mut self, pkt: &Packet, now: Instant) {
        if self.assemblies.len() >= self.max_live_assemblies && !self.assemblies.contains_key(&pkt.timestamp) {
            if let Some(&oldest_ts) = self
                .assemblies
                .iter()
                .min_by_key(|(_, a)| a.first_arrival)
                .map(|(ts, _)| ts)
            {
                self.assemblies.remove(&oldest_ts);
            }
        }
        let assembly = self.assemblies.entry(pkt.timestamp).or_insert_with(|| Assembly {
            packets: HashMap::new(),
            first_seq: pkt.sequence_number,
            first_arrival: now,
            marker: false,
        });
        assembly.packets.insert(pkt.sequence_number, pkt.payload.clone());
        assembly.marker |= pkt.marker;
    }

    fn sweep(&mut self, now: Instant) -> Vec<Frame> {
        let mut ready: Vec<u32> = self
            .assemblies
            .iter()
            .filter(|(_, a)| a.marker || now.saturating_duration_since(a.first_arrival) >= self.reorder_window)
            .map(|(ts, _)| *ts)
            .collect();
        ready.sort_unstable();

        let mut frames = Vec::with_capacity(ready.len());
        for ts in ready {
            let assembly = match self.assemblies.remove(&ts) {
                Some(a) => a,
                None => continue,
            };
            if let Some(frame) = self.reassemble(ts, assembly) {
                self.stats.total_frames += 1;
                if frame.corrupted {
                    self.stats.corrupted_frames += 1;
                }
                if !(frame.corrupted && self.drop_corrupted) {
                    frames.push(frame);
                }
            }
        }
        frames
    }

    fn reassemble(&mut self, timestamp: u32, assembly: Assembly) -> Option<Frame> {
        if assembly.packets.is_empty() {
            return None;
        }
        let mut seqs: Vec<u16> = assembly.packets.keys().copied().collect();
        rtp::sort_wrap_aware(&mut seqs, assembly.first_seq);

        let mut corrupted = false;
        for w in seqs.windows(2) {
            let gap = rtp::seq_gap(w[0], w[1]);
            if gap > 0 && gap < 100 {
                corrupted = true;
            }
        }

        let mut out = Vec::new();
        let mut is_key = false;
        let mut fu_active: Option<u8> = None;

        for seq in &seqs {
            let payload = &assembly.packets[seq];
            if payload.is_empty() {
                continue;
            }
            let nal_type = payload[0] & 0x1F;
            match nal_type {
                NAL_TYPE_STAP_A => {
                    let mut rest = &payload[1..];
                    while rest.len() >= 2 {
                        let size = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
                        rest = &rest[2..];
                        if rest.len() < size {
                            corrupted = true;
                            break;
                        }
                        let nal = &rest[..size];
                        rest = &rest[size..];
                        self.emit_single_nal(nal, &mut out, &mut is_key);
                    }
                }
                NAL_TYPE_FU_A => {
                    if payload.len() < 2 {
                        corrupted = true;
                        continue;
                    }
                    let fu_header = payload[1];
                    let start = fu_header & 0x80 != 0;
                    let end = fu_header & 0x40 != 0;
                    let fu_type = fu_header & 0x1F;
                    if start {
                        if fu_active.is_some() {
                            corrupted = true;
                        }
                        let reconstructed_header = (payload[0] & 0xE0) | fu_type;
                        out.extend_from_slice(&START_CODE);
                        out.push(reconstructed_header);
                        out.extend_from_slice(&payload[2..]);
                        fu_active = Some(fu_type);
                    } else if fu_active.is_some() {
                        out.extend_from_slice(&payload[2..]);
                    } else {
                        corrupted = true;
                    }
                    if end {
                        if fu_type == NAL_TYPE_SLICE_IDR {
                            is_key = true;
                        }
                        fu_active = None;
                    }
                }
                _ => {
                    self.emit_single_nal(payload, &mut out, &mut is_key);
                }
            }
        }

        if is_key && !contains_nal_type(&out, NAL_TYPE_SPS) && !contains_nal_type(&out, NAL_TYPE_PPS) {
            let mut prefixed = Vec::with_capacity(out.len() + 64);
            if let Some(sps) = &self.sps {
                prefixed.extend_from_slice(sps);
            }
            if let Some(pps) = &self.pps {
                prefixed.extend_from_slice(pps);
            }
            prefixed.extend_from_slice(&out);
            out = prefixed;
        }

        if out.is_empty() {
            return None;
        }

        Some(Frame {
            rtp_timestamp: timestamp,
            data: Bytes::from(out),
            is_key,
            corrupted,
        })
    }

    fn emit_single_nal(&mut self, nal: &[u8], out: &mut Vec<u8>, is_key: &mut bool) {
        if nal.is_empty() {
            return;
        }
        let nal_type = nal[0] & 0x1F;
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(nal);
        match nal_type {
            NAL_TYPE_SPS => {
                let mut prefixed = Vec::with_capacity(nal.len() + 4);
                prefixed.extend_from_slice(&START_CODE);
                prefixed.extend_from_slice(nal);
                self.sps = Some(Bytes::from(prefixed));
            }
            NAL_TYPE_PPS => {
                let mut prefixed = Vec::with_capacity(nal.len() + 4);
                prefixed.extend_from_slice(&START_CODE);
                prefixed.extend_from_slice(nal);
                self.pps = Some(Bytes::from(prefixed));
            }
            NAL_TYPE_SLICE_IDR => *is_key = true,
            _ => {}
        }
    }
}

fn contains_nal_type(annex_b: &[u8], nal_type: u8) -> bool {
    let mut i = 0;
    while i + 4 <= annex_b.len() {
        if annex_b[i..i + 4] == START_CODE {
            if let Some(&b) = annex_b.get(i + 4) {
                if b & 0x1F == nal_type {
                    return true;
                }
            }
        }
        i += 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(seq: u16, ts: u32, marker: bool, payload: &[u8]) -> Packet {
        Packet {
            marker,
            payload_type: 96,
            sequence_number: seq,
            timestamp: ts,
            ssrc: 0xA,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn fu_a_reassembly_sets_key_frame() {
        let mut r = Reassembler::new(Duration::from_millis(50), false);
        let now = Instant::now();
        r.insert(&pkt(10, 2000, false, &[0x7C, 0x85, 0xAA, 0xBB]), now);
        r.insert(&pkt(11, 2000, false, &[0x7C, 0x05, 0xCC]), now);
        let frames = r.insert(&pkt(12, 2000, true, &[0x7C, 0x45, 0xDD]), now);
        assert_eq!(frames.len(), 1);
        let f = &frames[0];
        assert!(f.is_key);
        assert!(!f.corrupted);
        assert_eq!(&f.data[..5], &[0, 0, 0, 1, 0x65]);
        assert_eq!(&f.data[5..], &[0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn missing_sequence_flips_corruption() {
        let mut r = Reassembler::new(Duration::from_millis(50), false);
        let now = Instant::now();
        r.insert(&pkt(20, 3000, false, &[0x65, 1, 2, 3]), now);
        let frames = r.insert(&pkt(22, 3000, true, &[0x65, 4, 5, 6]), now);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].corrupted);
    }

    #[test]
    fn fu_a_middle_without_start_is_corrupted() {
        let mut r = Reassembler::new(Duration::from_millis(50), false);
        let now = Instant::now();
        let frames = r.insert(&pkt(1, 5000, true, &[0x7C, 0x05, 0xAA]), now);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].corrupted);
    }

    #[test]
    fn ssrc_change_clears_cache_and_counts() {
        let mut r = Reassembler::new(Duration::from_millis(50), false);
        let now = Instant::now();
        r.insert(&Packet { ssrc: 0xA, ..pkt(0, 0, false, &[0x67, 1, 2]) }, now);
        assert!(r.sps().is_some());
        r.insert(&Packet { ssrc: 0xB, ..pkt(0, 0, false, &[0x65, 1]) }, now);
        assert!(r.sps().is_none());
        assert_eq!(r.stats().ssrc_changes, 1);
    }

    #[test]
    fn reorder_window_finalizes_without_marker() {
        let mut r = Reassembler::new(Duration::from_millis(10), false);
        let t0 = Instant::now();
        r.insert(&pkt(1, 1000, false, &[0x65, 9]), t0);
        let later = t0 + Duration::from_millis(20);
        let frames = r.insert(&pkt(1, 2000, false, &[0x65, 9]), later);
        assert!(frames.iter().any(|f| f.rtp_timestamp == 1000));
    }

    #[test]
    fn seed_parameter_sets_fills_cache_from_sdp() {
        let mut r = Reassembler::new(Duration::from_millis(50), false);
        let sps = Bytes::from(vec![0, 0, 0, 1, 0x67, 1, 2]);
        let pps = Bytes::from(vec![0, 0, 0, 1, 0x68, 3]);
        r.seed_parameter_sets(&[sps.clone(), pps.clone()]);
        assert_eq!(r.sps(), Some(&sps));
        assert_eq!(r.pps(), Some(&pps));
    }

    #[test]
    fn seed_parameter_sets_does_not_override_in_band() {
        let mut r = Reassembler::new(Duration::from_millis(50), false);
        let now = Instant::now();
        r.insert(&pkt(0, 0, false, &[0x67, 0xAA]), now);
        let learned = r.sps().cloned().unwrap();
        let seeded_sps = Bytes::from(vec![0, 0, 0, 1, 0x67, 0xBB]);
        r.seed_parameter_sets(&[seeded_sps]);
        assert_eq!(r.sps(), Some(&learned));
    }

    #[test]
    fn stap_a_unpacks_multiple_nals() {
        let mut r = Reassembler::new(Duration::from_millis(50), false);
        let now = Instant::now();
        let mut payload = vec![NAL_TYPE_STAP_A];
        let nal1 = [0x67u8, 1, 2];
        let nal2 = [0x68u8, 3, 4];
        payload.extend_from_slice(&(nal1.len() as u16).to_be_bytes());
        payload.extend_from_slice(&nal1);
        payload.extend_from_slice(&(nal2.len() as u16).to_be_bytes());
        payload.extend_from_slice(&nal2);
        let frames = r.insert(&pkt(1, 7000, true, &payload), now);
        assert_eq!(frames.len(), 1);
        assert!(r.sps().is_some());
        assert!(r.pps().is_some());
    }
}
