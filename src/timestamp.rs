// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP→NTP→Unix timestamp mapping.
//!
//! A single `(ntp, rtp)` reference pair is learned from each RTCP sender
//! report and used to place every RTP timestamp on the wall clock. The
//! mapper is shared reader-many/writer-one between the RTCP processor
//! (writer) and the storage sink (reader).

use parking_lot::RwLock;

/// A 64-bit fixed-point NTP timestamp: 32 bits of seconds since 1900-01-01,
/// 32 bits of fraction.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    pub const UNIX_EPOCH_OFFSET: u64 = 2_208_988_800;

    pub fn from_parts(msw: u32, lsw: u32) -> Self {
        NtpTimestamp((u64::from(msw) << 32) | u64::from(lsw))
    }

    /// Converts to nanoseconds since the Unix epoch, saturating rather than
    /// wrapping if `self` predates 1970.
    pub fn to_unix_nanos(self) -> u64 {
        let secs = (self.0 >> 32) as u64;
        let frac = (self.0 & 0xFFFF_FFFF) as u64;
        let unix_secs = secs.saturating_sub(Self::UNIX_EPOCH_OFFSET);
        let nanos = (frac * 1_000_000_000) >> 32;
        unix_secs
            .saturating_mul(1_000_000_000)
            .saturating_add(nanos)
    }

    pub fn from_unix_nanos(unix_nanos: u64) -> Self {
        let secs = unix_nanos / 1_000_000_000;
        let nanos = unix_nanos % 1_000_000_000;
        let ntp_secs = secs + Self::UNIX_EPOCH_OFFSET;
        let frac = (nanos << 32) / 1_000_000_000;
        NtpTimestamp((ntp_secs << 32) | frac)
    }
}

impl std::fmt::Debug for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NtpTimestamp(0x{:016x})", self.0)
    }
}

#[derive(Copy, Clone)]
struct Mapping {
    ntp: u64,
    rtp: u32,
    clock_rate: u32,
}

/// Maps RTP timestamps to NTP (and thus Unix) time using the most recent
/// sender-report reference pair: `ntp(t) = ntp_ref + ((t - rtp_ref) << 32)
/// / clock_rate`.
#[derive(Default)]
pub struct TimestampMapper {
    inner: RwLock<Option<Mapping>>,
}

impl TimestampMapper {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    /// Records a new `(ntp, rtp)` reference pair from an RTCP sender report.
    pub fn update(&self, ntp: NtpTimestamp, rtp: u32, clock_rate: u32) {
        *self.inner.write() = Some(Mapping {
            ntp: ntp.0,
            rtp,
            clock_rate,
        });
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.read().is_some()
    }

    /// Maps an RTP timestamp to an NTP timestamp using signed differences so
    /// timestamps before the reference still map correctly. Returns `None`
    /// if no reference has been learned yet.
    pub fn rtp_to_ntp(&self, t: u32) -> Option<NtpTimestamp> {
        let m = (*self.inner.read())?;
        let clock_rate = i64::from(m.clock_rate.max(1));
        // Wrapping difference between the wire-level u32s, interpreted as
        // the nearest representative in (-2^31, 2^31], which is correct as
        // long as consecutive SRs are less than ~13 hours of RTP clock apart.
        let diff = (t.wrapping_sub(m.rtp) as i32) as i64;
        let delta_100ns = (diff << 32) / clock_rate;
        let ntp = (m.ntp as i128 + delta_100ns as i128) as u64;
        Some(NtpTimestamp(ntp))
    }

    /// Returns the Unix-nanosecond mapping of an RTP timestamp, or `0` if
    /// uninitialized. Callers that care about the uninitialized case should
    /// check [`Self::is_initialized`] first, as [`crate::storage`] does to
    /// fall back to RTP-only filenames.
    pub fn rtp_to_unix_nanos(&self, t: u32) -> u64 {
        self.rtp_to_ntp(t).map(NtpTimestamp::to_unix_nanos).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uninitialized_returns_sentinel() {
        let m = TimestampMapper::new();
        assert!(!m.is_initialized());
        assert_eq!(m.rtp_to_unix_nanos(12345), 0);
    }

    #[test]
    fn sr_mapping_one_second_later() {
        let m = TimestampMapper::new();
        // NTP = 0xE1F8923400000000, RTP = 90000, clock_rate = 90000.
        m.update(NtpTimestamp(0xE1F8_9234_0000_0000), 90_000, 90_000);
        let got = m.rtp_to_ntp(180_000).unwrap();
        let want = 0xE1F8_9234_0000_0000u64.wrapping_add(1u64 << 32);
        let diff = (got.0 as i128 - want as i128).abs();
        assert!(diff < (want as i128) / 100, "got {:#x} want ~{:#x}", got.0, want);
    }

    #[test]
    fn monotonic_ntp_for_increasing_rtp() {
        let m = TimestampMapper::new();
        m.update(NtpTimestamp(1u64 << 32), 1_000, 90_000);
        let a = m.rtp_to_ntp(2_000).unwrap();
        let b = m.rtp_to_ntp(3_000).unwrap();
        assert!(b > a);
    }

    #[test]
    fn ntp_unix_roundtrip_within_one_lsb() {
        let original = NtpTimestamp::from_parts(3_913_056_000, 0x8000_0000);
        let nanos = original.to_unix_nanos();
        let back = NtpTimestamp::from_unix_nanos(nanos);
        let diff = (back.0 as i128 - original.0 as i128).unsigned_abs();
        assert!(diff <= 1, "diff {}", diff);
    }
}
