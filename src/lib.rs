// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core of an RTSP client that negotiates an H.264 video session, reassembles
//! RTP packets into Annex B coded pictures, and drives a long-lived external
//! decoder process to produce JPEGs.
//!
//! The four core subsystems are each a module here: [`client`] (control
//! protocol + transport + reassembly),
//! [`rtcp`] (sender report parsing), [`timestamp`] (RTP↔NTP mapping), and
//! [`decoder`] (the continuous decoder pipeline). [`storage`] is the
//! filesystem sink that consumes both reassembled frames and decoded JPEGs.

use std::fmt::{Debug, Display};
use std::num::NonZeroU32;

mod error;
pub mod rtcp;
pub mod timestamp;

pub mod client;
pub mod config;
pub mod decoder;
pub mod storage;

pub use error::Error;

pub const UNIX_EPOCH: timestamp::NtpTimestamp = timestamp::NtpTimestamp((2_208_988_800) << 32);

/// A monotonically increasing timestamp within an RTP stream.
///
/// The inner `i64` has the low 32 bits matching the wire's 32-bit RTP
/// timestamp; the higher bits accumulate wraparounds so ordering comparisons
/// never need modular arithmetic once a packet has passed through
/// [`client::rtp::Timeline`].
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Timestamp {
    timestamp: i64,
    clock_rate: NonZeroU32,
    start: u32,
}

impl Timestamp {
    #[inline]
    pub fn new(timestamp: i64, clock_rate: NonZeroU32, start: u32) -> Option<Self> {
        timestamp.checked_sub(i64::from(start)).map(|_| Timestamp {
            timestamp,
            clock_rate,
            start,
        })
    }

    #[inline]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    #[inline]
    pub fn start(&self) -> u32 {
        self.start
    }

    #[inline]
    pub fn clock_rate(&self) -> NonZeroU32 {
        self.clock_rate
    }

    /// The low 32 bits, as they appear on the wire.
    #[inline]
    pub fn rtp_timestamp(&self) -> u32 {
        self.timestamp as u32
    }

    #[inline]
    pub fn elapsed(&self) -> i64 {
        self.timestamp - i64::from(self.start)
    }

    #[inline]
    pub fn elapsed_secs(&self) -> f64 {
        (self.elapsed() as f64) / (self.clock_rate.get() as f64)
    }

    pub fn try_add(&self, delta: u32) -> Option<Self> {
        self.timestamp
            .checked_add(i64::from(delta))
            .map(|timestamp| Timestamp {
                timestamp,
                clock_rate: self.clock_rate,
                start: self.start,
            })
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (mod-2^32: {}), npt {:.03}",
            self.timestamp, self.timestamp as u32, self.elapsed_secs()
        )
    }
}

impl Debug for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// A wall time taken from the local machine's realtime clock, used only in
/// error/log messages, never as a source of truth for frame naming (that's
/// [`timestamp::TimestampMapper`]'s job).
#[derive(Copy, Clone, Debug)]
pub struct WallTime(std::time::SystemTime);

impl WallTime {
    fn now() -> Self {
        Self(std::time::SystemTime::now())
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dur = self
            .0
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        write!(f, "{}.{:03}", dur.as_secs(), dur.subsec_millis())
    }
}

/// RTSP connection context: enough to pick the flow out of a packet capture.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionContext {
    pub local_addr: std::net::SocketAddr,
    pub peer_addr: std::net::SocketAddr,
    established_wall: WallTime,
    established: std::time::Instant,
}

impl ConnectionContext {
    pub fn new(local_addr: std::net::SocketAddr, peer_addr: std::net::SocketAddr) -> Self {
        Self {
            local_addr,
            peer_addr,
            established_wall: WallTime::now(),
            established: std::time::Instant::now(),
        }
    }

    #[doc(hidden)]
    pub fn dummy() -> Self {
        let addr = std::net::SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);
        Self::new(addr, addr)
    }

    pub fn established(&self) -> std::time::Instant {
        self.established
    }
}

impl Display for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(me)->{}@{}", &self.local_addr, &self.peer_addr, &self.established_wall)
    }
}

/// Context of a received RTSP message, used in error reporting.
#[derive(Copy, Clone, Debug)]
pub struct RtspMessageContext {
    pos: u64,
    received_wall: WallTime,
    received: std::time::Instant,
}

impl RtspMessageContext {
    pub fn new(pos: u64) -> Self {
        Self {
            pos,
            received_wall: WallTime::now(),
            received: std::time::Instant::now(),
        }
    }

    #[doc(hidden)]
    pub fn dummy() -> Self {
        Self::new(0)
    }

    pub fn received(&self) -> std::time::Instant {
        self.received
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }
}

impl Display for RtspMessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pos, &self.received_wall)
    }
}

/// Returns the byte range within `buf` that `subset` occupies. Used to turn
/// a `&[u8]` borrowed from a `Bytes` back into an owned sub-`Bytes` without
/// copying.
pub(crate) fn as_range(buf: &[u8], subset: &[u8]) -> Option<std::ops::Range<usize>> {
    if subset.is_empty() {
        return None;
    }
    let subset_p = subset.as_ptr() as usize;
    let buf_p = buf.as_ptr() as usize;
    let off = subset_p.checked_sub(buf_p).unwrap_or_else(|| {
        panic!("{}-byte subset not within {}-byte buf", subset.len(), buf.len())
    });
    let end = off + subset.len();
    assert!(end <= buf.len());
    Some(off..end)
}
