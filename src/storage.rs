// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Storage sink: writes reassembled Annex B frames and
//! decoder-produced JPEGs to a directory tree, naming each file from the
//! RTP→NTP mapping when one is available.
//!
//! Cheap to `Clone` (an `Arc` around the shared state) so the packet reader
//! (raw frames) and the decoder pipeline's saver task (JPEGs) can each hold
//! a handle without further synchronization beyond the `Mutex`-guarded
//! counters and per-file writes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use parking_lot::Mutex;

use crate::client::reassembler::Frame;
use crate::client::FrameSink;
use crate::error::{wrap, ErrorInt};
use crate::timestamp::TimestampMapper;

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub output_dir: PathBuf,
    /// Also append every raw frame (corrupted or not) to `stream.h264`.
    pub continuous_h264: bool,
}

/// Running totals. Each save increments `total` and `total_bytes`, plus
/// `key` for an IDR frame and `corrupted` when flagged. Applied uniformly
/// to both raw and JPEG saves.
#[derive(Default, Debug, Clone, Copy)]
pub struct Stats {
    pub total: u64,
    pub key: u64,
    pub corrupted: u64,
    pub total_bytes: u64,
}

struct Inner {
    output_dir: PathBuf,
    mapper: Arc<TimestampMapper>,
    stats: Mutex<Stats>,
    continuous: Option<Mutex<std::fs::File>>,
}

#[derive(Clone)]
pub struct StorageSink(Arc<Inner>);

fn mkdir(path: &Path) -> Result<(), crate::Error> {
    std::fs::create_dir_all(path).map_err(|source| {
        wrap!(ErrorInt::IoError {
            path: path.to_path_buf(),
            source,
        })
    })?;
    #[cfg(unix)]
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(|source| {
        wrap!(ErrorInt::IoError {
            path: path.to_path_buf(),
            source,
        })
    })?;
    Ok(())
}

fn write_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)?;
    #[cfg(unix)]
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))?;
    Ok(())
}

/// `"<ntp_ns>.<rtp_ts>[_corrupted].<ext>"`, falling back to
/// `"<rtp_ts>[_corrupted].<ext>"` when the mapper has no NTP anchor yet.
fn build_filename(ntp_ns: Option<u64>, rtp_ts: u32, corrupted: bool, ext: &str) -> String {
    let suffix = if corrupted { "_corrupted" } else { "" };
    match ntp_ns {
        Some(ns) => format!("{}.{}{}.{}", ns, rtp_ts, suffix, ext),
        None => format!("{}{}.{}", rtp_ts, suffix, ext),
    }
}

impl StorageSink {
    pub fn new(config: StorageConfig, mapper: Arc<TimestampMapper>) -> Result<Self, crate::Error> {
        let root = &config.output_dir;
        mkdir(root)?;
        mkdir(&root.join("h264"))?;
        mkdir(&root.join("jpeg"))?;
        mkdir(&root.join("corrupted_frames"))?;
        mkdir(&root.join("corrupted_frames").join("jpeg"))?;

        let continuous = if config.continuous_h264 {
            let path = root.join("stream.h264");
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|source| {
                    wrap!(ErrorInt::IoError {
                        path: path.clone(),
                        source,
                    })
                })?;
            #[cfg(unix)]
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).map_err(|source| {
                wrap!(ErrorInt::IoError { path, source })
            })?;
            Some(Mutex::new(file))
        } else {
            None
        };

        Ok(Self(Arc::new(Inner {
            output_dir: config.output_dir,
            mapper,
            stats: Mutex::new(Stats::default()),
            continuous,
        })))
    }

    pub fn stats(&self) -> Stats {
        *self.0.stats.lock()
    }

    fn record(&self, len: usize, is_key: bool, corrupted: bool) {
        let mut stats = self.0.stats.lock();
        stats.total += 1;
        stats.total_bytes += len as u64;
        if is_key {
            stats.key += 1;
        }
        if corrupted {
            stats.corrupted += 1;
        }
    }

    fn ntp_ns(&self, rtp_timestamp: u32) -> Option<u64> {
        if self.0.mapper.is_initialized() {
            Some(self.0.mapper.rtp_to_unix_nanos(rtp_timestamp))
        } else {
            None
        }
    }

    /// Writes one reassembled Annex B frame to `h264/` (or
    /// `corrupted_frames/` when flagged), updating stats. Failures are
    /// logged and dropped, never propagated.
    pub fn save_frame(&self, frame: &Frame) {
        let ntp_ns = self.ntp_ns(frame.rtp_timestamp);
        let filename = build_filename(ntp_ns, frame.rtp_timestamp, frame.corrupted, "h264");
        let dir = if frame.corrupted {
            self.0.output_dir.join("corrupted_frames")
        } else {
            self.0.output_dir.join("h264")
        };
        let path = dir.join(&filename);
        if let Err(source) = write_file(&path, &frame.data) {
            log::warn!("failed to save {}: {}", path.display(), source);
        }
        if let Some(continuous) = &self.0.continuous {
            let mut file = continuous.lock();
            use std::io::Write;
            if let Err(e) = file.write_all(&frame.data) {
                log::warn!("failed to append to stream.h264: {}", e);
            }
        }
        self.record(frame.data.len(), frame.is_key, frame.corrupted);
    }

    /// Writes one decoded JPEG to `jpeg/` (or `corrupted_frames/jpeg/` when
    /// the originating frame was flagged), updating stats.
    pub fn save_jpeg(&self, rtp_timestamp: u32, corrupted: bool, data: &[u8]) {
        let ntp_ns = self.ntp_ns(rtp_timestamp);
        let filename = build_filename(ntp_ns, rtp_timestamp, corrupted, "jpg");
        let dir = if corrupted {
            self.0.output_dir.join("corrupted_frames").join("jpeg")
        } else {
            self.0.output_dir.join("jpeg")
        };
        let path = dir.join(&filename);
        if let Err(source) = write_file(&path, data) {
            log::warn!("failed to save {}: {}", path.display(), source);
        }
        self.record(data.len(), false, corrupted);
    }

    /// Writes a JPEG named only by a monotonic counter, for the case where
    /// the decoder pipeline's metadata queue ran dry. Never goes through the
    /// RTP→NTP mapping, since `counter` isn't an RTP timestamp.
    pub fn save_jpeg_fallback(&self, counter: u64, data: &[u8]) {
        let path = self.0.output_dir.join("jpeg").join(format!("{}.jpg", counter));
        if let Err(source) = write_file(&path, data) {
            log::warn!("failed to save {}: {}", path.display(), source);
        }
        self.record(data.len(), false, false);
    }
}

impl FrameSink for StorageSink {
    fn accept_frame(&mut self, frame: Frame) {
        self.save_frame(&frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sink(dir: &Path) -> StorageSink {
        StorageSink::new(
            StorageConfig {
                output_dir: dir.to_path_buf(),
                continuous_h264: false,
            },
            Arc::new(TimestampMapper::new()),
        )
        .unwrap()
    }

    #[test]
    fn filename_uses_rtp_fallback_when_mapper_uninitialized() {
        assert_eq!(build_filename(None, 42, false, "h264"), "42.h264");
        assert_eq!(build_filename(None, 42, true, "jpg"), "42_corrupted.jpg");
        assert_eq!(build_filename(Some(100), 42, false, "jpg"), "100.42.jpg");
        assert_eq!(build_filename(Some(100), 42, true, "jpg"), "100.42_corrupted.jpg");
    }

    #[test]
    fn save_frame_writes_to_h264_dir_and_updates_stats() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path());
        let frame = Frame {
            rtp_timestamp: 1000,
            data: Bytes::from_static(b"\0\0\0\x01\x67abc"),
            is_key: true,
            corrupted: false,
        };
        sink.save_frame(&frame);
        assert!(dir.path().join("h264").join("1000.h264").exists());
        let stats = sink.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.key, 1);
        assert_eq!(stats.corrupted, 0);
    }

    #[test]
    fn corrupted_frame_goes_to_corrupted_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path());
        let frame = Frame {
            rtp_timestamp: 55,
            data: Bytes::from_static(b"\0\0\0\x01\x65"),
            is_key: false,
            corrupted: true,
        };
        sink.save_frame(&frame);
        assert!(dir.path().join("corrupted_frames").join("55_corrupted.h264").exists());
    }

    #[test]
    fn save_jpeg_writes_to_jpeg_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path());
        sink.save_jpeg(77, false, b"\xff\xd8fake\xff\xd9");
        assert!(dir.path().join("jpeg").join("77.jpg").exists());
        assert_eq!(sink.stats().total, 1);
    }
}
