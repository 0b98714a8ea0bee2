// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Continuous decoder pipeline.
//!
//! A single long-lived child process (by default `ffmpeg`, reading raw
//! H.264 on stdin and writing an MJPEG stream on stdout) turns reassembled
//! frames into JPEGs. Three bounded queues connect three tasks:
//!
//! * `frames` (cap 100): reassembled [`Frame`]s from the packet reader.
//! * `metadata` (cap 300_000): `(rtp_timestamp)` kept alongside `frames` so
//!   the saver can name each JPEG after the frame that produced it.
//! * `decoded` (cap 100): complete JPEGs scraped off the decoder's stdout.
//!
//! All three are non-blocking on the sending side: a full queue drops the
//! newest item rather than stalling the reader thread or the decoder's
//! stdout pump.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::reassembler::Frame;
use crate::client::FrameSink;
use crate::storage::StorageSink;

const FRAMES_CAPACITY: usize = 100;
const METADATA_CAPACITY: usize = 300_000;
const DECODED_CAPACITY: usize = 100;
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);
const JPEG_SOI: &[u8] = &[0xFF, 0xD8];
const JPEG_EOI: &[u8] = &[0xFF, 0xD9];

#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub binary: PathBuf,
    pub args: Vec<String>,
}

impl DecoderConfig {
    /// `ffmpeg` reading Annex B off stdin and writing an MJPEG stream to
    /// stdout.
    pub fn ffmpeg(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: vec![
                "-loglevel".into(),
                "warning".into(),
                "-f".into(),
                "h264".into(),
                "-i".into(),
                "pipe:0".into(),
                "-f".into(),
                "mjpeg".into(),
                "pipe:1".into(),
            ],
        }
    }
}

/// Resolves `binary` against `PATH`. A missing binary disables JPEG mode but
/// is never fatal to the session; the caller falls back to H264-only output.
pub fn find_on_path(binary: &std::path::Path) -> Option<PathBuf> {
    if binary.is_absolute() {
        return binary.is_file().then(|| binary.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

#[derive(Default, Debug, Clone, Copy)]
pub struct Stats {
    pub fed: u64,
    pub decoded: u64,
    pub corrupted_skipped: u64,
    pub metadata_misses: u64,
    pub crashed: bool,
}

struct Shared {
    stats: Mutex<Stats>,
}

/// A long-lived decoder process plus the three tasks that feed and drain it.
///
/// Implements [`FrameSink`] so the packet reader can push reassembled frames
/// in directly; JPEGs land in `storage` as they come off the decoder.
pub struct DecoderPipeline {
    frames_tx: mpsc::Sender<Frame>,
    shared: Arc<Shared>,
    feeder: Option<JoinHandle<Child>>,
    receiver: Option<JoinHandle<()>>,
    saver: Option<JoinHandle<()>>,
}

impl DecoderPipeline {
    /// Spawns the decoder process and its three pump tasks. Returns
    /// `Err(DecoderUnavailable)` if `config.binary` can't be spawned; the
    /// caller should downgrade to H.264-only mode rather than treat this as
    /// fatal.
    pub fn spawn(config: DecoderConfig, storage: StorageSink) -> Result<Self, crate::Error> {
        let mut child = Command::new(&config.binary)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|_| {
                crate::error::wrap!(crate::error::ErrorInt::DecoderUnavailable {
                    binary: config.binary.to_string_lossy().into_owned(),
                })
            })?;

        let stdin = child.stdin.take().expect("stdin piped");
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        tokio::spawn(monitor_stderr(stderr));

        let (frames_tx, frames_rx) = mpsc::channel::<Frame>(FRAMES_CAPACITY);
        let (metadata_tx, metadata_rx) = mpsc::channel::<u32>(METADATA_CAPACITY);
        let (decoded_tx, decoded_rx) = mpsc::channel::<Bytes>(DECODED_CAPACITY);

        let shared = Arc::new(Shared {
            stats: Mutex::new(Stats::default()),
        });

        let feeder = tokio::spawn(feed(frames_rx, metadata_tx, stdin, child, shared.clone()));
        let receiver = tokio::spawn(receive(stdout, decoded_tx, shared.clone()));
        let saver = tokio::spawn(save(decoded_rx, metadata_rx, storage, shared.clone()));

        Ok(Self {
            frames_tx,
            shared,
            feeder: Some(feeder),
            receiver: Some(receiver),
            saver: Some(saver),
        })
    }

    pub fn stats(&self) -> Stats {
        *self.shared.stats.lock()
    }

    /// Stops the feeder (which closes the decoder's stdin and waits on the
    /// child with a deadline, force-killing past it), then waits for the
    /// receiver and saver to drain and exit.
    pub async fn shutdown(mut self) {
        drop(self.frames_tx);
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.await;
        }
        if let Some(receiver) = self.receiver.take() {
            let _ = receiver.await;
        }
        if let Some(saver) = self.saver.take() {
            let _ = saver.await;
        }
    }
}

impl FrameSink for DecoderPipeline {
    fn accept_frame(&mut self, frame: Frame) {
        if self.frames_tx.try_send(frame).is_err() {
            log::warn!("decoder frames queue full or closed; dropping frame");
        }
    }
}

async fn monitor_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.is_empty() {
                    continue;
                }
                if line.to_lowercase().contains("error") {
                    log::warn!("decoder: {}", line);
                } else {
                    log::debug!("decoder: {}", line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("decoder stderr read error: {}", e);
                break;
            }
        }
    }
}

/// Drains `frames`; for each non-corrupted frame, best-effort-pushes its
/// metadata then writes the frame bytes to the decoder's stdin and flushes.
/// Corrupted frames are skipped entirely. Returns the child
/// so the caller's `shutdown` can observe its exit status if it cares to.
async fn feed(
    mut frames_rx: mpsc::Receiver<Frame>,
    metadata_tx: mpsc::Sender<u32>,
    mut stdin: tokio::process::ChildStdin,
    mut child: Child,
    shared: Arc<Shared>,
) -> Child {
    let mut primed = false;
    let mut write_failed = false;
    while let Some(frame) = frames_rx.recv().await {
        if frame.corrupted {
            shared.stats.lock().corrupted_skipped += 1;
            continue;
        }
        if !primed {
            if !frame.is_key {
                // Wait for a keyframe so the decoder's first input starts
                // with SPS/PPS-prefixed IDR data rather than a bare slice.
                continue;
            }
            primed = true;
        }
        if metadata_tx.try_send(frame.rtp_timestamp).is_err() {
            log::debug!("decoder metadata queue full; dropping metadata for timestamp {}", frame.rtp_timestamp);
        }
        if let Err(e) = stdin.write_all(&frame.data).await {
            log::warn!("decoder stdin write failed: {}", e);
            write_failed = true;
            break;
        }
        if let Err(e) = stdin.flush().await {
            log::warn!("decoder stdin flush failed: {}", e);
            write_failed = true;
            break;
        }
        shared.stats.lock().fed += 1;
    }

    // Closes stdin by dropping it, which should cause a well-behaved decoder
    // to flush and exit once it has consumed the remaining input.
    drop(stdin);

    match tokio::time::timeout(SHUTDOWN_DEADLINE, child.wait()).await {
        Ok(Ok(status)) => {
            log::info!("decoder process exited: {}", status);
            if write_failed || !status.success() {
                note_crash(&shared, format!("exited with {}", status));
            }
        }
        Ok(Err(e)) => log::warn!("decoder process wait failed: {}", e),
        Err(_) => {
            log::warn!("decoder process did not exit within {:?}; killing", SHUTDOWN_DEADLINE);
            if let Err(e) = child.start_kill() {
                log::warn!("failed to kill decoder process: {}", e);
            }
            let _ = child.wait().await;
            note_crash(&shared, format!("did not exit within {:?}", SHUTDOWN_DEADLINE));
        }
    }
    child
}

/// Records a decoder crash in `stats` and logs the same [`ErrorInt::DecoderCrashed`]
/// the saver would see if this propagated as a `Result`.
fn note_crash(shared: &Shared, description: String) {
    let err = crate::error::wrap!(crate::error::ErrorInt::DecoderCrashed { description });
    log::error!("{}", err);
    shared.stats.lock().crashed = true;
}

/// Reads the decoder's stdout into a growing buffer and scans for JPEG
/// frame boundaries (SOI `FF D8` / EOI `FF D9`), moving each complete JPEG
/// to `decoded`.
async fn receive(
    mut stdout: tokio::process::ChildStdout,
    decoded_tx: mpsc::Sender<Bytes>,
    shared: Arc<Shared>,
) {
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let mut read_buf = [0u8; 16 * 1024];
    loop {
        let n = match stdout.read(&mut read_buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::warn!("decoder stdout read error: {}", e);
                break;
            }
        };
        buf.put_slice(&read_buf[..n]);

        loop {
            let soi = match find(&buf, JPEG_SOI, 0) {
                Some(soi) => soi,
                None => break,
            };
            let eoi = match find(&buf, JPEG_EOI, soi + JPEG_SOI.len()) {
                Some(eoi) => eoi,
                None => {
                    if soi > 0 {
                        // Discard any junk before the next SOI so the buffer
                        // doesn't grow unbounded while waiting for one.
                        buf.advance(soi);
                    }
                    break;
                }
            };
            let end = eoi + JPEG_EOI.len();
            let jpeg = buf.split_to(end).freeze();
            if decoded_tx.try_send(jpeg).is_err() {
                log::debug!("decoder decoded queue full; dropping JPEG");
            } else {
                shared.stats.lock().decoded += 1;
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Drains `decoded` in order, FIFO-pairing each JPEG with the next metadata
/// entry. Falls back to a monotonically increasing counter when the
/// metadata queue is empty.
async fn save(
    mut decoded_rx: mpsc::Receiver<Bytes>,
    mut metadata_rx: mpsc::Receiver<u32>,
    storage: StorageSink,
    shared: Arc<Shared>,
) {
    let mut fallback_counter: u64 = 0;
    while let Some(jpeg) = decoded_rx.recv().await {
        match metadata_rx.try_recv() {
            Ok(rtp_timestamp) => storage.save_jpeg(rtp_timestamp, false, &jpeg),
            Err(_) => {
                shared.stats.lock().metadata_misses += 1;
                storage.save_jpeg_fallback(fallback_counter, &jpeg);
                fallback_counter += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_locates_needle_after_offset() {
        let hay = b"xx\xff\xd8yyy\xff\xd9zz";
        assert_eq!(find(hay, JPEG_SOI, 0), Some(2));
        assert_eq!(find(hay, JPEG_EOI, 4), Some(7));
    }

    #[test]
    fn find_returns_none_when_absent() {
        let hay = b"no markers here";
        assert_eq!(find(hay, JPEG_SOI, 0), None);
    }

    #[test]
    fn find_on_path_rejects_missing_binary() {
        assert!(find_on_path(std::path::Path::new("definitely-not-a-real-binary-xyz")).is_none());
    }

    #[tokio::test]
    async fn save_task_falls_back_to_counter_when_metadata_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageSink::new(
            crate::storage::StorageConfig {
                output_dir: dir.path().to_path_buf(),
                continuous_h264: false,
            },
            Arc::new(crate::timestamp::TimestampMapper::new()),
        )
        .unwrap();
        let (decoded_tx, decoded_rx) = mpsc::channel::<Bytes>(DECODED_CAPACITY);
        let (_metadata_tx, metadata_rx) = mpsc::channel::<u32>(METADATA_CAPACITY);
        let shared = Arc::new(Shared {
            stats: Mutex::new(Stats::default()),
        });
        decoded_tx
            .send(Bytes::from_static(b"\xff\xd8fake\xff\xd9"))
            .await
            .unwrap();
        drop(decoded_tx);
        save(decoded_rx, metadata_rx, storage.clone(), shared.clone()).await;
        assert_eq!(storage.stats().total, 1);
        assert!(dir.path().join("jpeg").join("0.jpg").exists());
        assert_eq!(shared.stats.lock().metadata_misses, 1);
    }
}
