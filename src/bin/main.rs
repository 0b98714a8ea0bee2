// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Binary entry point: parses flags/config, negotiates an RTSP session for
//! the first H.264 video track, and runs the reader loop that feeds the
//! reassembler, the storage sink, and (if enabled) the decoder pipeline
//! until interrupted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{error, info, warn};

use rtsp_jpeg_bridge::client::{self, reassembler::Reassembler, transport::DemuxedPacket, FrameSink};
use rtsp_jpeg_bridge::config::{self, Opt, Settings};
use rtsp_jpeg_bridge::decoder::{DecoderConfig, DecoderPipeline};
use rtsp_jpeg_bridge::rtcp;
use rtsp_jpeg_bridge::storage::{StorageConfig, StorageSink};
use rtsp_jpeg_bridge::timestamp::TimestampMapper;
use rtsp_jpeg_bridge::{ConnectionContext, RtspMessageContext};

const STATS_INTERVAL: Duration = Duration::from_secs(5);
const REORDER_WINDOW: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() {
    let opt = Opt::parse();
    init_logging(opt.verbose);

    if let Err(e) = main_inner(opt).await {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
    info!("shutdown complete");
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
}

async fn main_inner(opt: Opt) -> Result<(), rtsp_jpeg_bridge::Error> {
    let settings = config::resolve(opt)?;

    let client_config = client::ClientConfig {
        url: settings.rtsp_url.clone(),
        credentials: settings.credentials.clone(),
        transport: client::TransportPreference::TcpInterleaved,
        read_timeout: settings.timeout,
        retry: client::RetryConfig::default(),
    };

    let mut session = client::Session::connect(client_config).await?;
    info!("connected to {}", session.conn_ctx());

    if let Err(e) = session.options().await {
        warn!("OPTIONS failed (continuing): {}", e);
    }

    let sdp = session.describe().await?;
    let (mut track_index, mut track) = match select_video_track(&sdp.tracks) {
        Some(found) => found,
        None => {
            warn!("no video track in SDP; nothing to do");
            return Ok(());
        }
    };
    if !track.codec_name.eq_ignore_ascii_case("h264") {
        warn!(
            "video track codec is {:?}, not H264; this build only reassembles H264, exiting",
            track.codec_name
        );
        return Ok(());
    }
    let mut clock_rate = track.clock_rate.max(1);

    setup_all_tracks(&mut session, &sdp, track_index).await?;
    session.play(None).await?;
    info!("playing; clock_rate={}", clock_rate);

    let mapper = Arc::new(TimestampMapper::new());
    let storage = StorageSink::new(
        StorageConfig {
            output_dir: settings.output_dir.clone(),
            continuous_h264: false,
        },
        mapper.clone(),
    )?;

    let mut decoder = spawn_decoder(&settings, storage.clone());

    let mut reassembler = Reassembler::new(REORDER_WINDOW, false);
    reassembler.seed_parameter_sets(&track.sprop_parameter_sets());
    let mut conn_ctx = *session.conn_ctx();

    let keep_alive_interval = session.keep_alive_interval();
    let now = tokio::time::Instant::now();
    let mut keep_alive_tick = tokio::time::interval_at(now + keep_alive_interval, keep_alive_interval);
    let mut stats_tick = tokio::time::interval_at(now + STATS_INTERVAL, STATS_INTERVAL);

    info!("keep-alive every {:?}", keep_alive_interval);

    let mut consecutive_errors: u32 = 0;
    let mut recovery_attempts: u64 = 0;

    loop {
        tokio::select! {
            packet = session.next_packet() => {
                match packet {
                    Ok(packet) => {
                        consecutive_errors = 0;
                        handle_packet(
                            packet,
                            &conn_ctx,
                            clock_rate,
                            &mapper,
                            &mut reassembler,
                            &storage,
                            decoder.as_mut(),
                        );
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        warn!(
                            "packet read error ({}/{}): {}",
                            consecutive_errors, settings.recovery_threshold, e
                        );
                        if consecutive_errors >= settings.recovery_threshold {
                            recovery_attempts += 1;
                            info!("recovery attempt {}: reconnecting", recovery_attempts);
                            match recover_session(&mut session).await {
                                Ok(None) => {
                                    consecutive_errors = 0;
                                    conn_ctx = *session.conn_ctx();
                                    info!("session recovered via reconnect + PLAY replay");
                                }
                                Ok(Some((_new_sdp, new_index, new_track))) => {
                                    consecutive_errors = 0;
                                    conn_ctx = *session.conn_ctx();
                                    track_index = new_index;
                                    track = new_track;
                                    clock_rate = track.clock_rate.max(1);
                                    reassembler = Reassembler::new(REORDER_WINDOW, false);
                                    reassembler.seed_parameter_sets(&track.sprop_parameter_sets());
                                    info!(
                                        "session recovered via full DESCRIBE restart; track_index={} clock_rate={}",
                                        track_index, clock_rate
                                    );
                                }
                                Err(e) => {
                                    error!("session recovery failed: {}", e);
                                    return Err(e);
                                }
                            }
                        }
                    }
                }
            }
            _ = keep_alive_tick.tick() => {
                if let Err(e) = session.keep_alive(None).await {
                    warn!("keep-alive failed: {}", e);
                }
            }
            _ = stats_tick.tick() => {
                log_stats(&reassembler, &storage, decoder.as_ref(), recovery_attempts);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received interrupt; tearing down");
                break;
            }
        }
    }

    if let Err(e) = session.teardown(None).await {
        warn!("TEARDOWN failed: {}", e);
    }
    if let Some(decoder) = decoder.take() {
        decoder.shutdown().await;
    }
    log_stats(&reassembler, &storage, None, recovery_attempts);

    Ok(())
}

/// Issues SETUP for every track in `sdp`, selecting (for transport/routing
/// purposes) only `selected_index`. A non-selected track's SETUP failure is
/// logged and ignored; the selected track's is fatal.
async fn setup_all_tracks(
    session: &mut client::Session,
    sdp: &client::parse::SdpInfo,
    selected_index: usize,
) -> Result<(), rtsp_jpeg_bridge::Error> {
    for (i, t) in sdp.tracks.iter().enumerate() {
        let select = i == selected_index;
        if let Err(e) = session.setup(t, i as u8, select).await {
            if select {
                return Err(e);
            }
            warn!("SETUP failed for non-selected track {} ({}): {}", i, t.media, e);
        }
    }
    Ok(())
}

/// Recovers a session after too many consecutive packet-read errors: first
/// tries a plain reconnect and PLAY replay (reusing the cached session id);
/// if the server reports SessionNotFound a second time, restarts fully from
/// DESCRIBE. Returns `Ok(Some(..))` with the freshly negotiated SDP/track
/// when a full restart happened, `Ok(None)` when the plain replay sufficed.
async fn recover_session(
    session: &mut client::Session,
) -> Result<Option<(client::parse::SdpInfo, usize, client::parse::SdpTrack)>, rtsp_jpeg_bridge::Error> {
    session.reconnect().await?;
    match session.play(None).await {
        Ok(_) => Ok(None),
        Err(e) if e.is_session_not_found() => {
            warn!("PLAY replay hit SessionNotFound; restarting from DESCRIBE");
            let sdp = session.describe().await?;
            let (track_index, track) = select_video_track(&sdp.tracks).ok_or_else(|| {
                rtsp_jpeg_bridge::Error::invalid_config("no video track found in SDP during recovery restart")
            })?;
            setup_all_tracks(session, &sdp, track_index).await?;
            session.play(None).await?;
            Ok(Some((sdp, track_index, track)))
        }
        Err(e) => Err(e),
    }
}

fn select_video_track(tracks: &[client::parse::SdpTrack]) -> Option<(usize, client::parse::SdpTrack)> {
    tracks
        .iter()
        .enumerate()
        .find(|(_, t)| t.media == "video")
        .map(|(i, t)| (i, t.clone()))
}

fn spawn_decoder(settings: &Settings, storage: StorageSink) -> Option<DecoderPipeline> {
    if !settings.save_jpeg {
        return None;
    }
    let config = DecoderConfig::ffmpeg(settings.decoder_binary.clone());
    match DecoderPipeline::spawn(config, storage) {
        Ok(pipeline) => Some(pipeline),
        Err(e) => {
            warn!("decoder unavailable, continuing H264-only: {}", e);
            None
        }
    }
}

fn handle_packet(
    packet: DemuxedPacket,
    conn_ctx: &ConnectionContext,
    clock_rate: u32,
    mapper: &Arc<TimestampMapper>,
    reassembler: &mut Reassembler,
    storage: &StorageSink,
    mut decoder: Option<&mut DecoderPipeline>,
) {
    match packet {
        DemuxedPacket::Rtp(data) => {
            let msg_ctx = RtspMessageContext::dummy();
            let pkt = match client::rtp::parse(conn_ctx, &msg_ctx, 0, data) {
                Ok(pkt) => pkt,
                Err(e) => {
                    warn!("dropping unparseable RTP packet: {}", e);
                    return;
                }
            };
            let frames = reassembler.insert(&pkt, Instant::now());
            for frame in frames {
                if let Some(decoder) = decoder.as_mut() {
                    decoder.accept_frame(frame.clone());
                }
                storage.save_frame(&frame);
            }
        }
        DemuxedPacket::Rtcp(data) => {
            let mut rest: &[u8] = &data;
            while !rest.is_empty() {
                let (pkt, remaining) = match rtcp::Packet::parse(rest) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!("dropping malformed RTCP packet: {}", e);
                        break;
                    }
                };
                if let rtcp::Packet::SenderReport(sr) = pkt {
                    mapper.update(sr.ntp_timestamp(), sr.rtp_timestamp(), clock_rate);
                }
                rest = remaining;
            }
        }
    }
}

fn log_stats(reassembler: &Reassembler, storage: &StorageSink, decoder: Option<&DecoderPipeline>, recovery_attempts: u64) {
    let r = reassembler.stats();
    let s = storage.stats();
    match decoder {
        Some(d) => {
            let d = d.stats();
            info!(
                "frames={} key={} corrupted={} ssrc_changes={} saved={} saved_bytes={} decoder_fed={} decoded={} metadata_misses={} decoder_crashed={} recovery_attempts={}",
                r.total_frames, s.key, r.corrupted_frames, r.ssrc_changes, s.total, s.total_bytes, d.fed, d.decoded, d.metadata_misses, d.crashed, recovery_attempts
            );
        }
        None => {
            info!(
                "frames={} key={} corrupted={} ssrc_changes={} saved={} saved_bytes={} recovery_attempts={}",
                r.total_frames, s.key, r.corrupted_frames, r.ssrc_changes, s.total, s.total_bytes, recovery_attempts
            );
        }
    }
}
