// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP request/response encoding and SDP parsing.

use std::collections::HashMap;

use bytes::Bytes;
use url::Url;

use crate::error::{bail, ErrorInt};
use crate::{ConnectionContext, RtspMessageContext};

/// One track (`m=` line) of an SDP description.
#[derive(Debug, Clone)]
pub struct SdpTrack {
    pub media: String,
    pub payload_type: u8,
    pub codec_name: String,
    pub clock_rate: u32,
    pub channels: Option<u16>,
    pub fmtp: HashMap<String, String>,
    pub control_url: Url,
}

impl SdpTrack {
    /// Decodes `sprop-parameter-sets` (H.264 out-of-band SPS/PPS, base64,
    /// comma-separated) into Annex-B start-code-prefixed NAL units.
    pub fn sprop_parameter_sets(&self) -> Vec<Bytes> {
        let raw = match self.fmtp.get("sprop-parameter-sets") {
            Some(v) => v,
            None => return Vec::new(),
        };
        raw.split(',')
            .filter_map(|s| base64::decode(s.trim()).ok())
            .map(|nal| {
                let mut out = Vec::with_capacity(nal.len() + 4);
                out.extend_from_slice(&[0, 0, 0, 1]);
                out.extend_from_slice(&nal);
                Bytes::from(out)
            })
            .collect()
    }
}

/// The parsed result of a `DESCRIBE` response.
#[derive(Debug, Clone)]
pub struct SdpInfo {
    pub base_url: Url,
    pub control_url: Url,
    pub tracks: Vec<SdpTrack>,
}

/// Ensures `url` has a trailing `/` on its path, so relative control URLs
/// resolve against the full path rather than dropping its last segment.
fn ensure_trailing_slash(url: &Url) -> Url {
    if url.path().ends_with('/') {
        return url.clone();
    }
    let mut url = url.clone();
    url.set_path(&format!("{}/", url.path()));
    url
}

/// `*` maps to `base` unchanged; otherwise resolves `control` against `base`.
fn resolve_control(base: &Url, control: &str) -> Result<Url, String> {
    if control == "*" {
        return Ok(base.clone());
    }
    base.join(control)
        .map_err(|e| format!("can't join base {} with control {:?}: {}", base, control, e))
}

struct MediaBuilder {
    media: String,
    payload_type: u8,
    clock_rate: Option<u32>,
    codec_name: Option<String>,
    channels: Option<u16>,
    fmtp: HashMap<String, String>,
    control: Option<String>,
}

fn split_once(s: &str, delim: char) -> Option<(&str, &str)> {
    s.find(delim).map(|p| (&s[..p], &s[p + 1..]))
}

/// Parses an SDP body (as returned in a `DESCRIBE` response) into an
/// [`SdpInfo`].
pub fn parse_sdp(base_url: &Url, body: &[u8]) -> Result<SdpInfo, String> {
    let base_url = ensure_trailing_slash(base_url);
    let text = std::str::from_utf8(body).map_err(|e| format!("SDP body is not UTF-8: {}", e))?;

    let mut aggregate_control: Option<String> = None;
    let mut current: Option<MediaBuilder> = None;
    let mut finished: Vec<MediaBuilder> = Vec::new();

    for raw_line in text.split('\n') {
        let line = raw_line.trim_end_matches('\r');
        if line.len() < 2 || line.as_bytes()[1] != b'=' {
            continue;
        }
        let (key, value) = (line.as_bytes()[0], &line[2..]);
        match key {
            b'm' => {
                if let Some(prev) = current.take() {
                    if prev.control.is_some() {
                        finished.push(prev);
                    }
                }
                let mut parts = value.split_whitespace();
                let media = parts.next().unwrap_or_default().to_string();
                let _port = parts.next();
                let _proto = parts.next();
                let pt = parts
                    .next()
                    .and_then(|s| s.parse::<u8>().ok())
                    .ok_or_else(|| format!("bad m= line: {:?}", value))?;
                current = Some(MediaBuilder {
                    media,
                    payload_type: pt,
                    clock_rate: None,
                    codec_name: None,
                    channels: None,
                    fmtp: HashMap::new(),
                    control: None,
                });
            }
            b'a' => {
                let (akey, avalue) = split_once(value, ':').unwrap_or((value, ""));
                match akey {
                    "control" => {
                        if let Some(cur) = current.as_mut() {
                            cur.control = Some(avalue.to_string());
                        } else {
                            aggregate_control = Some(avalue.to_string());
                        }
                    }
                    "rtpmap" => {
                        if let Some(cur) = current.as_mut() {
                            if let Some((pt_str, rest)) = split_once(avalue, ' ') {
                                if pt_str.parse::<u8>() == Ok(cur.payload_type) {
                                    let mut it = rest.splitn(3, '/');
                                    cur.codec_name = it.next().map(|s| s.to_string());
                                    cur.clock_rate = it.next().and_then(|s| s.parse().ok());
                                    cur.channels = it.next().and_then(|s| s.parse().ok());
                                }
                            }
                        }
                    }
                    "fmtp" => {
                        if let Some(cur) = current.as_mut() {
                            if let Some((pt_str, rest)) = split_once(avalue, ' ') {
                                if pt_str.parse::<u8>() == Ok(cur.payload_type) {
                                    for kv in rest.split(';') {
                                        let kv = kv.trim();
                                        if let Some((k, v)) = split_once(kv, '=') {
                                            cur.fmtp.insert(k.trim().to_string(), v.trim().to_string());
                                        }
                                    }
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }
    if let Some(prev) = current.take() {
        if prev.control.is_some() {
            finished.push(prev);
        }
    }

    let control_url = match &aggregate_control {
        Some(c) => resolve_control(&base_url, c)?,
        None => base_url.clone(),
    };

    let mut tracks = Vec::with_capacity(finished.len());
    for m in finished {
        let control = m.control.expect("filtered above");
        let control_url = resolve_control(&base_url, &control)?;
        tracks.push(SdpTrack {
            media: m.media,
            payload_type: m.payload_type,
            codec_name: m.codec_name.unwrap_or_default(),
            clock_rate: m.clock_rate.unwrap_or(0),
            channels: m.channels,
            fmtp: m.fmtp,
            control_url,
        });
    }

    Ok(SdpInfo {
        base_url,
        control_url,
        tracks,
    })
}

/// Parses a `DESCRIBE` response (already checked for 2xx status) into an
/// [`SdpInfo`].
pub fn parse_describe(
    conn_ctx: &ConnectionContext,
    msg_ctx: &RtspMessageContext,
    request_url: &Url,
    response: &rtsp_types::Response<Bytes>,
) -> Result<SdpInfo, crate::Error> {
    let base_url = response
        .header(&rtsp_types::headers::CONTENT_BASE)
        .and_then(|v| Url::parse(v.as_str()).ok())
        .unwrap_or_else(|| request_url.clone());
    parse_sdp(&base_url, response.body()).map_err(|description| {
        crate::error::wrap!(ErrorInt::MalformedResponse {
            conn_ctx: *conn_ctx,
            msg_ctx: *msg_ctx,
            description,
        })
    })
}

/// The parsed `Session`/`Transport` headers of a `SETUP` response.
#[derive(Debug, Clone)]
pub struct SetupResponse {
    pub session_id: String,
    pub timeout: Option<u32>,
    pub interleaved_channels: Option<(u8, u8)>,
    pub server_port: Option<(u16, u16)>,
    pub ssrc: Option<u32>,
}

pub fn parse_setup(
    conn_ctx: &ConnectionContext,
    msg_ctx: &RtspMessageContext,
    response: &rtsp_types::Response<Bytes>,
) -> Result<SetupResponse, crate::Error> {
    let malformed = |description: String| {
        crate::error::wrap!(ErrorInt::MalformedResponse {
            conn_ctx: *conn_ctx,
            msg_ctx: *msg_ctx,
            description,
        })
    };

    let session = response
        .header(&rtsp_types::headers::SESSION)
        .ok_or_else(|| malformed("SETUP response has no Session header".into()))?;
    let mut session_parts = session.as_str().split(';');
    let session_id = session_parts.next().unwrap_or_default().to_string();
    let mut timeout = None;
    for part in session_parts {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("timeout=") {
            timeout = v.parse().ok();
        }
    }

    let transport = response
        .header(&rtsp_types::headers::TRANSPORT)
        .ok_or_else(|| malformed("SETUP response has no Transport header".into()))?;
    let mut interleaved_channels = None;
    let mut server_port = None;
    let mut ssrc = None;
    for part in transport.as_str().split(';') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("interleaved=") {
            interleaved_channels = parse_port_pair(v).map(|(a, b)| (a as u8, b as u8));
        } else if let Some(v) = part.strip_prefix("server_port=") {
            server_port = parse_port_pair(v);
        } else if let Some(v) = part.strip_prefix("ssrc=") {
            ssrc = u32::from_str_radix(v, 16).ok();
        }
    }

    Ok(SetupResponse {
        session_id,
        timeout,
        interleaved_channels,
        server_port,
        ssrc,
    })
}

fn parse_port_pair(s: &str) -> Option<(u16, u16)> {
    let (a, b) = split_once(s, '-')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

/// One entry of a `PLAY` response's `RTP-Info` header.
#[derive(Debug, Clone)]
pub struct RtpInfoEntry {
    pub url: String,
    pub seq: Option<u16>,
    pub rtptime: Option<u32>,
}

pub fn parse_rtp_info(response: &rtsp_types::Response<Bytes>) -> Vec<RtpInfoEntry> {
    let header = match response.header(&rtsp_types::headers::RTP_INFO) {
        Some(h) => h,
        None => return Vec::new(),
    };
    let mut out = Vec::new();
    for entry in header.as_str().split(',') {
        let entry = entry.trim();
        let mut parts = entry.split(';');
        let url = match parts.next().and_then(|p| p.strip_prefix("url=")) {
            Some(u) => u.to_string(),
            None => continue,
        };
        let mut seq = None;
        let mut rtptime = None;
        for part in parts {
            if let Some((k, v)) = split_once(part, '=') {
                match k {
                    "seq" => seq = v.parse().ok(),
                    "rtptime" => rtptime = v.parse().ok(),
                    _ => {}
                }
            }
        }
        out.push(RtpInfoEntry { url, seq, rtptime });
    }
    out
}

/// Builds an RTSP request, inserting `CSeq`, `Session` (if set), and
/// `Authorization` (if given).
pub fn build_request(
    method: rtsp_types::Method,
    uri: Url,
    cseq: u32,
    session_id: Option<&str>,
    authorization: Option<&str>,
    extra_headers: &[(rtsp_types::HeaderName, String)],
) -> rtsp_types::Request<Bytes> {
    let mut builder = rtsp_types::Request::builder(method, rtsp_types::Version::V1_0)
        .request_uri(uri)
        .header(rtsp_types::headers::CSEQ, cseq.to_string())
        .header(rtsp_types::headers::USER_AGENT, "rtsp-jpeg-bridge".to_owned());
    if let Some(session_id) = session_id {
        builder = builder.header(rtsp_types::headers::SESSION, session_id.to_owned());
    }
    if let Some(auth) = authorization {
        builder = builder.header(
            rtsp_types::HeaderName::from_static_str("Authorization").expect("is ascii"),
            auth.to_owned(),
        );
    }
    for (name, value) in extra_headers {
        builder = builder.header(name.clone(), value.clone());
    }
    builder.build(Bytes::new())
}

/// Renders an RTSP method as the uppercase token used in Digest's `A2` and
/// in error messages, without relying on `Method` implementing `Display`
/// the way we need.
pub fn method_name(method: &rtsp_types::Method) -> &'static str {
    use rtsp_types::Method::*;
    match method {
        Describe => "DESCRIBE",
        Announce => "ANNOUNCE",
        GetParameter => "GET_PARAMETER",
        Options => "OPTIONS",
        Pause => "PAUSE",
        Play => "PLAY",
        PlayNotify => "PLAY_NOTIFY",
        Record => "RECORD",
        Redirect => "REDIRECT",
        Setup => "SETUP",
        SetParameter => "SET_PARAMETER",
        Teardown => "TEARDOWN",
        _ => "UNKNOWN",
    }
}

/// Extracts the numeric CSeq from a response, or `None` if missing/unparseable.
pub fn response_cseq(response: &rtsp_types::Response<Bytes>) -> Option<u32> {
    response
        .header(&rtsp_types::headers::CSEQ)
        .and_then(|v| v.as_str().parse().ok())
}

/// Checks a response status is 2xx, else returns the appropriate typed
/// error (dispatch for 3xx/401/454/5xx is the state machine's job; this
/// just classifies the leftover failure cases).
pub fn require_success(
    method: &str,
    url: &str,
    response: &rtsp_types::Response<Bytes>,
) -> Result<(), crate::Error> {
    if response.status().is_success() {
        return Ok(());
    }
    bail!(ErrorInt::RtspStatusError {
        method: method.to_string(),
        url: url.to_string(),
        status: response.status(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDP: &[u8] = b"v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=stream\r\n\
c=IN IP4 127.0.0.1\r\n\
t=0 0\r\n\
a=control:*\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=fmtp:96 packetization-mode=1;sprop-parameter-sets=Z0IACpZTBYmI,aM48gA==\r\n\
a=control:trackID=0\r\n";

    #[test]
    fn parses_one_video_track() {
        let base = Url::parse("rtsp://host/stream/").unwrap();
        let info = parse_sdp(&base, SDP).unwrap();
        assert_eq!(info.tracks.len(), 1);
        let t = &info.tracks[0];
        assert_eq!(t.media, "video");
        assert_eq!(t.payload_type, 96);
        assert_eq!(t.codec_name, "H264");
        assert_eq!(t.clock_rate, 90_000);
        assert_eq!(t.control_url.as_str(), "rtsp://host/stream/trackID=0");
        let sets = t.sprop_parameter_sets();
        assert_eq!(sets.len(), 2);
        assert_eq!(&sets[0][..4], &[0, 0, 0, 1]);
    }

    #[test]
    fn star_control_resolves_to_base() {
        let base = Url::parse("rtsp://host/stream/").unwrap();
        let info = parse_sdp(&base, SDP).unwrap();
        assert_eq!(info.control_url, base);
    }

    #[test]
    fn parse_port_pair_rejects_garbage() {
        assert_eq!(parse_port_pair("0-1"), Some((0, 1)));
        assert_eq!(parse_port_pair("nope"), None);
    }
}
