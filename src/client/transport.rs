// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transport multiplex: a UDP RTP/RTCP socket pair, or the `$`-framed
//! channels of a TCP-interleaved connection. Demultiplexing is a
//! single parity rule in both modes: even channels carry RTP, odd carry
//! RTCP.

use bytes::Bytes;
use tokio::net::UdpSocket;

use crate::error::{bail, ErrorInt};
use crate::ConnectionContext;

/// Whether a channel/port pair index carries RTP or RTCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    Rtp,
    Rtcp,
}

/// Even channels are RTP, odd are RTCP.
#[inline]
pub fn parity(channel_id: u8) -> Parity {
    if channel_id % 2 == 0 {
        Parity::Rtp
    } else {
        Parity::Rtcp
    }
}

/// A demultiplexed packet, tagged by which logical stream it came from.
#[derive(Debug)]
pub enum DemuxedPacket {
    Rtp(Bytes),
    Rtcp(Bytes),
}

/// A bound UDP RTP+RTCP socket pair for one track: two successive UDP
/// sockets (RTP+RTCP) starting at `client_port`.
pub struct UdpTransport {
    rtp: UdpSocket,
    rtcp: UdpSocket,
    server_addr: std::net::IpAddr,
    server_rtp_port: Option<u16>,
    server_rtcp_port: Option<u16>,
}

impl UdpTransport {
    /// Binds `client_port` for RTP and `client_port + 1` for RTCP, falling
    /// back to 50000/50001 if `client_port` is `None`.
    pub async fn bind(
        conn_ctx: &ConnectionContext,
        local_addr: std::net::IpAddr,
        client_port: Option<u16>,
        server_addr: std::net::IpAddr,
    ) -> Result<Self, crate::Error> {
        let base = client_port.unwrap_or(50000);
        let rtp = UdpSocket::bind((local_addr, base)).await.map_err(|source| {
            crate::error::wrap!(ErrorInt::ConnectionFailed {
                conn_ctx: *conn_ctx,
                description: format!("binding RTP UDP port {}", base),
                source: Some(source),
            })
        })?;
        let rtcp = UdpSocket::bind((local_addr, base + 1)).await.map_err(|source| {
            crate::error::wrap!(ErrorInt::ConnectionFailed {
                conn_ctx: *conn_ctx,
                description: format!("binding RTCP UDP port {}", base + 1),
                source: Some(source),
            })
        })?;
        Ok(Self {
            rtp,
            rtcp,
            server_addr,
            server_rtp_port: None,
            server_rtcp_port: None,
        })
    }

    pub fn client_rtp_port(&self) -> std::io::Result<u16> {
        Ok(self.rtp.local_addr()?.port())
    }

    pub fn client_rtcp_port(&self) -> std::io::Result<u16> {
        Ok(self.rtcp.local_addr()?.port())
    }

    /// Records the server's reply `server_port=a-b` so outgoing RTCP
    /// (receiver reports) know where to send.
    pub fn set_server_ports(&mut self, rtp_port: u16, rtcp_port: u16) {
        self.server_rtp_port = Some(rtp_port);
        self.server_rtcp_port = Some(rtcp_port);
        let _ = self.rtp.connect((self.server_addr, rtp_port));
        let _ = self.rtcp.connect((self.server_addr, rtcp_port));
    }

    /// Awaits the next datagram on either socket, tagging it by stream.
    pub async fn recv(&self) -> std::io::Result<DemuxedPacket> {
        let mut rtp_buf = [0u8; 2048];
        let mut rtcp_buf = [0u8; 2048];
        tokio::select! {
            r = self.rtp.recv(&mut rtp_buf) => {
                let n = r?;
                Ok(DemuxedPacket::Rtp(Bytes::copy_from_slice(&rtp_buf[..n])))
            }
            r = self.rtcp.recv(&mut rtcp_buf) => {
                let n = r?;
                Ok(DemuxedPacket::Rtcp(Bytes::copy_from_slice(&rtcp_buf[..n])))
            }
        }
    }
}

/// Routes a `$`-framed interleaved payload to RTP or RTCP by channel parity.
/// Non-video-track channels are skipped upstream: the caller only invokes
/// this for channels belonging to the selected track.
pub fn demux_interleaved(channel_id: u8, payload: Bytes) -> DemuxedPacket {
    match parity(channel_id) {
        Parity::Rtp => DemuxedPacket::Rtp(payload),
        Parity::Rtcp => DemuxedPacket::Rtcp(payload),
    }
}

/// Validates a SETUP response's `interleaved=X-Y` channel pair is adjacent:
/// RTP/RTCP channels are always assigned as `(2k, 2k+1)`.
pub fn validate_channel_pair(conn_ctx: &ConnectionContext, rtp_channel: u8, rtcp_channel: u8) -> Result<(), crate::Error> {
    if rtcp_channel != rtp_channel + 1 {
        bail!(ErrorInt::MalformedResponse {
            conn_ctx: *conn_ctx,
            msg_ctx: crate::RtspMessageContext::dummy(),
            description: format!(
                "expected adjacent interleaved channels, got {}-{}",
                rtp_channel, rtcp_channel
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity_is_even_odd() {
        assert_eq!(parity(0), Parity::Rtp);
        assert_eq!(parity(1), Parity::Rtcp);
        assert_eq!(parity(4), Parity::Rtp);
        assert_eq!(parity(5), Parity::Rtcp);
    }

    #[test]
    fn validate_channel_pair_rejects_nonadjacent() {
        let ctx = ConnectionContext::dummy();
        assert!(validate_channel_pair(&ctx, 0, 1).is_ok());
        assert!(validate_channel_pair(&ctx, 0, 2).is_err());
    }
}
