// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types. See [`ErrorInt`] for the taxonomy; [`Error`] is the cheaply
//! cloneable wrapper returned to callers.

use std::sync::Arc;

use crate::{ConnectionContext, RtspMessageContext};

/// An error wrapping an [`ErrorInt`] behind an `Arc` so it can be cheaply
/// cloned and sent across task boundaries (eg from the reader task into a
/// statistics snapshot).
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns true if this error should be treated as retryable by the
    /// exponential-backoff policy: connection failures, timeouts, and the
    /// RTSP status codes in the retryable set `{408, 500, 502, 503, 504}`.
    pub fn is_retryable(&self) -> bool {
        match &*self.0 {
            ErrorInt::ConnectionFailed { .. } | ErrorInt::Timeout { .. } => true,
            ErrorInt::RtspStatusError { status, .. } => {
                matches!(u16::from(*status), 408 | 500 | 502 | 503 | 504)
            }
            _ => false,
        }
    }

    pub fn is_session_not_found(&self) -> bool {
        matches!(&*self.0, ErrorInt::SessionNotFound { .. })
    }

    /// Builds a fatal, non-retryable error for conditions the binary
    /// detects itself (eg no video track survives a recovery restart)
    /// rather than the library's own protocol/transport code paths.
    pub fn invalid_config(description: impl Into<String>) -> Self {
        ErrorInt::InvalidConfig {
            description: description.into(),
        }
        .into()
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&*self.0, f)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&*self.0)
    }
}

impl From<ErrorInt> for Error {
    fn from(e: ErrorInt) -> Self {
        Error(Arc::new(e))
    }
}

/// Each variant names its own retry/propagation policy in its doc comment
/// rather than in a side table.
#[derive(thiserror::Error, Debug)]
pub(crate) enum ErrorInt {
    /// Refuse startup; not retryable.
    #[error("invalid URL {url:?}: {description}")]
    InvalidUrl { url: String, description: String },

    /// Refuse startup; not retryable.
    #[error("unsupported URL scheme {scheme:?}; only rtsp:// is supported")]
    UnsupportedScheme { scheme: String },

    /// Refuse startup; not retryable.
    #[error("invalid configuration: {description}")]
    InvalidConfig { description: String },

    /// Retryable; feeds the backoff loop.
    #[error("[{conn_ctx}] connection failed: {description}")]
    ConnectionFailed {
        conn_ctx: ConnectionContext,
        description: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Retryable; feeds the backoff loop.
    #[error("[{conn_ctx}] timed out waiting for {description}")]
    Timeout {
        conn_ctx: ConnectionContext,
        description: String,
    },

    #[error("[{conn_ctx}] malformed RTSP response at {msg_ctx}: {description}")]
    MalformedResponse {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    #[error("[{conn_ctx}] invalid RTP version in packet at {msg_ctx} channel={channel_id}")]
    InvalidVersion {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        channel_id: u8,
    },

    #[error("[{conn_ctx}] truncated interleaved frame at {msg_ctx}: {description}")]
    Truncated {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    #[error("malformed WWW-Authenticate challenge: {description}")]
    MalformedAuthChallenge { description: String },

    /// Wraps any non-2xx response that survived redirect/auth/backoff
    /// handling. Fatal for the current request.
    #[error("{method} {url} returned {status}")]
    RtspStatusError {
        method: String,
        url: String,
        status: rtsp_types::StatusCode,
    },

    /// Fatal for the current session; caller decides whether to restart
    /// from DESCRIBE.
    #[error("too many redirects (> 10) starting from {original_url}")]
    TooManyRedirects { original_url: String },

    /// Fatal for the current session; a 454 response. Caller must restart
    /// from DESCRIBE.
    #[error("[{conn_ctx}] session not found (454); session must restart from DESCRIBE")]
    SessionNotFound { conn_ctx: ConnectionContext },

    /// Never fatal; the saver downgrades to H.264-only mode.
    #[error("decoder binary {binary:?} not found on PATH; disabling JPEG output")]
    DecoderUnavailable { binary: String },

    /// Stops the JPEG pipeline only; raw-frame saving continues.
    #[error("decoder process exited unexpectedly: {description}")]
    DecoderCrashed { description: String },

    /// Per-packet drop; counted, never fatal.
    #[error("packet parse error: {description}")]
    PacketParseError { description: String },

    /// Logged, per-frame drop; never fatal.
    #[error("I/O error saving {path:?}: {source}")]
    IoError {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

/// Wraps the supplied `ErrorInt` into an `Error` value without returning.
macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

pub(crate) use bail;
pub(crate) use wrap;
