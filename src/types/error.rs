use std::io;

/// Errors surfaced by the session engine to stream owners and pending
/// requests. `Clone` because one session-wide failure is handed to every
/// stream and request it tears down.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection reset")]
    ConnectionReset,

    #[error("io error ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },

    #[error("aborted")]
    Aborted,

    /// Session is going away and cannot accept new streams.
    #[error("session is going away")]
    Failed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("flow control error: {0}")]
    FlowControl(String),

    #[error("frame size error")]
    FrameSize,

    #[error("header compression error")]
    Compression,

    #[error("ping failed: connection unresponsive")]
    PingFailed,

    #[error("server refused stream")]
    ServerRefusedStream,

    #[error("HTTP/1.1 required")]
    Http11Required,

    #[error("invalid or closed stream")]
    InvalidStream,

    #[error("stream reset by peer: {0}")]
    StreamReset(ErrorCode),

    #[error("certificate error: {0}")]
    CertificateError(String),

    #[error("timed out")]
    TimedOut,

    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Where an error is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Resets one stream, session stays usable.
    Stream,
    /// Drains the whole session.
    Session,
    /// Transport failure; drains the session.
    Transport,
    /// Stream creation could not be satisfied.
    Capacity,
}

impl Error {
    pub fn scope(&self) -> ErrorScope {
        match self {
            Error::StreamReset(_) | Error::ServerRefusedStream | Error::InvalidStream => {
                ErrorScope::Stream
            }
            Error::ConnectionClosed | Error::ConnectionReset | Error::Io { .. } => {
                ErrorScope::Transport
            }
            Error::Failed | Error::Aborted | Error::TimedOut => ErrorScope::Capacity,
            Error::Protocol(_)
            | Error::FlowControl(_)
            | Error::FrameSize
            | Error::Compression
            | Error::PingFailed
            | Error::Http11Required
            | Error::CertificateError(_)
            | Error::InvalidState(_) => ErrorScope::Session,
        }
    }

    /// Errors that are themselves about the connection going away. No GOAWAY
    /// is written when draining for one of these.
    pub(crate) fn suppresses_goaway(&self) -> bool {
        matches!(
            self,
            Error::Aborted
                | Error::Http11Required
                | Error::ConnectionClosed
                | Error::ConnectionReset
        ) || matches!(self, Error::Io { kind, .. } if *kind == io::ErrorKind::NotConnected)
    }

    /// Status carried by the GOAWAY written when draining with this error.
    pub fn goaway_code(&self) -> ErrorCode {
        match self {
            Error::FlowControl(_) => ErrorCode::FlowControlError,
            Error::FrameSize => ErrorCode::FrameSizeError,
            Error::Compression => ErrorCode::CompressionError,
            Error::CertificateError(_) => ErrorCode::InadequateSecurity,
            _ => ErrorCode::ProtocolError,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset => Error::ConnectionReset,
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => Error::ConnectionClosed,
            io::ErrorKind::TimedOut => Error::TimedOut,
            kind => Error::Io {
                kind,
                message: err.to_string(),
            },
        }
    }
}

/// Failures reported by a frame codec while decoding or encoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("invalid control frame")]
    InvalidControlFrame,

    #[error("control frame payload too large")]
    ControlPayloadTooLarge,

    #[error("frame exceeds maximum size ({0} bytes)")]
    FrameTooLarge(usize),

    #[error("header decompression failed")]
    DecompressFailure,

    #[error("header compression failed")]
    CompressFailure,

    #[error("header list too large ({0} bytes)")]
    HeaderListTooLarge(usize),

    #[error("invalid DATA frame flags")]
    InvalidDataFrameFlags,

    #[error("invalid padding")]
    InvalidPadding,

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),

    #[error("malformed GOAWAY frame")]
    GoAwayFrameCorrupt,

    #[error("malformed RST_STREAM frame")]
    RstStreamFrameCorrupt,

    #[error("invalid connection preface")]
    InvalidPreface,
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::DecompressFailure | CodecError::CompressFailure => Error::Compression,
            CodecError::FrameTooLarge(_) | CodecError::ControlPayloadTooLarge => Error::FrameSize,
            other => Error::Protocol(other.to_string()),
        }
    }
}

// HTTP/2 Error Codes (RFC 7540 Section 7)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (name, description) = match self {
            ErrorCode::NoError => ("NO_ERROR", "graceful shutdown"),
            ErrorCode::ProtocolError => ("PROTOCOL_ERROR", "protocol error detected"),
            ErrorCode::InternalError => ("INTERNAL_ERROR", "implementation fault"),
            ErrorCode::FlowControlError => {
                ("FLOW_CONTROL_ERROR", "flow control protocol violated")
            }
            ErrorCode::SettingsTimeout => ("SETTINGS_TIMEOUT", "settings not acknowledged"),
            ErrorCode::StreamClosed => ("STREAM_CLOSED", "frame received for closed stream"),
            ErrorCode::FrameSizeError => ("FRAME_SIZE_ERROR", "frame size incorrect"),
            ErrorCode::RefusedStream => ("REFUSED_STREAM", "stream not processed"),
            ErrorCode::Cancel => ("CANCEL", "stream cancelled"),
            ErrorCode::CompressionError => ("COMPRESSION_ERROR", "compression state not updated"),
            ErrorCode::ConnectError => {
                ("CONNECT_ERROR", "TCP connection error for CONNECT method")
            }
            ErrorCode::EnhanceYourCalm => ("ENHANCE_YOUR_CALM", "processing capacity exceeded"),
            ErrorCode::InadequateSecurity => (
                "INADEQUATE_SECURITY",
                "negotiated TLS parameters inadequate",
            ),
            ErrorCode::Http11Required => ("HTTP_1_1_REQUIRED", "use HTTP/1.1 for request"),
        };
        write!(f, "{} (0x{:x}): {}", name, *self as u32, description)
    }
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x2 => ErrorCode::InternalError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            _ => ErrorCode::InternalError, // Default for unknown error codes
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goaway_status_defaults_to_protocol_error() {
        assert_eq!(Error::FlowControl("x".into()).goaway_code(), ErrorCode::FlowControlError);
        assert_eq!(
            Error::CertificateError("expired".into()).goaway_code(),
            ErrorCode::InadequateSecurity
        );
        assert_eq!(Error::PingFailed.goaway_code(), ErrorCode::ProtocolError);
        assert_eq!(Error::TimedOut.goaway_code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn connection_errors_suppress_goaway() {
        assert!(Error::ConnectionClosed.suppresses_goaway());
        assert!(Error::Http11Required.suppresses_goaway());
        assert!(!Error::PingFailed.suppresses_goaway());
        let not_connected: Error = io::Error::new(io::ErrorKind::NotConnected, "gone").into();
        assert!(not_connected.suppresses_goaway());
    }

    #[test]
    fn io_errors_map_to_transport_scope() {
        let reset: Error = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(reset, Error::ConnectionReset);
        assert_eq!(reset.scope(), ErrorScope::Transport);
        let eof: Error = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert_eq!(eof, Error::ConnectionClosed);
    }

    #[test]
    fn codec_errors_map_to_session_errors() {
        assert_eq!(Error::from(CodecError::DecompressFailure), Error::Compression);
        assert_eq!(Error::from(CodecError::FrameTooLarge(70_000)), Error::FrameSize);
        assert!(matches!(Error::from(CodecError::InvalidPreface), Error::Protocol(_)));
        assert_eq!(ErrorCode::from(0x42u32), ErrorCode::InternalError);
    }
}
