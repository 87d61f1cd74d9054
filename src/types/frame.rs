use super::error::{CodecError, ErrorCode};
use super::header::Header;
use super::priority::RequestPriority;
use bytes::Bytes;
use std::collections::BTreeMap;

// SETTINGS identifiers (RFC 7540 Section 6.5.2). Codecs for other wire
// formats translate their ids onto these.
pub const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
pub const SETTINGS_ENABLE_PUSH: u16 = 0x2;
pub const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
pub const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// Remembered or advertised SETTINGS values keyed by identifier.
pub type SettingsMap = BTreeMap<u16, u32>;

/// Kind of an outbound frame as seen by the write scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Initial HEADERS of a locally-initiated stream. The stream receives its
    /// id when an entry of this type is dequeued.
    OpenStream,
    Headers,
    Data,
    RstStream,
    Settings,
    Ping,
    GoAway,
    WindowUpdate,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    pub parent_stream_id: u32,
    pub exclusive: bool,
    pub weight: u16,
}

/// A typed outbound frame handed to the codec for serialization.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Headers {
        stream_id: u32,
        headers: Vec<Header>,
        end_stream: bool,
        priority: Option<PrioritySpec>,
    },
    Data {
        stream_id: u32,
        payload: Bytes,
        end_stream: bool,
    },
    RstStream {
        stream_id: u32,
        code: ErrorCode,
    },
    Settings {
        values: Vec<(u16, u32)>,
    },
    SettingsAck,
    Ping {
        id: u64,
        ack: bool,
    },
    GoAway {
        last_stream_id: u32,
        code: ErrorCode,
        debug_data: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
}

impl Frame {
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Headers { stream_id, .. }
            | Frame::Data { stream_id, .. }
            | Frame::RstStream { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. } => *stream_id,
            Frame::Settings { .. }
            | Frame::SettingsAck
            | Frame::Ping { .. }
            | Frame::GoAway { .. } => 0,
        }
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Headers { .. } => FrameType::Headers,
            Frame::Data { .. } => FrameType::Data,
            Frame::RstStream { .. } => FrameType::RstStream,
            Frame::Settings { .. } | Frame::SettingsAck => FrameType::Settings,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::GoAway { .. } => FrameType::GoAway,
            Frame::WindowUpdate { .. } => FrameType::WindowUpdate,
        }
    }

    pub fn is_end_stream(&self) -> bool {
        match self {
            Frame::Headers { end_stream, .. } | Frame::Data { end_stream, .. } => *end_stream,
            _ => false,
        }
    }
}

/// Decoded inbound frame, consumed by `Session::handle_event`.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    /// Peer-initiated stream carrying its response headers in the opening
    /// frame. HTTP/2 announces pushes with `PushPromise` instead.
    StreamOpen {
        stream_id: u32,
        associated_stream_id: u32,
        priority: RequestPriority,
        end_stream: bool,
        headers: Vec<Header>,
    },
    Headers {
        stream_id: u32,
        headers: Vec<Header>,
        end_stream: bool,
        priority: Option<PrioritySpec>,
    },
    Data {
        stream_id: u32,
        payload: Bytes,
        end_stream: bool,
    },
    /// Padding bytes counted against flow control but not delivered.
    Padding {
        stream_id: u32,
        len: usize,
    },
    RstStream {
        stream_id: u32,
        code: ErrorCode,
    },
    Settings {
        clear_persisted: bool,
        values: Vec<(u16, u32)>,
    },
    SettingsAck,
    Ping {
        id: u64,
        ack: bool,
    },
    GoAway {
        last_stream_id: u32,
        code: ErrorCode,
        debug_data: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        delta: i32,
    },
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
        headers: Vec<Header>,
    },
    /// A frame-level problem confined to one stream.
    StreamError {
        stream_id: u32,
        description: String,
    },
    Unknown {
        stream_id: u32,
        frame_type: u8,
    },
}

/// Wire format collaborator. The engine encodes typed frames through it and
/// feeds it raw transport bytes.
pub trait FrameCodec {
    /// Bytes written once before anything else on a new connection.
    fn connection_preface(&self) -> Option<Bytes> {
        None
    }

    fn encode(&mut self, frame: &Frame) -> Result<Bytes, CodecError>;

    /// Consumes a prefix of `data`, pushing events for every frame that
    /// completes. Returns the number of bytes consumed, which is non-zero
    /// whenever `data` is non-empty.
    fn process_input(
        &mut self,
        data: &[u8],
        events: &mut Vec<FrameEvent>,
    ) -> Result<usize, CodecError>;

    /// Peer raised or lowered its maximum frame size.
    fn set_max_frame_size(&mut self, _size: usize) {}

    /// Peer changed its header table size.
    fn set_header_table_size(&mut self, _size: usize) {}
}
