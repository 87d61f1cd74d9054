/// HTTP/2 connection preface (RFC 7540 Section 3.5)
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default Settings Values
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4_096;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Largest decoded header list accepted from the peer.
pub const MAX_HEADER_LIST_SIZE: usize = 256 * 1024;

/// Frame/flag constants (RFC 7540 Section 4)
pub const FRAME_HEADER_SIZE: usize = 9;

pub const DATA_FRAME_TYPE: u8 = 0x0;
pub const HEADERS_FRAME_TYPE: u8 = 0x1;
pub const PRIORITY_FRAME_TYPE: u8 = 0x2;
pub const RST_STREAM_FRAME_TYPE: u8 = 0x3;
pub const SETTINGS_FRAME_TYPE: u8 = 0x4;
pub const PUSH_PROMISE_FRAME_TYPE: u8 = 0x5;
pub const PING_FRAME_TYPE: u8 = 0x6;
pub const GOAWAY_FRAME_TYPE: u8 = 0x7;
pub const WINDOW_UPDATE_FRAME_TYPE: u8 = 0x8;
pub const CONTINUATION_FRAME_TYPE: u8 = 0x9;

pub const END_STREAM_FLAG: u8 = 0x1; // DATA, HEADERS
pub const ACK_FLAG: u8 = 0x1; // SETTINGS, PING
pub const END_HEADERS_FLAG: u8 = 0x4; // HEADERS, PUSH_PROMISE, CONTINUATION
pub const PADDED_FLAG: u8 = 0x8; // DATA, HEADERS, PUSH_PROMISE
pub const PRIORITY_FLAG: u8 = 0x20; // HEADERS

pub const PRIORITY_FIELDS_SIZE: usize = 5;
pub const SETTING_ENTRY_SIZE: usize = 6;

pub const MAX_FRAME_SIZE_UPPER_BOUND: u32 = 16_777_215; // 2^24 - 1
pub const STREAM_ID_MASK: u32 = 0x7FFF_FFFF;
