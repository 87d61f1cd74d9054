use super::consts::*;
use super::hpack::HeaderBlockCodec;
use crate::types::{
    CodecError, ErrorCode, Frame, FrameCodec, FrameEvent, Header, PrioritySpec,
};
use bytes::{BufMut, Bytes, BytesMut};

// HTTP/2 Frame Format (RFC 7540 Section 4.1):
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                 Length (24)                   |
// +---------------+---------------+---------------+
// |   Type (8)    |   Flags (8)   |
// +-+-+-----------+---------------+-------------------------------+
// |R|                 Stream Identifier (31)                      |
// +=+=============================================================+
// |                   Frame Payload (0...)                      ...
// +---------------------------------------------------------------+

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    length: usize,
    frame_type: u8,
    flags: u8,
    stream_id: u32,
}

impl FrameHeader {
    fn parse(data: &[u8]) -> Self {
        let length = ((data[0] as usize) << 16) | ((data[1] as usize) << 8) | (data[2] as usize);
        let stream_id = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) & STREAM_ID_MASK;
        Self {
            length,
            frame_type: data[3],
            flags: data[4],
            stream_id,
        }
    }

    fn has(&self, flag: u8) -> bool {
        (self.flags & flag) != 0
    }
}

#[derive(Debug)]
enum HeaderBlockKind {
    Headers {
        end_stream: bool,
        priority: Option<PrioritySpec>,
    },
    PushPromise {
        promised_stream_id: u32,
    },
}

#[derive(Debug)]
struct PendingHeaderBlock {
    stream_id: u32,
    kind: HeaderBlockKind,
    block: BytesMut,
}

/// HTTP/2 framing plus HPACK behind the engine's [`FrameCodec`] seam.
pub struct H2Codec {
    hpack: HeaderBlockCodec,
    buffer: BytesMut,
    max_send_frame_size: usize,
    max_recv_frame_size: usize,
    pending_headers: Option<PendingHeaderBlock>,
    error: Option<CodecError>,
}

impl Default for H2Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl H2Codec {
    pub fn new() -> Self {
        Self {
            hpack: HeaderBlockCodec::new(
                DEFAULT_HEADER_TABLE_SIZE as usize,
                MAX_HEADER_LIST_SIZE,
            ),
            buffer: BytesMut::with_capacity(FRAME_HEADER_SIZE),
            max_send_frame_size: DEFAULT_MAX_FRAME_SIZE as usize,
            max_recv_frame_size: DEFAULT_MAX_FRAME_SIZE as usize,
            pending_headers: None,
            error: None,
        }
    }

    pub fn max_send_frame_size(&self) -> usize {
        self.max_send_frame_size
    }

    fn put_frame_header(out: &mut BytesMut, length: usize, frame_type: u8, flags: u8, stream_id: u32) {
        let length = length as u32;
        out.put_u8(((length >> 16) & 0xFF) as u8);
        out.put_u8(((length >> 8) & 0xFF) as u8);
        out.put_u8((length & 0xFF) as u8);
        out.put_u8(frame_type);
        out.put_u8(flags);
        out.put_u32(stream_id & STREAM_ID_MASK);
    }

    fn put_frame(out: &mut BytesMut, frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) {
        Self::put_frame_header(out, payload.len(), frame_type, flags, stream_id);
        out.put_slice(payload);
    }

    fn encode_headers(
        &mut self,
        out: &mut BytesMut,
        stream_id: u32,
        headers: &[Header],
        end_stream: bool,
        priority: Option<PrioritySpec>,
    ) {
        let mut block = self.hpack.encode(headers);
        let max_frame = self.max_send_frame_size;

        let mut first_payload = BytesMut::new();
        let mut flags = 0u8;
        if end_stream {
            flags |= END_STREAM_FLAG;
        }
        if let Some(spec) = priority {
            flags |= PRIORITY_FLAG;
            let mut dependency = spec.parent_stream_id & STREAM_ID_MASK;
            if spec.exclusive {
                dependency |= 0x8000_0000;
            }
            first_payload.put_u32(dependency);
            first_payload.put_u8(spec.weight.clamp(1, 256).saturating_sub(1) as u8);
        }

        let room = max_frame - first_payload.len();
        let chunk = block.split_to(block.len().min(room));
        first_payload.put_slice(&chunk);
        if block.is_empty() {
            flags |= END_HEADERS_FLAG;
        }
        Self::put_frame(out, HEADERS_FRAME_TYPE, flags, stream_id, &first_payload);

        while !block.is_empty() {
            let chunk = block.split_to(block.len().min(max_frame));
            let flags = if block.is_empty() { END_HEADERS_FLAG } else { 0 };
            Self::put_frame(out, CONTINUATION_FRAME_TYPE, flags, stream_id, &chunk);
        }
    }

    fn encode_data(&self, out: &mut BytesMut, stream_id: u32, payload: &Bytes, end_stream: bool) {
        let mut remaining = payload.clone();
        loop {
            let chunk = remaining.split_to(remaining.len().min(self.max_send_frame_size));
            let last = remaining.is_empty();
            let flags = if last && end_stream { END_STREAM_FLAG } else { 0 };
            Self::put_frame(out, DATA_FRAME_TYPE, flags, stream_id, &chunk);
            if last {
                break;
            }
        }
    }

    fn fail(&mut self, err: CodecError) -> CodecError {
        self.error = Some(err.clone());
        err
    }

    fn dispatch(&mut self, frame: Bytes, events: &mut Vec<FrameEvent>) -> Result<(), CodecError> {
        let header = FrameHeader::parse(&frame);
        let payload = frame.slice(FRAME_HEADER_SIZE..);

        if let Some(pending) = &self.pending_headers {
            if header.frame_type != CONTINUATION_FRAME_TYPE || header.stream_id != pending.stream_id {
                return Err(CodecError::UnexpectedFrame(format!(
                    "expected CONTINUATION for stream {}",
                    pending.stream_id
                )));
            }
        }

        match header.frame_type {
            DATA_FRAME_TYPE => {
                if header.stream_id == 0 {
                    return Err(CodecError::UnexpectedFrame("DATA on stream 0".to_string()));
                }
                let body = Self::strip_padding(&header, &payload)?;
                events.push(FrameEvent::Data {
                    stream_id: header.stream_id,
                    payload: body.clone(),
                    end_stream: header.has(END_STREAM_FLAG),
                });
                let padding = payload.len() - body.len();
                if padding > 0 {
                    events.push(FrameEvent::Padding {
                        stream_id: header.stream_id,
                        len: padding,
                    });
                }
            }
            HEADERS_FRAME_TYPE => {
                if header.stream_id == 0 {
                    return Err(CodecError::UnexpectedFrame("HEADERS on stream 0".to_string()));
                }
                let mut fragment = Self::strip_padding(&header, &payload)?;
                let priority = if header.has(PRIORITY_FLAG) {
                    if fragment.len() < PRIORITY_FIELDS_SIZE {
                        return Err(CodecError::InvalidControlFrame);
                    }
                    let fields = fragment.split_to(PRIORITY_FIELDS_SIZE);
                    let dependency = u32::from_be_bytes([fields[0], fields[1], fields[2], fields[3]]);
                    Some(PrioritySpec {
                        parent_stream_id: dependency & STREAM_ID_MASK,
                        exclusive: dependency & 0x8000_0000 != 0,
                        weight: fields[4] as u16 + 1,
                    })
                } else {
                    None
                };
                let kind = HeaderBlockKind::Headers {
                    end_stream: header.has(END_STREAM_FLAG),
                    priority,
                };
                self.on_header_fragment(header, kind, &fragment, events)?;
            }
            PRIORITY_FRAME_TYPE => {
                if payload.len() != PRIORITY_FIELDS_SIZE {
                    return Err(CodecError::InvalidControlFrame);
                }
                // Peer reprioritization is not tracked.
            }
            RST_STREAM_FRAME_TYPE => {
                if payload.len() != 4 {
                    return Err(CodecError::RstStreamFrameCorrupt);
                }
                if header.stream_id == 0 {
                    return Err(CodecError::UnexpectedFrame("RST_STREAM on stream 0".to_string()));
                }
                let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                events.push(FrameEvent::RstStream {
                    stream_id: header.stream_id,
                    code: ErrorCode::from(code),
                });
            }
            SETTINGS_FRAME_TYPE => {
                if header.stream_id != 0 {
                    return Err(CodecError::InvalidControlFrame);
                }
                if header.has(ACK_FLAG) {
                    if !payload.is_empty() {
                        return Err(CodecError::InvalidControlFrame);
                    }
                    events.push(FrameEvent::SettingsAck);
                } else {
                    if payload.len() % SETTING_ENTRY_SIZE != 0 {
                        return Err(CodecError::InvalidControlFrame);
                    }
                    let values = payload
                        .chunks_exact(SETTING_ENTRY_SIZE)
                        .map(|entry| {
                            let id = u16::from_be_bytes([entry[0], entry[1]]);
                            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
                            (id, value)
                        })
                        .collect();
                    events.push(FrameEvent::Settings {
                        clear_persisted: false,
                        values,
                    });
                }
            }
            PUSH_PROMISE_FRAME_TYPE => {
                if header.stream_id == 0 {
                    return Err(CodecError::UnexpectedFrame("PUSH_PROMISE on stream 0".to_string()));
                }
                let mut fragment = Self::strip_padding(&header, &payload)?;
                if fragment.len() < 4 {
                    return Err(CodecError::InvalidControlFrame);
                }
                let promised = fragment.split_to(4);
                let promised_stream_id =
                    u32::from_be_bytes([promised[0], promised[1], promised[2], promised[3]]) & STREAM_ID_MASK;
                let kind = HeaderBlockKind::PushPromise { promised_stream_id };
                self.on_header_fragment(header, kind, &fragment, events)?;
            }
            PING_FRAME_TYPE => {
                if payload.len() != 8 || header.stream_id != 0 {
                    return Err(CodecError::InvalidControlFrame);
                }
                let mut id = [0u8; 8];
                id.copy_from_slice(&payload);
                events.push(FrameEvent::Ping {
                    id: u64::from_be_bytes(id),
                    ack: header.has(ACK_FLAG),
                });
            }
            GOAWAY_FRAME_TYPE => {
                if payload.len() < 8 {
                    return Err(CodecError::GoAwayFrameCorrupt);
                }
                let last_stream_id =
                    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & STREAM_ID_MASK;
                let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                events.push(FrameEvent::GoAway {
                    last_stream_id,
                    code: ErrorCode::from(code),
                    debug_data: payload.slice(8..),
                });
            }
            WINDOW_UPDATE_FRAME_TYPE => {
                if payload.len() != 4 {
                    return Err(CodecError::InvalidControlFrame);
                }
                let increment =
                    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & STREAM_ID_MASK;
                events.push(FrameEvent::WindowUpdate {
                    stream_id: header.stream_id,
                    delta: increment as i32,
                });
            }
            CONTINUATION_FRAME_TYPE => {
                let pending = self.pending_headers.as_mut().ok_or_else(|| {
                    CodecError::UnexpectedFrame(
                        "CONTINUATION frame without pending header block".to_string(),
                    )
                })?;
                pending.block.extend_from_slice(&payload);
                if header.has(END_HEADERS_FLAG) {
                    if let Some(pending) = self.pending_headers.take() {
                        self.finish_header_block(pending, events)?;
                    }
                }
            }
            frame_type => {
                events.push(FrameEvent::Unknown {
                    stream_id: header.stream_id,
                    frame_type,
                });
            }
        }
        Ok(())
    }

    fn on_header_fragment(
        &mut self,
        header: FrameHeader,
        kind: HeaderBlockKind,
        fragment: &[u8],
        events: &mut Vec<FrameEvent>,
    ) -> Result<(), CodecError> {
        let mut block = BytesMut::with_capacity(fragment.len());
        block.extend_from_slice(fragment);
        let pending = PendingHeaderBlock {
            stream_id: header.stream_id,
            kind,
            block,
        };
        if header.has(END_HEADERS_FLAG) {
            self.finish_header_block(pending, events)
        } else {
            self.pending_headers = Some(pending);
            Ok(())
        }
    }

    fn finish_header_block(
        &mut self,
        pending: PendingHeaderBlock,
        events: &mut Vec<FrameEvent>,
    ) -> Result<(), CodecError> {
        let headers = self.hpack.decode(&pending.block)?;
        let event = match pending.kind {
            HeaderBlockKind::Headers {
                end_stream,
                priority,
            } => FrameEvent::Headers {
                stream_id: pending.stream_id,
                headers,
                end_stream,
                priority,
            },
            HeaderBlockKind::PushPromise { promised_stream_id } => FrameEvent::PushPromise {
                stream_id: pending.stream_id,
                promised_stream_id,
                headers,
            },
        };
        events.push(event);
        Ok(())
    }

    fn strip_padding(header: &FrameHeader, payload: &Bytes) -> Result<Bytes, CodecError> {
        if !header.has(PADDED_FLAG) {
            return Ok(payload.clone());
        }
        if payload.is_empty() {
            return Err(CodecError::InvalidPadding);
        }
        let pad_length = payload[0] as usize;
        if pad_length > payload.len() - 1 {
            return Err(CodecError::InvalidPadding);
        }
        Ok(payload.slice(1..payload.len() - pad_length))
    }
}

impl FrameCodec for H2Codec {
    fn connection_preface(&self) -> Option<Bytes> {
        Some(Bytes::from_static(CONNECTION_PREFACE))
    }

    fn encode(&mut self, frame: &Frame) -> Result<Bytes, CodecError> {
        let mut out = BytesMut::new();
        match frame {
            Frame::Headers {
                stream_id,
                headers,
                end_stream,
                priority,
            } => self.encode_headers(&mut out, *stream_id, headers, *end_stream, *priority),
            Frame::Data {
                stream_id,
                payload,
                end_stream,
            } => self.encode_data(&mut out, *stream_id, payload, *end_stream),
            Frame::RstStream { stream_id, code } => {
                Self::put_frame(&mut out, RST_STREAM_FRAME_TYPE, 0, *stream_id, &code.as_u32().to_be_bytes());
            }
            Frame::Settings { values } => {
                let mut payload = BytesMut::with_capacity(values.len() * SETTING_ENTRY_SIZE);
                for &(id, value) in values {
                    payload.put_u16(id);
                    payload.put_u32(value);
                }
                Self::put_frame(&mut out, SETTINGS_FRAME_TYPE, 0, 0, &payload);
            }
            Frame::SettingsAck => Self::put_frame(&mut out, SETTINGS_FRAME_TYPE, ACK_FLAG, 0, &[]),
            Frame::Ping { id, ack } => {
                let flags = if *ack { ACK_FLAG } else { 0 };
                Self::put_frame(&mut out, PING_FRAME_TYPE, flags, 0, &id.to_be_bytes());
            }
            Frame::GoAway {
                last_stream_id,
                code,
                debug_data,
            } => {
                let mut payload = BytesMut::with_capacity(8 + debug_data.len());
                payload.put_u32(last_stream_id & STREAM_ID_MASK);
                payload.put_u32(code.as_u32());
                payload.put_slice(debug_data);
                if payload.len() > self.max_send_frame_size {
                    return Err(CodecError::FrameTooLarge(payload.len()));
                }
                Self::put_frame(&mut out, GOAWAY_FRAME_TYPE, 0, 0, &payload);
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                Self::put_frame(
                    &mut out,
                    WINDOW_UPDATE_FRAME_TYPE,
                    0,
                    *stream_id,
                    &(increment & STREAM_ID_MASK).to_be_bytes(),
                );
            }
        }
        Ok(out.freeze())
    }

    fn process_input(
        &mut self,
        data: &[u8],
        events: &mut Vec<FrameEvent>,
    ) -> Result<usize, CodecError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }

        let mut consumed = 0;
        if self.buffer.len() < FRAME_HEADER_SIZE {
            let take = (FRAME_HEADER_SIZE - self.buffer.len()).min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            consumed += take;
            if self.buffer.len() < FRAME_HEADER_SIZE {
                return Ok(consumed);
            }
        }

        let length = FrameHeader::parse(&self.buffer).length;
        if length > self.max_recv_frame_size {
            return Err(self.fail(CodecError::FrameTooLarge(length)));
        }

        let needed = FRAME_HEADER_SIZE + length - self.buffer.len();
        let take = needed.min(data.len() - consumed);
        self.buffer.extend_from_slice(&data[consumed..consumed + take]);
        consumed += take;

        if self.buffer.len() == FRAME_HEADER_SIZE + length {
            let frame = self.buffer.split().freeze();
            if let Err(err) = self.dispatch(frame, events) {
                return Err(self.fail(err));
            }
        }
        Ok(consumed)
    }

    fn set_max_frame_size(&mut self, size: usize) {
        self.max_send_frame_size = size.clamp(
            DEFAULT_MAX_FRAME_SIZE as usize,
            MAX_FRAME_SIZE_UPPER_BOUND as usize,
        );
    }

    fn set_header_table_size(&mut self, size: usize) {
        self.hpack.set_peer_table_size(size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut H2Codec, mut data: &[u8]) -> Result<Vec<FrameEvent>, CodecError> {
        let mut events = Vec::new();
        while !data.is_empty() {
            let used = codec.process_input(data, &mut events)?;
            data = &data[used..];
        }
        Ok(events)
    }

    #[test]
    fn headers_with_priority_survive_encoding() {
        let mut client = H2Codec::new();
        let mut server = H2Codec::new();
        let headers = vec![
            Header::new(":method", "GET"),
            Header::new(":path", "/index.html"),
        ];
        let bytes = client
            .encode(&Frame::Headers {
                stream_id: 3,
                headers: headers.clone(),
                end_stream: true,
                priority: Some(PrioritySpec {
                    parent_stream_id: 1,
                    exclusive: true,
                    weight: 220,
                }),
            })
            .unwrap();

        let events = decode_all(&mut server, &bytes).unwrap();
        assert_eq!(
            events,
            vec![FrameEvent::Headers {
                stream_id: 3,
                headers,
                end_stream: true,
                priority: Some(PrioritySpec {
                    parent_stream_id: 1,
                    exclusive: true,
                    weight: 220,
                }),
            }]
        );
    }

    #[test]
    fn large_header_block_uses_continuation() {
        let mut client = H2Codec::new();
        let mut server = H2Codec::new();
        let big = "x".repeat(40_000);
        let headers = vec![Header::new("x-big", big)];
        let bytes = client
            .encode(&Frame::Headers {
                stream_id: 1,
                headers: headers.clone(),
                end_stream: false,
                priority: None,
            })
            .unwrap();
        assert_eq!(bytes[3], HEADERS_FRAME_TYPE);
        assert_eq!(bytes[4] & END_HEADERS_FLAG, 0);

        let events = decode_all(&mut server, &bytes).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], FrameEvent::Headers { headers: h, .. } if *h == headers));
    }

    #[test]
    fn byte_at_a_time_input_still_decodes() {
        let mut client = H2Codec::new();
        let mut server = H2Codec::new();
        let bytes = client.encode(&Frame::Ping { id: 42, ack: true }).unwrap();
        let mut events = Vec::new();
        for byte in bytes.iter() {
            assert_eq!(server.process_input(&[*byte], &mut events).unwrap(), 1);
        }
        assert_eq!(events, vec![FrameEvent::Ping { id: 42, ack: true }]);
    }

    #[test]
    fn padded_data_reports_padding() {
        let mut server = H2Codec::new();
        let mut raw = BytesMut::new();
        // pad length 3, body "abc", 3 bytes padding
        H2Codec::put_frame(&mut raw, DATA_FRAME_TYPE, PADDED_FLAG | END_STREAM_FLAG, 5, b"\x03abc\0\0\0");
        let events = decode_all(&mut server, &raw).unwrap();
        assert_eq!(
            events,
            vec![
                FrameEvent::Data {
                    stream_id: 5,
                    payload: Bytes::from_static(b"abc"),
                    end_stream: true,
                },
                FrameEvent::Padding {
                    stream_id: 5,
                    len: 4,
                },
            ]
        );
    }

    #[test]
    fn interleaved_frame_during_continuation_is_an_error() {
        let mut server = H2Codec::new();
        let mut raw = BytesMut::new();
        H2Codec::put_frame(&mut raw, HEADERS_FRAME_TYPE, 0, 1, &[0x82]);
        H2Codec::put_frame(&mut raw, PING_FRAME_TYPE, 0, 0, &[0; 8]);
        let err = decode_all(&mut server, &raw).unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedFrame(_)));
        // The codec stays failed.
        let mut events = Vec::new();
        assert!(server.process_input(&[0], &mut events).is_err());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut server = H2Codec::new();
        let mut raw = BytesMut::new();
        H2Codec::put_frame_header(&mut raw, 20_000, DATA_FRAME_TYPE, 0, 1);
        let mut events = Vec::new();
        assert_eq!(
            server.process_input(&raw, &mut events),
            Err(CodecError::FrameTooLarge(20_000))
        );
    }

    #[test]
    fn control_frames_decode() {
        let mut client = H2Codec::new();
        let mut server = H2Codec::new();
        let mut bytes = BytesMut::new();
        for frame in [
            Frame::Settings {
                values: vec![(0x3, 100), (0x4, 1 << 20)],
            },
            Frame::SettingsAck,
            Frame::WindowUpdate {
                stream_id: 0,
                increment: 1000,
            },
            Frame::RstStream {
                stream_id: 7,
                code: ErrorCode::RefusedStream,
            },
            Frame::GoAway {
                last_stream_id: 9,
                code: ErrorCode::NoError,
                debug_data: Bytes::from_static(b"bye"),
            },
        ] {
            bytes.extend_from_slice(&client.encode(&frame).unwrap());
        }

        let events = decode_all(&mut server, &bytes).unwrap();
        assert_eq!(
            events,
            vec![
                FrameEvent::Settings {
                    clear_persisted: false,
                    values: vec![(0x3, 100), (0x4, 1 << 20)],
                },
                FrameEvent::SettingsAck,
                FrameEvent::WindowUpdate {
                    stream_id: 0,
                    delta: 1000,
                },
                FrameEvent::RstStream {
                    stream_id: 7,
                    code: ErrorCode::RefusedStream,
                },
                FrameEvent::GoAway {
                    last_stream_id: 9,
                    code: ErrorCode::NoError,
                    debug_data: Bytes::from_static(b"bye"),
                },
            ]
        );
    }

    #[test]
    fn unknown_frame_types_surface_as_events() {
        let mut server = H2Codec::new();
        let mut raw = BytesMut::new();
        H2Codec::put_frame(&mut raw, 0xfa, 0, 3, b"ext");
        let events = decode_all(&mut server, &raw).unwrap();
        assert_eq!(
            events,
            vec![FrameEvent::Unknown {
                stream_id: 3,
                frame_type: 0xfa,
            }]
        );
    }

    #[test]
    fn peer_header_table_size_is_recorded() {
        let mut codec = H2Codec::new();
        codec.set_header_table_size(0);
        assert_eq!(codec.hpack.peer_table_size(), 0);
    }
}
