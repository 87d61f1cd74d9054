use super::{AvailabilityState, InFlightWrite, Session};
use crate::registry::LAST_STREAM_ID;
use crate::stream::{StreamKey, StreamState};
use crate::types::{Error, Frame, FrameType, PrioritySpec, RequestPriority};
use crate::write_queue::{BufferProducer, WriteEntry};
use bytes::Bytes;
use std::io;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

fn window_delta(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}

impl Session {
    // Write path

    /// Bytes the driver should hand to the transport next: the rest of the
    /// in-flight buffer, or the next queued frame. Opening HEADERS assign
    /// the stream id here, so ids go out in strictly increasing order.
    pub(crate) fn produce_write(&mut self) -> Option<Bytes> {
        if !self.transport_connected {
            return None;
        }
        if let Some(in_flight) = &self.in_flight {
            return Some(in_flight.remaining());
        }

        while let Some(entry) = self.write_queue.dequeue() {
            let WriteEntry {
                frame_type,
                producer,
                stream,
            } = entry;

            let frame = match producer {
                BufferProducer::Raw(bytes) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    return Some(self.start_write(bytes, frame_type, stream, false));
                }
                BufferProducer::OpenStream => {
                    match stream.and_then(|key| self.activate_created_stream(key)) {
                        Some(frame) => frame,
                        None => continue,
                    }
                }
                BufferProducer::Frame(frame) => frame,
            };

            let buffer = match self.codec.encode(&frame) {
                Ok(buffer) => buffer,
                Err(err) => {
                    self.drain_session(Err(err.into()), "Failed to serialize frame.");
                    continue;
                }
            };
            if buffer.is_empty() {
                continue;
            }
            return Some(self.start_write(buffer, frame_type, stream, frame.is_end_stream()));
        }
        None
    }

    fn start_write(
        &mut self,
        buffer: Bytes,
        frame_type: FrameType,
        stream: Option<StreamKey>,
        end_stream: bool,
    ) -> Bytes {
        if let Some(owner) = stream.and_then(|key| self.registry.get_mut(key)) {
            owner.raw_sent_bytes += buffer.len();
        }
        self.in_flight = Some(InFlightWrite {
            buffer: buffer.clone(),
            consumed: 0,
            frame_type,
            stream,
            end_stream,
        });
        buffer
    }

    fn activate_created_stream(&mut self, key: StreamKey) -> Option<Frame> {
        let stream_id = match self.registry.activate(key) {
            Ok(stream_id) => stream_id,
            Err(err) => {
                warn!(endpoint = %self.endpoint, error = %err, "dropping open frame for unknown stream");
                return None;
            }
        };
        self.counters.streams_initiated += 1;
        trace!(endpoint = %self.endpoint, stream_id, "stream activated");

        if self.registry.id_space_exhausted() {
            // No stream may be created after this one.
            self.make_unavailable();
            self.start_going_away(LAST_STREAM_ID, Error::Aborted);
        }

        self.send_preface_ping_if_none_in_flight();

        let priority = self.registry.get(key)?.priority;
        let spec = if self.config.send_priority_dependency {
            PrioritySpec {
                parent_stream_id: self.registry.dependency_for(priority, stream_id).unwrap_or(0),
                exclusive: true,
                weight: priority.weight(),
            }
        } else {
            PrioritySpec {
                parent_stream_id: 0,
                exclusive: false,
                weight: priority.weight(),
            }
        };

        let stream = self.registry.get_mut(key)?;
        stream.state = StreamState::AwaitingResponse;
        let (headers, end_stream) = stream
            .request_headers
            .as_mut()
            .map(|(headers, end_stream)| (std::mem::take(headers), *end_stream))?;

        Some(Frame::Headers {
            stream_id,
            headers,
            end_stream,
            priority: Some(spec),
        })
    }

    pub(crate) fn on_write_complete(&mut self, result: io::Result<usize>) {
        self.last_activity_time = Instant::now();

        let written = match result {
            Ok(0) => {
                self.in_flight = None;
                self.transport_connected = false;
                self.drain_session(Err(Error::ConnectionClosed), "Transport accepted no bytes.");
                return;
            }
            Ok(written) => written,
            Err(err) => {
                self.in_flight = None;
                self.transport_connected = false;
                self.drain_session(Err(err.into()), "Write error.");
                return;
            }
        };

        let Some(in_flight) = self.in_flight.as_mut() else {
            return;
        };
        in_flight.consumed = (in_flight.consumed + written).min(in_flight.buffer.len());
        if in_flight.consumed < in_flight.buffer.len() {
            return;
        }

        let Some(done) = self.in_flight.take() else {
            return;
        };
        // The stream may have been closed while its frame was being written.
        if let Some(key) = done.stream {
            self.on_frame_write_complete(key, done.frame_type, done.end_stream);
        }
    }

    fn on_frame_write_complete(&mut self, key: StreamKey, frame_type: FrameType, end_stream: bool) {
        let Some(stream) = self.registry.get_mut(key) else {
            return;
        };
        match frame_type {
            FrameType::OpenStream => stream.open_frame_sent = true,
            FrameType::Data | FrameType::Headers => stream.data_write_queued = false,
            _ => return,
        }
        if end_stream {
            stream.local_closed = true;
        }

        if stream.can_close() {
            let stream_id = stream.id;
            self.close_active_stream(stream_id, Ok(()));
            return;
        }
        self.queue_next_data_frame(key);
    }

    /// Queues the stream's next DATA frame (or its trailers) once the
    /// previous one is written. At most one is queued per stream.
    pub(crate) fn queue_next_data_frame(&mut self, key: StreamKey) {
        let Some(stream) = self.registry.get_mut(key) else {
            return;
        };
        if !stream.open_frame_sent
            || stream.data_write_queued
            || stream.local_closed
            || stream.send_stalled_by_flow_control
        {
            return;
        }
        let priority = stream.priority;
        let stream_id = stream.id;

        if stream.pending_send.is_empty() {
            if let Some(trailers) = stream.pending_trailers.take() {
                stream.pending_fin = true;
                stream.data_write_queued = true;
                let frame = Frame::Headers {
                    stream_id,
                    headers: trailers,
                    end_stream: true,
                    priority: None,
                };
                self.enqueue_stream_write(priority, FrameType::Headers, BufferProducer::Frame(frame), key);
                return;
            }
            if !stream.pending_fin {
                return;
            }
        }

        let Some(frame) = self.create_data_frame(key) else {
            return;
        };
        if let Some(stream) = self.registry.get_mut(key) {
            stream.data_write_queued = true;
        }
        self.enqueue_stream_write(priority, FrameType::Data, BufferProducer::Frame(frame), key);
    }

    /// Cuts the next DATA frame from the stream's pending bytes, bounded by
    /// the chunk size and both send windows. Returns `None` when draining or
    /// stalled; a stalled stream is parked until credit arrives.
    fn create_data_frame(&mut self, key: StreamKey) -> Option<Frame> {
        if self.state == AvailabilityState::Draining {
            return None;
        }
        let session_stalled = self.is_send_stalled();
        let session_window = self.session_send_window.size();
        let chunk_size = self.config.max_frame_chunk_size;

        let stream = self.registry.get_mut(key)?;
        let stream_id = stream.id;
        let stalled_by_stream = stream.send_window.size() <= 0;
        if stalled_by_stream || session_stalled {
            stream.send_stalled_by_flow_control = true;
            if !self.stall_queue.contains(stream_id) {
                self.stall_queue.push(stream.priority, stream_id);
            }
            debug!(
                endpoint = %self.endpoint,
                stream_id,
                by_stream = stalled_by_stream,
                by_session = session_stalled,
                "stream send stalled by flow control"
            );
            return None;
        }

        let effective = stream
            .pending_send
            .len()
            .min(chunk_size)
            .min(stream.send_window.size() as usize)
            .min(session_window as usize);
        let end_stream = stream.pending_fin
            && stream.pending_trailers.is_none()
            && effective == stream.pending_send.len();
        let payload = stream.pending_send.split_to(effective).freeze();

        if effective > 0 {
            stream.send_window.consume(effective as i32);
            self.session_send_window.consume(effective as i32);
            self.send_preface_ping_if_none_in_flight();
        }
        trace!(endpoint = %self.endpoint, stream_id, len = effective, end_stream, "data frame created");

        Some(Frame::Data {
            stream_id,
            payload,
            end_stream,
        })
    }

    // Send-side flow control

    pub fn is_send_stalled(&self) -> bool {
        self.session_send_window.is_exhausted()
    }

    pub(crate) fn increase_send_window(&mut self, delta: i32) {
        match self.session_send_window.increase(delta) {
            Ok(size) => {
                trace!(endpoint = %self.endpoint, delta, size, "session send window increased");
                self.resume_send_stalled_streams();
            }
            Err(err) => {
                self.drain_session(
                    Err(Error::FlowControl(err.to_string())),
                    "Session send window overflow.",
                );
            }
        }
    }

    /// Gives parked streams another chance, highest priority first, until
    /// the session window runs dry again.
    fn resume_send_stalled_streams(&mut self) {
        while !self.is_send_stalled() {
            let Some(stream_id) = self.stall_queue.pop() else {
                break;
            };
            // The stream may still be stalled on its own window afterwards;
            // it resumes when that window grows.
            if let Some(key) = self.registry.active_key(stream_id) {
                self.possibly_resume_if_send_stalled(key);
            }
        }
    }

    pub(crate) fn possibly_resume_if_send_stalled(&mut self, key: StreamKey) {
        let session_stalled = self.is_send_stalled();
        let Some(stream) = self.registry.get_mut(key) else {
            return;
        };
        if stream.local_closed {
            return;
        }
        if stream.send_stalled_by_flow_control && !session_stalled && stream.send_window.size() > 0 {
            stream.send_stalled_by_flow_control = false;
            trace!(endpoint = %self.endpoint, stream_id = stream.id, "resuming stalled stream");
            self.queue_next_data_frame(key);
        }
    }

    // Receive-side flow control

    pub(crate) fn increase_recv_window(&mut self, len: usize) {
        match self.session_recv.on_consumed(window_delta(len)) {
            Ok(Some(increment)) => {
                self.send_window_update(0, increment as u32, RequestPriority::Highest)
            }
            Ok(None) => {}
            Err(err) => warn!(endpoint = %self.endpoint, error = %err, "session receive credit rejected"),
        }
    }

    /// Accounts inbound bytes against the session window. A peer that sends
    /// past the window drains the session; returns false in that case.
    pub(crate) fn decrease_recv_window(&mut self, len: usize) -> bool {
        if let Err(err) = self.session_recv.on_received(window_delta(len)) {
            self.drain_session(
                Err(Error::FlowControl(err.to_string())),
                "Peer exceeded the session receive window.",
            );
            return false;
        }
        true
    }

    /// A reader consumed `len` bytes of the stream's data.
    pub(crate) fn on_read_buffer_consumed(&mut self, key: StreamKey, len: usize) {
        if len == 0 {
            return;
        }
        self.increase_recv_window(len);
        self.credit_stream_recv(key, len);
    }

    /// Returns consumed bytes to the stream window, announcing the credit
    /// once enough has built up. Nothing is sent for a stream the peer has
    /// already finished.
    pub(crate) fn credit_stream_recv(&mut self, key: StreamKey, len: usize) {
        let Some(stream) = self.registry.get_mut(key) else {
            return;
        };
        let (stream_id, priority, remote_closed) = (stream.id, stream.priority, stream.remote_closed);
        match stream.recv_window.on_consumed(window_delta(len)) {
            Ok(Some(increment)) if !remote_closed && stream_id != 0 => {
                self.send_window_update(stream_id, increment as u32, priority);
            }
            Ok(_) => {}
            Err(err) => warn!(endpoint = %self.endpoint, stream_id, error = %err, "stream receive credit rejected"),
        }
    }

    fn send_window_update(&mut self, stream_id: u32, increment: u32, priority: RequestPriority) {
        self.enqueue_session_write(
            priority,
            FrameType::WindowUpdate,
            Frame::WindowUpdate {
                stream_id,
                increment,
            },
        );
    }

    // Read path

    /// Feeds bytes from the transport through the codec and dispatches every
    /// decoded frame. Stops as soon as the session drains.
    pub(crate) fn on_bytes_read(&mut self, data: &[u8]) {
        self.last_activity_time = Instant::now();
        self.counters.bytes_received += data.len();

        let mut input = data;
        let mut events = Vec::new();
        while !input.is_empty() && self.state != AvailabilityState::Draining {
            let consumed = match self.codec.process_input(input, &mut events) {
                Ok(consumed) => consumed,
                Err(err) => {
                    self.drain_session(Err(err.into()), "Framer error.");
                    return;
                }
            };
            for event in events.drain(..) {
                if self.state == AvailabilityState::Draining {
                    break;
                }
                self.handle_event(event);
            }
            if consumed == 0 {
                break;
            }
            input = &input[consumed..];
        }
    }

    pub(crate) fn on_read_eof(&mut self) {
        self.transport_connected = false;
        self.drain_session(Err(Error::ConnectionClosed), "Connection closed by peer.");
    }

    pub(crate) fn on_read_error(&mut self, err: io::Error) {
        self.transport_connected = false;
        self.drain_session(Err(err.into()), "Read error.");
    }
}
