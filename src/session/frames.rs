use super::{AvailabilityState, Session};
use crate::stream::{Stream, StreamEvent, StreamKey, StreamState};
use crate::types::{
    find_header, Error, ErrorCode, FrameEvent, Header, RequestPriority,
};
use bytes::Bytes;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use url::Url;

impl Session {
    /// Dispatches one decoded inbound frame.
    pub(crate) fn handle_event(&mut self, event: FrameEvent) {
        match event {
            FrameEvent::Data {
                stream_id,
                payload,
                end_stream,
            } => self.on_stream_frame_data(stream_id, payload, end_stream),
            FrameEvent::Padding { stream_id, len } => self.on_stream_padding(stream_id, len),
            FrameEvent::Headers {
                stream_id,
                headers,
                end_stream,
                ..
            } => self.on_headers(stream_id, headers, end_stream),
            FrameEvent::StreamOpen {
                stream_id,
                associated_stream_id,
                priority,
                end_stream,
                headers,
            } => {
                if self.try_create_push_stream(stream_id, associated_stream_id, priority, &headers) {
                    if let Some(key) = self.registry.active_key(stream_id) {
                        self.on_initial_response_headers(key, headers, end_stream);
                    }
                }
            }
            FrameEvent::PushPromise {
                stream_id,
                promised_stream_id,
                headers,
            } => {
                // The promise carries no priority of its own.
                self.try_create_push_stream(
                    promised_stream_id,
                    stream_id,
                    RequestPriority::Highest,
                    &headers,
                );
            }
            FrameEvent::RstStream { stream_id, code } => self.on_rst_stream(stream_id, code),
            FrameEvent::Settings {
                clear_persisted,
                values,
            } => self.on_settings(clear_persisted, values),
            FrameEvent::SettingsAck => trace!(endpoint = %self.endpoint, "settings acknowledged"),
            FrameEvent::Ping { id, ack } => self.on_ping(id, ack),
            FrameEvent::GoAway {
                last_stream_id,
                code,
                debug_data,
            } => self.on_go_away(last_stream_id, code, debug_data),
            FrameEvent::WindowUpdate { stream_id, delta } => self.on_window_update(stream_id, delta),
            FrameEvent::StreamError {
                stream_id,
                description,
            } => self.on_stream_error(stream_id, &description),
            FrameEvent::Unknown {
                stream_id,
                frame_type,
            } => self.on_unknown_frame(stream_id, frame_type),
        }
    }

    fn on_stream_frame_data(&mut self, stream_id: u32, payload: Bytes, end_stream: bool) {
        let len = payload.len();
        if len > 0 && !self.decrease_recv_window(len) {
            return;
        }

        let Some(key) = self.registry.active_key(stream_id) else {
            // Likely cancelled locally; the bytes still count for the session.
            trace!(endpoint = %self.endpoint, stream_id, len, "data for unknown stream");
            if len > 0 {
                self.increase_recv_window(len);
            }
            return;
        };
        let Some(stream) = self.registry.get_mut(key) else {
            return;
        };

        let violation = match stream.state {
            StreamState::AwaitingResponse | StreamState::ReservedRemote => {
                Some((ErrorCode::ProtocolError, "Data received before headers."))
            }
            _ if stream.remote_closed => {
                Some((ErrorCode::StreamClosed, "Data received on half-closed stream."))
            }
            _ if len > 0 && stream.recv_window.on_received(len as i32).is_err() => Some((
                ErrorCode::FlowControlError,
                "Data exceeds the stream receive window.",
            )),
            _ => None,
        };
        if let Some((code, description)) = violation {
            self.reset_stream(stream_id, code, description);
            if len > 0 {
                self.increase_recv_window(len);
            }
            return;
        }

        stream.raw_received_bytes += len;
        let delivered = stream.deliver(StreamEvent::Data {
            payload,
            end_stream,
        });
        if end_stream {
            stream.remote_closed = true;
        }
        let fully_closed = stream.can_close();

        if !delivered && len > 0 {
            self.on_read_buffer_consumed(key, len);
        }
        if fully_closed {
            self.close_active_stream(stream_id, Ok(()));
        }
    }

    /// Padding counts against both windows and is credited back at once.
    fn on_stream_padding(&mut self, stream_id: u32, len: usize) {
        if len == 0 || !self.decrease_recv_window(len) {
            return;
        }
        self.increase_recv_window(len);

        let Some(key) = self.registry.active_key(stream_id) else {
            return;
        };
        let within_window = self
            .registry
            .get_mut(key)
            .map(|stream| stream.recv_window.on_received(len as i32).is_ok())
            .unwrap_or(false);
        if !within_window {
            self.reset_stream(
                stream_id,
                ErrorCode::FlowControlError,
                "Padding exceeds the stream receive window.",
            );
            return;
        }
        self.credit_stream_recv(key, len);
    }

    fn on_headers(&mut self, stream_id: u32, headers: Vec<Header>, end_stream: bool) {
        let Some(key) = self.registry.active_key(stream_id) else {
            trace!(endpoint = %self.endpoint, stream_id, "headers for unknown stream");
            return;
        };
        let Some(stream) = self.registry.get_mut(key) else {
            return;
        };

        match stream.state {
            StreamState::AwaitingResponse | StreamState::ReservedRemote => {
                self.on_initial_response_headers(key, headers, end_stream);
            }
            StreamState::Open if stream.remote_closed => {
                self.reset_stream(
                    stream_id,
                    ErrorCode::StreamClosed,
                    "Headers received on half-closed stream.",
                );
            }
            StreamState::Open if !end_stream => {
                self.reset_stream(
                    stream_id,
                    ErrorCode::ProtocolError,
                    "Duplicate response headers.",
                );
            }
            StreamState::Open => {
                stream.deliver(StreamEvent::Headers {
                    headers,
                    end_stream: true,
                    is_trailer: true,
                    received_at: Utc::now(),
                });
                stream.remote_closed = true;
                if stream.can_close() {
                    self.close_active_stream(stream_id, Ok(()));
                }
            }
            StreamState::Created | StreamState::Closed => {}
        }
    }

    fn on_initial_response_headers(&mut self, key: StreamKey, headers: Vec<Header>, end_stream: bool) {
        let Some((stream_id, is_push)) = self
            .registry
            .get(key)
            .map(|stream| (stream.id, stream.is_push()))
        else {
            return;
        };

        if is_push {
            if self.max_concurrent_pushed_streams > 0
                && self.registry.num_active_pushed() >= self.max_concurrent_pushed_streams
            {
                self.reset_stream(
                    stream_id,
                    ErrorCode::RefusedStream,
                    "Stream concurrency limit reached.",
                );
                return;
            }
            self.registry.on_pushed_stream_activated();
        }

        let Some(stream) = self.registry.get_mut(key) else {
            return;
        };
        let received_at = Utc::now();
        stream.state = StreamState::Open;
        stream.response_time = Some(received_at);
        stream.deliver(StreamEvent::Headers {
            headers,
            end_stream,
            is_trailer: false,
            received_at,
        });
        if end_stream {
            stream.remote_closed = true;
            if stream.can_close() {
                self.close_active_stream(stream_id, Ok(()));
            }
        }
    }

    /// Validates a peer-announced push and registers it as a reserved
    /// stream. Returns whether the stream was created.
    fn try_create_push_stream(
        &mut self,
        stream_id: u32,
        associated_stream_id: u32,
        priority: RequestPriority,
        headers: &[Header],
    ) -> bool {
        if stream_id & 0x1 != 0 {
            warn!(endpoint = %self.endpoint, stream_id, "odd push stream id");
            self.drain_session(
                Err(Error::Protocol("odd push stream id".to_string())),
                "Odd push stream id.",
            );
            return false;
        }
        if stream_id <= self.registry.last_accepted_push_stream_id() {
            warn!(endpoint = %self.endpoint, stream_id, "push stream id not increasing");
            self.drain_session(
                Err(Error::Protocol("push stream id not increasing".to_string())),
                "New push stream id must be greater than the last accepted.",
            );
            return false;
        }
        if self.registry.is_active(stream_id) {
            warn!(endpoint = %self.endpoint, stream_id, "push for active stream");
            return false;
        }
        self.registry.set_last_accepted_push_stream_id(stream_id);

        if !self.config.enable_push {
            self.drain_session(
                Err(Error::Protocol("push received while disabled".to_string())),
                "Push received while disabled.",
            );
            return false;
        }
        if self.state == AvailabilityState::GoingAway {
            self.enqueue_reset_stream_frame(stream_id, priority, ErrorCode::RefusedStream);
            return false;
        }
        if associated_stream_id == 0 {
            self.enqueue_reset_stream_frame(stream_id, priority, ErrorCode::RefusedStream);
            return false;
        }

        self.counters.streams_pushed += 1;

        let Some(url) = pushed_url(headers) else {
            debug!(endpoint = %self.endpoint, stream_id, "pushed stream url was invalid");
            self.enqueue_reset_stream_frame(stream_id, priority, ErrorCode::ProtocolError);
            return false;
        };

        let Some(associated_origin) = self
            .registry
            .active_key(associated_stream_id)
            .and_then(|key| self.registry.get(key))
            .map(|stream| stream.url.origin())
        else {
            debug!(
                endpoint = %self.endpoint,
                stream_id,
                associated_stream_id,
                "push for inactive associated stream"
            );
            self.enqueue_reset_stream_frame(stream_id, priority, ErrorCode::StreamClosed);
            return false;
        };

        if host_port(&url).as_deref() != Some(self.endpoint.as_str()) && url.origin() != associated_origin {
            debug!(endpoint = %self.endpoint, stream_id, %url, "rejected cross-origin push");
            self.enqueue_reset_stream_frame(stream_id, priority, ErrorCode::RefusedStream);
            return false;
        }

        if self.registry.has_unclaimed_push(&url) {
            debug!(endpoint = %self.endpoint, stream_id, %url, "duplicate pushed stream");
            self.enqueue_reset_stream_frame(stream_id, priority, ErrorCode::ProtocolError);
            return false;
        }

        let now = Instant::now();
        let key = self.registry.allocate_key();
        let stream = Stream::new_pushed(
            key,
            stream_id,
            associated_stream_id,
            url.clone(),
            priority,
            self.stream_initial_send_window,
            self.config.stream_max_recv_window,
            now,
        );
        self.registry.register_push_stream(url.clone(), stream_id, now);
        self.registry.insert_active(stream);
        debug!(endpoint = %self.endpoint, stream_id, associated_stream_id, %url, "accepted pushed stream");
        // The expiry sweep may now be due earlier than the keepalive timer.
        self.keepalive_notify.notify_one();

        self.delete_expired_pushed_streams();
        true
    }

    fn on_rst_stream(&mut self, stream_id: u32, code: ErrorCode) {
        if !self.registry.is_active(stream_id) {
            // It may just have been cancelled locally.
            warn!(endpoint = %self.endpoint, stream_id, %code, "RST_STREAM for unknown stream");
            return;
        }
        debug!(endpoint = %self.endpoint, stream_id, %code, "stream reset by peer");

        match code {
            ErrorCode::NoError => self.close_active_stream(stream_id, Ok(())),
            ErrorCode::RefusedStream => {
                self.close_active_stream(stream_id, Err(Error::ServerRefusedStream))
            }
            ErrorCode::Http11Required => {
                self.drain_session(Err(Error::Http11Required), "HTTP_1_1_REQUIRED for stream.")
            }
            code => self.close_active_stream(stream_id, Err(Error::StreamReset(code))),
        }
    }

    fn on_go_away(&mut self, last_stream_id: u32, code: ErrorCode, debug_data: Bytes) {
        debug!(
            endpoint = %self.endpoint,
            last_stream_id,
            %code,
            active_streams = self.registry.num_active(),
            debug_data = %String::from_utf8_lossy(&debug_data),
            "GOAWAY received"
        );
        self.make_unavailable();
        if code == ErrorCode::Http11Required {
            self.drain_session(Err(Error::Http11Required), "HTTP_1_1_REQUIRED for stream.");
        } else {
            self.start_going_away(last_stream_id, Error::Aborted);
        }
        // Nothing may have been active, in which case no stream close will
        // finish the going-away process.
        self.maybe_finish_going_away();
    }

    fn on_ping(&mut self, id: u64, ack: bool) {
        if !ack {
            self.write_ping_frame(id, true);
            return;
        }

        self.pings_in_flight -= 1;
        if self.pings_in_flight < 0 {
            self.drain_session(
                Err(Error::Protocol("unexpected PING ack".to_string())),
                "pings_in_flight_ is < 0.",
            );
            self.pings_in_flight = 0;
            return;
        }
        trace!(endpoint = %self.endpoint, id, in_flight = self.pings_in_flight, "ping acknowledged");
    }

    fn on_window_update(&mut self, stream_id: u32, delta: i32) {
        if stream_id == 0 {
            if delta < 1 {
                self.drain_session(
                    Err(Error::Protocol(format!("invalid session window delta {}", delta))),
                    "Received WINDOW_UPDATE with an invalid delta.",
                );
                return;
            }
            self.increase_send_window(delta);
            return;
        }

        let Some(key) = self.registry.active_key(stream_id) else {
            warn!(endpoint = %self.endpoint, stream_id, "WINDOW_UPDATE for unknown stream");
            return;
        };
        if delta < 1 {
            self.reset_stream(
                stream_id,
                ErrorCode::FlowControlError,
                "Received WINDOW_UPDATE with an invalid delta.",
            );
            return;
        }

        let Some(stream) = self.registry.get_mut(key) else {
            return;
        };
        match stream.send_window.increase(delta) {
            Ok(size) => {
                trace!(endpoint = %self.endpoint, stream_id, delta, size, "stream send window increased");
                self.possibly_resume_if_send_stalled(key);
            }
            Err(err) => {
                debug!(endpoint = %self.endpoint, stream_id, error = %err, "stream window update rejected");
                self.reset_stream(
                    stream_id,
                    ErrorCode::FlowControlError,
                    "Stream send window overflow.",
                );
            }
        }
    }

    fn on_stream_error(&mut self, stream_id: u32, description: &str) {
        if self.registry.is_active(stream_id) {
            self.reset_stream(stream_id, ErrorCode::ProtocolError, description);
            return;
        }
        debug!(endpoint = %self.endpoint, stream_id, description, "stream error on unknown stream");
        self.enqueue_reset_stream_frame(stream_id, RequestPriority::Idle, ErrorCode::ProtocolError);
    }

    /// Unknown frame types are ignored unless they name a stream that
    /// cannot exist yet.
    fn on_unknown_frame(&mut self, stream_id: u32, frame_type: u8) {
        let plausible = if stream_id % 2 == 1 {
            stream_id <= self.registry.stream_hi_water_mark()
        } else {
            stream_id <= self.registry.last_accepted_push_stream_id()
        };
        if plausible {
            trace!(endpoint = %self.endpoint, stream_id, frame_type, "ignoring unknown frame");
            return;
        }
        self.drain_session(
            Err(Error::Protocol(format!(
                "unknown frame type {:#x} on unopened stream {}",
                frame_type, stream_id
            ))),
            "Unknown frame on unopened stream.",
        );
    }
}

/// URL of a pushed resource from its promised request headers.
fn pushed_url(headers: &[Header]) -> Option<Url> {
    let scheme = find_header(headers, ":scheme")?;
    let authority = find_header(headers, ":authority").or_else(|| find_header(headers, ":host"))?;
    let path = find_header(headers, ":path")?;
    if scheme.is_empty() || authority.is_empty() || !path.starts_with('/') {
        return None;
    }
    Url::parse(&format!("{}://{}{}", scheme, authority, path)).ok()
}

fn host_port(url: &Url) -> Option<String> {
    Some(format!("{}:{}", url.host_str()?, url.port_or_known_default()?))
}
