use super::{AvailabilityState, PingCheck, Session};
use crate::stream::StreamKey;
use crate::types::{
    Error, ErrorCode, Frame, FrameType, RequestPriority, SettingsMap,
    DEFAULT_INITIAL_WINDOW_SIZE, SETTINGS_ENABLE_PUSH, SETTINGS_HEADER_TABLE_SIZE,
    SETTINGS_INITIAL_WINDOW_SIZE, SETTINGS_MAX_CONCURRENT_STREAMS, SETTINGS_MAX_FRAME_SIZE,
};
use crate::write_queue::BufferProducer;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

impl Session {
    // Bootstrap

    /// Applies settings remembered for this endpoint and, when enabled,
    /// queues the connection preface, our SETTINGS and the session window
    /// bump. Call once before the driver starts.
    pub fn initialize(&mut self) {
        if let Some(store) = self.settings_store.clone() {
            for (id, value) in store.get_remembered_settings(&self.endpoint) {
                self.handle_setting(id, value);
            }
        }
        if self.config.enable_sending_initial_data {
            self.send_initial_data();
        }
    }

    fn send_initial_data(&mut self) {
        if let Some(preface) = self.codec.connection_preface() {
            // Counted as part of the SETTINGS frame that follows.
            self.enqueue_write(
                RequestPriority::Highest,
                FrameType::Settings,
                BufferProducer::Raw(preface),
                None,
            );
        }

        let mut values = vec![(
            SETTINGS_MAX_CONCURRENT_STREAMS,
            u32::try_from(self.max_concurrent_pushed_streams).unwrap_or(u32::MAX),
        )];
        if self.config.stream_max_recv_window != DEFAULT_INITIAL_WINDOW_SIZE {
            values.push((
                SETTINGS_INITIAL_WINDOW_SIZE,
                self.config.stream_max_recv_window as u32,
            ));
        }
        if !self.config.enable_push {
            values.push((SETTINGS_ENABLE_PUSH, 0));
        }
        self.enqueue_session_write(
            RequestPriority::Highest,
            FrameType::Settings,
            Frame::Settings { values },
        );

        match self.session_recv.grow_to(self.config.session_max_recv_window) {
            Ok(Some(increment)) => self.enqueue_session_write(
                RequestPriority::Highest,
                FrameType::WindowUpdate,
                Frame::WindowUpdate {
                    stream_id: 0,
                    increment: increment as u32,
                },
            ),
            Ok(None) => {}
            Err(err) => warn!(endpoint = %self.endpoint, error = %err, "session receive window not raised"),
        }
    }

    // Settings

    pub(crate) fn on_settings(&mut self, clear_persisted: bool, values: Vec<(u16, u32)>) {
        self.enqueue_session_write(RequestPriority::Highest, FrameType::Settings, Frame::SettingsAck);

        let store = self.settings_store.clone();
        if clear_persisted {
            if let Some(store) = &store {
                store.clear_remembered_settings(&self.endpoint);
            }
        }

        for &(id, value) in &values {
            trace!(endpoint = %self.endpoint, id, value, "setting received");
            self.handle_setting(id, value);
            if self.state == AvailabilityState::Draining {
                return;
            }
        }

        if let Some(store) = store {
            let mut remembered: SettingsMap = store.get_remembered_settings(&self.endpoint);
            remembered.extend(values);
            store.set_remembered_settings(&self.endpoint, remembered);
        }
    }

    pub(crate) fn handle_setting(&mut self, id: u16, value: u32) {
        match id {
            SETTINGS_MAX_CONCURRENT_STREAMS => {
                self.max_concurrent_streams =
                    (value as usize).min(self.config.max_concurrent_stream_limit);
                debug!(
                    endpoint = %self.endpoint,
                    max_concurrent_streams = self.max_concurrent_streams,
                    "max concurrent streams updated"
                );
                self.process_pending_stream_requests();
            }
            SETTINGS_INITIAL_WINDOW_SIZE => {
                let Ok(value) = i32::try_from(value) else {
                    warn!(endpoint = %self.endpoint, value, "initial window size out of range");
                    return;
                };
                let delta = value - self.stream_initial_send_window;
                self.stream_initial_send_window = value;
                debug!(endpoint = %self.endpoint, delta, "updating stream send windows");
                self.update_streams_send_window_size(delta);
            }
            SETTINGS_MAX_FRAME_SIZE => self.codec.set_max_frame_size(value as usize),
            SETTINGS_HEADER_TABLE_SIZE => self.codec.set_header_table_size(value as usize),
            _ => {}
        }
    }

    /// Shifts every stream's send window by `delta`. Windows may go
    /// negative; a stream whose window would overflow is torn down.
    fn update_streams_send_window_size(&mut self, delta: i32) {
        if delta == 0 {
            return;
        }

        for stream_id in self.registry.active_ids() {
            let Some(key) = self.registry.active_key(stream_id) else {
                continue;
            };
            if self.adjust_stream_send_window(key, delta) {
                if delta > 0 {
                    self.possibly_resume_if_send_stalled(key);
                }
            } else {
                self.reset_stream(
                    stream_id,
                    ErrorCode::FlowControlError,
                    "Initial window size change overflows stream window.",
                );
            }
        }

        for key in self.registry.created_keys() {
            if !self.adjust_stream_send_window(key, delta) {
                self.close_created_stream(
                    key,
                    Err(Error::FlowControl(
                        "initial window size change overflows stream window".to_string(),
                    )),
                );
            }
        }
    }

    fn adjust_stream_send_window(&mut self, key: StreamKey, delta: i32) -> bool {
        self.registry
            .get_mut(key)
            .map(|stream| stream.send_window.adjust(delta).is_ok())
            .unwrap_or(false)
    }

    // Pings

    /// Before sending on an idle session, check it is still alive.
    pub(crate) fn send_preface_ping_if_none_in_flight(&mut self) {
        if self.pings_in_flight > 0 || !self.config.enable_ping_based_connection_checking {
            return;
        }
        let idle = Instant::now().saturating_duration_since(self.last_activity_time);
        if idle > self.config.connection_at_risk_of_loss_time {
            self.write_ping_frame(self.next_ping_id, false);
        }
    }

    pub(crate) fn write_ping_frame(&mut self, id: u64, ack: bool) {
        self.enqueue_session_write(RequestPriority::Highest, FrameType::Ping, Frame::Ping { id, ack });
        if !ack {
            trace!(endpoint = %self.endpoint, id, "sending ping");
            self.next_ping_id += 2;
            self.pings_in_flight += 1;
            self.plan_to_check_ping_status();
            self.last_ping_sent_time = Instant::now();
        }
    }

    fn plan_to_check_ping_status(&mut self) {
        if self.ping_check.is_some() {
            return;
        }
        let now = Instant::now();
        self.ping_check = Some(PingCheck {
            due: now + self.config.hung_interval,
            last_check_time: now,
        });
        self.keepalive_notify.notify_one();
    }

    /// Drains the session if nothing was read for a full hung interval while
    /// a ping was outstanding.
    fn check_ping_status(&mut self) {
        let Some(check) = self.ping_check.take() else {
            return;
        };
        if self.pings_in_flight == 0 {
            return;
        }

        let now = Instant::now();
        let idle = now.saturating_duration_since(self.last_activity_time);
        let hung = self.config.hung_interval;
        if idle > hung || self.last_activity_time < check.last_check_time {
            debug!(
                endpoint = %self.endpoint,
                idle_ms = idle.as_millis() as u64,
                pings_in_flight = self.pings_in_flight,
                "ping check failed"
            );
            self.drain_session(Err(Error::PingFailed), "Failed ping.");
            return;
        }

        self.ping_check = Some(PingCheck {
            due: now + (hung - idle),
            last_check_time: now,
        });
    }

    pub fn last_ping_sent_time(&self) -> Instant {
        self.last_ping_sent_time
    }

    // Push expiry

    /// Resets pushed streams nobody claimed within the minimum lifetime.
    /// Runs at most once per lifetime period.
    pub(crate) fn delete_expired_pushed_streams(&mut self) {
        if self.registry.num_unclaimed_pushed() == 0 {
            return;
        }
        let now = Instant::now();
        if now < self.next_push_sweep {
            return;
        }

        let lifetime = self.config.min_pushed_stream_lifetime;
        for stream_id in self.registry.expired_push_streams(now, lifetime) {
            if !self.registry.is_active(stream_id) {
                continue;
            }
            self.counters.streams_abandoned += 1;
            self.reset_stream(stream_id, ErrorCode::RefusedStream, "Stream not claimed.");
        }
        self.next_push_sweep = now + lifetime;
    }

    // Timer plumbing for the driver

    /// Earliest instant at which [`on_keepalive_timer`](Self::on_keepalive_timer)
    /// has work to do.
    pub(crate) fn next_keepalive_deadline(&self) -> Option<Instant> {
        if self.state == AvailabilityState::Draining {
            return None;
        }
        let sweep = (self.registry.num_unclaimed_pushed() > 0).then_some(self.next_push_sweep);
        let ping = self.ping_check.map(|check| check.due);
        match (ping, sweep) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub(crate) fn on_keepalive_timer(&mut self) {
        let now = Instant::now();
        if self.ping_check.map(|check| check.due <= now).unwrap_or(false) {
            self.check_ping_status();
        }
        if self.state != AvailabilityState::Draining {
            self.delete_expired_pushed_streams();
        }
    }
}
