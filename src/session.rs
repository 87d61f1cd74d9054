mod frames;
mod handle;
mod io;
mod keepalive;

pub use handle::SessionHandle;

use crate::flow_control::{FlowControlWindow, RecvWindow};
use crate::registry::{RequestId, StreamRegistry};
use crate::settings_store::SettingsStore;
use crate::stream::{EventReceiver, Stream, StreamHandle, StreamKey, StreamKind, StreamState};
use crate::types::{
    Error, ErrorCode, Frame, FrameCodec, FrameType, Header, RequestPriority, SecurityInfo,
    SessionConfig, DEFAULT_INITIAL_WINDOW_SIZE,
};
use crate::write_queue::{BufferProducer, SendStallQueue, WriteEntry, WriteQueue};
use bytes::Bytes;
use serde_json::json;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use url::Url;

/// Session-level availability. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityState {
    /// Accepts new streams.
    Available,
    /// No new streams; existing ones run to completion.
    GoingAway,
    /// Terminal. Streams are torn down and only queued session frames are
    /// still flushed.
    Draining,
}

impl std::fmt::Display for AvailabilityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AvailabilityState::Available => write!(f, "available"),
            AvailabilityState::GoingAway => write!(f, "going away"),
            AvailabilityState::Draining => write!(f, "draining"),
        }
    }
}

/// Lifecycle notifications for whoever pools sessions.
///
/// Called synchronously from inside the session; implementations must not
/// call back into it.
pub trait SessionObserver {
    fn on_going_away(&self, _endpoint: &str) {}
    fn on_closed(&self, _endpoint: &str, _error: Option<&Error>) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    pub streams_initiated: usize,
    pub streams_pushed: usize,
    pub streams_pushed_and_claimed: usize,
    pub streams_abandoned: usize,
    pub stalled_by_max_streams: usize,
    pub bytes_received: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub url: Url,
    pub priority: RequestPriority,
    /// How long `SessionHandle::request_stream` waits for capacity.
    pub deadline: Option<Duration>,
}

impl StreamRequest {
    pub fn new(url: Url, priority: RequestPriority) -> Self {
        Self {
            url,
            priority,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// A request parked until the session has stream capacity again.
#[derive(Debug)]
pub struct PendingStream {
    id: RequestId,
    priority: RequestPriority,
    receiver: oneshot::Receiver<Result<StreamHandle, Error>>,
}

impl PendingStream {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn priority(&self) -> RequestPriority {
        self.priority
    }

    pub async fn wait(self) -> Result<StreamHandle, Error> {
        self.receiver.await.unwrap_or(Err(Error::Aborted))
    }

    /// Outcome if the request has already been resolved.
    pub fn try_result(&mut self) -> Option<Result<StreamHandle, Error>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::Aborted)),
        }
    }
}

#[derive(Debug)]
pub enum CreateStreamResult {
    Created(StreamHandle),
    Pending(PendingStream),
}

#[derive(Debug)]
struct InFlightWrite {
    buffer: Bytes,
    consumed: usize,
    frame_type: FrameType,
    /// Cleared when the owning stream closes mid-write.
    stream: Option<StreamKey>,
    end_stream: bool,
}

impl InFlightWrite {
    fn remaining(&self) -> Bytes {
        self.buffer.slice(self.consumed..)
    }
}

#[derive(Debug, Clone, Copy)]
struct PingCheck {
    due: Instant,
    last_check_time: Instant,
}

/// One multiplexed connection: stream pools, flow-control windows, the
/// outbound write queue and the availability state machine.
///
/// The session never touches the transport itself. The driver feeds it
/// inbound bytes and asks it for the next buffer to write.
pub struct Session {
    endpoint: String,
    config: SessionConfig,
    security: SecurityInfo,
    codec: Box<dyn FrameCodec>,
    state: AvailabilityState,
    registry: StreamRegistry,
    write_queue: WriteQueue,
    stall_queue: SendStallQueue,
    in_flight: Option<InFlightWrite>,
    session_send_window: FlowControlWindow,
    session_recv: RecvWindow,
    stream_initial_send_window: i32,
    max_concurrent_streams: usize,
    max_concurrent_pushed_streams: usize,
    pings_in_flight: i64,
    next_ping_id: u64,
    last_ping_sent_time: Instant,
    ping_check: Option<PingCheck>,
    last_activity_time: Instant,
    next_push_sweep: Instant,
    error_on_close: Option<Error>,
    counters: SessionCounters,
    transport_connected: bool,
    settings_store: Option<Rc<dyn SettingsStore>>,
    observers: Vec<Rc<dyn SessionObserver>>,
    write_notify: Rc<Notify>,
    keepalive_notify: Rc<Notify>,
    closed_tx: watch::Sender<bool>,
}

impl Session {
    pub fn new(
        endpoint: impl Into<String>,
        config: SessionConfig,
        security: SecurityInfo,
        codec: Box<dyn FrameCodec>,
    ) -> Self {
        let now = Instant::now();
        let (closed_tx, _) = watch::channel(false);
        Self {
            endpoint: endpoint.into(),
            state: AvailabilityState::Available,
            registry: StreamRegistry::new(),
            write_queue: WriteQueue::new(),
            stall_queue: SendStallQueue::new(),
            in_flight: None,
            session_send_window: FlowControlWindow::new(DEFAULT_INITIAL_WINDOW_SIZE),
            session_recv: RecvWindow::new(DEFAULT_INITIAL_WINDOW_SIZE, config.session_max_recv_window),
            stream_initial_send_window: DEFAULT_INITIAL_WINDOW_SIZE,
            max_concurrent_streams: config
                .initial_max_concurrent_streams
                .min(config.max_concurrent_stream_limit),
            max_concurrent_pushed_streams: config.max_concurrent_pushed_streams,
            pings_in_flight: 0,
            next_ping_id: 1,
            last_ping_sent_time: now,
            ping_check: None,
            last_activity_time: now,
            next_push_sweep: now + config.min_pushed_stream_lifetime,
            error_on_close: None,
            counters: SessionCounters::default(),
            transport_connected: true,
            settings_store: None,
            observers: Vec::new(),
            write_notify: Rc::new(Notify::new()),
            keepalive_notify: Rc::new(Notify::new()),
            closed_tx,
            config,
            security,
            codec,
        }
    }

    pub fn with_settings_store(mut self, store: Rc<dyn SettingsStore>) -> Self {
        self.settings_store = Some(store);
        self
    }

    pub fn add_observer(&mut self, observer: Rc<dyn SessionObserver>) {
        self.observers.push(observer);
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn security(&self) -> &SecurityInfo {
        &self.security
    }

    pub fn state(&self) -> AvailabilityState {
        self.state
    }

    pub fn is_available(&self) -> bool {
        self.state == AvailabilityState::Available
    }

    pub fn is_draining(&self) -> bool {
        self.state == AvailabilityState::Draining
    }

    pub fn error_on_close(&self) -> Option<&Error> {
        self.error_on_close.as_ref()
    }

    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub fn num_active_streams(&self) -> usize {
        self.registry.num_active()
    }

    pub fn num_created_streams(&self) -> usize {
        self.registry.num_created()
    }

    pub fn num_pending_requests(&self) -> usize {
        self.registry.num_pending_requests()
    }

    pub fn max_concurrent_streams(&self) -> usize {
        self.max_concurrent_streams
    }

    pub fn stream_initial_send_window_size(&self) -> i32 {
        self.stream_initial_send_window
    }

    pub fn session_send_window_size(&self) -> i32 {
        self.session_send_window.size()
    }

    pub fn session_recv_window_size(&self) -> i32 {
        self.session_recv.size()
    }

    pub fn session_unacked_recv_bytes(&self) -> i32 {
        self.session_recv.unacked()
    }

    pub fn pings_in_flight(&self) -> i64 {
        self.pings_in_flight
    }

    pub fn pending_write_count(&self) -> usize {
        self.write_queue.len()
    }

    pub fn has_in_flight_write(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Draining with nothing left to flush (or no transport left to flush
    /// it to): the owner may drop the session.
    pub fn is_finished(&self) -> bool {
        self.is_draining()
            && (!self.transport_connected
                || (self.in_flight.is_none() && self.write_queue.is_empty()))
    }

    pub fn stream_id(&self, handle: StreamHandle) -> Option<u32> {
        self.registry.stream_id_of(handle.key())
    }

    pub fn stream_state(&self, handle: StreamHandle) -> Option<StreamState> {
        self.registry.get(handle.key()).map(|stream| stream.state)
    }

    pub fn stream_send_window_size(&self, handle: StreamHandle) -> Option<i32> {
        self.registry
            .get(handle.key())
            .map(|stream| stream.send_window.size())
    }

    pub fn stream_recv_window_size(&self, handle: StreamHandle) -> Option<i32> {
        self.registry
            .get(handle.key())
            .map(|stream| stream.recv_window.size())
    }

    pub fn is_stream_send_stalled(&self, handle: StreamHandle) -> bool {
        self.registry
            .get(handle.key())
            .map(|stream| stream.send_stalled_by_flow_control)
            .unwrap_or(false)
    }

    pub fn stream_response_time(&self, handle: StreamHandle) -> Option<chrono::DateTime<chrono::Utc>> {
        self.registry
            .get(handle.key())
            .and_then(|stream| stream.response_time)
    }

    pub(crate) fn write_notify(&self) -> Rc<Notify> {
        Rc::clone(&self.write_notify)
    }

    pub(crate) fn keepalive_notify(&self) -> Rc<Notify> {
        Rc::clone(&self.keepalive_notify)
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    // Stream creation

    /// Creates a stream right away when under the concurrency cap, otherwise
    /// parks the request at its priority.
    pub fn try_create_stream(&mut self, request: &StreamRequest) -> Result<CreateStreamResult, Error> {
        match self.state {
            AvailabilityState::GoingAway => return Err(Error::Failed),
            AvailabilityState::Draining => return Err(Error::ConnectionClosed),
            AvailabilityState::Available => {}
        }
        self.try_access_stream(&request.url)?;

        if self.registry.num_counted_streams() < self.max_concurrent_streams {
            let handle = self.create_stream(&request.url, request.priority)?;
            return Ok(CreateStreamResult::Created(handle));
        }

        self.counters.stalled_by_max_streams += 1;
        let (responder, receiver) = oneshot::channel();
        let id = self
            .registry
            .enqueue_request(request.url.clone(), request.priority, responder);
        debug!(
            endpoint = %self.endpoint,
            priority = %request.priority,
            pending = self.registry.num_pending_requests(),
            "stream request stalled on max concurrent streams"
        );
        Ok(CreateStreamResult::Pending(PendingStream {
            id,
            priority: request.priority,
            receiver,
        }))
    }

    pub fn cancel_stream_request(&mut self, id: RequestId) -> bool {
        self.registry.cancel_request(id).is_some()
    }

    fn try_access_stream(&mut self, url: &Url) -> Result<(), Error> {
        let wants_secure = matches!(url.scheme(), "https" | "wss");
        if !wants_secure {
            return Ok(());
        }
        if !self.security.is_secure {
            return Err(Error::Protocol(
                "secure content requested over an insecure session".to_string(),
            ));
        }
        if let Some(cert_error) = self.security.certificate_error.clone() {
            self.drain_session(
                Err(Error::CertificateError(cert_error)),
                "Tried to get stream for secure content over an unauthenticated session.",
            );
            return Err(Error::Protocol(
                "secure content requested over an unauthenticated session".to_string(),
            ));
        }
        Ok(())
    }

    fn create_stream(&mut self, url: &Url, priority: RequestPriority) -> Result<StreamHandle, Error> {
        match self.state {
            AvailabilityState::GoingAway => return Err(Error::Failed),
            AvailabilityState::Draining => return Err(Error::ConnectionClosed),
            AvailabilityState::Available => {}
        }
        if !self.transport_connected {
            self.drain_session(
                Err(Error::ConnectionClosed),
                "Tried to create a stream over a closed connection.",
            );
            return Err(Error::ConnectionClosed);
        }

        let key = self.registry.allocate_key();
        let stream = Stream::new(
            key,
            StreamKind::Bidirectional,
            url.clone(),
            priority,
            self.stream_initial_send_window,
            self.config.stream_max_recv_window,
            Instant::now(),
        );
        self.registry.insert_created(stream);
        trace!(endpoint = %self.endpoint, key = key.as_u64(), %url, "stream created");
        Ok(StreamHandle::new(key))
    }

    /// Promotes parked requests, highest priority first, while there is
    /// capacity.
    pub(crate) fn process_pending_stream_requests(&mut self) {
        while self.state == AvailabilityState::Available
            && self.registry.num_counted_streams() < self.max_concurrent_streams
        {
            let Some(request) = self.registry.next_pending_request() else {
                break;
            };
            if request.responder.is_closed() {
                continue;
            }
            match self.create_stream(&request.url, request.priority) {
                Ok(handle) => {
                    if request.responder.send(Ok(handle)).is_err() {
                        self.close_created_stream(handle.key(), Ok(()));
                    }
                }
                Err(err) => {
                    let _ = request.responder.send(Err(err));
                }
            }
        }
    }

    /// Hands out the pushed stream for `url`, if the peer pushed one.
    pub fn get_push_stream(&mut self, url: &Url) -> Result<Option<StreamHandle>, Error> {
        if self.state == AvailabilityState::Draining {
            return Err(Error::ConnectionClosed);
        }
        self.try_access_stream(url)?;

        let Some(key) = self.registry.claim_push_stream(url) else {
            return Ok(None);
        };
        if let Some(stream) = self.registry.get_mut(key) {
            stream.awaiting_claim = false;
        }
        self.counters.streams_pushed_and_claimed += 1;
        debug!(endpoint = %self.endpoint, %url, "adopted pushed stream");
        Ok(Some(StreamHandle::new(key)))
    }

    // Stream I/O

    /// First call sends the opening HEADERS (the stream gets its id when
    /// that frame is written). A later call sends trailers, which must end
    /// the stream.
    pub fn send_headers(
        &mut self,
        handle: StreamHandle,
        headers: Vec<Header>,
        end_stream: bool,
    ) -> Result<(), Error> {
        let key = handle.key();
        let stream = self.registry.get_mut(key).ok_or(Error::InvalidStream)?;
        if stream.is_push() {
            return Err(Error::InvalidState(
                "pushed streams cannot send".to_string(),
            ));
        }

        if stream.request_headers.is_none() {
            stream.request_headers = Some((headers, end_stream));
            let priority = stream.priority;
            self.enqueue_stream_write(priority, FrameType::OpenStream, BufferProducer::OpenStream, key);
            return Ok(());
        }

        if stream.fin_requested() {
            return Err(Error::InvalidState(
                "stream is already half-closed".to_string(),
            ));
        }
        if !end_stream {
            return Err(Error::InvalidState(
                "trailers must end the stream".to_string(),
            ));
        }
        stream.pending_trailers = Some(headers);
        self.queue_next_data_frame(key);
        Ok(())
    }

    pub fn send_data(&mut self, handle: StreamHandle, data: Bytes, end_stream: bool) -> Result<(), Error> {
        let key = handle.key();
        let stream = self.registry.get_mut(key).ok_or(Error::InvalidStream)?;
        if stream.is_push() {
            return Err(Error::InvalidState(
                "pushed streams cannot send".to_string(),
            ));
        }
        if stream.request_headers.is_none() {
            return Err(Error::InvalidState(
                "headers must be sent before data".to_string(),
            ));
        }
        if stream.fin_requested() {
            return Err(Error::InvalidState(
                "stream is already half-closed".to_string(),
            ));
        }

        stream.pending_send.extend_from_slice(&data);
        stream.pending_fin = end_stream;
        self.queue_next_data_frame(key);
        Ok(())
    }

    pub(crate) fn take_reader(&mut self, handle: StreamHandle) -> Result<EventReceiver, Error> {
        let stream = self
            .registry
            .get_mut(handle.key())
            .ok_or(Error::InvalidStream)?;
        let reader = stream.take_reader().ok_or_else(|| {
            Error::InvalidState("stream data is already being read".to_string())
        })?;
        // A claimed push that already finished was only kept for this reader.
        if stream.can_close() {
            let stream_id = stream.id;
            self.close_active_stream(stream_id, Ok(()));
        }
        Ok(reader)
    }

    /// Abandons a stream. Active streams are reset with CANCEL.
    pub fn cancel_stream(&mut self, handle: StreamHandle) {
        let key = handle.key();
        if self.registry.is_created(key) {
            self.close_created_stream(key, Err(Error::Aborted));
            return;
        }
        let Some(stream_id) = self.registry.stream_id_of(key) else {
            return;
        };
        if let Some(priority) = self.registry.get(key).map(|stream| stream.priority) {
            self.enqueue_reset_stream_frame(stream_id, priority, ErrorCode::Cancel);
        }
        self.close_active_stream(stream_id, Err(Error::Aborted));
    }

    // Stream teardown

    pub(crate) fn close_active_stream(&mut self, stream_id: u32, status: Result<(), Error>) {
        let Some(stream) = self.registry.remove_active(stream_id) else {
            return;
        };
        trace!(endpoint = %self.endpoint, stream_id, ok = status.is_ok(), "closing active stream");
        self.delete_stream(stream, status);
    }

    pub(crate) fn close_created_stream(&mut self, key: StreamKey, status: Result<(), Error>) {
        let Some(stream) = self.registry.remove_created(key) else {
            return;
        };
        trace!(endpoint = %self.endpoint, key = key.as_u64(), "closing created stream");
        self.delete_stream(stream, status);
    }

    /// Sends RST_STREAM and closes the stream with a protocol error.
    pub(crate) fn reset_stream(&mut self, stream_id: u32, code: ErrorCode, description: &str) {
        let Some(priority) = self
            .registry
            .active_key(stream_id)
            .and_then(|key| self.registry.get(key))
            .map(|stream| stream.priority)
        else {
            return;
        };
        debug!(endpoint = %self.endpoint, stream_id, %code, description, "resetting stream");
        self.enqueue_reset_stream_frame(stream_id, priority, code);
        self.close_active_stream(stream_id, Err(Error::Protocol(description.to_string())));
    }

    fn delete_stream(&mut self, mut stream: Stream, status: Result<(), Error>) {
        if let Some(in_flight) = self.in_flight.as_mut() {
            if in_flight.stream == Some(stream.key) {
                in_flight.stream = None;
            }
        }

        let discarded = self.write_queue.remove_pending_for_stream(stream.key);
        self.credit_discarded_writes(&discarded);

        let unread = stream.discard_unread();
        if unread > 0 {
            self.increase_recv_window(unread);
        }

        stream.on_close(status);

        if self.state == AvailabilityState::Available {
            self.process_pending_stream_requests();
        }
        self.maybe_finish_going_away();
    }

    fn credit_discarded_writes(&mut self, entries: &[WriteEntry]) {
        for entry in entries {
            let len = entry.data_payload_len();
            if len > 0 {
                self.increase_send_window(len as i32);
            }
        }
    }

    // Availability state machine

    fn make_unavailable(&mut self) {
        if self.state != AvailabilityState::Available {
            return;
        }
        self.state = AvailabilityState::GoingAway;
        debug!(endpoint = %self.endpoint, "session going away");
        for observer in &self.observers {
            observer.on_going_away(&self.endpoint);
        }
    }

    /// Stops handing out new streams. Parked requests fail; streams already
    /// created or active run to completion, after which the session drains.
    pub fn go_away(&mut self) {
        self.make_unavailable();
        for request in self.registry.drain_pending_requests() {
            let _ = request.responder.send(Err(Error::Aborted));
        }
        self.maybe_finish_going_away();
    }

    /// Fails parked requests and closes every stream the peer will not
    /// process: active streams above `last_good_stream_id` and all streams
    /// without an id.
    pub(crate) fn start_going_away(&mut self, last_good_stream_id: u32, status: Error) {
        for request in self.registry.drain_pending_requests() {
            let _ = request.responder.send(Err(Error::Aborted));
        }

        for stream_id in self.registry.active_ids_after(last_good_stream_id) {
            self.counters.streams_abandoned += 1;
            self.close_active_stream(stream_id, Err(status.clone()));
        }

        for key in self.registry.created_keys() {
            self.counters.streams_abandoned += 1;
            self.close_created_stream(key, Err(status.clone()));
        }

        let registry = &self.registry;
        let discarded = self
            .write_queue
            .remove_pending_after(last_good_stream_id, |key| registry.stream_id_of(key));
        self.credit_discarded_writes(&discarded);

        self.maybe_finish_going_away();
    }

    fn maybe_finish_going_away(&mut self) {
        if self.state == AvailabilityState::GoingAway
            && self.registry.num_active() == 0
            && self.registry.num_created() == 0
        {
            self.drain_session(Ok(()), "Finished going away");
        }
    }

    /// Moves straight to `Draining`. An error status tears down every stream
    /// with that error and, unless the error is about the connection itself,
    /// tells the peer with a GOAWAY.
    pub(crate) fn drain_session(&mut self, status: Result<(), Error>, description: &str) {
        if self.state == AvailabilityState::Draining {
            return;
        }
        self.make_unavailable();

        if let Err(err) = &status {
            if !err.suppresses_goaway() {
                let frame = Frame::GoAway {
                    last_stream_id: self.registry.last_accepted_push_stream_id(),
                    code: err.goaway_code(),
                    debug_data: Bytes::copy_from_slice(description.as_bytes()),
                };
                self.enqueue_session_write(RequestPriority::Highest, FrameType::GoAway, frame);
            }
        }

        self.state = AvailabilityState::Draining;
        self.error_on_close = status.as_ref().err().cloned();
        match &status {
            Ok(()) => debug!(endpoint = %self.endpoint, description, "session draining"),
            Err(err) => warn!(endpoint = %self.endpoint, error = %err, description, "session draining"),
        }
        self.closed_tx.send_replace(true);
        for observer in &self.observers {
            observer.on_closed(&self.endpoint, self.error_on_close.as_ref());
        }

        if let Err(err) = status {
            self.start_going_away(0, err);
        }
        self.write_notify.notify_one();
    }

    pub fn close_session(&mut self, error: Error, description: &str) {
        self.drain_session(Err(error), description);
    }

    /// Pool pressure: drains the session if it carries no active stream.
    pub fn close_one_idle_connection(&mut self) -> bool {
        if self.registry.num_active() != 0 {
            return false;
        }
        self.drain_session(Err(Error::ConnectionClosed), "Closing idle connection.");
        true
    }

    // Write queue helpers

    fn enqueue_session_write(&mut self, priority: RequestPriority, frame_type: FrameType, frame: Frame) {
        self.enqueue_write(priority, frame_type, BufferProducer::Frame(frame), None);
    }

    fn enqueue_stream_write(
        &mut self,
        priority: RequestPriority,
        frame_type: FrameType,
        producer: BufferProducer,
        key: StreamKey,
    ) {
        self.enqueue_write(priority, frame_type, producer, Some(key));
    }

    fn enqueue_write(
        &mut self,
        priority: RequestPriority,
        frame_type: FrameType,
        producer: BufferProducer,
        stream: Option<StreamKey>,
    ) {
        self.write_queue.enqueue(priority, frame_type, producer, stream);
        self.write_notify.notify_one();
    }

    /// RST_STREAM is queued as a session write so that closing the stream
    /// does not discard it.
    fn enqueue_reset_stream_frame(&mut self, stream_id: u32, priority: RequestPriority, code: ErrorCode) {
        self.enqueue_session_write(
            priority,
            FrameType::RstStream,
            Frame::RstStream { stream_id, code },
        );
    }

    /// Snapshot for diagnostics.
    pub fn info(&self) -> serde_json::Value {
        json!({
            "endpoint": self.endpoint,
            "state": self.state.to_string(),
            "is_secure": self.security.is_secure,
            "error": self.error_on_close.as_ref().map(|err| err.to_string()),
            "active_streams": self.registry.num_active(),
            "created_streams": self.registry.num_created(),
            "pending_requests": self.registry.num_pending_requests(),
            "unclaimed_pushed_streams": self.registry.num_unclaimed_pushed(),
            "pushed_streams": self.registry.num_pushed(),
            "max_concurrent_streams": self.max_concurrent_streams,
            "stream_hi_water_mark": self.registry.stream_hi_water_mark(),
            "last_accepted_push_stream_id": self.registry.last_accepted_push_stream_id(),
            "session_send_window": self.session_send_window.size(),
            "session_recv_window": self.session_recv.size(),
            "session_unacked_recv_bytes": self.session_recv.unacked(),
            "stream_initial_send_window": self.stream_initial_send_window,
            "pings_in_flight": self.pings_in_flight,
            "streams_initiated": self.counters.streams_initiated,
            "streams_pushed": self.counters.streams_pushed,
            "streams_pushed_and_claimed": self.counters.streams_pushed_and_claimed,
            "streams_abandoned": self.counters.streams_abandoned,
            "stalled_by_max_streams": self.counters.stalled_by_max_streams,
            "bytes_received": self.counters.bytes_received,
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("active_streams", &self.registry.num_active())
            .field("created_streams", &self.registry.num_created())
            .field("pending_writes", &self.write_queue.len())
            .finish()
    }
}
