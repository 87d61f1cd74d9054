use crate::flow_control::{FlowControlWindow, RecvWindow};
use crate::session::Session;
use crate::types::{Error, Header, RequestPriority};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::cell::RefCell;
use std::rc::Weak;
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

/// Arena slot of a stream inside its session. Keys are never reused, so a
/// stale key simply fails to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamKey(u64);

impl StreamKey {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Caller-side reference to a stream. Every use goes back through the
/// session, which may have closed the stream in the meantime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    key: StreamKey,
}

impl StreamHandle {
    pub(crate) fn new(key: StreamKey) -> Self {
        Self { key }
    }

    pub fn key(&self) -> StreamKey {
        self.key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Bidirectional,
    Push,
}

// Stream lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Request accepted, no id yet.
    Created,
    /// Pushed stream whose response headers have not arrived.
    ReservedRemote,
    /// Opening HEADERS written, waiting for the response.
    AwaitingResponse,
    Open,
    Closed,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamState::Created => write!(f, "created"),
            StreamState::ReservedRemote => write!(f, "reserved (remote)"),
            StreamState::AwaitingResponse => write!(f, "awaiting response"),
            StreamState::Open => write!(f, "open"),
            StreamState::Closed => write!(f, "closed"),
        }
    }
}

/// Inbound item delivered to a [`StreamReader`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Headers {
        headers: Vec<Header>,
        end_stream: bool,
        is_trailer: bool,
        received_at: DateTime<Utc>,
    },
    Data {
        payload: Bytes,
        end_stream: bool,
    },
}

pub(crate) type EventSender = mpsc::UnboundedSender<Result<StreamEvent, Error>>;
pub(crate) type EventReceiver = mpsc::UnboundedReceiver<Result<StreamEvent, Error>>;

#[derive(Debug)]
pub(crate) struct Stream {
    pub(crate) key: StreamKey,
    pub(crate) id: u32,
    pub(crate) kind: StreamKind,
    pub(crate) url: Url,
    pub(crate) priority: RequestPriority,
    pub(crate) state: StreamState,
    pub(crate) send_window: FlowControlWindow,
    pub(crate) recv_window: RecvWindow,
    pub(crate) send_stalled_by_flow_control: bool,
    pub(crate) request_headers: Option<(Vec<Header>, bool)>,
    pub(crate) pending_send: BytesMut,
    pub(crate) pending_fin: bool,
    pub(crate) pending_trailers: Option<Vec<Header>>,
    pub(crate) open_frame_sent: bool,
    pub(crate) data_write_queued: bool,
    pub(crate) local_closed: bool,
    pub(crate) remote_closed: bool,
    pub(crate) response_time: Option<DateTime<Utc>>,
    pub(crate) associated_stream_id: u32,
    /// Pushed and still listed in the unclaimed index.
    pub(crate) awaiting_claim: bool,
    pub(crate) creation_time: Instant,
    pub(crate) raw_sent_bytes: usize,
    pub(crate) raw_received_bytes: usize,
    events: Option<EventSender>,
    reader: Option<EventReceiver>,
}

impl Stream {
    pub(crate) fn new(
        key: StreamKey,
        kind: StreamKind,
        url: Url,
        priority: RequestPriority,
        send_window: i32,
        recv_window: i32,
        now: Instant,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            key,
            id: 0,
            kind,
            url,
            priority,
            state: StreamState::Created,
            send_window: FlowControlWindow::new(send_window),
            recv_window: RecvWindow::new(recv_window, recv_window),
            send_stalled_by_flow_control: false,
            request_headers: None,
            pending_send: BytesMut::new(),
            pending_fin: false,
            pending_trailers: None,
            open_frame_sent: false,
            data_write_queued: false,
            local_closed: false,
            remote_closed: false,
            response_time: None,
            associated_stream_id: 0,
            awaiting_claim: false,
            creation_time: now,
            raw_sent_bytes: 0,
            raw_received_bytes: 0,
            events: Some(tx),
            reader: Some(rx),
        }
    }

    /// Pushed stream announced by the peer; already has its id and never
    /// sends.
    pub(crate) fn new_pushed(
        key: StreamKey,
        stream_id: u32,
        associated_stream_id: u32,
        url: Url,
        priority: RequestPriority,
        send_window: i32,
        recv_window: i32,
        now: Instant,
    ) -> Self {
        let mut stream = Self::new(
            key,
            StreamKind::Push,
            url,
            priority,
            send_window,
            recv_window,
            now,
        );
        stream.id = stream_id;
        stream.associated_stream_id = associated_stream_id;
        stream.state = StreamState::ReservedRemote;
        stream.local_closed = true;
        stream.open_frame_sent = true;
        stream.awaiting_claim = true;
        stream
    }

    pub(crate) fn is_push(&self) -> bool {
        self.kind == StreamKind::Push
    }

    pub(crate) fn is_fully_closed(&self) -> bool {
        self.local_closed && self.remote_closed
    }

    /// Fully closed with nothing left for an owner to pick up. A pushed
    /// stream keeps its buffered events until it is claimed and read.
    pub(crate) fn can_close(&self) -> bool {
        if !self.is_fully_closed() {
            return false;
        }
        !self.awaiting_claim && !(self.is_push() && self.reader.is_some())
    }

    /// The caller has already asked for the local side to be closed.
    pub(crate) fn fin_requested(&self) -> bool {
        self.local_closed
            || self.pending_fin
            || self.pending_trailers.is_some()
            || matches!(self.request_headers, Some((_, true)))
    }

    /// Returns false when nobody will ever read the event: the reader was
    /// dropped or the stream already closed.
    pub(crate) fn deliver(&self, event: StreamEvent) -> bool {
        match &self.events {
            Some(tx) => tx.send(Ok(event)).is_ok(),
            None => false,
        }
    }

    pub(crate) fn take_reader(&mut self) -> Option<EventReceiver> {
        self.reader.take()
    }

    /// Drops inbound data nobody will read because the reader was never
    /// taken. Returns the number of payload bytes dropped.
    pub(crate) fn discard_unread(&mut self) -> usize {
        let Some(reader) = self.reader.as_mut() else {
            return 0;
        };
        let mut discarded = 0;
        while let Ok(item) = reader.try_recv() {
            if let Ok(StreamEvent::Data { payload, .. }) = item {
                discarded += payload.len();
            }
        }
        discarded
    }

    /// Final notification. An error is handed to the reader; a clean close
    /// just ends its sequence.
    pub(crate) fn on_close(&mut self, status: Result<(), Error>) {
        self.state = StreamState::Closed;
        if let (Some(tx), Err(err)) = (self.events.take(), status) {
            let _ = tx.send(Err(err));
        }
    }
}

/// Lazy, finite sequence of inbound headers and data for one stream.
/// Obtained once per stream from `SessionHandle::on_data`.
pub struct StreamReader {
    key: StreamKey,
    events: EventReceiver,
    session: Weak<RefCell<Session>>,
    finished: bool,
}

impl StreamReader {
    pub(crate) fn new(key: StreamKey, events: EventReceiver, session: Weak<RefCell<Session>>) -> Self {
        Self {
            key,
            events,
            session,
            finished: false,
        }
    }

    pub async fn next(&mut self) -> Option<Result<StreamEvent, Error>> {
        if self.finished {
            return None;
        }
        let item = self.events.recv().await;
        self.on_item(item)
    }

    /// Non-blocking variant of [`next`](Self::next); `None` when nothing is
    /// buffered right now or the sequence has ended.
    pub fn try_next(&mut self) -> Option<Result<StreamEvent, Error>> {
        if self.finished {
            return None;
        }
        match self.events.try_recv() {
            Ok(item) => self.on_item(Some(item)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => self.on_item(None),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Collects the remaining body. Headers are skipped.
    pub async fn read_to_end(&mut self) -> Result<Bytes, Error> {
        let mut body = BytesMut::new();
        while let Some(item) = self.next().await {
            if let StreamEvent::Data { payload, .. } = item? {
                body.extend_from_slice(&payload);
            }
        }
        Ok(body.freeze())
    }

    fn on_item(
        &mut self,
        item: Option<Result<StreamEvent, Error>>,
    ) -> Option<Result<StreamEvent, Error>> {
        match &item {
            None | Some(Err(_)) => self.finished = true,
            Some(Ok(StreamEvent::Data { payload, .. })) if !payload.is_empty() => {
                self.credit(payload.len());
            }
            Some(Ok(_)) => {}
        }
        item
    }

    fn credit(&self, len: usize) {
        let Some(shared) = self.session.upgrade() else {
            return;
        };
        // Reading from inside a session callback: the session is busy.
        let Ok(mut session) = shared.try_borrow_mut() else {
            return;
        };
        session.on_read_buffer_consumed(self.key, len);
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        // Buffered data that is never read still has to be credited back.
        let mut unread = 0;
        while let Ok(item) = self.events.try_recv() {
            if let Ok(StreamEvent::Data { payload, .. }) = item {
                unread += payload.len();
            }
        }
        if unread > 0 {
            self.credit(unread);
        }
    }
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("key", &self.key)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_outlives_its_session() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut reader = StreamReader::new(StreamKey::new(1), rx, Weak::new());
        tx.send(Ok(StreamEvent::Data {
            payload: Bytes::from_static(b"body"),
            end_stream: true,
        }))
        .unwrap();
        drop(tx);

        assert!(matches!(reader.try_next(), Some(Ok(StreamEvent::Data { .. }))));
        assert!(reader.try_next().is_none());
        assert!(reader.is_finished());
    }
}
