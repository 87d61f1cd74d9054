use super::{AvailabilityState, CreateStreamResult, PendingStream, Session, SessionObserver, StreamRequest};
use crate::registry::RequestId;
use crate::stream::{StreamHandle, StreamReader, StreamState};
use crate::types::{Error, Header};
use bytes::Bytes;
use std::cell::{Ref, RefCell};
use std::rc::Rc;
use url::Url;

/// Shared, single-threaded owner of a [`Session`]. Clones refer to the same
/// session; the driver and every caller on the local task set hold one.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inner: Rc<RefCell<Session>>,
}

impl SessionHandle {
    pub fn new(session: Session) -> Self {
        Self {
            inner: Rc::new(RefCell::new(session)),
        }
    }

    pub(crate) fn inner(&self) -> &Rc<RefCell<Session>> {
        &self.inner
    }

    /// Read-only view of the session. Do not hold it across an await.
    pub fn session(&self) -> Ref<'_, Session> {
        self.inner.borrow()
    }

    pub fn initialize(&self) {
        self.inner.borrow_mut().initialize();
    }

    /// Creates a stream, waiting for concurrency capacity if needed. A
    /// request with a deadline that is not satisfied in time is withdrawn
    /// and fails with `TimedOut`.
    pub async fn request_stream(&self, request: StreamRequest) -> Result<StreamHandle, Error> {
        let pending = match self.try_create_stream(&request)? {
            CreateStreamResult::Created(handle) => return Ok(handle),
            CreateStreamResult::Pending(pending) => pending,
        };

        match request.deadline {
            Some(deadline) => pending.wait_for(self, deadline).await,
            None => pending.wait().await,
        }
    }

    pub fn try_create_stream(&self, request: &StreamRequest) -> Result<CreateStreamResult, Error> {
        self.inner.borrow_mut().try_create_stream(request)
    }

    /// Withdraws a parked request. Returns false if it was already resolved.
    pub fn cancel_stream_request(&self, id: RequestId) -> bool {
        self.inner.borrow_mut().cancel_stream_request(id)
    }

    pub fn send_headers(&self, stream: StreamHandle, headers: Vec<Header>, end_stream: bool) -> Result<(), Error> {
        self.inner.borrow_mut().send_headers(stream, headers, end_stream)
    }

    pub fn send_data(&self, stream: StreamHandle, data: impl Into<Bytes>, end_stream: bool) -> Result<(), Error> {
        self.inner.borrow_mut().send_data(stream, data.into(), end_stream)
    }

    /// Inbound headers and data of `stream`. Can be taken once; consumed
    /// data is credited back to the flow-control windows as it is read.
    pub fn on_data(&self, stream: StreamHandle) -> Result<StreamReader, Error> {
        let events = self.inner.borrow_mut().take_reader(stream)?;
        Ok(StreamReader::new(stream.key(), events, Rc::downgrade(&self.inner)))
    }

    pub fn cancel_stream(&self, stream: StreamHandle) {
        self.inner.borrow_mut().cancel_stream(stream);
    }

    pub fn get_push_stream(&self, url: &Url) -> Result<Option<StreamHandle>, Error> {
        self.inner.borrow_mut().get_push_stream(url)
    }

    pub fn close_session(&self, error: Error, description: &str) {
        self.inner.borrow_mut().close_session(error, description);
    }

    pub fn go_away(&self) {
        self.inner.borrow_mut().go_away();
    }

    pub fn close_one_idle_connection(&self) -> bool {
        self.inner.borrow_mut().close_one_idle_connection()
    }

    pub fn add_observer(&self, observer: Rc<dyn SessionObserver>) {
        self.inner.borrow_mut().add_observer(observer);
    }

    pub fn state(&self) -> AvailabilityState {
        self.inner.borrow().state()
    }

    pub fn is_available(&self) -> bool {
        self.inner.borrow().is_available()
    }

    pub fn error_on_close(&self) -> Option<Error> {
        self.inner.borrow().error_on_close().cloned()
    }

    pub fn stream_id(&self, stream: StreamHandle) -> Option<u32> {
        self.inner.borrow().stream_id(stream)
    }

    pub fn stream_state(&self, stream: StreamHandle) -> Option<StreamState> {
        self.inner.borrow().stream_state(stream)
    }

    pub fn info(&self) -> serde_json::Value {
        self.inner.borrow().info()
    }
}

impl PendingStream {
    /// Like [`wait`](Self::wait), but gives up after `deadline` and
    /// withdraws the request from `session`.
    pub async fn wait_for(self, session: &SessionHandle, deadline: std::time::Duration) -> Result<StreamHandle, Error> {
        let id = self.id();
        match tokio::time::timeout(deadline, self.wait()).await {
            Ok(result) => result,
            Err(_) => {
                session.cancel_stream_request(id);
                Err(Error::TimedOut)
            }
        }
    }
}
