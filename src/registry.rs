use crate::stream::{Stream, StreamHandle, StreamKey, StreamState};
use crate::types::{Error, RequestPriority, NUM_PRIORITIES};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use url::Url;

pub const FIRST_STREAM_ID: u32 = 1;
pub const LAST_STREAM_ID: u32 = 0x7fff_ffff;

/// Identifies a queued stream request so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

pub(crate) type StreamResponder = oneshot::Sender<Result<StreamHandle, Error>>;

#[derive(Debug)]
pub(crate) struct PendingStreamRequest {
    pub(crate) id: RequestId,
    pub(crate) url: Url,
    pub(crate) priority: RequestPriority,
    pub(crate) responder: StreamResponder,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PushedStreamInfo {
    pub(crate) stream_id: u32,
    pub(crate) creation_time: Instant,
}

/// Owns every stream of a session and indexes them by lifecycle pool:
/// created (no id), active (by id and by priority), unclaimed pushes by URL,
/// plus the per-priority queues of requests waiting for capacity.
#[derive(Debug)]
pub struct StreamRegistry {
    next_key: u64,
    next_request_id: u64,
    streams: HashMap<StreamKey, Stream>,
    created: BTreeSet<StreamKey>,
    active: BTreeMap<u32, StreamKey>,
    active_by_priority: [BTreeMap<u32, StreamKey>; NUM_PRIORITIES],
    unclaimed_pushed: BTreeMap<Url, PushedStreamInfo>,
    pending_requests: [VecDeque<PendingStreamRequest>; NUM_PRIORITIES],
    num_pushed: usize,
    num_active_pushed: usize,
    stream_hi_water_mark: u32,
    last_accepted_push_stream_id: u32,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            next_key: 1,
            next_request_id: 1,
            streams: HashMap::new(),
            created: BTreeSet::new(),
            active: BTreeMap::new(),
            active_by_priority: Default::default(),
            unclaimed_pushed: BTreeMap::new(),
            pending_requests: Default::default(),
            num_pushed: 0,
            num_active_pushed: 0,
            stream_hi_water_mark: FIRST_STREAM_ID,
            last_accepted_push_stream_id: 0,
        }
    }

    pub(crate) fn allocate_key(&mut self) -> StreamKey {
        let key = StreamKey::new(self.next_key);
        self.next_key += 1;
        key
    }

    pub(crate) fn insert_created(&mut self, stream: Stream) -> StreamKey {
        let key = stream.key;
        self.created.insert(key);
        self.streams.insert(key, stream);
        key
    }

    /// Assigns the next client stream id and moves the stream from the
    /// created pool into the active pools.
    pub(crate) fn activate(&mut self, key: StreamKey) -> Result<u32, Error> {
        if !self.created.contains(&key) {
            return Err(Error::InvalidStream);
        }
        if self.stream_hi_water_mark > LAST_STREAM_ID {
            return Err(Error::Failed);
        }
        let stream = self.streams.get_mut(&key).ok_or(Error::InvalidStream)?;
        let stream_id = self.stream_hi_water_mark;
        self.stream_hi_water_mark += 2;
        self.created.remove(&key);

        stream.id = stream_id;
        self.active.insert(stream_id, key);
        self.active_by_priority[stream.priority.index()].insert(stream_id, key);
        Ok(stream_id)
    }

    /// Registers a peer-initiated stream that already carries its id.
    pub(crate) fn insert_active(&mut self, stream: Stream) -> StreamKey {
        let key = stream.key;
        let stream_id = stream.id;
        if stream.is_push() {
            self.num_pushed += 1;
        }
        self.active.insert(stream_id, key);
        self.active_by_priority[stream.priority.index()].insert(stream_id, key);
        self.streams.insert(key, stream);
        key
    }

    pub(crate) fn remove_active(&mut self, stream_id: u32) -> Option<Stream> {
        let key = self.active.remove(&stream_id)?;
        let stream = self.streams.remove(&key)?;
        self.active_by_priority[stream.priority.index()].remove(&stream_id);

        if stream.is_push() {
            if self
                .unclaimed_pushed
                .get(&stream.url)
                .map(|info| info.stream_id == stream_id)
                .unwrap_or(false)
            {
                self.unclaimed_pushed.remove(&stream.url);
            }
            self.num_pushed = self.num_pushed.saturating_sub(1);
            if stream.state != StreamState::ReservedRemote {
                self.num_active_pushed = self.num_active_pushed.saturating_sub(1);
            }
        }
        Some(stream)
    }

    pub(crate) fn remove_created(&mut self, key: StreamKey) -> Option<Stream> {
        if !self.created.remove(&key) {
            return None;
        }
        self.streams.remove(&key)
    }

    pub(crate) fn get(&self, key: StreamKey) -> Option<&Stream> {
        self.streams.get(&key)
    }

    pub(crate) fn get_mut(&mut self, key: StreamKey) -> Option<&mut Stream> {
        self.streams.get_mut(&key)
    }

    pub(crate) fn active_key(&self, stream_id: u32) -> Option<StreamKey> {
        self.active.get(&stream_id).copied()
    }

    pub(crate) fn active_stream_mut(&mut self, stream_id: u32) -> Option<&mut Stream> {
        let key = self.active.get(&stream_id)?;
        self.streams.get_mut(key)
    }

    pub fn is_active(&self, stream_id: u32) -> bool {
        self.active.contains_key(&stream_id)
    }

    pub fn is_created(&self, key: StreamKey) -> bool {
        self.created.contains(&key)
    }

    pub fn contains(&self, key: StreamKey) -> bool {
        self.streams.contains_key(&key)
    }

    pub fn stream_id_of(&self, key: StreamKey) -> Option<u32> {
        self.streams.get(&key).map(|s| s.id)
    }

    pub fn active_ids(&self) -> Vec<u32> {
        self.active.keys().copied().collect()
    }

    pub fn active_ids_after(&self, last_good_stream_id: u32) -> Vec<u32> {
        self.active
            .range(last_good_stream_id.saturating_add(1)..)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn created_keys(&self) -> Vec<StreamKey> {
        self.created.iter().copied().collect()
    }

    pub fn num_active(&self) -> usize {
        self.active.len()
    }

    pub fn num_created(&self) -> usize {
        self.created.len()
    }

    pub fn num_pushed(&self) -> usize {
        self.num_pushed
    }

    pub fn num_active_pushed(&self) -> usize {
        self.num_active_pushed
    }

    pub(crate) fn on_pushed_stream_activated(&mut self) {
        self.num_active_pushed += 1;
    }

    pub fn num_unclaimed_pushed(&self) -> usize {
        self.unclaimed_pushed.len()
    }

    /// Streams counted against the concurrency cap: active plus created,
    /// excluding pushed streams.
    pub fn num_counted_streams(&self) -> usize {
        (self.active.len() + self.created.len()).saturating_sub(self.num_pushed)
    }

    pub fn stream_hi_water_mark(&self) -> u32 {
        self.stream_hi_water_mark
    }

    #[cfg(test)]
    pub(crate) fn set_stream_hi_water_mark(&mut self, stream_id: u32) {
        self.stream_hi_water_mark = stream_id;
    }

    pub fn id_space_exhausted(&self) -> bool {
        self.stream_hi_water_mark > LAST_STREAM_ID
    }

    pub fn last_accepted_push_stream_id(&self) -> u32 {
        self.last_accepted_push_stream_id
    }

    pub(crate) fn set_last_accepted_push_stream_id(&mut self, stream_id: u32) {
        self.last_accepted_push_stream_id = stream_id;
    }

    /// Stream the next opened stream at `priority` should depend on: the most
    /// recently activated one at the same or a higher priority.
    pub fn dependency_for(&self, priority: RequestPriority, exclude: u32) -> Option<u32> {
        self.active_by_priority[..=priority.index()]
            .iter()
            .rev()
            .find_map(|pool| {
                pool.keys()
                    .rev()
                    .copied()
                    .find(|id| *id != exclude)
            })
    }

    // Push index

    pub(crate) fn register_push_stream(
        &mut self,
        url: Url,
        stream_id: u32,
        creation_time: Instant,
    ) -> bool {
        if self.unclaimed_pushed.contains_key(&url) {
            return false;
        }
        self.unclaimed_pushed.insert(
            url,
            PushedStreamInfo {
                stream_id,
                creation_time,
            },
        );
        true
    }

    pub fn has_unclaimed_push(&self, url: &Url) -> bool {
        self.unclaimed_pushed.contains_key(url)
    }

    /// Removes the index entry for `url` and returns the still-active pushed
    /// stream, if any. A second claim for the same URL finds nothing.
    pub(crate) fn claim_push_stream(&mut self, url: &Url) -> Option<StreamKey> {
        let info = self.unclaimed_pushed.remove(url)?;
        self.active_key(info.stream_id)
    }

    /// Unclaimed pushed streams created before `now - min_lifetime`.
    pub(crate) fn expired_push_streams(&self, now: Instant, min_lifetime: Duration) -> Vec<u32> {
        self.unclaimed_pushed
            .values()
            .filter(|info| now.saturating_duration_since(info.creation_time) >= min_lifetime)
            .map(|info| info.stream_id)
            .collect()
    }

    // Pending requests

    pub(crate) fn enqueue_request(
        &mut self,
        url: Url,
        priority: RequestPriority,
        responder: StreamResponder,
    ) -> RequestId {
        let id = RequestId(self.next_request_id);
        self.next_request_id += 1;
        self.pending_requests[priority.index()].push_back(PendingStreamRequest {
            id,
            url,
            priority,
            responder,
        });
        id
    }

    /// Removes a queued request without disturbing the order of the others.
    pub(crate) fn cancel_request(&mut self, id: RequestId) -> Option<PendingStreamRequest> {
        for queue in self.pending_requests.iter_mut() {
            if let Some(position) = queue.iter().position(|request| request.id == id) {
                return queue.remove(position);
            }
        }
        None
    }

    pub(crate) fn next_pending_request(&mut self) -> Option<PendingStreamRequest> {
        self.pending_requests
            .iter_mut()
            .find_map(|queue| queue.pop_front())
    }

    pub(crate) fn drain_pending_requests(&mut self) -> Vec<PendingStreamRequest> {
        self.pending_requests
            .iter_mut()
            .flat_map(|queue| queue.drain(..))
            .collect()
    }

    pub fn num_pending_requests(&self) -> usize {
        self.pending_requests.iter().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamKind;

    fn url(path: &str) -> Url {
        Url::parse(&format!("https://example.com{}", path)).unwrap()
    }

    fn created(registry: &mut StreamRegistry, priority: RequestPriority) -> StreamKey {
        let key = registry.allocate_key();
        let stream = Stream::new(
            key,
            StreamKind::Bidirectional,
            url("/"),
            priority,
            65_535,
            65_535,
            Instant::now(),
        );
        registry.insert_created(stream)
    }

    fn pushed(registry: &mut StreamRegistry, stream_id: u32, path: &str) -> StreamKey {
        let key = registry.allocate_key();
        let stream = Stream::new_pushed(
            key,
            stream_id,
            1,
            url(path),
            RequestPriority::Idle,
            65_535,
            65_535,
            Instant::now(),
        );
        registry.insert_active(stream)
    }

    #[test]
    fn activation_assigns_odd_increasing_ids() {
        let mut registry = StreamRegistry::new();
        let a = created(&mut registry, RequestPriority::Low);
        let b = created(&mut registry, RequestPriority::Highest);
        assert_eq!(registry.num_created(), 2);

        assert_eq!(registry.activate(b).unwrap(), 1);
        assert_eq!(registry.activate(a).unwrap(), 3);
        assert_eq!(registry.num_created(), 0);
        assert_eq!(registry.active_ids(), vec![1, 3]);
        assert_eq!(registry.stream_hi_water_mark(), 5);
        assert_eq!(registry.activate(a), Err(Error::InvalidStream));
    }

    #[tokio::test]
    async fn dependency_picks_latest_same_or_higher_priority() {
        let mut registry = StreamRegistry::new();
        let high = created(&mut registry, RequestPriority::Highest);
        let low = created(&mut registry, RequestPriority::Low);
        let medium = created(&mut registry, RequestPriority::Medium);
        registry.activate(high).unwrap(); // 1
        registry.activate(low).unwrap(); // 3
        registry.activate(medium).unwrap(); // 5

        assert_eq!(registry.dependency_for(RequestPriority::Highest, 0), Some(1));
        assert_eq!(registry.dependency_for(RequestPriority::Highest, 1), None);
        assert_eq!(registry.dependency_for(RequestPriority::Medium, 0), Some(5));
        assert_eq!(registry.dependency_for(RequestPriority::Lowest, 0), Some(3));
        assert_eq!(registry.dependency_for(RequestPriority::Low, 3), Some(5));
    }

    #[tokio::test]
    async fn push_claim_is_idempotent() {
        let mut registry = StreamRegistry::new();
        let key = pushed(&mut registry, 2, "/style.css");
        assert!(registry.register_push_stream(url("/style.css"), 2, Instant::now()));
        assert!(!registry.register_push_stream(url("/style.css"), 4, Instant::now()));

        assert_eq!(registry.claim_push_stream(&url("/style.css")), Some(key));
        assert_eq!(registry.claim_push_stream(&url("/style.css")), None);
        assert!(registry.is_active(2));
    }

    #[tokio::test]
    async fn removing_pushed_stream_updates_counters_and_index() {
        let mut registry = StreamRegistry::new();
        pushed(&mut registry, 2, "/a.js");
        registry.register_push_stream(url("/a.js"), 2, Instant::now());
        assert_eq!(registry.num_pushed(), 1);
        assert_eq!(registry.num_counted_streams(), 0);

        let stream = registry.remove_active(2).unwrap();
        assert_eq!(stream.id, 2);
        assert_eq!(registry.num_pushed(), 0);
        assert_eq!(registry.num_unclaimed_pushed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_pushes_respect_min_lifetime() {
        let mut registry = StreamRegistry::new();
        let start = Instant::now();
        registry.register_push_stream(url("/old"), 2, start);
        tokio::time::advance(Duration::from_secs(200)).await;
        registry.register_push_stream(url("/new"), 4, Instant::now());
        tokio::time::advance(Duration::from_secs(100)).await;

        let expired = registry.expired_push_streams(Instant::now(), Duration::from_secs(300));
        assert_eq!(expired, vec![2]);
    }

    #[test]
    fn cancel_keeps_order_of_remaining_requests() {
        let mut registry = StreamRegistry::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        let (tx3, _rx3) = oneshot::channel();
        let (tx4, _rx4) = oneshot::channel();
        let first = registry.enqueue_request(url("/1"), RequestPriority::Low, tx1);
        let second = registry.enqueue_request(url("/2"), RequestPriority::Low, tx2);
        let third = registry.enqueue_request(url("/3"), RequestPriority::Low, tx3);
        let urgent = registry.enqueue_request(url("/4"), RequestPriority::Highest, tx4);

        assert!(registry.cancel_request(second).is_some());
        assert!(registry.cancel_request(second).is_none());
        assert_eq!(registry.num_pending_requests(), 3);

        let order: Vec<RequestId> = std::iter::from_fn(|| registry.next_pending_request())
            .map(|request| request.id)
            .collect();
        assert_eq!(order, vec![urgent, first, third]);
    }
}
