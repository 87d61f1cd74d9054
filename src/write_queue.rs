use crate::stream::StreamKey;
use crate::types::{Frame, FrameType, RequestPriority, NUM_PRIORITIES};
use bytes::Bytes;
use std::collections::VecDeque;

/// Produces the bytes of a queued write when it reaches the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferProducer {
    /// Serialized through the session codec at dequeue time.
    Frame(Frame),
    /// Initial HEADERS for the owning stream, built once the stream has its id.
    OpenStream,
    /// Already-serialized bytes (connection preface).
    Raw(Bytes),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteEntry {
    pub frame_type: FrameType,
    pub producer: BufferProducer,
    pub stream: Option<StreamKey>,
}

impl WriteEntry {
    /// Payload length of a queued DATA frame, used to return send-window
    /// credit when the entry is discarded unwritten.
    pub fn data_payload_len(&self) -> usize {
        match &self.producer {
            BufferProducer::Frame(Frame::Data { payload, .. }) => payload.len(),
            _ => 0,
        }
    }
}

/// Strict-priority FIFO of pending writes. Lower priorities only drain when
/// every higher bucket is empty, so sustained high-priority traffic starves
/// them.
#[derive(Debug, Default)]
pub struct WriteQueue {
    queues: [VecDeque<WriteEntry>; NUM_PRIORITIES],
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(
        &mut self,
        priority: RequestPriority,
        frame_type: FrameType,
        producer: BufferProducer,
        stream: Option<StreamKey>,
    ) {
        self.queues[priority.index()].push_back(WriteEntry {
            frame_type,
            producer,
            stream,
        });
    }

    pub fn dequeue(&mut self) -> Option<WriteEntry> {
        self.queues.iter_mut().find_map(|queue| queue.pop_front())
    }

    /// Drops every entry owned by `stream`, keeping the order of the rest.
    pub fn remove_pending_for_stream(&mut self, stream: StreamKey) -> Vec<WriteEntry> {
        self.remove_where(|entry| entry.stream == Some(stream))
    }

    /// Drops entries owned by streams whose id is above `last_good_stream_id`
    /// or that never got an id. `stream_id` resolves a key to its current id.
    pub fn remove_pending_after<F>(&mut self, last_good_stream_id: u32, stream_id: F) -> Vec<WriteEntry>
    where
        F: Fn(StreamKey) -> Option<u32>,
    {
        self.remove_where(|entry| match entry.stream {
            Some(key) => match stream_id(key) {
                Some(id) => id == 0 || id > last_good_stream_id,
                None => true,
            },
            None => false,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    fn remove_where<P>(&mut self, mut remove: P) -> Vec<WriteEntry>
    where
        P: FnMut(&WriteEntry) -> bool,
    {
        let mut removed = Vec::new();
        for queue in self.queues.iter_mut() {
            let mut kept = VecDeque::with_capacity(queue.len());
            for entry in queue.drain(..) {
                if remove(&entry) {
                    removed.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            *queue = kept;
        }
        removed
    }
}

/// Ids of streams waiting for send-window credit, bucketed by priority.
#[derive(Debug, Default)]
pub struct SendStallQueue {
    queues: [VecDeque<u32>; NUM_PRIORITIES],
}

impl SendStallQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, priority: RequestPriority, stream_id: u32) {
        self.queues[priority.index()].push_back(stream_id);
    }

    pub fn pop(&mut self) -> Option<u32> {
        self.queues.iter_mut().find_map(|queue| queue.pop_front())
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, stream_id: u32) -> bool {
        self.queues.iter().any(|queue| queue.contains(&stream_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorCode;

    fn ping(id: u64) -> BufferProducer {
        BufferProducer::Frame(Frame::Ping { id, ack: false })
    }

    fn ping_id(entry: &WriteEntry) -> u64 {
        match &entry.producer {
            BufferProducer::Frame(Frame::Ping { id, .. }) => *id,
            other => panic!("unexpected producer {:?}", other),
        }
    }

    #[test]
    fn dequeue_is_priority_then_fifo() {
        let mut queue = WriteQueue::new();
        queue.enqueue(RequestPriority::Low, FrameType::Ping, ping(1), None);
        queue.enqueue(RequestPriority::Highest, FrameType::Ping, ping(2), None);
        queue.enqueue(RequestPriority::Low, FrameType::Ping, ping(3), None);
        queue.enqueue(RequestPriority::Idle, FrameType::Ping, ping(4), None);
        queue.enqueue(RequestPriority::Highest, FrameType::Ping, ping(5), None);
        queue.enqueue(RequestPriority::Medium, FrameType::Ping, ping(6), None);

        let order: Vec<u64> = std::iter::from_fn(|| queue.dequeue())
            .map(|entry| ping_id(&entry))
            .collect();
        assert_eq!(order, vec![2, 5, 6, 1, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_for_stream_preserves_order() {
        let mut queue = WriteQueue::new();
        let a = StreamKey::new(1);
        let b = StreamKey::new(2);
        queue.enqueue(RequestPriority::Low, FrameType::Ping, ping(1), Some(a));
        queue.enqueue(RequestPriority::Low, FrameType::Ping, ping(2), Some(b));
        queue.enqueue(RequestPriority::Low, FrameType::Ping, ping(3), Some(a));
        queue.enqueue(RequestPriority::Low, FrameType::Ping, ping(4), None);
        queue.enqueue(RequestPriority::Low, FrameType::Ping, ping(5), Some(b));

        let removed = queue.remove_pending_for_stream(a);
        assert_eq!(removed.len(), 2);

        let order: Vec<u64> = std::iter::from_fn(|| queue.dequeue())
            .map(|entry| ping_id(&entry))
            .collect();
        assert_eq!(order, vec![2, 4, 5]);
    }

    #[test]
    fn remove_after_drops_unactivated_and_later_streams() {
        let mut queue = WriteQueue::new();
        let early = StreamKey::new(1);
        let late = StreamKey::new(2);
        let created = StreamKey::new(3);
        queue.enqueue(RequestPriority::Medium, FrameType::Ping, ping(1), Some(early));
        queue.enqueue(RequestPriority::Medium, FrameType::Ping, ping(2), Some(late));
        queue.enqueue(RequestPriority::Medium, FrameType::Ping, ping(3), Some(created));
        queue.enqueue(
            RequestPriority::Highest,
            FrameType::RstStream,
            BufferProducer::Frame(Frame::RstStream {
                stream_id: 0,
                code: ErrorCode::Cancel,
            }),
            None,
        );

        let removed = queue.remove_pending_after(5, |key| match key {
            k if k == early => Some(3),
            k if k == late => Some(7),
            _ => Some(0),
        });
        assert_eq!(removed.len(), 2);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dequeue().map(|e| e.frame_type), Some(FrameType::RstStream));
        assert_eq!(queue.dequeue().map(|e| ping_id(&e)), Some(1));
    }

    #[test]
    fn data_payload_len_only_counts_data() {
        let data = WriteEntry {
            frame_type: FrameType::Data,
            producer: BufferProducer::Frame(Frame::Data {
                stream_id: 1,
                payload: Bytes::from_static(b"hello"),
                end_stream: false,
            }),
            stream: None,
        };
        assert_eq!(data.data_payload_len(), 5);
        let raw = WriteEntry {
            frame_type: FrameType::Raw,
            producer: BufferProducer::Raw(Bytes::from_static(b"preface")),
            stream: None,
        };
        assert_eq!(raw.data_payload_len(), 0);
    }

    #[test]
    fn stall_queue_pops_by_priority() {
        let mut stalled = SendStallQueue::new();
        stalled.push(RequestPriority::Lowest, 9);
        stalled.push(RequestPriority::Highest, 3);
        stalled.push(RequestPriority::Lowest, 11);
        stalled.push(RequestPriority::Medium, 5);
        assert!(stalled.contains(11));
        assert_eq!(stalled.pop(), Some(3));
        assert_eq!(stalled.pop(), Some(5));
        assert_eq!(stalled.pop(), Some(9));
        assert_eq!(stalled.pop(), Some(11));
        assert_eq!(stalled.pop(), None);
    }
}
