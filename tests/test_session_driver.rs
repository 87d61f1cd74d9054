use bytes::Bytes;
use ripmux::driver;
use ripmux::h2::consts::CONNECTION_PREFACE;
use ripmux::types::{
    Error, ErrorCode, Frame, FrameCodec, FrameEvent, Header, RequestPriority, SecurityInfo,
    SessionConfig,
};
use ripmux::{H2Codec, Session, SessionHandle, StreamEvent, StreamRequest};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::LocalSet;
use url::Url;

#[cfg(test)]
mod tests {
    use super::*;

    const ENDPOINT: &str = "example.com:443";

    // RUST_LOG=ripmux=trace shows the session's frame log.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn new_session(config: SessionConfig) -> SessionHandle {
        init_tracing();
        SessionHandle::new(Session::new(
            ENDPOINT,
            config,
            SecurityInfo::secure(),
            Box::new(H2Codec::new()),
        ))
    }

    fn url(path: &str) -> Url {
        Url::parse(&format!("https://example.com{}", path)).unwrap()
    }

    fn get_headers(path: &str) -> Vec<Header> {
        vec![
            Header::new(":method", "GET"),
            Header::new(":scheme", "https"),
            Header::new(":authority", "example.com"),
            Header::new(":path", path),
        ]
    }

    /// Server side of an in-memory connection.
    struct Peer {
        io: DuplexStream,
        codec: H2Codec,
        pending: Vec<u8>,
        events: VecDeque<FrameEvent>,
        preface_seen: bool,
    }

    impl Peer {
        fn new(io: DuplexStream) -> Self {
            Self {
                io,
                codec: H2Codec::new(),
                pending: Vec::new(),
                events: VecDeque::new(),
                preface_seen: false,
            }
        }

        async fn next_event(&mut self) -> Option<FrameEvent> {
            loop {
                if let Some(event) = self.events.pop_front() {
                    return Some(event);
                }

                let mut buf = [0u8; 4096];
                let n = self.io.read(&mut buf).await.ok()?;
                if n == 0 {
                    return None;
                }
                self.pending.extend_from_slice(&buf[..n]);

                if !self.preface_seen {
                    if self.pending.len() < CONNECTION_PREFACE.len() {
                        continue;
                    }
                    assert!(self.pending.starts_with(CONNECTION_PREFACE));
                    self.pending.drain(..CONNECTION_PREFACE.len());
                    self.preface_seen = true;
                }

                let mut decoded = Vec::new();
                let mut input: &[u8] = &self.pending;
                while !input.is_empty() {
                    let consumed = self.codec.process_input(input, &mut decoded).unwrap();
                    input = &input[consumed..];
                }
                self.pending.clear();
                self.events.extend(decoded);
            }
        }

        /// Skips frames until one matches.
        async fn expect<F>(&mut self, mut matches: F) -> FrameEvent
        where
            F: FnMut(&FrameEvent) -> bool,
        {
            loop {
                let event = self
                    .next_event()
                    .await
                    .expect("connection closed before the expected frame");
                if matches(&event) {
                    return event;
                }
            }
        }

        async fn send(&mut self, frame: Frame) {
            let bytes = self.codec.encode(&frame).unwrap();
            self.io.write_all(&bytes).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        LocalSet::new()
            .run_until(async {
                let (client, server) = tokio::io::duplex(64 * 1024);
                let session = new_session(SessionConfig::default());
                session.initialize();
                let driver = tokio::task::spawn_local(driver::run(session.clone(), client));
                let mut peer = Peer::new(server);

                let settings = peer
                    .expect(|event| matches!(event, FrameEvent::Settings { .. }))
                    .await;
                assert!(matches!(settings, FrameEvent::Settings { clear_persisted: false, .. }));
                peer.send(Frame::Settings { values: Vec::new() }).await;
                peer.expect(|event| *event == FrameEvent::SettingsAck).await;

                let stream = session
                    .request_stream(StreamRequest::new(url("/index.html"), RequestPriority::Medium))
                    .await
                    .unwrap();
                let mut reader = session.on_data(stream).unwrap();
                session
                    .send_headers(stream, get_headers("/index.html"), true)
                    .unwrap();

                let request = peer
                    .expect(|event| matches!(event, FrameEvent::Headers { .. }))
                    .await;
                match request {
                    FrameEvent::Headers {
                        stream_id,
                        headers,
                        end_stream,
                        ..
                    } => {
                        assert_eq!(stream_id, 1);
                        assert!(end_stream);
                        assert!(headers.iter().any(|h| h.name == ":path" && h.value_str() == "/index.html"));
                    }
                    other => panic!("unexpected frame {:?}", other),
                }
                assert_eq!(session.stream_id(stream), Some(1));

                peer.send(Frame::Headers {
                    stream_id: 1,
                    headers: vec![Header::new(":status", "200")],
                    end_stream: false,
                    priority: None,
                })
                .await;
                peer.send(Frame::Data {
                    stream_id: 1,
                    payload: Bytes::from_static(b"hello"),
                    end_stream: true,
                })
                .await;

                match reader.next().await {
                    Some(Ok(StreamEvent::Headers { headers, is_trailer, .. })) => {
                        assert!(!is_trailer);
                        assert_eq!(headers[0].value_str(), "200");
                    }
                    other => panic!("expected response headers, got {:?}", other),
                }
                assert_eq!(reader.read_to_end().await.unwrap(), Bytes::from_static(b"hello"));
                assert!(reader.is_finished());
                assert_eq!(session.stream_state(stream), None);

                session.go_away();
                assert_eq!(driver.await.unwrap(), Ok(()));
                assert!(peer.next_event().await.is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn test_peer_goaway_finishes_running_stream() {
        LocalSet::new()
            .run_until(async {
                let (client, server) = tokio::io::duplex(64 * 1024);
                let session = new_session(SessionConfig::default().with_initial_data(false));
                let driver = tokio::task::spawn_local(driver::run(session.clone(), client));
                let mut peer = Peer::new(server);
                peer.preface_seen = true;

                let first = session
                    .request_stream(StreamRequest::new(url("/a"), RequestPriority::Medium))
                    .await
                    .unwrap();
                let second = session
                    .request_stream(StreamRequest::new(url("/b"), RequestPriority::Medium))
                    .await
                    .unwrap();
                let mut second_reader = session.on_data(second).unwrap();
                session.send_headers(first, get_headers("/a"), true).unwrap();
                session.send_headers(second, get_headers("/b"), true).unwrap();
                peer.expect(|event| matches!(event, FrameEvent::Headers { stream_id: 3, .. }))
                    .await;

                peer.send(Frame::GoAway {
                    last_stream_id: 1,
                    code: ErrorCode::NoError,
                    debug_data: Bytes::new(),
                })
                .await;
                assert_eq!(second_reader.next().await, Some(Err(Error::Aborted)));
                assert!(!session.is_available());

                peer.send(Frame::Headers {
                    stream_id: 1,
                    headers: vec![Header::new(":status", "204")],
                    end_stream: true,
                    priority: None,
                })
                .await;
                assert_eq!(driver.await.unwrap(), Ok(()));
            })
            .await;
    }

    #[tokio::test]
    async fn test_reading_data_returns_stream_credit() {
        LocalSet::new()
            .run_until(async {
                let (client, server) = tokio::io::duplex(64 * 1024);
                let config = SessionConfig::default().with_recv_windows(65_535, 1_000);
                let session = new_session(config);
                session.initialize();
                let driver = tokio::task::spawn_local(driver::run(session.clone(), client));
                let mut peer = Peer::new(server);

                let settings = peer
                    .expect(|event| matches!(event, FrameEvent::Settings { .. }))
                    .await;
                assert_eq!(
                    settings,
                    FrameEvent::Settings {
                        clear_persisted: false,
                        values: vec![(0x3, 1_000), (0x4, 1_000)],
                    }
                );

                let stream = session
                    .request_stream(StreamRequest::new(url("/big"), RequestPriority::Low))
                    .await
                    .unwrap();
                let mut reader = session.on_data(stream).unwrap();
                session.send_headers(stream, get_headers("/big"), true).unwrap();
                peer.expect(|event| matches!(event, FrameEvent::Headers { .. }))
                    .await;

                peer.send(Frame::Headers {
                    stream_id: 1,
                    headers: vec![Header::new(":status", "200")],
                    end_stream: false,
                    priority: None,
                })
                .await;
                peer.send(Frame::Data {
                    stream_id: 1,
                    payload: Bytes::from(vec![0u8; 600]),
                    end_stream: false,
                })
                .await;

                assert!(matches!(reader.next().await, Some(Ok(StreamEvent::Headers { .. }))));
                assert!(matches!(reader.next().await, Some(Ok(StreamEvent::Data { .. }))));

                let update = peer
                    .expect(|event| matches!(event, FrameEvent::WindowUpdate { .. }))
                    .await;
                assert_eq!(
                    update,
                    FrameEvent::WindowUpdate {
                        stream_id: 1,
                        delta: 600,
                    }
                );

                session.close_session(Error::Aborted, "test done");
                assert_eq!(driver.await.unwrap(), Err(Error::Aborted));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_ping_fails_session() {
        LocalSet::new()
            .run_until(async {
                let (client, server) = tokio::io::duplex(64 * 1024);
                let session = new_session(SessionConfig::default());
                session.initialize();
                let driver = tokio::task::spawn_local(driver::run(session.clone(), client));
                let mut peer = Peer::new(server);
                peer.expect(|event| matches!(event, FrameEvent::WindowUpdate { stream_id: 0, .. }))
                    .await;

                tokio::time::sleep(Duration::from_secs(11)).await;

                let stream = session
                    .request_stream(StreamRequest::new(url("/"), RequestPriority::Medium))
                    .await
                    .unwrap();
                let mut reader = session.on_data(stream).unwrap();
                session.send_headers(stream, get_headers("/"), true).unwrap();
                let ping = peer
                    .expect(|event| matches!(event, FrameEvent::Ping { .. }))
                    .await;
                assert_eq!(ping, FrameEvent::Ping { id: 1, ack: false });

                assert_eq!(driver.await.unwrap(), Err(Error::PingFailed));
                assert_eq!(reader.next().await, Some(Err(Error::PingFailed)));

                let goaway = peer
                    .expect(|event| matches!(event, FrameEvent::GoAway { .. }))
                    .await;
                assert!(matches!(
                    goaway,
                    FrameEvent::GoAway {
                        code: ErrorCode::ProtocolError,
                        ..
                    }
                ));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_stream_deadline_times_out() {
        let session = new_session(SessionConfig::default().with_initial_max_concurrent_streams(1));
        let _first = session
            .request_stream(StreamRequest::new(url("/1"), RequestPriority::Medium))
            .await
            .unwrap();

        let request = StreamRequest::new(url("/2"), RequestPriority::Medium)
            .with_deadline(Duration::from_secs(5));
        assert_eq!(session.request_stream(request).await, Err(Error::TimedOut));
        assert_eq!(session.session().num_pending_requests(), 0);
        assert_eq!(session.session().counters().stalled_by_max_streams, 1);
    }

    #[tokio::test]
    async fn test_pending_request_wakes_when_capacity_frees() {
        let session = new_session(SessionConfig::default().with_initial_max_concurrent_streams(1));
        let first = session
            .request_stream(StreamRequest::new(url("/1"), RequestPriority::Medium))
            .await
            .unwrap();

        let mut waiting = tokio_test::task::spawn(
            session.request_stream(StreamRequest::new(url("/2"), RequestPriority::Medium)),
        );
        tokio_test::assert_pending!(waiting.poll());

        session.cancel_stream(first);
        assert!(waiting.is_woken());
        let second = tokio_test::assert_ready_ok!(waiting.poll());
        assert_eq!(session.stream_id(second), Some(0));
    }

    #[tokio::test]
    async fn test_going_away_fails_waiting_requests() {
        let session = new_session(SessionConfig::default().with_initial_max_concurrent_streams(1));
        let _first = session
            .request_stream(StreamRequest::new(url("/1"), RequestPriority::Medium))
            .await
            .unwrap();

        let mut waiting = tokio_test::task::spawn(
            session.request_stream(StreamRequest::new(url("/2"), RequestPriority::Medium)),
        );
        tokio_test::assert_pending!(waiting.poll());

        session.go_away();
        assert_eq!(
            tokio_test::assert_ready!(waiting.poll()),
            Err(Error::Aborted)
        );
        assert_eq!(
            session
                .request_stream(StreamRequest::new(url("/3"), RequestPriority::Medium))
                .await,
            Err(Error::Failed)
        );
    }
}
