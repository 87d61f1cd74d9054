use std::time::Duration;

pub const DEFAULT_INITIAL_WINDOW_SIZE: i32 = 65_535;
pub const DEFAULT_SESSION_MAX_RECV_WINDOW: i32 = 10 * 1024 * 1024;
pub const DEFAULT_STREAM_MAX_RECV_WINDOW: i32 = 6 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Concurrent streams allowed before the peer's SETTINGS arrive.
    pub initial_max_concurrent_streams: usize,
    /// Hard cap regardless of what the peer advertises.
    pub max_concurrent_stream_limit: usize,
    pub max_concurrent_pushed_streams: usize,
    pub session_max_recv_window: i32,
    pub stream_max_recv_window: i32,
    pub enable_sending_initial_data: bool,
    pub enable_ping_based_connection_checking: bool,
    pub connection_at_risk_of_loss_time: Duration,
    pub hung_interval: Duration,
    pub min_pushed_stream_lifetime: Duration,
    pub read_buffer_size: usize,
    pub yield_after_bytes_read: usize,
    pub yield_after_duration: Duration,
    pub max_frame_chunk_size: usize,
    pub send_priority_dependency: bool,
    pub enable_push: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_max_concurrent_streams: 100,
            max_concurrent_stream_limit: 256,
            max_concurrent_pushed_streams: 1000,
            session_max_recv_window: DEFAULT_SESSION_MAX_RECV_WINDOW,
            stream_max_recv_window: DEFAULT_STREAM_MAX_RECV_WINDOW,
            enable_sending_initial_data: true,
            enable_ping_based_connection_checking: true,
            connection_at_risk_of_loss_time: Duration::from_secs(10),
            hung_interval: Duration::from_secs(10),
            min_pushed_stream_lifetime: Duration::from_secs(300),
            read_buffer_size: 8 * 1024,
            yield_after_bytes_read: 32 * 1024,
            yield_after_duration: Duration::from_millis(20),
            max_frame_chunk_size: 16 * 1024,
            send_priority_dependency: true,
            enable_push: true,
        }
    }
}

impl SessionConfig {
    pub fn with_initial_max_concurrent_streams(mut self, max: usize) -> Self {
        self.initial_max_concurrent_streams = max;
        self
    }

    pub fn with_max_concurrent_stream_limit(mut self, max: usize) -> Self {
        self.max_concurrent_stream_limit = max;
        self
    }

    pub fn with_max_concurrent_pushed_streams(mut self, max: usize) -> Self {
        self.max_concurrent_pushed_streams = max;
        self
    }

    pub fn with_recv_windows(mut self, session: i32, stream: i32) -> Self {
        self.session_max_recv_window = session;
        self.stream_max_recv_window = stream;
        self
    }

    pub fn with_initial_data(mut self, enabled: bool) -> Self {
        self.enable_sending_initial_data = enabled;
        self
    }

    pub fn with_ping_checking(mut self, enabled: bool) -> Self {
        self.enable_ping_based_connection_checking = enabled;
        self
    }

    pub fn with_connection_at_risk_of_loss_time(mut self, duration: Duration) -> Self {
        self.connection_at_risk_of_loss_time = duration;
        self
    }

    pub fn with_hung_interval(mut self, duration: Duration) -> Self {
        self.hung_interval = duration;
        self
    }

    pub fn with_min_pushed_stream_lifetime(mut self, duration: Duration) -> Self {
        self.min_pushed_stream_lifetime = duration;
        self
    }

    pub fn with_max_frame_chunk_size(mut self, size: usize) -> Self {
        self.max_frame_chunk_size = size;
        self
    }

    pub fn with_priority_dependency(mut self, enabled: bool) -> Self {
        self.send_priority_dependency = enabled;
        self
    }

    pub fn with_push(mut self, enabled: bool) -> Self {
        self.enable_push = enabled;
        self
    }
}

/// What the transport handshake established about the connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecurityInfo {
    pub is_secure: bool,
    /// Set when the handshake completed despite a certificate problem.
    pub certificate_error: Option<String>,
}

impl SecurityInfo {
    pub fn insecure() -> Self {
        Self::default()
    }

    pub fn secure() -> Self {
        Self {
            is_secure: true,
            certificate_error: None,
        }
    }
}
