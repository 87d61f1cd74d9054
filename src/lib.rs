pub mod driver;
pub mod flow_control;
pub mod h2;
pub mod registry;
pub mod session;
pub mod settings_store;
pub mod stream;
pub mod transport;
pub mod types;
pub mod write_queue;

pub use flow_control::{FlowControlWindow, RecvWindow, WindowError};
pub use h2::H2Codec;
pub use registry::{RequestId, StreamRegistry};
pub use session::{
    AvailabilityState, CreateStreamResult, PendingStream, Session, SessionCounters, SessionHandle,
    SessionObserver, StreamRequest,
};
pub use settings_store::{InMemorySettingsStore, SettingsStore};
pub use stream::{StreamEvent, StreamHandle, StreamKey, StreamReader, StreamState};
pub use types::*;
pub use write_queue::{BufferProducer, SendStallQueue, WriteEntry, WriteQueue};
