pub mod config;
pub mod error;
pub mod frame;
pub mod header;
pub mod priority;

pub use config::*;
pub use error::*;
pub use frame::*;
pub use header::*;
pub use priority::*;
