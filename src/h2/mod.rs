pub mod codec;
pub mod consts;
pub mod hpack;

pub use codec::H2Codec;
