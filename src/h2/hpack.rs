use bytes::Bytes;
use hpack::{Decoder, Encoder};

use crate::types::{CodecError, Header};

/// Per-entry overhead counted against the header list size (RFC 7541 4.1).
const HEADER_ENTRY_OVERHEAD: usize = 32;

/// HPACK state for one connection. Encoding and decoding contexts are
/// independent; both must see every header block in wire order.
pub struct HeaderBlockCodec {
    encoder: Encoder<'static>,
    decoder: Decoder<'static>,
    peer_table_size: usize,
    max_header_list_size: usize,
}

impl HeaderBlockCodec {
    pub fn new(decoder_table_size: usize, max_header_list_size: usize) -> Self {
        let mut decoder = Decoder::new();
        decoder.set_max_table_size(decoder_table_size);
        Self {
            encoder: Encoder::new(),
            decoder,
            peer_table_size: decoder_table_size,
            max_header_list_size,
        }
    }

    /// SETTINGS_HEADER_TABLE_SIZE from the peer. The encoder keeps its table
    /// at the protocol default, which every peer must accept, so the value is
    /// only recorded.
    pub fn set_peer_table_size(&mut self, size: usize) {
        self.peer_table_size = size;
    }

    pub fn peer_table_size(&self) -> usize {
        self.peer_table_size
    }

    /// Field names go out lowercased; HTTP/2 rejects anything else.
    pub fn encode(&mut self, headers: &[Header]) -> Bytes {
        let names: Vec<String> = headers.iter().map(|h| h.name.to_ascii_lowercase()).collect();
        let fields = names
            .iter()
            .zip(headers)
            .map(|(name, h)| (name.as_bytes(), h.value_str().as_bytes()));
        Bytes::from(self.encoder.encode(fields))
    }

    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<Header>, CodecError> {
        let fields = self
            .decoder
            .decode(block)
            .map_err(|_| CodecError::DecompressFailure)?;

        let list_size: usize = fields
            .iter()
            .map(|(name, value)| name.len() + value.len() + HEADER_ENTRY_OVERHEAD)
            .sum();
        if list_size > self.max_header_list_size {
            return Err(CodecError::HeaderListTooLarge(list_size));
        }

        fields
            .into_iter()
            .map(|(name, value)| to_header(name, value))
            .collect()
    }
}

fn to_header(name: Vec<u8>, value: Vec<u8>) -> Result<Header, CodecError> {
    let name = String::from_utf8(name).map_err(|_| CodecError::DecompressFailure)?;
    if value.is_empty() {
        return Ok(Header::new_valueless(name));
    }
    let value = String::from_utf8(value).map_err(|_| CodecError::DecompressFailure)?;
    Ok(Header::new(name, value))
}
