//! Length-prefixed frame codec shared by every engine and the client.
//!
//! ```text
//! Request:  [u32 LE length N][N bytes payload]
//! Close:    [u32 LE 0]
//! ```
//!
//! The codec itself never checks capacity; callers run [`classify`] on a
//! decoded length before touching the body.

/// Size of the length prefix in bytes.
pub const HEADER_SIZE: usize = 4;

/// Frame sent by a client to request a graceful close.
pub const CLOSE_FRAME: [u8; HEADER_SIZE] = [0; HEADER_SIZE];

/// Encode a body length as a frame header.
pub fn encode_header(body_len: u32) -> [u8; HEADER_SIZE] {
    body_len.to_le_bytes()
}

/// Decode a frame header into the declared body length.
pub fn decode_header(header: [u8; HEADER_SIZE]) -> u32 {
    u32::from_le_bytes(header)
}

/// What a decoded header asks the server to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    /// Zero length: the peer wants to close.
    Close,
    /// A body of this many bytes follows and fits in the buffer.
    Body(usize),
    /// Declared length exceeds the buffer capacity.
    Oversized(usize),
}

/// Classify a declared body length against a buffer capacity.
pub fn classify(body_len: u32, capacity: usize) -> Header {
    let len = body_len as usize;
    if len == 0 {
        Header::Close
    } else if len > capacity {
        Header::Oversized(len)
    } else {
        Header::Body(len)
    }
}

/// Build a complete request frame (header followed by payload).
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&encode_header(payload.len() as u32));
    frame.extend_from_slice(payload);
    frame
}
