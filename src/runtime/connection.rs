//! Frame state machine for non-blocking connections.
//!
//! The event loop owns one `FrameState` per socket and feeds it the result of
//! every read and write. The state machine decides how many bytes the next
//! operation should target, so partial reads never re-read acquired bytes and
//! partial writes resume at the right offset.

use crate::codec::{self, Header, HEADER_SIZE};
use crate::metrics::CloseReason;

/// Current phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ReadingHeader,
    ReadingBody,
    WritingResponse,
}

/// Outcome of feeding a completed read into the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStep {
    /// More bytes are needed in the current or next read phase.
    NeedMore,
    /// A full body is buffered and must be written back.
    Respond,
    /// The connection must be closed.
    Close(CloseReason),
}

/// Per-connection framing state.
#[derive(Debug)]
pub struct FrameState {
    phase: Phase,
    header: [u8; HEADER_SIZE],
    body: Box<[u8]>,
    /// Bytes still required to finish the current phase.
    remaining: usize,
    body_len: usize,
}

impl FrameState {
    /// Create a state in `ReadingHeader` with a body buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            phase: Phase::ReadingHeader,
            header: [0; HEADER_SIZE],
            body: vec![0u8; capacity].into_boxed_slice(),
            remaining: HEADER_SIZE,
            body_len: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn capacity(&self) -> usize {
        self.body.len()
    }

    /// Slice the next read must fill: exactly the missing bytes of the phase.
    pub fn read_target(&mut self) -> &mut [u8] {
        match self.phase {
            Phase::ReadingHeader => &mut self.header[HEADER_SIZE - self.remaining..],
            Phase::ReadingBody => {
                let start = self.body_len - self.remaining;
                &mut self.body[start..self.body_len]
            }
            Phase::WritingResponse => &mut [],
        }
    }

    /// Account for a read of `n` bytes into `read_target()`.
    pub fn advance_read(&mut self, n: usize) -> ReadStep {
        if n == 0 {
            return ReadStep::Close(CloseReason::InvalidStream);
        }
        debug_assert!(n <= self.remaining, "read past phase boundary");
        self.remaining -= n;
        if self.remaining > 0 {
            return ReadStep::NeedMore;
        }

        match self.phase {
            Phase::ReadingHeader => match codec::classify(
                codec::decode_header(self.header),
                self.capacity(),
            ) {
                Header::Close => ReadStep::Close(CloseReason::Peer),
                Header::Oversized(_) => ReadStep::Close(CloseReason::Violation),
                Header::Body(len) => {
                    self.phase = Phase::ReadingBody;
                    self.body_len = len;
                    self.remaining = len;
                    ReadStep::NeedMore
                }
            },
            Phase::ReadingBody => {
                self.phase = Phase::WritingResponse;
                self.remaining = self.body_len;
                ReadStep::Respond
            }
            Phase::WritingResponse => ReadStep::Respond,
        }
    }

    /// Length declared by the most recently completed header.
    pub fn declared_len(&self) -> u32 {
        codec::decode_header(self.header)
    }

    /// Unsent part of the response.
    pub fn write_source(&self) -> &[u8] {
        match self.phase {
            Phase::WritingResponse => &self.body[self.body_len - self.remaining..self.body_len],
            _ => &[],
        }
    }

    /// Account for a send of `n` bytes from `write_source()`.
    ///
    /// Returns `true` once the whole response is flushed; the state is then
    /// back in `ReadingHeader` for the next frame.
    pub fn advance_write(&mut self, n: usize) -> bool {
        debug_assert!(n <= self.remaining, "wrote past response end");
        self.remaining -= n;
        if self.remaining > 0 {
            return false;
        }
        self.phase = Phase::ReadingHeader;
        self.remaining = HEADER_SIZE;
        self.body_len = 0;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_frame;

    /// Feed `input` one byte per read, returning the step after each byte.
    fn feed_bytewise(state: &mut FrameState, input: &[u8]) -> Vec<ReadStep> {
        input
            .iter()
            .map(|byte| {
                let target = state.read_target();
                assert!(!target.is_empty());
                target[0] = *byte;
                state.advance_read(1)
            })
            .collect()
    }

    #[test]
    fn test_state_transitions() {
        let mut state = FrameState::new(16);
        assert_eq!(state.phase(), Phase::ReadingHeader);
        assert_eq!(state.read_target().len(), HEADER_SIZE);

        state.read_target().copy_from_slice(&codec::encode_header(3));
        assert_eq!(state.advance_read(HEADER_SIZE), ReadStep::NeedMore);
        assert_eq!(state.phase(), Phase::ReadingBody);
        assert_eq!(state.read_target().len(), 3);

        state.read_target().copy_from_slice(b"abc");
        assert_eq!(state.advance_read(3), ReadStep::Respond);
        assert_eq!(state.phase(), Phase::WritingResponse);
        assert_eq!(state.write_source(), b"abc");

        assert!(state.advance_write(3));
        assert_eq!(state.phase(), Phase::ReadingHeader);
        assert_eq!(state.read_target().len(), HEADER_SIZE);
    }

    #[test]
    fn test_bytewise_reads_assemble_frame() {
        let mut state = FrameState::new(1000);
        let payload: Vec<u8> = (1..=200u32).map(|i| i as u8).collect();
        let steps = feed_bytewise(&mut state, &encode_frame(&payload));

        assert_eq!(steps.last(), Some(&ReadStep::Respond));
        assert!(steps[..steps.len() - 1]
            .iter()
            .all(|s| *s == ReadStep::NeedMore));
        assert_eq!(state.write_source(), &payload[..]);
    }

    #[test]
    fn test_partial_writes_resume_at_offset() {
        let mut state = FrameState::new(16);
        feed_bytewise(&mut state, &encode_frame(b"hello world"));

        let mut echoed = Vec::new();
        while state.phase() == Phase::WritingResponse {
            let chunk = state.write_source()[..2.min(state.write_source().len())].to_vec();
            echoed.extend_from_slice(&chunk);
            state.advance_write(chunk.len());
        }
        assert_eq!(echoed, b"hello world");
    }

    #[test]
    fn test_zero_length_header_is_peer_close() {
        let mut state = FrameState::new(16);
        state.read_target().copy_from_slice(&codec::CLOSE_FRAME);
        assert_eq!(
            state.advance_read(HEADER_SIZE),
            ReadStep::Close(CloseReason::Peer)
        );
    }

    #[test]
    fn test_oversized_header_is_violation() {
        let mut state = FrameState::new(16);
        state.read_target().copy_from_slice(&codec::encode_header(17));
        assert_eq!(
            state.advance_read(HEADER_SIZE),
            ReadStep::Close(CloseReason::Violation)
        );
        assert_eq!(state.declared_len(), 17);
    }

    #[test]
    fn test_eof_mid_frame_is_invalid_stream() {
        let mut state = FrameState::new(16);
        state.read_target()[..2].copy_from_slice(&[5, 0]);
        assert_eq!(state.advance_read(2), ReadStep::NeedMore);
        assert_eq!(state.read_target().len(), 2);
        assert_eq!(
            state.advance_read(0),
            ReadStep::Close(CloseReason::InvalidStream)
        );
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut state = FrameState::new(8);
        for payload in [&b"one"[..], b"two!", b"x"] {
            let steps = feed_bytewise(&mut state, &encode_frame(payload));
            assert_eq!(steps.last(), Some(&ReadStep::Respond));
            assert_eq!(state.write_source(), payload);
            assert!(state.advance_write(payload.len()));
        }
    }
}
