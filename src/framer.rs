//! C4: turns a byte stream (which may split or coalesce frames arbitrarily)
//! into a sequence of typed PDUs, resynchronizing after garbage or corrupt
//! frames.

use crate::error::GivEnergyError;
use crate::pdu::{self, Pdu};

const MAGIC: [u8; 2] = [0x59, 0x59];
const MIN_HEADER: usize = 8;

/// Stateful byte-in, frame-out adapter. Only the client-side decode
/// direction (responses + heartbeat requests) is needed here.
#[derive(Debug, Default)]
pub struct ClientFramer {
    buf: Vec<u8>,
}

impl ClientFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of bytes read off the socket, returning every frame
    /// (decoded PDU, or decode error) that became available. Errors are
    /// reported rather than raised so the caller can log-and-continue: the
    /// framer has already resynchronized past the offending bytes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<Pdu, GivEnergyError>> {
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        loop {
            if self.buf.len() < MIN_HEADER {
                break;
            }

            match self.buf.windows(2).position(|w| w == MAGIC) {
                Some(0) => {}
                Some(pos) => {
                    tracing::warn!(discarded = pos, "framer resync: discarding garbage bytes");
                    self.buf.drain(0..pos);
                }
                None => {
                    tracing::warn!(discarded = self.buf.len(), "framer resync: no magic found, discarding buffer");
                    self.buf.clear();
                    break;
                }
            }

            if self.buf.len() < MIN_HEADER {
                break;
            }

            let declared_len = u16::from_be_bytes([self.buf[4], self.buf[5]]) as usize;
            let total_len = 6 + declared_len;
            if self.buf.len() < total_len {
                break; // wait for more bytes
            }

            let frame: Vec<u8> = self.buf.drain(0..total_len).collect();
            out.push(pdu::decode(&frame));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat_frame() -> Vec<u8> {
        crate::pdu::HeartbeatMessage::new(0x01).encode()
    }

    // ========== basic framing tests ==========

    #[test]
    fn yields_nothing_for_short_buffer() {
        let mut framer = ClientFramer::new();
        assert!(framer.feed(&[0x59, 0x59, 0x00]).is_empty());
    }

    #[test]
    fn decodes_a_single_complete_frame() {
        let mut framer = ClientFramer::new();
        let frame = heartbeat_frame();
        let results = framer.feed(&frame);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }

    #[test]
    fn buffers_a_partial_frame_until_completed() {
        let mut framer = ClientFramer::new();
        let frame = heartbeat_frame();
        let (head, tail) = frame.split_at(frame.len() - 3);
        assert!(framer.feed(head).is_empty());
        let results = framer.feed(tail);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }

    #[test]
    fn two_frames_in_one_chunk_both_decode() {
        let mut framer = ClientFramer::new();
        let mut chunk = heartbeat_frame();
        chunk.extend(heartbeat_frame());
        let results = framer.feed(&chunk);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_ok()));
    }

    // ========== resync tests ==========

    #[test]
    fn resyncs_past_leading_garbage() {
        let mut framer = ClientFramer::new();
        let mut chunk = vec![0xDE, 0xAD, 0xBE, 0xEF];
        chunk.extend(heartbeat_frame());
        let results = framer.feed(&chunk);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }

    #[test]
    fn garbage_frame_a_garbage_frame_b_half_frame_c() {
        let mut framer = ClientFramer::new();
        let frame_a = heartbeat_frame();
        let frame_b = heartbeat_frame();
        let frame_c = heartbeat_frame();
        let (c_head, _c_tail) = frame_c.split_at(frame_c.len() - 4);

        let mut chunk = vec![0x00, 0x11, 0x22];
        chunk.extend(&frame_a);
        chunk.extend(vec![0xAA, 0xBB]);
        chunk.extend(&frame_b);
        chunk.extend(c_head);

        let results = framer.feed(&chunk);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[test]
    fn corrupt_frame_yields_error_and_resyncs() {
        let mut framer = ClientFramer::new();
        let mut bad_frame = heartbeat_frame();
        // Corrupt the protocol id (doesn't affect framing, decode() rejects it).
        bad_frame[3] = 0xFF;
        let mut chunk = bad_frame;
        chunk.extend(heartbeat_frame());

        let results = framer.feed(&chunk);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert!(results[1].is_ok());
    }

    #[test]
    fn no_magic_anywhere_discards_whole_buffer() {
        let mut framer = ClientFramer::new();
        let results = framer.feed(&[0x01; 20]);
        assert!(results.is_empty());
        // Feeding a real frame afterwards still works; the garbage is gone.
        let results = framer.feed(&heartbeat_frame());
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }
}
