//! Continuous zlib-stream decompressor for gateway frames.
//!
//! The gateway compresses the whole connection as a single zlib stream and
//! sync-flushes after every message, so each message ends with the
//! `00 00 FF FF` trailer. The inflate context must live exactly as long as one
//! socket: call [`FrameCodec::reset`] before attaching to a new one.

use flate2::{Decompress, DecompressError, FlushDecompress, Status};
use thiserror::Error;

/// Trailer emitted by a zlib sync flush; marks the end of one message.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Upper bound for a message still waiting for its trailer.
const MAX_PENDING_BYTES: usize = 16 * 1024 * 1024;
const MIN_OUTPUT_SPARE: usize = 4 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    /// The inflate context rejected the input; the stream is desynchronized.
    #[error("zlib stream desynchronized: {0}")]
    Inflate(#[from] DecompressError),

    #[error("incomplete message exceeded {limit} bytes without a flush trailer")]
    PendingOverflow { limit: usize },
}

/// Inflate context bound to one socket generation.
#[derive(Debug)]
pub struct FrameCodec {
    inflater: Decompress,
    pending: Vec<u8>,
    resets: u64,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inflater: Decompress::new(true),
            pending: Vec::new(),
            resets: 0,
        }
    }

    /// Feeds one transport frame into the stream.
    ///
    /// Returns `Ok(None)` while the buffered bytes lack the flush trailer and
    /// the full decompressed message once it arrives.
    pub fn decompress(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, CodecError> {
        self.pending.extend_from_slice(chunk);
        if !self.pending.ends_with(&ZLIB_SUFFIX) {
            if self.pending.len() > MAX_PENDING_BYTES {
                self.pending.clear();
                return Err(CodecError::PendingOverflow {
                    limit: MAX_PENDING_BYTES,
                });
            }
            return Ok(None);
        }

        let input = std::mem::take(&mut self.pending);
        let mut output = Vec::with_capacity(input.len().saturating_mul(4).max(MIN_OUTPUT_SPARE));
        let mut consumed = 0usize;

        loop {
            if output.capacity() - output.len() < MIN_OUTPUT_SPARE {
                output.reserve(output.capacity().max(MIN_OUTPUT_SPARE));
            }

            let in_before = self.inflater.total_in();
            let out_before = output.len();
            let status = self.inflater.decompress_vec(
                &input[consumed..],
                &mut output,
                FlushDecompress::Sync,
            )?;
            let step = (self.inflater.total_in() - in_before) as usize;
            consumed += step;

            let progressed = step > 0 || output.len() > out_before;
            let drained = consumed >= input.len() && output.len() < output.capacity();
            if matches!(status, Status::StreamEnd) || drained || !progressed {
                break;
            }
        }

        Ok(Some(output))
    }

    /// Discards the inflate context and any partial message.
    pub fn reset(&mut self) {
        self.inflater.reset(true);
        self.pending.clear();
        self.resets += 1;
    }

    /// Number of times this codec has been reset onto a new socket.
    pub fn resets(&self) -> u64 {
        self.resets
    }

    pub fn has_pending_fragment(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use flate2::{Compress, Compression, FlushCompress};

    use super::{FrameCodec, ZLIB_SUFFIX};

    fn compress_message(compressor: &mut Compress, data: &[u8]) -> Vec<u8> {
        let start = compressor.total_in();
        let mut out = Vec::with_capacity(data.len() + 1024);
        loop {
            let consumed = (compressor.total_in() - start) as usize;
            compressor
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
                .expect("compress");
            let done = (compressor.total_in() - start) as usize == data.len();
            if done && out.len() < out.capacity() {
                return out;
            }
            out.reserve(1024);
        }
    }

    fn zlib_stream() -> Compress {
        Compress::new(Compression::default(), true)
    }

    #[test]
    fn decodes_consecutive_messages_from_one_stream() {
        let mut stream = zlib_stream();
        let mut codec = FrameCodec::new();
        let messages = [
            br#"{"op":10,"d":{"heartbeat_interval":41250}}"#.to_vec(),
            br#"{"op":11,"d":null}"#.to_vec(),
            br#"{"op":0,"s":1,"t":"READY","d":{}}"#.to_vec(),
        ];

        for message in &messages {
            let frame = compress_message(&mut stream, message);
            assert!(frame.ends_with(&ZLIB_SUFFIX));
            let decoded = codec.decompress(&frame).expect("inflate").expect("complete");
            assert_eq!(&decoded, message);
        }
    }

    #[test]
    fn fragmented_frames_match_contiguous_stream() {
        let payload = br#"{"op":0,"s":2,"t":"MESSAGE_CREATE","d":{"content":"hello hello hello"}}"#;
        let mut stream = zlib_stream();
        let frame = compress_message(&mut stream, payload);

        let mut codec = FrameCodec::new();
        let (head, tail) = frame.split_at(frame.len() / 2);
        assert_eq!(codec.decompress(head).expect("inflate head"), None);
        assert!(codec.has_pending_fragment());
        let decoded = codec
            .decompress(tail)
            .expect("inflate tail")
            .expect("complete message");
        assert_eq!(&decoded[..], &payload[..]);
        assert!(!codec.has_pending_fragment());
    }

    #[test]
    fn large_message_grows_output_buffer() {
        let payload: Vec<u8> = std::iter::repeat(b"abcdefgh".as_slice())
            .take(64 * 1024)
            .flatten()
            .copied()
            .collect();
        let mut stream = zlib_stream();
        let frame = compress_message(&mut stream, &payload);
        let mut codec = FrameCodec::new();
        let decoded = codec.decompress(&frame).expect("inflate").expect("complete");
        assert_eq!(decoded.len(), payload.len());
        assert_eq!(decoded, payload);
    }

    #[test]
    fn reset_attaches_to_a_fresh_stream() {
        let mut first = zlib_stream();
        let mut codec = FrameCodec::new();
        let frame = compress_message(&mut first, br#"{"op":10}"#);
        codec.decompress(&frame).expect("inflate").expect("complete");

        codec.reset();
        assert_eq!(codec.resets(), 1);

        let mut second = zlib_stream();
        let frame = compress_message(&mut second, br#"{"op":11}"#);
        let decoded = codec.decompress(&frame).expect("inflate").expect("complete");
        assert_eq!(&decoded, br#"{"op":11}"#);
    }

    #[test]
    fn reset_discards_old_context() {
        let mut stream = zlib_stream();
        let first = compress_message(&mut stream, br#"{"op":10}"#);
        let continuation = compress_message(&mut stream, br#"{"op":11}"#);

        let mut codec = FrameCodec::new();
        codec.decompress(&first).expect("inflate").expect("complete");
        codec.reset();

        // A continuation of the old stream has no zlib header and must not inflate.
        assert!(codec.decompress(&continuation).is_err());
    }

    #[test]
    fn fresh_stream_without_reset_is_rejected() {
        let mut first = zlib_stream();
        let mut codec = FrameCodec::new();
        let frame = compress_message(&mut first, br#"{"op":10}"#);
        codec.decompress(&frame).expect("inflate").expect("complete");

        let mut second = zlib_stream();
        let frame = compress_message(&mut second, br#"{"op":10}"#);
        let result = codec.decompress(&frame);
        assert!(
            !matches!(result, Ok(Some(ref bytes)) if bytes == br#"{"op":10}"#),
            "stale context must not decode a new stream cleanly"
        );
    }
}
