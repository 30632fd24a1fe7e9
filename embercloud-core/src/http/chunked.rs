//! Chunked transfer decoding.
//!
//! ```text
//! chunk-size (hex)[;ext]\r\n
//! chunk-data\r\n
//! ...
//! 0\r\n
//! [trailer\r\n]*
//! \r\n
//! ```
//!
//! The decoder keeps its position between calls, so fragments may split a
//! size line, the data, or the CRLF after the data anywhere.

use thiserror::Error;

/// Longest accepted size line (including extensions) or trailer line.
const MAX_LINE: usize = 256;

/// Error type for malformed chunked bodies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    /// The size line was not a valid hexadecimal number.
    #[error("invalid chunk size: {line:?}")]
    InvalidSize { line: String },

    /// A size or trailer line exceeded the line limit.
    #[error("chunk size line exceeds {MAX_LINE} bytes")]
    LineTooLong,

    /// Chunk data was not followed by CRLF.
    #[error("expected CRLF after chunk data")]
    ExpectedCrlf,

    /// The stream ended before the terminating zero-size chunk.
    #[error("chunked stream ended before the final chunk")]
    UnexpectedEof,
}

/// Where the decoder is within the chunk grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPhase {
    /// Accumulating a size line.
    ReadSize,
    /// Copying chunk data.
    ReadData,
    /// Expecting the CRLF after chunk data.
    ReadTrailingCrlf,
    /// Skipping trailer headers after the zero-size chunk.
    ReadTrailer,
    /// The body is complete.
    Done,
}

/// Persistent decoder position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDecodeState {
    /// Current grammar position.
    pub phase: ChunkPhase,
    /// Bytes remaining in the current chunk.
    pub chunked_size: usize,
    /// Total decoded bytes so far.
    pub total_data_len: usize,
}

/// Output of a one-shot [`ChunkedBodyDecoder::decode`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Data bytes decoded from the fragment.
    pub bytes: Vec<u8>,
    /// Whether the terminating chunk has been seen.
    pub done: bool,
}

/// Incremental chunked transfer decoder.
#[derive(Debug)]
pub struct ChunkedBodyDecoder {
    state: ChunkDecodeState,
    line: Vec<u8>,
    saw_cr: bool,
}

impl ChunkedBodyDecoder {
    /// Create a decoder at the start of a body.
    pub fn new() -> Self {
        Self {
            state: ChunkDecodeState {
                phase: ChunkPhase::ReadSize,
                chunked_size: 0,
                total_data_len: 0,
            },
            line: Vec::with_capacity(16),
            saw_cr: false,
        }
    }

    /// Current decoder position.
    pub fn state(&self) -> ChunkDecodeState {
        self.state
    }

    /// Whether the terminating chunk and trailers have been consumed.
    pub fn is_done(&self) -> bool {
        self.state.phase == ChunkPhase::Done
    }

    /// Decode a fragment into a fresh buffer.
    pub fn decode(&mut self, input: &[u8]) -> Result<Decoded, ChunkError> {
        let mut bytes = Vec::new();
        self.decode_into(input, &mut bytes)?;
        Ok(Decoded {
            bytes,
            done: self.is_done(),
        })
    }

    /// Decode a fragment, appending data bytes to `out`.
    ///
    /// Returns the number of input bytes consumed; input after the end of
    /// the body is left unconsumed.
    pub fn decode_into(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, ChunkError> {
        let mut pos = 0;
        while pos < input.len() {
            match self.state.phase {
                ChunkPhase::ReadSize => {
                    if let Some(line) = self.take_line(input, &mut pos)? {
                        self.start_chunk(&line)?;
                    }
                }
                ChunkPhase::ReadData => {
                    let n = self.state.chunked_size.min(input.len() - pos);
                    out.extend_from_slice(&input[pos..pos + n]);
                    pos += n;
                    self.state.chunked_size -= n;
                    self.state.total_data_len += n;
                    if self.state.chunked_size == 0 {
                        self.state.phase = ChunkPhase::ReadTrailingCrlf;
                    }
                }
                ChunkPhase::ReadTrailingCrlf => {
                    let byte = input[pos];
                    pos += 1;
                    match (self.saw_cr, byte) {
                        (false, b'\r') => self.saw_cr = true,
                        (_, b'\n') => {
                            self.saw_cr = false;
                            self.state.phase = ChunkPhase::ReadSize;
                        }
                        _ => return Err(ChunkError::ExpectedCrlf),
                    }
                }
                ChunkPhase::ReadTrailer => {
                    if let Some(line) = self.take_line(input, &mut pos)? {
                        if line.is_empty() {
                            self.state.phase = ChunkPhase::Done;
                        }
                    }
                }
                ChunkPhase::Done => break,
            }
        }
        Ok(pos)
    }

    /// Confirm the body ended properly once the input stream is exhausted.
    pub fn finish(&self) -> Result<(), ChunkError> {
        match self.state.phase {
            ChunkPhase::Done => Ok(()),
            // A missing final CRLF after the zero-size chunk is tolerated.
            ChunkPhase::ReadTrailer if self.line.is_empty() => Ok(()),
            _ => Err(ChunkError::UnexpectedEof),
        }
    }

    /// Accumulate bytes up to `\n`, returning the completed line.
    fn take_line(&mut self, input: &[u8], pos: &mut usize) -> Result<Option<Vec<u8>>, ChunkError> {
        while *pos < input.len() {
            let byte = input[*pos];
            *pos += 1;
            if byte == b'\n' {
                if self.line.last() == Some(&b'\r') {
                    self.line.pop();
                }
                return Ok(Some(std::mem::take(&mut self.line)));
            }
            if self.line.len() >= MAX_LINE {
                return Err(ChunkError::LineTooLong);
            }
            self.line.push(byte);
        }
        Ok(None)
    }

    fn start_chunk(&mut self, line: &[u8]) -> Result<(), ChunkError> {
        let text = String::from_utf8_lossy(line);
        let invalid = || ChunkError::InvalidSize {
            line: text.chars().take(32).collect(),
        };
        let digits = text.split(';').next().unwrap_or_default().trim();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let size = usize::from_str_radix(digits, 16).map_err(|_| invalid())?;

        self.state.chunked_size = size;
        self.state.phase = if size == 0 {
            ChunkPhase::ReadTrailer
        } else {
            ChunkPhase::ReadData
        };
        Ok(())
    }
}

impl Default for ChunkedBodyDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"7\r\n{\"a\":1,\r\n0A;ext=1\r\n\"b\":[1,2]}\r\n0\r\nX-Trailer: t\r\n\r\n";
    const EXPECTED: &[u8] = b"{\"a\":1,\"b\":[1,2]}";

    #[test]
    fn test_decode_whole_body() {
        let mut decoder = ChunkedBodyDecoder::new();
        let decoded = decoder.decode(BODY).unwrap();
        assert!(decoded.done);
        assert_eq!(decoded.bytes, EXPECTED);
        assert_eq!(decoder.state().total_data_len, EXPECTED.len());
    }

    #[test]
    fn test_chunk_boundary_independence() {
        for split in 1..BODY.len() {
            let mut decoder = ChunkedBodyDecoder::new();
            let mut out = Vec::new();
            for fragment in BODY.chunks(split) {
                decoder.decode_into(fragment, &mut out).unwrap();
            }
            assert!(decoder.is_done(), "split {split}");
            assert_eq!(out, EXPECTED, "split {split}");
        }
    }

    #[test]
    fn test_byte_at_a_time_state_is_monotonic() {
        let mut decoder = ChunkedBodyDecoder::new();
        let mut out = Vec::new();
        let mut last_total = 0;
        for byte in BODY {
            decoder.decode_into(std::slice::from_ref(byte), &mut out).unwrap();
            assert!(decoder.state().total_data_len >= last_total);
            last_total = decoder.state().total_data_len;
        }
        assert_eq!(out, EXPECTED);
    }

    #[test]
    fn test_input_after_end_is_not_consumed() {
        let mut decoder = ChunkedBodyDecoder::new();
        let mut out = Vec::new();
        let consumed = decoder.decode_into(b"1\r\na\r\n0\r\n\r\nHTTP/1.1", &mut out).unwrap();
        assert_eq!(consumed, 13);
        assert_eq!(out, b"a");
    }

    #[test]
    fn test_invalid_hex_size() {
        let mut decoder = ChunkedBodyDecoder::new();
        let result = decoder.decode(b"zz\r\nabc");
        assert!(matches!(result, Err(ChunkError::InvalidSize { .. })));
    }

    #[test]
    fn test_signed_size_rejected() {
        for line in [&b"+4\r\ntrue\r\n"[..], b"-0\r\n\r\n", b"0x4\r\ntrue\r\n"] {
            let result = ChunkedBodyDecoder::new().decode(line);
            assert!(matches!(result, Err(ChunkError::InvalidSize { .. })));
        }
    }

    #[test]
    fn test_missing_crlf_after_data() {
        let mut decoder = ChunkedBodyDecoder::new();
        let result = decoder.decode(b"2\r\nabXY");
        assert_eq!(result, Err(ChunkError::ExpectedCrlf));
    }

    #[test]
    fn test_premature_end_reported() {
        let mut decoder = ChunkedBodyDecoder::new();
        decoder.decode(b"5\r\nab").unwrap();
        assert_eq!(decoder.finish(), Err(ChunkError::UnexpectedEof));
    }

    #[test]
    fn test_oversized_size_line() {
        let mut decoder = ChunkedBodyDecoder::new();
        let line = vec![b'a'; MAX_LINE + 1];
        assert_eq!(decoder.decode(&line), Err(ChunkError::LineTooLong));
    }
}
