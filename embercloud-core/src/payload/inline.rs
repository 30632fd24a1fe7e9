//! Incremental base64 decoding of inline binary values.
//!
//! Binary values travel as JSON strings of the form
//! `"blob,base64,<data>"` or `"file,base64,<data>"`. The decoders here
//! accept the value in arbitrary fragments and hand decoded bytes to a
//! [`ByteSink`] in batches, so the encoded text is never held in full.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use thiserror::Error;

use super::sink::{ByteSink, MemorySink};
use crate::error::code;

/// Signature opening an inline blob value, including the opening quote.
pub const BLOB_SIGNATURE: &str = "\"blob,base64,";

/// Signature opening an inline file value, including the opening quote.
pub const FILE_SIGNATURE: &str = "\"file,base64,";

/// Encoded characters decoded per sink write.
const BATCH_CHARS: usize = 512;

/// Error type for inline payload decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Base64Error {
    /// A byte outside the `A-Za-z0-9+/=` alphabet.
    #[error("invalid base64 character 0x{byte:02x} at position {position}")]
    InvalidCharacter { byte: u8, position: usize },

    /// Padding in the wrong place, or more than two `=`.
    #[error("invalid base64 padding at position {position}")]
    InvalidPadding { position: usize },

    /// The data ended inside an unpadded group.
    #[error("base64 data ends inside a group")]
    TruncatedGroup,

    /// The value did not start with a known signature.
    #[error("inline value has no blob or file signature")]
    MissingSignature,

    /// The value ended before its closing quote.
    #[error("inline value is missing its closing quote")]
    Unterminated,

    /// The base64 engine rejected a group.
    #[error("base64 group rejected: {reason}")]
    Rejected { reason: String },

    /// The sink refused decoded bytes.
    #[error("writing decoded bytes failed: {message}")]
    Sink { message: String },
}

impl Base64Error {
    /// Stable integer code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::Sink { .. } => code::SINK_WRITE,
            _ => code::BASE64_DECODE,
        }
    }

    fn sink(err: std::io::Error) -> Self {
        Self::Sink {
            message: err.to_string(),
        }
    }
}

fn in_alphabet(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'+' || byte == b'/'
}

/// Streaming decoder for standard (`+/`) base64 text.
///
/// Complete groups are batched and decoded together. A padded group is
/// held back until [`finish`](Self::finish) confirms nothing follows it,
/// so a failed decode never emits bytes past the last complete group.
#[derive(Debug)]
pub struct Base64StreamDecoder {
    group: [u8; 4],
    group_len: usize,
    padding: usize,
    padded_tail: Option<[u8; 4]>,
    batch: Vec<u8>,
    out: Vec<u8>,
    position: usize,
    written: usize,
}

impl Base64StreamDecoder {
    /// Create a decoder.
    pub fn new() -> Self {
        Self {
            group: [0; 4],
            group_len: 0,
            padding: 0,
            padded_tail: None,
            batch: Vec::with_capacity(BATCH_CHARS),
            out: Vec::with_capacity(BATCH_CHARS / 4 * 3),
            position: 0,
            written: 0,
        }
    }

    /// Decoded bytes handed to the sink so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Feed encoded text.
    ///
    /// ASCII whitespace is skipped. On error the complete groups already
    /// validated are flushed to `sink` before the error is returned.
    pub fn feed(&mut self, input: &[u8], sink: &mut dyn ByteSink) -> Result<(), Base64Error> {
        for &byte in input {
            if let Err(err) = self.push(byte) {
                self.flush(sink)?;
                return Err(err);
            }
            if self.batch.len() >= BATCH_CHARS {
                self.flush(sink)?;
            }
        }
        Ok(())
    }

    /// Flush remaining groups, including a padded final group.
    pub fn finish(&mut self, sink: &mut dyn ByteSink) -> Result<usize, Base64Error> {
        self.flush(sink)?;
        if self.group_len != 0 {
            return Err(Base64Error::TruncatedGroup);
        }
        if let Some(tail) = self.padded_tail.take() {
            let mut out = [0u8; 3];
            let n = STANDARD
                .decode_slice(tail, &mut out)
                .map_err(|e| Base64Error::Rejected {
                    reason: e.to_string(),
                })?;
            sink.write(&out[..n]).map_err(Base64Error::sink)?;
            self.written += n;
        }
        Ok(self.written)
    }

    fn push(&mut self, byte: u8) -> Result<(), Base64Error> {
        let position = self.position;
        self.position += 1;
        if byte.is_ascii_whitespace() {
            return Ok(());
        }
        if byte == b'=' {
            if self.padded_tail.is_some() || self.group_len < 2 || self.padding >= 2 {
                return Err(Base64Error::InvalidPadding { position });
            }
            self.padding += 1;
        } else if !in_alphabet(byte) {
            return Err(Base64Error::InvalidCharacter { byte, position });
        } else if self.padding > 0 || self.padded_tail.is_some() {
            return Err(Base64Error::InvalidPadding { position });
        }

        self.group[self.group_len] = byte;
        self.group_len += 1;
        if self.group_len == 4 {
            if self.padding > 0 {
                self.padded_tail = Some(self.group);
            } else {
                self.batch.extend_from_slice(&self.group);
            }
            self.group_len = 0;
        }
        Ok(())
    }

    fn flush(&mut self, sink: &mut dyn ByteSink) -> Result<(), Base64Error> {
        if self.batch.is_empty() {
            return Ok(());
        }
        self.out.resize(self.batch.len() / 4 * 3, 0);
        let n = STANDARD
            .decode_slice(&self.batch, &mut self.out)
            .map_err(|e| Base64Error::Rejected {
                reason: e.to_string(),
            })?;
        self.batch.clear();
        sink.write(&self.out[..n]).map_err(Base64Error::sink)?;
        self.written += n;
        Ok(())
    }
}

impl Default for Base64StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InlinePhase {
    Signature { matched: usize },
    Data,
    Done,
}

/// Decoder for a complete inline value, signature and quotes included.
#[derive(Debug)]
pub struct InlineBase64Decoder {
    phase: InlinePhase,
    signature: Option<&'static [u8]>,
    data: Base64StreamDecoder,
}

impl InlineBase64Decoder {
    /// Create a decoder expecting a blob or file signature.
    pub fn new() -> Self {
        Self {
            phase: InlinePhase::Signature { matched: 0 },
            signature: None,
            data: Base64StreamDecoder::new(),
        }
    }

    /// The value kind, once the signature has been recognised.
    pub fn kind(&self) -> Option<super::DataType> {
        match self.signature {
            Some(sig) if sig == BLOB_SIGNATURE.as_bytes() => Some(super::DataType::Blob),
            Some(_) => Some(super::DataType::File),
            None => None,
        }
    }

    /// Whether the closing quote has been consumed.
    pub fn is_done(&self) -> bool {
        self.phase == InlinePhase::Done
    }

    /// Decoded bytes handed to the sink so far.
    pub fn written(&self) -> usize {
        self.data.written()
    }

    /// Feed a fragment of the value.
    ///
    /// Returns the number of bytes consumed; bytes after the closing quote
    /// are not consumed.
    pub fn feed(&mut self, input: &[u8], sink: &mut dyn ByteSink) -> Result<usize, Base64Error> {
        let mut pos = 0;
        while pos < input.len() {
            let byte = input[pos];
            match self.phase {
                InlinePhase::Signature { matched } => {
                    pos += 1;
                    if matched == 0 && byte.is_ascii_whitespace() {
                        continue;
                    }
                    self.match_signature(matched, byte)?;
                }
                InlinePhase::Data => {
                    let end = input[pos..]
                        .iter()
                        .position(|&b| b == b'"')
                        .map_or(input.len(), |i| pos + i);
                    // JSON writers may escape '/' as "\/".
                    for piece in input[pos..end].split(|&b| b == b'\\') {
                        self.data.feed(piece, sink)?;
                    }
                    pos = end;
                    if pos < input.len() {
                        pos += 1;
                        self.data.finish(sink)?;
                        self.phase = InlinePhase::Done;
                    }
                }
                InlinePhase::Done => break,
            }
        }
        Ok(pos)
    }

    /// Confirm the value was complete.
    pub fn finish(&self) -> Result<usize, Base64Error> {
        match self.phase {
            InlinePhase::Done => Ok(self.data.written()),
            InlinePhase::Signature { .. } => Err(Base64Error::MissingSignature),
            InlinePhase::Data => Err(Base64Error::Unterminated),
        }
    }

    fn match_signature(&mut self, matched: usize, byte: u8) -> Result<(), Base64Error> {
        let signature = match (matched, self.signature) {
            (0, _) if byte == b'"' => {
                self.phase = InlinePhase::Signature { matched: 1 };
                return Ok(());
            }
            (1, _) => match byte {
                b'b' => BLOB_SIGNATURE.as_bytes(),
                b'f' => FILE_SIGNATURE.as_bytes(),
                _ => return Err(Base64Error::MissingSignature),
            },
            (_, Some(signature)) if signature.get(matched) == Some(&byte) => signature,
            _ => return Err(Base64Error::MissingSignature),
        };
        self.signature = Some(signature);
        let matched = matched + 1;
        self.phase = if matched == signature.len() {
            InlinePhase::Data
        } else {
            InlinePhase::Signature { matched }
        };
        Ok(())
    }
}

impl Default for InlineBase64Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode base64 from `src` into `sink`.
///
/// A value opening with a quote must carry a blob or file signature and is
/// decoded up to its closing quote; anything else is treated as bare base64
/// text. Returns the number of decoded bytes written.
pub fn decode_base64_stream(src: &[u8], sink: &mut dyn ByteSink) -> Result<usize, Base64Error> {
    let quoted = src
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|&b| b == b'"');
    if quoted {
        let mut decoder = InlineBase64Decoder::new();
        decoder.feed(src, sink)?;
        decoder.finish()
    } else {
        let mut decoder = Base64StreamDecoder::new();
        decoder.feed(src, sink)?;
        decoder.finish(sink)
    }
}

/// Decode an inline value held entirely in memory.
pub fn decode_inline(text: &str) -> Result<Vec<u8>, Base64Error> {
    let mut sink = MemorySink::new();
    decode_base64_stream(text.as_bytes(), &mut sink)?;
    Ok(sink.into_inner())
}
