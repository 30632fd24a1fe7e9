//! Payload typing and inline binary decoding.
//!
//! This module provides:
//! - [`DataType`] and [`classify`] - Prefix-sniffing of untyped response text
//! - [`TypedValue`] - Accessors over a classified value
//! - [`Base64StreamDecoder`] / [`InlineBase64Decoder`] - Incremental base64
//!   decoding of `"blob,base64,..."` and `"file,base64,..."` values
//! - [`ByteSink`] and friends - Destinations for decoded bytes

use std::fmt;

use serde::Serialize;

mod inline;
mod sink;

pub use inline::{
    decode_base64_stream, decode_inline, Base64Error, Base64StreamDecoder, InlineBase64Decoder,
    BLOB_SIGNATURE, FILE_SIGNATURE,
};
pub use sink::{
    ByteSink, DownloadTarget, FileSink, FirmwareUpdater, MemorySink, OpenMode, OpenSink, OtaSink,
};

/// Semantic type of a response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Null,
    Integer,
    Float,
    Double,
    Boolean,
    String,
    Json,
    Array,
    Blob,
    File,
    Shallow,
    Timestamp,
}

impl DataType {
    /// Lowercase name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Double => "double",
            Self::Boolean => "boolean",
            Self::String => "string",
            Self::Json => "json",
            Self::Array => "array",
            Self::Blob => "blob",
            Self::File => "file",
            Self::Shallow => "shallow",
            Self::Timestamp => "timestamp",
        }
    }

    /// Whether the value is a number.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Float | Self::Double | Self::Timestamp)
    }

    /// Whether the value carries inline base64 data.
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Blob | Self::File)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying a payload.
///
/// `offset` and `len` select the value inside the classified text. For
/// blob and file values they select the base64 data, past the signature
/// and before the closing quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub data_type: DataType,
    pub offset: usize,
    pub len: usize,
}

impl Classification {
    /// A classification spanning a whole text of `len` bytes.
    pub fn whole(data_type: DataType, len: usize) -> Self {
        Self {
            data_type,
            offset: 0,
            len,
        }
    }

    /// The selected slice of `text`.
    pub fn slice<'a>(&self, text: &'a str) -> &'a str {
        text.get(self.offset..self.offset + self.len).unwrap_or("")
    }
}

/// Classify the payload text starting at `offset`.
///
/// Numbers with a decimal point are `Float` when they hold at most seven
/// digits and `Double` otherwise; integers outside the 32-bit signed range
/// and numbers with an exponent are `Double`. Text matching no rule is a
/// `String`.
pub fn classify(text: &str, offset: usize) -> Classification {
    let tail = text.get(offset..).unwrap_or("");
    let start = offset + (tail.len() - tail.trim_start().len());
    let value = tail.trim();
    let span = |data_type| Classification {
        data_type,
        offset: start,
        len: value.len(),
    };

    if value.is_empty() || value == "null" {
        return span(DataType::Null);
    }
    if value == "true" || value == "false" {
        return span(DataType::Boolean);
    }
    for (signature, data_type) in [
        (BLOB_SIGNATURE, DataType::Blob),
        (FILE_SIGNATURE, DataType::File),
    ] {
        if let Some(rest) = value.strip_prefix(signature) {
            return Classification {
                data_type,
                offset: start + signature.len(),
                len: rest.find('"').unwrap_or(rest.len()),
            };
        }
    }
    match value.as_bytes()[0] {
        b'"' => span(DataType::String),
        b'{' => span(DataType::Json),
        b'[' => span(DataType::Array),
        b'-' | b'+' | b'0'..=b'9' => span(classify_number(value)),
        _ => span(DataType::String),
    }
}

fn classify_number(value: &str) -> DataType {
    if !value
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'+' | b'e' | b'E'))
    {
        return DataType::String;
    }
    if value.contains(['e', 'E']) {
        return DataType::Double;
    }
    if value.contains('.') {
        let digits = value.bytes().filter(u8::is_ascii_digit).count();
        return if digits <= 7 {
            DataType::Float
        } else {
            DataType::Double
        };
    }
    match value.parse::<i64>() {
        Ok(n) if i32::try_from(n).is_ok() => DataType::Integer,
        Ok(_) => DataType::Double,
        // Digits only but too long even for i64.
        Err(_) if value.trim_start_matches(['-', '+']).bytes().all(|b| b.is_ascii_digit()) => {
            DataType::Double
        }
        Err(_) => DataType::String,
    }
}

/// A classified value borrowed from response text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TypedValue<'a> {
    text: &'a str,
    classification: Classification,
}

impl<'a> TypedValue<'a> {
    /// Classify `text` from `offset` onwards.
    pub fn new(text: &'a str, offset: usize) -> Self {
        Self {
            text,
            classification: classify(text, offset),
        }
    }

    /// Wrap text whose classification is already known.
    pub fn with_classification(text: &'a str, classification: Classification) -> Self {
        Self {
            text,
            classification,
        }
    }

    /// The decided type.
    pub fn data_type(&self) -> DataType {
        self.classification.data_type
    }

    /// The classification.
    pub fn classification(&self) -> Classification {
        self.classification
    }

    /// The raw value text.
    pub fn raw(&self) -> &'a str {
        self.classification.slice(self.text)
    }

    /// The value as a 32-bit integer; floats are truncated.
    pub fn to_int(&self) -> Option<i32> {
        match self.data_type() {
            DataType::Integer => self.raw().parse().ok(),
            DataType::Float | DataType::Double => self.to_double().map(|v| v as i32),
            DataType::Boolean => self.to_bool().map(i32::from),
            _ => None,
        }
    }

    /// The value as a 64-bit integer.
    pub fn to_i64(&self) -> Option<i64> {
        self.raw()
            .parse()
            .ok()
            .or_else(|| self.to_double().map(|v| v as i64))
    }

    /// The value as a single-precision float.
    pub fn to_float(&self) -> Option<f32> {
        self.to_double().map(|v| v as f32)
    }

    /// The value as a double-precision float.
    pub fn to_double(&self) -> Option<f64> {
        if self.data_type().is_numeric() {
            self.raw().parse().ok()
        } else {
            None
        }
    }

    /// The value as a boolean.
    pub fn to_bool(&self) -> Option<bool> {
        match self.raw() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    /// The value as a string; JSON string escapes are resolved.
    pub fn to_string_value(&self) -> Option<String> {
        match self.data_type() {
            DataType::String => serde_json::from_str(self.raw()).ok(),
            DataType::Null => None,
            _ => Some(self.raw().to_string()),
        }
    }

    /// The value parsed as JSON.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(self.raw()).ok()
    }

    /// Decode a blob or file value.
    pub fn decode_binary(&self) -> Result<Vec<u8>, Base64Error> {
        if !self.data_type().is_binary() {
            return Err(Base64Error::MissingSignature);
        }
        let mut sink = MemorySink::new();
        let mut decoder = Base64StreamDecoder::new();
        decoder.feed(self.raw().as_bytes(), &mut sink)?;
        decoder.finish(&mut sink)?;
        Ok(sink.into_inner())
    }
}
