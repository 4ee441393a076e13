//! Incremental record parsing for uploads.
//!
//! Chunks arrive as the client sends them. Gzip input is recognised by its
//! magic bytes and inflated as it streams; complete lines (delimited and
//! single-line formats) or complete JSON documents are turned into field maps
//! while partial input stays buffered for the next chunk.

use std::collections::HashMap;
use std::io::Write;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use flate2::write::GzDecoder;
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::job::types::{DataDescription, DataFormat};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Field the single-line format stores each line under.
pub const RAW_FIELD: &str = "raw";

/// One record as read from the input, before transforms and time parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedRecord {
    Fields(HashMap<String, String>),
    /// Input that could not be split into fields.
    Malformed,
}

enum Decoder {
    Undetected(Vec<u8>),
    Plain,
    Gzip(GzDecoder<Vec<u8>>),
}

/// Quote state of a delimited line. A quote opens a quoted field only at the
/// start of a field, and `""` inside one is an escaped quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quoting {
    FieldStart,
    Unquoted,
    Quoted,
    /// A quote seen inside a quoted field: either its end or half of `""`.
    QuotedQuote,
}

impl Quoting {
    fn advance(self, byte: u8, quote: u8, delimiter: u8) -> Self {
        match self {
            Quoting::Quoted if byte == quote => Quoting::QuotedQuote,
            Quoting::Quoted => Quoting::Quoted,
            Quoting::QuotedQuote if byte == quote => Quoting::Quoted,
            Quoting::FieldStart if byte == quote => Quoting::Quoted,
            _ if byte == delimiter || byte == b'\n' => Quoting::FieldStart,
            _ => Quoting::Unquoted,
        }
    }
}

pub struct RecordReader {
    format: DataFormat,
    delimiter: u8,
    quote: u8,
    decoder: Decoder,
    pending: Vec<u8>,
    /// Bytes of `pending` already scanned for a line end.
    scanned: usize,
    quoting: Quoting,
    header: Option<Vec<String>>,
}

impl RecordReader {
    pub fn new(data: &DataDescription) -> Self {
        Self {
            format: data.format,
            delimiter: ascii_byte(data.field_delimiter, b'\t'),
            quote: ascii_byte(data.quote_character, b'"'),
            decoder: Decoder::Undetected(Vec::new()),
            pending: Vec::new(),
            scanned: 0,
            quoting: Quoting::FieldStart,
            header: None,
        }
    }

    /// Feeds one chunk and returns the records it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<ParsedRecord>> {
        let decoded = self.decode(chunk)?;
        self.pending.extend_from_slice(&decoded);
        self.drain(false)
    }

    /// Flushes buffered input once the stream has ended.
    pub fn finish(&mut self) -> Result<Vec<ParsedRecord>> {
        let tail = match std::mem::replace(&mut self.decoder, Decoder::Plain) {
            Decoder::Undetected(buffered) => buffered,
            Decoder::Plain => Vec::new(),
            Decoder::Gzip(decoder) => decoder
                .finish()
                .map_err(|err| EngineError::data_parse(format!("invalid gzip stream: {err}")))?,
        };
        self.pending.extend_from_slice(&tail);
        self.drain(true)
    }

    fn decode(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        if let Decoder::Undetected(buffered) = &mut self.decoder {
            buffered.extend_from_slice(chunk);
            if buffered.len() < GZIP_MAGIC.len() {
                return Ok(Vec::new());
            }
            let buffered = std::mem::take(buffered);
            if buffered.starts_with(&GZIP_MAGIC) {
                tracing::debug!("gzip input detected");
                self.decoder = Decoder::Gzip(GzDecoder::new(Vec::new()));
            } else {
                self.decoder = Decoder::Plain;
            }
            return self.decode_detected(&buffered);
        }
        self.decode_detected(chunk)
    }

    fn decode_detected(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        match &mut self.decoder {
            Decoder::Gzip(decoder) => {
                decoder
                    .write_all(chunk)
                    .map_err(|err| EngineError::data_parse(format!("invalid gzip stream: {err}")))?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            _ => Ok(chunk.to_vec()),
        }
    }

    fn drain(&mut self, at_end: bool) -> Result<Vec<ParsedRecord>> {
        match self.format {
            DataFormat::Json => Ok(self.drain_json(at_end)),
            DataFormat::Delimited | DataFormat::SingleLine => {
                let mut records = Vec::new();
                while let Some(line) = self.next_line(at_end) {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Some(record) = self.parse_line(&line)? {
                        records.push(record);
                    }
                }
                Ok(records)
            }
        }
    }

    /// Next complete line. Delimited lines with an open quote continue onto
    /// the following line. The scan resumes where the previous call stopped.
    fn next_line(&mut self, at_end: bool) -> Option<String> {
        while self.scanned < self.pending.len() {
            let byte = self.pending[self.scanned];
            self.scanned += 1;
            if self.format == DataFormat::Delimited {
                self.quoting = self.quoting.advance(byte, self.quote, self.delimiter);
                if self.quoting == Quoting::Quoted {
                    continue;
                }
            }
            if byte == b'\n' {
                let line: Vec<u8> = self.pending.drain(..self.scanned).collect();
                self.reset_scan();
                return Some(decode_line(&line[..line.len() - 1]));
            }
        }
        if at_end && !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.reset_scan();
            return Some(decode_line(&line));
        }
        None
    }

    fn reset_scan(&mut self) {
        self.scanned = 0;
        self.quoting = Quoting::FieldStart;
    }

    fn parse_line(&mut self, line: &str) -> Result<Option<ParsedRecord>> {
        if self.format == DataFormat::SingleLine {
            let fields = HashMap::from([(RAW_FIELD.to_string(), line.to_string())]);
            return Ok(Some(ParsedRecord::Fields(fields)));
        }
        let values = match self.split_delimited(line) {
            Ok(values) => values,
            Err(err) => {
                tracing::debug!(error = %err, "skipping malformed delimited line");
                return Ok(Some(ParsedRecord::Malformed));
            }
        };
        if self.header.is_none() {
            if values.iter().all(|v| v.trim().is_empty()) {
                return Err(EngineError::data_parse("delimited input has an empty header"));
            }
            self.header = Some(values.into_iter().map(|v| v.trim().to_string()).collect());
            return Ok(None);
        }
        let header = self.header.as_deref().unwrap_or_default();
        let fields = header
            .iter()
            .zip(values)
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, value)| (name.clone(), value))
            .collect();
        Ok(Some(ParsedRecord::Fields(fields)))
    }

    fn split_delimited(&self, line: &str) -> std::result::Result<Vec<String>, csv::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(self.delimiter)
            .quote(self.quote)
            .from_reader(line.as_bytes());
        let mut record = csv::StringRecord::new();
        if reader.read_record(&mut record)? {
            Ok(record.iter().map(str::to_string).collect())
        } else {
            Ok(Vec::new())
        }
    }

    fn drain_json(&mut self, at_end: bool) -> Vec<ParsedRecord> {
        let mut records = Vec::new();
        let mut consumed = 0;
        loop {
            let mut stream =
                serde_json::Deserializer::from_slice(&self.pending[consumed..]).into_iter::<Value>();
            match stream.next() {
                None => {
                    consumed = self.pending.len();
                    break;
                }
                Some(Ok(value)) => {
                    consumed += stream.byte_offset();
                    records.push(flatten_document(value));
                }
                Some(Err(err)) if err.is_eof() && !at_end => break,
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "skipping malformed JSON document");
                    records.push(ParsedRecord::Malformed);
                    let rest = &self.pending[consumed..];
                    let start = rest
                        .iter()
                        .position(|b| !b.is_ascii_whitespace())
                        .unwrap_or(rest.len());
                    consumed += rest[start..]
                        .iter()
                        .position(|b| *b == b'\n')
                        .map_or(rest.len(), |p| start + p + 1);
                    if consumed >= self.pending.len() {
                        break;
                    }
                }
            }
        }
        self.pending.drain(..consumed.min(self.pending.len()));
        records
    }
}

fn ascii_byte(c: char, fallback: u8) -> u8 {
    if c.is_ascii() {
        c as u8
    } else {
        fallback
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

fn flatten_document(value: Value) -> ParsedRecord {
    match value {
        Value::Object(_) => {
            let mut fields = HashMap::new();
            flatten_into(String::new(), value, &mut fields);
            ParsedRecord::Fields(fields)
        }
        _ => ParsedRecord::Malformed,
    }
}

/// Nested objects become dotted keys; arrays of scalars are comma-joined.
fn flatten_into(prefix: String, value: Value, fields: &mut HashMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                let name = if prefix.is_empty() {
                    key
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(name, nested, fields);
            }
        }
        Value::Null => {}
        Value::String(s) => {
            fields.insert(prefix, s);
        }
        Value::Array(items) => {
            let joined: Vec<String> = items.into_iter().filter_map(scalar_text).collect();
            if !joined.is_empty() {
                fields.insert(prefix, joined.join(","));
            }
        }
        other => {
            if let Some(text) = scalar_text(other) {
                fields.insert(prefix, text);
            }
        }
    }
}

fn scalar_text(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parses a record time into epoch seconds.
#[derive(Debug, Clone)]
pub struct TimeParser {
    format: String,
}

impl TimeParser {
    pub fn new(format: &str) -> Self {
        Self {
            format: format.to_string(),
        }
    }

    pub fn parse(&self, text: &str) -> Option<i64> {
        let text = text.trim();
        match self.format.as_str() {
            "epoch" => text
                .parse::<i64>()
                .ok()
                .or_else(|| text.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v.floor() as i64)),
            "epoch_ms" => text
                .parse::<i64>()
                .ok()
                .map(|ms| ms.div_euclid(1000))
                .or_else(|| {
                    text.parse::<f64>()
                        .ok()
                        .filter(|v| v.is_finite())
                        .map(|v| (v / 1000.0).floor() as i64)
                }),
            pattern => DateTime::parse_from_str(text, pattern)
                .map(|t| t.timestamp())
                .or_else(|_| NaiveDateTime::parse_from_str(text, pattern).map(|t| t.and_utc().timestamp()))
                .or_else(|_| {
                    NaiveDate::parse_from_str(text, pattern)
                        .map(|d| d.and_hms_opt(0, 0, 0).map_or(0, |t| t.and_utc().timestamp()))
                })
                .ok(),
        }
    }
}
