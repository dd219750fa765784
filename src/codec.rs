//! Encoder and decoder for Language Server Protocol messages.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::io::{Error as IoError, Write};
use std::marker::PhantomData;
use std::str;

use bytes::{BufMut, BytesMut};
use memchr::memmem;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

/// Errors that can occur when processing an LSP frame.
#[derive(Debug)]
pub enum ParseError {
    /// Frame lacks the required `Content-Length` header.
    MissingHeader,
    /// The length value in the `Content-Length` header is invalid.
    InvalidLength,
    /// The header block could not be parsed.
    Httparse(httparse::Error),
    /// The message body is not valid JSON.
    Body(serde_json::Error),
    /// Failed to read from or write to the underlying stream.
    Io(IoError),
}

impl Display for ParseError {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match self {
            ParseError::MissingHeader => f.write_str("missing required `Content-Length` header"),
            ParseError::InvalidLength => f.write_str("unable to parse content length"),
            ParseError::Httparse(e) => write!(f, "failed to parse headers: {e}"),
            ParseError::Body(e) => write!(f, "unable to parse JSON body: {e}"),
            ParseError::Io(e) => write!(f, "failed to process frame: {e}"),
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ParseError::Httparse(e) => Some(e),
            ParseError::Body(e) => Some(e),
            ParseError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for ParseError {
    fn from(error: IoError) -> Self {
        ParseError::Io(error)
    }
}

impl From<httparse::Error> for ParseError {
    fn from(error: httparse::Error) -> Self {
        ParseError::Httparse(error)
    }
}

/// Encodes and decodes Language Server Protocol messages.
///
/// A message consists of an ASCII header block (each header terminated by `\r\n`, the block
/// terminated by an empty line) followed by a UTF-8 JSON body of exactly `Content-Length` bytes.
/// Only the `Content-Length` header is required on read; any other headers are ignored. Encoded
/// frames always carry the minimal `Content-Length: {}\r\n\r\n{}` form.
#[derive(Clone, Debug)]
pub struct LanguageServerCodec<T> {
    content_len: Option<usize>,
    _marker: PhantomData<T>,
}

impl<T> Default for LanguageServerCodec<T> {
    fn default() -> Self {
        LanguageServerCodec {
            content_len: None,
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize> Encoder<T> for LanguageServerCodec<T> {
    type Error = ParseError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_string(&item).map_err(ParseError::Body)?;

        // Enough for the header constants, the length digits, and the body itself.
        dst.reserve(body.len() + number_of_digits(body.len()) + 20);
        let mut writer = dst.writer();
        write!(writer, "Content-Length: {}\r\n\r\n{}", body.len(), body)?;
        writer.flush()?;

        Ok(())
    }
}

#[inline]
fn number_of_digits(mut n: usize) -> usize {
    let mut num_digits = 1;

    while n >= 10 {
        n /= 10;
        num_digits += 1;
    }

    num_digits
}

impl<T: DeserializeOwned> Decoder for LanguageServerCodec<T> {
    type Item = T;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.content_len.is_none() {
            let header_end = match memmem::find(src, b"\r\n\r\n") {
                Some(idx) => idx + 4,
                None => return Ok(None),
            };

            let header_block = src.split_to(header_end);
            let content_len = parse_content_length(&header_block)?;
            src.reserve(content_len.saturating_sub(src.len()));
            self.content_len = Some(content_len);
        }

        // Invariant: `content_len` is always set at this point.
        let content_len = self.content_len.unwrap_or_default();
        if src.len() < content_len {
            return Ok(None);
        }

        let body = src.split_to(content_len);
        self.content_len = None;

        let message = serde_json::from_slice(&body).map_err(ParseError::Body)?;
        Ok(Some(message))
    }
}

fn parse_content_length(header_block: &[u8]) -> Result<usize, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; 8];
    let parsed = match httparse::parse_headers(header_block, &mut headers)? {
        httparse::Status::Complete((_, parsed)) => parsed,
        httparse::Status::Partial => return Err(ParseError::MissingHeader),
    };

    for header in parsed {
        if header.name.eq_ignore_ascii_case("content-length") {
            return str::from_utf8(header.value)
                .ok()
                .and_then(|s| s.trim().parse::<usize>().ok())
                .ok_or(ParseError::InvalidLength);
        }
    }

    Err(ParseError::MissingHeader)
}
