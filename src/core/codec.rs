//! # Frame Codec
//!
//! Converts [`Data`] values to and from frames.
//!
//! ## Wire Format
//! ```text
//! [Tag(1)] [Length(4, big-endian)] [Payload(Length)]
//! ```
//!
//! | Tag | Kind     | Payload                                   |
//! |-----|----------|-------------------------------------------|
//! | 1   | Int      | 4-byte big-endian two's complement        |
//! | 2   | Float    | 4-byte big-endian IEEE-754 bit pattern    |
//! | 3   | Text     | `Length` UTF-8 bytes, no terminator       |
//! | 4   | Document | `Length` bytes of compact JSON text       |
//!
//! Two entry points share the same validation:
//! - [`FrameCodec`] implements `tokio_util` [`Decoder`]/[`Encoder`] over
//!   `BytesMut`; it drives datagrams and outbound buffers.
//! - [`recv_any`] blocks on any [`Read`] until one whole frame, an orderly
//!   close, or an error is observed, looping over short reads.

use std::io::{self, Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use crate::core::value::{Data, Tag};
use crate::error::{is_disconnect_kind, NetworkError, Result};

/// Size of the tag + length header.
pub const HEADER_LEN: usize = 5;

/// Default maximum payload accepted or produced (16 MB).
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Outcome of a blocking receive.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// One complete frame was read and decoded.
    Frame(Data),
    /// The remote end closed the connection.
    Closed,
}

/// Outcome of filling a buffer from a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Complete,
    /// Zero-length read before the buffer was full; carries bytes already read.
    Closed(usize),
}

/// Frame encoder/decoder with a payload ceiling.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Encode one value into a fresh buffer.
    pub fn to_bytes(&self, data: &Data) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        encode_into(data, &mut buf, self.max_payload)?;
        Ok(buf.freeze())
    }

    /// Decode exactly one frame from `bytes`.
    pub fn from_bytes(&self, bytes: &[u8]) -> Result<Data> {
        let mut buf = BytesMut::from(bytes);
        let mut codec = *self;
        match codec.decode(&mut buf)? {
            Some(data) if buf.is_empty() => Ok(data),
            Some(_) | None => Err(NetworkError::TruncatedDatagram(buf.len())),
        }
    }

    /// Decode every frame in one datagram. A trailing partial frame is an error.
    pub fn decode_datagram(&self, datagram: &[u8]) -> Result<Vec<Data>> {
        let mut buf = BytesMut::from(datagram);
        let mut codec = *self;
        let mut frames = Vec::with_capacity(1);
        while !buf.is_empty() {
            match codec.decode(&mut buf)? {
                Some(data) => frames.push(data),
                None => return Err(NetworkError::TruncatedDatagram(buf.len())),
            }
        }
        Ok(frames)
    }
}

impl Decoder for FrameCodec {
    type Item = Data;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Data>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let tag = Tag::from_wire(src[0])?;
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        check_len(tag, len, self.max_payload)?;

        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len);
        decode_payload(tag, &payload).map(Some)
    }
}

impl Encoder<Data> for FrameCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Data, dst: &mut BytesMut) -> Result<()> {
        encode_into(&item, dst, self.max_payload)
    }
}

impl Encoder<&Data> for FrameCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: &Data, dst: &mut BytesMut) -> Result<()> {
        encode_into(item, dst, self.max_payload)
    }
}

fn check_len(tag: Tag, len: usize, max_payload: usize) -> Result<()> {
    match tag.fixed_len() {
        Some(expected) if len != expected => Err(NetworkError::LengthMismatch {
            tag: tag.as_u8(),
            expected,
            actual: len,
        }),
        Some(_) => Ok(()),
        None if len > max_payload => Err(NetworkError::OversizedFrame(len)),
        None => Ok(()),
    }
}

fn put_header(dst: &mut BytesMut, tag: Tag, len: usize, max_payload: usize) -> Result<()> {
    if len > max_payload || len > u32::MAX as usize {
        return Err(NetworkError::OversizedFrame(len));
    }
    dst.reserve(HEADER_LEN + len);
    dst.put_u8(tag.as_u8());
    dst.put_u32(len as u32);
    Ok(())
}

fn encode_into(data: &Data, dst: &mut BytesMut, max_payload: usize) -> Result<()> {
    match data {
        Data::Int(v) => {
            put_header(dst, Tag::Int, 4, max_payload)?;
            dst.put_i32(*v);
        }
        Data::Float(v) => {
            put_header(dst, Tag::Float, 4, max_payload)?;
            dst.put_u32(v.to_bits());
        }
        Data::Text(s) => {
            put_header(dst, Tag::Text, s.len(), max_payload)?;
            dst.put_slice(s.as_bytes());
        }
        Data::Document(doc) => {
            let text =
                serde_json::to_vec(doc).map_err(|e| NetworkError::Document(e.to_string()))?;
            put_header(dst, Tag::Document, text.len(), max_payload)?;
            dst.put_slice(&text);
        }
        Data::Connected | Data::Disconnected => {
            return Err(NetworkError::NotTransmittable(data.tag().as_u8()));
        }
    }
    Ok(())
}

fn decode_payload(tag: Tag, payload: &[u8]) -> Result<Data> {
    match tag {
        Tag::Int => Ok(Data::Int(i32::from_be_bytes(fixed4(tag, payload)?))),
        Tag::Float => {
            let bits = u32::from_be_bytes(fixed4(tag, payload)?);
            Ok(Data::Float(f32::from_bits(bits)))
        }
        Tag::Text => std::str::from_utf8(payload)
            .map(|s| Data::Text(s.to_owned()))
            .map_err(|_| NetworkError::InvalidUtf8),
        Tag::Document => serde_json::from_slice(payload)
            .map(Data::Document)
            .map_err(|e| NetworkError::Document(e.to_string())),
        Tag::Connected | Tag::Disconnected => Err(NetworkError::NotTransmittable(tag.as_u8())),
    }
}

fn fixed4(tag: Tag, payload: &[u8]) -> Result<[u8; 4]> {
    payload
        .try_into()
        .map_err(|_| NetworkError::LengthMismatch {
            tag: tag.as_u8(),
            expected: 4,
            actual: payload.len(),
        })
}

/// Fill `buf` completely, looping over short reads.
///
/// Connection resets count as a close, matching an orderly zero-length read.
pub fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<ReadStatus> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(ReadStatus::Closed(filled)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_disconnect_kind(e.kind()) => return Ok(ReadStatus::Closed(filled)),
            Err(e) => return Err(NetworkError::Receive(e)),
        }
    }
    Ok(ReadStatus::Complete)
}

/// Block until one tagged value is read from `reader`.
pub fn recv_any<R: Read + ?Sized>(reader: &mut R, max_payload: usize) -> Result<Received> {
    let mut header = [0u8; HEADER_LEN];
    if let ReadStatus::Closed(partial) = read_full(reader, &mut header)? {
        if partial > 0 {
            debug!(bytes = partial, "Connection closed inside frame header");
        }
        return Ok(Received::Closed);
    }

    let tag = Tag::from_wire(header[0])?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    check_len(tag, len, max_payload)?;

    let mut payload = Vec::new();
    payload
        .try_reserve_exact(len)
        .map_err(|_| NetworkError::Allocation(len))?;
    payload.resize(len, 0);

    if let ReadStatus::Closed(partial) = read_full(reader, &mut payload)? {
        debug!(
            tag = tag.as_u8(),
            expected = len,
            received = partial,
            "Connection closed inside frame payload"
        );
        return Ok(Received::Closed);
    }

    trace!(tag = tag.as_u8(), len, "Frame received");
    decode_payload(tag, &payload).map(Received::Frame)
}

/// Encode and write one value. Returns the number of bytes written.
pub fn write_data<W: Write + ?Sized>(writer: &mut W, data: &Data, max_payload: usize) -> Result<usize> {
    let mut buf = BytesMut::new();
    encode_into(data, &mut buf, max_payload)?;
    writer
        .write_all(&buf)
        .and_then(|()| writer.flush())
        .map_err(|e| NetworkError::Send(e.to_string()))?;
    trace!(tag = data.tag().as_u8(), len = buf.len(), "Frame written");
    Ok(buf.len())
}

pub fn write_int<W: Write + ?Sized>(writer: &mut W, value: i32) -> Result<usize> {
    write_data(writer, &Data::Int(value), DEFAULT_MAX_PAYLOAD)
}

pub fn write_float<W: Write + ?Sized>(writer: &mut W, value: f32) -> Result<usize> {
    write_data(writer, &Data::Float(value), DEFAULT_MAX_PAYLOAD)
}

pub fn write_text<W: Write + ?Sized>(writer: &mut W, value: &str) -> Result<usize> {
    write_data(writer, &Data::Text(value.to_owned()), DEFAULT_MAX_PAYLOAD)
}

pub fn write_document<W: Write + ?Sized>(writer: &mut W, value: &serde_json::Value) -> Result<usize> {
    write_data(writer, &Data::Document(value.clone()), DEFAULT_MAX_PAYLOAD)
}
