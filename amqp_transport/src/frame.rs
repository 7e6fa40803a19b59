/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Protocol header and frame envelope.
//!
//! A connection starts with an 8-byte protocol header in each direction:
//!
//! ```text
//! +-----+-----+-----+-----+-------------+-------+-------+----------+
//! | 'A' | 'M' | 'Q' | 'P' | protocol id | major | minor | revision |
//! +-----+-----+-----+-----+-------------+-------+-------+----------+
//! ```
//!
//! After the header, the stream carries frames. Each frame has an 8-byte
//! fixed header followed by an optional extended header and the body:
//!
//! ```text
//! +---------- size: u32 (BE) ----------+- doff -+- type -+- channel: u16 (BE) -+
//! | total frame length, incl. header   |  >= 2  |   0    | logical channel     |
//! +------------------------------------+--------+--------+---------------------+
//! ```
//!
//! `doff` is the offset of the body in 4-byte words. A frame with no body
//! is a heartbeat.

use std::fmt;
use std::io;

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;

/// Protocol tag carried by every header.
pub const PROTOCOL_TAG: &[u8; 4] = b"AMQP";
/// Protocol id for plain AMQP.
pub const PROTOCOL_ID_AMQP: u8 = 0;
/// Highest supported major version.
pub const VERSION_MAJOR: u8 = 1;
/// Highest supported minor version.
pub const VERSION_MINOR: u8 = 0;
/// Highest supported revision.
pub const VERSION_REVISION: u8 = 0;

/// Length of the protocol header.
pub const PROTOCOL_HEADER_LEN: usize = 8;
/// Length of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 8;
/// Frame type of AMQP frames.
pub const FRAME_TYPE_AMQP: u8 = 0;
/// Smallest legal max-frame-size a peer may advertise.
pub const MIN_MAX_FRAME_SIZE: u32 = 512;

/// Errors arising from the header or frame envelope.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid protocol header {0:02x?}")]
    InvalidHeader([u8; PROTOCOL_HEADER_LEN]),
    #[error("frame of {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },
    #[error("malformed frame header: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<FrameError> for io::Error {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(err) => err,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// The 8-byte preamble exchanged before any frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolHeader {
    /// The protocol id (0 for AMQP).
    pub protocol_id: u8,
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Revision.
    pub revision: u8,
}

impl Default for ProtocolHeader {
    fn default() -> Self {
        Self {
            protocol_id: PROTOCOL_ID_AMQP,
            major: VERSION_MAJOR,
            minor: VERSION_MINOR,
            revision: VERSION_REVISION,
        }
    }
}

impl ProtocolHeader {
    /// Encode this header.
    pub fn to_bytes(&self) -> [u8; PROTOCOL_HEADER_LEN] {
        let mut buf = [0u8; PROTOCOL_HEADER_LEN];
        buf[..4].copy_from_slice(PROTOCOL_TAG);
        buf[4] = self.protocol_id;
        buf[5] = self.major;
        buf[6] = self.minor;
        buf[7] = self.revision;
        buf
    }

    /// Decode a header. Only the tag is checked here; version bounds are
    /// checked by [`ProtocolHeader::is_supported`].
    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        let mut raw = [0u8; PROTOCOL_HEADER_LEN];
        if buf.len() != PROTOCOL_HEADER_LEN {
            let n = buf.len().min(PROTOCOL_HEADER_LEN);
            raw[..n].copy_from_slice(&buf[..n]);
            return Err(FrameError::InvalidHeader(raw));
        }
        raw.copy_from_slice(buf);
        if &raw[..4] != PROTOCOL_TAG {
            return Err(FrameError::InvalidHeader(raw));
        }
        Ok(Self {
            protocol_id: raw[4],
            major: raw[5],
            minor: raw[6],
            revision: raw[7],
        })
    }

    /// Whether this side can speak the version described by the header.
    pub fn is_supported(&self) -> bool {
        self.protocol_id == PROTOCOL_ID_AMQP
            && self.major <= VERSION_MAJOR
            && self.minor <= VERSION_MINOR
            && self.revision <= VERSION_REVISION
    }
}

impl fmt::Display for ProtocolHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AMQP.{}.{}.{}.{}",
            self.protocol_id, self.major, self.minor, self.revision
        )
    }
}

/// The header this side sends.
pub fn compose_header() -> [u8; PROTOCOL_HEADER_LEN] {
    ProtocolHeader::default().to_bytes()
}

/// A peer's header is valid iff the tag matches and every version
/// component is within what we support.
pub fn validate_header(buf: &[u8]) -> bool {
    ProtocolHeader::parse(buf).is_ok_and(|header| header.is_supported())
}

/// A decoded frame. A `None` body is a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Logical channel. Channel 0 carries connection control.
    pub channel: u16,
    /// Frame body, if any.
    pub body: Option<Bytes>,
}

impl Frame {
    /// A frame carrying `body` on `channel`.
    pub fn new(channel: u16, body: Bytes) -> Self {
        Self {
            channel,
            body: Some(body),
        }
    }

    /// An empty frame.
    pub fn heartbeat() -> Self {
        Self {
            channel: 0,
            body: None,
        }
    }

    /// Whether this frame is a heartbeat.
    pub fn is_heartbeat(&self) -> bool {
        self.body.as_ref().is_none_or(|body| body.is_empty())
    }

    /// Encode this frame, failing if the result would exceed `max_frame_size`.
    pub fn encode(&self, max_frame_size: usize) -> Result<Bytes, FrameError> {
        let body_len = self.body.as_ref().map_or(0, Bytes::len);
        let size = FRAME_HEADER_LEN + body_len;
        if size > max_frame_size || size > u32::MAX as usize {
            return Err(FrameError::TooLarge {
                size,
                max: max_frame_size,
            });
        }
        let mut buf = BytesMut::with_capacity(size);
        buf.put_u32(size as u32);
        buf.put_u8(2);
        buf.put_u8(FRAME_TYPE_AMQP);
        buf.put_u16(self.channel);
        if let Some(body) = &self.body {
            buf.put_slice(body);
        }
        Ok(buf.freeze())
    }
}

/// The bytes of an empty frame on channel 0.
pub fn heartbeat_frame() -> Bytes {
    // An empty frame is always within any legal max frame size.
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN);
    buf.put_u32(FRAME_HEADER_LEN as u32);
    buf.put_u8(2);
    buf.put_u8(FRAME_TYPE_AMQP);
    buf.put_u16(0);
    buf.freeze()
}

/// A FrameReader reads the protocol header and then frames from an
/// underlying [`AsyncRead`].
pub struct FrameReader<R> {
    reader: R,
    max_frame_size: usize,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a new reader. Frames larger than `max_frame_size` result in
    /// an irrecoverable reader error.
    pub fn new(reader: R, max_frame_size: usize) -> Self {
        Self {
            reader,
            max_frame_size,
            buf: BytesMut::with_capacity(FRAME_HEADER_LEN),
        }
    }

    /// Adjust the frame size limit, e.g. after Open negotiation.
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }

    /// Read exactly `n` buffered bytes, returning `Ok(None)` if the stream
    /// ends before any byte of this unit was read.
    ///
    /// Progress is kept in `self.buf`, so the method is cancellation safe:
    /// dropping the future never loses bytes.
    async fn fill(&mut self, n: usize) -> io::Result<Option<()>> {
        while self.buf.len() < n {
            self.buf.reserve(n - self.buf.len());
            let read = self.reader.read_buf(&mut self.buf).await?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
        Ok(Some(()))
    }

    /// Read the peer's 8-byte protocol header.
    pub async fn read_protocol_header(&mut self) -> io::Result<Option<[u8; PROTOCOL_HEADER_LEN]>> {
        if self.fill(PROTOCOL_HEADER_LEN).await?.is_none() {
            return Ok(None);
        }
        let mut header = [0u8; PROTOCOL_HEADER_LEN];
        self.buf.copy_to_slice(&mut header);
        Ok(Some(header))
    }

    /// Read the next frame. Returns `Ok(None)` on EOF at a frame boundary.
    ///
    /// # Errors
    ///
    /// * `io::ErrorKind::UnexpectedEof` if the stream ends mid-frame.
    /// * `io::ErrorKind::InvalidData` if the frame is larger than the
    ///   limit, smaller than its header, or has a bad data offset. **This
    ///   error is fatal:** the reader must be dropped.
    pub async fn next(&mut self) -> io::Result<Option<Frame>> {
        if self.fill(FRAME_HEADER_LEN).await?.is_none() {
            return Ok(None);
        }
        let mut header = &self.buf[..FRAME_HEADER_LEN];
        let size = header.get_u32() as usize;
        let doff = header.get_u8() as usize;
        let frame_type = header.get_u8();
        let channel = header.get_u16();

        if size > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size,
                max: self.max_frame_size,
            }
            .into());
        }
        if size < FRAME_HEADER_LEN {
            return Err(
                FrameError::Malformed(format!("frame size {size} below header size")).into(),
            );
        }
        if doff < 2 || doff * 4 > size {
            return Err(FrameError::Malformed(format!("data offset {doff} for size {size}")).into());
        }
        if frame_type != FRAME_TYPE_AMQP {
            return Err(
                FrameError::Malformed(format!("unsupported frame type {frame_type}")).into(),
            );
        }

        if self.fill(size).await?.is_none() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let mut frame = self.buf.split_to(size);
        frame.advance(doff * 4);
        let body = frame.freeze();
        Ok(Some(Frame {
            channel,
            body: (!body.is_empty()).then_some(body),
        }))
    }
}
