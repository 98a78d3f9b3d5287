//! Length-prefixed frame codec.
//!
//! ```text
//! byte 0-2 : total frame length, big-endian, header included
//! byte 3   : flag byte (application-defined)
//! byte 4.. : payload, total_length - 4 bytes
//! ```
//!
//! A frame whose declared length is below the header size or above the
//! configured maximum is a protocol violation and ends the connection.
//! There is no checksum at this layer.

use crate::runtime::buffer::ByteBuffer;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the frame header: 3 length bytes plus 1 flag byte.
pub const HEADER_SIZE: usize = 4;

/// Largest total frame length accepted on the wire (128 KiB).
pub const MAX_FRAME_SIZE: usize = 128 * 1024;

/// Largest value the 3-byte length field can carry.
const LENGTH_FIELD_MAX: usize = 0x00ff_ffff;

/// Frame validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Declared length exceeds the maximum frame size.
    TooLarge { length: usize, max: usize },
    /// Declared length is smaller than the header itself.
    TooSmall { length: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::TooLarge { length, max } => {
                write!(f, "frame length {length} exceeds maximum {max}")
            }
            FrameError::TooSmall { length } => {
                write!(f, "frame length {length} is below header size {HEADER_SIZE}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Read the declared total length from the first three header bytes.
///
/// # Panics
/// Panics if `header` is shorter than three bytes.
pub fn declared_length(header: &[u8]) -> usize {
    (usize::from(header[0]) << 16) | (usize::from(header[1]) << 8) | usize::from(header[2])
}

/// Check a declared total length against the frame bounds.
pub fn check_length(length: usize, max: usize) -> Result<(), FrameError> {
    if length > max {
        Err(FrameError::TooLarge { length, max })
    } else if length < HEADER_SIZE {
        Err(FrameError::TooSmall { length })
    } else {
        Ok(())
    }
}

/// Encode `payload` into a frame with the given flag.
pub fn encode(flag: u8, payload: &[u8], max: usize) -> Result<Bytes, FrameError> {
    let length = HEADER_SIZE + payload.len();
    check_length(length, max.min(LENGTH_FIELD_MAX))?;

    let mut out = BytesMut::with_capacity(length);
    out.put_uint(length as u64, 3);
    out.put_u8(flag);
    out.put_slice(payload);
    Ok(out.freeze())
}

/// Borrowed view of one complete frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    bytes: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Wrap the bytes of a complete frame, validating the header.
    ///
    /// `bytes` must hold exactly the declared length.
    pub fn new(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE || declared_length(bytes) != bytes.len() {
            return None;
        }
        Some(Self { bytes })
    }

    /// Total frame length, header included.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false: a frame carries at least its header.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Application flag byte.
    pub fn flag(&self) -> u8 {
        self.bytes[3]
    }

    /// Payload bytes following the header.
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[HEADER_SIZE..]
    }

    /// Whole frame, header included.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

/// Read from `reader` into `buf` until at least `need` new bytes arrived.
///
/// Grows the buffer as needed and advances its write cursor by however many
/// bytes were actually read. EOF before `need` bytes is `UnexpectedEof`.
pub async fn read_at_least<R>(reader: &mut R, buf: &mut ByteBuffer, need: usize) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    buf.write_grow(need);
    let mut total = 0;

    while total < need {
        let n = reader.read(buf.write_buf()).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("connection closed after {total} of {need} bytes"),
            ));
        }
        buf.write_flip(n);
        total += n;
    }

    Ok(total)
}

/// Outcome of looking for a frame at the front of a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Decode {
    /// A complete frame of this total length is buffered.
    Complete(usize),
    /// More bytes are needed before the frame is complete.
    NeedData(usize),
}

/// Inspect the unread bytes of `buf` for a frame.
pub fn decode(buf: &[u8], max: usize) -> Result<Decode, FrameError> {
    if buf.len() < HEADER_SIZE {
        return Ok(Decode::NeedData(HEADER_SIZE - buf.len()));
    }

    let length = declared_length(buf);
    check_length(length, max)?;

    if buf.len() < length {
        Ok(Decode::NeedData(length - buf.len()))
    } else {
        Ok(Decode::Complete(length))
    }
}
