use bytes::{Buf, Bytes, BytesMut};

use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024; // 512 MB default

// Smallest possible encoded element ("+\r\n").
const MIN_ELEMENT_SIZE: usize = 3;

// Deeper arrays are rejected; frame trees are dropped and compared recursively.
const MAX_NESTING_DEPTH: usize = 1024;

/// Parses exactly one frame from the front of `buf`.
///
/// Returns `Ok(Some((frame, consumed)))` when a complete frame is available,
/// `Ok(None)` when more bytes are needed, and an error for malformed input.
/// Nothing is consumed from `buf` in the incomplete case, so the caller can
/// retry with the same prefix once more data arrives.
///
/// # Example
///
/// ```
/// use sentimux::proto::codec::parse_frame;
/// use sentimux::proto::frame::Frame;
///
/// assert_eq!(parse_frame(b":7\r\n:8\r\n").unwrap(), Some((Frame::Integer(7), 4)));
/// assert_eq!(parse_frame(b"$3\r\nfo").unwrap(), None);
/// ```
pub fn parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
    let mut scan = Scan::default();
    match scan.advance(buf, DEFAULT_MAX_FRAME_SIZE)? {
        Some(_) => build(buf, DEFAULT_MAX_FRAME_SIZE).map(Some),
        None => Ok(None),
    }
}

/// The element header found at some position of the buffer.
enum Header {
    Simple(usize, usize),
    Error(usize, usize),
    Integer(i64),
    Bulk(Option<(usize, usize)>),
    Array(Option<usize>),
}

impl Header {
    /// Builds the frame for a header that does not open a non-empty array.
    fn into_leaf(self, buf: &[u8]) -> Frame {
        match self {
            Header::Simple(start, end) => Frame::SimpleString(buf[start..end].to_vec()),
            Header::Error(start, end) => Frame::Error(buf[start..end].to_vec()),
            Header::Integer(n) => Frame::Integer(n),
            Header::Bulk(None) => Frame::BulkString(None),
            Header::Bulk(Some((start, end))) => {
                Frame::BulkString(Some(Bytes::copy_from_slice(&buf[start..end])))
            }
            Header::Array(None) => Frame::Null,
            Header::Array(Some(_)) => Frame::Array(Vec::new()),
        }
    }
}

/// Reads the element header at `pos`, returning it with the position of the
/// next element. Bulk payloads must be fully buffered to count as complete.
fn parse_header(buf: &[u8], pos: usize, max: usize) -> Result<Option<(Header, usize)>> {
    let Some(&tag) = buf.get(pos) else {
        return Ok(None);
    };
    let Some(line_end) = find_crlf(buf, pos + 1) else {
        return Ok(None);
    };
    let line = &buf[pos + 1..line_end];
    let next = line_end + 2;

    let header = match tag {
        b'+' => Header::Simple(pos + 1, line_end),
        b'-' => Header::Error(pos + 1, line_end),
        b':' => Header::Integer(parse_int(line)?),
        b'$' => {
            let len = parse_int(line)?;
            if len == -1 {
                return Ok(Some((Header::Bulk(None), next)));
            }
            let len = checked_len(len, max, 1, "bulk string")?;
            if buf.len() < next + len + 2 {
                return Ok(None);
            }
            if &buf[next + len..next + len + 2] != b"\r\n" {
                return Err(Error::protocol("bulk string not terminated by CRLF"));
            }
            return Ok(Some((Header::Bulk(Some((next, next + len))), next + len + 2)));
        }
        b'*' => {
            let len = parse_int(line)?;
            if len == -1 {
                Header::Array(None)
            } else {
                Header::Array(Some(checked_len(len, max, MIN_ELEMENT_SIZE, "array")?))
            }
        }
        other => {
            return Err(Error::protocol(format!(
                "unknown frame type byte: 0x{:02x}",
                other
            )))
        }
    };
    Ok(Some((header, next)))
}

/// Progress of the completeness check over a partially received frame.
///
/// Holds the position of the next unread header and, for every array still
/// open, how many elements it is missing. Appending bytes never invalidates
/// it, so a decoder picks up where the previous attempt stopped.
#[derive(Debug, Default)]
struct Scan {
    pos: usize,
    open: Vec<usize>,
}

impl Scan {
    /// Walks headers until the frame at the front of `buf` is complete,
    /// returning its encoded length, or `None` if more bytes are needed.
    fn advance(&mut self, buf: &[u8], max: usize) -> Result<Option<usize>> {
        loop {
            let Some((header, next)) = parse_header(buf, self.pos, max)? else {
                return Ok(None);
            };
            self.pos = next;
            if let Header::Array(Some(len)) = header {
                if len > 0 {
                    if self.open.len() >= MAX_NESTING_DEPTH {
                        return Err(Error::protocol(format!(
                            "arrays nested deeper than {} levels",
                            MAX_NESTING_DEPTH
                        )));
                    }
                    self.open.push(len);
                    continue;
                }
            }
            loop {
                match self.open.last_mut() {
                    None => return Ok(Some(self.pos)),
                    Some(missing) => {
                        *missing -= 1;
                        if *missing > 0 {
                            break;
                        }
                        self.open.pop();
                    }
                }
            }
        }
    }
}

/// Builds the frame at the front of `buf`, which must have passed
/// [`Scan::advance`].
fn build(buf: &[u8], max: usize) -> Result<(Frame, usize)> {
    let mut pos = 0;
    let mut open: Vec<(Vec<Frame>, usize)> = Vec::new();
    loop {
        let (header, next) = parse_header(buf, pos, max)?
            .ok_or_else(|| Error::protocol("frame ended early"))?;
        pos = next;
        let mut frame = match header {
            Header::Array(Some(len)) if len > 0 => {
                open.push((Vec::with_capacity(len.min(1024)), len));
                continue;
            }
            leaf => leaf.into_leaf(buf),
        };
        loop {
            let Some((items, len)) = open.last_mut() else {
                return Ok((frame, pos));
            };
            items.push(frame);
            if items.len() < *len {
                break;
            }
            match open.pop() {
                Some((items, _)) => frame = Frame::Array(items),
                None => return Err(Error::protocol("unbalanced array")),
            }
        }
    }
}

fn parse_int(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            Error::protocol(format!(
                "invalid integer: {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}

fn checked_len(len: i64, max: usize, unit: usize, what: &str) -> Result<usize> {
    if len < 0 {
        return Err(Error::protocol(format!("negative {} length: {}", what, len)));
    }
    let len = usize::try_from(len)
        .map_err(|_| Error::protocol(format!("{} length out of range", what)))?;
    if len.saturating_mul(unit) > max {
        return Err(Error::protocol(format!(
            "{} length exceeds maximum frame size",
            what
        )));
    }
    Ok(len)
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)
}

/// A streaming RESP decoder that converts bytes to [`Frame`] values.
///
/// Call [`append`](Decoder::append) when data arrives from the network, then
/// [`decode`](Decoder::decode) until it returns `Ok(None)`. Partial input is
/// kept in the buffer untouched until the rest of the frame shows up.
///
/// # Example
///
/// ```
/// use sentimux::proto::codec::Decoder;
/// use sentimux::proto::frame::Frame;
///
/// let mut decoder = Decoder::new();
/// decoder.append(b"+OK\r\n");
/// let frame = decoder.decode().unwrap().unwrap();
/// assert_eq!(frame, Frame::SimpleString(b"OK".to_vec()));
/// ```
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    max_frame_size: usize,
    scan: Scan,
}

impl Decoder {
    /// Creates a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates a new decoder with a custom maximum frame size.
    ///
    /// # Arguments
    ///
    /// * `max_frame_size` - Maximum size in bytes for a single frame
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
            scan: Scan::default(),
        }
    }

    /// Appends raw bytes to the internal buffer.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Attempts to decode one frame from the buffer.
    ///
    /// Returns `Ok(Some(Frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the data is malformed or a pending frame
    /// grows past the maximum frame size.
    pub fn decode(&mut self) -> Result<Option<Frame>> {
        match self.scan.advance(&self.buf, self.max_frame_size)? {
            Some(len) => {
                let (frame, consumed) = build(&self.buf[..len], self.max_frame_size)?;
                self.buf.advance(consumed);
                self.scan = Scan::default();
                Ok(Some(frame))
            }
            None if self.buf.len() > self.max_frame_size => Err(Error::protocol(
                "buffer size exceeded maximum frame size",
            )),
            None => Ok(None),
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
