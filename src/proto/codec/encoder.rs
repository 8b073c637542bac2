use bytes::{BufMut, Bytes, BytesMut};

use crate::proto::frame::Frame;

/// A RESP encoder that converts [`Frame`] values and command arguments to bytes.
///
/// The encoder accumulates data in an internal buffer so several commands can
/// be written with a single socket write.
///
/// # Example
///
/// ```
/// use sentimux::proto::codec::Encoder;
/// use bytes::Bytes;
///
/// let mut encoder = Encoder::new();
/// encoder.encode_args(&[Bytes::from("GET"), Bytes::from("foo")]);
/// assert_eq!(&encoder.take()[..], b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
/// ```
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    /// Creates a new encoder with an empty buffer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Encodes a frame into the internal buffer.
    pub fn encode(&mut self, frame: &Frame) {
        match frame {
            Frame::SimpleString(s) => self.put_line(b'+', s),
            Frame::Error(e) => self.put_line(b'-', e),
            Frame::Integer(n) => self.put_line(b':', n.to_string().as_bytes()),
            Frame::BulkString(Some(data)) => self.put_bulk(data),
            Frame::BulkString(None) => self.buf.extend_from_slice(b"$-1\r\n"),
            Frame::Array(items) => {
                self.put_line(b'*', items.len().to_string().as_bytes());
                for item in items {
                    self.encode(item);
                }
            }
            Frame::Null => self.buf.extend_from_slice(b"*-1\r\n"),
        }
    }

    /// Encodes a command, given as its binary-safe arguments, as a
    /// multi-bulk array of bulk strings.
    pub fn encode_args(&mut self, args: &[Bytes]) {
        self.put_line(b'*', args.len().to_string().as_bytes());
        for arg in args {
            self.put_bulk(arg);
        }
    }

    /// Takes the encoded data from the buffer, leaving it empty.
    pub fn take(&mut self) -> BytesMut {
        self.buf.split()
    }

    fn put_line(&mut self, tag: u8, body: &[u8]) {
        self.buf.reserve(body.len() + 3);
        self.buf.put_u8(tag);
        self.buf.extend_from_slice(body);
        self.buf.extend_from_slice(b"\r\n");
    }

    fn put_bulk(&mut self, data: &[u8]) {
        self.put_line(b'$', data.len().to_string().as_bytes());
        self.buf.reserve(data.len() + 2);
        self.buf.extend_from_slice(data);
        self.buf.extend_from_slice(b"\r\n");
    }
}
