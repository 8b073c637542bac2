use bytes::Bytes;

/// A RESP (Redis Serialization Protocol) frame.
///
/// This enum represents every reply shape a RESP2 server can produce:
/// - SimpleString: Status responses like "OK"
/// - Error: Error responses from the server
/// - Integer: Numeric responses
/// - BulkString: Binary-safe string data, `None` for the null bulk string
/// - Array: Command arguments and multi-bulk responses, nested to any depth
/// - Null: the null array (`*-1`)
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Simple string (+OK).
    SimpleString(Vec<u8>),
    /// Error (-ERR).
    Error(Vec<u8>),
    /// Integer (:1000).
    Integer(i64),
    /// Bulk string ($6\r\nfoobar).
    BulkString(Option<Bytes>),
    /// Array (*2\r\n...).
    Array(Vec<Frame>),
    /// Null array (*-1).
    Null,
}

impl Frame {
    /// Creates a bulk string frame from anything convertible to [`Bytes`].
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::BulkString(Some(data.into()))
    }

    /// Returns the textual payload of a simple string or bulk string.
    ///
    /// # Returns
    ///
    /// Some(&[u8]) for non-null string frames, None otherwise
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::SimpleString(s) => Some(s),
            Frame::BulkString(Some(b)) => Some(b),
            _ => None,
        }
    }

    /// Attempts to extract a bulk string from this frame.
    pub fn to_bulk_string(&self) -> Option<Bytes> {
        match self {
            Frame::BulkString(b) => b.clone(),
            _ => None,
        }
    }

    /// Attempts to extract an integer from this frame.
    pub fn to_int(&self) -> Option<i64> {
        match self {
            Frame::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns true if this frame is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    /// Returns true if this frame is a null bulk string or a null array.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null | Frame::BulkString(None))
    }
}
