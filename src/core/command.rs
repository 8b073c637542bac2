use crate::proto::frame::Frame;
use bytes::Bytes;

/// Names of commands that may block server-side until data shows up.
const BLOCKING_COMMANDS: &[&str] = &[
    "BLPOP",
    "BRPOP",
    "BRPOPLPUSH",
    "BLMOVE",
    "BLMPOP",
    "BZPOPMIN",
    "BZPOPMAX",
    "BZMPOP",
];

/// A command ready to be sent to the server.
///
/// Commands are built using the builder pattern and handed to a session,
/// after which they are never modified.
///
/// # Example
///
/// ```
/// use sentimux::Cmd;
///
/// let cmd = Cmd::new("SET").arg("key").arg("value");
/// assert_eq!(cmd.name(), "SET");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Cmd {
    args: Vec<Bytes>,
}

impl Cmd {
    /// Creates a new command with the given name.
    ///
    /// # Arguments
    ///
    /// * `name` - The command name (e.g., "GET", "SET", "DEL")
    #[inline]
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self {
            args: vec![name.into()],
        }
    }

    /// Builds a command from a full argument list, name first.
    ///
    /// Returns `None` if `args` is empty.
    pub fn from_args<I, T>(args: I) -> Option<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        let args: Vec<Bytes> = args.into_iter().map(Into::into).collect();
        if args.is_empty() {
            None
        } else {
            Some(Self { args })
        }
    }

    /// Appends an argument to the command.
    #[inline]
    pub fn arg<T: Into<Bytes>>(mut self, arg: T) -> Self {
        self.args.push(arg.into());
        self
    }

    /// All arguments, command name included.
    #[inline]
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// The command name, uppercased.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).to_ascii_uppercase()
    }

    /// Returns true if the server may hold the reply back until a condition
    /// is met, which ties up the connection for the duration.
    ///
    /// Covers the blocking list and sorted-set pops plus `XREAD`/`XREADGROUP`
    /// carrying a `BLOCK` option.
    pub fn is_blocking(&self) -> bool {
        let name = self.name();
        if BLOCKING_COMMANDS.contains(&name.as_str()) {
            return true;
        }
        if name == "XREAD" || name == "XREADGROUP" {
            return self.args[1..]
                .iter()
                .any(|a| a.eq_ignore_ascii_case(b"BLOCK"));
        }
        false
    }

    /// Converts the command to a RESP Array frame.
    #[inline]
    pub fn into_frame(self) -> Frame {
        Frame::Array(self.args.into_iter().map(Frame::bulk).collect())
    }
}

/// Creates a PING command.
#[inline]
pub fn ping() -> Cmd {
    Cmd::new("PING")
}

/// Creates a GET command.
#[inline]
pub fn get(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("GET").arg(key)
}

/// Creates a SET command.
#[inline]
pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Cmd {
    Cmd::new("SET").arg(key).arg(value)
}

/// Creates a DEL command.
#[inline]
pub fn del(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("DEL").arg(key)
}

/// Creates an RPUSH command.
pub fn rpush<V: Into<Bytes>>(key: impl Into<Bytes>, values: impl IntoIterator<Item = V>) -> Cmd {
    values
        .into_iter()
        .fold(Cmd::new("RPUSH").arg(key), |cmd, v| cmd.arg(v))
}

/// Creates a BLPOP command. `timeout_secs` of 0 blocks indefinitely.
pub fn blpop(key: impl Into<Bytes>, timeout_secs: u64) -> Cmd {
    Cmd::new("BLPOP").arg(key).arg(timeout_secs.to_string())
}

/// Creates a PUBLISH command.
#[inline]
pub fn publish(channel: impl Into<Bytes>, message: impl Into<Bytes>) -> Cmd {
    Cmd::new("PUBLISH").arg(channel).arg(message)
}

/// Creates an AUTH command with password only.
#[inline]
pub fn auth(password: impl Into<Bytes>) -> Cmd {
    Cmd::new("AUTH").arg(password)
}

/// Creates an AUTH command with username and password (ACL style).
#[inline]
pub fn auth_with_username(username: impl Into<Bytes>, password: impl Into<Bytes>) -> Cmd {
    Cmd::new("AUTH").arg(username).arg(password)
}

/// Creates a SELECT command.
#[inline]
pub fn select(db: u8) -> Cmd {
    Cmd::new("SELECT").arg(db.to_string())
}

/// Creates a CLIENT SETNAME command.
#[inline]
pub fn client_setname(name: impl Into<Bytes>) -> Cmd {
    Cmd::new("CLIENT").arg("SETNAME").arg(name)
}

/// Creates a ROLE command.
#[inline]
pub fn role() -> Cmd {
    Cmd::new("ROLE")
}

/// Creates the sentinel query for the address of a master.
#[inline]
pub fn sentinel_get_master_addr(master_name: impl Into<Bytes>) -> Cmd {
    Cmd::new("SENTINEL")
        .arg("get-master-addr-by-name")
        .arg(master_name)
}

/// Parses a frame as a server response, turning error replies into
/// [`crate::Error::Server`].
#[inline]
pub fn parse_frame_response(frame: Frame) -> Result<Frame, crate::Error> {
    match frame {
        Frame::Error(e) => Err(crate::Error::Server {
            message: String::from_utf8_lossy(&e).into_owned(),
        }),
        _ => Ok(frame),
    }
}

/// Converts a frame to bytes.
#[inline]
pub fn frame_to_bytes(frame: Frame) -> Result<Option<Bytes>, crate::Error> {
    match parse_frame_response(frame)? {
        Frame::BulkString(b) => Ok(b),
        Frame::SimpleString(s) => Ok(Some(Bytes::from(s))),
        Frame::Null => Ok(None),
        _ => Err(crate::Error::protocol("unexpected frame type")),
    }
}

/// Converts a frame to an integer.
#[inline]
pub fn frame_to_int(frame: Frame) -> Result<i64, crate::Error> {
    match parse_frame_response(frame)? {
        Frame::Integer(i) => Ok(i),
        _ => Err(crate::Error::protocol("expected integer reply")),
    }
}

/// Converts an array frame of bulk strings to a vector of values.
///
/// A null array (or null bulk string) becomes `None`.
pub fn frame_to_vec_bytes(frame: Frame) -> Result<Option<Vec<Bytes>>, crate::Error> {
    match parse_frame_response(frame)? {
        Frame::Null | Frame::BulkString(None) => Ok(None),
        Frame::Array(items) => items
            .into_iter()
            .map(|item| {
                frame_to_bytes(item)?
                    .ok_or_else(|| crate::Error::protocol("unexpected null in array"))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        _ => Err(crate::Error::protocol("expected array reply")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_into_frame() {
        let cmd = set("foo", "bar");
        assert_eq!(
            cmd.into_frame(),
            Frame::Array(vec![
                Frame::bulk("SET"),
                Frame::bulk("foo"),
                Frame::bulk("bar"),
            ])
        );
    }

    #[test]
    fn test_from_args() {
        let cmd = Cmd::from_args(["get", "foo"]).unwrap();
        assert_eq!(cmd.name(), "GET");
        assert_eq!(cmd.args().len(), 2);
        assert!(Cmd::from_args(Vec::<Bytes>::new()).is_none());
    }

    #[test]
    fn test_is_blocking() {
        assert!(blpop("q", 0).is_blocking());
        assert!(Cmd::new("brpop").arg("q").arg("1").is_blocking());
        assert!(Cmd::new("XREAD")
            .arg("block")
            .arg("0")
            .arg("STREAMS")
            .arg("s")
            .arg("$")
            .is_blocking());
        assert!(!Cmd::new("XREAD").arg("STREAMS").arg("s").arg("0").is_blocking());
        assert!(!get("foo").is_blocking());
        assert!(!rpush("q", ["a"]).is_blocking());
    }

    #[test]
    fn test_rpush_cmd() {
        let cmd = rpush("test", ["a", "b"]);
        assert_eq!(
            cmd.args(),
            &[
                Bytes::from("RPUSH"),
                Bytes::from("test"),
                Bytes::from("a"),
                Bytes::from("b")
            ]
        );
    }

    #[test]
    fn test_sentinel_query_cmd() {
        let cmd = sentinel_get_master_addr("mymaster");
        assert_eq!(
            cmd.into_frame(),
            Frame::Array(vec![
                Frame::bulk("SENTINEL"),
                Frame::bulk("get-master-addr-by-name"),
                Frame::bulk("mymaster"),
            ])
        );
    }

    #[test]
    fn test_frame_to_bytes() {
        assert_eq!(
            frame_to_bytes(Frame::bulk("bar")).unwrap(),
            Some(Bytes::from("bar"))
        );
        assert_eq!(frame_to_bytes(Frame::BulkString(None)).unwrap(), None);
        assert!(matches!(
            frame_to_bytes(Frame::Error(b"ERR x".to_vec())),
            Err(crate::Error::Server { .. })
        ));
    }

    #[test]
    fn test_frame_to_int() {
        assert_eq!(frame_to_int(Frame::Integer(3)).unwrap(), 3);
        assert!(frame_to_int(Frame::bulk("3")).is_err());
    }

    #[test]
    fn test_frame_to_vec_bytes() {
        let frame = Frame::Array(vec![Frame::bulk("test"), Frame::bulk("dummy")]);
        assert_eq!(
            frame_to_vec_bytes(frame).unwrap(),
            Some(vec![Bytes::from("test"), Bytes::from("dummy")])
        );
        assert_eq!(frame_to_vec_bytes(Frame::Null).unwrap(), None);
    }
}
