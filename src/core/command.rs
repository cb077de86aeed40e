use std::collections::HashMap;

use bytes::Bytes;

use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// A command ready to be sent.
///
/// Arguments added with [`key`](Cmd::key) are remembered as keys so the
/// cluster dispatcher can hash them to a slot before anything is sent.
///
/// # Example
///
/// ```
/// use shardis::core::command::{hset, Cmd};
///
/// let cmd = Cmd::new("HSET").key("registry:svc").arg("10.0.0.1:20880").arg("1");
/// assert_eq!(cmd.keys().count(), 1);
/// let same = hset("registry:svc", "10.0.0.1:20880", "1");
/// assert_eq!(cmd.name(), same.name());
/// ```
#[derive(Debug, Clone)]
pub struct Cmd {
    args: Vec<Bytes>,
    key_indexes: Vec<usize>,
}

impl Cmd {
    /// Creates a new command with the given name (e.g., "GET", "HSET").
    #[inline]
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self {
            args: vec![name.into()],
            key_indexes: Vec::new(),
        }
    }

    /// Appends a plain argument.
    #[inline]
    pub fn arg<T: Into<Bytes>>(mut self, arg: T) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends an argument that is a key.
    #[inline]
    pub fn key<T: Into<Bytes>>(mut self, key: T) -> Self {
        self.key_indexes.push(self.args.len());
        self.args.push(key.into());
        self
    }

    /// Returns the command name.
    pub fn name(&self) -> &[u8] {
        &self.args[0]
    }

    /// Iterates over the key arguments.
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.key_indexes.iter().map(move |&i| self.args[i].as_ref())
    }

    /// Converts the command to a RESP array of bulk strings.
    #[inline]
    pub fn into_frame(self) -> Frame {
        Frame::Array(
            self.args
                .into_iter()
                .map(|b| Frame::BulkString(Some(b)))
                .collect(),
        )
    }
}

/// Creates a PING command.
#[inline]
pub fn ping() -> Cmd {
    Cmd::new("PING")
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

/// Creates a GET command.
#[inline]
pub fn get(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("GET").key(key)
}

/// Creates a SET command.
#[inline]
pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Cmd {
    Cmd::new("SET").key(key).arg(value)
}

/// Creates a DEL command over one or more keys.
pub fn del<K: Into<Bytes>>(keys: impl IntoIterator<Item = K>) -> Cmd {
    keys.into_iter().fold(Cmd::new("DEL"), |cmd, key| cmd.key(key))
}

/// Creates an HSET command for a single field.
#[inline]
pub fn hset(key: impl Into<Bytes>, field: impl Into<Bytes>, value: impl Into<Bytes>) -> Cmd {
    Cmd::new("HSET").key(key).arg(field).arg(value)
}

/// Creates an HGETALL command.
#[inline]
pub fn hgetall(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("HGETALL").key(key)
}

/// Creates an HDEL command.
pub fn hdel<F: Into<Bytes>>(key: impl Into<Bytes>, fields: impl IntoIterator<Item = F>) -> Cmd {
    fields
        .into_iter()
        .fold(Cmd::new("HDEL").key(key), |cmd, field| cmd.arg(field))
}

/// Creates a SCAN command with a MATCH pattern and COUNT hint.
///
/// SCAN is node-local, so the command carries no key.
#[inline]
pub fn scan(cursor: impl Into<Bytes>, pattern: impl Into<Bytes>, count: usize) -> Cmd {
    Cmd::new("SCAN")
        .arg(cursor)
        .arg("MATCH")
        .arg(pattern)
        .arg("COUNT")
        .arg(count.to_string())
}

/// Creates a PUBLISH command.
#[inline]
pub fn publish(channel: impl Into<Bytes>, message: impl Into<Bytes>) -> Cmd {
    Cmd::new("PUBLISH").arg(channel).arg(message)
}

/// Creates a PSUBSCRIBE command.
pub fn psubscribe<P: Into<Bytes>>(patterns: impl IntoIterator<Item = P>) -> Cmd {
    patterns
        .into_iter()
        .fold(Cmd::new("PSUBSCRIBE"), |cmd, p| cmd.arg(p))
}

/// Creates a PUNSUBSCRIBE command.
pub fn punsubscribe<P: Into<Bytes>>(patterns: impl IntoIterator<Item = P>) -> Cmd {
    patterns
        .into_iter()
        .fold(Cmd::new("PUNSUBSCRIBE"), |cmd, p| cmd.arg(p))
}

fn server_error(e: Vec<u8>) -> Error {
    Error::Server {
        message: String::from_utf8_lossy(&e).into_owned(),
    }
}

fn unexpected(what: &str) -> Error {
    Error::Protocol {
        message: format!("unexpected frame type for {}", what),
    }
}

/// Turns an error reply into [`Error::Server`] and passes anything else
/// through.
pub fn parse_frame_response(frame: Frame) -> Result<Frame> {
    match frame {
        Frame::Error(e) => Err(server_error(e)),
        _ => Ok(frame),
    }
}

/// Converts a bulk-string reply.
pub fn frame_to_bytes(frame: Frame) -> Result<Option<Bytes>> {
    match frame {
        Frame::BulkString(b) => Ok(b),
        Frame::Null => Ok(None),
        Frame::Error(e) => Err(server_error(e)),
        _ => Err(unexpected("bulk string")),
    }
}

/// Converts an integer reply.
pub fn frame_to_int(frame: Frame) -> Result<i64> {
    match frame {
        Frame::Integer(i) => Ok(i),
        Frame::Error(e) => Err(server_error(e)),
        _ => Err(unexpected("integer")),
    }
}

/// Converts a simple-string or bulk-string reply to UTF-8 text.
pub fn frame_to_string(frame: Frame) -> Result<String> {
    match frame {
        Frame::SimpleString(s) => String::from_utf8(s).map_err(|_| Error::Protocol {
            message: "invalid UTF-8 in simple string".to_string(),
        }),
        Frame::BulkString(Some(b)) => String::from_utf8(b.to_vec()).map_err(|_| Error::Protocol {
            message: "invalid UTF-8 in bulk string".to_string(),
        }),
        Frame::Error(e) => Err(server_error(e)),
        _ => Err(unexpected("string")),
    }
}

/// Converts an `HGETALL` reply (flat field/value array) to a map.
pub fn frame_to_hashmap(frame: Frame) -> Result<HashMap<String, Bytes>> {
    let items = match frame {
        Frame::Array(items) => items,
        Frame::Error(e) => return Err(server_error(e)),
        _ => return Err(unexpected("HGETALL")),
    };
    if items.len() % 2 != 0 {
        return Err(Error::Protocol {
            message: "HGETALL response must have even number of elements".to_string(),
        });
    }

    let mut result = HashMap::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
        let field = frame_to_string(field)?;
        let value = frame_to_bytes(value)?.unwrap_or_default();
        result.insert(field, value);
    }
    Ok(result)
}

/// Converts a `SCAN` reply into the next cursor and the page of keys.
///
/// The cursor is kept as the opaque text the server sent.
pub fn frame_to_scan_response(frame: Frame) -> Result<(String, Vec<String>)> {
    let mut parts = match frame {
        Frame::Array(parts) if parts.len() == 2 => parts,
        Frame::Error(e) => return Err(server_error(e)),
        _ => return Err(unexpected("SCAN")),
    };
    let keys = match parts.pop() {
        Some(Frame::Array(keys)) => keys
            .into_iter()
            .map(frame_to_string)
            .collect::<Result<Vec<_>>>()?,
        _ => return Err(unexpected("SCAN keys")),
    };
    let cursor = match parts.pop() {
        Some(frame) => frame_to_string(frame)?,
        None => return Err(unexpected("SCAN cursor")),
    };
    Ok((cursor, keys))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: Cmd) -> Vec<String> {
        match cmd.into_frame() {
            Frame::Array(items) => items
                .into_iter()
                .map(|f| f.as_str().unwrap().to_string())
                .collect(),
            _ => panic!("Expected Array frame"),
        }
    }

    #[test]
    fn test_keys_are_tracked() {
        let cmd = del(["a", "b"]);
        let keys: Vec<&[u8]> = cmd.keys().collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"b".as_slice()]);

        let cmd = hset("h", "f", "v");
        assert_eq!(cmd.keys().collect::<Vec<_>>(), vec![b"h".as_slice()]);

        assert_eq!(publish("ch", "m").keys().count(), 0);
        assert_eq!(scan("0", "*", 10).keys().count(), 0);
    }

    #[test]
    fn test_scan_args() {
        assert_eq!(
            args(scan("0", "user:*", 100)),
            vec!["SCAN", "0", "MATCH", "user:*", "COUNT", "100"]
        );
    }

    #[test]
    fn test_hdel_and_psubscribe_args() {
        assert_eq!(args(hdel("h", ["f1", "f2"])), vec!["HDEL", "h", "f1", "f2"]);
        assert_eq!(
            args(psubscribe(["a.*", "b.*"])),
            vec!["PSUBSCRIBE", "a.*", "b.*"]
        );
        assert_eq!(args(punsubscribe(["a.*"])), vec!["PUNSUBSCRIBE", "a.*"]);
    }

    #[test]
    fn test_frame_to_hashmap() {
        let frame = Frame::Array(vec![
            Frame::bulk("consumer://a"),
            Frame::bulk("1"),
            Frame::bulk("consumer://b"),
            Frame::BulkString(None),
        ]);
        let map = frame_to_hashmap(frame).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["consumer://a"], Bytes::from("1"));
        assert!(map["consumer://b"].is_empty());
    }

    #[test]
    fn test_frame_to_hashmap_odd_length() {
        let frame = Frame::Array(vec![Frame::bulk("only-field")]);
        assert!(matches!(frame_to_hashmap(frame), Err(Error::Protocol { .. })));
    }

    #[test]
    fn test_frame_to_scan_response() {
        let frame = Frame::Array(vec![
            Frame::bulk("42"),
            Frame::Array(vec![Frame::bulk("user:1"), Frame::bulk("user:9")]),
        ]);
        let (cursor, keys) = frame_to_scan_response(frame).unwrap();
        assert_eq!(cursor, "42");
        assert_eq!(keys, vec!["user:1", "user:9"]);
    }

    #[test]
    fn test_frame_to_scan_response_rejects_bad_shape() {
        assert!(frame_to_scan_response(Frame::Integer(0)).is_err());
        let err = frame_to_scan_response(Frame::error("ERR nope")).unwrap_err();
        assert!(matches!(err, Error::Server { .. }));
    }

    #[test]
    fn test_frame_to_int_server_error() {
        let err = frame_to_int(Frame::error("WRONGTYPE")).unwrap_err();
        assert_eq!(err.to_string(), "server error: WRONGTYPE");
    }
}
