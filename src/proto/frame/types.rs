use bytes::Bytes;

/// A RESP2 frame.
///
/// Commands travel as arrays of bulk strings; replies may be any variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Simple string (+OK).
    SimpleString(Vec<u8>),
    /// Error (-ERR).
    Error(Vec<u8>),
    /// Integer (:1000).
    Integer(i64),
    /// Bulk string ($6\r\nfoobar). `None` is the null bulk string.
    BulkString(Option<Bytes>),
    /// Array (*2\r\n...).
    Array(Vec<Frame>),
    /// Null array (*-1).
    Null,
}

impl Frame {
    /// Builds a non-null bulk string frame.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::BulkString(Some(data.into()))
    }

    /// Builds a simple string frame such as `+OK`.
    pub fn simple(text: &str) -> Self {
        Frame::SimpleString(text.as_bytes().to_vec())
    }

    /// Builds an error frame.
    pub fn error(text: impl AsRef<str>) -> Self {
        Frame::Error(text.as_ref().as_bytes().to_vec())
    }

    /// Returns the payload of a bulk or simple string, if this is one.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::BulkString(Some(b)) => Some(b),
            Frame::SimpleString(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the payload as UTF-8 text, if this is a string frame holding
    /// valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Returns true if this frame is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_as_str() {
        assert_eq!(Frame::simple("OK").as_str(), Some("OK"));
        assert_eq!(Frame::bulk("hello").as_str(), Some("hello"));
        assert_eq!(Frame::Integer(42).as_str(), None);
        assert_eq!(Frame::BulkString(None).as_str(), None);
    }

    #[test]
    fn test_frame_as_str_rejects_invalid_utf8() {
        let frame = Frame::bulk(vec![0xff, 0xfe]);
        assert_eq!(frame.as_bytes(), Some(&[0xff, 0xfe][..]));
        assert_eq!(frame.as_str(), None);
    }

    #[test]
    fn test_frame_is_error() {
        assert!(Frame::error("ERR boom").is_error());
        assert!(!Frame::Null.is_error());
    }
}
