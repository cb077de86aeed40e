use bytes::{Buf, Bytes, BytesMut};

use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024; // 512 MB default

/// A streaming RESP decoder.
///
/// Bytes are appended as they arrive with [`append`](Decoder::append);
/// [`decode`](Decoder::decode) returns `Ok(None)` until a whole frame is
/// buffered. Nothing is consumed from the buffer for an incomplete frame, so
/// a reply split across reads at any byte boundary decodes correctly.
///
/// # Example
///
/// ```
/// use shardis::proto::codec::Decoder;
/// use shardis::proto::frame::Frame;
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
}

impl Decoder {
    /// Creates a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates a new decoder with a custom maximum frame size.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Appends raw bytes received from the network.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns true if there are buffered bytes not yet decoded.
    pub fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Attempts to decode one frame from the buffer.
    ///
    /// Returns `Ok(Some(frame))` for a complete frame, `Ok(None)` if more data
    /// is needed, and [`Error::Protocol`] for malformed input.
    pub fn decode(&mut self) -> Result<Option<Frame>> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        match self.parse(0)? {
            Some((frame, consumed)) => {
                self.buf.advance(consumed);
                Ok(Some(frame))
            }
            None => {
                if self.buf.len() > self.max_frame_size {
                    return Err(protocol("buffer size exceeded maximum frame size"));
                }
                Ok(None)
            }
        }
    }

    /// Parses the frame starting at `pos`, returning it with the offset just
    /// past its end.
    fn parse(&self, pos: usize) -> Result<Option<(Frame, usize)>> {
        let Some(&kind) = self.buf.get(pos) else {
            return Ok(None);
        };
        let Some(line_end) = self.find_crlf(pos + 1) else {
            return Ok(None);
        };
        let line = &self.buf[pos + 1..line_end];
        let next = line_end + 2;

        match kind {
            b'+' => Ok(Some((Frame::SimpleString(line.to_vec()), next))),
            b'-' => Ok(Some((Frame::Error(line.to_vec()), next))),
            b':' => Ok(Some((Frame::Integer(parse_int(line)?), next))),
            b'$' => {
                let len = parse_int(line)?;
                if len < 0 {
                    return Ok(Some((Frame::BulkString(None), next)));
                }
                let len = len as usize;
                if len > self.max_frame_size {
                    return Err(protocol("bulk string length exceeds maximum frame size"));
                }
                if self.buf.len() < next + len + 2 {
                    return Ok(None);
                }
                if &self.buf[next + len..next + len + 2] != b"\r\n" {
                    return Err(protocol("bulk string is not terminated by CRLF"));
                }
                let data = Bytes::copy_from_slice(&self.buf[next..next + len]);
                Ok(Some((Frame::BulkString(Some(data)), next + len + 2)))
            }
            b'*' => {
                let len = parse_int(line)?;
                if len < 0 {
                    return Ok(Some((Frame::Null, next)));
                }
                let len = len as usize;
                // Every element needs at least three bytes ("+\r\n").
                if len > self.max_frame_size / 3 {
                    return Err(protocol("array length exceeds reasonable maximum"));
                }
                let mut items = Vec::with_capacity(len.min(1024));
                let mut cursor = next;
                for _ in 0..len {
                    match self.parse(cursor)? {
                        Some((item, after)) => {
                            items.push(item);
                            cursor = after;
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some((Frame::Array(items), cursor)))
            }
            other => Err(protocol(format!("unknown frame type: {:?}", other as char))),
        }
    }

    fn find_crlf(&self, from: usize) -> Option<usize> {
        self.buf
            .get(from..)?
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|i| from + i)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_int(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| protocol(format!("invalid integer: {:?}", String::from_utf8_lossy(line))))
}

fn protocol(message: impl Into<String>) -> Error {
    Error::Protocol {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_simple_string() {
        let mut decoder = Decoder::new();
        decoder.append(b"+OK\r\n");
        let frame = decoder.decode().unwrap().unwrap();
        assert_eq!(frame, Frame::SimpleString(b"OK".to_vec()));
        assert!(!decoder.has_pending());
    }

    #[test]
    fn test_decode_error() {
        let mut decoder = Decoder::new();
        decoder.append(b"-MOVED 3999 127.0.0.1:7000\r\n");
        let frame = decoder.decode().unwrap().unwrap();
        assert_eq!(frame, Frame::Error(b"MOVED 3999 127.0.0.1:7000".to_vec()));
    }

    #[test]
    fn test_decode_bulk_string_null() {
        let mut decoder = Decoder::new();
        decoder.append(b"$-1\r\n");
        assert_eq!(decoder.decode().unwrap().unwrap(), Frame::BulkString(None));
    }

    #[test]
    fn test_decode_scan_reply() {
        let mut decoder = Decoder::new();
        decoder.append(b"*2\r\n$2\r\n17\r\n*2\r\n$6\r\nuser:1\r\n$6\r\nuser:2\r\n");
        let frame = decoder.decode().unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Array(vec![
                Frame::bulk("17"),
                Frame::Array(vec![Frame::bulk("user:1"), Frame::bulk("user:2")]),
            ])
        );
    }

    #[test]
    fn test_decode_array_split_across_reads() {
        let wire = b"*3\r\n$8\r\npmessage\r\n$6\r\nuser:*\r\n:5\r\n";
        // Feed one byte at a time; nothing may be lost while incomplete.
        let mut decoder = Decoder::new();
        let mut decoded = None;
        for byte in wire.iter() {
            assert!(decoded.is_none());
            decoder.append(&[*byte]);
            decoded = decoder.decode().unwrap();
        }
        assert_eq!(
            decoded.unwrap(),
            Frame::Array(vec![
                Frame::bulk("pmessage"),
                Frame::bulk("user:*"),
                Frame::Integer(5),
            ])
        );
    }

    #[test]
    fn test_decode_two_frames_in_one_read() {
        let mut decoder = Decoder::new();
        decoder.append(b":1\r\n:2\r\n");
        assert_eq!(decoder.decode().unwrap(), Some(Frame::Integer(1)));
        assert_eq!(decoder.decode().unwrap(), Some(Frame::Integer(2)));
        assert_eq!(decoder.decode().unwrap(), None);
    }

    #[test]
    fn test_decode_null_array() {
        let mut decoder = Decoder::new();
        decoder.append(b"*-1\r\n");
        assert_eq!(decoder.decode().unwrap().unwrap(), Frame::Null);
    }

    #[test]
    fn test_decode_unknown_type() {
        let mut decoder = Decoder::new();
        decoder.append(b"?what\r\n");
        assert!(matches!(decoder.decode(), Err(Error::Protocol { .. })));
    }

    #[test]
    fn test_decode_invalid_integer() {
        let mut decoder = Decoder::new();
        decoder.append(b":abc\r\n");
        assert!(matches!(decoder.decode(), Err(Error::Protocol { .. })));
    }

    #[test]
    fn test_decoder_bulk_string_exceeds_max_size() {
        let mut decoder = Decoder::with_max_frame_size(10);
        decoder.append(b"$100\r\n");
        let err = decoder.decode().unwrap_err();
        assert!(err.to_string().contains("bulk string length exceeds maximum"));
    }

    #[test]
    fn test_decoder_buffer_exceeds_max_on_decode() {
        let mut decoder = Decoder::with_max_frame_size(10);
        decoder.append(b"+");
        decoder.append(&[b'x'; 20]);
        let err = decoder.decode().unwrap_err();
        assert!(err.to_string().contains("buffer size exceeded maximum"));
    }
}
