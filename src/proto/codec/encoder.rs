use bytes::{BufMut, BytesMut};

use crate::proto::frame::Frame;

/// A RESP encoder that accumulates frames into an internal buffer.
///
/// # Example
///
/// ```
/// use shardis::proto::codec::Encoder;
/// use shardis::proto::frame::Frame;
///
/// let mut encoder = Encoder::new();
/// encoder.encode(&Frame::SimpleString(b"OK".to_vec()));
/// assert_eq!(&encoder.take()[..], b"+OK\r\n");
/// ```
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    /// Creates a new encoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the wire form of `frame` to the buffer.
    pub fn encode(&mut self, frame: &Frame) {
        encode_frame(frame, &mut self.buf);
    }

    /// Takes the encoded bytes, leaving the encoder empty and reusable.
    pub fn take(&mut self) -> BytesMut {
        self.buf.split()
    }
}

/// Writes the wire form of `frame` into `dst`.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) {
    match frame {
        Frame::SimpleString(s) => put_line(dst, b'+', s),
        Frame::Error(e) => put_line(dst, b'-', e),
        Frame::Integer(n) => put_line(dst, b':', n.to_string().as_bytes()),
        Frame::BulkString(Some(data)) => {
            put_line(dst, b'$', data.len().to_string().as_bytes());
            dst.put_slice(data);
            dst.put_slice(b"\r\n");
        }
        Frame::BulkString(None) => dst.put_slice(b"$-1\r\n"),
        Frame::Array(items) => {
            put_line(dst, b'*', items.len().to_string().as_bytes());
            for item in items {
                encode_frame(item, dst);
            }
        }
        Frame::Null => dst.put_slice(b"*-1\r\n"),
    }
}

fn put_line(dst: &mut BytesMut, prefix: u8, body: &[u8]) {
    dst.reserve(body.len() + 3);
    dst.put_u8(prefix);
    dst.put_slice(body);
    dst.put_slice(b"\r\n");
}
