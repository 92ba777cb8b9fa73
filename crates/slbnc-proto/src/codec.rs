//! Tokio codec for framed IRC messages.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::message::Message;
use crate::{MAX_MESSAGE_LEN, MAX_TAGS_LEN};

/// Line-delimited IRC message codec.
///
/// Decoding tolerates bare `\n`; encoding always terminates with `\r\n`.
/// Lines above the limit fail instead of being silently truncated.
pub struct IrcCodec {
    next_index: usize,
    max_len: usize,
}

impl Default for IrcCodec {
    fn default() -> Self {
        IrcCodec::new()
    }
}

impl IrcCodec {
    /// Codec for untagged connections (512 byte lines).
    pub fn new() -> Self {
        IrcCodec {
            next_index: 0,
            max_len: MAX_MESSAGE_LEN,
        }
    }

    /// Codec sized for connections with `message-tags` negotiated.
    pub fn with_tags() -> Self {
        IrcCodec {
            next_index: 0,
            max_len: MAX_MESSAGE_LEN + MAX_TAGS_LEN,
        }
    }

    /// Raise the line limit in place (after `message-tags` is enabled).
    pub fn allow_tags(&mut self) {
        self.max_len = MAX_MESSAGE_LEN + MAX_TAGS_LEN;
    }
}

impl Decoder for IrcCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') else {
            self.next_index = src.len();
            if src.len() > self.max_len {
                return Err(ProtocolError::MessageTooLong {
                    actual: src.len(),
                    limit: self.max_len,
                });
            }
            return Ok(None);
        };

        let line = src.split_to(self.next_index + offset + 1);
        self.next_index = 0;

        if line.len() > self.max_len {
            return Err(ProtocolError::MessageTooLong {
                actual: line.len(),
                limit: self.max_len,
            });
        }

        let text = std::str::from_utf8(&line).map_err(|e| ProtocolError::InvalidUtf8 {
            byte_pos: e.valid_up_to(),
        })?;
        text.parse().map(Some)
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let line = msg.to_string();
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_complete_line() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::from("PING :irc.example.org\r\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, "PING");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_partial_then_complete() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::from("PING :ir");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"c\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.params, ["irc"]);
    }

    #[test]
    fn decode_rejects_oversized() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&vec![b'a'; MAX_MESSAGE_LEN + 1]);
        buf.extend_from_slice(b"\n");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MessageTooLong { .. })
        ));
    }

    #[test]
    fn encode_appends_crlf() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Message::new("PONG", vec!["x y".into()]), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"PONG :x y\r\n");
    }

    #[test]
    fn tagged_lines_fit_with_tags_codec() {
        let mut codec = IrcCodec::with_tags();
        let mut buf = BytesMut::new();
        let big = "a".repeat(MAX_MESSAGE_LEN + 100);
        buf.extend_from_slice(format!("@x={} PING :t\r\n", big).as_bytes());
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }
}
