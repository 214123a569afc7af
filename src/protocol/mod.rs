pub mod messages;

pub use messages::Message;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Framing codec for termite envelopes: a 4-byte length prefix around a
/// JSON-encoded [`Message`].
pub struct TermiteCodec {
    inner: LengthDelimitedCodec,
}

impl TermiteCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(16 * 1024 * 1024) // 16MB max
                .new_codec(),
        }
    }
}

impl Default for TermiteCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TermiteCodec {
    type Item = Message;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        let msg = serde_json::from_slice(&frame)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Some(msg))
    }
}

impl<'a> Encoder<&'a Message> for TermiteCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: &'a Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(item)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.inner.encode(Bytes::from(body), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_carry_tagged_envelopes() {
        let mut codec = TermiteCodec::new();
        let mut buf = BytesMut::new();

        let msg = Message::Stdio {
            key: "k1".to_string(),
            data: b"hello".to_vec(),
        };
        codec.encode(&msg, &mut buf).unwrap();

        // tag precedes the payload inside the frame
        let tag_pos = buf[4..].windows(4).position(|w| w == b"type").unwrap();
        let key_pos = buf[4..].windows(3).position(|w| w == b"key").unwrap();
        assert!(tag_pos < key_pos);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn partial_frame_yields_none() {
        let mut codec = TermiteCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(&Message::DuplicatedClient {}, &mut buf)
            .unwrap();
        let cut = buf.split_to(buf.len() - 1);
        let mut partial = cut;
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn garbage_frame_is_a_decode_error() {
        let mut codec = TermiteCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 4]);
        buf.extend_from_slice(b"nope");
        assert!(codec.decode(&mut buf).is_err());
    }
}
