use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Outbound, TERMINATOR};
use crate::error::FrameError;

/// Newline-delimited framing.
///
/// Decoding yields raw lines without the terminator; whether a line is a
/// tagged frame or a worker answer is decided by the connection, not here.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_len: usize,
    /// Bytes already scanned for a terminator.
    scanned: usize,
}

impl FrameCodec {
    pub fn new(max_len: usize) -> Self {
        Self { max_len, scanned: 0 }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        let found = src
            .get(self.scanned..)
            .unwrap_or_default()
            .iter()
            .position(|b| *b == TERMINATOR);

        match found {
            Some(offset) => {
                let end = self.scanned + offset;
                self.scanned = 0;
                if end > self.max_len {
                    return Err(FrameError::TooLong {
                        limit: self.max_len,
                    });
                }
                let mut line = src.split_to(end + 1);
                line.truncate(end);
                Ok(Some(line.freeze()))
            }
            None if src.len() > self.max_len => {
                self.scanned = 0;
                Err(FrameError::TooLong {
                    limit: self.max_len,
                })
            }
            None => {
                self.scanned = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None if src.is_empty() => Ok(None),
            None => {
                self.scanned = 0;
                Err(FrameError::Truncated)
            }
        }
    }
}

impl Encoder<Outbound> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), FrameError> {
        item.write_to(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, Tag};

    #[test]
    fn decodes_complete_lines_only() {
        let mut codec = FrameCodec::new(64);
        let mut buf = BytesMut::from(&b"R\nC4"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Bytes::from_static(b"R"));
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"2\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Bytes::from_static(b"C42"));
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_oversized_lines() {
        let mut codec = FrameCodec::new(4);
        let mut buf = BytesMut::from(&b"Mtoolong"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::TooLong { limit: 4 })
        ));
    }

    #[test]
    fn eof_mid_frame_is_truncation() {
        let mut codec = FrameCodec::new(64);
        let mut partial = BytesMut::from(&b"I{\"login\""[..]);
        assert!(matches!(
            codec.decode_eof(&mut partial),
            Err(FrameError::Truncated)
        ));

        let mut empty = BytesMut::new();
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }

    #[test]
    fn codec_is_reusable_after_truncation() {
        let mut codec = FrameCodec::new(64);
        let mut partial = BytesMut::from(&b"abc"[..]);
        assert!(matches!(
            codec.decode_eof(&mut partial),
            Err(FrameError::Truncated)
        ));

        let mut next = BytesMut::from(&b"x\n"[..]);
        assert_eq!(codec.decode(&mut next).unwrap().unwrap(), Bytes::from_static(b"x"));
    }

    #[test]
    fn encodes_tag_payload_terminator() {
        let mut codec = FrameCodec::default();
        let mut dst = BytesMut::new();

        codec
            .encode(Frame::new(Tag::Calc, Bytes::from_static(b"21")).into(), &mut dst)
            .unwrap();
        codec
            .encode(Outbound::Raw(Bytes::from_static(b"42")), &mut dst)
            .unwrap();

        assert_eq!(&dst[..], b"C21\n42\n");
    }

    #[test]
    fn refuses_embedded_terminator() {
        let mut codec = FrameCodec::default();
        let mut dst = BytesMut::new();
        let err = codec
            .encode(Outbound::Raw(Bytes::from_static(b"4\n2")), &mut dst)
            .unwrap_err();

        assert!(matches!(err, FrameError::EmbeddedTerminator));
        assert!(dst.is_empty());
    }
}
