//! Tokio codec that reassembles text lines from raw byte chunks

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::error::ProtocolError;

/// Longest line emitted in one piece; longer lines are split
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Line decoder for control-channel output
///
/// Unlike `tokio_util::codec::LinesCodec` this never fails on content:
/// invalid UTF-8 is replaced, over-long lines are emitted in pieces, and a
/// trailing fragment without a newline is emitted at end of stream.
#[derive(Debug)]
pub struct LineCodec {
    /// Bytes of the current line already scanned for a newline
    next_index: usize,
    max_length: usize,
}

impl LineCodec {
    /// Create a codec with the default maximum line length
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    /// Create a codec with a custom maximum line length
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            next_index: 0,
            max_length: max_length.max(1),
        }
    }

    fn take_line(&mut self, src: &mut BytesMut, len: usize, skip: usize) -> String {
        let raw = src.split_to(len);
        let _ = src.split_to(skip);
        self.next_index = 0;
        let mut line = String::from_utf8_lossy(&raw).into_owned();
        if line.ends_with('\r') {
            line.pop();
        }
        line
    }
}

/// Largest cut at or below `max` that does not split a UTF-8 sequence
///
/// Falls back to `max` when no boundary is found within a character's length.
fn char_boundary(bytes: &[u8], max: usize) -> usize {
    let mut cut = max;
    while cut > 0 && max - cut < 3 && matches!(bytes.get(cut), Some(b) if b & 0xC0 == 0x80) {
        cut -= 1;
    }
    if cut == 0 || matches!(bytes.get(cut), Some(b) if b & 0xC0 == 0x80) {
        max
    } else {
        cut
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let scan_end = src.len().min(self.max_length + 1);
        let newline = src[self.next_index.min(scan_end)..scan_end]
            .iter()
            .position(|b| *b == b'\n')
            .map(|offset| self.next_index + offset);

        match newline {
            Some(pos) => Ok(Some(self.take_line(src, pos, 1))),
            None if src.len() > self.max_length => {
                tracing::debug!(max = self.max_length, "splitting over-long line");
                let cut = char_boundary(src, self.max_length);
                Ok(Some(self.take_line(src, cut, 0)))
            }
            None => {
                // Need more data
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None if src.is_empty() => Ok(None),
            None => {
                let len = src.len();
                Ok(Some(self.take_line(src, len, 0)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    #[test]
    fn test_codec_partial_read() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"Selected ports: 1:2:3"[..]);

        // Should return None (need more data)
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b":4:5:6:7:8:9:10\r\nnext");
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(line, "Selected ports: 1:2:3:4:5:6:7:8:9:10");

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(codec.decode_eof(&mut buf).unwrap().unwrap(), "next");
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_invalid_utf8_is_replaced() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"bad \xff byte\n"[..]);
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(line, "bad \u{fffd} byte");
    }

    #[test]
    fn test_codec_splits_long_lines() {
        let mut codec = LineCodec::with_max_length(4);
        let mut buf = BytesMut::from(&b"abcdefg\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "abcd");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "efg");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_split_keeps_characters_whole() {
        let mut codec = LineCodec::with_max_length(4);
        let mut buf = BytesMut::from("abcé\nab€x\n".as_bytes());
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "abc");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "é");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "ab");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "€x");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_codec_reassembles_chunked_stream() {
        let (client, mut server) = tokio::io::duplex(8);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for chunk in [&b"Browse to "[..], b"URL: http://a/\nBrow", b"se to URL: http://b/\n"] {
                server.write_all(chunk).await.unwrap();
            }
        });

        let lines: Vec<String> = FramedRead::new(client, LineCodec::new())
            .map(|l| l.unwrap())
            .collect()
            .await;
        writer.await.unwrap();
        assert_eq!(lines, vec!["Browse to URL: http://a/", "Browse to URL: http://b/"]);
    }
}
