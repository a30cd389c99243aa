use tokio::sync::{broadcast, mpsc};

use crate::Error;

pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Consumer of decoded inbound text, called from the read loop in arrival order.
///
/// Implementations should return quickly; the next read is not issued until
/// `deliver` returns. Errors are logged and the chunk is dropped.
pub trait TextSink: Send + Sync + 'static {
    fn deliver(&self, text: &str) -> std::result::Result<(), SinkError>;
}

/// Logs every chunk.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TextSink for LogSink {
    fn deliver(&self, text: &str) -> std::result::Result<(), SinkError> {
        tracing::info!(text, "received");
        Ok(())
    }
}

impl TextSink for broadcast::Sender<String> {
    fn deliver(&self, text: &str) -> std::result::Result<(), SinkError> {
        // no subscribers is not a failure
        let _ = self.send(text.to_owned());
        Ok(())
    }
}

impl TextSink for mpsc::UnboundedSender<String> {
    fn deliver(&self, text: &str) -> std::result::Result<(), SinkError> {
        self.send(text.to_owned())?;
        Ok(())
    }
}

/// Streaming UTF-8 decoder.
///
/// A multi-byte sequence split across two chunks is carried over and decoded
/// with the next chunk. Invalid bytes are skipped and reported; the valid text
/// around them is still returned. A carried-over prefix that the next chunk
/// does not complete is reported on its own and never costs the new chunk its
/// text.
#[derive(Debug, Default)]
pub struct TextDecoder {
    pending: Vec<u8>,
}

/// Output of [`TextDecoder::decode`] for one chunk.
#[derive(Debug, Default)]
pub struct Decoded {
    pub text: String,
    /// One [`Error::ReadDecode`] per skipped invalid sequence.
    pub errors: Vec<Error>,
}

impl TextDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> Decoded {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut decoded = Decoded::default();
        let mut input = bytes.as_slice();
        loop {
            let err = match std::str::from_utf8(input) {
                Ok(text) => {
                    decoded.text.push_str(text);
                    break;
                }
                Err(err) => err,
            };

            let (valid, rest) = input.split_at(err.valid_up_to());
            decoded.text.push_str(&String::from_utf8_lossy(valid));

            match err.error_len() {
                None => {
                    self.pending = rest.to_vec();
                    break;
                }
                // an unfinished carry-over is at most its own length here,
                // so only the held-back bytes are skipped
                Some(len) => {
                    decoded.errors.push(Error::ReadDecode(err));
                    input = &rest[len..];
                }
            }
        }

        decoded
    }

    /// Bytes of an incomplete sequence waiting for the next chunk.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plain_ascii() {
        let mut decoder = TextDecoder::new();
        let decoded = decoder.decode(b"ok\n");
        assert_eq!(decoded.text, "ok\n");
        assert!(decoded.errors.is_empty());
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn carries_split_sequence_into_next_chunk() {
        let mut decoder = TextDecoder::new();
        let text = "D13 ✓";
        let bytes = text.as_bytes();
        let split = bytes.len() - 1;

        assert_eq!(decoder.decode(&bytes[..split]).text, "D13 ");
        assert_eq!(decoder.pending(), 2);
        assert_eq!(decoder.decode(&bytes[split..]).text, "✓");
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn stray_lead_byte_does_not_swallow_next_chunk() {
        let mut decoder = TextDecoder::new();
        let decoded = decoder.decode(&[0xE2]);
        assert_eq!(decoded.text, "");
        assert!(decoded.errors.is_empty());

        let decoded = decoder.decode(b"ok\n");
        assert_eq!(decoded.text, "ok\n");
        assert_eq!(decoded.errors.len(), 1);
        assert!(matches!(decoded.errors[0], Error::ReadDecode(_)));

        let decoded = decoder.decode(b"next\n");
        assert_eq!(decoded.text, "next\n");
        assert!(decoded.errors.is_empty());
    }

    #[test]
    fn keeps_valid_text_around_invalid_bytes() {
        let mut decoder = TextDecoder::new();

        let decoded = decoder.decode(b"A0=512\n\xFF");
        assert_eq!(decoded.text, "A0=512\n");
        assert_eq!(decoded.errors.len(), 1);

        let decoded = decoder.decode(b"\xFFA1=3\n\xFE\xFFA2=7\n");
        assert_eq!(decoded.text, "A1=3\nA2=7\n");
        assert_eq!(decoded.errors.len(), 3);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn broken_carry_over_is_dropped_with_invalid_chunk() {
        let mut decoder = TextDecoder::new();
        let _ = decoder.decode(&[0xE2, 0x9C]);

        let decoded = decoder.decode(&[0xFF, b'x']);
        assert_eq!(decoded.text, "x");
        assert_eq!(decoded.errors.len(), 2);
        assert_eq!(decoder.pending(), 0);

        assert_eq!(decoder.decode(b"A0=512\n").text, "A0=512\n");
    }

    #[test]
    fn log_sink_accepts_everything() {
        assert!(LogSink.deliver("D2=1\n").is_ok());
        assert!(LogSink.deliver("").is_ok());
    }

    #[test]
    fn unbounded_sender_reports_closed_consumer() {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        tx.deliver("a").unwrap();
        drop(rx);
        assert!(tx.deliver("b").is_err());
    }

    #[test]
    fn broadcast_without_subscribers_is_fine() {
        let (tx, _) = broadcast::channel::<String>(4);
        assert!(tx.deliver("a").is_ok());
    }
}
